//! Tracks registered client processes by name: pid, session id, uid,
//! monitoring flag, user-data segment assignment, and last heartbeat.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use crate::error::StateError;

pub struct ProcessEntry {
    pub name: String,
    pub pid: u32,
    pub uid: u32,
    pub session_id: u64,
    pub monitored: bool,
    pub segment_id: u64,
    pub last_heartbeat: Instant,
}

pub const MAX_PROCESSES: usize = 4096;

pub struct ProcessRegistry {
    entries: RwLock<HashMap<String, ProcessEntry>>,
    next_session_id: AtomicU64,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        ProcessRegistry {
            entries: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// On success returns the freshly assigned session id. `segment_id` is
    /// the user-data segment the caller has already chosen for this
    /// process.
    pub fn register(
        &self,
        name: &str,
        pid: u32,
        uid: u32,
        monitored: bool,
        segment_id: u64,
    ) -> Result<u64, StateError> {
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(name) {
            return Err(StateError::NameAlreadyRegistered);
        }
        if entries.len() >= MAX_PROCESSES {
            return Err(crate::error::ResourceExhaustedError::ProcessArenaExhausted.into());
        }
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            name.to_string(),
            ProcessEntry {
                name: name.to_string(),
                pid,
                uid,
                session_id,
                monitored,
                segment_id,
                last_heartbeat: Instant::now(),
            },
        );
        Ok(session_id)
    }

    pub fn deregister(&self, name: &str) -> Result<(), StateError> {
        let mut entries = self.entries.write().unwrap();
        entries.remove(name).map(|_| ()).ok_or(StateError::NameNotRegistered)
    }

    pub fn heartbeat(&self, name: &str) -> Result<(), StateError> {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(name) {
            Some(entry) => {
                entry.last_heartbeat = Instant::now();
                Ok(())
            }
            None => Err(StateError::NameNotRegistered),
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.read().unwrap().contains_key(name)
    }

    pub fn segment_id_of(&self, name: &str) -> Option<u64> {
        self.entries.read().unwrap().get(name).map(|e| e.segment_id)
    }

    /// Names of every monitored process whose last heartbeat is older than
    /// `threshold`.
    pub fn reap_stale(&self, threshold: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.monitored && now.duration_since(e.last_heartbeat) > threshold)
            .map(|e| e.name.clone())
            .collect()
    }

    /// Pids of every currently registered process, for the shutdown
    /// signal-escalation sequence (§5 Cancellation).
    pub fn registered_pids(&self) -> Vec<u32> {
        self.entries.read().unwrap().values().map(|e| e.pid).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn register_rejects_duplicate_names() {
        let reg = ProcessRegistry::new();
        reg.register("appA", 1, 1000, true, 0).unwrap();
        assert_eq!(
            reg.register("appA", 2, 1000, true, 0),
            Err(StateError::NameAlreadyRegistered)
        );
    }

    #[test]
    fn deregister_then_register_succeeds() {
        let reg = ProcessRegistry::new();
        reg.register("appA", 1, 1000, true, 0).unwrap();
        reg.deregister("appA").unwrap();
        assert!(reg.register("appA", 2, 1000, true, 0).is_ok());
    }

    #[test]
    fn session_ids_are_unique() {
        let reg = ProcessRegistry::new();
        let s1 = reg.register("appA", 1, 1000, true, 0).unwrap();
        let s2 = reg.register("appB", 2, 1000, true, 0).unwrap();
        assert_ne!(s1, s2);
    }

    #[test]
    fn reap_stale_only_returns_monitored_processes_past_threshold() {
        let reg = ProcessRegistry::new();
        reg.register("monitored", 1, 1000, true, 0).unwrap();
        reg.register("unmonitored", 2, 1000, false, 0).unwrap();
        let stale = reg.reap_stale(Duration::from_secs(0));
        assert_eq!(stale, vec!["monitored".to_string()]);
    }

    #[test]
    fn heartbeat_on_unknown_name_errors() {
        let reg = ProcessRegistry::new();
        assert_eq!(reg.heartbeat("ghost"), Err(StateError::NameNotRegistered));
    }

    #[test]
    fn registered_pids_reflects_current_membership() {
        let reg = ProcessRegistry::new();
        reg.register("appA", 111, 1000, true, 0).unwrap();
        reg.register("appB", 222, 1000, true, 0).unwrap();
        let mut pids = reg.registered_pids();
        pids.sort_unstable();
        assert_eq!(pids, vec![111, 222]);
        reg.deregister("appA").unwrap();
        assert_eq!(reg.registered_pids(), vec![222]);
    }

    #[test]
    fn register_past_capacity_is_resource_exhausted() {
        let reg = ProcessRegistry::new();
        for i in 0..MAX_PROCESSES {
            reg.register(&format!("app{i}"), i as u32, 1000, false, 0).unwrap();
        }
        assert_eq!(
            reg.register("one_too_many", 999_999, 1000, false, 0),
            Err(StateError::ResourceExhausted(
                crate::error::ResourceExhaustedError::ProcessArenaExhausted
            ))
        );
    }
}
