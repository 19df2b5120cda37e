//! The IPC Command Channel: message framing/parsing (§4.11) plus the
//! Unix-domain-socket server that speaks it.

pub mod protocol;
pub mod server;

pub use protocol::{Command, Reply};
pub use server::IpcServer;
