//! Crate-wide error taxonomy, one enum per failure domain (§7 of the design doc).
//!
//! Every fallible public operation returns the `Result` of the error type for
//! its own domain; no two domains share a variant and nothing in this crate
//! panics in response to client-inflicted input.

use thiserror::Error;

/// Malformed or unexpected input on the IPC command channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("wrong field count for {command}: expected {expected}, got {got}")]
    WrongFieldCount {
        command: String,
        expected: usize,
        got: usize,
    },
    #[error("malformed field: {0}")]
    MalformedField(String),
    #[error("record exceeds maximum length of {max} bytes")]
    RecordTooLong { max: usize },
}

/// A bounded arena or table ran out of room.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResourceExhaustedError {
    #[error("port pool arena exhausted")]
    PortArenaExhausted,
    #[error("process registry is full")]
    ProcessArenaExhausted,
    #[error("pointer repository is full")]
    PointerRepositoryExhausted,
    #[error("memory block list is full")]
    MemoryBlockListExhausted,
}

/// Failures from the memory-provider lifecycle and bump allocator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory creation failed")]
    CreateFailed,
    #[error("alignment exceeds the system page size")]
    AlignmentExceedsPageSize,
    #[error("allocation failed")]
    AllocationFailed,
    #[error("mapping failed")]
    MappingFailed,
    #[error("destroy failed")]
    DestroyFailed,
    #[error("requested a zero-sized allocation")]
    RequestedZeroSizedMemory,
    #[error("out of memory")]
    OutOfMemory,
}

/// Problems found while validating a `Config`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid domain id")]
    InvalidDomainId,
    #[error("config declares no segments")]
    NoSegments,
    #[error("segment {0} declares no mempools")]
    NoMempoolInSegment(usize),
    #[error("mempool chunk size must be non-zero")]
    ChunkSizeZero,
    #[error("mempool chunk count must be non-zero")]
    InvalidChunkCount,
    #[error("config version {found} is unsupported, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("too many segments: {0} exceeds the cap of {1}")]
    TooManySegments(usize, usize),
    #[error("too many mempools in one segment: {0} exceeds the cap of {1}")]
    TooManyMempools(usize, usize),
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("{0}")]
    Io(String),
}

/// An operation was attempted from a state that forbids it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("memory was already created")]
    MemoryAlreadyCreated,
    #[error("no memory provider is present")]
    NoMemoryProviderPresent,
    #[error("memory is not available yet")]
    MemoryNotAvailable,
    #[error("no memory blocks were added before create()")]
    NoMemoryBlocksPresent,
    #[error("daemon id was already set")]
    DaemonIdAlreadySet,
    #[error("name is already registered")]
    NameAlreadyRegistered,
    #[error("name is not registered")]
    NameNotRegistered,
    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhaustedError),
}

/// Client/daemon version or compatibility-level mismatch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompatibilityError {
    #[error("client version {client} is incompatible with daemon version {daemon} at level {level:?}")]
    VersionMismatch {
        client: String,
        daemon: String,
        level: crate::cli::CompatibilityLevel,
    },
}

/// Failures tied to the host environment rather than to protocol state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("another daemon already holds the domain lock")]
    FileLockHeld,
    #[error("permission denied creating shared memory object {0}")]
    ShmPermissionDenied(String),
    #[error("a daemon is already running for this domain")]
    AlreadyRunning,
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for EnvironmentError {
    fn from(e: std::io::Error) -> Self {
        EnvironmentError::Io(e.to_string())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}
