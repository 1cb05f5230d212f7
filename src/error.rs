use thiserror::Error;

/// The client sent something we can't act on, or nothing at all.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Peer closed the connection before sending a command")]
    Disconnected,
    #[error("Timed out waiting for a command byte")]
    Timeout,
    #[error("Unknown command flag 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("Command flag 0x{0:02x} is reserved but not implemented")]
    NotImplemented(u8),
    #[error("Device config rejected with status {0}")]
    ConfigRejected(u8),
}

#[derive(Debug, Error, PartialEq)]
pub enum SerializationError {
    #[error("Record {index} has a non-finite {field}")]
    NonFinite { index: usize, field: &'static str },
    #[error("Record count {0} can't be carried exactly by a 64-bit double")]
    TooManyRecords(usize),
    #[error("Payload is {0} bytes, too short for a record count")]
    Truncated(usize),
    #[error("Record count {count} doesn't match a {len} byte payload")]
    Malformed { count: f64, len: usize },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to query records: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("Storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Everything that can end a single export exchange early.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Connection I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
