use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Page full: {0}")]
    PageFull(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid frame magic byte: {0:#x}")]
    InvalidMagic(u8),

    #[error("Invalid frame version: {0:#x}")]
    InvalidVersion(u8),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Not leader, hint: {0:?}")]
    NotLeader(Option<String>),

    #[error("Stale term: local {local_term} < remote {remote_term}")]
    TermStale { local_term: u64, remote_term: u64 },

    #[error("Log mismatch: conflict_index={conflict_index} conflict_term={conflict_term}")]
    LogMismatch {
        conflict_index: u64,
        conflict_term: u64,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
