//! Error types for shardkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Encoding Errors ===
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    // === Consensus Errors ===
    #[error("Not leader")]
    NotLeader,

    #[error("Replica {0} is not attached to the log")]
    Detached(usize),

    // === Network Errors ===
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    // === Config Errors ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Server shut down")]
    Shutdown,
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader
                | Error::Detached(_)
                | Error::ConnectionFailed(_)
                | Error::UnknownServer(_)
        )
    }
}
