use std::time::Duration;

use thiserror::Error;

/// Error kinds surfaced by the refresh pipeline.
///
/// Per-event (`DecodeFailed`) and per-pool (`StateReadFailed`) errors are
/// recorded and skipped by their callers; the remaining kinds abort a
/// protocol ingest, a batch, or the whole cycle as described in the
/// orchestrator.
#[derive(Debug, Error)]
pub enum WhitelistError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("extractor failed: {0}")]
    ExtractorFailed(String),

    #[error("rpc unavailable: {0}")]
    RpcUnavailable(String),

    #[error("event decode failed: {0}")]
    DecodeFailed(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("state read failed for {pool}: {reason}")]
    StateReadFailed { pool: String, reason: String },

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("snapshot conflict: {0}")]
    SnapshotConflict(String),

    #[error("checkpoint regression: {chain}/{protocol} cannot move from {current} back to {requested}")]
    CheckpointRegression {
        chain: String,
        protocol: String,
        current: u64,
        requested: u64,
    },

    #[error("cycle deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

impl From<sqlx::Error> for WhitelistError {
    fn from(e: sqlx::Error) -> Self {
        WhitelistError::StorageUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WhitelistError>;
