use std::io;

use thiserror::Error;

use crate::schema::TypeSchemaDiff;

#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Schema outdated for {} type(s); preview and apply a migration first", .diffs.len())]
    SchemaOutdated { diffs: Vec<TypeSchemaDiff> },

    #[error("Migration token is stale: {0}")]
    MigrationToken(String),

    #[error("Missing upgraders for {} type(s)", .missing.len())]
    MissingUpgrader {
        missing: std::collections::BTreeMap<String, Vec<i64>>,
    },

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Upgrader failed for {type_name} '{identity}' at {stage}: {detail} (input: {input})")]
    UpgraderFailed {
        type_name: String,
        identity: String,
        stage: String,
        input: String,
        detail: String,
    },

    #[error("Could not acquire write lock within {timeout_ms}ms timeout")]
    LockContention { timeout_ms: u64 },

    #[error("Write lease expired before commit finalization")]
    LeaseExpired,

    #[error("Head mismatch after {retries} retries; aborting commit")]
    HeadMismatch { retries: u32 },

    #[error("Batch of {count} intents exceeds max_batch_size of {limit}")]
    BatchSizeExceeded { count: usize, limit: usize },

    #[error("Event chain depth {depth} exceeds max_event_chain_depth of {limit}")]
    EventLoopLimit { depth: u32, limit: u32 },

    #[error("Metadata is only available on query-hydrated instances")]
    MetadataUnavailable,

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Storage backend error during {operation}: {detail}")]
    Storage { operation: String, detail: String },

    #[error("Invalid execution context: {0}")]
    InvalidExecutionContext(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;

impl TrellisError {
    /// Build a `Storage` error for a named backend operation.
    pub fn storage(operation: impl Into<String>, detail: impl ToString) -> Self {
        TrellisError::Storage {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// Wrap this error with additional context, prepended to the message.
    pub fn context(self, msg: impl Into<String>) -> Self {
        TrellisError::Other(anyhow::anyhow!("{}: {}", msg.into(), self))
    }
}

/// Extension trait to add `.context()` on `Result<T>`.
pub trait ResultExt<T> {
    /// If the result is `Err`, wrap the error with additional context.
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(msg))
    }
}
