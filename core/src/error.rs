use thiserror::Error;

/// Enumeration of errors that can surface from the election/application pipeline.
///
/// Storage drivers wrap their own transport errors (SQL errors, connection errors, ...)
/// in `CoreError::Storage` before returning them up through this crate.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A filter was configured with an invalid value at setter time.
    #[error("invalid filter configuration: {0}")]
    Configuration(String),

    /// An election or application filter raised while running.
    #[error("filter {filter} failed during {phase}: {source}")]
    Filter {
        filter: &'static str,
        phase: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The storage driver failed to commit a transaction.
    #[error("storage transaction failed: {0}")]
    Storage(#[from] StorageError),

    /// A stored job parameter could not be deserialized as the requested type.
    #[error("failed to deserialize job parameter {name}: {source}")]
    Serialization {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Storage reported a permanent inconsistency (missing job, unknown state name, ...).
    #[error("fatal storage inconsistency: {0}")]
    Fatal(String),

    /// Cancellation was observed between election and commit; nothing was written.
    #[error("transition for job {0} was cancelled before commit")]
    Cancelled(String),
}

/// Errors a storage driver can report back to the core. Kept separate from `CoreError`
/// so that driver crates (e.g. `taskforge-memory`) don't need to depend on this crate's
/// full error surface, only this narrower contract.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("job {0} does not exist")]
    JobNotFound(String),

    #[error("{0} is not a valid state name")]
    UnknownStateName(String),

    #[error("transaction commit failed: {0}")]
    CommitFailed(String),

    #[error("concurrent modification detected for job {0}")]
    Conflict(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
