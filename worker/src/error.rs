use taskforge_core::error::CoreError;
use thiserror::Error;

/// Enumeration of errors that can arise while a worker leases, runs, and
/// reports the outcome of a job.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a state transition failed")]
    Transition(#[from] CoreError),
    #[error("no handler is registered for method {0:?}")]
    UnknownMethod(String),
}
