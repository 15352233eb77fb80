//! The transaction contract storage drivers must implement.
//!
//! This crate never talks to a concrete database; it only demands this interface,
//! keeping the query shapes behind a handful of named operations. A driver (e.g.
//! `taskforge-memory`) implements `Transaction` and `StorageReader`; everything in
//! `election.rs`/`apply.rs` is generic over them.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;
use crate::job::Job;
use crate::state::State;

/// Write-only operations a storage transaction must support. All operations are
/// safe to issue in any order before `commit`; `commit` is the only linearization
/// point, and a transaction that is dropped without being committed must apply none
/// of its operations.
#[async_trait]
pub trait Transaction: Send {
    /// Atomic state record replacement with history append.
    async fn set_job_state(&mut self, job_id: &str, state: &State) -> Result<(), StorageError>;

    async fn set_job_parameter(
        &mut self,
        job_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), StorageError>;

    /// Idempotent: adding a value already present in the set is a no-op.
    async fn add_to_set(&mut self, set_name: &str, value: &str) -> Result<(), StorageError>;

    /// Idempotent: removing a value not present in the set is a no-op.
    async fn remove_from_set(&mut self, set_name: &str, value: &str) -> Result<(), StorageError>;

    async fn add_to_list(&mut self, list_name: &str, value: Value) -> Result<(), StorageError>;

    /// Keep only the elements in `[keep_start, keep_end]` (inclusive), oldest first.
    async fn trim_list(
        &mut self,
        list_name: &str,
        keep_start: i64,
        keep_end: i64,
    ) -> Result<(), StorageError>;

    /// Commit all buffered operations atomically. All operations above become
    /// visible together or not at all.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Read-side operations used by the election pipeline to look up current job state
/// and fetch fresh (non-buffered) parameter values.
#[async_trait]
pub trait StorageReader: Send + Sync {
    async fn get_job(&self, job_id: &str) -> Result<Job, StorageError>;

    async fn get_current_state(&self, job_id: &str) -> Result<String, StorageError>;

    async fn get_job_parameter(
        &self,
        job_id: &str,
        name: &str,
    ) -> Result<Option<Value>, StorageError>;

    /// Begin a new transaction against this storage backend.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError>;

    async fn set_contains(&self, set_name: &str, value: &str) -> Result<bool, StorageError>;
}
