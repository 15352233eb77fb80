//! `taskforge-memory`: an in-process reference implementation of
//! `taskforge_core::transaction`'s `StorageReader`/`Transaction` contract.
//!
//! A single struct guarding shared state behind a lock, with `enqueue`/`dequeue`
//! as the producer/consumer surface, backed by in-process maps under one `Mutex`
//! instead of a real database. It exists so the election/application pipeline and
//! the automatic-retry policy are testable and runnable end to end without an
//! external database.
//!
//! Concurrent transitions on the same job are serialized optimistically: each
//! `set_job_state` call snapshots the job's state name at the moment it's
//! queued, and `commit` rejects with `StorageError::Conflict` if that snapshot
//! is stale by the time the transaction actually applies its writes.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use taskforge_core::error::StorageError;
use taskforge_core::job::{Invocation, Job};
use taskforge_core::state::{State, StateName};
use taskforge_core::transaction::{StorageReader, Transaction};

#[derive(Debug, Clone)]
struct JobRecord {
    job: Job,
    state: State,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, Vec<Value>>,
}

/// A handle to the in-process store. Cheap to clone; every clone shares the
/// same underlying data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    /// Create a new job in `Enqueued`, returning the snapshot stored for it.
    pub fn enqueue(&self, job_id: impl Into<String>, invocation: Invocation) -> Job {
        let job = Job::new(job_id, invocation);
        let mut inner = self.lock();
        inner.jobs.insert(
            job.id.clone(),
            JobRecord {
                job: job.clone(),
                state: State::Enqueued { reason: None },
            },
        );
        job
    }

    /// Create a new job already in `Scheduled`, for deferred execution.
    pub fn enqueue_scheduled(
        &self,
        job_id: impl Into<String>,
        invocation: Invocation,
        enqueue_at: chrono::DateTime<Utc>,
    ) -> Job {
        let mut job = Job::new(job_id, invocation);
        job.current_state = StateName::Scheduled;
        let mut inner = self.lock();
        inner.jobs.insert(
            job.id.clone(),
            JobRecord {
                job: job.clone(),
                state: State::Scheduled {
                    enqueue_at,
                    reason: None,
                },
            },
        );
        job
    }

    /// Return the next job that's ready to run: `Enqueued`, or `Scheduled` with
    /// `enqueue_at <= now`. Does not mutate anything — leasing a job into
    /// `Processing` is the caller's job, via `taskforge_core::transition`.
    ///
    /// This is a minimal polling primitive, not a real dequeue-with-lock: two
    /// callers racing this method can observe the same job. That's fine for a
    /// reference/demo driver since the subsequent `Processing` transition's
    /// optimistic-concurrency check ensures only one of them actually wins the
    /// lease; the loser simply sees its commit rejected and polls again.
    pub fn dequeue(&self) -> Option<Job> {
        let inner = self.lock();
        let now = Utc::now();
        let mut candidates: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|record| match &record.state {
                State::Enqueued { .. } => true,
                State::Scheduled { enqueue_at, .. } => *enqueue_at <= now,
                _ => false,
            })
            .collect();
        candidates.sort_by_key(|record| record.job.created_at);
        candidates.first().map(|record| record.job.clone())
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }
}

enum PendingOp {
    SetState {
        job_id: String,
        expected_state_name: StateName,
        new_state: State,
    },
    SetParameter {
        job_id: String,
        name: String,
        value: Value,
    },
    AddToSet {
        set_name: String,
        value: String,
    },
    RemoveFromSet {
        set_name: String,
        value: String,
    },
    AddToList {
        list_name: String,
        value: Value,
    },
    TrimList {
        list_name: String,
        keep_start: i64,
        keep_end: i64,
    },
}

/// Buffers writes until `commit()` applies them all under a single lock
/// acquisition, so they become visible together or not at all.
pub struct MemoryTransaction {
    store: MemoryStore,
    ops: Vec<PendingOp>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn set_job_state(&mut self, job_id: &str, state: &State) -> Result<(), StorageError> {
        let expected_state_name = {
            let inner = self.store.lock();
            inner
                .jobs
                .get(job_id)
                .map(|record| record.state.name())
                .ok_or_else(|| StorageError::JobNotFound(job_id.to_owned()))?
        };
        self.ops.push(PendingOp::SetState {
            job_id: job_id.to_owned(),
            expected_state_name,
            new_state: state.clone(),
        });
        Ok(())
    }

    async fn set_job_parameter(
        &mut self,
        job_id: &str,
        name: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        self.ops.push(PendingOp::SetParameter {
            job_id: job_id.to_owned(),
            name: name.to_owned(),
            value,
        });
        Ok(())
    }

    async fn add_to_set(&mut self, set_name: &str, value: &str) -> Result<(), StorageError> {
        self.ops.push(PendingOp::AddToSet {
            set_name: set_name.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    async fn remove_from_set(&mut self, set_name: &str, value: &str) -> Result<(), StorageError> {
        self.ops.push(PendingOp::RemoveFromSet {
            set_name: set_name.to_owned(),
            value: value.to_owned(),
        });
        Ok(())
    }

    async fn add_to_list(&mut self, list_name: &str, value: Value) -> Result<(), StorageError> {
        self.ops.push(PendingOp::AddToList {
            list_name: list_name.to_owned(),
            value,
        });
        Ok(())
    }

    async fn trim_list(
        &mut self,
        list_name: &str,
        keep_start: i64,
        keep_end: i64,
    ) -> Result<(), StorageError> {
        self.ops.push(PendingOp::TrimList {
            list_name: list_name.to_owned(),
            keep_start,
            keep_end,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut inner = self.store.lock();

        // Validate every state-write's snapshot before mutating anything, so a
        // conflict leaves the store untouched rather than partially applied.
        for op in &self.ops {
            if let PendingOp::SetState {
                job_id,
                expected_state_name,
                ..
            } = op
            {
                let current = inner
                    .jobs
                    .get(job_id)
                    .map(|record| record.state.name())
                    .ok_or_else(|| StorageError::JobNotFound(job_id.clone()))?;
                if current != *expected_state_name {
                    return Err(StorageError::Conflict(job_id.clone()));
                }
            }
        }

        for op in self.ops {
            match op {
                PendingOp::SetState {
                    job_id, new_state, ..
                } => {
                    if let Some(record) = inner.jobs.get_mut(&job_id) {
                        record.job.current_state = new_state.name();
                        record.state = new_state;
                    }
                }
                PendingOp::SetParameter {
                    job_id,
                    name,
                    value,
                } => {
                    if let Some(record) = inner.jobs.get_mut(&job_id) {
                        record.job.parameters.insert(name, value);
                    }
                }
                PendingOp::AddToSet { set_name, value } => {
                    inner.sets.entry(set_name).or_default().insert(value);
                }
                PendingOp::RemoveFromSet { set_name, value } => {
                    if let Some(set) = inner.sets.get_mut(&set_name) {
                        set.remove(&value);
                    }
                }
                PendingOp::AddToList { list_name, value } => {
                    inner.lists.entry(list_name).or_default().push(value);
                }
                PendingOp::TrimList {
                    list_name,
                    keep_start,
                    keep_end,
                } => {
                    if let Some(list) = inner.lists.get_mut(&list_name) {
                        let len = list.len() as i64;
                        let start = keep_start.clamp(0, len) as usize;
                        let end = (keep_end + 1).clamp(0, len) as usize;
                        *list = if start < end {
                            list[start..end].to_vec()
                        } else {
                            Vec::new()
                        };
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl StorageReader for MemoryStore {
    async fn get_job(&self, job_id: &str) -> Result<Job, StorageError> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|record| record.job.clone())
            .ok_or_else(|| StorageError::JobNotFound(job_id.to_owned()))
    }

    async fn get_current_state(&self, job_id: &str) -> Result<String, StorageError> {
        self.lock()
            .jobs
            .get(job_id)
            .map(|record| record.state.name().as_str().to_owned())
            .ok_or_else(|| StorageError::JobNotFound(job_id.to_owned()))
    }

    async fn get_job_parameter(
        &self,
        job_id: &str,
        name: &str,
    ) -> Result<Option<Value>, StorageError> {
        let inner = self.lock();
        let record = inner
            .jobs
            .get(job_id)
            .ok_or_else(|| StorageError::JobNotFound(job_id.to_owned()))?;
        Ok(record.job.parameters.raw(name).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            ops: Vec::new(),
        }))
    }

    async fn set_contains(&self, set_name: &str, value: &str) -> Result<bool, StorageError> {
        Ok(self
            .lock()
            .sets
            .get(set_name)
            .is_some_and(|set| set.contains(value)))
    }
}
