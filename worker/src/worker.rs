use std::collections::HashMap;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use taskforge_core::error::CoreError;
use taskforge_core::exception::ExceptionInfo;
use taskforge_core::filter::FilterRegistry;
use taskforge_core::health::HealthHandle;
use taskforge_core::job::Job;
use taskforge_core::state::State;
use taskforge_core::transaction::StorageReader;
use taskforge_core::transition;
use taskforge_memory::MemoryStore;
use tokio::sync;
use tracing::{error, info};

use crate::error::WorkerError;

/// Runs the method named by a `Job`'s `Invocation` and reports a result back
/// as a candidate state. A handler never writes to storage directly — it only
/// proposes `Succeeded` or `Failed`; the election/application pipeline (and
/// any registered retry filter) decides what actually gets persisted.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn call(&self, job: &Job) -> Result<serde_json::Value, ExceptionInfo>;
}

/// Looks up a `JobHandler` by the `method` named in a job's `Invocation`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    fn get(&self, method: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(method).cloned()
    }
}

/// Polls `MemoryStore` and spawns tasks to run jobs as they become ready.
pub struct Worker {
    name: String,
    store: MemoryStore,
    registry: Arc<FilterRegistry>,
    handlers: Arc<HandlerRegistry>,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    liveness: HealthHandle,
}

impl Worker {
    pub fn new(
        name: &str,
        store: MemoryStore,
        registry: Arc<FilterRegistry>,
        handlers: Arc<HandlerRegistry>,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            store,
            registry,
            handlers,
            poll_interval,
            max_concurrent_jobs,
            liveness,
        }
    }

    /// Wait until a job becomes ready to run.
    async fn wait_for_job(&self) -> Job {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            if let Some(job) = self.store.dequeue() {
                return job;
            }
        }
    }

    /// Run this worker, continuously leasing and processing jobs as they
    /// become ready. Runs until the process is stopped.
    pub async fn run(&self) {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));

        loop {
            metrics::gauge!("taskforge_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );

            let job = self.wait_for_job().await;
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");

            let store = self.store.clone();
            let registry = self.registry.clone();
            let handlers = self.handlers.clone();
            let worker_name = self.name.clone();

            metrics::counter!("taskforge_jobs_total").increment(1);

            tokio::spawn(async move {
                let job_id = job.id.clone();
                let result = process_job(&worker_name, job, &store, &registry, &handlers).await;
                drop(permit);
                if let Err(error) = result {
                    error!("failed to process job {}: {}", job_id, error);
                }
            });
        }
    }
}

/// Lease a job into `Processing`, run its handler, and report `Succeeded` or
/// `Failed` back through the pipeline. A registered `AutomaticRetryFilter`
/// decides whether a failure gets scheduled for retry, deleted, or left
/// failed — this function never makes that decision itself.
async fn process_job(
    worker_name: &str,
    job: Job,
    store: &MemoryStore,
    registry: &FilterRegistry,
    handlers: &HandlerRegistry,
) -> Result<(), WorkerError> {
    let started_at = chrono::Utc::now();

    let processing = State::Processing {
        server_id: worker_name.to_owned(),
        worker_id: worker_name.to_owned(),
        started_at,
        reason: None,
    };
    transition(&job, processing, store, registry, &[], &[], None).await?;
    let job = store
        .get_job(&job.id)
        .await
        .map_err(CoreError::Storage)?;

    let handler = match handlers.get(&job.invocation.method) {
        Some(handler) => handler,
        None => {
            let failed = State::Failed {
                exception: ExceptionInfo::new(
                    "UnknownMethodError",
                    "no handler registered for this job's method",
                ),
                occurred_at: chrono::Utc::now(),
                reason: None,
            };
            transition(&job, failed, store, registry, &[], &[], None).await?;
            return Err(WorkerError::UnknownMethod(job.invocation.method));
        }
    };

    let outcome = handler.call(&job).await;
    let total_duration_ms = (chrono::Utc::now() - started_at).num_milliseconds();

    let proposed = match outcome {
        Ok(result) => {
            metrics::counter!("taskforge_jobs_succeeded").increment(1);
            State::Succeeded {
                result: Some(result),
                total_duration_ms,
                latency_ms: total_duration_ms,
                reason: None,
            }
        }
        Err(exception) => {
            metrics::counter!("taskforge_jobs_failed").increment(1);
            State::Failed {
                exception,
                occurred_at: chrono::Utc::now(),
                reason: None,
            }
        }
    };

    let job_id = job.id.clone();
    let elected = transition(&job, proposed, store, registry, &[], &[], None).await?;
    info!("job {} finished in state {}", job_id, elected.name());
    Ok(())
}
