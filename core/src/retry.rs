//! The automatic-retry policy: a built-in filter that converts
//! `Failed` into `Scheduled` (retry) or `Deleted` (give up), with exponential
//! backoff and exception-type allow/deny lists.
//!
//! Registered like any other filter (`order = 20`), it just happens to
//! implement both `ElectStateFilter` and `ApplyStateFilter` on the same type.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::context::{ApplyStateContext, ElectStateContext};
use crate::error::{CoreError, CoreResult};
use crate::filter::{ApplyStateFilter, ElectStateFilter, FilterError};
use crate::state::{State, StateName};
use crate::transaction::Transaction;

/// What to do once a job has exhausted its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnAttemptsExceeded {
    /// Leave the job Failed and log an error.
    Fail,
    /// Rewrite the candidate to Deleted.
    Delete,
}

/// A fallback delay function, used when `delays_in_seconds` is unset.
pub type DelayFn = Arc<dyn Fn(u32) -> i64 + Send + Sync>;

/// The default backoff: `round((n-1)^4 + 15 + rand[0,30) * n)` seconds, drawing
/// jitter from a fresh `rand::thread_rng()` per call.
fn default_delay_seconds(attempt: u32) -> i64 {
    let n = f64::from(attempt);
    let jitter = rand::thread_rng().gen_range(0.0..30.0) * n;
    ((n - 1.0).powi(4) + 15.0 + jitter).round() as i64
}

struct Config {
    attempts: u32,
    delays_in_seconds: Option<Vec<u64>>,
    delay_fn: DelayFn,
    on_attempts_exceeded: OnAttemptsExceeded,
    log_events: bool,
    only_on: Vec<String>,
    except_on: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            attempts: 10,
            delays_in_seconds: None,
            delay_fn: Arc::new(default_delay_seconds),
            on_attempts_exceeded: OnAttemptsExceeded::Fail,
            log_events: true,
            only_on: Vec::new(),
            except_on: Vec::new(),
        }
    }
}

impl Config {
    fn delay_seconds(&self, attempt: u32) -> i64 {
        match &self.delays_in_seconds {
            Some(delays) if !delays.is_empty() => {
                let index = (attempt as usize).saturating_sub(1).min(delays.len() - 1);
                delays[index] as i64
            }
            _ => (self.delay_fn)(attempt),
        }
    }
}

/// The built-in retry filter. All configuration reads/writes are serialized by an
/// internal mutex so runtime reconfiguration is safe across worker threads.
pub struct AutomaticRetryFilter {
    config: Mutex<Config>,
}

impl Default for AutomaticRetryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl AutomaticRetryFilter {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(Config::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        self.config.lock().expect("retry filter config mutex poisoned")
    }

    /// Maximum retry count. `0` disables retries. Callable on a shared, already
    /// `Arc`-wrapped and registered filter instance.
    pub fn set_attempts(&self, attempts: u32) -> &Self {
        self.lock().attempts = attempts;
        self
    }

    /// An explicit delay schedule. The delay for attempt `n` is
    /// `delays[min(n-1, len-1)]`. An empty vector is treated as unset rather than
    /// an error. A negative entry is a `ConfigurationError`, since the field is
    /// otherwise unsigned.
    pub fn set_delays_in_seconds(&self, delays: Vec<i64>) -> CoreResult<&Self> {
        if delays.iter().any(|d| *d < 0) {
            return Err(CoreError::Configuration(
                "delays_in_seconds must not contain negative values".to_owned(),
            ));
        }
        let delays = if delays.is_empty() {
            None
        } else {
            Some(delays.into_iter().map(|d| d as u64).collect())
        };
        self.lock().delays_in_seconds = delays;
        Ok(self)
    }

    pub fn set_delay_fn(&self, delay_fn: DelayFn) -> &Self {
        self.lock().delay_fn = delay_fn;
        self
    }

    pub fn set_on_attempts_exceeded(&self, policy: OnAttemptsExceeded) -> &Self {
        self.lock().on_attempts_exceeded = policy;
        self
    }

    pub fn set_log_events(&self, log_events: bool) -> &Self {
        self.lock().log_events = log_events;
        self
    }

    /// Exception-type allow list, matched by exact type-name string. Empty ⇒ all.
    pub fn set_only_on(&self, types: Vec<String>) -> &Self {
        self.lock().only_on = types;
        self
    }

    /// Exception-type deny list, matched by exact type-name string. Empty ⇒ none.
    pub fn set_except_on(&self, types: Vec<String>) -> &Self {
        self.lock().except_on = types;
        self
    }
}

#[async_trait]
impl ElectStateFilter for AutomaticRetryFilter {
    fn order(&self) -> i32 {
        20
    }

    fn name(&self) -> &'static str {
        "automatic_retry"
    }

    async fn on_state_election(&self, ctx: &mut ElectStateContext<'_>) -> Result<(), FilterError> {
        let exception = match &ctx.candidate_state {
            State::Failed { exception, .. } => exception.clone(),
            _ => return Ok(()),
        };

        let (attempts, on_attempts_exceeded, log_events) = {
            let config = self.lock();

            if !config.only_on.is_empty() && !config.only_on.contains(&exception.type_name) {
                return Ok(());
            }
            if config.except_on.contains(&exception.type_name) {
                return Ok(());
            }

            (config.attempts, config.on_attempts_exceeded, config.log_events)
        };

        let retry_count: u32 = ctx.get_job_parameter("RetryCount", true).await?;
        let attempt = retry_count + 1;

        if attempt <= attempts {
            ctx.set_job_parameter("RetryCount", serde_json::json!(attempt));
            let delay = self.lock().delay_seconds(attempt);
            let reason = format!(
                "Retry attempt {} of {}: {}",
                attempt,
                attempts,
                exception.truncated_message()
            );

            if log_events {
                warn!(
                    job_id = %ctx.job.id,
                    attempt,
                    attempts,
                    delay,
                    exception = %exception.truncated_message(),
                    "job failed, scheduling retry"
                );
            }

            ctx.candidate_state = if delay > 0 {
                State::Scheduled {
                    enqueue_at: Utc::now() + chrono::Duration::seconds(delay),
                    reason: Some(reason),
                }
            } else {
                State::Enqueued {
                    reason: Some(reason),
                }
            };
        } else if on_attempts_exceeded == OnAttemptsExceeded::Delete {
            // This branch is reached only as the "otherwise" of the `<=` branch
            // above, not a tighter guard of its own.
            let reason = if attempts == 0 {
                "Retries were disabled for this job."
            } else {
                "Exceeded the maximum number of retry attempts."
            };

            if log_events {
                warn!(job_id = %ctx.job.id, attempts, "job exceeded retry attempts, deleting");
            }

            ctx.candidate_state = State::Deleted {
                exception: Some(exception),
                reason: Some(reason.to_owned()),
            };
        } else if log_events {
            error!(
                job_id = %ctx.job.id,
                attempts,
                exception = %exception.message,
                "job exceeded retry attempts and will remain failed"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl ApplyStateFilter for AutomaticRetryFilter {
    fn order(&self) -> i32 {
        20
    }

    fn name(&self) -> &'static str {
        "automatic_retry"
    }

    async fn on_state_applied(
        &self,
        ctx: &ApplyStateContext<'_>,
        tx: &mut dyn Transaction,
    ) -> Result<(), FilterError> {
        if ctx.state.name() == StateName::Scheduled {
            if let Some(reason) = ctx.state.reason() {
                if reason.to_ascii_lowercase().starts_with("retry attempt") {
                    tx.add_to_set("retries", &ctx.job.id).await?;
                }
            }
        }
        Ok(())
    }

    async fn on_state_unapplied(
        &self,
        ctx: &ApplyStateContext<'_>,
        tx: &mut dyn Transaction,
    ) -> Result<(), FilterError> {
        // Triggered by either Scheduled or Failed old state; the Failed case is
        // defensive cleanup for jobs that were never actually added to the set.
        // `remove_from_set` is idempotent, so this asymmetry is safe.
        if matches!(ctx.old_state_name, StateName::Scheduled | StateName::Failed) {
            tx.remove_from_set("retries", &ctx.job.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::ExceptionInfo;
    use crate::job::{Invocation, Job};
    use crate::transaction::StorageReader;
    use serde_json::Value;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeStorage {
        parameters: StdMutex<HashMap<String, Value>>,
        sets: StdMutex<HashMap<String, HashSet<String>>>,
    }

    struct FakeTransaction<'a> {
        storage: &'a FakeStorage,
    }

    #[async_trait]
    impl<'a> Transaction for FakeTransaction<'a> {
        async fn set_job_state(
            &mut self,
            _job_id: &str,
            _state: &State,
        ) -> Result<(), crate::error::StorageError> {
            Ok(())
        }
        async fn set_job_parameter(
            &mut self,
            _job_id: &str,
            name: &str,
            value: Value,
        ) -> Result<(), crate::error::StorageError> {
            self.storage
                .parameters
                .lock()
                .unwrap()
                .insert(name.to_owned(), value);
            Ok(())
        }
        async fn add_to_set(
            &mut self,
            set_name: &str,
            value: &str,
        ) -> Result<(), crate::error::StorageError> {
            self.storage
                .sets
                .lock()
                .unwrap()
                .entry(set_name.to_owned())
                .or_default()
                .insert(value.to_owned());
            Ok(())
        }
        async fn remove_from_set(
            &mut self,
            set_name: &str,
            value: &str,
        ) -> Result<(), crate::error::StorageError> {
            if let Some(set) = self.storage.sets.lock().unwrap().get_mut(set_name) {
                set.remove(value);
            }
            Ok(())
        }
        async fn add_to_list(
            &mut self,
            _list_name: &str,
            _value: Value,
        ) -> Result<(), crate::error::StorageError> {
            Ok(())
        }
        async fn trim_list(
            &mut self,
            _list_name: &str,
            _keep_start: i64,
            _keep_end: i64,
        ) -> Result<(), crate::error::StorageError> {
            Ok(())
        }
        async fn commit(self: Box<Self>) -> Result<(), crate::error::StorageError> {
            Ok(())
        }
    }

    #[async_trait]
    impl StorageReader for FakeStorage {
        async fn get_job(&self, _job_id: &str) -> Result<Job, crate::error::StorageError> {
            unimplemented!()
        }
        async fn get_current_state(
            &self,
            _job_id: &str,
        ) -> Result<String, crate::error::StorageError> {
            unimplemented!()
        }
        async fn get_job_parameter(
            &self,
            _job_id: &str,
            name: &str,
        ) -> Result<Option<Value>, crate::error::StorageError> {
            Ok(self.parameters.lock().unwrap().get(name).cloned())
        }
        async fn begin(&self) -> Result<Box<dyn Transaction>, crate::error::StorageError> {
            Ok(Box::new(FakeTransaction { storage: self }))
        }
        async fn set_contains(
            &self,
            set_name: &str,
            value: &str,
        ) -> Result<bool, crate::error::StorageError> {
            Ok(self
                .sets
                .lock()
                .unwrap()
                .get(set_name)
                .is_some_and(|s| s.contains(value)))
        }
    }

    fn job() -> Job {
        Job::new(
            "job-1",
            Invocation {
                method: "noop".into(),
                arguments: vec![],
            },
        )
    }

    fn failed(message: &str) -> State {
        State::Failed {
            exception: ExceptionInfo::new("IOException", message),
            occurred_at: Utc::now(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn scenario_a_first_attempt_retry() {
        let filter = AutomaticRetryFilter::new();
        filter.set_attempts(10);
        let storage = FakeStorage::default();
        let job = job();
        let mut ctx = ElectStateContext::new(&job, failed("disk full"), &storage);

        filter.on_state_election(&mut ctx).await.unwrap();

        match &ctx.candidate_state {
            State::Scheduled { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("Retry attempt 1 of 10: disk full"));
            }
            other => panic!("expected Scheduled, got {other:?}"),
        }
        let (_, pending) = ctx.into_parts();
        assert_eq!(pending.get("RetryCount"), Some(&Value::from(1)));
    }

    #[tokio::test]
    async fn scenario_b_give_up_with_fail() {
        let filter = AutomaticRetryFilter::new();
        filter.set_attempts(10);
        let storage = FakeStorage::default();
        storage
            .parameters
            .lock()
            .unwrap()
            .insert("RetryCount".to_owned(), Value::from(10));
        let job = job();
        let mut ctx = ElectStateContext::new(&job, failed("disk full"), &storage);

        filter.on_state_election(&mut ctx).await.unwrap();

        assert_eq!(ctx.candidate_state.name(), StateName::Failed);
    }

    #[tokio::test]
    async fn scenario_c_give_up_with_delete() {
        let filter = AutomaticRetryFilter::new();
        filter.set_attempts(10);
        filter.set_on_attempts_exceeded(OnAttemptsExceeded::Delete);
        let storage = FakeStorage::default();
        storage
            .parameters
            .lock()
            .unwrap()
            .insert("RetryCount".to_owned(), Value::from(10));
        let job = job();
        let mut ctx = ElectStateContext::new(&job, failed("disk full"), &storage);

        filter.on_state_election(&mut ctx).await.unwrap();

        match &ctx.candidate_state {
            State::Deleted { reason, .. } => {
                assert_eq!(
                    reason.as_deref(),
                    Some("Exceeded the maximum number of retry attempts.")
                );
            }
            other => panic!("expected Deleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_d_retries_disabled() {
        let filter = AutomaticRetryFilter::new();
        filter.set_attempts(0);
        filter.set_on_attempts_exceeded(OnAttemptsExceeded::Delete);
        let storage = FakeStorage::default();
        let job = job();
        let mut ctx = ElectStateContext::new(&job, failed("disk full"), &storage);

        filter.on_state_election(&mut ctx).await.unwrap();

        match &ctx.candidate_state {
            State::Deleted { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("Retries were disabled for this job."));
            }
            other => panic!("expected Deleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scenario_f_allow_list_skips_non_matching_exception() {
        let filter = AutomaticRetryFilter::new();
        filter.set_only_on(vec!["TimeoutException".to_owned()]);
        let storage = FakeStorage::default();
        let job = job();
        let mut ctx = ElectStateContext::new(&job, failed("bad argument"), &storage);

        filter.on_state_election(&mut ctx).await.unwrap();

        assert_eq!(ctx.candidate_state.name(), StateName::Failed);
        let (_, pending) = ctx.into_parts();
        assert!(pending.get("RetryCount").is_none());
    }

    #[tokio::test]
    async fn deny_list_skips_matching_exception() {
        let filter = AutomaticRetryFilter::new();
        filter.set_except_on(vec!["IOException".to_owned()]);
        let storage = FakeStorage::default();
        let job = job();
        let mut ctx = ElectStateContext::new(&job, failed("disk full"), &storage);

        filter.on_state_election(&mut ctx).await.unwrap();

        assert_eq!(ctx.candidate_state.name(), StateName::Failed);
    }

    #[tokio::test]
    async fn scenario_g_unapply_symmetry() {
        let filter = AutomaticRetryFilter::new();
        let storage = FakeStorage::default();
        storage
            .sets
            .lock()
            .unwrap()
            .entry("retries".to_owned())
            .or_default()
            .insert("job-1".to_owned());
        let job = job();

        let scheduled = State::Scheduled {
            enqueue_at: Utc::now(),
            reason: Some("Retry attempt 1 of 10: disk full".to_owned()),
        };
        let processing = State::Processing {
            server_id: "s1".into(),
            worker_id: "w1".into(),
            started_at: Utc::now(),
            reason: None,
        };

        let mut tx = storage.begin().await.unwrap();
        let unapply_ctx = ApplyStateContext::new(&job, &scheduled, StateName::Scheduled);
        filter
            .on_state_unapplied(&unapply_ctx, tx.as_mut())
            .await
            .unwrap();
        let apply_ctx = ApplyStateContext::new(&job, &processing, StateName::Scheduled);
        filter.on_state_applied(&apply_ctx, tx.as_mut()).await.unwrap();

        assert!(!storage.set_contains("retries", "job-1").await.unwrap());
    }

    #[tokio::test]
    async fn on_state_applied_adds_to_retries_set() {
        let filter = AutomaticRetryFilter::new();
        let storage = FakeStorage::default();
        let job = job();
        let scheduled = State::Scheduled {
            enqueue_at: Utc::now(),
            reason: Some("Retry attempt 1 of 10: disk full".to_owned()),
        };
        let mut tx = storage.begin().await.unwrap();
        let ctx = ApplyStateContext::new(&job, &scheduled, StateName::Failed);
        filter.on_state_applied(&ctx, tx.as_mut()).await.unwrap();

        assert!(storage.set_contains("retries", "job-1").await.unwrap());
    }

    #[test]
    fn delays_in_seconds_last_wins_clamp() {
        let filter = AutomaticRetryFilter::new();
        filter.set_delays_in_seconds(vec![5, 10]).unwrap();
        assert_eq!(filter.lock().delay_seconds(3), 10);
        assert_eq!(filter.lock().delay_seconds(1), 5);
    }

    #[test]
    fn empty_delays_in_seconds_is_treated_as_unset() {
        let filter = AutomaticRetryFilter::new();
        filter.set_delays_in_seconds(vec![]).unwrap();
        assert!(filter.lock().delays_in_seconds.is_none());
    }

    #[test]
    fn negative_delays_in_seconds_is_rejected() {
        let filter = AutomaticRetryFilter::new();
        let result = filter.set_delays_in_seconds(vec![5, -1]);
        assert!(result.is_err());
    }
}
