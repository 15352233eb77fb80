//! The application pipeline: persists the elected state within a single
//! storage transaction, giving application filters a chance to piggy-back
//! auxiliary writes onto the same commit.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::ApplyStateContext;
use crate::error::{CoreError, CoreResult};
use crate::filter::{ApplyStateFilter, FilterRegistry};
use crate::job::Job;
use crate::state::{State, StateName};
use crate::transaction::Transaction;

/// Persist `elected_state` for `job`, transitioning it from `old_state_name`.
///
/// Runs, in order, within the single transaction `tx`:
/// 1. `on_state_unapplied` for every application filter, against the old state.
/// 2. The primary state write.
/// 3. `on_state_applied` for every application filter, against the new state.
/// 4. The job-parameter writes queued during election.
/// 5. Commit.
///
/// If any filter errors, the transaction is dropped without committing (so none
/// of its buffered writes take effect) and the error is surfaced to the caller,
/// which is expected to retry the whole election+application from scratch.
pub async fn apply(
    job: &Job,
    elected_state: State,
    old_state_name: StateName,
    mut tx: Box<dyn Transaction>,
    registry: &FilterRegistry,
    extra_filters: &[Arc<dyn ApplyStateFilter>],
    pending_parameters: HashMap<String, Value>,
) -> CoreResult<State> {
    let filters = registry.application_filters(extra_filters);
    let ctx = ApplyStateContext::new(job, &elected_state, old_state_name);

    for filter in &filters {
        filter
            .on_state_unapplied(&ctx, tx.as_mut())
            .await
            .map_err(|source| CoreError::Filter {
                filter: filter.name(),
                phase: "apply:on_state_unapplied",
                source,
            })?;
    }

    tx.set_job_state(&job.id, &elected_state)
        .await
        .map_err(CoreError::Storage)?;

    for filter in &filters {
        filter
            .on_state_applied(&ctx, tx.as_mut())
            .await
            .map_err(|source| CoreError::Filter {
                filter: filter.name(),
                phase: "apply:on_state_applied",
                source,
            })?;
    }

    for (name, value) in pending_parameters {
        tx.set_job_parameter(&job.id, &name, value)
            .await
            .map_err(CoreError::Storage)?;
    }

    tx.commit().await.map_err(CoreError::Storage)?;

    Ok(elected_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::filter::FilterError;
    use crate::job::Invocation;
    use crate::transaction::StorageReader;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransaction {
        states: Vec<StateName>,
        parameters: Vec<(String, Value)>,
        committed: bool,
    }

    #[async_trait]
    impl Transaction for RecordingTransaction {
        async fn set_job_state(&mut self, _job_id: &str, state: &State) -> Result<(), StorageError> {
            self.states.push(state.name());
            Ok(())
        }
        async fn set_job_parameter(
            &mut self,
            _job_id: &str,
            name: &str,
            value: Value,
        ) -> Result<(), StorageError> {
            self.parameters.push((name.to_owned(), value));
            Ok(())
        }
        async fn add_to_set(&mut self, _set_name: &str, _value: &str) -> Result<(), StorageError> {
            Ok(())
        }
        async fn remove_from_set(
            &mut self,
            _set_name: &str,
            _value: &str,
        ) -> Result<(), StorageError> {
            Ok(())
        }
        async fn add_to_list(&mut self, _list_name: &str, _value: Value) -> Result<(), StorageError> {
            Ok(())
        }
        async fn trim_list(
            &mut self,
            _list_name: &str,
            _keep_start: i64,
            _keep_end: i64,
        ) -> Result<(), StorageError> {
            Ok(())
        }
        async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
            self.committed = true;
            Ok(())
        }
    }

    struct NullStorage;

    #[async_trait]
    impl StorageReader for NullStorage {
        async fn get_job(&self, _job_id: &str) -> Result<Job, StorageError> {
            unimplemented!()
        }
        async fn get_current_state(&self, _job_id: &str) -> Result<String, StorageError> {
            unimplemented!()
        }
        async fn get_job_parameter(
            &self,
            _job_id: &str,
            _name: &str,
        ) -> Result<Option<Value>, StorageError> {
            Ok(None)
        }
        async fn begin(&self) -> Result<Box<dyn Transaction>, StorageError> {
            Ok(Box::new(RecordingTransaction::default()))
        }
        async fn set_contains(&self, _set_name: &str, _value: &str) -> Result<bool, StorageError> {
            Ok(false)
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

    #[tokio::test]
    async fn unapplied_runs_before_state_write_which_runs_before_applied() {
        static ORDER: Mutex<Vec<&str>> = Mutex::new(Vec::new());

        struct OrderTrackingFilter;

        #[async_trait]
        impl ApplyStateFilter for OrderTrackingFilter {
            fn order(&self) -> i32 {
                10
            }
            fn name(&self) -> &'static str {
                "order_tracking"
            }
            async fn on_state_applied(
                &self,
                _ctx: &ApplyStateContext<'_>,
                _tx: &mut dyn Transaction,
            ) -> Result<(), FilterError> {
                ORDER.lock().unwrap().push("applied");
                Ok(())
            }
            async fn on_state_unapplied(
                &self,
                _ctx: &ApplyStateContext<'_>,
                _tx: &mut dyn Transaction,
            ) -> Result<(), FilterError> {
                ORDER.lock().unwrap().push("unapplied");
                Ok(())
            }
        }

        let registry = FilterRegistry::new();
        registry.register_application(Arc::new(OrderTrackingFilter));

        let job = job();
        let storage = NullStorage;
        let tx = storage.begin().await.unwrap();

        apply(
            &job,
            State::Succeeded {
                result: None,
                total_duration_ms: 1,
                latency_ms: 1,
                reason: None,
            },
            StateName::Processing,
            tx,
            &registry,
            &[],
            HashMap::new(),
        )
        .await
        .unwrap();

        assert_eq!(*ORDER.lock().unwrap(), vec!["unapplied", "applied"]);
    }

    #[tokio::test]
    async fn pending_parameters_are_written_and_transaction_committed() {
        let registry = FilterRegistry::new();
        let job = job();
        let storage = NullStorage;
        let tx = storage.begin().await.unwrap();

        let mut pending = HashMap::new();
        pending.insert("RetryCount".to_owned(), Value::from(1));

        let elected = apply(
            &job,
            State::Enqueued { reason: None },
            StateName::Failed,
            tx,
            &registry,
            &[],
            pending,
        )
        .await
        .unwrap();

        assert_eq!(elected.name(), StateName::Enqueued);
    }

    #[tokio::test]
    async fn filter_error_during_apply_surfaces_without_committing() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct FailingFilter;

        #[async_trait]
        impl ApplyStateFilter for FailingFilter {
            fn name(&self) -> &'static str {
                "failing"
            }
            async fn on_state_applied(
                &self,
                _ctx: &ApplyStateContext<'_>,
                _tx: &mut dyn Transaction,
            ) -> Result<(), FilterError> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            }
            async fn on_state_unapplied(
                &self,
                _ctx: &ApplyStateContext<'_>,
                _tx: &mut dyn Transaction,
            ) -> Result<(), FilterError> {
                Ok(())
            }
        }

        let registry = FilterRegistry::new();
        registry.register_application(Arc::new(FailingFilter));
        let job = job();
        let storage = NullStorage;
        let tx = storage.begin().await.unwrap();

        let result = apply(
            &job,
            State::Enqueued { reason: None },
            StateName::Failed,
            tx,
            &registry,
            &[],
            HashMap::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
