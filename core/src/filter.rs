//! The filter registry: an ordered collection of user-pluggable policies
//! that observe or rewrite state transitions.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::context::{ApplyStateContext, ElectStateContext};
use crate::transaction::Transaction;

/// Error type raised by a filter implementation. Boxed so filters can report
/// whatever domain-specific error they want without this crate knowing about it.
pub type FilterError = Box<dyn std::error::Error + Send + Sync>;

/// Runs during state election and may rewrite the candidate state.
#[async_trait]
pub trait ElectStateFilter: Send + Sync {
    /// Lower runs earlier. The built-in retry filter uses 20.
    fn order(&self) -> i32 {
        100
    }

    fn name(&self) -> &'static str;

    async fn on_state_election(&self, ctx: &mut ElectStateContext<'_>) -> Result<(), FilterError>;
}

/// Runs during state application, with a write-only transaction to piggy-back on.
#[async_trait]
pub trait ApplyStateFilter: Send + Sync {
    fn order(&self) -> i32 {
        100
    }

    fn name(&self) -> &'static str;

    /// Invoked for the state being entered.
    async fn on_state_applied(
        &self,
        ctx: &ApplyStateContext<'_>,
        tx: &mut dyn Transaction,
    ) -> Result<(), FilterError>;

    /// Invoked for the state being left. Must undo the side effects of a prior
    /// `on_state_applied` for that state.
    async fn on_state_unapplied(
        &self,
        ctx: &ApplyStateContext<'_>,
        tx: &mut dyn Transaction,
    ) -> Result<(), FilterError>;
}

/// Process-wide, initialize-once, read-many collection of filters. Registration is
/// expected to happen during startup, before any worker runs; registering after the
/// registry has been read is logged as a warning rather than rejected outright,
/// since Rust gives us no reflection hook to hard-fail on in release builds.
#[derive(Default)]
pub struct FilterRegistry {
    election: RwLock<Vec<Arc<dyn ElectStateFilter>>>,
    application: RwLock<Vec<Arc<dyn ApplyStateFilter>>>,
    observed: AtomicBool,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_election(&self, filter: Arc<dyn ElectStateFilter>) {
        self.warn_if_observed(filter.name());
        let mut filters = self.election.write().expect("filter registry poisoned");
        filters.push(filter);
        filters.sort_by_key(|f| f.order());
    }

    pub fn register_application(&self, filter: Arc<dyn ApplyStateFilter>) {
        self.warn_if_observed(filter.name());
        let mut filters = self.application.write().expect("filter registry poisoned");
        filters.push(filter);
        filters.sort_by_key(|f| f.order());
    }

    fn warn_if_observed(&self, name: &str) {
        if self.observed.load(Ordering::Relaxed) {
            warn!(
                filter = name,
                "registering a filter after the registry has already been read by a pipeline run"
            );
        }
    }

    /// Election filters merged with any call-specific filters, sorted by order with
    /// ties broken by registration order among globals, and call-specific filters
    /// winning ties against globals at the same order (the nearest analogue to
    /// method-level attribute attachment beating a global registration).
    pub fn election_filters(
        &self,
        extra: &[Arc<dyn ElectStateFilter>],
    ) -> Vec<Arc<dyn ElectStateFilter>> {
        self.observed.store(true, Ordering::Relaxed);
        let mut merged: Vec<Arc<dyn ElectStateFilter>> = self
            .election
            .read()
            .expect("filter registry poisoned")
            .clone();
        merged.extend(extra.iter().cloned());
        merged.sort_by_key(|f| f.order());
        merged
    }

    pub fn application_filters(
        &self,
        extra: &[Arc<dyn ApplyStateFilter>],
    ) -> Vec<Arc<dyn ApplyStateFilter>> {
        self.observed.store(true, Ordering::Relaxed);
        let mut merged: Vec<Arc<dyn ApplyStateFilter>> = self
            .application
            .read()
            .expect("filter registry poisoned")
            .clone();
        merged.extend(extra.iter().cloned());
        merged.sort_by_key(|f| f.order());
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ElectStateContext;
    use crate::job::{Invocation, Job};
    use crate::state::State;

    struct RenamingFilter {
        order: i32,
        reason: &'static str,
    }

    #[async_trait]
    impl ElectStateFilter for RenamingFilter {
        fn order(&self) -> i32 {
            self.order
        }

        fn name(&self) -> &'static str {
            "renaming_filter"
        }

        async fn on_state_election(
            &self,
            ctx: &mut ElectStateContext<'_>,
        ) -> Result<(), FilterError> {
            ctx.candidate_state = ctx.candidate_state.clone().with_reason(self.reason);
            Ok(())
        }
    }

    struct NullStorage;

    #[async_trait::async_trait]
    impl crate::transaction::StorageReader for NullStorage {
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
            _name: &str,
        ) -> Result<Option<serde_json::Value>, crate::error::StorageError> {
            Ok(None)
        }
        async fn begin(
            &self,
        ) -> Result<Box<dyn crate::transaction::Transaction>, crate::error::StorageError> {
            unimplemented!()
        }
        async fn set_contains(
            &self,
            _set_name: &str,
            _value: &str,
        ) -> Result<bool, crate::error::StorageError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn filters_run_in_order_and_later_wins() {
        let registry = FilterRegistry::new();
        registry.register_election(Arc::new(RenamingFilter {
            order: 10,
            reason: "A",
        }));
        registry.register_election(Arc::new(RenamingFilter {
            order: 20,
            reason: "B",
        }));

        let job = Job::new(
            "job-1",
            Invocation {
                method: "noop".into(),
                arguments: vec![],
            },
        );
        let storage = NullStorage;
        let mut ctx =
            ElectStateContext::new(&job, State::Enqueued { reason: None }, &storage);

        for filter in registry.election_filters(&[]) {
            filter.on_state_election(&mut ctx).await.unwrap();
        }

        assert_eq!(ctx.candidate_state.reason(), Some("B"));
    }
}
