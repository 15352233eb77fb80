//! `taskforge-core`: the state-election pipeline, automatic-retry policy, and
//! filter/interceptor mechanism that make a durable background-job framework
//! tick.
//!
//! This crate never talks to a concrete queue or database. It is generic over
//! the [`transaction::StorageReader`]/[`transaction::Transaction`] contract;
//! `taskforge-memory` is the in-process reference implementation used by the
//! worker binary and by this crate's own tests.

pub mod apply;
pub mod cancellation;
pub mod context;
pub mod election;
pub mod error;
pub mod exception;
pub mod filter;
pub mod health;
pub mod job;
pub mod metrics;
pub mod retry;
pub mod state;
pub mod transaction;

use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::error::{CoreError, CoreResult};
use crate::filter::{ApplyStateFilter, ElectStateFilter, FilterRegistry};
use crate::job::Job;
use crate::state::State;
use crate::transaction::StorageReader;

/// Run a full election + application pipeline for `job`, proposing `proposed_state`
/// as the candidate. This is the single awaitable transition operation: synchronous
/// except for the I/O the storage driver performs.
///
/// Cancellation observed between election and commit aborts without writing
/// (`CoreError::Cancelled`); cancellation observed after commit is ignored, since
/// the transition has already taken effect.
#[allow(clippy::too_many_arguments)]
pub async fn transition(
    job: &Job,
    proposed_state: State,
    storage: &dyn StorageReader,
    registry: &FilterRegistry,
    extra_election: &[Arc<dyn ElectStateFilter>],
    extra_apply: &[Arc<dyn ApplyStateFilter>],
    cancellation: Option<&CancellationToken>,
) -> CoreResult<State> {
    let old_state_name = job.current_state;

    let (elected, pending_parameters) =
        election::elect(job, proposed_state, storage, registry, extra_election).await?;

    if cancellation.is_some_and(CancellationToken::is_cancelled) {
        return Err(CoreError::Cancelled(job.id.clone()));
    }

    let tx = storage.begin().await.map_err(CoreError::Storage)?;

    apply::apply(
        job,
        elected,
        old_state_name,
        tx,
        registry,
        extra_apply,
        pending_parameters,
    )
    .await
}
