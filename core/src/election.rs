//! The election pipeline: rewrites a proposed state into the elected state
//! by running it through every registered election filter in order.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use crate::context::ElectStateContext;
use crate::error::CoreResult;
use crate::exception::ExceptionInfo;
use crate::filter::{ElectStateFilter, FilterRegistry};
use crate::job::Job;
use crate::state::State;
use crate::transaction::StorageReader;

/// Run the election pipeline for `job`, starting from `proposed_state`.
///
/// Returns the elected state and the job-parameter writes filters queued along the
/// way; the caller (typically the worker loop) passes both into [`crate::apply`].
pub async fn elect(
    job: &Job,
    proposed_state: State,
    storage: &dyn StorageReader,
    registry: &FilterRegistry,
    extra_filters: &[Arc<dyn ElectStateFilter>],
) -> CoreResult<(State, HashMap<String, Value>)> {
    let mut ctx = ElectStateContext::new(job, proposed_state, storage);

    for filter in registry.election_filters(extra_filters) {
        if let Err(source) = filter.on_state_election(&mut ctx).await {
            error!(
                job_id = %job.id,
                filter = filter.name(),
                error = %source,
                "election filter failed"
            );

            // Replace the candidate with Failed at most once per election, so the
            // retry policy (or another later filter) can react to the failure, but
            // a second misbehaving filter doesn't keep rewriting forever.
            if !ctx.replaced_after_error {
                ctx.candidate_state = State::failed_from_filter_error(ExceptionInfo::new(
                    filter.name().to_owned(),
                    source.to_string(),
                ));
                ctx.replaced_after_error = true;
            }
        }
    }

    Ok(ctx.into_parts())
}
