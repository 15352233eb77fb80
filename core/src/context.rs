//! The contexts passed to filters during election and application.

use serde_json::Value;
use std::collections::HashMap;

use crate::job::Job;
use crate::state::{State, StateName};
use crate::transaction::StorageReader;

/// Passed to `ElectStateFilter::on_state_election`. Filters read/replace
/// `candidate_state` and may queue job-parameter writes that are flushed as part
/// of the application transaction once an election concludes.
pub struct ElectStateContext<'a> {
    pub job: &'a Job,
    pub candidate_state: State,
    /// Whether a filter has already forced the candidate to `Failed` this election.
    /// The election loop sets this after the first filter error so later errors in
    /// the same election are logged and swallowed instead of rewriting again.
    pub(crate) replaced_after_error: bool,
    pending_parameters: HashMap<String, Value>,
    storage: &'a dyn StorageReader,
}

impl<'a> ElectStateContext<'a> {
    pub fn new(job: &'a Job, candidate_state: State, storage: &'a dyn StorageReader) -> Self {
        Self {
            job,
            candidate_state,
            replaced_after_error: false,
            pending_parameters: HashMap::new(),
            storage,
        }
    }

    /// Read a job parameter, preferring a value already queued for write in this
    /// election (so a filter sees writes from earlier filters in the same
    /// election) unless `allow_stale` is true, in which case the committed value
    /// is read regardless of any pending write.
    pub async fn get_job_parameter<T>(
        &self,
        name: &str,
        allow_stale: bool,
    ) -> crate::error::CoreResult<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        if !allow_stale {
            if let Some(value) = self.pending_parameters.get(name) {
                return serde_json::from_value(value.clone()).map_err(|source| {
                    crate::error::CoreError::Serialization {
                        name: name.to_owned(),
                        source,
                    }
                });
            }
        }
        match self
            .storage
            .get_job_parameter(&self.job.id, name)
            .await
            .map_err(crate::error::CoreError::Storage)?
        {
            None => Ok(T::default()),
            Some(value) => {
                serde_json::from_value(value).map_err(|source| crate::error::CoreError::Serialization {
                    name: name.to_owned(),
                    source,
                })
            }
        }
    }

    /// Queue a parameter write. Committed by the application pipeline alongside
    /// the elected state.
    pub fn set_job_parameter(&mut self, name: impl Into<String>, value: Value) {
        self.pending_parameters.insert(name.into(), value);
    }

    pub fn pending_parameters(&self) -> &HashMap<String, Value> {
        &self.pending_parameters
    }

    pub fn into_parts(self) -> (State, HashMap<String, Value>) {
        (self.candidate_state, self.pending_parameters)
    }
}

/// Passed to `ApplyStateFilter::on_state_applied`/`on_state_unapplied`.
pub struct ApplyStateContext<'a> {
    pub job: &'a Job,
    /// The state being entered (`on_state_applied`) or left (`on_state_unapplied`).
    pub state: &'a State,
    pub old_state_name: StateName,
}

impl<'a> ApplyStateContext<'a> {
    pub fn new(job: &'a Job, state: &'a State, old_state_name: StateName) -> Self {
        Self {
            job,
            state,
            old_state_name,
        }
    }
}
