//! The durable job record the election/application pipeline operates on.
//!
//! Storage owns the canonical copy; this crate only ever sees snapshots of it
//! (`Job`) and issues writes against a `Transaction` (see `apply.rs`).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::state::StateName;

/// Per-job key/value parameter bag. Append/overwrite only, never list-valued,
/// per the data model invariant. Values are stored pre-serialized as JSON so the
/// same representation round-trips through any storage driver.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Parameters(HashMap<String, Value>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), value);
    }

    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Deserialize the named parameter as `T`. Missing parameters return
    /// `T::default()` without error; malformed values raise `CoreError::Serialization`.
    pub fn get<T>(&self, name: &str) -> CoreResult<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.0.get(name) {
            None => Ok(T::default()),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|source| CoreError::Serialization {
                    name: name.to_owned(),
                    source,
                })
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// An invocation descriptor: the method to run and its serialized arguments.
/// Out of scope to execute here — the core only carries it through transitions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Invocation {
    pub method: String,
    pub arguments: Vec<Value>,
}

/// A durable job record as read from storage.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub invocation: Invocation,
    pub current_state: StateName,
    pub created_at: DateTime<Utc>,
    pub parameters: Parameters,
}

impl Job {
    pub fn new(id: impl Into<String>, invocation: Invocation) -> Self {
        Self {
            id: id.into(),
            invocation,
            current_state: StateName::Enqueued,
            created_at: Utc::now(),
            parameters: Parameters::new(),
        }
    }
}
