//! State definitions for the job state machine.
//!
//! Each variant is an immutable value carrying its case-specific payload, collapsed
//! into a single Rust `enum` since we don't need open extensibility of the state
//! set itself — only of the filters that react to transitions between a fixed set
//! of states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::exception::ExceptionInfo;

/// The wire-stable name of a state. Comparisons are case-insensitive; `as_str()`
/// always returns the canonical casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateName {
    Enqueued,
    Scheduled,
    Processing,
    Succeeded,
    Failed,
    Deleted,
    Awaiting,
}

impl StateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateName::Enqueued => "Enqueued",
            StateName::Scheduled => "Scheduled",
            StateName::Processing => "Processing",
            StateName::Succeeded => "Succeeded",
            StateName::Failed => "Failed",
            StateName::Deleted => "Deleted",
            StateName::Awaiting => "Awaiting",
        }
    }

    /// Case-insensitive parse, as required by the state-name wire protocol.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "enqueued" => Some(StateName::Enqueued),
            "scheduled" => Some(StateName::Scheduled),
            "processing" => Some(StateName::Processing),
            "succeeded" => Some(StateName::Succeeded),
            "failed" => Some(StateName::Failed),
            "deleted" => Some(StateName::Deleted),
            "awaiting" => Some(StateName::Awaiting),
            _ => None,
        }
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PartialEq<str> for StateName {
    fn eq(&self, other: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(other)
    }
}

/// A job state and its case-specific payload. This is the value that flows through
/// the election pipeline as the "candidate state" and, once elected, gets persisted
/// by the application pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum State {
    Enqueued {
        reason: Option<String>,
    },
    Scheduled {
        enqueue_at: DateTime<Utc>,
        reason: Option<String>,
    },
    Processing {
        server_id: String,
        worker_id: String,
        started_at: DateTime<Utc>,
        reason: Option<String>,
    },
    Succeeded {
        result: Option<serde_json::Value>,
        total_duration_ms: i64,
        latency_ms: i64,
        reason: Option<String>,
    },
    Failed {
        exception: ExceptionInfo,
        occurred_at: DateTime<Utc>,
        reason: Option<String>,
    },
    Deleted {
        exception: Option<ExceptionInfo>,
        reason: Option<String>,
    },
    Awaiting {
        reason: Option<String>,
    },
}

impl State {
    pub fn name(&self) -> StateName {
        match self {
            State::Enqueued { .. } => StateName::Enqueued,
            State::Scheduled { .. } => StateName::Scheduled,
            State::Processing { .. } => StateName::Processing,
            State::Succeeded { .. } => StateName::Succeeded,
            State::Failed { .. } => StateName::Failed,
            State::Deleted { .. } => StateName::Deleted,
            State::Awaiting { .. } => StateName::Awaiting,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            State::Enqueued { reason }
            | State::Scheduled { reason, .. }
            | State::Processing { reason, .. }
            | State::Succeeded { reason, .. }
            | State::Failed { reason, .. }
            | State::Deleted { reason, .. }
            | State::Awaiting { reason } => reason.as_deref(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = Some(reason.into());
        match &mut self {
            State::Enqueued { reason: r }
            | State::Scheduled { reason: r, .. }
            | State::Processing { reason: r, .. }
            | State::Succeeded { reason: r, .. }
            | State::Failed { reason: r, .. }
            | State::Deleted { reason: r, .. }
            | State::Awaiting { reason: r } => *r = reason,
        }
        self
    }

    /// Construct a `Failed` state from an error surfaced by a misbehaving filter,
    /// per the election algorithm's "replace candidate with Failed" rule.
    pub fn failed_from_filter_error(exception: ExceptionInfo) -> Self {
        State::Failed {
            exception,
            occurred_at: Utc::now(),
            reason: None,
        }
    }
}
