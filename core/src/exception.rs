//! Exception payloads carried by `Failed` and `Deleted` states.
//!
//! A small, stable, serializable record rather than a live `dyn Error`, since it
//! has to survive a round trip through storage.

use serde::{Deserialize, Serialize};

/// A snapshot of an error that occurred while running a job.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ExceptionInfo {
    /// The exception's type name, used for `only_on`/`except_on` matching.
    pub type_name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// The message truncated to 49 characters followed by a single ellipsis when
    /// strictly longer than 50 characters; preserved verbatim otherwise.
    pub fn truncated_message(&self) -> String {
        truncate_message(&self.message)
    }
}

pub(crate) fn truncate_message(message: &str) -> String {
    // Truncate on chars, not bytes, so multi-byte UTF-8 sequences aren't split.
    let char_count = message.chars().count();
    if char_count > 50 {
        let mut truncated: String = message.chars().take(49).collect();
        truncated.push('\u{2026}'); // "…"
        truncated
    } else {
        message.to_owned()
    }
}
