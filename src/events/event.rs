//! The event record appended to a session.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Content, FunctionCall, FunctionResponse};

use super::actions::EventActions;

/// Author name used for events created from user input.
pub const USER_AUTHOR: &str = "user";

/// A single record in a session's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub actions: EventActions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub long_running_tool_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Incremental model output; never persisted.
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Event {
    /// Create an empty event with a fresh id and timestamp.
    pub fn new(invocation_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: new_event_id(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            content: None,
            actions: EventActions::default(),
            long_running_tool_ids: Vec::new(),
            branch: None,
            timestamp: now(),
            partial: false,
            turn_complete: false,
            interrupted: false,
            error_code: None,
            error_message: None,
        }
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_actions(mut self, actions: EventActions) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.content
            .as_ref()
            .map(Content::function_calls)
            .unwrap_or_default()
    }

    pub fn function_responses(&self) -> Vec<&FunctionResponse> {
        self.content
            .as_ref()
            .map(Content::function_responses)
            .unwrap_or_default()
    }

    /// Text of the event content, if any.
    pub fn text(&self) -> Option<String> {
        self.content.as_ref().map(Content::text)
    }

    /// Whether this event ends the agent's turn from the caller's view.
    pub fn is_final_response(&self) -> bool {
        if self.actions.skip_summarization == Some(true) || !self.long_running_tool_ids.is_empty()
        {
            return true;
        }
        self.function_calls().is_empty() && self.function_responses().is_empty() && !self.partial
    }

    /// Whether this event is visible to a context running on `branch`.
    ///
    /// Events without a branch are visible everywhere; branched events are
    /// visible to the same branch and its descendants.
    pub fn is_visible_to_branch(&self, branch: Option<&str>) -> bool {
        match (branch, self.branch.as_deref()) {
            (None, _) | (_, None) => true,
            (Some(current), Some(own)) => {
                current == own
                    || current
                        .strip_prefix(own)
                        .is_some_and(|rest| rest.starts_with('.'))
            }
        }
    }
}

/// Generate a new unique event id.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time truncated to the microsecond precision storage preserves.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
