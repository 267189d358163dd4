//! Side effects attached to an event.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::state::StateMap;

/// Human-in-the-loop gate for a single tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolConfirmation {
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ToolConfirmation {
    pub fn pending(hint: impl Into<String>) -> Self {
        Self {
            hint: hint.into(),
            confirmed: false,
            payload: None,
        }
    }
}

/// Credential request raised by a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    pub auth_scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_key: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Mutable action bag carried by every event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventActions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_summarization: Option<bool>,
    #[serde(default)]
    pub state_delta: StateMap,
    #[serde(default)]
    pub artifact_delta: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalate: Option<bool>,
    #[serde(default)]
    pub requested_auth_configs: HashMap<String, AuthConfig>,
    #[serde(default)]
    pub requested_tool_confirmations: HashMap<String, ToolConfirmation>,
}

impl EventActions {
    /// True when any side effect is recorded.
    pub fn is_empty(&self) -> bool {
        self.skip_summarization.is_none()
            && self.state_delta.is_empty()
            && self.artifact_delta.is_empty()
            && self.transfer_to_agent.is_none()
            && self.escalate.is_none()
            && self.requested_auth_configs.is_empty()
            && self.requested_tool_confirmations.is_empty()
    }

    pub fn escalates(&self) -> bool {
        self.escalate == Some(true)
    }

    /// Fold `other` into `self`: maps union per key with `other` winning,
    /// scalars overwritten when `other` sets them.
    pub fn merge(&mut self, other: EventActions) {
        self.state_delta.extend(other.state_delta);
        self.artifact_delta.extend(other.artifact_delta);
        self.requested_auth_configs.extend(other.requested_auth_configs);
        self.requested_tool_confirmations
            .extend(other.requested_tool_confirmations);
        if other.skip_summarization.is_some() {
            self.skip_summarization = other.skip_summarization;
        }
        if other.transfer_to_agent.is_some() {
            self.transfer_to_agent = other.transfer_to_agent;
        }
        if other.escalate.is_some() {
            self.escalate = other.escalate;
        }
    }
}

/// Merge an ordered list of action sets; later sources win.
pub fn merge_event_actions(sources: impl IntoIterator<Item = EventActions>) -> EventActions {
    sources
        .into_iter()
        .fold(EventActions::default(), |mut merged, actions| {
            merged.merge(actions);
            merged
        })
}
