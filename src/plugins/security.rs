//! Policy-gated tool execution with human confirmation.
//!
//! Every tool call is checked against a [`PolicyEngine`]:
//! - `Allow` runs the tool.
//! - `Deny` rejects the call with an error result.
//! - `Confirm` asks the client to confirm and returns a pending marker. When
//!   the call is resumed with the client's answer the tool either runs once
//!   (confirmed) or is rejected without running.
//!
//! Pending calls are tracked per function call id under
//! [`TOOL_CALL_SECURITY_STATES`] in session state.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use strum::{Display, EnumString};

use super::Plugin;
use crate::agents::ToolContext;
use crate::error::{Result, TroupeError};
use crate::tools::Tool;

/// Session state key holding per-call security states.
pub const TOOL_CALL_SECURITY_STATES: &str = "_tool_call_security_states";

const PENDING: &str = "pending";

/// Decision of a policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PolicyOutcome {
    Allow,
    Deny,
    Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheckResult {
    pub outcome: PolicyOutcome,
    #[serde(default)]
    pub reason: String,
}

impl PolicyCheckResult {
    pub fn new(outcome: PolicyOutcome, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
        }
    }
}

/// Decides whether a tool call may run.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, tool_name: &str, args: &Value) -> Result<PolicyCheckResult>;
}

/// Allows every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicyEngine;

#[async_trait]
impl PolicyEngine for AllowAllPolicyEngine {
    async fn evaluate(&self, _tool_name: &str, _args: &Value) -> Result<PolicyCheckResult> {
        Ok(PolicyCheckResult::new(PolicyOutcome::Allow, "all tool calls are allowed"))
    }
}

#[derive(Debug, Clone)]
struct PolicyRule {
    pattern: Regex,
    outcome: PolicyOutcome,
    reason: String,
}

/// Ordered tool-name rules; the first matching rule decides.
#[derive(Debug, Clone)]
pub struct RulePolicyEngine {
    rules: Vec<PolicyRule>,
    default_outcome: PolicyOutcome,
}

impl Default for RulePolicyEngine {
    fn default() -> Self {
        Self::new(PolicyOutcome::Allow)
    }
}

impl RulePolicyEngine {
    pub fn new(default_outcome: PolicyOutcome) -> Self {
        Self {
            rules: Vec::new(),
            default_outcome,
        }
    }

    /// Add a rule matching tool names against `pattern` (anchored).
    pub fn with_rule(
        mut self,
        pattern: &str,
        outcome: PolicyOutcome,
        reason: impl Into<String>,
    ) -> Result<Self> {
        let pattern = Regex::new(&format!("^(?:{pattern})$")).map_err(|err| {
            TroupeError::Configuration(format!("invalid policy pattern '{pattern}': {err}"))
        })?;
        self.rules.push(PolicyRule {
            pattern,
            outcome,
            reason: reason.into(),
        });
        Ok(self)
    }
}

#[async_trait]
impl PolicyEngine for RulePolicyEngine {
    async fn evaluate(&self, tool_name: &str, _args: &Value) -> Result<PolicyCheckResult> {
        let result = self
            .rules
            .iter()
            .find(|rule| rule.pattern.is_match(tool_name))
            .map(|rule| PolicyCheckResult::new(rule.outcome, rule.reason.clone()))
            .unwrap_or_else(|| {
                PolicyCheckResult::new(self.default_outcome, "no policy rule matched")
            });
        Ok(result)
    }
}

/// Plugin enforcing a [`PolicyEngine`] on every tool call.
pub struct SecurityPlugin {
    name: String,
    policy_engine: Arc<dyn PolicyEngine>,
}

impl std::fmt::Debug for SecurityPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPlugin")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl SecurityPlugin {
    pub fn new(policy_engine: Arc<dyn PolicyEngine>) -> Self {
        Self {
            name: "security_plugin".to_string(),
            policy_engine,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

fn security_states(ctx: &ToolContext) -> Map<String, Value> {
    ctx.get_state_as(TOOL_CALL_SECURITY_STATES).unwrap_or_default()
}

#[async_trait]
impl Plugin for SecurityPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before_tool(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<Option<Value>> {
        let Some(call_id) = ctx.function_call_id().map(str::to_string) else {
            return Ok(None);
        };
        let pending = security_states(ctx)
            .get(&call_id)
            .and_then(Value::as_str)
            .is_some_and(|state| state == PENDING);

        if let Some(confirmation) = ctx.tool_confirmation().filter(|_| pending) {
            let mut states = security_states(ctx);
            states.remove(&call_id);
            ctx.set_state(TOOL_CALL_SECURITY_STATES, Value::Object(states));
            if !confirmation.confirmed {
                tracing::warn!(tool = tool.name(), function_call_id = %call_id, "tool call rejected by user");
                return Ok(Some(json!({"error": "This tool call is rejected."})));
            }
            tracing::debug!(tool = tool.name(), function_call_id = %call_id, "tool call confirmed");
            return Ok(None);
        }

        let check = self.policy_engine.evaluate(tool.name(), args).await?;
        match check.outcome {
            PolicyOutcome::Allow => Ok(None),
            PolicyOutcome::Deny => {
                tracing::warn!(
                    tool = tool.name(),
                    function_call_id = %call_id,
                    reason = %check.reason,
                    "tool call denied by policy"
                );
                Ok(Some(json!({
                    "error": format!(
                        "This tool call is rejected by policy engine. Reason: {}",
                        check.reason
                    )
                })))
            }
            PolicyOutcome::Confirm => {
                ctx.request_confirmation(
                    format!(
                        "Policy engine requires confirmation calling tool: {}. Reason: {}",
                        tool.name(),
                        check.reason
                    ),
                    None,
                )?;
                // Re-read after the policy await: sibling calls of the same
                // step may have written their own entries meanwhile.
                let mut states = security_states(ctx);
                states.insert(call_id, Value::String(PENDING.to_string()));
                ctx.set_state(TOOL_CALL_SECURITY_STATES, Value::Object(states));
                Ok(Some(json!({
                    "partial": "This tool call needs external confirmation before completion."
                })))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let engine = RulePolicyEngine::new(PolicyOutcome::Allow)
            .with_rule("delete_.*", PolicyOutcome::Deny, "destructive")
            .unwrap()
            .with_rule("delete_draft|send_.*", PolicyOutcome::Confirm, "side effects")
            .unwrap();

        let deny = engine.evaluate("delete_draft", &Value::Null).await.unwrap();
        assert_eq!(deny.outcome, PolicyOutcome::Deny);
        assert_eq!(deny.reason, "destructive");

        let confirm = engine.evaluate("send_email", &Value::Null).await.unwrap();
        assert_eq!(confirm.outcome, PolicyOutcome::Confirm);

        let allow = engine.evaluate("lookup", &Value::Null).await.unwrap();
        assert_eq!(allow.outcome, PolicyOutcome::Allow);
    }

    #[tokio::test]
    async fn patterns_are_anchored() {
        let engine = RulePolicyEngine::new(PolicyOutcome::Allow)
            .with_rule("send", PolicyOutcome::Deny, "no sending")
            .unwrap();
        let result = engine.evaluate("resend_later", &Value::Null).await.unwrap();
        assert_eq!(result.outcome, PolicyOutcome::Allow);
    }

    #[test]
    fn invalid_pattern_is_a_configuration_error() {
        let err = RulePolicyEngine::default()
            .with_rule("(", PolicyOutcome::Deny, "broken")
            .unwrap_err();
        assert!(matches!(err, TroupeError::Configuration(_)));
    }

    #[test]
    fn outcomes_parse_case_insensitively() {
        assert_eq!(PolicyOutcome::from_str("confirm").unwrap(), PolicyOutcome::Confirm);
        assert_eq!(PolicyOutcome::Deny.to_string(), "DENY");
    }
}
