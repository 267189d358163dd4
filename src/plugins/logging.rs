//! Plugin that traces every lifecycle point.

use async_trait::async_trait;
use serde_json::Value;

use super::Plugin;
use crate::agents::{Agent, CallbackContext, InvocationContext, ToolContext};
use crate::error::{Result, TroupeError};
use crate::events::Event;
use crate::models::{LlmRequest, LlmResponse};
use crate::tools::Tool;
use crate::types::Content;

/// Logs each callback through `tracing` without changing anything.
#[derive(Debug, Clone)]
pub struct LoggingPlugin {
    name: String,
}

impl Default for LoggingPlugin {
    fn default() -> Self {
        Self::new("logging_plugin")
    }
}

impl LoggingPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_user_message(
        &self,
        ctx: &InvocationContext,
        message: &Content,
    ) -> Result<Option<Content>> {
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            agent = ctx.agent_name(),
            message = %truncate(&message.text(), 200),
            "user message received"
        );
        Ok(None)
    }

    async fn before_run(&self, ctx: &InvocationContext) -> Result<Option<Content>> {
        tracing::info!(invocation_id = %ctx.invocation_id, agent = ctx.agent_name(), "invocation starting");
        Ok(None)
    }

    async fn after_run(&self, ctx: &InvocationContext) -> Result<()> {
        tracing::info!(
            invocation_id = %ctx.invocation_id,
            llm_calls = ctx.llm_call_count(),
            "invocation completed"
        );
        Ok(())
    }

    async fn on_event(&self, ctx: &InvocationContext, event: &Event) -> Result<Option<Event>> {
        tracing::debug!(
            invocation_id = %ctx.invocation_id,
            event_id = %event.id,
            author = %event.author,
            final_response = event.is_final_response(),
            function_calls = event.function_calls().len(),
            function_responses = event.function_responses().len(),
            "event emitted"
        );
        Ok(None)
    }

    async fn before_agent(&self, agent: &dyn Agent, ctx: &CallbackContext) -> Result<Option<Content>> {
        tracing::debug!(
            invocation_id = ctx.invocation_id(),
            agent = agent.name(),
            branch = ctx.branch().unwrap_or(""),
            "agent starting"
        );
        Ok(None)
    }

    async fn after_agent(&self, agent: &dyn Agent, ctx: &CallbackContext) -> Result<Option<Content>> {
        tracing::debug!(invocation_id = ctx.invocation_id(), agent = agent.name(), "agent completed");
        Ok(None)
    }

    async fn before_model(
        &self,
        ctx: &CallbackContext,
        request: &mut LlmRequest,
    ) -> Result<Option<LlmResponse>> {
        tracing::debug!(
            invocation_id = ctx.invocation_id(),
            agent = ctx.agent_name(),
            model = request.model.as_deref().unwrap_or("default"),
            contents = request.contents.len(),
            tools = request.tools.len(),
            "model request"
        );
        Ok(None)
    }

    async fn after_model(
        &self,
        ctx: &CallbackContext,
        response: &LlmResponse,
    ) -> Result<Option<LlmResponse>> {
        if let Some(code) = &response.error_code {
            tracing::warn!(
                invocation_id = ctx.invocation_id(),
                error_code = %code,
                error_message = response.error_message.as_deref().unwrap_or(""),
                "model returned an error"
            );
        } else {
            tracing::debug!(
                invocation_id = ctx.invocation_id(),
                partial = response.partial,
                usage = ?response.usage,
                "model response"
            );
        }
        Ok(None)
    }

    async fn on_model_error(
        &self,
        ctx: &CallbackContext,
        _request: &LlmRequest,
        error: &TroupeError,
    ) -> Result<Option<LlmResponse>> {
        tracing::warn!(invocation_id = ctx.invocation_id(), error = %error, "model error");
        Ok(None)
    }

    async fn before_tool(&self, tool: &dyn Tool, args: &Value, ctx: &ToolContext) -> Result<Option<Value>> {
        tracing::debug!(
            tool = tool.name(),
            function_call_id = ctx.function_call_id().unwrap_or(""),
            args = %truncate(&args.to_string(), 200),
            "tool starting"
        );
        Ok(None)
    }

    async fn after_tool(
        &self,
        tool: &dyn Tool,
        _args: &Value,
        ctx: &ToolContext,
        result: &Value,
    ) -> Result<Option<Value>> {
        tracing::debug!(
            tool = tool.name(),
            function_call_id = ctx.function_call_id().unwrap_or(""),
            result = %truncate(&result.to_string(), 200),
            "tool completed"
        );
        Ok(None)
    }

    async fn on_tool_error(
        &self,
        tool: &dyn Tool,
        _args: &Value,
        ctx: &ToolContext,
        error: &TroupeError,
    ) -> Result<Option<Value>> {
        tracing::warn!(
            tool = tool.name(),
            function_call_id = ctx.function_call_id().unwrap_or(""),
            error = %error,
            "tool error"
        );
        Ok(None)
    }
}
