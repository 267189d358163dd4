//! Plugin capability interface.

use async_trait::async_trait;
use serde_json::Value;
use strum::{Display, EnumString};

use crate::agents::{Agent, CallbackContext, InvocationContext, ToolContext};
use crate::error::{Result, TroupeError};
use crate::events::Event;
use crate::models::{LlmRequest, LlmResponse};
use crate::tools::Tool;
use crate::types::Content;

/// Lifecycle points a plugin can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PluginCallback {
    #[strum(serialize = "on_user_message_callback")]
    OnUserMessage,
    #[strum(serialize = "before_run_callback")]
    BeforeRun,
    #[strum(serialize = "after_run_callback")]
    AfterRun,
    #[strum(serialize = "on_event_callback")]
    OnEvent,
    #[strum(serialize = "before_agent_callback")]
    BeforeAgent,
    #[strum(serialize = "after_agent_callback")]
    AfterAgent,
    #[strum(serialize = "before_tool_callback")]
    BeforeTool,
    #[strum(serialize = "after_tool_callback")]
    AfterTool,
    #[strum(serialize = "on_tool_error_callback")]
    OnToolError,
    #[strum(serialize = "before_model_callback")]
    BeforeModel,
    #[strum(serialize = "after_model_callback")]
    AfterModel,
    #[strum(serialize = "on_model_error_callback")]
    OnModelError,
}

/// A plugin hooks into the invocation lifecycle.
///
/// Every hook defaults to a no-op returning `None`. Returning `Some` from a
/// hook overrides the default behavior and stops later plugins from seeing
/// that callback.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name within a [`PluginManager`](super::PluginManager).
    fn name(&self) -> &str;

    /// Inspect or replace the incoming user message.
    async fn on_user_message(
        &self,
        _ctx: &InvocationContext,
        _message: &Content,
    ) -> Result<Option<Content>> {
        Ok(None)
    }

    /// Returning content skips agent execution; the content becomes the only event.
    async fn before_run(&self, _ctx: &InvocationContext) -> Result<Option<Content>> {
        Ok(None)
    }

    /// Notification once the invocation is over.
    async fn after_run(&self, _ctx: &InvocationContext) -> Result<()> {
        Ok(())
    }

    /// Replace an event before it is persisted and emitted.
    async fn on_event(&self, _ctx: &InvocationContext, _event: &Event) -> Result<Option<Event>> {
        Ok(None)
    }

    /// Returning content skips the agent.
    async fn before_agent(
        &self,
        _agent: &dyn Agent,
        _ctx: &CallbackContext,
    ) -> Result<Option<Content>> {
        Ok(None)
    }

    async fn after_agent(
        &self,
        _agent: &dyn Agent,
        _ctx: &CallbackContext,
    ) -> Result<Option<Content>> {
        Ok(None)
    }

    /// Returning a response skips the model call.
    async fn before_model(
        &self,
        _ctx: &CallbackContext,
        _request: &mut LlmRequest,
    ) -> Result<Option<LlmResponse>> {
        Ok(None)
    }

    async fn after_model(
        &self,
        _ctx: &CallbackContext,
        _response: &LlmResponse,
    ) -> Result<Option<LlmResponse>> {
        Ok(None)
    }

    /// Returning a response recovers from the model failure.
    async fn on_model_error(
        &self,
        _ctx: &CallbackContext,
        _request: &LlmRequest,
        _error: &TroupeError,
    ) -> Result<Option<LlmResponse>> {
        Ok(None)
    }

    /// Returning a value skips the tool and is used as its result.
    async fn before_tool(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &ToolContext,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn after_tool(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &ToolContext,
        _result: &Value,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Returning a value recovers from the tool failure.
    async fn on_tool_error(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &ToolContext,
        _error: &TroupeError,
    ) -> Result<Option<Value>> {
        Ok(None)
    }
}
