//! Ordered plugin registry with early-exit dispatch.

use std::sync::Arc;

use serde_json::Value;

use super::base::{Plugin, PluginCallback};
use crate::agents::{Agent, CallbackContext, InvocationContext, ToolContext};
use crate::error::{Result, TroupeError};
use crate::events::Event;
use crate::models::{LlmRequest, LlmResponse};
use crate::tools::Tool;
use crate::types::Content;

/// Run `$call` for each plugin in order; the first `Some` wins.
macro_rules! dispatch {
    ($manager:expr, $callback:expr, |$plugin:ident| $call:expr) => {{
        let callback = $callback;
        for $plugin in &$manager.plugins {
            match $call.await {
                Ok(Some(value)) => {
                    tracing::debug!(
                        plugin = $plugin.name(),
                        callback = %callback,
                        "plugin returned early"
                    );
                    return Ok(Some(value));
                }
                Ok(None) => {}
                Err(source) => return Err(wrap_error($plugin.name(), callback, source)),
            }
        }
        Ok(None)
    }};
}

fn wrap_error(plugin: &str, callback: PluginCallback, source: TroupeError) -> TroupeError {
    tracing::error!(plugin, callback = %callback, error = %source, "plugin callback failed");
    TroupeError::PluginCallback {
        plugin: plugin.to_string(),
        callback,
        source: Box::new(source),
    }
}

/// Registered plugins, invoked in registration order.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|plugin| plugin.name()))
            .finish()
    }
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugins(plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> Result<Self> {
        let mut manager = Self::new();
        for plugin in plugins {
            manager.register_plugin(plugin)?;
        }
        Ok(manager)
    }

    /// Register a plugin. The same instance or another plugin with the same
    /// name cannot be registered twice.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let duplicate = self
            .plugins
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &plugin) || existing.name() == plugin.name());
        if duplicate {
            return Err(TroupeError::DuplicatePlugin(plugin.name().to_string()));
        }
        tracing::debug!(plugin = plugin.name(), "plugin registered");
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|plugin| plugin.name() == name)
            .cloned()
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn run_on_user_message(
        &self,
        ctx: &InvocationContext,
        message: &Content,
    ) -> Result<Option<Content>> {
        dispatch!(self, PluginCallback::OnUserMessage, |plugin| plugin.on_user_message(ctx, message))
    }

    pub async fn run_before_run(&self, ctx: &InvocationContext) -> Result<Option<Content>> {
        dispatch!(self, PluginCallback::BeforeRun, |plugin| plugin.before_run(ctx))
    }

    /// Notify every plugin; there is nothing to override.
    pub async fn run_after_run(&self, ctx: &InvocationContext) -> Result<()> {
        for plugin in &self.plugins {
            plugin
                .after_run(ctx)
                .await
                .map_err(|source| wrap_error(plugin.name(), PluginCallback::AfterRun, source))?;
        }
        Ok(())
    }

    pub async fn run_on_event(
        &self,
        ctx: &InvocationContext,
        event: &Event,
    ) -> Result<Option<Event>> {
        dispatch!(self, PluginCallback::OnEvent, |plugin| plugin.on_event(ctx, event))
    }

    pub async fn run_before_agent(
        &self,
        agent: &dyn Agent,
        ctx: &CallbackContext,
    ) -> Result<Option<Content>> {
        dispatch!(self, PluginCallback::BeforeAgent, |plugin| plugin.before_agent(agent, ctx))
    }

    pub async fn run_after_agent(
        &self,
        agent: &dyn Agent,
        ctx: &CallbackContext,
    ) -> Result<Option<Content>> {
        dispatch!(self, PluginCallback::AfterAgent, |plugin| plugin.after_agent(agent, ctx))
    }

    pub async fn run_before_model(
        &self,
        ctx: &CallbackContext,
        request: &mut LlmRequest,
    ) -> Result<Option<LlmResponse>> {
        dispatch!(self, PluginCallback::BeforeModel, |plugin| plugin.before_model(ctx, &mut *request))
    }

    pub async fn run_after_model(
        &self,
        ctx: &CallbackContext,
        response: &LlmResponse,
    ) -> Result<Option<LlmResponse>> {
        dispatch!(self, PluginCallback::AfterModel, |plugin| plugin.after_model(ctx, response))
    }

    pub async fn run_on_model_error(
        &self,
        ctx: &CallbackContext,
        request: &LlmRequest,
        error: &TroupeError,
    ) -> Result<Option<LlmResponse>> {
        dispatch!(self, PluginCallback::OnModelError, |plugin| plugin.on_model_error(ctx, request, error))
    }

    pub async fn run_before_tool(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &ToolContext,
    ) -> Result<Option<Value>> {
        dispatch!(self, PluginCallback::BeforeTool, |plugin| plugin.before_tool(tool, args, ctx))
    }

    pub async fn run_after_tool(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &ToolContext,
        result: &Value,
    ) -> Result<Option<Value>> {
        dispatch!(self, PluginCallback::AfterTool, |plugin| plugin.after_tool(tool, args, ctx, result))
    }

    pub async fn run_on_tool_error(
        &self,
        tool: &dyn Tool,
        args: &Value,
        ctx: &ToolContext,
        error: &TroupeError,
    ) -> Result<Option<Value>> {
        dispatch!(self, PluginCallback::OnToolError, |plugin| plugin.on_tool_error(tool, args, ctx, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn same_instance_is_rejected() {
        let plugin: Arc<dyn Plugin> = Arc::new(Named("a"));
        let mut manager = PluginManager::new();
        manager.register_plugin(plugin.clone()).unwrap();
        let err = manager.register_plugin(plugin).unwrap_err();
        assert!(matches!(err, TroupeError::DuplicatePlugin(name) if name == "a"));
    }

    #[test]
    fn same_name_is_rejected() {
        let err = PluginManager::with_plugins([
            Arc::new(Named("a")) as Arc<dyn Plugin>,
            Arc::new(Named("b")),
            Arc::new(Named("a")),
        ])
        .unwrap_err();
        assert!(matches!(err, TroupeError::DuplicatePlugin(_)));
    }

    #[test]
    fn lookup_by_name() {
        let manager = PluginManager::with_plugins([Arc::new(Named("cache")) as Arc<dyn Plugin>])
            .unwrap();
        assert!(manager.get_plugin("cache").is_some());
        assert!(manager.get_plugin("missing").is_none());
    }
}
