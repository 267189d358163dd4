//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use super::arguments::ToolArguments;
use super::types::ToolParameters;
use crate::agents::ToolContext;
use crate::error::Result;
use crate::models::{FunctionDeclaration, LlmRequest};

/// Core tool trait; implement to expose a function to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model calls the tool by.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Long-running tools return before their work completes; a `null`
    /// result produces no function response.
    fn is_long_running(&self) -> bool {
        false
    }

    /// Declaration sent to the model, if any.
    fn declaration(&self) -> Option<FunctionDeclaration> {
        None
    }

    /// Execute the tool.
    async fn run(&self, args: ToolArguments, ctx: &ToolContext) -> Result<Value>;

    /// Adjust the outgoing model request. Registers the declaration by default.
    async fn process_llm_request(&self, _ctx: &ToolContext, request: &mut LlmRequest) -> Result<()> {
        if let Some(declaration) = self.declaration() {
            request.append_tool(declaration);
        }
        Ok(())
    }
}

type ToolHandler = dyn Fn(ToolArguments, ToolContext) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// Closure-based tool.
///
/// The handler receives a clone of the [`ToolContext`]; state writes and
/// action requests made through it are visible to the caller.
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    long_running: bool,
    require_confirmation: bool,
    handler: Arc<ToolHandler>,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            long_running: false,
            require_confirmation: false,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    /// Ask the client to confirm every call before the handler runs.
    pub fn require_confirmation(mut self) -> Self {
        self.require_confirmation = true;
        self
    }

    pub fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn is_long_running(&self) -> bool {
        self.long_running
    }

    fn declaration(&self) -> Option<FunctionDeclaration> {
        Some(FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.schema.clone(),
        })
    }

    async fn run(&self, args: ToolArguments, ctx: &ToolContext) -> Result<Value> {
        if self.require_confirmation {
            match ctx.tool_confirmation() {
                None => {
                    let hint = format!("Please approve or reject the tool call {}().", self.name);
                    ctx.request_confirmation(hint, None)?;
                    return Ok(json!({
                        "error": "This tool call requires confirmation, please approve or reject."
                    }));
                }
                Some(confirmation) if !confirmation.confirmed => {
                    return Ok(json!({"error": "This tool call is rejected."}));
                }
                Some(_) => {}
            }
        }
        self.parameters.validate(args.raw())?;
        (self.handler)(args, ctx.clone()).await
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("long_running", &self.long_running)
            .finish()
    }
}
