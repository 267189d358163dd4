//! Conversational leaf agent backed by a [`ModelClient`].

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_stream::try_stream;
use bon::Builder;
use futures::future::join_all;
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Agent, CallbackContext, EventStream, InvocationContext, ToolContext};
use crate::config::StreamingMode;
use crate::error::{Result, TroupeError};
use crate::events::{Event, EventActions, ToolConfirmation, USER_AUTHOR};
use crate::live::LiveRequestQueue;
use crate::models::{
    GenerateContentConfig, LiveConnection, LlmRequest, LlmResponse, LlmResponseStream,
    ModelClient,
};
use crate::state::StateMap;
use crate::tools::{Tool, ToolArguments, TransferToAgentTool};
use crate::types::{Content, FunctionCall, FunctionResponse, Part, Role};

/// Client-side function asking the user to confirm a tool call.
pub const REQUEST_CONFIRMATION: &str = "request_confirmation";
/// Client-side function asking the user for credentials.
pub const REQUEST_CREDENTIAL: &str = "request_credential";

const UNKNOWN_ERROR_CODE: &str = "UNKNOWN_ERROR";

pub fn new_function_call_id() -> String {
    format!("call-{}", Uuid::new_v4())
}

/// Agent that talks to a model and executes the tools it calls.
#[derive(Builder)]
pub struct LlmAgent {
    #[builder(into)]
    name: String,
    #[builder(into, default)]
    description: String,
    model: Arc<dyn ModelClient>,
    /// System instruction; `{key}` placeholders are filled from session
    /// state, `{key?}` ones are optional.
    #[builder(into, default)]
    instruction: String,
    #[builder(default)]
    tools: Vec<Arc<dyn Tool>>,
    /// Agents this one may transfer control to.
    #[builder(default)]
    sub_agents: Vec<Arc<dyn Agent>>,
    /// State key receiving the text of the final response.
    #[builder(into)]
    output_key: Option<String>,
    #[builder(default)]
    disallow_transfer_to_parent: bool,
    #[builder(default)]
    generate_content_config: GenerateContentConfig,
}

impl std::fmt::Debug for LlmAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAgent")
            .field("name", &self.name)
            .field("model", &self.model.model_name())
            .field("tools", &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn disallow_transfer_to_parent(&self) -> bool {
        self.disallow_transfer_to_parent
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(try_stream! {
            if let Some((calls, event)) = self.resume_confirmed_calls(&ctx).await? {
                yield event.clone();
                let mut follow_up = Arc::clone(&self).after_function_responses(ctx.clone(), calls, event);
                while let Some(event) = follow_up.next().await {
                    let event = event?;
                    let handed_off = event.author != self.name;
                    yield event;
                    if handed_off {
                        return;
                    }
                }
            }

            loop {
                if ctx.is_ended() {
                    break;
                }
                let mut last: Option<Event> = None;
                let mut step = Arc::clone(&self).run_step(ctx.clone());
                while let Some(event) = step.next().await {
                    let event = event?;
                    if !event.partial {
                        last = Some(event.clone());
                    }
                    yield event;
                }
                match last {
                    Some(event) if event.author == self.name && !event.is_final_response() => {}
                    _ => break,
                }
            }
        })
    }

    fn run_live_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(try_stream! {
            let queue = ctx.live_request_queue.clone().ok_or_else(|| {
                TroupeError::InvalidState("live mode requires a live request queue".into())
            })?;
            let request = self.build_request(&ctx).await?;
            ctx.increment_llm_call_count()?;
            tracing::info!(
                invocation_id = %ctx.invocation_id,
                agent = %self.name,
                model = self.model.model_name(),
                "opening live connection"
            );
            let connection: Arc<dyn LiveConnection> = Arc::from(self.model.connect(request).await?);
            let _pump = AbortOnDrop(tokio::spawn(pump_live_requests(queue, Arc::clone(&connection))));

            let tools = self.tools_for();
            let mut responses = connection.receive();
            while let Some(response) = responses.next().await {
                let Some(event) = self.event_from_response(&ctx, &tools, response?) else {
                    continue;
                };
                let calls: Vec<FunctionCall> = if event.partial {
                    Vec::new()
                } else {
                    event.function_calls().into_iter().cloned().collect()
                };
                yield event;
                if calls.is_empty() {
                    continue;
                }

                let Some(response_event) = self.execute_function_calls(&ctx, &tools, &calls, &HashMap::new()).await? else {
                    continue;
                };
                if let Some(content) = response_event.content.clone() {
                    connection.send_content(content).await?;
                }
                yield response_event.clone();
                let mut follow_up = Arc::clone(&self).after_function_responses(ctx.clone(), calls, response_event);
                while let Some(event) = follow_up.next().await {
                    yield event?;
                }
                if ctx.is_ended() {
                    break;
                }
            }
        })
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn pump_live_requests(queue: LiveRequestQueue, connection: Arc<dyn LiveConnection>) {
    loop {
        let request = queue.get().await;
        if request.close {
            if let Err(err) = connection.close().await {
                tracing::warn!(error = %err, "failed to close live connection");
            }
            return;
        }
        let sent = match (request.content, request.blob) {
            (Some(content), _) => connection.send_content(content).await,
            (None, Some(blob)) => connection.send_realtime(blob).await,
            (None, None) => Ok(()),
        };
        if let Err(err) = sent {
            tracing::warn!(error = %err, "failed to forward live request");
            return;
        }
    }
}

impl LlmAgent {
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    fn tools_for(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools = self.tools.clone();
        if !self.sub_agents.is_empty() {
            tools.push(Arc::new(TransferToAgentTool));
        }
        tools
    }

    /// One model call plus the execution of the functions it requested.
    fn run_step(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(try_stream! {
            let request = self.build_request(&ctx).await?;
            let tools = self.tools_for();
            let cb = CallbackContext::new(&ctx).await;

            let mut model_event: Option<Event> = None;
            let mut responses = Arc::clone(&self).call_model(ctx.clone(), cb.clone(), request);
            while let Some(response) = responses.next().await {
                let Some(mut event) = self.event_from_response(&ctx, &tools, response?) else {
                    continue;
                };
                if !event.partial {
                    event.actions.merge(cb.take_actions());
                    self.save_output_to_state(&mut event);
                    model_event = Some(event.clone());
                }
                yield event;
            }

            let Some(model_event) = model_event else {
                return;
            };
            let calls: Vec<FunctionCall> = model_event.function_calls().into_iter().cloned().collect();
            if calls.is_empty() {
                return;
            }
            let Some(response_event) = self.execute_function_calls(&ctx, &tools, &calls, &HashMap::new()).await? else {
                return;
            };
            yield response_event.clone();
            let mut follow_up = Arc::clone(&self).after_function_responses(ctx.clone(), calls, response_event);
            while let Some(event) = follow_up.next().await {
                yield event?;
            }
        })
    }

    /// Confirmation/credential requests and agent transfer triggered by a
    /// function response event.
    fn after_function_responses(
        self: Arc<Self>,
        ctx: InvocationContext,
        calls: Vec<FunctionCall>,
        response_event: Event,
    ) -> EventStream {
        Box::pin(try_stream! {
            if let Some(event) = self.client_request_event(&ctx, &calls, &response_event.actions)? {
                tracing::info!(
                    invocation_id = %ctx.invocation_id,
                    agent = %self.name,
                    "waiting for client input"
                );
                yield event;
                ctx.end_invocation();
                return;
            }

            if let Some(target) = response_event.actions.transfer_to_agent.clone() {
                let agent = ctx
                    .agent_tree
                    .find_agent(&target)
                    .ok_or_else(|| TroupeError::AgentNotFound(target.clone()))?;
                tracing::info!(from = %self.name, to = %target, "transferring to agent");
                let mut events = agent.run_async(&ctx);
                while let Some(event) = events.next().await {
                    yield event?;
                }
            }
        })
    }

    /// Call the model through the model plugin callbacks.
    fn call_model(
        self: Arc<Self>,
        ctx: InvocationContext,
        cb: CallbackContext,
        mut request: LlmRequest,
    ) -> LlmResponseStream {
        Box::pin(try_stream! {
            if let Some(response) = ctx.plugin_manager.run_before_model(&cb, &mut request).await? {
                yield response;
                return;
            }

            let call_count = ctx.increment_llm_call_count()?;
            let stream = ctx.run_config.streaming_mode == StreamingMode::Sse;
            tracing::debug!(
                invocation_id = %ctx.invocation_id,
                agent = %self.name,
                model = self.model.model_name(),
                call_count,
                stream,
                "calling model"
            );

            let mut responses = match self.model.generate_content(request.clone(), stream).await {
                Ok(responses) => responses,
                Err(err) => {
                    yield self.recover_model_error(&ctx, &cb, &request, err).await?;
                    return;
                }
            };
            while let Some(response) = responses.next().await {
                let response = match response {
                    Ok(response) => response,
                    Err(err) => {
                        yield self.recover_model_error(&ctx, &cb, &request, err).await?;
                        return;
                    }
                };
                let response = ctx
                    .plugin_manager
                    .run_after_model(&cb, &response)
                    .await?
                    .unwrap_or(response);
                yield response;
            }
        })
    }

    async fn recover_model_error(
        &self,
        ctx: &InvocationContext,
        cb: &CallbackContext,
        request: &LlmRequest,
        err: TroupeError,
    ) -> Result<LlmResponse> {
        tracing::warn!(
            invocation_id = %ctx.invocation_id,
            agent = %self.name,
            error = %err,
            "model call failed"
        );
        if let Some(response) = ctx.plugin_manager.run_on_model_error(cb, request, &err).await? {
            return Ok(response);
        }
        Ok(match err {
            TroupeError::Model { code, message } => LlmResponse::error(code, message),
            other => LlmResponse::error(UNKNOWN_ERROR_CODE, other.to_string()),
        })
    }

    async fn build_request(&self, ctx: &InvocationContext) -> Result<LlmRequest> {
        let mut request = LlmRequest {
            model: Some(self.model.model_name().to_string()),
            config: self.generate_content_config.clone(),
            ..LlmRequest::default()
        };
        let state = ctx.session_state().await;
        request.append_instruction(inject_session_state(&self.instruction, &state)?);
        if !self.sub_agents.is_empty() {
            request.append_instruction(self.transfer_instruction());
        }

        let tool_ctx = ToolContext::new(CallbackContext::new(ctx).await, None, None);
        for tool in self.tools_for() {
            tool.process_llm_request(&tool_ctx, &mut request).await?;
        }

        request.contents = self.build_contents(&ctx.session_events().await);
        Ok(request)
    }

    fn transfer_instruction(&self) -> String {
        let mut instruction = String::from(
            "You can hand the conversation to one of the following agents by calling \
             `transfer_to_agent` with its name:",
        );
        for agent in &self.sub_agents {
            instruction.push_str(&format!("\n- {}: {}", agent.name(), agent.description()));
        }
        instruction
    }

    /// Conversation history as seen by this agent.
    fn build_contents(&self, events: &[Event]) -> Vec<Content> {
        events
            .iter()
            .filter(|event| !event.partial)
            .filter_map(|event| {
                let content = without_client_functions(event.content.as_ref()?)?;
                if event.author == USER_AUTHOR || event.author == self.name {
                    Some(content)
                } else {
                    Some(as_foreign_context(&event.author, &content))
                }
            })
            .collect()
    }

    fn event_from_response(
        &self,
        ctx: &InvocationContext,
        tools: &[Arc<dyn Tool>],
        response: LlmResponse,
    ) -> Option<Event> {
        let mut event = ctx.new_event();
        event.partial = response.partial;
        event.turn_complete = response.turn_complete;
        event.interrupted = response.interrupted;
        event.error_code = response.error_code;
        event.error_message = response.error_message;
        event.content = response.content.map(|mut content| {
            for part in &mut content.parts {
                if let Part::FunctionCall(call) = part {
                    if call.id.is_empty() {
                        call.id = new_function_call_id();
                    }
                }
            }
            content
        });

        if event.content.is_none()
            && event.error_code.is_none()
            && !event.turn_complete
            && !event.interrupted
        {
            return None;
        }

        if !event.partial {
            event.long_running_tool_ids = event
                .function_calls()
                .into_iter()
                .filter(|call| {
                    tools
                        .iter()
                        .any(|tool| tool.name() == call.name && tool.is_long_running())
                })
                .map(|call| call.id.clone())
                .collect();
        }
        Some(event)
    }

    fn save_output_to_state(&self, event: &mut Event) {
        let Some(key) = &self.output_key else {
            return;
        };
        if event.error_code.is_some() || !event.is_final_response() {
            return;
        }
        if let Some(text) = event.text().filter(|text| !text.is_empty()) {
            event.actions.state_delta.insert(key.clone(), Value::String(text));
        }
    }

    async fn execute_function_calls(
        &self,
        ctx: &InvocationContext,
        tools: &[Arc<dyn Tool>],
        calls: &[FunctionCall],
        confirmations: &HashMap<String, ToolConfirmation>,
    ) -> Result<Option<Event>> {
        // Calls of one step share a callback context so their state writes
        // land in a single delta instead of overwriting each other.
        let step = CallbackContext::new(ctx).await;
        let outcomes = join_all(calls.iter().map(|call| {
            self.execute_function_call(ctx, &step, tools, call, confirmations.get(&call.id).cloned())
        }))
        .await;

        let mut parts = Vec::new();
        for outcome in outcomes {
            parts.extend(outcome?);
        }
        let actions = step.take_actions();
        if parts.is_empty() && actions.is_empty() {
            return Ok(None);
        }

        let mut event = ctx.new_event().with_actions(actions);
        if !parts.is_empty() {
            event.content = Some(Content::new(Role::User, parts));
        }
        Ok(Some(event))
    }

    async fn execute_function_call(
        &self,
        ctx: &InvocationContext,
        step: &CallbackContext,
        tools: &[Arc<dyn Tool>],
        call: &FunctionCall,
        confirmation: Option<ToolConfirmation>,
    ) -> Result<Option<Part>> {
        let respond = |response: Value| {
            Part::FunctionResponse(FunctionResponse::new(&call.id, &call.name, response))
        };

        let Some(tool) = tools.iter().find(|tool| tool.name() == call.name) else {
            let available: Vec<&str> = tools.iter().map(|tool| tool.name()).collect();
            let err = TroupeError::tool(
                &call.name,
                format!("tool not found; available tools: {}", available.join(", ")),
            );
            tracing::warn!(agent = %self.name, function_call_id = %call.id, error = %err, "unknown tool");
            return Ok(Some(respond(json!({"error": err.to_string()}))));
        };

        let tool_ctx = ToolContext::new(step.clone(), Some(call.id.clone()), confirmation);
        let plugins = &ctx.plugin_manager;
        let args = &call.args;

        let result = match plugins.run_before_tool(tool.as_ref(), args, &tool_ctx).await? {
            Some(result) => result,
            None => {
                tracing::debug!(tool = tool.name(), function_call_id = %call.id, "running tool");
                match tool.run(ToolArguments::new(args.clone()), &tool_ctx).await {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::warn!(
                            tool = tool.name(),
                            function_call_id = %call.id,
                            error = %err,
                            "tool failed"
                        );
                        match plugins.run_on_tool_error(tool.as_ref(), args, &tool_ctx, &err).await? {
                            Some(result) => result,
                            None => json!({"error": err.to_string()}),
                        }
                    }
                }
            }
        };
        let result = plugins
            .run_after_tool(tool.as_ref(), args, &tool_ctx, &result)
            .await?
            .unwrap_or(result);

        if tool.is_long_running() && result.is_null() {
            return Ok(None);
        }
        let response = if result.is_object() {
            result
        } else {
            json!({"result": result})
        };
        Ok(Some(respond(response)))
    }

    /// Client-side function calls for pending confirmations and credentials.
    fn client_request_event(
        &self,
        ctx: &InvocationContext,
        calls: &[FunctionCall],
        actions: &EventActions,
    ) -> Result<Option<Event>> {
        let mut parts = Vec::new();
        for call in calls {
            if let Some(confirmation) = actions.requested_tool_confirmations.get(&call.id) {
                let args = json!({
                    "original_function_call": serde_json::to_value(call)?,
                    "tool_confirmation": serde_json::to_value(confirmation)?,
                });
                parts.push(FunctionCall::new(new_function_call_id(), REQUEST_CONFIRMATION, args));
            }
            if let Some(auth_config) = actions.requested_auth_configs.get(&call.id) {
                let args = json!({
                    "function_call_id": call.id,
                    "auth_config": serde_json::to_value(auth_config)?,
                });
                parts.push(FunctionCall::new(new_function_call_id(), REQUEST_CREDENTIAL, args));
            }
        }
        if parts.is_empty() {
            return Ok(None);
        }

        let mut event = ctx.new_event();
        event.long_running_tool_ids = parts.iter().map(|call| call.id.clone()).collect();
        event.content = Some(Content::new(
            Role::Model,
            parts.into_iter().map(Part::FunctionCall).collect(),
        ));
        Ok(Some(event))
    }

    /// Re-run tool calls whose confirmation the latest user event answers.
    async fn resume_confirmed_calls(
        &self,
        ctx: &InvocationContext,
    ) -> Result<Option<(Vec<FunctionCall>, Event)>> {
        let events = ctx.session_events().await;
        let Some(last) = events.last() else {
            return Ok(None);
        };
        if last.author != USER_AUTHOR {
            return Ok(None);
        }

        let mut originals = Vec::new();
        let mut confirmations = HashMap::new();
        for response in last.function_responses() {
            if response.name != REQUEST_CONFIRMATION {
                continue;
            }
            let request = events
                .iter()
                .rev()
                .filter(|event| event.author == self.name)
                .flat_map(|event| event.function_calls())
                .find(|call| call.id == response.id && call.name == REQUEST_CONFIRMATION);
            let Some(request) = request else {
                continue;
            };
            let Some(original) = request
                .args
                .get("original_function_call")
                .cloned()
                .and_then(|value| serde_json::from_value::<FunctionCall>(value).ok())
            else {
                continue;
            };
            confirmations.insert(original.id.clone(), parse_confirmation(&response.response)?);
            originals.push(original);
        }
        if originals.is_empty() {
            return Ok(None);
        }

        tracing::info!(
            invocation_id = %ctx.invocation_id,
            agent = %self.name,
            calls = originals.len(),
            "resuming confirmed tool calls"
        );
        let tools = self.tools_for();
        let event = self
            .execute_function_calls(ctx, &tools, &originals, &confirmations)
            .await?;
        Ok(event.map(|event| (originals, event)))
    }
}

/// The client answers either with the confirmation itself or with a
/// JSON-encoded confirmation under `response`.
fn parse_confirmation(response: &Value) -> Result<ToolConfirmation> {
    let value = match response.get("response").and_then(Value::as_str) {
        Some(encoded) => serde_json::from_str(encoded)?,
        None => response.clone(),
    };
    serde_json::from_value(value).map_err(|err| {
        TroupeError::InvalidArgument(format!("invalid tool confirmation: {err}"))
    })
}

fn is_client_function(name: &str) -> bool {
    name == REQUEST_CONFIRMATION || name == REQUEST_CREDENTIAL
}

/// Drop client-side function parts; `None` when nothing remains.
fn without_client_functions(content: &Content) -> Option<Content> {
    let parts: Vec<Part> = content
        .parts
        .iter()
        .filter(|part| match part {
            Part::FunctionCall(call) => !is_client_function(&call.name),
            Part::FunctionResponse(response) => !is_client_function(&response.name),
            _ => true,
        })
        .cloned()
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(Content::new(content.role, parts))
    }
}

/// Present another agent's turn as user-provided context.
fn as_foreign_context(author: &str, content: &Content) -> Content {
    let mut parts = vec![Part::text("For context:")];
    for part in &content.parts {
        parts.push(match part {
            Part::Text { text } if !text.is_empty() => Part::text(format!("[{author}] said: {text}")),
            Part::FunctionCall(call) => Part::text(format!(
                "[{author}] called tool `{}` with parameters: {}",
                call.name, call.args
            )),
            Part::FunctionResponse(response) => Part::text(format!(
                "[{author}] `{}` tool returned result: {}",
                response.name, response.response
            )),
            other => other.clone(),
        });
    }
    Content::new(Role::User, parts)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_state_name(name: &str) -> bool {
    match name.split_once(':') {
        Some((prefix, rest)) => matches!(prefix, "app" | "user" | "temp") && is_identifier(rest),
        None => is_identifier(name),
    }
}

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{+[^{}]*\}+").expect("state placeholder regex must compile")
});

/// Replace `{key}` placeholders with session state values.
pub fn inject_session_state(template: &str, state: &StateMap) -> Result<String> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for found in PLACEHOLDER_RE.find_iter(template) {
        rendered.push_str(&template[last..found.start()]);
        last = found.end();

        let raw = found.as_str();
        let name = raw.trim_matches(|c| c == '{' || c == '}').trim();
        let (name, optional) = match name.strip_suffix('?') {
            Some(name) => (name, true),
            None => (name, false),
        };
        if !is_state_name(name) {
            rendered.push_str(raw);
            continue;
        }
        match state.get(name) {
            Some(Value::String(text)) => rendered.push_str(text),
            Some(value) => rendered.push_str(&value.to_string()),
            None if optional => {}
            None => {
                return Err(TroupeError::InvalidState(format!(
                    "Context variable not found: `{name}`"
                )))
            }
        }
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}
