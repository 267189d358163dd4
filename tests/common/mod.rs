//! Shared test helpers: scripted model client, scripted agents and a
//! recording plugin.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use troupe::agents::{Agent, CallbackContext, EventStream, InvocationContext, ToolContext};
use troupe::error::{Result, TroupeError};
use troupe::events::{Event, EventActions};
use troupe::models::{LiveConnection, LlmRequest, LlmResponse, LlmResponseStream, ModelClient};
use troupe::plugins::Plugin;
use troupe::tools::Tool;
use troupe::types::{Blob, Content, FunctionCall, Part, Role};

/// A model client that replays queued responses, one batch per call.
pub struct MockModel {
    name: String,
    responses: Mutex<VecDeque<Result<Vec<LlmResponse>>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockModel {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Queue a text response.
    pub fn queue_text(&self, text: &str) {
        self.responses
            .lock()
            .push_back(Ok(vec![LlmResponse::text(text)]));
    }

    /// Queue streamed chunks followed by the aggregated final response.
    pub fn queue_stream(&self, chunks: &[&str]) {
        let mut batch: Vec<LlmResponse> = chunks
            .iter()
            .map(|chunk| LlmResponse::partial_text(*chunk))
            .collect();
        batch.push(LlmResponse::text(chunks.concat()));
        self.responses.lock().push_back(Ok(batch));
    }

    /// Queue a tool call response.
    pub fn queue_tool_call(&self, id: &str, name: &str, args: Value) {
        self.queue_tool_calls(vec![(id, name, args)]);
    }

    /// Queue one response carrying several tool calls.
    pub fn queue_tool_calls(&self, calls: Vec<(&str, &str, Value)>) {
        let parts = calls
            .into_iter()
            .map(|(id, name, args)| Part::FunctionCall(FunctionCall::new(id, name, args)))
            .collect();
        let content = Content::new(Role::Model, parts);
        self.responses
            .lock()
            .push_back(Ok(vec![LlmResponse::from_content(content)]));
    }

    /// Queue a failing call.
    pub fn queue_error(&self, code: &str, message: &str) {
        self.responses
            .lock()
            .push_back(Err(TroupeError::model(code, message)));
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ModelClient for MockModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn generate_content(&self, request: LlmRequest, _stream: bool) -> Result<LlmResponseStream> {
        self.requests.lock().push(request);
        let next = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(vec![LlmResponse::text("no more scripted responses")]));
        let batch = next?;
        Ok(stream::iter(batch.into_iter().map(Ok)).boxed())
    }

    async fn connect(&self, request: LlmRequest) -> Result<Box<dyn LiveConnection>> {
        self.requests.lock().push(request);
        Ok(Box::new(EchoConnection::new()))
    }
}

/// Live connection answering every content turn with `echo: <text>`.
pub struct EchoConnection {
    sender: Mutex<Option<mpsc::UnboundedSender<LlmResponse>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<LlmResponse>>>,
}

impl EchoConnection {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl LiveConnection for EchoConnection {
    async fn send_content(&self, content: Content) -> Result<()> {
        let text = content.text();
        if text.is_empty() {
            return Ok(());
        }
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(LlmResponse::text(format!("echo: {text}")));
        }
        Ok(())
    }

    async fn send_realtime(&self, _blob: Blob) -> Result<()> {
        Ok(())
    }

    fn receive(&self) -> LlmResponseStream {
        match self.receiver.lock().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|response| (Ok(response), rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }

    async fn close(&self) -> Result<()> {
        self.sender.lock().take();
        Ok(())
    }
}

/// Agent yielding one text event per scripted line.
pub struct ScriptedAgent {
    name: String,
    lines: Vec<String>,
    escalate_at: Option<usize>,
    state_delta: Vec<(String, Value)>,
    delay: Option<Duration>,
    runs: Arc<AtomicUsize>,
}

impl ScriptedAgent {
    pub fn new(name: &str, lines: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            lines: lines.iter().map(|line| line.to_string()).collect(),
            escalate_at: None,
            state_delta: Vec::new(),
            delay: None,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Mark the event for line `index` with `escalate`.
    pub fn escalating_at(mut self, index: usize) -> Self {
        self.escalate_at = Some(index);
        self
    }

    /// Attach a state write to the first event.
    pub fn writing(mut self, key: &str, value: Value) -> Self {
        self.state_delta.push((key.to_string(), value));
        self
    }

    /// Sleep before each event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }

    pub fn shared(self) -> Arc<dyn Agent> {
        Arc::new(self)
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(try_stream! {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for (index, line) in self.lines.iter().enumerate() {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                let mut actions = EventActions::default();
                if index == 0 {
                    actions.state_delta.extend(self.state_delta.iter().cloned());
                }
                if self.escalate_at == Some(index) {
                    actions.escalate = Some(true);
                }
                yield ctx
                    .new_event()
                    .with_content(Content::model(line.clone()))
                    .with_actions(actions);
            }
        })
    }

    fn run_live_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        self.run_impl(ctx)
    }
}

/// Agent whose stream fails after its first event.
pub struct FailingAgent {
    pub name: String,
}

impl Agent for FailingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(try_stream! {
            yield ctx.new_event().with_content(Content::model("before failure"));
            Err(TroupeError::InvalidState("scripted failure".into()))?;
        })
    }
}

/// Shared, ordered log of `plugin:callback` entries.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Plugin recording every callback it receives, with optional overrides.
pub struct RecordingPlugin {
    name: String,
    log: CallLog,
    pub before_run: Option<Content>,
    pub on_user_message: Option<Content>,
    pub before_agent: Option<(String, Content)>,
    pub before_model: Option<LlmResponse>,
    pub on_event_text: Option<String>,
    pub fail_on_user_message: bool,
}

impl RecordingPlugin {
    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            before_run: None,
            on_user_message: None,
            before_agent: None,
            before_model: None,
            on_event_text: None,
            fail_on_user_message: false,
        }
    }

    fn record(&self, callback: &str) {
        self.log.lock().push(format!("{}:{callback}", self.name));
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_user_message(&self, _ctx: &InvocationContext, _message: &Content) -> Result<Option<Content>> {
        self.record("on_user_message");
        if self.fail_on_user_message {
            return Err(TroupeError::InvalidState("plugin exploded".into()));
        }
        Ok(self.on_user_message.clone())
    }

    async fn before_run(&self, _ctx: &InvocationContext) -> Result<Option<Content>> {
        self.record("before_run");
        Ok(self.before_run.clone())
    }

    async fn after_run(&self, _ctx: &InvocationContext) -> Result<()> {
        self.record("after_run");
        Ok(())
    }

    async fn on_event(&self, _ctx: &InvocationContext, event: &Event) -> Result<Option<Event>> {
        self.record("on_event");
        Ok(self.on_event_text.as_ref().map(|text| {
            let mut replaced = event.clone();
            replaced.content = Some(Content::model(text.clone()));
            replaced
        }))
    }

    async fn before_agent(&self, agent: &dyn Agent, _ctx: &CallbackContext) -> Result<Option<Content>> {
        self.record(&format!("before_agent({})", agent.name()));
        Ok(self
            .before_agent
            .as_ref()
            .filter(|(target, _)| target == agent.name())
            .map(|(_, content)| content.clone()))
    }

    async fn after_agent(&self, agent: &dyn Agent, _ctx: &CallbackContext) -> Result<Option<Content>> {
        self.record(&format!("after_agent({})", agent.name()));
        Ok(None)
    }

    async fn before_model(&self, _ctx: &CallbackContext, _request: &mut LlmRequest) -> Result<Option<LlmResponse>> {
        self.record("before_model");
        Ok(self.before_model.clone())
    }

    async fn after_model(&self, _ctx: &CallbackContext, _response: &LlmResponse) -> Result<Option<LlmResponse>> {
        self.record("after_model");
        Ok(None)
    }

    async fn on_model_error(
        &self,
        _ctx: &CallbackContext,
        _request: &LlmRequest,
        _error: &TroupeError,
    ) -> Result<Option<LlmResponse>> {
        self.record("on_model_error");
        Ok(None)
    }

    async fn before_tool(&self, tool: &dyn Tool, _args: &Value, _ctx: &ToolContext) -> Result<Option<Value>> {
        self.record(&format!("before_tool({})", tool.name()));
        Ok(None)
    }

    async fn after_tool(
        &self,
        tool: &dyn Tool,
        _args: &Value,
        _ctx: &ToolContext,
        _result: &Value,
    ) -> Result<Option<Value>> {
        self.record(&format!("after_tool({})", tool.name()));
        Ok(None)
    }

    async fn on_tool_error(
        &self,
        tool: &dyn Tool,
        _args: &Value,
        _ctx: &ToolContext,
        _error: &TroupeError,
    ) -> Result<Option<Value>> {
        self.record(&format!("on_tool_error({})", tool.name()));
        Ok(None)
    }
}

/// Drain a run, failing the test on the first error.
pub async fn collect(mut events: futures::stream::BoxStream<'static, Result<Event>>) -> Vec<Event> {
    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        collected.push(event.expect("event stream failed"));
    }
    collected
}

/// Drain a run, keeping the events before the first error and the error.
pub async fn collect_until_error(
    mut events: futures::stream::BoxStream<'static, Result<Event>>,
) -> (Vec<Event>, Option<TroupeError>) {
    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => collected.push(event),
            Err(err) => return (collected, Some(err)),
        }
    }
    (collected, None)
}

/// Text of each event, in order.
pub fn texts(events: &[Event]) -> Vec<String> {
    events.iter().filter_map(Event::text).collect()
}
