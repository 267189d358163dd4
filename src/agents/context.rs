//! Contexts threaded through agents, plugins and tools.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::{Agent, AgentTree};
use crate::config::RunConfig;
use crate::error::{Result, TroupeError};
use crate::events::{AuthConfig, Event, EventActions, ToolConfirmation};
use crate::live::LiveRequestQueue;
use crate::plugins::PluginManager;
use crate::services::{
    ArtifactKey, ArtifactService, MemoryService, SearchMemoryRequest, SearchMemoryResponse,
};
use crate::session::{SessionService, SharedSession};
use crate::state::{State, StateMap};
use crate::types::{Content, Part};

/// Generate a new invocation id.
pub fn new_invocation_id() -> String {
    format!("e-{}", Uuid::new_v4())
}

/// Tracks LLM calls made during one invocation.
#[derive(Debug)]
pub struct InvocationCostManager {
    max_llm_calls: usize,
    llm_calls: AtomicUsize,
}

impl InvocationCostManager {
    /// `max_llm_calls == 0` disables the limit.
    pub fn new(max_llm_calls: usize) -> Self {
        Self {
            max_llm_calls,
            llm_calls: AtomicUsize::new(0),
        }
    }

    /// Count one call, failing once the configured ceiling is passed.
    pub fn increment_and_enforce(&self) -> Result<usize> {
        let count = self.llm_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_llm_calls > 0 && count > self.max_llm_calls {
            return Err(TroupeError::LlmCallLimitExceeded {
                limit: self.max_llm_calls,
            });
        }
        Ok(count)
    }

    pub fn llm_calls(&self) -> usize {
        self.llm_calls.load(Ordering::SeqCst)
    }
}

/// Per-invocation context shared by every agent of the run.
///
/// Clones share the session, the cost manager and the end-of-invocation
/// flag; `agent` and `branch` are per clone.
#[derive(Clone)]
pub struct InvocationContext {
    pub invocation_id: String,
    pub branch: Option<String>,
    pub agent: Arc<dyn Agent>,
    pub session: SharedSession,
    pub session_service: Arc<dyn SessionService>,
    pub artifact_service: Option<Arc<dyn ArtifactService>>,
    pub memory_service: Option<Arc<dyn MemoryService>>,
    pub plugin_manager: Arc<PluginManager>,
    pub agent_tree: Arc<AgentTree>,
    pub user_content: Option<Content>,
    pub run_config: RunConfig,
    pub live_request_queue: Option<LiveRequestQueue>,
    cost_manager: Arc<InvocationCostManager>,
    end_invocation: Arc<AtomicBool>,
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field("agent", &self.agent.name())
            .field("branch", &self.branch)
            .field("llm_calls", &self.cost_manager.llm_calls())
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}

impl InvocationContext {
    pub fn new(
        agent: Arc<dyn Agent>,
        agent_tree: Arc<AgentTree>,
        session: SharedSession,
        session_service: Arc<dyn SessionService>,
        plugin_manager: Arc<PluginManager>,
        run_config: RunConfig,
    ) -> Self {
        let cost_manager = Arc::new(InvocationCostManager::new(run_config.max_llm_calls));
        Self {
            invocation_id: new_invocation_id(),
            branch: None,
            agent,
            session,
            session_service,
            artifact_service: None,
            memory_service: None,
            plugin_manager,
            agent_tree,
            user_content: None,
            run_config,
            live_request_queue: None,
            cost_manager,
            end_invocation: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clone for running `agent`.
    pub fn for_agent(&self, agent: Arc<dyn Agent>) -> Self {
        let mut ctx = self.clone();
        ctx.agent = agent;
        ctx
    }

    /// Clone running on `branch`.
    pub fn with_branch(&self, branch: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.branch = Some(branch.into());
        ctx
    }

    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    pub fn increment_llm_call_count(&self) -> Result<usize> {
        self.cost_manager.increment_and_enforce()
    }

    pub fn llm_call_count(&self) -> usize {
        self.cost_manager.llm_calls()
    }

    /// Stop the invocation after the current event.
    pub fn end_invocation(&self) {
        self.end_invocation.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.end_invocation.load(Ordering::SeqCst)
    }

    /// Copy of the current session state.
    pub async fn session_state(&self) -> StateMap {
        self.session.read().await.state.clone()
    }

    /// Copy of the session events visible from this context's branch.
    pub async fn session_events(&self) -> Vec<Event> {
        let session = self.session.read().await;
        session
            .events
            .iter()
            .filter(|event| event.is_visible_to_branch(self.branch.as_deref()))
            .cloned()
            .collect()
    }

    /// Application, user and session ids.
    pub async fn session_key(&self) -> (String, String, String) {
        let session = self.session.read().await;
        (
            session.app_name.clone(),
            session.user_id.clone(),
            session.id.clone(),
        )
    }

    /// A new event authored by the current agent on the current branch.
    pub fn new_event(&self) -> Event {
        Event::new(self.invocation_id.clone(), self.agent.name()).with_branch(self.branch.clone())
    }
}

#[derive(Debug, Default)]
struct CallbackState {
    state: State,
    actions: EventActions,
}

/// Context handed to agent, model and plugin callbacks.
///
/// Clones share the same pending state delta and actions.
#[derive(Clone)]
pub struct CallbackContext {
    invocation: InvocationContext,
    inner: Arc<Mutex<CallbackState>>,
}

impl std::fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackContext")
            .field("invocation_id", &self.invocation.invocation_id)
            .field("agent", &self.invocation.agent.name())
            .finish_non_exhaustive()
    }
}

impl CallbackContext {
    /// Snapshot the session state of `invocation`.
    pub async fn new(invocation: &InvocationContext) -> Self {
        let value = invocation.session_state().await;
        Self {
            invocation: invocation.clone(),
            inner: Arc::new(Mutex::new(CallbackState {
                state: State::new(value, StateMap::new()),
                actions: EventActions::default(),
            })),
        }
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation.invocation_id
    }

    pub fn agent_name(&self) -> &str {
        self.invocation.agent_name()
    }

    pub fn branch(&self) -> Option<&str> {
        self.invocation.branch.as_deref()
    }

    pub fn user_content(&self) -> Option<&Content> {
        self.invocation.user_content.as_ref()
    }

    /// Copy of the state, including writes made through this context.
    pub fn state(&self) -> State {
        self.inner.lock().state.clone()
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.inner.lock().state.get(key).cloned()
    }

    pub fn get_state_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.inner.lock().state.get_as(key)
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().state.set(key, value);
    }

    /// Mutate the pending event actions.
    pub fn update_actions<R>(&self, f: impl FnOnce(&mut EventActions) -> R) -> R {
        f(&mut self.inner.lock().actions)
    }

    /// Pending actions, with state writes folded into the state delta.
    pub fn actions(&self) -> EventActions {
        let inner = self.inner.lock();
        let mut actions = inner.actions.clone();
        actions.state_delta.extend(inner.state.delta().clone());
        actions
    }

    /// Drain the pending actions so a later event does not repeat them.
    pub fn take_actions(&self) -> EventActions {
        let mut inner = self.inner.lock();
        let mut actions = std::mem::take(&mut inner.actions);
        actions.state_delta.extend(inner.state.take_delta());
        actions
    }

    async fn artifact_target(&self, filename: &str) -> Result<(Arc<dyn ArtifactService>, ArtifactKey)> {
        let service = self
            .invocation
            .artifact_service
            .clone()
            .ok_or_else(|| TroupeError::Configuration("artifact service is not configured".into()))?;
        let (app_name, user_id, session_id) = self.invocation.session_key().await;
        Ok((
            service,
            ArtifactKey {
                app_name,
                user_id,
                session_id,
                filename: filename.to_string(),
            },
        ))
    }

    /// Save an artifact and record the new version in the pending actions.
    pub async fn save_artifact(&self, filename: &str, artifact: Part) -> Result<i64> {
        let (service, key) = self.artifact_target(filename).await?;
        let version = service.save_artifact(&key, artifact).await?;
        self.update_actions(|actions| {
            actions.artifact_delta.insert(filename.to_string(), version);
        });
        Ok(version)
    }

    pub async fn load_artifact(&self, filename: &str, version: Option<i64>) -> Result<Option<Part>> {
        let (service, key) = self.artifact_target(filename).await?;
        service.load_artifact(&key, version).await
    }

    pub async fn list_artifacts(&self) -> Result<Vec<String>> {
        let (service, key) = self.artifact_target("").await?;
        service
            .list_artifact_keys(&key.app_name, &key.user_id, &key.session_id)
            .await
    }
}

/// Context for one tool invocation.
#[derive(Clone, Debug)]
pub struct ToolContext {
    callback: CallbackContext,
    function_call_id: Option<String>,
    tool_confirmation: Option<ToolConfirmation>,
}

impl Deref for ToolContext {
    type Target = CallbackContext;

    fn deref(&self) -> &Self::Target {
        &self.callback
    }
}

impl ToolContext {
    pub fn new(
        callback: CallbackContext,
        function_call_id: Option<String>,
        tool_confirmation: Option<ToolConfirmation>,
    ) -> Self {
        Self {
            callback,
            function_call_id,
            tool_confirmation,
        }
    }

    pub fn function_call_id(&self) -> Option<&str> {
        self.function_call_id.as_deref()
    }

    /// Confirmation supplied by the client when this call is resumed.
    pub fn tool_confirmation(&self) -> Option<&ToolConfirmation> {
        self.tool_confirmation.as_ref()
    }

    fn require_call_id(&self) -> Result<String> {
        self.function_call_id
            .clone()
            .ok_or_else(|| TroupeError::InvalidState("function_call_id is not set".into()))
    }

    /// Ask the client to confirm this call before it proceeds.
    pub fn request_confirmation(&self, hint: impl Into<String>, payload: Option<Value>) -> Result<()> {
        let call_id = self.require_call_id()?;
        let confirmation = ToolConfirmation {
            payload,
            ..ToolConfirmation::pending(hint)
        };
        tracing::debug!(function_call_id = %call_id, "tool confirmation requested");
        self.update_actions(|actions| {
            actions
                .requested_tool_confirmations
                .insert(call_id, confirmation);
        });
        Ok(())
    }

    /// Ask the client for credentials before this call proceeds.
    pub fn request_credential(&self, auth_config: AuthConfig) -> Result<()> {
        let call_id = self.require_call_id()?;
        self.update_actions(|actions| {
            actions.requested_auth_configs.insert(call_id, auth_config);
        });
        Ok(())
    }

    pub async fn search_memory(&self, query: impl Into<String>) -> Result<SearchMemoryResponse> {
        let service = self
            .invocation()
            .memory_service
            .clone()
            .ok_or_else(|| TroupeError::Configuration("memory service is not configured".into()))?;
        let (app_name, user_id, _) = self.invocation().session_key().await;
        service
            .search_memory(SearchMemoryRequest {
                app_name,
                user_id,
                query: query.into(),
            })
            .await
    }
}
