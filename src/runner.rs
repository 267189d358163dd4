//! Top-level invocation loop.
//!
//! A [`Runner`] takes a user message, consults the plugins, drives the agent
//! that should receive the turn and appends every non-partial event to the
//! session before handing it to the caller.

use std::ops::Deref;
use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::RwLock;

use crate::agents::{Agent, AgentTree, InvocationContext};
use crate::config::{RunConfig, RunnerConfig, StreamingMode};
use crate::error::{Result, TroupeError};
use crate::events::{Event, USER_AUTHOR};
use crate::live::LiveRequestQueue;
use crate::plugins::{Plugin, PluginManager};
use crate::services::{ArtifactService, MemoryService};
use crate::session::{InMemorySessionService, Session, SessionService, SharedSession};
use crate::types::Content;

/// Drives an agent tree against a session service.
#[derive(Clone)]
pub struct Runner {
    agent: Arc<dyn Agent>,
    agent_tree: Arc<AgentTree>,
    session_service: Arc<dyn SessionService>,
    artifact_service: Option<Arc<dyn ArtifactService>>,
    memory_service: Option<Arc<dyn MemoryService>>,
    plugin_manager: Arc<PluginManager>,
    config: RunnerConfig,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("app_name", &self.config.app_name)
            .field("agent", &self.agent.name())
            .field("plugins", &self.plugin_manager)
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(
        app_name: impl Into<String>,
        agent: Arc<dyn Agent>,
        session_service: Arc<dyn SessionService>,
    ) -> Result<Self> {
        Self::with_config(RunnerConfig::new(app_name), agent, session_service)
    }

    /// Build a runner; fails when the agent tree has duplicate names.
    pub fn with_config(
        config: RunnerConfig,
        agent: Arc<dyn Agent>,
        session_service: Arc<dyn SessionService>,
    ) -> Result<Self> {
        let agent_tree = Arc::new(AgentTree::new(Arc::clone(&agent))?);
        Ok(Self {
            agent,
            agent_tree,
            session_service,
            artifact_service: None,
            memory_service: None,
            plugin_manager: Arc::new(PluginManager::new()),
            config,
        })
    }

    /// Register a plugin; fails on duplicates.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Result<Self> {
        Arc::make_mut(&mut self.plugin_manager).register_plugin(plugin)?;
        Ok(self)
    }

    pub fn with_plugins(
        mut self,
        plugins: impl IntoIterator<Item = Arc<dyn Plugin>>,
    ) -> Result<Self> {
        for plugin in plugins {
            self = self.with_plugin(plugin)?;
        }
        Ok(self)
    }

    pub fn with_artifact_service(mut self, service: Arc<dyn ArtifactService>) -> Self {
        self.artifact_service = Some(service);
        self
    }

    pub fn with_memory_service(mut self, service: Arc<dyn MemoryService>) -> Self {
        self.memory_service = Some(service);
        self
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn agent_tree(&self) -> &Arc<AgentTree> {
        &self.agent_tree
    }

    pub fn plugin_manager(&self) -> &Arc<PluginManager> {
        &self.plugin_manager
    }

    pub fn session_service(&self) -> &Arc<dyn SessionService> {
        &self.session_service
    }

    /// Run one user turn in batch mode.
    ///
    /// Non-partial events are appended to the session before they are
    /// yielded. `after_run` fires once the agent stream ends, also when it
    /// fails.
    pub fn run_async(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        new_message: Content,
        run_config: Option<RunConfig>,
    ) -> BoxStream<'static, Result<Event>> {
        let run_config = run_config.unwrap_or_else(|| self.config.run.clone());
        self.clone().invoke(
            user_id.into(),
            session_id.into(),
            Some(new_message),
            None,
            run_config,
        )
    }

    /// Run in live mode, reading input from `queue`.
    pub fn run_live(
        &self,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        queue: LiveRequestQueue,
        run_config: Option<RunConfig>,
    ) -> BoxStream<'static, Result<Event>> {
        let mut run_config = run_config.unwrap_or_else(|| self.config.run.clone());
        run_config.streaming_mode = StreamingMode::Bidi;
        self.clone().invoke(
            user_id.into(),
            session_id.into(),
            None,
            Some(queue),
            run_config,
        )
    }

    fn invoke(
        self,
        user_id: String,
        session_id: String,
        new_message: Option<Content>,
        queue: Option<LiveRequestQueue>,
        run_config: RunConfig,
    ) -> BoxStream<'static, Result<Event>> {
        Box::pin(try_stream! {
            let live = queue.is_some();
            let session = self.load_session(&user_id, &session_id).await?;
            let shared: SharedSession = Arc::new(RwLock::new(session));

            let mut ctx = InvocationContext::new(
                Arc::clone(&self.agent),
                Arc::clone(&self.agent_tree),
                Arc::clone(&shared),
                Arc::clone(&self.session_service),
                Arc::clone(&self.plugin_manager),
                run_config,
            );
            ctx.artifact_service = self.artifact_service.clone();
            ctx.memory_service = self.memory_service.clone();
            ctx.live_request_queue = queue;

            tracing::info!(
                invocation_id = %ctx.invocation_id,
                app_name = %self.config.app_name,
                user_id = %user_id,
                session_id = %session_id,
                live,
                "invocation started"
            );

            if let Some(message) = new_message {
                let message = self
                    .plugin_manager
                    .run_on_user_message(&ctx, &message)
                    .await?
                    .unwrap_or(message);
                ctx.user_content = Some(message.clone());
                let event = Event::new(ctx.invocation_id.clone(), USER_AUTHOR).with_content(message);
                self.append(&shared, event).await?;
            }

            let agent = {
                let session = shared.read().await;
                self.determine_agent_for_resumption(&session)
            };
            let ctx = ctx.for_agent(agent);

            if let Some(content) = self.plugin_manager.run_before_run(&ctx).await? {
                tracing::debug!(invocation_id = %ctx.invocation_id, "invocation short-circuited by before_run");
                let event = ctx.new_event().with_content(content);
                let stored = self.append(&shared, event).await;
                let after = self.plugin_manager.run_after_run(&ctx).await;
                yield stored?;
                after?;
                return;
            }

            let mut events = if live {
                Arc::clone(&ctx.agent).run_live(&ctx)
            } else {
                Arc::clone(&ctx.agent).run_async(&ctx)
            };
            let mut failure = None;
            while let Some(item) = events.next().await {
                let processed = match item {
                    Ok(event) => self.process_event(&ctx, &shared, event).await,
                    Err(err) => Err(err),
                };
                match processed {
                    Ok(event) => yield event,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            drop(events);

            let after = self.plugin_manager.run_after_run(&ctx).await;
            if let Some(err) = failure {
                tracing::warn!(invocation_id = %ctx.invocation_id, error = %err, "invocation failed");
                Err::<(), TroupeError>(err)?;
            }
            after?;
            tracing::info!(
                invocation_id = %ctx.invocation_id,
                llm_calls = ctx.llm_call_count(),
                "invocation completed"
            );
        })
    }

    async fn load_session(&self, user_id: &str, session_id: &str) -> Result<Session> {
        let app_name = &self.config.app_name;
        if let Some(session) = self
            .session_service
            .get_session(app_name, user_id, session_id, None)
            .await?
        {
            return Ok(session);
        }
        if !self.config.auto_create_session {
            return Err(TroupeError::SessionNotFound(session_id.to_string()));
        }
        tracing::debug!(app_name = %app_name, user_id, session_id, "creating session on first use");
        self.session_service
            .create_session(app_name, user_id, None, Some(session_id.to_string()))
            .await
    }

    /// Let plugins replace the event, then persist it unless partial.
    async fn process_event(
        &self,
        ctx: &InvocationContext,
        shared: &SharedSession,
        event: Event,
    ) -> Result<Event> {
        let event = self
            .plugin_manager
            .run_on_event(ctx, &event)
            .await?
            .unwrap_or(event);
        if event.partial {
            return Ok(event);
        }
        self.append(shared, event).await
    }

    async fn append(&self, shared: &SharedSession, event: Event) -> Result<Event> {
        let mut session = shared.write().await;
        self.session_service.append_event(&mut session, event).await
    }

    /// Pick the agent that should receive the next turn of `session`.
    ///
    /// A trailing function response goes back to the agent that issued the
    /// matching call. Otherwise the most recent non-user author still in the
    /// tree wins, provided control can be transferred back to it. Falls back
    /// to the root agent.
    pub fn determine_agent_for_resumption(&self, session: &Session) -> Arc<dyn Agent> {
        let root = self.agent_tree.root();

        if let Some(author) = function_call_author_for_last_response(&session.events) {
            if let Some(agent) = self.agent_tree.find_agent(author) {
                tracing::debug!(agent = agent.name(), "resuming agent awaiting function response");
                return agent;
            }
        }

        for event in session.events.iter().rev() {
            if event.author == USER_AUTHOR {
                continue;
            }
            if event.author == root.name() {
                return Arc::clone(root);
            }
            let Some(agent) = self.agent_tree.find_agent(&event.author) else {
                tracing::debug!(author = %event.author, "event author is not in the agent tree");
                continue;
            };
            if self.agent_tree.is_transferable(agent.name()) {
                return agent;
            }
        }
        Arc::clone(root)
    }
}

/// Author of the function call answered by the last event, if it answers one.
fn function_call_author_for_last_response(events: &[Event]) -> Option<&str> {
    let last = events.last()?;
    let response_id = last.function_responses().first()?.id.clone();
    events
        .iter()
        .rev()
        .skip(1)
        .find(|event| {
            event
                .function_calls()
                .iter()
                .any(|call| call.id == response_id)
        })
        .map(|event| event.author.as_str())
}

/// A [`Runner`] backed by an [`InMemorySessionService`].
#[derive(Debug, Clone)]
pub struct InMemoryRunner {
    runner: Runner,
    session_service: Arc<InMemorySessionService>,
}

impl InMemoryRunner {
    pub fn new(app_name: impl Into<String>, agent: Arc<dyn Agent>) -> Result<Self> {
        let session_service = Arc::new(InMemorySessionService::new());
        let runner = Runner::new(app_name, agent, session_service.clone())?;
        Ok(Self {
            runner,
            session_service,
        })
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Result<Self> {
        self.runner = self.runner.with_plugin(plugin)?;
        Ok(self)
    }

    /// The concrete in-memory store, for creating and inspecting sessions.
    pub fn sessions(&self) -> &Arc<InMemorySessionService> {
        &self.session_service
    }

    pub fn into_runner(self) -> Runner {
        self.runner
    }
}

impl Deref for InMemoryRunner {
    type Target = Runner;

    fn deref(&self) -> &Self::Target {
        &self.runner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{EventStream, SequentialAgent};
    use crate::types::{FunctionCall, FunctionResponse, Part, Role};
    use futures::stream;

    struct Quiet {
        name: &'static str,
        sticky: bool,
    }

    impl Agent for Quiet {
        fn name(&self) -> &str {
            self.name
        }

        fn disallow_transfer_to_parent(&self) -> bool {
            self.sticky
        }

        fn run_impl(self: Arc<Self>, _ctx: InvocationContext) -> EventStream {
            stream::empty().boxed()
        }
    }

    fn runner() -> InMemoryRunner {
        let helper: Arc<dyn Agent> = Arc::new(Quiet { name: "helper", sticky: false });
        let sticky: Arc<dyn Agent> = Arc::new(Quiet { name: "sticky", sticky: true });
        let root: Arc<dyn Agent> = Arc::new(SequentialAgent::new("root", vec![helper, sticky]));
        InMemoryRunner::new("app", root).unwrap()
    }

    fn session(events: Vec<Event>) -> Session {
        Session {
            id: "s".to_string(),
            app_name: "app".to_string(),
            user_id: "u".to_string(),
            state: Default::default(),
            events,
            last_update_time: chrono::Utc::now(),
        }
    }

    fn text_event(author: &str) -> Event {
        Event::new("inv", author).with_content(Content::model("hi"))
    }

    #[test]
    fn empty_session_resumes_root() {
        let runner = runner();
        assert_eq!(runner.determine_agent_for_resumption(&session(vec![])).name(), "root");
    }

    #[test]
    fn last_transferable_author_is_resumed() {
        let runner = runner();
        let events = vec![text_event("helper"), text_event(USER_AUTHOR)];
        assert_eq!(runner.determine_agent_for_resumption(&session(events)).name(), "helper");
    }

    #[test]
    fn sticky_and_unknown_authors_fall_back() {
        let runner = runner();
        let events = vec![text_event("sticky"), text_event("ghost")];
        assert_eq!(runner.determine_agent_for_resumption(&session(events)).name(), "root");
    }

    #[test]
    fn function_response_goes_to_the_calling_agent() {
        let runner = runner();
        let call = Event::new("inv", "sticky").with_content(Content::new(
            Role::Model,
            vec![Part::FunctionCall(FunctionCall::new("call-1", "lookup", serde_json::json!({})))],
        ));
        let response = Event::new("inv", USER_AUTHOR).with_content(Content::new(
            Role::User,
            vec![Part::FunctionResponse(FunctionResponse::new(
                "call-1",
                "lookup",
                serde_json::json!({"ok": true}),
            ))],
        ));
        let events = vec![call, text_event("helper"), response];
        assert_eq!(runner.determine_agent_for_resumption(&session(events)).name(), "sticky");
    }
}
