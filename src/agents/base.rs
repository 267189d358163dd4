//! Agent capability interface and the plugin-wrapped entry points.

use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

use super::context::{CallbackContext, InvocationContext};
use crate::error::{Result, TroupeError};
use crate::events::Event;
use crate::types::Content;

/// Stream of events produced by an agent.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// A node of the agent tree.
///
/// Implementors provide [`Agent::run_impl`]; callers go through
/// `run_async`/`run_live` on `Arc<dyn Agent>`, which add the before/after
/// agent plugin callbacks.
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &[]
    }

    /// Whether control may not be handed back to this agent's parent.
    fn disallow_transfer_to_parent(&self) -> bool {
        false
    }

    /// Batch-mode body.
    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream;

    /// Live-mode body.
    fn run_live_impl(self: Arc<Self>, _ctx: InvocationContext) -> EventStream {
        unsupported_live(self.name())
    }
}

impl std::fmt::Debug for dyn Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").field("name", &self.name()).finish()
    }
}

/// A stream failing with [`TroupeError::UnsupportedOperation`].
pub fn unsupported_live(agent_name: &str) -> EventStream {
    let err = TroupeError::UnsupportedOperation(format!(
        "live mode is not supported by agent '{agent_name}'"
    ));
    stream::once(async move { Err(err) }).boxed()
}

impl dyn Agent {
    /// Run in batch mode with agent plugin callbacks.
    pub fn run_async(self: Arc<Self>, parent: &InvocationContext) -> EventStream {
        let ctx = parent.for_agent(Arc::clone(&self));
        run_wrapped(self, ctx, false)
    }

    /// Run in live mode with agent plugin callbacks.
    pub fn run_live(self: Arc<Self>, parent: &InvocationContext) -> EventStream {
        let ctx = parent.for_agent(Arc::clone(&self));
        run_wrapped(self, ctx, true)
    }
}

fn run_wrapped(agent: Arc<dyn Agent>, ctx: InvocationContext, live: bool) -> EventStream {
    Box::pin(try_stream! {
        tracing::debug!(
            invocation_id = %ctx.invocation_id,
            agent = agent.name(),
            branch = ctx.branch.as_deref().unwrap_or(""),
            live,
            "agent started"
        );

        let (event, skip) = before_agent(&agent, &ctx).await?;
        if let Some(event) = event {
            yield event;
        }
        if skip || ctx.is_ended() {
            return;
        }

        let mut events = if live {
            Arc::clone(&agent).run_live_impl(ctx.clone())
        } else {
            Arc::clone(&agent).run_impl(ctx.clone())
        };
        while let Some(event) = events.next().await {
            yield event?;
        }

        if ctx.is_ended() {
            return;
        }
        if let Some(event) = after_agent(&agent, &ctx).await? {
            yield event;
        }
        tracing::debug!(invocation_id = %ctx.invocation_id, agent = agent.name(), "agent finished");
    })
}

/// Event for a callback outcome: the override content, or a bare state update.
fn callback_event(ctx: &InvocationContext, cb: &CallbackContext, content: Option<Content>) -> Option<Event> {
    let actions = cb.take_actions();
    if content.is_none() && actions.is_empty() {
        return None;
    }
    let mut event = ctx.new_event().with_actions(actions);
    event.content = content;
    Some(event)
}

/// Returns the event to emit and whether the agent body is skipped.
async fn before_agent(agent: &Arc<dyn Agent>, ctx: &InvocationContext) -> Result<(Option<Event>, bool)> {
    if ctx.plugin_manager.is_empty() {
        return Ok((None, false));
    }
    let cb = CallbackContext::new(ctx).await;
    let content = ctx.plugin_manager.run_before_agent(agent.as_ref(), &cb).await?;
    let skip = content.is_some();
    if skip {
        tracing::debug!(agent = agent.name(), "agent skipped by plugin");
    }
    Ok((callback_event(ctx, &cb, content), skip))
}

async fn after_agent(agent: &Arc<dyn Agent>, ctx: &InvocationContext) -> Result<Option<Event>> {
    if ctx.plugin_manager.is_empty() {
        return Ok(None);
    }
    let cb = CallbackContext::new(ctx).await;
    let content = ctx.plugin_manager.run_after_agent(agent.as_ref(), &cb).await?;
    Ok(callback_event(ctx, &cb, content))
}
