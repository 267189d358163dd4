//! Runs sub-agents one after another.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use super::{Agent, EventStream, InvocationContext};

/// Drives each sub-agent to completion in order, forwarding every event.
pub struct SequentialAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
}

impl SequentialAgent {
    pub fn new(name: impl Into<String>, sub_agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sub_agents,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn run_sequence(self: Arc<Self>, ctx: InvocationContext, live: bool) -> EventStream {
        Box::pin(try_stream! {
            for sub in &self.sub_agents {
                if ctx.is_ended() {
                    break;
                }
                let sub = Arc::clone(sub);
                let mut events = if live { sub.run_live(&ctx) } else { sub.run_async(&ctx) };
                while let Some(event) = events.next().await {
                    yield event?;
                }
            }
        })
    }
}

impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        self.run_sequence(ctx, false)
    }

    fn run_live_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        self.run_sequence(ctx, true)
    }
}
