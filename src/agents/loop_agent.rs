//! Repeats a sequence of sub-agents.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use super::base::unsupported_live;
use super::{Agent, EventStream, InvocationContext};

/// Runs its sub-agents in order, pass after pass.
///
/// Stops after `max_iterations` passes, or once a sub-agent emits an
/// escalating event. The escalating sub-agent finishes its own stream; no
/// later sub-agent runs.
pub struct LoopAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    max_iterations: Option<usize>,
}

impl LoopAgent {
    pub fn new(name: impl Into<String>, sub_agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sub_agents,
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn max_iterations(&self) -> Option<usize> {
        self.max_iterations
    }
}

impl Agent for LoopAgent {
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
        Box::pin(try_stream! {
            if self.sub_agents.is_empty() {
                return;
            }
            let mut iteration = 0usize;
            'passes: while self.max_iterations.map_or(true, |max| iteration < max) {
                for sub in &self.sub_agents {
                    if ctx.is_ended() {
                        break 'passes;
                    }
                    let mut escalated = false;
                    let mut events = Arc::clone(sub).run_async(&ctx);
                    while let Some(event) = events.next().await {
                        let event = event?;
                        escalated |= event.actions.escalates();
                        yield event;
                    }
                    if escalated {
                        tracing::debug!(
                            agent = %self.name,
                            sub_agent = sub.name(),
                            iteration,
                            "loop escalated"
                        );
                        break 'passes;
                    }
                }
                iteration += 1;
            }
        })
    }

    fn run_live_impl(self: Arc<Self>, _ctx: InvocationContext) -> EventStream {
        unsupported_live(&self.name)
    }
}
