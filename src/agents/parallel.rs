//! Runs sub-agents concurrently on isolated branches.

use std::sync::Arc;

use async_stream::try_stream;
use futures::stream::select_all;
use futures::StreamExt;

use super::base::unsupported_live;
use super::{Agent, EventStream, InvocationContext};

/// Runs every sub-agent on its own branch and merges their events in
/// completion order.
///
/// Each sub-agent sees only its own branch of the conversation. The first
/// error from any branch ends the merged stream and drops the remaining
/// branches.
pub struct ParallelAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
}

impl ParallelAgent {
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
}

/// Branch assigned to `sub_agent` under `parent`.
pub fn branch_for(parent_branch: Option<&str>, agent: &str, sub_agent: &str) -> String {
    match parent_branch {
        Some(parent) if !parent.is_empty() => format!("{parent}.{agent}.{sub_agent}"),
        _ => format!("{agent}.{sub_agent}"),
    }
}

impl Agent for ParallelAgent {
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
            let branches: Vec<EventStream> = self
                .sub_agents
                .iter()
                .map(|sub| {
                    let branch = branch_for(ctx.branch.as_deref(), &self.name, sub.name());
                    Arc::clone(sub).run_async(&ctx.with_branch(branch))
                })
                .collect();
            if branches.is_empty() {
                return;
            }

            let mut merged = select_all(branches);
            while let Some(event) = merged.next().await {
                yield event?;
            }
        })
    }

    fn run_live_impl(self: Arc<Self>, _ctx: InvocationContext) -> EventStream {
        unsupported_live(&self.name)
    }
}
