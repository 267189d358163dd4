//! Agents: the capability trait, invocation contexts and the bundled
//! composition agents.

pub mod base;
pub mod context;
pub mod llm;
pub mod loop_agent;
pub mod parallel;
pub mod sequential;
pub mod tree;

pub use base::{Agent, EventStream};
pub use context::{
    new_invocation_id, CallbackContext, InvocationContext, InvocationCostManager, ToolContext,
};
pub use llm::{LlmAgent, REQUEST_CONFIRMATION, REQUEST_CREDENTIAL};
pub use loop_agent::LoopAgent;
pub use parallel::ParallelAgent;
pub use sequential::SequentialAgent;
pub use tree::AgentTree;
