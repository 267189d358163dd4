//! Convenience re-exports for common use.

pub use crate::agents::{
    Agent, AgentTree, CallbackContext, EventStream, InvocationContext, LlmAgent, LoopAgent,
    ParallelAgent, SequentialAgent, ToolContext,
};
pub use crate::config::{RunConfig, RunnerConfig, StreamingMode};
pub use crate::error::{Result, TroupeError};
pub use crate::events::{Event, EventActions, ToolConfirmation};
pub use crate::live::{LiveRequest, LiveRequestQueue};
pub use crate::models::{LlmRequest, LlmResponse, ModelClient};
pub use crate::plugins::{LoggingPlugin, Plugin, PluginManager, SecurityPlugin};
pub use crate::runner::{InMemoryRunner, Runner};
pub use crate::session::{InMemorySessionService, Session, SessionService};
pub use crate::state::State;
pub use crate::tools::{FunctionTool, Tool, ToolArguments, ToolParameters};
pub use crate::types::{Content, Part, Role};
