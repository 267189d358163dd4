//! Tool system for function calling.

pub mod arguments;
pub mod tool;
pub mod transfer;
pub mod types;

pub use arguments::ToolArguments;
pub use tool::{FunctionTool, Tool};
pub use transfer::{TransferToAgentTool, TRANSFER_TO_AGENT};
pub use types::{ParameterBuilder, ToolParameters};
