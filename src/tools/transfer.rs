//! Built-in tool handing control to another agent.

use async_trait::async_trait;
use serde_json::Value;

use super::{Tool, ToolArguments, ToolParameters};
use crate::agents::ToolContext;
use crate::error::Result;
use crate::models::FunctionDeclaration;

pub const TRANSFER_TO_AGENT: &str = "transfer_to_agent";

/// Sets `transfer_to_agent` on the function response event.
#[derive(Debug, Default)]
pub struct TransferToAgentTool;

#[async_trait]
impl Tool for TransferToAgentTool {
    fn name(&self) -> &str {
        TRANSFER_TO_AGENT
    }

    fn description(&self) -> &str {
        "Transfer the question to another agent when it is better suited to answer it."
    }

    fn declaration(&self) -> Option<FunctionDeclaration> {
        Some(FunctionDeclaration {
            name: TRANSFER_TO_AGENT.to_string(),
            description: self.description().to_string(),
            parameters: ToolParameters::object()
                .string("agent_name", "Name of the agent to transfer to", true)
                .build()
                .schema,
        })
    }

    async fn run(&self, args: ToolArguments, ctx: &ToolContext) -> Result<Value> {
        let agent_name = args.get_str("agent_name")?.to_string();
        ctx.update_actions(|actions| actions.transfer_to_agent = Some(agent_name));
        Ok(Value::Null)
    }
}
