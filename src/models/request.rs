//! Requests sent to a model client.

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::types::Content;

/// Settings controlling content generation.
#[derive(Debug, Clone, Builder, Serialize, Deserialize, Default, PartialEq)]
pub struct GenerateContentConfig {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub seed: Option<u64>,
    pub response_schema: Option<serde_json::Value>,
}

/// Function declaration exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments.
    pub parameters: serde_json::Value,
}

/// A request sent to a model client.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    #[serde(default)]
    pub tools: Vec<FunctionDeclaration>,
    #[serde(default)]
    pub config: GenerateContentConfig,
}

impl LlmRequest {
    /// Append instructions, separated from existing ones by a blank line.
    pub fn append_instruction(&mut self, instruction: impl AsRef<str>) {
        let instruction = instruction.as_ref();
        if instruction.is_empty() {
            return;
        }
        match &mut self.system_instruction {
            Some(existing) if !existing.is_empty() => {
                existing.push_str("\n\n");
                existing.push_str(instruction);
            }
            _ => self.system_instruction = Some(instruction.to_string()),
        }
    }

    /// Register a function declaration, replacing one with the same name.
    pub fn append_tool(&mut self, declaration: FunctionDeclaration) {
        self.tools.retain(|existing| existing.name != declaration.name);
        self.tools.push(declaration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_accumulate() {
        let mut request = LlmRequest::default();
        request.append_instruction("Be brief.");
        request.append_instruction("");
        request.append_instruction("Answer in French.");
        assert_eq!(
            request.system_instruction.as_deref(),
            Some("Be brief.\n\nAnswer in French.")
        );
    }

    #[test]
    fn tools_are_unique_by_name() {
        let mut request = LlmRequest::default();
        for description in ["first", "second"] {
            request.append_tool(FunctionDeclaration {
                name: "lookup".into(),
                description: description.into(),
                parameters: serde_json::json!({"type": "object"}),
            });
        }
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].description, "second");
    }
}
