//! Model client interface consumed by conversational agents.
//!
//! Concrete provider clients live outside this crate; agents only see the
//! [`ModelClient`] and [`LiveConnection`] traits.

pub mod request;
pub mod response;

pub use request::{FunctionDeclaration, GenerateContentConfig, LlmRequest};
pub use response::{FinishReason, LlmResponse, UsageMetadata};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Result, TroupeError};
use crate::types::{Blob, Content};

/// Stream of model responses.
pub type LlmResponseStream = BoxStream<'static, Result<LlmResponse>>;

/// Core trait implemented by model clients.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier (e.g. "gemini-2.0-flash").
    fn model_name(&self) -> &str;

    /// Generate content. With `stream = true` the client may emit `partial`
    /// chunks before the final response.
    async fn generate_content(&self, request: LlmRequest, stream: bool)
        -> Result<LlmResponseStream>;

    /// Open a bidirectional live connection.
    async fn connect(&self, _request: LlmRequest) -> Result<Box<dyn LiveConnection>> {
        Err(TroupeError::UnsupportedOperation(format!(
            "model '{}' does not support live connections",
            self.model_name()
        )))
    }
}

/// Bidirectional live session with a model.
#[async_trait]
pub trait LiveConnection: Send + Sync {
    /// Send a full turn of content.
    async fn send_content(&self, content: Content) -> Result<()>;

    /// Send realtime input (audio/video chunk).
    async fn send_realtime(&self, blob: Blob) -> Result<()>;

    /// Responses received from the model. Called once per connection.
    fn receive(&self) -> LlmResponseStream;

    async fn close(&self) -> Result<()>;
}
