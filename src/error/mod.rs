//! Error types for Troupe.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

use crate::plugins::PluginCallback;

/// Primary error type for all Troupe operations.
#[derive(Error, Debug)]
pub enum TroupeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(String),

    #[error("Error in plugin '{plugin}' during '{callback}' callback: {source}")]
    PluginCallback {
        plugin: String,
        callback: PluginCallback,
        #[source]
        source: Box<TroupeError>,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Max number of LLM calls limit of {limit} exceeded")]
    LlmCallLimitExceeded { limit: usize },

    #[error(
        "Stale session: session {session_id} was modified at {stored_update_time} \
         after the caller's last known update at {last_update_time}; reload and retry"
    )]
    StaleSession {
        session_id: String,
        stored_update_time: chrono::DateTime<chrono::Utc>,
        last_update_time: chrono::DateTime<chrono::Utc>,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Model error ({code}): {message}")]
    Model { code: String, message: String },

    #[error("Live request queue is closed")]
    QueueClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TroupeError {
    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create a model error.
    pub fn model(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Model {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::DuplicatePlugin(_) | Self::AgentNotFound(_) => {
                ErrorCategory::Configuration
            }
            Self::PluginCallback { .. } => ErrorCategory::Plugin,
            Self::StaleSession { .. } => ErrorCategory::Concurrency,
            Self::LlmCallLimitExceeded { .. } => ErrorCategory::Limit,
            Self::ToolExecution { .. } => ErrorCategory::Tool,
            Self::Model { .. } => ErrorCategory::Model,
            Self::SessionNotFound(_) | Self::SessionExists(_) | Self::Io(_) => {
                ErrorCategory::Storage
            }
            #[cfg(feature = "sqlite")]
            Self::Database(_) => ErrorCategory::Storage,
            Self::Serialization(_) => ErrorCategory::Serialization,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether this error stops the invocation instead of becoming an event.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Tool | ErrorCategory::Model)
    }

    /// Whether the caller may retry after reloading its view of the session.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Concurrency)
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Concurrency => RecoverySuggestion::ReloadSession,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::Plugin => RecoverySuggestion::CheckPlugin,
            ErrorCategory::Limit => RecoverySuggestion::RaiseLimit,
            ErrorCategory::Tool => RecoverySuggestion::CheckToolImplementation,
            ErrorCategory::Model => RecoverySuggestion::RetryWithBackoff,
            _ => RecoverySuggestion::ContactSupport,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TroupeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_errors_carry_plugin_and_callback_names() {
        let err = TroupeError::PluginCallback {
            plugin: "cache".to_string(),
            callback: PluginCallback::BeforeTool,
            source: Box::new(TroupeError::InvalidState("boom".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "Error in plugin 'cache' during 'before_tool_callback' callback: Invalid state: boom"
        );
        assert_eq!(err.category(), ErrorCategory::Plugin);
        assert!(err.is_fatal());
    }

    #[test]
    fn tool_and_model_failures_are_event_level() {
        assert!(!TroupeError::tool("search", "timeout").is_fatal());
        assert!(!TroupeError::model("500", "overloaded").is_fatal());
        assert!(TroupeError::LlmCallLimitExceeded { limit: 3 }.is_fatal());
    }

    #[test]
    fn only_stale_sessions_are_retryable() {
        let now = chrono::Utc::now();
        let stale = TroupeError::StaleSession {
            session_id: "s1".to_string(),
            stored_update_time: now,
            last_update_time: now,
        };
        assert!(stale.is_retryable());
        assert_eq!(stale.recovery_suggestion(), RecoverySuggestion::ReloadSession);
        assert!(!TroupeError::DuplicatePlugin("p".to_string()).is_retryable());
    }
}
