//! Unified error classification and recovery.

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Plugin,
    Concurrency,
    Limit,
    Tool,
    Model,
    Storage,
    Serialization,
    Unknown,
}

/// Suggested recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    ReloadSession,
    RetryWithBackoff,
    CheckConfiguration,
    CheckPlugin,
    RaiseLimit,
    CheckToolImplementation,
    ContactSupport,
}
