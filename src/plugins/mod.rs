//! Plugins observing and intercepting the invocation lifecycle.

pub mod base;
pub mod logging;
pub mod manager;
pub mod security;

pub use base::{Plugin, PluginCallback};
pub use logging::LoggingPlugin;
pub use manager::PluginManager;
pub use security::{
    AllowAllPolicyEngine, PolicyCheckResult, PolicyEngine, PolicyOutcome, RulePolicyEngine,
    SecurityPlugin, TOOL_CALL_SECURITY_STATES,
};
