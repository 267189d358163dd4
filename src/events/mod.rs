//! Event log records and their action bags.

pub mod actions;
pub mod event;

pub use actions::{merge_event_actions, AuthConfig, EventActions, ToolConfirmation};
pub use event::{new_event_id, Event, USER_AUTHOR};
