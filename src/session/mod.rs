//! Session storage: append-only event logs with partitioned state.

pub mod in_memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemorySessionService;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionService;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, TroupeError};
use crate::events::Event;
use crate::state::{strip_temp_keys, StateMap};

/// A conversation between a user and an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub user_id: String,
    /// Materialized view: session keys plus `user:` and `app:` keys.
    #[serde(default)]
    pub state: StateMap,
    #[serde(default)]
    pub events: Vec<Event>,
    /// Optimistic-concurrency token; advanced on every append.
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }
}

/// Session shared between the runner and the agents of one invocation.
pub type SharedSession = Arc<RwLock<Session>>;

/// Filters applied when loading a session's events.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GetSessionConfig {
    /// Keep only the most recent N events.
    pub num_recent_events: Option<usize>,
    /// Keep only events at or after this time.
    pub after_timestamp: Option<DateTime<Utc>>,
}

impl GetSessionConfig {
    pub(crate) fn apply(&self, events: &mut Vec<Event>) {
        if let Some(after) = self.after_timestamp {
            events.retain(|event| event.timestamp >= after);
        }
        if let Some(limit) = self.num_recent_events {
            let skip = events.len().saturating_sub(limit);
            events.drain(..skip);
        }
    }
}

/// Persists sessions and reconciles event state deltas.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session. `initial_state` is routed by key prefix like any delta.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        initial_state: Option<StateMap>,
        session_id: Option<String>,
    ) -> Result<Session>;

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> Result<Option<Session>>;

    /// List a user's sessions without their events.
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>>;

    async fn delete_session(&self, app_name: &str, user_id: &str, session_id: &str)
        -> Result<()>;

    /// Append an event and reconcile its state delta.
    ///
    /// Partial events are returned untouched. Fails with
    /// [`TroupeError::StaleSession`] when storage was updated after
    /// `session.last_update_time`; nothing is written in that case.
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event>;
}

/// Remove invocation-scoped keys from the event before it is stored,
/// returning the full delta for the caller's live session view.
pub(crate) fn prepare_event_for_storage(event: &mut Event) -> StateMap {
    let full_delta = event.actions.state_delta.clone();
    strip_temp_keys(&mut event.actions.state_delta);
    full_delta
}

/// Mirror a stored event onto the caller's session copy.
pub(crate) fn apply_event_to_session(session: &mut Session, event: &Event, full_delta: StateMap) {
    session.state.extend(full_delta);
    session.events.push(event.clone());
    session.last_update_time = event.timestamp;
}

pub(crate) fn stale_session_error(
    session: &Session,
    stored_update_time: DateTime<Utc>,
) -> TroupeError {
    tracing::warn!(
        session_id = %session.id,
        stored = %stored_update_time,
        last_known = %session.last_update_time,
        "rejecting append to stale session"
    );
    TroupeError::StaleSession {
        session_id: session.id.clone(),
        stored_update_time,
        last_update_time: session.last_update_time,
    }
}
