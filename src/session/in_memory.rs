//! In-process session service.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Result, TroupeError};
use crate::events::event::now;
use crate::events::Event;
use crate::state::{merge_scoped_state, split_state_delta, StateMap};

use super::{
    apply_event_to_session, prepare_event_for_storage, stale_session_error, GetSessionConfig,
    Session, SessionService,
};

#[derive(Debug, Clone)]
struct StoredSession {
    id: String,
    app_name: String,
    user_id: String,
    /// Session-scoped keys only.
    state: StateMap,
    events: Vec<Event>,
    last_update_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Store {
    /// app -> user -> session id -> session
    sessions: HashMap<String, HashMap<String, HashMap<String, StoredSession>>>,
    app_state: HashMap<String, StateMap>,
    /// app -> user -> state
    user_state: HashMap<String, HashMap<String, StateMap>>,
}

impl Store {
    fn session(&self, app_name: &str, user_id: &str, session_id: &str) -> Option<&StoredSession> {
        self.sessions.get(app_name)?.get(user_id)?.get(session_id)
    }

    fn session_mut(
        &mut self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Option<&mut StoredSession> {
        self.sessions
            .get_mut(app_name)?
            .get_mut(user_id)?
            .get_mut(session_id)
    }

    fn app_state(&self, app_name: &str) -> StateMap {
        self.app_state.get(app_name).cloned().unwrap_or_default()
    }

    fn user_state(&self, app_name: &str, user_id: &str) -> StateMap {
        self.user_state
            .get(app_name)
            .and_then(|users| users.get(user_id))
            .cloned()
            .unwrap_or_default()
    }

    fn merge_shared_state(&mut self, app_name: &str, user_id: &str, app: StateMap, user: StateMap) {
        if !app.is_empty() {
            self.app_state
                .entry(app_name.to_string())
                .or_default()
                .extend(app);
        }
        if !user.is_empty() {
            self.user_state
                .entry(app_name.to_string())
                .or_default()
                .entry(user_id.to_string())
                .or_default()
                .extend(user);
        }
    }

    fn materialize(&self, stored: &StoredSession, with_events: bool) -> Session {
        Session {
            id: stored.id.clone(),
            app_name: stored.app_name.clone(),
            user_id: stored.user_id.clone(),
            state: merge_scoped_state(
                &stored.state,
                &self.user_state(&stored.app_name, &stored.user_id),
                &self.app_state(&stored.app_name),
            ),
            events: if with_events {
                stored.events.clone()
            } else {
                Vec::new()
            },
            last_update_time: stored.last_update_time,
        }
    }
}

/// Session service that keeps everything in process memory.
///
/// App and user state maps are shared by every session of that app/user.
#[derive(Debug, Default)]
pub struct InMemorySessionService {
    store: RwLock<Store>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        initial_state: Option<StateMap>,
        session_id: Option<String>,
    ) -> Result<Session> {
        let session_id = session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let scoped = split_state_delta(&initial_state.unwrap_or_default());

        let mut store = self.store.write();
        if store.session(app_name, user_id, &session_id).is_some() {
            return Err(TroupeError::SessionExists(session_id));
        }
        store.merge_shared_state(app_name, user_id, scoped.app, scoped.user);
        let stored = StoredSession {
            id: session_id.clone(),
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            state: scoped.session,
            events: Vec::new(),
            last_update_time: now(),
        };
        let session = store.materialize(&stored, true);
        store
            .sessions
            .entry(app_name.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.clone(), stored);

        tracing::debug!(app_name, user_id, session_id = %session_id, "session created");
        Ok(session)
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> Result<Option<Session>> {
        let store = self.store.read();
        let Some(stored) = store.session(app_name, user_id, session_id) else {
            return Ok(None);
        };
        let mut session = store.materialize(stored, true);
        if let Some(config) = config {
            config.apply(&mut session.events);
        }
        Ok(Some(session))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>> {
        let store = self.store.read();
        let mut sessions: Vec<Session> = store
            .sessions
            .get(app_name)
            .and_then(|users| users.get(user_id))
            .map(|sessions| {
                sessions
                    .values()
                    .map(|stored| store.materialize(stored, false))
                    .collect()
            })
            .unwrap_or_default();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<()> {
        let mut store = self.store.write();
        if let Some(sessions) = store
            .sessions
            .get_mut(app_name)
            .and_then(|users| users.get_mut(user_id))
        {
            sessions.remove(session_id);
        }
        Ok(())
    }

    async fn append_event(&self, session: &mut Session, mut event: Event) -> Result<Event> {
        if event.partial {
            return Ok(event);
        }

        let full_delta = prepare_event_for_storage(&mut event);
        let scoped = split_state_delta(&event.actions.state_delta);
        {
            let mut store = self.store.write();
            let stored = store
                .session_mut(&session.app_name, &session.user_id, &session.id)
                .ok_or_else(|| TroupeError::SessionNotFound(session.id.clone()))?;
            if stored.last_update_time > session.last_update_time {
                return Err(stale_session_error(session, stored.last_update_time));
            }
            stored.state.extend(scoped.session);
            stored.events.push(event.clone());
            stored.last_update_time = event.timestamp;
            store.merge_shared_state(&session.app_name, &session.user_id, scoped.app, scoped.user);
        }

        apply_event_to_session(session, &event, full_delta);
        tracing::debug!(
            session_id = %session.id,
            event_id = %event.id,
            author = %event.author,
            "event appended"
        );
        Ok(event)
    }
}
