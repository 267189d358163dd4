//! SQLite-backed session service.
//!
//! Sessions, events and the shared app/user state maps live in four tables.
//! Timestamps are stored as microseconds since the epoch so the stale check
//! compares exactly what was written.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, TroupeError};
use crate::events::event::now;
use crate::events::Event;
use crate::state::{merge_scoped_state, split_state_delta, StateMap};

use super::{
    apply_event_to_session, prepare_event_for_storage, stale_session_error, GetSessionConfig,
    Session, SessionService,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS app_states (
    app_name TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    update_time INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS user_states (
    app_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    state TEXT NOT NULL,
    update_time INTEGER NOT NULL,
    PRIMARY KEY (app_name, user_id)
);
CREATE TABLE IF NOT EXISTS sessions (
    app_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    id TEXT NOT NULL,
    state TEXT NOT NULL,
    create_time INTEGER NOT NULL,
    update_time INTEGER NOT NULL,
    PRIMARY KEY (app_name, user_id, id)
);
CREATE TABLE IF NOT EXISTS events (
    id TEXT NOT NULL,
    app_name TEXT NOT NULL,
    user_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    invocation_id TEXT NOT NULL,
    author TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    event_data TEXT NOT NULL,
    PRIMARY KEY (id, app_name, user_id, session_id),
    FOREIGN KEY (app_name, user_id, session_id)
        REFERENCES sessions (app_name, user_id, id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_events_session
    ON events (app_name, user_id, session_id, timestamp);
";

/// Session service persisting to a SQLite database.
#[derive(Clone)]
pub struct SqliteSessionService {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteSessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionService").finish_non_exhaustive()
    }
}

impl SqliteSessionService {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "opened session database");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            work(&mut guard)
        })
        .await
        .map_err(|err| TroupeError::Io(std::io::Error::other(err)))?
    }
}

fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| TroupeError::InvalidState(format!("invalid stored timestamp {micros}")))
}

fn parse_state(raw: &str) -> Result<StateMap> {
    Ok(serde_json::from_str(raw)?)
}

fn load_app_state(conn: &Connection, app_name: &str) -> Result<StateMap> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM app_states WHERE app_name = ?1",
            [app_name],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_state).transpose().map(Option::unwrap_or_default)
}

fn load_user_state(conn: &Connection, app_name: &str, user_id: &str) -> Result<StateMap> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM user_states WHERE app_name = ?1 AND user_id = ?2",
            params![app_name, user_id],
            |row| row.get(0),
        )
        .optional()?;
    raw.as_deref().map(parse_state).transpose().map(Option::unwrap_or_default)
}

fn merge_shared_state(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    app: StateMap,
    user: StateMap,
    time: i64,
) -> Result<()> {
    if !app.is_empty() {
        let mut state = load_app_state(conn, app_name)?;
        state.extend(app);
        conn.execute(
            "INSERT INTO app_states (app_name, state, update_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(app_name) DO UPDATE SET state = excluded.state,
                 update_time = excluded.update_time",
            params![app_name, serde_json::to_string(&state)?, time],
        )?;
    }
    if !user.is_empty() {
        let mut state = load_user_state(conn, app_name, user_id)?;
        state.extend(user);
        conn.execute(
            "INSERT INTO user_states (app_name, user_id, state, update_time)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(app_name, user_id) DO UPDATE SET state = excluded.state,
                 update_time = excluded.update_time",
            params![app_name, user_id, serde_json::to_string(&state)?, time],
        )?;
    }
    Ok(())
}

/// Stored session-scoped state and update time.
fn load_session_row(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    session_id: &str,
) -> Result<Option<(StateMap, i64)>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT state, update_time FROM sessions
             WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
            params![app_name, user_id, session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(raw, time)| Ok((parse_state(&raw)?, time)))
        .transpose()
}

fn load_events(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    session_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_data FROM events
         WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
         ORDER BY timestamp, rowid",
    )?;
    let rows = stmt.query_map(params![app_name, user_id, session_id], |row| {
        row.get::<_, String>(0)
    })?;
    let mut events = Vec::new();
    for raw in rows {
        events.push(serde_json::from_str(&raw?)?);
    }
    Ok(events)
}

fn materialize(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    session_id: &str,
    session_state: &StateMap,
    update_time: i64,
    events: Vec<Event>,
) -> Result<Session> {
    Ok(Session {
        id: session_id.to_string(),
        app_name: app_name.to_string(),
        user_id: user_id.to_string(),
        state: merge_scoped_state(
            session_state,
            &load_user_state(conn, app_name, user_id)?,
            &load_app_state(conn, app_name)?,
        ),
        events,
        last_update_time: from_micros(update_time)?,
    })
}

#[async_trait]
impl SessionService for SqliteSessionService {
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        initial_state: Option<StateMap>,
        session_id: Option<String>,
    ) -> Result<Session> {
        let app_name = app_name.to_string();
        let user_id = user_id.to_string();
        let session_id = session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let scoped = split_state_delta(&initial_state.unwrap_or_default());

        self.run(move |conn| {
            let tx = conn.transaction()?;
            if load_session_row(&tx, &app_name, &user_id, &session_id)?.is_some() {
                return Err(TroupeError::SessionExists(session_id));
            }
            let time = to_micros(now());
            merge_shared_state(&tx, &app_name, &user_id, scoped.app, scoped.user, time)?;
            tx.execute(
                "INSERT INTO sessions (app_name, user_id, id, state, create_time, update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    app_name,
                    user_id,
                    session_id,
                    serde_json::to_string(&scoped.session)?,
                    time
                ],
            )?;
            let session = materialize(
                &tx,
                &app_name,
                &user_id,
                &session_id,
                &scoped.session,
                time,
                Vec::new(),
            )?;
            tx.commit()?;
            tracing::debug!(app_name = %app_name, user_id = %user_id, session_id = %session_id, "session created");
            Ok(session)
        })
        .await
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
        config: Option<GetSessionConfig>,
    ) -> Result<Option<Session>> {
        let app_name = app_name.to_string();
        let user_id = user_id.to_string();
        let session_id = session_id.to_string();

        self.run(move |conn| {
            let Some((state, update_time)) =
                load_session_row(conn, &app_name, &user_id, &session_id)?
            else {
                return Ok(None);
            };
            let mut events = load_events(conn, &app_name, &user_id, &session_id)?;
            if let Some(config) = config {
                config.apply(&mut events);
            }
            materialize(
                conn,
                &app_name,
                &user_id,
                &session_id,
                &state,
                update_time,
                events,
            )
            .map(Some)
        })
        .await
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>> {
        let app_name = app_name.to_string();
        let user_id = user_id.to_string();

        self.run(move |conn| {
            let rows: Vec<(String, String, i64)> = {
                let mut stmt = conn.prepare(
                    "SELECT id, state, update_time FROM sessions
                     WHERE app_name = ?1 AND user_id = ?2 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![app_name, user_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect::<std::result::Result<_, _>>()?
            };
            rows.into_iter()
                .map(|(id, raw, update_time)| {
                    materialize(
                        conn,
                        &app_name,
                        &user_id,
                        &id,
                        &parse_state(&raw)?,
                        update_time,
                        Vec::new(),
                    )
                })
                .collect()
        })
        .await
    }

    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<()> {
        let app_name = app_name.to_string();
        let user_id = user_id.to_string();
        let session_id = session_id.to_string();

        self.run(move |conn| {
            conn.execute(
                "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![app_name, user_id, session_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn append_event(&self, session: &mut Session, mut event: Event) -> Result<Event> {
        if event.partial {
            return Ok(event);
        }

        let full_delta = prepare_event_for_storage(&mut event);
        let scoped = split_state_delta(&event.actions.state_delta);
        let app_name = session.app_name.clone();
        let user_id = session.user_id.clone();
        let session_id = session.id.clone();
        let last_known = to_micros(session.last_update_time);
        let stored_event = event.clone();

        let stored_update = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                let Some((mut state, stored_time)) =
                    load_session_row(&tx, &app_name, &user_id, &session_id)?
                else {
                    return Err(TroupeError::SessionNotFound(session_id));
                };
                if stored_time > last_known {
                    return Ok(Some(stored_time));
                }

                let time = to_micros(stored_event.timestamp);
                state.extend(scoped.session);
                tx.execute(
                    "UPDATE sessions SET state = ?1, update_time = ?2
                     WHERE app_name = ?3 AND user_id = ?4 AND id = ?5",
                    params![
                        serde_json::to_string(&state)?,
                        time,
                        app_name,
                        user_id,
                        session_id
                    ],
                )?;
                merge_shared_state(&tx, &app_name, &user_id, scoped.app, scoped.user, time)?;
                tx.execute(
                    "INSERT INTO events (id, app_name, user_id, session_id, invocation_id,
                         author, timestamp, event_data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        stored_event.id,
                        app_name,
                        user_id,
                        session_id,
                        stored_event.invocation_id,
                        stored_event.author,
                        time,
                        serde_json::to_string(&stored_event)?
                    ],
                )?;
                tx.commit()?;
                Ok(None)
            })
            .await?;

        if let Some(stored_time) = stored_update {
            return Err(stale_session_error(session, from_micros(stored_time)?));
        }

        apply_event_to_session(session, &event, full_delta);
        tracing::debug!(
            session_id = %session.id,
            event_id = %event.id,
            author = %event.author,
            "event persisted"
        );
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::types::Content;

    fn delta(value: serde_json::Value) -> StateMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn events_and_state_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");

        let session_id = {
            let service = SqliteSessionService::open(&path).unwrap();
            let mut session = service
                .create_session("app", "u", Some(delta(json!({"user:name": "Ada"}))), None)
                .await
                .unwrap();
            let mut event = Event::new("inv", "agent").with_content(Content::model("hello"));
            event.actions.state_delta = delta(json!({"count": 1, "temp:x": true}));
            service.append_event(&mut session, event).await.unwrap();
            session.id
        };

        let service = SqliteSessionService::open(&path).unwrap();
        let session = service
            .get_session("app", "u", &session_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.state, delta(json!({"count": 1, "user:name": "Ada"})));
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.events[0].text().as_deref(), Some("hello"));
        assert_eq!(session.last_update_time, session.events[0].timestamp);
    }

    #[tokio::test]
    async fn stale_copy_is_rejected_without_writing() {
        let service = SqliteSessionService::open_in_memory().unwrap();
        let mut first = service.create_session("app", "u", None, None).await.unwrap();
        let mut second = first.clone();

        let mut newer = Event::new("inv", "a");
        newer.timestamp = first.last_update_time + chrono::Duration::seconds(1);
        service.append_event(&mut first, newer).await.unwrap();

        let mut event = Event::new("inv", "b");
        event.actions.state_delta = delta(json!({"k": "v"}));
        let err = service.append_event(&mut second, event).await.unwrap_err();
        assert!(matches!(err, TroupeError::StaleSession { .. }));

        let stored = service
            .get_session("app", "u", &first.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.events.len(), 1);
        assert!(!stored.state.contains_key("k"));
    }

    #[tokio::test]
    async fn deleting_a_session_removes_its_events() {
        let service = SqliteSessionService::open_in_memory().unwrap();
        let mut session = service
            .create_session("app", "u", None, Some("s".into()))
            .await
            .unwrap();
        service
            .append_event(&mut session, Event::new("inv", "a"))
            .await
            .unwrap();

        service.delete_session("app", "u", "s").await.unwrap();

        assert!(service.get_session("app", "u", "s", None).await.unwrap().is_none());
        let count: i64 = service
            .run(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
