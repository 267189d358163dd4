//! Runner wiring: configuration, session loading and persistence.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{collect, collect_until_error, texts, ScriptedAgent};
use troupe::agents::{Agent, SequentialAgent};
use troupe::config::RunnerConfig;
use troupe::error::TroupeError;
use troupe::runner::Runner;
use troupe::session::{InMemorySessionService, SessionService};
use troupe::types::Content;

fn pipeline() -> Arc<dyn Agent> {
    Arc::new(SequentialAgent::new(
        "pipeline",
        vec![
            ScriptedAgent::new("A", &["from A"]).shared(),
            ScriptedAgent::new("B", &["from B"]).writing("user:seen", serde_json::json!(true)).shared(),
        ],
    ))
}

#[tokio::test]
async fn missing_sessions_fail_when_auto_create_is_off() {
    let config = RunnerConfig::from_toml_str(
        r#"
        app_name = "strict"
        auto_create_session = false
        "#,
    )
    .unwrap();
    let service = Arc::new(InMemorySessionService::new());
    let runner = Runner::with_config(config, pipeline(), service.clone()).unwrap();
    assert_eq!(runner.app_name(), "strict");

    let (events, err) =
        collect_until_error(runner.run_async("u1", "nope", Content::user("hi"), None)).await;
    assert!(events.is_empty());
    assert!(matches!(err, Some(TroupeError::SessionNotFound(id)) if id == "nope"));

    service.create_session("strict", "u1", None, Some("nope".into())).await.unwrap();
    let events = collect(runner.run_async("u1", "nope", Content::user("hi"), None)).await;
    assert_eq!(texts(&events), vec!["from A", "from B"]);
}

#[tokio::test]
async fn user_state_written_in_one_session_is_visible_in_the_next() {
    let service = Arc::new(InMemorySessionService::new());
    let runner = Runner::new("app", pipeline(), service.clone()).unwrap();
    collect(runner.run_async("u1", "first", Content::user("hi"), None)).await;

    let second = service.create_session("app", "u1", None, Some("second".into())).await.unwrap();
    assert_eq!(second.state.get("user:seen"), Some(&serde_json::json!(true)));
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_backed_runs_survive_a_reopen() {
    use troupe::session::SqliteSessionService;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions").join("troupe.db");
    {
        let service = Arc::new(SqliteSessionService::open(&path).unwrap());
        let runner = Runner::new("app", pipeline(), service).unwrap();
        collect(runner.run_async("u1", "s1", Content::user("Hello"), None)).await;
    }

    let reopened = SqliteSessionService::open(&path).unwrap();
    let session = reopened.get_session("app", "u1", "s1", None).await.unwrap().unwrap();
    assert_eq!(texts(&session.events), vec!["Hello", "from A", "from B"]);
    assert_eq!(session.state.get("user:seen"), Some(&serde_json::json!(true)));
}
