//! Plugin dispatch through the runner.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{call_log, collect, collect_until_error, texts, RecordingPlugin, ScriptedAgent};
use troupe::agents::{Agent, SequentialAgent};
use troupe::error::TroupeError;
use troupe::plugins::{LoggingPlugin, PluginCallback};
use troupe::runner::InMemoryRunner;
use troupe::session::SessionService;
use troupe::types::Content;

fn pipeline() -> Arc<dyn Agent> {
    Arc::new(SequentialAgent::new(
        "pipeline",
        vec![
            ScriptedAgent::new("A", &["from A"]).shared(),
            ScriptedAgent::new("B", &["from B"]).shared(),
        ],
    ))
}

#[tokio::test]
async fn first_defined_result_stops_the_chain() {
    let log = call_log();
    let first = RecordingPlugin::new("first", &log);
    let mut second = RecordingPlugin::new("second", &log);
    second.before_run = Some(Content::model("served from cache"));
    let third = RecordingPlugin::new("third", &log);

    let agent = ScriptedAgent::new("solo", &["never"]);
    let runs = agent.run_counter();
    let runner = InMemoryRunner::new("app", agent.shared())
        .unwrap()
        .with_plugin(Arc::new(first))
        .unwrap()
        .with_plugin(Arc::new(second))
        .unwrap()
        .with_plugin(Arc::new(third))
        .unwrap();

    let events = collect(runner.run_async("u1", "s1", Content::user("hi"), None)).await;
    assert_eq!(texts(&events), vec!["served from cache"]);
    assert_eq!(events[0].author, "solo");
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let before_run: Vec<String> = log
        .lock()
        .iter()
        .filter(|entry| entry.ends_with(":before_run"))
        .cloned()
        .collect();
    assert_eq!(before_run, vec!["first:before_run", "second:before_run"]);

    // after_run is a notification: every plugin sees it.
    let after_run = log.lock().iter().filter(|entry| entry.ends_with(":after_run")).count();
    assert_eq!(after_run, 3);

    let session = runner
        .sessions()
        .get_session("app", "u1", "s1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(texts(&session.events), vec!["hi", "served from cache"]);
}

#[tokio::test]
async fn lifecycle_callbacks_fire_in_order() {
    let log = call_log();
    let runner = InMemoryRunner::new("app", pipeline())
        .unwrap()
        .with_plugin(Arc::new(RecordingPlugin::new("p", &log)))
        .unwrap();

    collect(runner.run_async("u1", "s1", Content::user("hi"), None)).await;

    assert_eq!(
        *log.lock(),
        vec![
            "p:on_user_message",
            "p:before_run",
            "p:before_agent(pipeline)",
            "p:before_agent(A)",
            "p:on_event",
            "p:after_agent(A)",
            "p:before_agent(B)",
            "p:on_event",
            "p:after_agent(B)",
            "p:after_agent(pipeline)",
            "p:after_run",
        ]
    );
}

#[tokio::test]
async fn on_event_replacement_is_what_gets_stored() {
    let log = call_log();
    let mut plugin = RecordingPlugin::new("rewriter", &log);
    plugin.on_event_text = Some("redacted".to_string());
    let runner = InMemoryRunner::new("app", pipeline())
        .unwrap()
        .with_plugin(Arc::new(plugin))
        .unwrap();

    let events = collect(runner.run_async("u1", "s1", Content::user("hi"), None)).await;
    assert_eq!(texts(&events), vec!["redacted", "redacted"]);

    let session = runner
        .sessions()
        .get_session("app", "u1", "s1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(texts(&session.events), vec!["hi", "redacted", "redacted"]);
}

#[tokio::test]
async fn on_user_message_can_rewrite_the_message() {
    let log = call_log();
    let mut plugin = RecordingPlugin::new("rewriter", &log);
    plugin.on_user_message = Some(Content::user("rewritten"));
    let runner = InMemoryRunner::new("app", pipeline())
        .unwrap()
        .with_plugin(Arc::new(plugin))
        .unwrap();

    collect(runner.run_async("u1", "s1", Content::user("original"), None)).await;

    let session = runner
        .sessions()
        .get_session("app", "u1", "s1", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.events[0].text().as_deref(), Some("rewritten"));
}

#[tokio::test]
async fn plugin_errors_abort_the_run_with_context() {
    let log = call_log();
    let mut boom = RecordingPlugin::new("boom", &log);
    boom.fail_on_user_message = true;
    let runner = InMemoryRunner::new("app", pipeline())
        .unwrap()
        .with_plugin(Arc::new(boom))
        .unwrap()
        .with_plugin(Arc::new(RecordingPlugin::new("later", &log)))
        .unwrap();

    let (events, err) =
        collect_until_error(runner.run_async("u1", "s1", Content::user("hi"), None)).await;
    assert!(events.is_empty());
    match err {
        Some(TroupeError::PluginCallback { plugin, callback, .. }) => {
            assert_eq!(plugin, "boom");
            assert_eq!(callback, PluginCallback::OnUserMessage);
        }
        other => panic!("expected a plugin callback error, got {other:?}"),
    }
    assert_eq!(*log.lock(), vec!["boom:on_user_message"]);
}

#[test]
fn duplicate_plugins_are_rejected() {
    let log = call_log();
    let err = InMemoryRunner::new("app", pipeline())
        .unwrap()
        .with_plugin(Arc::new(RecordingPlugin::new("p", &log)))
        .unwrap()
        .with_plugin(Arc::new(RecordingPlugin::new("p", &log)))
        .unwrap_err();
    assert!(matches!(err, TroupeError::DuplicatePlugin(name) if name == "p"));
}

#[tokio::test]
async fn logging_plugin_never_changes_the_run() {
    let runner = InMemoryRunner::new("app", pipeline())
        .unwrap()
        .with_plugin(Arc::new(LoggingPlugin::default()))
        .unwrap();
    let events = collect(runner.run_async("u1", "s1", Content::user("hi"), None)).await;
    assert_eq!(texts(&events), vec!["from A", "from B"]);
}
