//! Integration tests for both interpreter bridges against fake interpreters.
//!
//! The fake `re` binaries are small `sh -c` scripts:
//! - one-shot fakes see the dependency list as `$1` and the code as `$2`
//! - persistent fakes read request lines on stdin and answer on stdout

#![cfg(unix)]

use std::time::Duration;

use irust_kernel::bridge::{Bridge, JsonLineBridge, Protocol, Transport, TransportError};
use irust_kernel::dispatcher::{Action, DispatchError, ExecutionDispatcher};
use irust_kernel::interpreter::InterpreterCommand;
use irust_kernel::translator::DisplayEvent;
use irust_protocol::{mime, Request, Response};

/// A fake interpreter running `script` under `/bin/sh`.
fn fake_re(script: &str) -> InterpreterCommand {
    InterpreterCommand::new("/bin/sh").with_args(["-c", script, "re"])
}

fn oneshot(script: &str, timeout: Option<Duration>) -> ExecutionDispatcher<Bridge> {
    let bridge = Bridge::connect(Protocol::OneShot, fake_re(script), timeout).unwrap();
    ExecutionDispatcher::new(bridge)
}

fn json_line(script: &str, timeout: Option<Duration>) -> ExecutionDispatcher<JsonLineBridge> {
    let bridge = JsonLineBridge::spawn(&fake_re(script), timeout).unwrap();
    ExecutionDispatcher::new(bridge)
}

/// The wire line of `response`, without its terminator.
fn wire(response: &Response) -> String {
    response.to_line().unwrap().trim_end().to_string()
}

/// A persistent fake that answers every request with `response`.
fn always_answering(response: &Response) -> String {
    format!("while read -r line; do echo '{}'; done", wire(response))
}

/// Answers every request with an increasing counter as text/plain.
const COUNTER: &str = r#"n=0
while read -r line; do
  n=$((n+1))
  printf '{"Eval":{"mime_type":"text/plain","value":"%s"}}\n' "$n"
done"#;

// =============================================================================
// One-shot bridge
// =============================================================================

#[tokio::test]
async fn test_oneshot_passes_dependencies_and_accumulated_code() {
    let mut dispatcher = oneshot(r#"printf '%s|%s' "$1" "$2""#, None);

    let added = dispatcher.dispatch(":add regex", false).await.unwrap();
    assert_eq!(added.action, Action::AddDependency);
    assert!(added.events.is_empty());

    let buffered = dispatcher.dispatch("let a = \"hello\";", false).await.unwrap();
    assert_eq!(buffered.action, Action::Accumulate);
    assert!(buffered.events.is_empty());

    let evaluated = dispatcher.dispatch("a.len()", false).await.unwrap();
    assert_eq!(evaluated.action, Action::Evaluate);
    assert_eq!(evaluated.execution_count, 1);
    assert_eq!(
        evaluated.events,
        vec![DisplayEvent::stdout("regex|let a = \"hello\";a.len()")]
    );
}

#[tokio::test]
async fn test_oneshot_joins_dependencies_with_spaces() {
    let mut dispatcher = oneshot(r#"printf '%s' "$1""#, None);

    dispatcher.dispatch(":add regex", false).await.unwrap();
    dispatcher.dispatch(":add serde --features derive", false).await.unwrap();
    dispatcher.dispatch(":add regex", false).await.unwrap();

    let evaluated = dispatcher.dispatch("1", false).await.unwrap();
    assert_eq!(
        evaluated.events,
        vec![DisplayEvent::stdout("regex serde --features derive")]
    );
}

#[tokio::test]
async fn test_oneshot_failing_interpreter_output_is_plain_text() {
    let mut dispatcher = oneshot(
        "printf 'error[E0425]: cannot find value `b`\\n'; echo 'note: noise' >&2; exit 101",
        None,
    );

    let evaluated = dispatcher.dispatch("b", false).await.unwrap();
    assert_eq!(
        evaluated.events,
        vec![DisplayEvent::stdout("error[E0425]: cannot find value `b`\n")]
    );
    assert!(!dispatcher.is_defunct());
}

#[tokio::test]
async fn test_oneshot_selects_toolchain_through_environment() {
    let mut dispatcher = oneshot(r#"printf '%s' "$RUSTUP_TOOLCHAIN""#, None);

    let default = dispatcher.dispatch("1", false).await.unwrap();
    assert_eq!(default.events, vec![DisplayEvent::stdout("stable")]);

    let switched = dispatcher.dispatch(":toolchain nightly", false).await.unwrap();
    assert_eq!(switched.action, Action::SetToolchain);
    assert!(switched.events.is_empty());

    let evaluated = dispatcher.dispatch("1", false).await.unwrap();
    assert_eq!(evaluated.events, vec![DisplayEvent::stdout("nightly")]);
    assert_eq!(evaluated.execution_count, 2);
}

#[tokio::test]
async fn test_oneshot_spawns_fresh_process_per_evaluation() {
    let mut dispatcher = oneshot("printf '%s' \"$$\"", None);

    let first = dispatcher.dispatch("1", false).await.unwrap();
    let second = dispatcher.dispatch("2", false).await.unwrap();
    assert_ne!(first.events, second.events);
}

#[tokio::test]
async fn test_oneshot_timeout_is_reported_as_output() {
    let mut dispatcher = oneshot(
        r#"case "$2" in *loop*) sleep 5 ;; *) printf 'ok' ;; esac"#,
        Some(Duration::from_millis(200)),
    );

    let timed_out = dispatcher.dispatch("loop {}", false).await.unwrap();
    assert_eq!(
        timed_out.events,
        vec![DisplayEvent::stdout("interpreter did not respond within 200ms\n")]
    );
    assert_eq!(timed_out.execution_count, 1);
    assert!(!dispatcher.is_defunct());

    let evaluated = dispatcher.dispatch("1", false).await.unwrap();
    assert_eq!(evaluated.events, vec![DisplayEvent::stdout("ok")]);
    assert_eq!(evaluated.execution_count, 2);
}

#[tokio::test]
async fn test_oneshot_missing_interpreter_is_spawn_error() {
    let bridge = Bridge::connect(
        Protocol::OneShot,
        InterpreterCommand::new("/nonexistent/irust/re"),
        None,
    )
    .unwrap();
    let mut dispatcher = ExecutionDispatcher::new(bridge);

    let err = dispatcher.dispatch("1", false).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transport(TransportError::Spawn { .. })
    ));
    // The count was consumed before the failed round trip.
    assert_eq!(dispatcher.session().execution_count(), 1);
}

// =============================================================================
// JSON-line bridge
// =============================================================================

#[tokio::test]
async fn test_json_line_echoed_request_is_silent() {
    let mut dispatcher = json_line("cat", None);

    let evaluated = dispatcher.dispatch("1+1", false).await.unwrap();
    assert_eq!(evaluated.action, Action::Evaluate);
    assert!(evaluated.events.is_empty());
    assert_eq!(dispatcher.transport().round_trips(), 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_json_line_eval_becomes_display_data() {
    let script = always_answering(&Response::eval(mime::PLAIN_TEXT, "3"));
    let mut dispatcher = json_line(&script, None);

    let evaluated = dispatcher.dispatch("1 + 2", false).await.unwrap();
    assert_eq!(
        evaluated.events,
        vec![DisplayEvent::display_data("text/plain", "3")]
    );
    assert_eq!(evaluated.execution_count, 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_json_line_one_response_per_request_in_order() {
    let mut dispatcher = json_line(COUNTER, None);

    for expected in ["1", "2", "3"] {
        let evaluated = dispatcher.dispatch("x", false).await.unwrap();
        assert_eq!(
            evaluated.events,
            vec![DisplayEvent::display_data("text/plain", expected)]
        );
    }
    assert_eq!(dispatcher.transport().round_trips(), 3);
    assert!(!dispatcher.transport().is_desynchronized());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_json_line_silent_cells_are_not_sent() {
    let mut dispatcher = json_line(COUNTER, None);

    dispatcher.dispatch("let a = 1;", false).await.unwrap();
    dispatcher.dispatch("let b = 2", true).await.unwrap();
    assert_eq!(dispatcher.transport().round_trips(), 0);

    let evaluated = dispatcher.dispatch("a + b", false).await.unwrap();
    assert_eq!(
        evaluated.events,
        vec![DisplayEvent::display_data("text/plain", "1")]
    );
    assert_eq!(dispatcher.transport().round_trips(), 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_json_line_forwards_directives_verbatim() {
    let request = |code: &str| Request::execute(code).to_line().unwrap().trim_end().to_string();
    let script = format!(
        "while read -r line; do
  case \"$line\" in
    '{}') echo '{}' ;;
    '{}') echo '{}' ;;
    *) echo '{}' ;;
  esac
done",
        request(":add regex"),
        wire(&Response::eval(mime::PLAIN_TEXT, "added regex")),
        request(":toolchain nightly"),
        wire(&Response::Silent),
        wire(&Response::eval(mime::PLAIN_TEXT, "unexpected")),
    );
    let mut dispatcher = json_line(&script, None);

    let added = dispatcher.dispatch(":add regex", false).await.unwrap();
    assert_eq!(added.action, Action::AddDependency);
    assert_eq!(
        added.events,
        vec![DisplayEvent::display_data("text/plain", "added regex")]
    );
    assert_eq!(dispatcher.session().dependencies(), ["regex"]);

    let switched = dispatcher.dispatch(":toolchain nightly", false).await.unwrap();
    assert_eq!(switched.action, Action::SetToolchain);
    assert!(switched.events.is_empty());

    assert_eq!(dispatcher.session().execution_count(), 0);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_json_line_malformed_response_is_fatal() {
    let mut dispatcher = json_line("read -r line; echo 'not json'; cat > /dev/null", None);

    let err = dispatcher.dispatch("1", false).await.unwrap_err();
    match err {
        DispatchError::Transport(TransportError::Malformed { line, .. }) => {
            assert_eq!(line, "not json");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(dispatcher.is_defunct());

    let err = dispatcher.dispatch("2", false).await.unwrap_err();
    assert!(matches!(err, DispatchError::Defunct { .. }));
}

#[tokio::test]
async fn test_json_line_child_exit_is_fatal() {
    let mut dispatcher = json_line("read -r line; exit 0", None);

    let err = dispatcher.dispatch("1", false).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transport(TransportError::ChildExited)
    ));
    assert!(dispatcher.is_defunct());
}

#[tokio::test]
async fn test_json_line_timeout_desynchronizes() {
    let mut bridge = JsonLineBridge::spawn(
        &fake_re("read -r line; sleep 5"),
        Some(Duration::from_millis(200)),
    )
    .unwrap();

    let err = bridge.round_trip(&Request::execute("1")).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    assert!(bridge.is_desynchronized());

    let err = bridge.round_trip(&Request::execute("2")).await.unwrap_err();
    assert!(matches!(err, TransportError::Desynchronized));

    bridge.terminate().await;
}

#[tokio::test]
async fn test_json_line_cancel_mid_flight_stops_interpreter() {
    let mut bridge = JsonLineBridge::spawn(&fake_re("read -r line; sleep 5"), None).unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        bridge.round_trip(&Request::execute("loop {}")),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(bridge.is_desynchronized());

    let err = bridge.cancel().await.unwrap_err();
    assert!(matches!(err, TransportError::Interrupted));
}

#[tokio::test]
async fn test_json_line_cancel_between_cells_is_harmless() {
    let mut dispatcher = json_line(COUNTER, None);

    dispatcher.cancel().await.unwrap();
    let evaluated = dispatcher.dispatch("x", false).await.unwrap();
    assert_eq!(
        evaluated.events,
        vec![DisplayEvent::display_data("text/plain", "1")]
    );

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_json_line_terminated_bridge_refuses_requests() {
    let mut bridge = JsonLineBridge::spawn(&fake_re("cat"), None).unwrap();
    bridge.terminate().await;

    let err = bridge.round_trip(&Request::execute("1")).await.unwrap_err();
    assert!(matches!(err, TransportError::Terminated));
}

#[tokio::test]
async fn test_shutdown_makes_dispatcher_defunct() {
    let mut dispatcher = json_line("cat", None);
    dispatcher.shutdown().await;

    let err = dispatcher.dispatch("1", false).await.unwrap_err();
    assert!(matches!(err, DispatchError::Defunct { .. }));
    assert_eq!(dispatcher.fault(), Some("kernel shut down"));
}
