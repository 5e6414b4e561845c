mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_wait, registry, ScriptedBackend, Step};
use sandterm::waiter::{wait_for_output, Observation, Progress};
use sandterm::{Result, SessionError};

async fn first_turn(backend: ScriptedBackend) -> (Result<Observation>, Vec<String>) {
    let backend = Arc::new(backend);
    let registry = registry(backend.clone(), Duration::from_secs(60));
    let session = registry.create("x").await.unwrap();
    let mut inner = session.lock().await;
    let observed = wait_for_output(&session, &mut inner, backend.as_ref(), &fast_wait()).await;
    (observed, inner.history.entries().to_vec())
}

#[tokio::test]
async fn exit_zero_ends_the_turn() {
    let (observed, history) = first_turn(ScriptedBackend::new(vec![
        Step::Emit("hi\n"),
        Step::Exit(0),
    ]))
    .await;

    let observed = observed.unwrap();
    assert_eq!(observed.progress, Progress::Exited);
    assert_eq!(observed.text, "hi\n");
    assert_eq!(history, vec!["hi\n"]);
}

#[tokio::test]
async fn history_is_the_concatenation_of_chunks() {
    let (observed, history) = first_turn(ScriptedBackend::new(vec![
        Step::Emit("one\n"),
        Step::Pause(10),
        Step::Emit("two\n"),
        Step::Pause(10),
        Step::Emit("three\n"),
        Step::Exit(0),
    ]))
    .await;

    assert_eq!(observed.unwrap().text, "one\ntwo\nthree\n");
    assert_eq!(history.concat(), "one\ntwo\nthree\n");
}

#[tokio::test]
async fn prompt_ends_the_turn_early() {
    let (observed, _) = first_turn(ScriptedBackend::new(vec![Step::Emit("Name? "), Step::ReadLine])).await;

    let observed = observed.unwrap();
    assert_eq!(observed.progress, Progress::InputRequested { prompt: "Name?".into() });
    assert_eq!(observed.text, "Name? ");
    assert!(!observed.timed_out());
}

#[tokio::test]
async fn quiet_program_pauses_after_output() {
    let (observed, _) = first_turn(ScriptedBackend::new(vec![Step::Emit("working\n")])).await;

    let observed = observed.unwrap();
    assert_eq!(observed.progress, Progress::Paused);
    assert_eq!(observed.text, "working\n");
}

#[tokio::test]
async fn silent_program_is_still_running_at_budget() {
    let (observed, history) = first_turn(ScriptedBackend::new(vec![])).await;

    let observed = observed.unwrap();
    assert_eq!(observed.progress, Progress::StillRunning);
    assert!(observed.timed_out());
    assert!(history.is_empty());
}

#[tokio::test]
async fn chatty_program_returns_partial_output_at_budget() {
    let mut script = Vec::new();
    for _ in 0..40 {
        script.push(Step::Emit("tick\n"));
        script.push(Step::Pause(20));
    }
    let (observed, history) = first_turn(ScriptedBackend::new(script)).await;

    let observed = observed.unwrap();
    assert_eq!(observed.progress, Progress::Partial);
    assert!(observed.timed_out());
    assert!(observed.text.starts_with("tick\n"));
    assert_eq!(history.concat(), observed.text);
}

#[tokio::test]
async fn nonzero_exit_is_an_execution_error() {
    let (observed, _) = first_turn(ScriptedBackend::new(vec![
        Step::Emit("Traceback\n"),
        Step::Exit(1),
    ]))
    .await;

    match observed {
        Err(SessionError::Execution { exit_code, output }) => {
            assert_eq!(exit_code, 1);
            assert_eq!(output, "Traceback\n");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn multiplexed_frames_are_stripped() {
    let (observed, _) = first_turn(
        ScriptedBackend::new(vec![Step::Emit("hi\n"), Step::Exit(0)]).multiplexed(),
    )
    .await;

    assert_eq!(observed.unwrap().text, "hi\n");
}

#[tokio::test]
async fn attach_artifacts_and_carriage_returns_are_removed() {
    let (observed, _) = first_turn(ScriptedBackend::new(vec![
        Step::EmitRaw(b"{\"stream\":true,\"stdin\":true}hi\r\n".to_vec()),
        Step::Exit(0),
    ]))
    .await;

    assert_eq!(observed.unwrap().text, "hi\n");
}
