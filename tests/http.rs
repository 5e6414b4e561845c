mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::{app_state, ScriptedBackend, Step};
use sandterm::http_server::router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(script: Vec<Step>) -> (Router, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new(script));
    (router(app_state(backend.clone())), backend)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

#[tokio::test]
async fn health_check() {
    let (app, _) = app(vec![]);
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".into()));
}

#[tokio::test]
async fn run_returns_camel_case_payload() {
    let (app, _) = app(vec![Step::Emit("hi\n"), Step::Exit(0)]);

    let (status, body) = send(
        &app,
        Method::POST,
        "/run",
        Some(json!({"code": "print('hi')", "language": "python"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"output": "hi\n", "waitingForInput": false, "state": "COMPLETED", "timedOut": false})
    );
}

#[tokio::test]
async fn interactive_round_trip() {
    let (app, backend) = app(vec![
        Step::Emit("Name? "),
        Step::ReadLine,
        Step::EmitWithInput("Hello, {}\n"),
        Step::Exit(0),
    ]);

    let (status, first) = send(
        &app,
        Method::POST,
        "/run",
        Some(json!({"code": "name = input('Name? ')", "language": "python"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["waitingForInput"], json!(true));
    assert_eq!(first["inputPrompt"], json!("Name?"));
    let session_id = first["sessionId"].as_str().unwrap().to_string();

    let (status, detail) = send(&app, Method::GET, &format!("/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["state"], json!("AWAITING_INPUT"));
    assert_eq!(detail["history"], json!(["Name? "]));

    let (status, second) = send(
        &app,
        Method::POST,
        "/input",
        Some(json!({"sessionId": session_id, "input": "Bob"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["output"], json!("Name? Bob\nHello, Bob\n"));
    assert_eq!(second["state"], json!("COMPLETED"));
    assert!(second.get("sessionId").is_none());
    assert_eq!(backend.inputs(), vec!["Bob"]);
}

#[tokio::test]
async fn unknown_session_is_404() {
    let (app, _) = app(vec![]);

    let (status, body) = send(
        &app,
        Method::POST,
        "/input",
        Some(json!({"sessionId": "nope", "input": "x"})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], json!("session_not_found"));
    assert_eq!(body["retryable"], json!(false));
}

#[tokio::test]
async fn unsupported_language_is_400() {
    let (app, backend) = app(vec![]);

    let (status, body) = send(
        &app,
        Method::POST,
        "/run",
        Some(json!({"code": "1", "language": "cobol"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], json!("unsupported_language"));
    assert_eq!(backend.created(), 0);
}

#[tokio::test]
async fn execution_error_carries_exit_code_and_output() {
    let (app, _) = app(vec![Step::Emit("Traceback\n"), Step::Exit(1)]);

    let (status, body) = send(
        &app,
        Method::POST,
        "/run",
        Some(json!({"code": "1/0", "language": "python"})),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], json!("execution_error"));
    assert_eq!(body["exitCode"], json!(1));
    assert_eq!(body["output"], json!("Traceback\n"));
}

#[tokio::test]
async fn delete_cancels_and_lists_nothing() {
    let (app, backend) = app(vec![Step::Emit("Name? "), Step::ReadLine]);
    let (_, first) = send(
        &app,
        Method::POST,
        "/run",
        Some(json!({"code": "input()", "language": "python"})),
    )
    .await;
    let session_id = first["sessionId"].as_str().unwrap().to_string();

    let (status, list) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::DELETE, &format!("/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(backend.destroy_calls(), 1);

    let (status, list) = send(&app, Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list, json!([]));

    let (status, _) = send(&app, Method::DELETE, &format!("/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn poll_on_silent_program_reports_still_running() {
    let (app, _) = app(vec![]);
    let (_, first) = send(
        &app,
        Method::POST,
        "/run",
        Some(json!({"code": "import time; time.sleep(60)", "language": "python"})),
    )
    .await;
    assert_eq!(first["timedOut"], json!(true));
    let session_id = first["sessionId"].as_str().unwrap().to_string();

    let (status, second) = send(&app, Method::POST, "/poll", Some(json!({"sessionId": session_id}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["output"], json!("still running, no output yet"));
    assert_eq!(second["state"], json!("AWAITING_OUTPUT"));
}

#[tokio::test]
async fn poll_on_pending_read_still_asks_for_input() {
    let (app, _) = app(vec![Step::Emit("Name? "), Step::ReadLine]);
    let (_, first) = send(
        &app,
        Method::POST,
        "/run",
        Some(json!({"code": "input('Name? ')", "language": "python"})),
    )
    .await;
    let session_id = first["sessionId"].as_str().unwrap().to_string();

    let (status, second) = send(&app, Method::POST, "/poll", Some(json!({"sessionId": session_id}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["state"], json!("AWAITING_INPUT"));
    assert_eq!(second["waitingForInput"], json!(true));
    assert_eq!(second["inputPrompt"], json!("Name?"));
}
