#[path = "common/mod.rs"]
mod common;

use std::convert::Infallible;
use std::io::Write;

use axum::body::Body;
use axum::http::Request;
use bytes::Bytes;
use common::{read_audit, spawn_app, start_mock_completion, story_body, story_reply, EnvGuard, MockReply};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use once_cell::sync::Lazy;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use storygen::{app, build_state_from_env};
use tempfile::{tempdir, NamedTempFile};
use tokio::sync::Mutex;
use tokio_stream::iter;
use tower::ServiceExt;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[tokio::test]
async fn healthz_reports_levels_and_budget() {
    let _lock = ENV_MUTEX.lock().await;
    let dir = tempdir().unwrap();
    let mut env = EnvGuard::new();
    env.baseline("http://127.0.0.1:9/unused", &dir.path().join("audit.jsonl"));
    env.set("STORYGEN_MAX_PROMPT_TOKENS", "1234");

    let router = app(build_state_from_env().await.unwrap());
    let resp = router
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), axum::http::StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], json!("ok"));
    assert_eq!(json["levels"], json!(["epic", "feature", "story", "task"]));
    assert_eq!(json["maxPromptTokens"], json!(1234));
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn metrics_count_outcomes_and_audit_lines() {
    let _lock = ENV_MUTEX.lock().await;
    let dir = tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let (url, _mock) = start_mock_completion(MockReply::Content(story_reply())).await;
    let mut env = EnvGuard::new();
    env.baseline(&url, &audit);

    let (base, handle) = spawn_app().await;
    let client = Client::new();
    let generate = format!("{}/generate-story", base);
    client.post(&generate).json(&story_body()).send().await.unwrap();
    let mut no_parent = story_body();
    no_parent["parentId"] = Value::Null;
    client.post(&generate).json(&no_parent).send().await.unwrap();

    let resp = client.get(format!("{}/metrics", base)).send().await.unwrap();
    assert!(resp.status().is_success());
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = resp.text().await.unwrap();
    assert!(text.contains("storygen_requests_total 2"));
    assert!(text.contains("storygen_success_total 1"));
    assert!(text.contains("storygen_failures_total{kind=\"validation_error\"} 1"));
    assert!(text.contains("storygen_failures_total{kind=\"rate_limited\"} 0"));
    assert!(text.contains("storygen_audit_records_total 2"));
    assert!(text.contains("storygen_audit_write_errors_total 0"));
    assert!(text.contains("storygen_request_latency_ms_bucket{le=\"+Inf\"} 2"));
    assert!(text.contains("storygen_process_uptime_seconds"));
    assert_eq!(text.matches("# HELP storygen_failures_total").count(), 1);
    assert_eq!(read_audit(&audit).len(), 2);
    handle.abort();
}

#[tokio::test]
async fn content_length_over_limit_returns_413() {
    let _lock = ENV_MUTEX.lock().await;
    let dir = tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let (url, mock) = start_mock_completion(MockReply::Content(story_reply())).await;
    let mut env = EnvGuard::new();
    env.baseline(&url, &audit);
    env.set("STORYGEN_MAX_REQUEST_BYTES", "256");

    let (base, handle) = spawn_app().await;
    let mut body = story_body();
    body["userInput"] = json!("X".repeat(2048));
    let resp = Client::new()
        .post(format!("{}/generate-story", base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["success"], json!(false));
    assert!(json["error"].as_str().unwrap().contains("Request too large"));
    assert_eq!(mock.calls(), 0);
    assert!(read_audit(&audit).is_empty());
    handle.abort();
}

#[tokio::test]
async fn chunked_payload_over_limit_returns_413() {
    let _lock = ENV_MUTEX.lock().await;
    let dir = tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let (url, _mock) = start_mock_completion(MockReply::Content(story_reply())).await;
    let mut env = EnvGuard::new();
    env.baseline(&url, &audit);
    env.set("STORYGEN_MAX_REQUEST_BYTES", "256");

    let (base, handle) = spawn_app().await;
    let mut body = story_body();
    body["userInput"] = json!("X".repeat(2048));
    let payload = body.to_string();

    let chunk_bytes: Vec<_> = payload
        .as_bytes()
        .chunks(128)
        .map(Bytes::copy_from_slice)
        .collect();
    let stream = iter(
        chunk_bytes
            .into_iter()
            .map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))),
    );
    let body = reqwest::Body::wrap(StreamBody::new(stream));

    let resp = Client::new()
        .post(format!("{}/generate-story", base))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json: Value = resp.json().await.unwrap();
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("body exceeded limit 256 bytes"));
    handle.abort();
}

#[tokio::test]
async fn invalid_configuration_fails_startup() {
    let _lock = ENV_MUTEX.lock().await;
    let dir = tempdir().unwrap();
    let mut env = EnvGuard::new();
    env.baseline("http://127.0.0.1:9/unused", &dir.path().join("audit.jsonl"));

    let mut config = NamedTempFile::new().unwrap();
    write!(config, "{{\"maxPromptTokens\": \"lots\"}}").unwrap();
    env.set("STORYGEN_CONFIG", config.path().to_str().unwrap());
    let err = build_state_from_env().await.err().expect("config should be rejected");
    assert!(format!("{:#}", err).contains("STORYGEN_CONFIG"));

    env.remove("STORYGEN_CONFIG");
    env.set("STORYGEN_MAX_PROMPT_TOKENS", "-5");
    assert!(build_state_from_env().await.is_err());
}
