use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use storygen::{app, build_state_from_env};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    #[allow(dead_code)]
    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    #[allow(dead_code)]
    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    /// Point the service at a mock completion endpoint and an audit file,
    /// clearing every other storygen variable.
    #[allow(dead_code)]
    pub fn baseline(&mut self, completion_url: &str, audit_path: &Path) {
        for key in [
            "STORYGEN_CONFIG",
            "STORYGEN_AUTH_TOKENS",
            "STORYGEN_MAX_REQUEST_BYTES",
            "STORYGEN_TRUST_FORWARDED",
            "STORYGEN_MAX_PROMPT_TOKENS",
            "STORYGEN_MAX_OUTPUT_TOKENS",
            "LOG_MAX_BYTES",
            "LOG_ROTATE_KEEP",
            "LOG_ROTATE_COMPRESS",
            "LLM_API_KEY",
            "LLM_MODEL",
            "LLM_TIMEOUT_MS",
        ] {
            self.remove(key);
        }
        self.set("LLM_API_URL", completion_url);
        self.set("AUDIT_LOG_FILE", audit_path.to_str().unwrap());
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// What the mock completion service answers with.
#[derive(Clone)]
#[allow(dead_code)]
pub enum MockReply {
    /// 200 with `choices[0].message.content` set to the text.
    Content(String),
    /// Raw status and body.
    Status(u16, String),
}

/// Observations from the mock completion service.
#[derive(Clone, Default)]
pub struct MockCompletion {
    pub calls: Arc<AtomicUsize>,
    pub last_request: Arc<Mutex<Option<Value>>>,
    pub last_auth: Arc<Mutex<Option<String>>>,
}

#[allow(dead_code)]
impl MockCompletion {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<Value> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn last_auth(&self) -> Option<String> {
        self.last_auth.lock().unwrap().clone()
    }
}

async fn mock_handler(
    State((reply, mock)): State<(MockReply, MockCompletion)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    *mock.last_request.lock().unwrap() = Some(body);
    *mock.last_auth.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match reply {
        MockReply::Content(text) => Json(json!({
            "id": "cmpl-test",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}}]
        }))
        .into_response(),
        MockReply::Status(code, body) => {
            (StatusCode::from_u16(code).unwrap(), body).into_response()
        }
    }
}

/// Start an OpenAI-style completion mock; returns its URL.
#[allow(dead_code)]
pub async fn start_mock_completion(reply: MockReply) -> (String, MockCompletion) {
    let mock = MockCompletion::default();
    let router = Router::new()
        .route("/v1/chat/completions", post(mock_handler))
        .with_state((reply, mock.clone()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/v1/chat/completions", addr), mock)
}

/// Serve the app from the current environment on an ephemeral port.
#[allow(dead_code)]
pub async fn spawn_app() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = build_state_from_env().await.unwrap();
    let app = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("http://{}", addr), handle)
}

#[allow(dead_code)]
pub fn read_audit(path: &Path) -> Vec<Value> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// A well-formed Story result, wrapped in a fence the way models often reply.
#[allow(dead_code)]
pub fn story_reply() -> String {
    let story = json!({
        "title": "Sign in with email and password",
        "description": "As a returning customer, I want to sign in with my email, so that I can see my orders",
        "acceptanceCriteria": [
            "Given valid credentials When I submit the form Then I land on my dashboard",
            "Given a wrong password When I submit Then I see a generic error",
            "Given five failed attempts When I try again Then the account is locked for 15 minutes"
        ],
        "priority": "high",
        "storyPoints": 3,
        "persona": "Returning customer",
        "problemStatement": "Customers cannot reach their order history",
        "businessValue": "Fewer support tickets about orders",
        "assumptions": ["Accounts already exist"],
        "risks": ["Credential stuffing"],
        "technicalNotes": "Reuse the session service",
        "dependencies": ["Account access feature"],
        "storyType": "feature",
        "tags": ["auth"],
        "definitionOfReady": ["Designs approved"],
        "definitionOfDone": ["Deployed to staging"],
        "confidenceLevel": "high",
        "customerJourneyStage": "engage"
    });
    format!("```json\n{}\n```", serde_json::to_string_pretty(&story).unwrap())
}

#[allow(dead_code)]
pub fn story_body() -> Value {
    json!({
        "storyLevel": "story",
        "userInput": "User wants to log in",
        "parentId": "feature-42",
        "parentContext": {
            "level": "feature",
            "title": "Account access",
            "userValue": "Customers reach their data quickly"
        },
        "additionalFields": {"userRole": "returning customer", "goal": "sign in with email"}
    })
}
