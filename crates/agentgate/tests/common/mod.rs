//! Test utilities: fake agent binaries and a router wired against them.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use agentgate::config::AppConfig;
use agentgate::server::Gateway;
use axum::{
    Router,
    body::{Body, BodyDataStream},
    http::{Method, Request, StatusCode, header},
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub const API_KEY: &str = "test-key";

/// Records its arguments to `args.txt` in its working directory and replays
/// a short successful streaming session.
const HELLO_AGENT: &str = r#"#!/bin/sh
printf '%s\n' "$@" > args.txt
cat <<'EOF'
{"type":"system","subtype":"init","session_id":"sess-hello"}
{"type":"stream_event","event":{"type":"message_start","message":{"usage":{"input_tokens":10,"output_tokens":1}}}}
{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}
not json at all
{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}}
{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"!"}}}
{"type":"stream_event","event":{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}}
{"type":"result","subtype":"success","is_error":false,"result":"Hello!","session_id":"sess-hello"}
EOF
"#;

/// Fails before producing any output.
const FAILING_AGENT: &str = r#"#!/bin/sh
echo "permission denied" >&2
exit 1
"#;

/// Streams one text delta, then idles until terminated. On SIGTERM it
/// writes `terminated.txt` to its working directory.
const LINGERING_AGENT: &str = r#"#!/bin/sh
trap 'echo terminated > terminated.txt; exit 143' TERM
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial"}}}'
i=0
while [ "$i" -lt 300 ]; do
  sleep 0.1
  i=$((i + 1))
done
"#;

struct Agents {
    _dir: TempDir,
    hello: PathBuf,
    failing: PathBuf,
    lingering: PathBuf,
}

// Written once, before any test spawns a child, so no script is still open
// for writing when it is executed.
static AGENTS: LazyLock<Agents> = LazyLock::new(|| {
    let dir = TempDir::new().expect("create agent dir");
    let hello = write_script(dir.path(), "hello-agent", HELLO_AGENT);
    let failing = write_script(dir.path(), "failing-agent", FAILING_AGENT);
    let lingering = write_script(dir.path(), "lingering-agent", LINGERING_AGENT);
    Agents {
        _dir: dir,
        hello,
        failing,
        lingering,
    }
});

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write agent script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod agent script");
    path
}

pub fn hello_agent() -> PathBuf {
    AGENTS.hello.clone()
}

pub fn failing_agent() -> PathBuf {
    AGENTS.failing.clone()
}

pub fn lingering_agent() -> PathBuf {
    AGENTS.lingering.clone()
}

/// A gateway under test plus the directories it works in.
pub struct TestApp {
    pub gateway: Gateway,
    /// Default working directory of the agent.
    pub workdir: TempDir,
    _images: TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.gateway.router.clone()
    }

    /// Arguments the hello agent was last invoked with, if it ran in `dir`.
    pub fn recorded_args_in(dir: &Path) -> Option<Vec<String>> {
        let text = fs::read_to_string(dir.join("args.txt")).ok()?;
        Some(text.lines().map(str::to_string).collect())
    }

    pub fn recorded_args(&self) -> Option<Vec<String>> {
        Self::recorded_args_in(self.workdir.path())
    }
}

/// Options for [`test_app_with`].
pub struct AppOptions {
    pub binary: PathBuf,
    pub confirm_workdir: bool,
    pub api_key: Option<String>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            binary: hello_agent(),
            confirm_workdir: false,
            api_key: None,
        }
    }
}

pub fn test_app() -> TestApp {
    test_app_with(AppOptions::default())
}

pub fn test_app_with(options: AppOptions) -> TestApp {
    let workdir = TempDir::new().expect("create workdir");
    let images = TempDir::new().expect("create image dir");

    let mut config = AppConfig::default();
    config.agent.binary = options.binary.display().to_string();
    config.agent.default_cwd = workdir.path().display().to_string();
    config.agent.confirm_workdir = options.confirm_workdir;
    config.agent.image_dir = Some(images.path().display().to_string());
    config.agent.timeout_secs = 30;
    config.server.api_key = options.api_key;

    let validated = config.validate().expect("valid test config");
    TestApp {
        gateway: Gateway::build(&validated),
        workdir,
        _images: images,
    }
}

pub async fn get(router: Router, uri: &str, token: Option<&str>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().uri(uri).method(Method::GET);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    send(router, builder.body(Body::empty()).unwrap()).await
}

pub async fn post_json(
    router: Router,
    uri: &str,
    body: &Value,
    token: Option<&str>,
) -> (StatusCode, Vec<u8>) {
    post_raw(router, uri, serde_json::to_string(body).unwrap(), token).await
}

pub async fn post_raw(
    router: Router,
    uri: &str,
    body: String,
    token: Option<&str>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    send(router, builder.body(Body::from(body)).unwrap()).await
}

/// POST a chat request and return the status plus the unread body stream.
pub async fn open_stream(router: Router, body: &Value) -> (StatusCode, BodyDataStream) {
    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    (response.status(), response.into_body().into_data_stream())
}

/// Poll `check` every 50ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap();
    (status, body.to_vec())
}

pub fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or_else(|e| {
        panic!(
            "invalid JSON body ({e}): {}",
            String::from_utf8_lossy(body)
        )
    })
}

/// `data:` payloads of an SSE body, in order.
pub fn sse_data(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .flat_map(|frame| frame.lines())
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

/// SSE payloads parsed as chunks, with the `[DONE]` sentinel checked and
/// removed.
pub fn sse_chunks(body: &[u8]) -> Vec<Value> {
    let mut data = sse_data(body);
    assert_eq!(data.pop().as_deref(), Some("[DONE]"), "stream must end with [DONE]");
    data.iter()
        .map(|d| serde_json::from_str(d).unwrap())
        .collect()
}
