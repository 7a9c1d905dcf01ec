//! HTTP control surface over the [`ProcessManager`].
//!
//! A thin `axum` router: every route resolves a tool by name — never by
//! index, since indices shift across `reload` — delegates to the
//! manager, and wraps the result in the `{ok, data}` / `{ok, error}`
//! envelope used throughout. Every request also narrates itself onto a
//! virtual tool's log stream, the same way a terminal multiplexer might
//! narrate operator actions into a dedicated pane.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::ToolConfig;
use crate::manager::ProcessManager;
use crate::process::{ToolSnapshot, ToolStatus};

/// Recommended default bind port for the control API.
pub const DEFAULT_PORT: u16 = 18765;

/// Invoked after a successful `/api/reload` with the freshly loaded tool
/// configuration, so the bootstrap binary can re-run
/// `start_all_with_dependencies` against the new tool set.
pub type ReloadCallback = Arc<dyn Fn(Vec<ToolConfig>) + Send + Sync>;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct ApiState {
    manager: ProcessManager,
    virtual_tool_index: usize,
    reload_callback: Option<ReloadCallback>,
}

impl ApiState {
    pub fn new(manager: ProcessManager, virtual_tool_index: usize) -> Self {
        Self {
            manager,
            virtual_tool_index,
            reload_callback: None,
        }
    }

    pub fn with_reload_callback(mut self, callback: ReloadCallback) -> Self {
        self.reload_callback = Some(callback);
        self
    }
}

/// Builds the router: routes, permissive CORS, and the per-request
/// narration middleware.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/processes", get(list_processes))
        .route("/api/processes/:name", get(get_process))
        .route("/api/processes/:name/logs", get(get_logs))
        .route("/api/processes/:name/stop", post(stop_process))
        .route("/api/processes/:name/restart", post(restart_process))
        .route("/api/processes/:name/clear", post(clear_process))
        .route("/api/reload", post(reload))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), narrate))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds to `127.0.0.1:{port}` and serves the control API until the
/// process is torn down.
pub async fn serve(state: ApiState, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP control API listening");
    axum::serve(listener, router(state)).await
}

/// Appends an `HH:MM:SS <METHOD> <path>` line to the API's virtual tool
/// before dispatching every request.
async fn narrate(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let line = format!(
        "{} {} {}",
        chrono::Local::now().format("%H:%M:%S"),
        request.method(),
        request.uri().path()
    );
    state.manager.add_log_to_tool(state.virtual_tool_index, line).await;
    next.run(request).await
}

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({"ok": false, "error": message}))).into_response()
    }
}

fn ok(data: impl Serialize) -> Json<Value> {
    Json(json!({"ok": true, "data": data}))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}

async fn health() -> Json<Value> {
    ok(json!({"status": "healthy"}))
}

#[derive(Serialize)]
struct ProcessSummary {
    name: String,
    description: Option<String>,
    status: String,
    #[serde(rename = "exitCode")]
    exit_code: Option<i32>,
    #[serde(rename = "logCount")]
    log_count: usize,
    pid: Option<i32>,
    #[serde(rename = "uptimeMillis")]
    uptime_millis: Option<i64>,
}

impl ProcessSummary {
    fn from_snapshot(tool: &ToolSnapshot) -> Self {
        let uptime_millis = match (tool.status.clone(), tool.start_time) {
            (ToolStatus::Running, Some(start)) => Some((chrono::Utc::now().timestamp_millis() - start).max(0)),
            _ => None,
        };
        Self {
            name: tool.config.name.clone(),
            description: tool.config.description.clone(),
            status: tool.status.as_str().to_string(),
            exit_code: tool.exit_code,
            log_count: tool.logs.len(),
            pid: tool.pid,
            uptime_millis,
        }
    }
}

#[derive(Serialize)]
struct ProcessDetail {
    #[serde(flatten)]
    summary: ProcessSummary,
    command: String,
    args: Vec<String>,
    cwd: Option<String>,
}

async fn list_processes(State(state): State<ApiState>) -> Json<Value> {
    let tools = state.manager.get_tools().await;
    let summaries: Vec<ProcessSummary> = tools
        .iter()
        .filter(|t| !t.is_virtual)
        .map(ProcessSummary::from_snapshot)
        .collect();
    ok(summaries)
}

async fn find_tool(state: &ApiState, name: &str) -> Result<ToolSnapshot, ApiError> {
    state
        .manager
        .get_tool_by_name(name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("no such process: {name}")))
}

async fn get_process(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = find_tool(&state, &name).await?;
    Ok(ok(ProcessDetail {
        summary: ProcessSummary::from_snapshot(&tool),
        command: tool.config.command.clone(),
        args: tool.config.args.clone(),
        cwd: tool.config.cwd.clone(),
    }))
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SearchType {
    #[default]
    Substring,
    Fuzzy,
}

#[derive(Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
    search: Option<String>,
    #[serde(rename = "searchType", default)]
    search_type: SearchType,
}

/// Subsequence match, case-insensitive: every character of `query` must
/// appear in `text` in order, with anything in between. No scoring — the
/// core only guarantees matches come back in source order, which falling
/// out of a single forward scan gets for free.
fn fuzzy_matches(text: &str, query: &str) -> bool {
    let mut haystack = text.to_lowercase().into_bytes().into_iter();
    for needle_byte in query.to_lowercase().bytes() {
        loop {
            match haystack.next() {
                Some(b) if b == needle_byte => break,
                Some(_) => continue,
                None => return false,
            }
        }
    }
    true
}

async fn get_logs(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let tool = find_tool(&state, &name).await?;
    let mut texts: Vec<String> = tool.logs.iter().map(|l| l.text()).collect();

    if let Some(search) = &query.search {
        texts.retain(|line| match query.search_type {
            SearchType::Substring => line.to_lowercase().contains(&search.to_lowercase()),
            SearchType::Fuzzy => fuzzy_matches(line, search),
        });
    }

    if let Some(n) = query.lines {
        if texts.len() > n {
            let start = texts.len() - n;
            texts.drain(..start);
        }
    }

    Ok(ok(texts))
}

async fn stop_process(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = find_tool(&state, &name).await?;
    if tool.status != ToolStatus::Running {
        return Err(ApiError::BadRequest(format!("process '{name}' is not running")));
    }
    state
        .manager
        .stop_tool(tool.index)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(ok(json!({"name": name})))
}

async fn restart_process(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = find_tool(&state, &name).await?;
    state
        .manager
        .restart_tool(tool.index)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(ok(json!({"name": name})))
}

async fn clear_process(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = find_tool(&state, &name).await?;
    state
        .manager
        .clear_logs(tool.index)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(ok(json!({"name": name})))
}

async fn reload(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .manager
        .reload(None)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if let Some(callback) = &state.reload_callback {
        callback(outcome.tools.clone());
    }
    Ok(ok(json!({
        "tools": outcome.tool_names,
        "warnings": outcome.warnings,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use std::time::Duration as StdDuration;

    fn echo_tool(name: &str, text: &str) -> ToolConfig {
        ToolConfig {
            name: name.to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), format!("echo {text}")],
            cwd: None,
            env: Default::default(),
            cleanup: Vec::new(),
            depends_on: Vec::new(),
            description: Some("a test tool".to_string()),
        }
    }

    async fn spawn_test_server() -> (String, ProcessManager) {
        let manager = ProcessManager::new(None, 100);
        manager.initialize(vec![echo_tool("greeter", "hi")]).await.unwrap();
        let virtual_index = manager.create_virtual_tool("MCP API").await;
        let state = ApiState::new(manager.clone(), virtual_index);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        (format!("http://{addr}"), manager)
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (base, _manager) = spawn_test_server().await;
        let body: Value = reqwest::get(format!("{base}/api/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["status"], "healthy");
    }

    #[tokio::test]
    async fn list_processes_excludes_virtual_tools() {
        let (base, _manager) = spawn_test_server().await;
        let body: Value = reqwest::get(format!("{base}/api/processes"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["name"], "greeter");
    }

    #[tokio::test]
    async fn unknown_process_is_404() {
        let (base, _manager) = spawn_test_server().await;
        let resp = reqwest::get(format!("{base}/api/processes/ghost")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (base, _manager) = spawn_test_server().await;
        let resp = reqwest::get(format!("{base}/api/nope")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_on_non_running_process_is_400() {
        let (base, _manager) = spawn_test_server().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/api/processes/greeter/stop"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn logs_endpoint_returns_joined_text_and_respects_tail_limit() {
        let (base, manager) = spawn_test_server().await;
        manager.start_tool(0).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        let body: Value = reqwest::get(format!("{base}/api/processes/greeter/logs?lines=1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let lines = body["data"].as_array().unwrap();
        assert_eq!(lines.len(), 1);
    }

    #[tokio::test]
    async fn logs_endpoint_filters_by_substring_search() {
        let (base, manager) = spawn_test_server().await;
        manager.start_tool(0).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(300)).await;

        let body: Value = reqwest::get(format!("{base}/api/processes/greeter/logs?search=hi"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let lines: Vec<String> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert!(lines.iter().all(|l| l.to_lowercase().contains("hi")));
    }

    #[tokio::test]
    async fn every_request_narrates_onto_the_virtual_tool() {
        let (base, manager) = spawn_test_server().await;
        let before = manager.get_tool(1).await.unwrap().logs.len();
        let _ = reqwest::get(format!("{base}/api/health")).await.unwrap();
        let after = manager.get_tool(1).await.unwrap().logs.len();
        assert!(after > before);
    }

    #[test]
    fn fuzzy_match_is_a_subsequence_in_order() {
        assert!(fuzzy_matches("Progress 100%", "p1"));
        assert!(!fuzzy_matches("Progress 100%", "1p"));
        assert!(!fuzzy_matches("abc", "abcd"));
    }
}
