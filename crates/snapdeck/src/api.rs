//! JSON HTTP surface over the application context.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use protocol::job::Job;
use protocol::zfs::{Filesystems, Holds, SnapshotFile, Snapshots};
use protocol::{CommandResult, Task, TaskAction};
use remote::HostSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use zfs::{
    SnapshotCommand, SnapshotCreate, SnapshotDestroy, SnapshotHold, SnapshotRelease,
    SnapshotRename,
};

use crate::events::SnapdeckEvent;
use crate::jobs::{JobRequest, JobRunError};
use crate::state::{AppContext, Connection};
use crate::tasks::RunRefusal;
use crate::terminal::{host_terminal_ws_handler, job_terminal_ws_handler};

#[derive(Clone)]
pub(crate) struct ApiState {
    pub(crate) context: Arc<AppContext>,
}

pub(crate) fn router(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/key", get(public_key))
        .route("/hosts", get(list_hosts).post(upsert_host))
        .route("/hosts/:host", delete(remove_host))
        .route("/hosts/:host/key", post(send_key))
        .route("/hosts/:host/filesystems", get(filesystems))
        .route("/hosts/:host/snapshots", get(snapshots))
        .route("/hosts/:host/holds", get(holds))
        .route("/hosts/:host/find", get(find_files))
        .route("/hosts/:host/cancel", post(cancel_host))
        .route("/hosts/:host/terminal", get(host_terminal_ws_handler))
        .route("/tasks", get(list_tasks).post(create_tasks))
        .route("/tasks/apply", post(apply_tasks))
        .route("/tasks/dry-run", get(dry_run_tasks))
        .route("/tasks/reset", post(reset_tasks))
        .route("/tasks/:timestamp", delete(remove_task))
        .route("/history", get(history))
        .route("/jobs", get(list_jobs).post(save_job))
        .route("/jobs/:id", delete(remove_job))
        .route("/jobs/:id/run", post(run_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/next-run", post(set_next_run))
        .route("/jobs/:id/terminal", get(job_terminal_ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(ApiState { context })
        .layer(middleware::from_fn(log_http_request))
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    message: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, message = %self.message, "request failed");
        }
        (
            self.status,
            Json(ActionResponse {
                message: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn message(text: impl Into<String>) -> Json<ActionResponse> {
    Json(ActionResponse {
        message: text.into(),
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        "http request"
    );
    response
}

async fn connection(state: &ApiState, host: &str) -> Result<Arc<Connection>, ApiError> {
    state
        .context
        .connection(host)
        .await
        .ok_or_else(|| ApiError::not_found(format!("host {host} is not configured")))
}

async fn public_key(State(state): State<ApiState>) -> ApiResult<ActionResponse> {
    let key = state.context.profile().public_key().await?;
    Ok(message(key))
}

#[derive(Debug, Serialize)]
struct HostInfo {
    host: String,
    hostname: String,
    username: String,
    busy: bool,
    password: bool,
}

async fn list_hosts(State(state): State<ApiState>) -> Json<Vec<HostInfo>> {
    let hosts = state
        .context
        .connections()
        .await
        .iter()
        .map(|connection| {
            let ssh = connection.executor();
            HostInfo {
                host: ssh.host().to_string(),
                hostname: ssh.hostname().to_string(),
                username: ssh.username().to_string(),
                busy: ssh.is_busy(),
                password: ssh.has_password(),
            }
        })
        .collect();
    Json(hosts)
}

#[derive(Debug, Deserialize)]
struct HostPayload {
    host: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    options: BTreeMap<String, String>,
}

async fn upsert_host(
    State(state): State<ApiState>,
    Json(payload): Json<HostPayload>,
) -> ApiResult<ActionResponse> {
    if payload.host.trim().is_empty() {
        return Err(ApiError::bad_request("host is required"));
    }
    let password = payload.password.filter(|password| !password.is_empty());
    let connection = state
        .context
        .upsert_host(HostSpec {
            host: payload.host,
            hostname: payload.hostname,
            username: payload.username,
            password,
            options: payload.options,
        })
        .await?;
    Ok(message(format!("host {} stored", connection.name())))
}

async fn remove_host(
    Path(host): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<ActionResponse> {
    if !state.context.remove_host(&host).await? {
        return Err(ApiError::not_found(format!("host {host} is not configured")));
    }
    Ok(message(format!("host {host} removed")))
}

async fn send_key(Path(host): Path<String>, State(state): State<ApiState>) -> ApiResult<CommandResult> {
    let connection = connection(&state, &host).await?;
    let ssh = connection.executor();
    if !ssh.has_password() {
        return Err(ApiError::bad_request(format!(
            "host {host} has no password to install the key with"
        )));
    }
    Ok(Json(ssh.send_key().await?))
}

async fn filesystems(
    Path(host): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<CommandResult<Filesystems>> {
    let connection = connection(&state, &host).await?;
    Ok(Json(connection.filesystems().await))
}

async fn snapshots(
    Path(host): Path<String>,
    State(state): State<ApiState>,
) -> ApiResult<CommandResult<Snapshots>> {
    let connection = connection(&state, &host).await?;
    Ok(Json(connection.snapshots().await))
}

#[derive(Debug, Deserialize)]
struct HoldsQuery {
    snapshot: Option<String>,
}

async fn holds(
    Path(host): Path<String>,
    Query(query): Query<HoldsQuery>,
    State(state): State<ApiState>,
) -> ApiResult<CommandResult<Holds>> {
    let connection = connection(&state, &host).await?;
    let snapshot = query.snapshot.filter(|snapshot| !snapshot.is_empty());
    Ok(Json(connection.holds_for_snapshot(snapshot.as_deref()).await))
}

#[derive(Debug, Deserialize)]
struct FindQuery {
    filesystem: String,
    pattern: String,
}

async fn find_files(
    Path(host): Path<String>,
    Query(query): Query<FindQuery>,
    State(state): State<ApiState>,
) -> ApiResult<CommandResult<Vec<SnapshotFile>>> {
    let connection = connection(&state, &host).await?;
    let max_lines = state.context.config().limits.max_find_lines;
    Ok(Json(
        connection
            .find_files_in_snapshots(&query.filesystem, &query.pattern, max_lines)
            .await,
    ))
}

async fn cancel_host(Path(host): Path<String>, State(state): State<ApiState>) -> ApiResult<ActionResponse> {
    let connection = connection(&state, &host).await?;
    connection.executor().terminate();
    Ok(message("cancel requested"))
}

async fn list_tasks(State(state): State<ApiState>) -> Json<Vec<Task>> {
    Json(state.context.tasks().list())
}

#[derive(Debug, Deserialize)]
struct TaskPayload {
    action: TaskAction,
    #[serde(default)]
    name: String,
    #[serde(default)]
    new_name: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    recursive: bool,
    /// Used as-is for `custom`.
    #[serde(default)]
    command: String,
    hosts: Vec<String>,
    #[serde(default)]
    auto: bool,
}

impl TaskPayload {
    fn render(&self) -> Result<String, String> {
        if self.action == TaskAction::Custom {
            if self.command.trim().is_empty() {
                return Err("custom task needs a command".to_string());
            }
            return Ok(self.command.clone());
        }
        if self.name.trim().is_empty() {
            return Err("snapshot name is required".to_string());
        }
        let name = self.name.clone();
        let recursive = self.recursive;
        let command = match self.action {
            TaskAction::Create => SnapshotCreate { name, recursive }.command(),
            TaskAction::Destroy => SnapshotDestroy { name, recursive }.command(),
            TaskAction::Rename => {
                if self.new_name.trim().is_empty() {
                    return Err("rename needs new_name".to_string());
                }
                SnapshotRename {
                    name,
                    new_name: self.new_name.clone(),
                    recursive,
                }
                .command()
            }
            TaskAction::Hold => match &self.tag {
                Some(tag) => SnapshotHold {
                    name,
                    tag: tag.clone(),
                    recursive,
                }
                .command(),
                None => SnapshotHold::keep(name, recursive).command(),
            },
            TaskAction::Release => match &self.tag {
                Some(tag) => SnapshotRelease {
                    name,
                    tag: tag.clone(),
                    recursive,
                }
                .command(),
                None => SnapshotRelease::keep(name, recursive).command(),
            },
            TaskAction::Custom => self.command.clone(),
        };
        Ok(command)
    }
}

async fn create_tasks(
    State(state): State<ApiState>,
    Json(payload): Json<TaskPayload>,
) -> ApiResult<Vec<Task>> {
    if payload.hosts.is_empty() {
        return Err(ApiError::bad_request("at least one host is required"));
    }
    let command = payload.render().map_err(ApiError::bad_request)?;
    let tasks = state
        .context
        .enqueue_tasks(payload.action, &command, &payload.hosts, payload.auto)
        .await;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
struct TimestampsPayload {
    timestamps: Vec<u64>,
}

#[derive(Debug, Serialize)]
struct TaskOutcome {
    timestamp: u64,
    task: Option<Task>,
    skipped: Option<String>,
}

async fn apply_tasks(
    State(state): State<ApiState>,
    Json(payload): Json<TimestampsPayload>,
) -> Json<Vec<TaskOutcome>> {
    let outcomes = state
        .context
        .apply_tasks(&payload.timestamps)
        .await
        .into_iter()
        .map(|(timestamp, outcome)| match outcome {
            Ok(task) => TaskOutcome {
                timestamp,
                task: Some(task),
                skipped: None,
            },
            Err(refusal) => TaskOutcome {
                timestamp,
                task: None,
                skipped: Some(refusal_text(&refusal)),
            },
        })
        .collect();
    Json(outcomes)
}

fn refusal_text(refusal: &RunRefusal) -> String {
    match refusal {
        RunRefusal::Missing => "task not found".to_string(),
        RunRefusal::NotPending(status) => format!("task is {status:?}, not pending"),
        RunRefusal::Busy => "host is busy".to_string(),
    }
}

async fn dry_run_tasks(State(state): State<ApiState>) -> Json<Vec<Task>> {
    Json(state.context.tasks().dry_run())
}

async fn reset_tasks(
    State(state): State<ApiState>,
    Json(payload): Json<TimestampsPayload>,
) -> Json<Vec<Task>> {
    Json(state.context.reset_tasks(&payload.timestamps))
}

async fn remove_task(Path(timestamp): Path<u64>, State(state): State<ApiState>) -> ApiResult<Task> {
    state
        .context
        .remove_task(timestamp)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("task {timestamp} not found")))
}

async fn history(State(state): State<ApiState>) -> Json<Vec<Value>> {
    Json(state.context.history().records())
}

async fn list_jobs(State(state): State<ApiState>) -> Json<Vec<Job>> {
    Json(state.context.automation().scheduler().list())
}

async fn save_job(State(state): State<ApiState>, Json(request): Json<JobRequest>) -> ApiResult<Vec<Job>> {
    request.validate().map_err(ApiError::bad_request)?;
    Ok(Json(state.context.save_job(&request).await?))
}

async fn remove_job(Path(id): Path<String>, State(state): State<ApiState>) -> ApiResult<Job> {
    state
        .context
        .remove_job(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {id} not found")))
}

async fn run_job(Path(id): Path<String>, State(state): State<ApiState>) -> ApiResult<CommandResult> {
    match state.context.run_job(&id).await {
        Ok(result) => Ok(Json(result)),
        Err(JobRunError::Missing) => Err(ApiError::not_found(format!("job {id} not found"))),
        Err(JobRunError::Busy) => Err(ApiError::conflict(format!("job {id} is already running"))),
        Err(JobRunError::Setup(err)) => Err(err.into()),
    }
}

async fn cancel_job(Path(id): Path<String>, State(state): State<ApiState>) -> ApiResult<ActionResponse> {
    let Some(handler) = state.context.automation().handler(&id) else {
        return Err(ApiError::not_found(format!("job {id} has not run")));
    };
    handler.terminate();
    Ok(message("cancel requested"))
}

#[derive(Debug, Deserialize)]
struct NextRunPayload {
    next_run: Option<f64>,
}

async fn set_next_run(
    Path(id): Path<String>,
    State(state): State<ApiState>,
    Json(payload): Json<NextRunPayload>,
) -> ApiResult<ActionResponse> {
    let updated = state
        .context
        .automation()
        .scheduler()
        .modify_next_run(&id, payload.next_run)?;
    if !updated {
        return Err(ApiError::not_found(format!("job {id} not found")));
    }
    Ok(message("next run updated"))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: ApiState) {
    let hosts = state.context.host_names().await;
    if send_ws_event(&mut socket, SnapdeckEvent::HostsChanged { hosts })
        .await
        .is_err()
    {
        return;
    }

    let mut rx = state.context.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_ws_event(&mut socket, event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_ws_event(socket: &mut WebSocket, event: SnapdeckEvent) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(&event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize websocket event");
            return Ok(());
        }
    };
    socket.send(Message::Text(payload)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(raw: serde_json::Value) -> TaskPayload {
        serde_json::from_value(raw).expect("decode payload")
    }

    #[test]
    fn task_payload_renders_snapshot_commands() {
        let create = payload(serde_json::json!({
            "action": "create",
            "name": "tank/data@daily",
            "recursive": true,
            "hosts": ["backup1"]
        }));
        assert_eq!(create.render(), Ok("zfs snapshot -r tank/data@daily".to_string()));

        let hold = payload(serde_json::json!({
            "action": "hold",
            "name": "tank/data@daily",
            "hosts": ["backup1"]
        }));
        assert_eq!(hold.render(), Ok("zfs hold  keep tank/data@daily".to_string()));

        let release = payload(serde_json::json!({
            "action": "release",
            "name": "tank/data@daily",
            "tag": "backup",
            "recursive": true,
            "hosts": ["backup1"]
        }));
        assert_eq!(
            release.render(),
            Ok("zfs release -r backup tank/data@daily".to_string())
        );
    }

    #[test]
    fn task_payload_rejects_incomplete_requests() {
        let rename = payload(serde_json::json!({
            "action": "rename",
            "name": "tank/data@a",
            "hosts": ["backup1"]
        }));
        assert!(rename.render().is_err());
        let custom = payload(serde_json::json!({ "action": "custom", "hosts": ["backup1"] }));
        assert!(custom.render().is_err());
        let custom = payload(serde_json::json!({
            "action": "custom",
            "command": "zpool status",
            "hosts": ["backup1"]
        }));
        assert_eq!(custom.render(), Ok("zpool status".to_string()));
    }

    #[test]
    fn api_errors_map_to_status_codes() {
        assert_eq!(ApiError::not_found("x").into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::conflict("x").into_response().status(), StatusCode::CONFLICT);
        let internal: ApiError = anyhow::anyhow!("disk full").into();
        assert_eq!(
            internal.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
