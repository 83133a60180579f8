//! WebSocket view of a handler's output: everything captured for the
//! current run first, then live chunks until the socket closes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use runner::{ChannelObserver, Cli, Observer};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::ApiState;
use crate::jobs::JobHandler;
use crate::state::Connection;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalRequest {
    /// Terminate the running command.
    Cancel,
    Close,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TerminalResponse {
    Ready { source: String },
    Output { data: String },
    Error { message: String },
}

/// Whose output is shown.
enum TerminalSource {
    Host(Arc<Connection>),
    Job(Arc<JobHandler>),
}

impl TerminalSource {
    fn cli(&self) -> &Cli {
        match self {
            TerminalSource::Host(connection) => connection.executor().cli(),
            TerminalSource::Job(handler) => handler.cli(),
        }
    }
}

pub(crate) async fn host_terminal_ws_handler(
    ws: WebSocketUpgrade,
    Path(host): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let Some(connection) = state.context.connection(&host).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| handle_terminal(socket, host, TerminalSource::Host(connection)))
}

pub(crate) async fn job_terminal_ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let automation = state.context.automation();
    let Some(job) = automation.scheduler().get(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let handler = match automation.handler_for(&job) {
        Ok(handler) => handler,
        Err(err) => {
            tracing::warn!(job = %id, error = %err, "job terminal unavailable");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_terminal(socket, id, TerminalSource::Job(handler)))
}

async fn handle_terminal(mut socket: WebSocket, label: String, source: TerminalSource) {
    if send_response(
        &mut socket,
        TerminalResponse::Ready {
            source: label.clone(),
        },
    )
    .await
    .is_err()
    {
        return;
    }
    let (observer, mut output_rx) = ChannelObserver::new();
    let ids = source.cli().register(observer as Arc<dyn Observer>);
    info!(source = %label, "terminal attached");

    loop {
        tokio::select! {
            chunk = output_rx.recv() => {
                let Some(data) = chunk else {
                    break;
                };
                if send_response(&mut socket, TerminalResponse::Output { data }).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<TerminalRequest>(&text) {
                        Ok(TerminalRequest::Cancel) => source.cli().terminate(),
                        Ok(TerminalRequest::Close) => break,
                        Err(err) => {
                            let message = format!("invalid terminal request: {err}");
                            if send_response(&mut socket, TerminalResponse::Error { message }).await.is_err() {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    source.cli().release(ids);
    info!(source = %label, "terminal detached");
}

async fn send_response(socket: &mut WebSocket, response: TerminalResponse) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(&response) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize terminal response");
            return Ok(());
        }
    };
    socket.send(Message::Text(payload)).await
}
