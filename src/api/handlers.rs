use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{error::ApiError, AppState};
use crate::protocol::{self, ServerMessage};

/// Envelopes queued for one browser before its sessions block.
const OUTBOUND_CAPACITY: usize = 256;

/// How long a shutting-down connection may take to flush its close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    channels: usize,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.gateway.registry();
    Json(HealthResponse {
        status: "ok",
        channels: registry.channel_count(),
        sessions: registry.total_sessions(),
    })
}

/// Reserved slot in the server-wide WebSocket connection budget.
pub(super) struct ChannelSlot {
    counter: Arc<AtomicUsize>,
}

impl ChannelSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let prev = counter.fetch_add(1, Ordering::AcqRel);
        if prev >= max {
            counter.fetch_sub(1, Ordering::Release);
            return None;
        }
        Some(Self {
            counter: counter.clone(),
        })
    }
}

impl Drop for ChannelSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

pub(super) async fn ws_relay(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let slot = ChannelSlot::acquire(&state.channel_count, state.max_channels).ok_or_else(|| {
        tracing::warn!(max = state.max_channels, "refusing WebSocket: connection limit reached");
        ApiError::TooManyConnections
    })?;
    Ok(ws
        .on_upgrade(move |socket| handle_ws_relay(socket, state, slot))
        .into_response())
}

async fn handle_ws_relay(socket: WebSocket, state: AppState, _slot: ChannelSlot) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (ws_tx, mut ws_rx) = socket.split();

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let channel = state.gateway.open_channel(outbound_tx);
    let closing = CancellationToken::new();
    let mut writer = tokio::spawn(write_outbound(ws_tx, outbound_rx, closing.clone()));
    let mut writer_finished = false;

    let mut shutting_down = *shutdown_rx.borrow_and_update();
    while !shutting_down {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.gateway.handle_message(channel, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(%channel, "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(%channel, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }

            _ = &mut writer, if !writer_finished => {
                writer_finished = true;
                break;
            }

            _ = shutdown_rx.changed() => {
                shutting_down = *shutdown_rx.borrow();
            }
        }
    }

    state.gateway.close_channel(channel);

    if !writer_finished {
        if shutting_down {
            tracing::debug!(%channel, "WebSocket received shutdown signal, closing");
            closing.cancel();
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
                writer.abort();
            }
        } else {
            writer.abort();
        }
    }
}

/// Forward outbound envelopes to the socket in order. On `closing`, send a
/// normal close frame and stop.
async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    closing: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = closing.cancelled() => {
                let close_frame = CloseFrame {
                    code: axum::extract::ws::close_code::NORMAL,
                    reason: "server shutting down".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                let _ = ws_tx.flush().await;
                break;
            }

            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                match protocol::encode(&msg) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode outbound message"),
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ExecResponse {
    success: bool,
    output: String,
    exit_status: Option<u32>,
    message: String,
}

/// Run one command on a remote host and return its output.
pub(super) async fn exec(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExecResponse>, ApiError> {
    let body: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidRequest(format!("body is not valid JSON ({e})")))?;
    let (target, command) = protocol::decode_exec(&body).map_err(|e| {
        ApiError::InvalidRequest(format!("Missing required connection parameters ({e})"))
    })?;

    let address = target.address();
    let username = target.username.clone();
    tracing::info!(host = %address, user = %username, %command, "exec request");

    let transport = state
        .gateway
        .connector()
        .connect(target, CancellationToken::new())
        .await
        .map_err(|e| {
            tracing::warn!(host = %address, error = %e, "exec connect failed");
            ApiError::SshConnectionFailed(e.to_string())
        })?;
    let result = transport.exec(command).await.map_err(|e| {
        tracing::warn!(host = %address, error = %e, "exec failed");
        ApiError::CommandFailed(e.to_string())
    })?;

    Ok(Json(ExecResponse {
        success: true,
        output: result.output,
        exit_status: result.exit_status,
        message: format!("Command executed on {} as {}", address, username),
    }))
}
