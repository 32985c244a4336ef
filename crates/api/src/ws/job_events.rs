use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use chunkflow_core::types::DbId;
use chunkflow_events::{JobEvent, JobSubscription};
use futures::{SinkExt, StreamExt};

use crate::error::AppResult;
use crate::state::AppState;

/// Interval between heartbeat pings (in seconds).
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// GET /api/v1/jobs/{id}/events -- upgrade to a job event stream.
///
/// The subscription is taken before the upgrade so an unknown job is
/// answered with a plain 404.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<DbId>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let subscription = state.notifier.subscribe(job_id).await?;
    Ok(ws.on_upgrade(move |socket| stream_events(socket, subscription)))
}

/// Serialize an event into a text frame.
pub fn encode_event(event: &JobEvent) -> Result<Message, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Message::Text(json.into()))
}

async fn stream_events(socket: WebSocket, mut subscription: JobSubscription) {
    let job_id = subscription.job_id();
    tracing::info!(job_id, "Job event stream connected");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let terminal = event.is_terminal();
                match encode_event(&event) {
                    Ok(message) => {
                        if sink.send(message).await.is_err() {
                            tracing::debug!(job_id, "Job event sink closed");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(job_id, error = %e, "Failed to encode job event");
                    }
                }
                if terminal {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!(job_id, "Pong received");
                }
                // Clients have nothing to say on this channel.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(job_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    tracing::info!(job_id, "Job event stream disconnected");
}
