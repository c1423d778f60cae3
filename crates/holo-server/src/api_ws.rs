//! WebSocket endpoints: participant audio ingress and device transport.

use crate::api_sessions::ApiError;
use crate::AppState;
use axum::{
    extract::{
        ws::{CloseFrame, Message as AxumMessage, WebSocket},
        Extension, Path, Query, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use holo_link::{DeviceLinks, InboundMessage, LinkConnection};
use holo_session::{Orchestrator, SessionError};
use holo_types::{LinkId, ParticipantId, SessionId};
use serde::Deserialize;
use std::sync::Arc;

/// Bytes of capture timestamp in front of every audio frame.
const TIMESTAMP_BYTES: usize = 8;

/// WebSocket close code for a session that ended underneath the socket.
const CLOSE_SESSION_ENDED: u16 = 4000;

#[derive(Debug, Deserialize)]
pub struct AudioParams {
    pub participant: ParticipantId,
}

#[derive(Debug, Deserialize)]
pub struct LinkParams {
    pub token: String,
    /// Highest sequence number the device already played. Absent on first
    /// connect.
    pub last_ack: Option<u64>,
}

/// Splits a binary audio message into its capture timestamp and PCM payload.
///
/// Layout: 8-byte little-endian capture time in ms, then mono s16le samples.
pub fn parse_audio_frame(data: &[u8]) -> Option<(u64, &[u8])> {
    if data.len() < TIMESTAMP_BYTES {
        return None;
    }
    let (stamp, pcm) = data.split_at(TIMESTAMP_BYTES);
    let stamp: [u8; TIMESTAMP_BYTES] = stamp.try_into().ok()?;
    if pcm.len() % 2 != 0 {
        return None;
    }
    Some((u64::from_le_bytes(stamp), pcm))
}

/// Handler for `GET /ws/sessions/{id}/audio?participant=…`.
///
/// The session and participant are checked before the upgrade so callers
/// get a proper HTTP status instead of a dropped socket.
pub async fn audio_ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    Query(params): Query<AudioParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let snapshot = match state.orchestrator.snapshot(session_id).await {
        Ok(snapshot) => snapshot,
        Err(err) => return ApiError::from(err).into_response(),
    };
    if snapshot.state == holo_types::SessionState::Closed {
        return ApiError::from(SessionError::SessionClosed(session_id)).into_response();
    }
    if !snapshot.participants.contains(&params.participant) {
        return ApiError::from(SessionError::UnknownParticipant(params.participant))
            .into_response();
    }

    let orchestrator = state.orchestrator.clone();
    let max_frame = state.max_audio_frame_bytes;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| {
            handle_audio_socket(socket, orchestrator, session_id, params.participant)
        })
}

async fn handle_audio_socket(
    mut socket: WebSocket,
    orchestrator: Orchestrator,
    session_id: SessionId,
    participant: ParticipantId,
) {
    tracing::info!(session_id = %session_id, participant = %participant, "audio stream opened");
    let mut frames = 0u64;

    while let Some(Ok(msg)) = socket.recv().await {
        let data = match msg {
            AxumMessage::Binary(data) => data,
            AxumMessage::Close(_) => break,
            _ => continue,
        };
        let Some((captured_at_ms, pcm)) = parse_audio_frame(&data) else {
            tracing::debug!(
                session_id = %session_id,
                participant = %participant,
                len = data.len(),
                "dropping malformed audio frame"
            );
            continue;
        };
        match orchestrator
            .submit_audio_frame(session_id, &participant, captured_at_ms, pcm.to_vec())
            .await
        {
            Ok(()) => frames += 1,
            Err(err @ (SessionError::SessionNotFound(_) | SessionError::SessionClosed(_))) => {
                let _ = socket
                    .send(AxumMessage::Close(Some(CloseFrame {
                        code: CLOSE_SESSION_ENDED,
                        reason: err.to_string().into(),
                    })))
                    .await;
                break;
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    participant = %participant,
                    "audio frame rejected: {}",
                    err
                );
                let body = serde_json::json!({ "error": err.to_string() }).to_string();
                if socket.send(AxumMessage::Text(body.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(err) = orchestrator.end_audio_stream(session_id, &participant).await {
        tracing::debug!(session_id = %session_id, "end of audio stream not delivered: {}", err);
    }
    tracing::info!(
        session_id = %session_id,
        participant = %participant,
        frames,
        "audio stream closed"
    );
}

/// Handler for `GET /ws/links/{link_id}?token=…&last_ack=…`.
///
/// Connecting is the resume handshake: the link validates the token and the
/// resume point before the upgrade, then replays everything after
/// `last_ack`.
pub async fn link_ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(link_id): Path<LinkId>,
    Query(params): Query<LinkParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let links = state.orchestrator.links().clone();
    let connection = match links.connect(link_id, &params.token, params.last_ack).await {
        Ok(connection) => connection,
        Err(err) => {
            tracing::warn!(link_id = %link_id, "device connect rejected: {}", err);
            return ApiError::from(err).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_link_socket(socket, links, connection))
}

async fn handle_link_socket(socket: WebSocket, links: DeviceLinks, mut connection: LinkConnection) {
    let link_id = connection.link_id;
    tracing::info!(link_id = %link_id, "device connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = connection.frames.recv() => {
                // A closed channel means a newer connection took over.
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(link_id = %link_id, "failed to encode frame: {}", e);
                        continue;
                    }
                };
                if sender.send(AxumMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    AxumMessage::Text(text) => {
                        match serde_json::from_str::<InboundMessage>(text.as_str()) {
                            Ok(InboundMessage::Ack { seq }) => {
                                if let Err(e) = links.ack(link_id, seq).await {
                                    tracing::debug!(link_id = %link_id, seq, "ack rejected: {}", e);
                                }
                            }
                            Ok(InboundMessage::Ping) => {}
                            Err(e) => {
                                tracing::debug!(link_id = %link_id, "unparseable device message: {}", e);
                            }
                        }
                    }
                    AxumMessage::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    links.disconnect(link_id, connection.connection_id).await;
    tracing::info!(link_id = %link_id, "device disconnected");
}
