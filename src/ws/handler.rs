//! WebSocket upgrade handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::authority::Outbound;
use crate::game::session::{ParticipantInput, SessionHandle};
use crate::http::AppError;
use crate::util::rate_limit::ParticipantRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{AuthorityMsg, ControllerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Join this session instead of any open one
    pub session: Option<Uuid>,
    /// Reconnecting participants keep their id
    pub participant: Option<Uuid>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let session = match query.session {
        Some(id) => {
            let handle = state
                .sessions
                .get(&id)
                .ok_or_else(|| AppError::NotFound(format!("session {id}")))?;
            if !handle.has_room() {
                return Err(AppError::Conflict(format!("session {id} is full")));
            }
            handle
        }
        None => state.sessions.join_or_create(&state.config),
    };
    let participant = query.participant.unwrap_or_else(Uuid::new_v4);

    info!(participant_id = %participant, session_id = %session.id, "WebSocket upgrade");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, participant, session)))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, participant: Uuid, session: SessionHandle) {
    info!(participant_id = %participant, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();
    let outbound_rx = session.subscribe();

    run_connection(participant, ws_sink, ws_stream, session.input_tx, outbound_rx).await;

    info!(participant_id = %participant, "WebSocket connection closed");
}

/// Run the WebSocket connection with read/write split
async fn run_connection(
    participant: Uuid,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    input_tx: mpsc::Sender<ParticipantInput>,
    mut outbound_rx: broadcast::Receiver<Arc<Outbound>>,
) {
    let rate_limiter = ParticipantRateLimiter::new();

    // Spawn writer task: session outbound -> WebSocket, only what is addressed to us
    let writer_handle = tokio::spawn(async move {
        loop {
            match outbound_rx.recv().await {
                Ok(outbound) => {
                    if !outbound.to.includes(participant) {
                        continue;
                    }
                    if let Err(e) = send_msg(&mut ws_sink, &outbound.msg).await {
                        debug!(participant_id = %participant, error = %e, "WebSocket send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Acks and ammo are re-sent; a lagging client recovers via resync
                    warn!(
                        participant_id = %participant,
                        lagged_count = n,
                        "Client lagged, skipping {} messages", n
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(participant_id = %participant, "Outbound channel closed");
                    break;
                }
            }
        }
    });

    // Reader loop: WebSocket -> session loop
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(participant_id = %participant, "Rate limited controller message");
                    continue;
                }

                match serde_json::from_str::<ControllerMsg>(&text) {
                    Ok(msg) => {
                        let input = ParticipantInput {
                            participant,
                            msg,
                            received_at: unix_millis(),
                        };

                        if input_tx.send(input).await.is_err() {
                            debug!(participant_id = %participant, "Input channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(participant_id = %participant, error = %e, "Failed to parse controller message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(participant_id = %participant, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) => {
                debug!(participant_id = %participant, "Received ping");
            }
            Ok(Message::Pong(_)) => {
                debug!(participant_id = %participant, "Received pong");
            }
            Ok(Message::Close(_)) => {
                info!(participant_id = %participant, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(participant_id = %participant, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Signal disconnect to the session loop
    let _ = input_tx
        .send(ParticipantInput {
            participant,
            msg: ControllerMsg::Leave,
            received_at: unix_millis(),
        })
        .await;

    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &AuthorityMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
