use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::handlers::AppContext;
use crate::protocol::{
    generate_handle, ClientMessage, EndReason, ParticipantRole, ServerMessage,
};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub role: Option<ParticipantRole>,
}

/// WebSocket upgrade handler for `/ws?role=mama|guest`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(ctx): State<AppContext>,
) -> Response {
    let role = query.role.unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, role, ctx))
}

async fn handle_socket(socket: WebSocket, role: ParticipantRole, ctx: AppContext) {
    let handle = generate_handle();
    let (mut sender, mut receiver) = socket.split();

    // Channel for notifications to this connection; a dedicated task
    // forwards them onto the socket.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&message) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(handle = %writer_handle, "writer task ended");
    });

    match role {
        ParticipantRole::Mama => ctx.orchestrator.operator_attached(&handle, tx.clone()).await,
        ParticipantRole::Guest => ctx.orchestrator.visitor_connected(&handle, tx.clone()).await,
    }
    debug!(%handle, ?role, "websocket connected");

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                error!(%handle, error = %err, "websocket error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_message) => dispatch(client_message, role, &handle, &ctx, &tx).await,
                Err(err) => {
                    warn!(%handle, error = %err, "unparseable client message");
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("invalid message format: {err}"),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/pong frames are handled by the transport; binary frames
            // are not part of the protocol.
            _ => {}
        }
    }

    ctx.orchestrator.connection_closed(&handle).await;
    debug!(%handle, ?role, "websocket disconnected");
}

async fn dispatch(
    message: ClientMessage,
    role: ParticipantRole,
    handle: &str,
    ctx: &AppContext,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    let orch = &ctx.orchestrator;
    match (role, message) {
        (_, ClientMessage::Ping) => {
            let _ = tx.send(ServerMessage::Pong);
        }
        (
            ParticipantRole::Guest,
            ClientMessage::RegisterIntent {
                durable_id,
                mood,
                mode,
                room_tag,
            },
        ) => {
            orch.register_intent(handle, &durable_id, mood, mode, room_tag)
                .await;
        }
        (ParticipantRole::Guest, ClientMessage::JoinRoom { room_tag }) => {
            orch.join_room(handle, &room_tag).await;
        }
        (ParticipantRole::Guest, ClientMessage::Leave) => {
            orch.leave(handle).await;
        }
        (ParticipantRole::Guest, ClientMessage::SendMessage { text }) => {
            orch.guest_message(handle, text).await;
        }
        (ParticipantRole::Guest, ClientMessage::TipIntent { amount }) => {
            orch.tip_intent(handle, amount).await;
        }
        (ParticipantRole::Mama, ClientMessage::Accept { handle: guest }) => {
            orch.accept(&guest).await;
        }
        (ParticipantRole::Mama, ClientMessage::EndSession) => {
            orch.end_session(EndReason::MamaEnded).await;
        }
        (ParticipantRole::Mama, ClientMessage::SendMessage { text }) => {
            orch.operator_message(text).await;
        }
        (ParticipantRole::Mama, ClientMessage::VoiceJoin) => {
            orch.voice_join().await;
        }
        (role, other) => {
            warn!(%handle, ?role, message = ?other, "command not allowed for role");
            let _ = tx.send(ServerMessage::Error {
                message: "command not allowed for this role".to_string(),
            });
        }
    }
}
