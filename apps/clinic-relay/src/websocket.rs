use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use clinic_proto::{ClientCommand, ServerEvent};

use crate::handlers::AppState;
use crate::rooms::{EventSender, RoomRegistry};
use crate::tokens::TokenVault;

/// WebSocket upgrade handler for `GET /ws`.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.rooms.register_client(&client_id, tx.clone());

    // Forward queued events to the socket.
    let writer_client = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(client = %writer_client, "event writer ended");
    });

    debug!(client = %client_id, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                error!(client = %client_id, "websocket error: {err}");
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => {
                    dispatch_command(&state.rooms, &state.vault, &client_id, &tx, command);
                }
                Err(err) => {
                    warn!(client = %client_id, "invalid command frame: {err}");
                    let _ = tx.send(ServerEvent::Error {
                        message: format!("invalid message format: {err}"),
                    });
                }
            },
            Message::Close(_) => {
                debug!(client = %client_id, "received close frame");
                break;
            }
            // Ping/Pong/Binary frames are not part of the contract.
            _ => {}
        }
    }

    state.rooms.unregister_client(&client_id);
    writer.abort();
    debug!(client = %client_id, "websocket disconnected");
}

/// Apply one client command against the room/token state. Public so the
/// integration tests can drive the protocol without a socket.
pub fn dispatch_command(
    rooms: &RoomRegistry,
    vault: &TokenVault,
    client_id: &str,
    tx: &EventSender,
    command: ClientCommand,
) {
    match command {
        ClientCommand::JoinRoom { room_id } => {
            rooms.join(&room_id, client_id, tx.clone());
            let _ = tx.send(ServerEvent::RoomJoined {
                room_id: room_id.clone(),
            });

            // Replay the room's current token so a client that reconnects
            // mid-session does not wait for the next consume to see it.
            if let Some(record) = vault.current_for_room(&room_id) {
                let _ = tx.send(ServerEvent::NewQr {
                    qr: record.value,
                    room_id: Some(room_id),
                });
            }
        }

        ClientCommand::LeaveRoom { room_id } => {
            rooms.leave(&room_id, client_id);
            let _ = tx.send(ServerEvent::RoomLeft { room_id });
        }

        ClientCommand::GenerateQr { room_id } => {
            let record = vault.mint(room_id.clone());
            match room_id {
                Some(room) => {
                    rooms.send_to_room(
                        &room,
                        ServerEvent::NewQr {
                            qr: record.value,
                            room_id: Some(room.clone()),
                        },
                    );
                }
                None => {
                    // No room to target; only the requester learns the value.
                    let _ = tx.send(ServerEvent::NewQr {
                        qr: record.value,
                        room_id: None,
                    });
                }
            }
        }

        ClientCommand::ConsumeQr { token, room_id } => {
            match vault.consume(&token, room_id.as_deref()) {
                Ok(outcome) => {
                    if let Some(room) = outcome.room_id {
                        rooms.send_to_room(
                            &room,
                            ServerEvent::NewQr {
                                qr: outcome.successor.value,
                                room_id: Some(room.clone()),
                            },
                        );
                    }
                }
                Err(err) => {
                    warn!(client = %client_id, %token, "consume failed: {err}");
                    let _ = tx.send(ServerEvent::Error {
                        message: err.to_string(),
                    });
                }
            }
        }

        ClientCommand::Ping => {
            let _ = tx.send(ServerEvent::Pong);
        }
    }
}
