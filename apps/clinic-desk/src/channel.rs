use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use clinic_proto::{display_room_id, ClientCommand, ServerEvent};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A single realtime connection with room-scoped semantics layered on top.
///
/// The confirmed room id lives in a shared cell written by the reader task
/// the moment an acknowledgment arrives, so event handling always sees the
/// latest value rather than one captured at subscription time.
pub struct RoomChannel {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    current_room: Arc<RwLock<Option<String>>>,
    connected: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl RoomChannel {
    /// Connect to the relay. Accepts an http(s) or ws(s) base URL.
    pub async fn connect(server: &str) -> Result<Self, ChannelError> {
        let ws_url = websocket_url(server);
        let (ws_stream, _) = connect_async(&ws_url).await?;
        debug!(url = %ws_url, "realtime channel connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
        let (event_tx, events) = mpsc::unbounded_channel::<ServerEvent>();
        let current_room = Arc::new(RwLock::new(None));
        let connected = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(run_socket(
            ws_stream,
            cmd_rx,
            event_tx,
            current_room.clone(),
            connected.clone(),
        ));

        Ok(Self {
            cmd_tx,
            events,
            current_room,
            connected,
            task,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The room id confirmed by the most recent `RoomJoined` acknowledgment.
    pub fn current_room(&self) -> Option<String> {
        self.current_room.read().ok()?.clone()
    }

    fn send_command(&self, command: ClientCommand) {
        if !self.is_connected() {
            warn!(?command, "dropping command while disconnected");
            return;
        }
        let _ = self.cmd_tx.send(command);
    }

    pub fn join_room(&self, room_id: &str) {
        self.send_command(ClientCommand::JoinRoom {
            room_id: room_id.to_string(),
        });
    }

    pub fn leave_room(&self, room_id: &str) {
        self.send_command(ClientCommand::LeaveRoom {
            room_id: room_id.to_string(),
        });
    }

    /// Derive this display's unique room and join it. Returns the derived
    /// id; the join is confirmed asynchronously by `RoomJoined`.
    pub fn join_device_doctor_room(&self, device_id: &str, doctor_id: &str) -> String {
        let room_id = display_room_id(device_id, doctor_id);
        self.join_room(&room_id);
        room_id
    }

    pub fn generate(&self, room_id: Option<&str>) {
        self.send_command(ClientCommand::GenerateQr {
            room_id: room_id.map(str::to_string),
        });
    }

    pub fn consume(&self, token: &str, room_id: Option<&str>) {
        self.send_command(ClientCommand::ConsumeQr {
            token: token.to_string(),
            room_id: room_id.map(str::to_string),
        });
    }

    /// Next event from the relay; `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub async fn close(self) {
        drop(self.cmd_tx);
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    current_room: Arc<RwLock<Option<String>>>,
    connected: Arc<AtomicBool>,
) {
    let (mut sender, mut receiver) = ws_stream.split();

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                match serde_json::to_string(&command) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("failed to encode command: {err}"),
                }
            }
            frame = receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                track_room(&event, &current_room);
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("unreadable event frame: {err}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!("websocket error: {err}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Connection gone: no commands succeed and no room is trusted until the
    // owner reconnects and re-joins explicitly.
    connected.store(false, Ordering::SeqCst);
    if let Ok(mut room) = current_room.write() {
        *room = None;
    }
    debug!("realtime channel closed");
}

/// Update the confirmed-room cell from acknowledgment events. A stale
/// `RoomLeft` racing a newer join must not clear the newer room.
fn track_room(event: &ServerEvent, current_room: &RwLock<Option<String>>) {
    match event {
        ServerEvent::RoomJoined { room_id } => {
            if let Ok(mut room) = current_room.write() {
                *room = Some(room_id.clone());
            }
        }
        ServerEvent::RoomLeft { room_id } => {
            if let Ok(mut room) = current_room.write() {
                if room.as_deref() == Some(room_id.as_str()) {
                    *room = None;
                }
            }
        }
        _ => {}
    }
}

/// Strict delivery rule: a token update applies only when its room id
/// exactly matches the confirmed current room. Updates without a room id
/// are discarded; permissive broadcast handling leaks tokens across
/// unrelated sessions.
pub fn accept_token_update(event_room: Option<&str>, current_room: Option<&str>) -> bool {
    match (event_room, current_room) {
        (Some(event_room), Some(current_room)) => event_room == current_room,
        _ => false,
    }
}

fn websocket_url(server: &str) -> String {
    let base = server.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{base}")
    };
    format!("{ws_base}/ws")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_updates_require_an_exact_room_match() {
        assert!(accept_token_update(Some("room-a"), Some("room-a")));
        assert!(!accept_token_update(Some("room-a"), Some("room-b")));
        assert!(!accept_token_update(Some("room-b"), Some("room-a")));
    }

    #[test]
    fn broadcasts_without_a_room_are_discarded() {
        assert!(!accept_token_update(None, Some("room-a")));
    }

    #[test]
    fn updates_before_join_ack_are_not_trusted() {
        // No RoomJoined seen yet, so there is no current room to match.
        assert!(!accept_token_update(Some("room-a"), None));
        assert!(!accept_token_update(None, None));
    }

    #[test]
    fn join_ack_sets_the_live_room_cell() {
        let cell = RwLock::new(None);
        track_room(
            &ServerEvent::RoomJoined {
                room_id: "room-a".into(),
            },
            &cell,
        );
        assert_eq!(cell.read().unwrap().as_deref(), Some("room-a"));
    }

    #[test]
    fn stale_leave_does_not_clear_a_newer_join() {
        let cell = RwLock::new(Some("room-b".to_string()));
        track_room(
            &ServerEvent::RoomLeft {
                room_id: "room-a".into(),
            },
            &cell,
        );
        assert_eq!(cell.read().unwrap().as_deref(), Some("room-b"));

        track_room(
            &ServerEvent::RoomLeft {
                room_id: "room-b".into(),
            },
            &cell,
        );
        assert_eq!(*cell.read().unwrap(), None);
    }

    #[test]
    fn websocket_url_maps_schemes() {
        assert_eq!(websocket_url("http://localhost:8080"), "ws://localhost:8080/ws");
        assert_eq!(
            websocket_url("https://clinic.example/"),
            "wss://clinic.example/ws"
        );
        assert_eq!(websocket_url("ws://relay:8080"), "ws://relay:8080/ws");
        assert_eq!(websocket_url("relay:8080"), "ws://relay:8080/ws");
    }
}
