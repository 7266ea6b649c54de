//! Protocol-level tests driving the relay's room/token core the way the
//! websocket layer does, with channel-backed fake clients.

use tokio::sync::mpsc;

use clinic_proto::{
    compose_register_url, display_room_id, parse_register_url, ClientCommand, ServerEvent,
};
use clinic_relay::rooms::{EventSender, RoomRegistry};
use clinic_relay::tokens::TokenVault;
use clinic_relay::websocket::dispatch_command;

struct FakeClient {
    id: String,
    tx: EventSender,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl FakeClient {
    fn connect(registry: &RoomRegistry, id: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register_client(id, tx.clone());
        Self {
            id: id.to_string(),
            tx,
            rx,
        }
    }

    fn send(&self, registry: &RoomRegistry, vault: &TokenVault, command: ClientCommand) {
        dispatch_command(registry, vault, &self.id, &self.tx, command);
    }

    fn next(&mut self) -> ServerEvent {
        self.rx.try_recv().expect("expected a pending event")
    }

    fn assert_quiet(&mut self) {
        assert!(self.rx.try_recv().is_err(), "unexpected event delivered");
    }
}

#[tokio::test]
async fn display_to_patient_happy_path() {
    let registry = RoomRegistry::new();
    let vault = TokenVault::new();

    // Staff display derives its unique screen room and joins it.
    let room = display_room_id("dev1", "doc1");
    let mut display = FakeClient::connect(&registry, "display");
    display.send(
        &registry,
        &vault,
        ClientCommand::JoinRoom {
            room_id: room.clone(),
        },
    );
    assert_eq!(
        display.next(),
        ServerEvent::RoomJoined {
            room_id: room.clone()
        }
    );

    // Display requests a token for its room.
    display.send(
        &registry,
        &vault,
        ClientCommand::GenerateQr {
            room_id: Some(room.clone()),
        },
    );
    let tok1 = match display.next() {
        ServerEvent::NewQr { qr, room_id } => {
            assert_eq!(room_id.as_deref(), Some(room.as_str()));
            qr
        }
        other => panic!("expected NewQr, got {other:?}"),
    };

    // The composed link carries all four identifiers.
    let url = compose_register_url("http://clinic.local", &tok1, "dev1", "doc1", &room);
    let params = parse_register_url(&url);
    assert_eq!(params.token.as_deref(), Some(tok1.as_str()));
    assert_eq!(params.room_id.as_deref(), Some(room.as_str()));

    // Patient scans the link, validates the token and joins the same room.
    let info = vault.validate(&tok1).expect("token known");
    assert!(info.valid);
    let patient_room = info
        .room_id
        .or(params.room_id)
        .expect("room resolvable from record or url");
    assert_eq!(patient_room, room);

    let mut patient = FakeClient::connect(&registry, "patient");
    patient.send(
        &registry,
        &vault,
        ClientCommand::JoinRoom {
            room_id: patient_room.clone(),
        },
    );
    assert_eq!(
        patient.next(),
        ServerEvent::RoomJoined {
            room_id: room.clone()
        }
    );
    // Join replays the room's current token.
    assert_eq!(
        patient.next(),
        ServerEvent::NewQr {
            qr: tok1.clone(),
            room_id: Some(room.clone())
        }
    );

    // Patient submits and consumes; the display sees the successor without
    // any reload.
    patient.send(
        &registry,
        &vault,
        ClientCommand::ConsumeQr {
            token: tok1.clone(),
            room_id: Some(patient_room.clone()),
        },
    );

    let tok2 = match display.next() {
        ServerEvent::NewQr { qr, room_id } => {
            assert_eq!(room_id.as_deref(), Some(room.as_str()));
            qr
        }
        other => panic!("expected successor NewQr, got {other:?}"),
    };
    assert_ne!(tok2, tok1);
    assert!(!vault.validate(&tok1).unwrap().valid);
    assert!(vault.validate(&tok2).unwrap().valid);
}

#[tokio::test]
async fn token_updates_never_cross_rooms() {
    let registry = RoomRegistry::new();
    let vault = TokenVault::new();

    let room_a = display_room_id("dev1", "doc1");
    let room_b = display_room_id("dev1", "doc1");
    assert_ne!(room_a, room_b);

    let mut screen_a = FakeClient::connect(&registry, "screen-a");
    let mut screen_b = FakeClient::connect(&registry, "screen-b");
    screen_a.send(
        &registry,
        &vault,
        ClientCommand::JoinRoom {
            room_id: room_a.clone(),
        },
    );
    screen_b.send(
        &registry,
        &vault,
        ClientCommand::JoinRoom {
            room_id: room_b.clone(),
        },
    );
    screen_a.next();
    screen_b.next();

    screen_a.send(
        &registry,
        &vault,
        ClientCommand::GenerateQr {
            room_id: Some(room_a.clone()),
        },
    );

    match screen_a.next() {
        ServerEvent::NewQr { room_id, .. } => assert_eq!(room_id.as_deref(), Some(room_a.as_str())),
        other => panic!("expected NewQr, got {other:?}"),
    }
    screen_b.assert_quiet();
}

#[tokio::test]
async fn double_consume_yields_error_and_no_second_push() {
    let registry = RoomRegistry::new();
    let vault = TokenVault::new();

    let room = display_room_id("dev1", "doc1");
    let mut display = FakeClient::connect(&registry, "display");
    display.send(
        &registry,
        &vault,
        ClientCommand::JoinRoom {
            room_id: room.clone(),
        },
    );
    display.next();

    let token = vault.mint(Some(room.clone()));
    // Minting with a room pushed nothing yet (mint is not a delivery).

    let mut patient = FakeClient::connect(&registry, "patient");
    patient.send(
        &registry,
        &vault,
        ClientCommand::ConsumeQr {
            token: token.value.clone(),
            room_id: Some(room.clone()),
        },
    );
    let first = display.next();
    assert!(matches!(first, ServerEvent::NewQr { .. }));

    patient.send(
        &registry,
        &vault,
        ClientCommand::ConsumeQr {
            token: token.value.clone(),
            room_id: Some(room.clone()),
        },
    );
    match patient.next() {
        ServerEvent::Error { message } => assert!(message.contains("consumed")),
        other => panic!("expected Error, got {other:?}"),
    }
    display.assert_quiet();
}

#[tokio::test]
async fn disconnect_cleans_membership() {
    let registry = RoomRegistry::new();
    let vault = TokenVault::new();

    let room = display_room_id("dev1", "doc1");
    let display = FakeClient::connect(&registry, "display");
    display.send(
        &registry,
        &vault,
        ClientCommand::JoinRoom {
            room_id: room.clone(),
        },
    );
    assert_eq!(registry.member_count(&room), 1);

    registry.unregister_client("display");
    assert_eq!(registry.member_count(&room), 0);
}
