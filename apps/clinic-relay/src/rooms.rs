use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use clinic_proto::ServerEvent;

pub type ClientId = String;
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// Connected clients and their room memberships. Membership is mutated only
/// by explicit join/leave or disconnect cleanup.
pub struct RoomRegistry {
    /// room_id -> (client_id -> sender)
    rooms: DashMap<String, DashMap<ClientId, EventSender>>,
    /// Every connected client, for device-availability broadcasts.
    clients: DashMap<ClientId, EventSender>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    pub fn register_client(&self, client_id: &str, tx: EventSender) {
        self.clients.insert(client_id.to_string(), tx);
    }

    /// Remove a client from the registry and from every room it joined,
    /// dropping rooms that become empty.
    pub fn unregister_client(&self, client_id: &str) {
        self.clients.remove(client_id);

        let mut emptied = Vec::new();
        for entry in self.rooms.iter() {
            entry.value().remove(client_id);
            if entry.value().is_empty() {
                emptied.push(entry.key().clone());
            }
        }
        for room_id in emptied {
            self.rooms
                .remove_if(&room_id, |_, members| members.is_empty());
        }

        debug!(client = %client_id, "client unregistered");
    }

    pub fn join(&self, room_id: &str, client_id: &str, tx: EventSender) {
        let members = self.rooms.entry(room_id.to_string()).or_default();
        members.insert(client_id.to_string(), tx);
        debug!(room = %room_id, client = %client_id, "client joined room");
    }

    /// Returns true if the client was a member.
    pub fn leave(&self, room_id: &str, client_id: &str) -> bool {
        let mut removed = false;
        let mut empty = false;
        if let Some(members) = self.rooms.get(room_id) {
            removed = members.remove(client_id).is_some();
            empty = members.is_empty();
        }
        if empty {
            self.rooms
                .remove_if(room_id, |_, members| members.is_empty());
        }
        if removed {
            debug!(room = %room_id, client = %client_id, "client left room");
        }
        removed
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms
            .get(room_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Deliver an event to every member of one room. Events never leak to
    /// other rooms; delivery count is returned for observability.
    pub fn send_to_room(&self, room_id: &str, event: ServerEvent) -> usize {
        let Some(members) = self.rooms.get(room_id) else {
            warn!(room = %room_id, "send to unknown or empty room");
            return 0;
        };

        let mut delivered = 0;
        for member in members.iter() {
            if member.value().send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver an event to every connected client, regardless of rooms.
    /// Used for device in-use/available notifications only.
    pub fn broadcast_all(&self, event: ServerEvent) {
        for client in self.clients.iter() {
            let _ = client.value().send(event.clone());
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    fn new_qr(room: &str, qr: &str) -> ServerEvent {
        ServerEvent::NewQr {
            qr: qr.into(),
            room_id: Some(room.into()),
        }
    }

    #[test]
    fn room_events_stay_inside_their_room() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = client();
        let (tx_b, mut rx_b) = client();

        registry.register_client("a", tx_a.clone());
        registry.register_client("b", tx_b.clone());
        registry.join("room-a", "a", tx_a);
        registry.join("room-b", "b", tx_b);

        assert_eq!(registry.send_to_room("room-a", new_qr("room-a", "tok1")), 1);

        assert_eq!(rx_a.try_recv().unwrap(), new_qr("room-a", "tok1"));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn leave_stops_delivery() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = client();
        registry.register_client("a", tx.clone());
        registry.join("room-a", "a", tx);

        assert!(registry.leave("room-a", "a"));
        assert_eq!(registry.send_to_room("room-a", new_qr("room-a", "tok1")), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.member_count("room-a"), 0);
    }

    #[test]
    fn leaving_a_room_never_joined_is_a_no_op() {
        let registry = RoomRegistry::new();
        assert!(!registry.leave("room-x", "ghost"));
    }

    #[test]
    fn unregister_removes_all_memberships() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = client();
        registry.register_client("a", tx.clone());
        registry.join("room-a", "a", tx.clone());
        registry.join("room-b", "a", tx);

        registry.unregister_client("a");
        assert_eq!(registry.member_count("room-a"), 0);
        assert_eq!(registry.member_count("room-b"), 0);
    }

    #[test]
    fn broadcast_reaches_clients_outside_any_room() {
        let registry = RoomRegistry::new();
        let (tx, mut rx) = client();
        registry.register_client("a", tx);

        registry.broadcast_all(ServerEvent::DeviceAvailable {
            device_id: "dev1".into(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::DeviceAvailable {
                device_id: "dev1".into()
            }
        );
    }
}
