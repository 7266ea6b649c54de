use clinic_proto::ServerEvent;

use crate::channel::accept_token_update;

/// The token currently shown by a staff display.
///
/// Updates flow in exclusively through [`apply_event`](Self::apply_event)
/// so the room-match rule is enforced in one place.
#[derive(Debug, Default)]
pub struct TokenStore {
    token: Option<String>,
    valid: bool,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Seed the store with a token obtained out of band (session handoff or
    /// an HTTP mint) before any realtime update has arrived.
    pub fn seed(&mut self, token: String) {
        self.token = Some(token);
        self.valid = true;
    }

    /// Apply a relay event. Returns true when the displayed token changed.
    pub fn apply_event(&mut self, event: &ServerEvent, current_room: Option<&str>) -> bool {
        match event {
            ServerEvent::NewQr { qr, room_id } => {
                if !accept_token_update(room_id.as_deref(), current_room) {
                    return false;
                }
                if self.token.as_deref() == Some(qr.as_str()) {
                    return false;
                }
                self.token = Some(qr.clone());
                self.valid = true;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.token = None;
        self.valid = false;
    }
}
