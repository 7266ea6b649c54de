use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use clinic_proto::{compose_register_url, DeviceDoctorMapping, ServerEvent};

use crate::api::{ApiError, RegistryApi};
use crate::channel::RoomChannel;

/// How long to wait for a join acknowledgment before re-sending the join.
pub const JOIN_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BinderError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("room join was not confirmed")]
    RoomNotConfirmed,
    #[error("no open session")]
    NoSession,
}

/// Single-use slot for the token minted when a session opens. The display
/// picks it up exactly once; afterwards tokens come only from room pushes.
#[derive(Debug, Default)]
pub struct TokenHandoff {
    token: Option<String>,
}

impl TokenHandoff {
    pub fn store(&mut self, token: String) {
        self.token = Some(token);
    }

    pub fn take(&mut self) -> Option<String> {
        self.token.take()
    }

    pub fn clear(&mut self) {
        self.token = None;
    }
}

/// Drives one staff display session: the device-doctor mapping, the initial
/// token and the room join.
pub struct SessionBinder<A: RegistryApi> {
    api: A,
    origin: String,
    device_id: String,
    doctor_id: String,
    handoff: TokenHandoff,
    mapping: Option<DeviceDoctorMapping>,
}

impl<A: RegistryApi> SessionBinder<A> {
    pub fn new(api: A, origin: &str, device_id: &str, doctor_id: &str) -> Self {
        Self {
            api,
            origin: origin.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
            doctor_id: doctor_id.to_string(),
            handoff: TokenHandoff::default(),
            mapping: None,
        }
    }

    pub fn mapping(&self) -> Option<&DeviceDoctorMapping> {
        self.mapping.as_ref()
    }

    /// Claim the device for this doctor. The relay mints a token alongside
    /// the mapping; it lands in the handoff slot for the display to pick up.
    pub async fn open_session(&mut self, notes: Option<String>) -> Result<(), BinderError> {
        let response = self
            .api
            .create_mapping(&self.device_id, &self.doctor_id, notes)
            .await?;
        info!(device = %self.device_id, doctor = %self.doctor_id, "session opened");
        self.handoff.store(response.qr_token.token.clone());
        self.mapping = Some(response.mapping);
        Ok(())
    }

    /// The display's starting token: the handed-off one if still unclaimed,
    /// otherwise a fresh HTTP mint.
    pub async fn acquire_token(&mut self) -> Result<String, BinderError> {
        if let Some(token) = self.handoff.take() {
            debug!("reusing session token from handoff");
            return Ok(token);
        }
        let minted = self.api.generate_qr(&self.device_id, &self.doctor_id).await?;
        Ok(minted.token)
    }

    /// Join this display's screen room and wait for the acknowledgment,
    /// re-sending the join once after [`JOIN_RETRY_DELAY`] if it has not
    /// arrived. Returns the confirmed room id.
    pub async fn join_display_room(
        &self,
        channel: &mut RoomChannel,
    ) -> Result<String, BinderError> {
        let room_id = channel.join_device_doctor_room(&self.device_id, &self.doctor_id);

        if wait_for_join(channel, &room_id, JOIN_RETRY_DELAY).await {
            return Ok(room_id);
        }

        warn!(room = %room_id, "join not confirmed, retrying");
        channel.join_room(&room_id);
        if wait_for_join(channel, &room_id, JOIN_RETRY_DELAY * 2).await {
            return Ok(room_id);
        }

        Err(BinderError::RoomNotConfirmed)
    }

    /// The patient-facing URL, or `None` until every identifier is known.
    /// Handing out a link before the room join is confirmed would strand the
    /// patient with a token that can never live-refresh the display.
    pub fn register_url(&self, token: Option<&str>, room_id: Option<&str>) -> Option<String> {
        let token = token?;
        let room_id = room_id?;
        if self.device_id.is_empty() || self.doctor_id.is_empty() {
            return None;
        }
        Some(compose_register_url(
            &self.origin,
            token,
            &self.device_id,
            &self.doctor_id,
            room_id,
        ))
    }

    /// Release the device and drop any unclaimed handoff token.
    pub async fn close_session(&mut self) -> Result<DeviceDoctorMapping, BinderError> {
        self.handoff.clear();
        if self.mapping.take().is_none() {
            return Err(BinderError::NoSession);
        }
        let mapping = self.api.end_mapping(&self.device_id).await?;
        info!(device = %self.device_id, "session closed");
        Ok(mapping)
    }
}

async fn wait_for_join(channel: &mut RoomChannel, room_id: &str, window: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let event = tokio::select! {
            event = channel.next_event() => event,
            _ = tokio::time::sleep_until(deadline) => return false,
        };
        match event {
            Some(ServerEvent::RoomJoined { room_id: joined }) if joined == room_id => return true,
            Some(_) => continue,
            None => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;

    fn binder() -> SessionBinder<FakeApi> {
        SessionBinder::new(FakeApi::new(), "http://clinic.local", "dev1", "doc1")
    }

    #[tokio::test]
    async fn handoff_token_is_single_use() {
        let mut binder = binder();
        binder.open_session(None).await.unwrap();

        let first = binder.acquire_token().await.unwrap();
        assert_eq!(*binder.api.generate_calls.lock().unwrap(), 0);

        // Second acquisition must not replay the session token.
        let second = binder.acquire_token().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(*binder.api.generate_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn open_session_refuses_a_busy_device() {
        let api = FakeApi::new();
        api.create_mapping("dev1", "other-doc", None).await.unwrap();

        let mut binder = SessionBinder::new(api, "http://clinic.local", "dev1", "doc1");
        match binder.open_session(None).await {
            Err(BinderError::Api(ApiError::DeviceInUse)) => {}
            other => panic!("expected DeviceInUse, got {other:?}"),
        }
        assert!(binder.mapping().is_none());
    }

    #[tokio::test]
    async fn close_session_drops_the_unclaimed_handoff() {
        let mut binder = binder();
        binder.open_session(None).await.unwrap();
        binder.close_session().await.unwrap();

        // Reopening hands off a fresh token, not the stale one.
        binder.open_session(None).await.unwrap();
        let token = binder.acquire_token().await.unwrap();
        assert_eq!(token, "fake-token-2");
    }

    #[test]
    fn register_url_requires_every_identifier() {
        let binder = binder();
        assert!(binder.register_url(None, Some("room-a")).is_none());
        assert!(binder.register_url(Some("tok1"), None).is_none());

        let url = binder.register_url(Some("tok1"), Some("room-a")).unwrap();
        assert_eq!(
            url,
            "http://clinic.local/register?token=tok1&deviceId=dev1&doctorId=doc1&roomId=room-a"
        );
    }

    #[test]
    fn register_url_refuses_blank_identity() {
        let binder = SessionBinder::new(FakeApi::new(), "http://clinic.local", "", "doc1");
        assert!(binder.register_url(Some("tok1"), Some("room-a")).is_none());
    }

    #[tokio::test]
    async fn close_without_open_is_an_error() {
        let mut binder = binder();
        assert!(matches!(
            binder.close_session().await,
            Err(BinderError::NoSession)
        ));
    }
}
