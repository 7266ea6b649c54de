use thiserror::Error;
use tracing::{debug, info, warn};

use clinic_proto::{RegisterParams, Registration, RegistrationData, ServerEvent};

use crate::api::{ApiError, RegistryApi};
use crate::channel::RoomChannel;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("nothing to submit in the current state")]
    NotSubmittable,
}

/// Where the patient flow stands after loading a registration link.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowState {
    /// Token validated; ready to collect a new registration. The room id is
    /// where the consume will push the successor token.
    Form {
        token: String,
        room_id: Option<String>,
    },
    /// The token was already consumed but a registration exists for it, so
    /// the patient may revise their details.
    UpdateForm {
        token: String,
        existing: Registration,
    },
    /// Submission landed.
    Submitted { registration: Registration },
    /// The link is unusable: no token, or an unknown token with no record.
    InvalidLink,
}

/// The patient side of the rendezvous: validate the scanned link, collect
/// the form, submit, and hand the token back so the display refreshes.
pub struct RegistrationFlow<A: RegistryApi> {
    api: A,
    state: FlowState,
}

impl<A: RegistryApi> RegistrationFlow<A> {
    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Resolve the scanned link into a flow state. A link without a token is
    /// rejected outright, with no network traffic.
    pub async fn load(api: A, params: &RegisterParams) -> Result<Self, FlowError> {
        let Some(token) = params.token.clone() else {
            warn!("registration link carries no token");
            return Ok(Self {
                api,
                state: FlowState::InvalidLink,
            });
        };

        let response = api.validate_token(&token).await?;
        if response.valid {
            // Prefer the room recorded against the token; the URL parameter
            // is the fallback for tokens minted before the room existed.
            let room_id = response
                .token
                .and_then(|info| info.room_id)
                .or_else(|| params.room_id.clone());
            debug!(%token, room = ?room_id, "token valid, opening form");
            return Ok(Self {
                api,
                state: FlowState::Form { token, room_id },
            });
        }

        // Consumed or unknown token: if a registration already exists the
        // patient probably refreshed the page after submitting.
        match api.registration_by_token(&token).await? {
            Some(existing) => {
                info!(%token, "token spent, offering update of existing registration");
                Ok(Self {
                    api,
                    state: FlowState::UpdateForm { token, existing },
                })
            }
            None => Ok(Self {
                api,
                state: FlowState::InvalidLink,
            }),
        }
    }

    /// Submit the form. New registrations consume the token afterwards,
    /// over the realtime channel when one is connected and over HTTP
    /// otherwise, so the display refreshes either way. Errors leave the
    /// state unchanged for a retry.
    pub async fn submit(
        &mut self,
        channel: Option<&RoomChannel>,
        data: RegistrationData,
    ) -> Result<&Registration, FlowError> {
        match &self.state {
            FlowState::Form { token, room_id } => {
                let token = token.clone();
                let room_id = room_id.clone();
                let registration = self.api.create_registration(&token, data).await?;

                match channel.filter(|c| c.is_connected()) {
                    Some(channel) => channel.consume(&token, room_id.as_deref()),
                    None => {
                        if let Err(err) = self.api.consume_qr(&token, room_id.as_deref()).await {
                            // The record is saved; a failed consume only
                            // delays the display refresh.
                            warn!(%token, "token consume failed: {err}");
                        }
                    }
                }

                self.state = FlowState::Submitted { registration };
            }
            FlowState::UpdateForm { token, .. } => {
                let token = token.clone();
                let registration = self.api.update_registration(&token, data).await?;
                self.state = FlowState::Submitted { registration };
            }
            FlowState::Submitted { .. } | FlowState::InvalidLink => {
                return Err(FlowError::NotSubmittable)
            }
        }

        match &self.state {
            FlowState::Submitted { registration } => Ok(registration),
            _ => unreachable!(),
        }
    }
}

/// The device/doctor pair a patient page is bound to, cleared when the
/// relay announces that the device is free again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    pub device_id: Option<String>,
    pub doctor_id: Option<String>,
}

impl SessionContext {
    pub fn from_params(params: &RegisterParams) -> Self {
        Self {
            device_id: params.device_id.clone(),
            doctor_id: params.doctor_id.clone(),
        }
    }

    /// Returns true when the event ended this context's session.
    pub fn apply_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::DeviceAvailable { device_id }
                if self.device_id.as_deref() == Some(device_id.as_str()) =>
            {
                self.device_id = None;
                self.doctor_id = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;

    fn params(token: Option<&str>, room: Option<&str>) -> RegisterParams {
        RegisterParams {
            token: token.map(str::to_string),
            device_id: Some("dev1".into()),
            doctor_id: Some("doc1".into()),
            room_id: room.map(str::to_string),
        }
    }

    fn form_data() -> RegistrationData {
        RegistrationData {
            name: "Alex Reyes".into(),
            age: 11_300,
            dob: Some("1995-03-20".into()),
            sex: "F".into(),
            address: "14 Mabini St".into(),
            contact_number: "09171234567".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_token_is_invalid_without_network_calls() {
        let api = FakeApi::new();
        let flow = RegistrationFlow::load(api, &params(None, Some("room-a")))
            .await
            .unwrap();
        assert_eq!(*flow.state(), FlowState::InvalidLink);
        assert_eq!(*flow.api.validate_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn valid_token_prefers_the_recorded_room() {
        let api = FakeApi::new();
        api.insert_token("tok1", true, Some("room-live"));

        let flow = RegistrationFlow::load(api, &params(Some("tok1"), Some("room-url")))
            .await
            .unwrap();
        assert_eq!(
            *flow.state(),
            FlowState::Form {
                token: "tok1".into(),
                room_id: Some("room-live".into()),
            }
        );
    }

    #[tokio::test]
    async fn valid_token_falls_back_to_the_url_room() {
        let api = FakeApi::new();
        api.insert_token("tok1", true, None);

        let flow = RegistrationFlow::load(api, &params(Some("tok1"), Some("room-url")))
            .await
            .unwrap();
        assert_eq!(
            *flow.state(),
            FlowState::Form {
                token: "tok1".into(),
                room_id: Some("room-url".into()),
            }
        );
    }

    #[tokio::test]
    async fn spent_token_with_a_record_opens_the_update_form() {
        let api = FakeApi::new();
        api.insert_token("tok1", true, None);
        let existing = api.create_registration("tok1", form_data()).await.unwrap();
        api.insert_token("tok1", false, None);

        let flow = RegistrationFlow::load(api, &params(Some("tok1"), None))
            .await
            .unwrap();
        assert_eq!(
            *flow.state(),
            FlowState::UpdateForm {
                token: "tok1".into(),
                existing,
            }
        );
    }

    #[tokio::test]
    async fn unknown_token_without_a_record_is_invalid() {
        let api = FakeApi::new();
        let flow = RegistrationFlow::load(api, &params(Some("ghost"), None))
            .await
            .unwrap();
        assert_eq!(*flow.state(), FlowState::InvalidLink);
    }

    #[tokio::test]
    async fn submit_consumes_over_http_when_offline() {
        let api = FakeApi::new();
        api.insert_token("tok1", true, Some("room-a"));

        let mut flow = RegistrationFlow::load(api, &params(Some("tok1"), None))
            .await
            .unwrap();
        flow.submit(None, form_data()).await.unwrap();

        assert!(matches!(flow.state(), FlowState::Submitted { .. }));
        assert_eq!(*flow.api.consume_calls.lock().unwrap(), 1);
        assert!(!flow.api.tokens.lock().unwrap()["tok1"].valid);
    }

    #[tokio::test]
    async fn update_submission_never_touches_the_token() {
        let api = FakeApi::new();
        api.insert_token("tok1", true, None);
        api.create_registration("tok1", form_data()).await.unwrap();
        api.insert_token("tok1", false, None);

        let mut flow = RegistrationFlow::load(api, &params(Some("tok1"), None))
            .await
            .unwrap();
        let mut revised = form_data();
        revised.symptoms = Some("persistent cough".into());
        let registration = flow.submit(None, revised).await.unwrap();

        assert_eq!(registration.data.symptoms.as_deref(), Some("persistent cough"));
        assert_eq!(*flow.api.consume_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn submitted_state_rejects_resubmission() {
        let api = FakeApi::new();
        api.insert_token("tok1", true, None);

        let mut flow = RegistrationFlow::load(api, &params(Some("tok1"), None))
            .await
            .unwrap();
        flow.submit(None, form_data()).await.unwrap();
        assert!(matches!(
            flow.submit(None, form_data()).await,
            Err(FlowError::NotSubmittable)
        ));
    }

    #[test]
    fn device_available_clears_the_matching_context() {
        let mut context = SessionContext::from_params(&params(Some("tok1"), None));

        assert!(!context.apply_event(&ServerEvent::DeviceAvailable {
            device_id: "other-device".into()
        }));
        assert_eq!(context.device_id.as_deref(), Some("dev1"));

        assert!(context.apply_event(&ServerEvent::DeviceAvailable {
            device_id: "dev1".into()
        }));
        assert_eq!(context, SessionContext::default());
    }
}
