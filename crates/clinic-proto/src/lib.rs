//! Shared wire contract between the clinic relay and its clients.
//! Keeping this in a dedicated crate lets the staff display, the patient
//! flow and the relay agree on one set of serialized shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands sent from a client to the relay over the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
    /// Join a room; acknowledged with `RoomJoined` carrying the same id.
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    /// Leave a room; acknowledged with `RoomLeft`.
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    /// Mint a fresh token, optionally bound to a room. The new token is
    /// delivered asynchronously as `NewQr`, never in a direct response.
    #[serde(rename_all = "camelCase")]
    GenerateQr { room_id: Option<String> },
    /// Redeem a token. On success the relay mints a successor and pushes it
    /// to the target room.
    #[serde(rename_all = "camelCase")]
    ConsumeQr {
        token: String,
        room_id: Option<String>,
    },
    /// Heartbeat.
    Ping,
}

/// Events pushed from the relay to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    /// Join acknowledgment; clients store the id as their current room.
    #[serde(rename_all = "camelCase")]
    RoomJoined { room_id: String },
    /// Leave acknowledgment.
    #[serde(rename_all = "camelCase")]
    RoomLeft { room_id: String },
    /// A token was minted for (or replayed into) a room. Clients must only
    /// apply updates whose room id exactly matches their current room.
    #[serde(rename_all = "camelCase")]
    NewQr {
        qr: String,
        room_id: Option<String>,
    },
    /// A device acquired an active mapping.
    #[serde(rename_all = "camelCase")]
    DeviceInUse { device_id: String },
    /// A device's mapping ended and it is free again.
    #[serde(rename_all = "camelCase")]
    DeviceAvailable { device_id: String },
    /// Heartbeat response.
    Pong,
    /// Command failed; the connection stays usable.
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Token payload returned by the HTTP token endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QrData {
    pub token: String,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// The relay's record of a token, as exposed by `GET /qr/validate/:token`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub value: String,
    pub valid: bool,
    #[serde(default)]
    pub room_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenInfo>,
}

/// A time-bounded association of a clinic device with a doctor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDoctorMapping {
    pub id: String,
    pub device_id: String,
    pub doctor_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub is_active: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl DeviceDoctorMapping {
    pub fn new(device_id: String, doctor_id: String, notes: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id,
            doctor_id,
            start_time: Utc::now(),
            end_time: None,
            is_active: true,
            notes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMappingRequest {
    pub device_id: String,
    pub doctor_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMappingResponse {
    pub mapping: DeviceDoctorMapping,
    pub qr_token: QrData,
}

/// Patient-entered registration fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationData {
    pub name: String,
    /// Age in days, derived from `dob` for precision.
    pub age: i64,
    #[serde(default)]
    pub dob: Option<String>,
    pub sex: String,
    pub address: String,
    pub contact_number: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub allergies: Option<String>,
    #[serde(default)]
    pub current_medical_illness: Option<String>,
    #[serde(default)]
    pub symptoms: Option<String>,
}

/// A stored registration record, tied to exactly one token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    pub token_id: String,
    #[serde(flatten)]
    pub data: RegistrationData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Registration {
    pub fn new(token_id: String, data: RegistrationData) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            token_id,
            data,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Query parameters of the patient-facing registration URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterParams {
    pub token: Option<String>,
    pub device_id: Option<String>,
    pub doctor_id: Option<String>,
    pub room_id: Option<String>,
}

/// Derive the room id for one staff display instance. The unique suffix
/// isolates simultaneous displays for the same device+doctor pair.
pub fn display_room_id(device_id: &str, doctor_id: &str) -> String {
    format!(
        "device_{}_doctor_{}_screen_{}",
        device_id,
        doctor_id,
        Uuid::new_v4()
    )
}

/// Compose the patient-facing registration link. All four identifiers are
/// required for live-refresh behavior; callers gate on their presence.
pub fn compose_register_url(
    origin: &str,
    token: &str,
    device_id: &str,
    doctor_id: &str,
    room_id: &str,
) -> String {
    format!(
        "{}/register?token={}&deviceId={}&doctorId={}&roomId={}",
        origin.trim_end_matches('/'),
        token,
        device_id,
        doctor_id,
        room_id
    )
}

/// Parse a registration link (or a bare query string) back into its
/// parameters. Unknown parameters are ignored; missing ones stay `None`.
pub fn parse_register_url(url: &str) -> RegisterParams {
    let query = match url.split_once('?') {
        Some((_, query)) => query,
        None => url,
    };

    let mut params = RegisterParams::default();
    for pair in query.split('&') {
        let (key, value) = match pair.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        if value.is_empty() {
            continue;
        }
        match key {
            "token" => params.token = Some(value.to_string()),
            "deviceId" => params.device_id = Some(value.to_string()),
            "doctorId" => params.doctor_id = Some(value.to_string()),
            "roomId" => params.room_id = Some(value.to_string()),
            _ => {}
        }
    }
    params
}
