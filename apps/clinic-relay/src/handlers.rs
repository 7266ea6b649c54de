use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

use clinic_proto::{
    CreateMappingRequest, CreateMappingResponse, DeviceDoctorMapping, QrData, Registration,
    RegistrationData, ServerEvent, ValidateResponse,
};

use crate::rooms::RoomRegistry;
use crate::storage::{SharedStorage, StorageError};
use crate::tokens::{TokenError, TokenVault};

/// Shared state behind every HTTP and websocket handler.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomRegistry>,
    pub vault: Arc<TokenVault>,
    pub storage: SharedStorage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateQuery {
    pub device_id: Option<String>,
    pub doctor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeQuery {
    pub room_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::DeviceInUse | StorageError::RegistrationExists => StatusCode::CONFLICT,
        StorageError::MappingNotFound | StorageError::RegistrationNotFound => {
            StatusCode::NOT_FOUND
        }
        StorageError::Redis(_) | StorageError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /qr/generate?deviceId&doctorId: mint a fresh token. Tokens minted
/// over HTTP carry no room; the display's room is attached on consume.
pub async fn generate_qr(
    State(state): State<AppState>,
    Query(query): Query<GenerateQuery>,
) -> Json<QrData> {
    debug!(device = ?query.device_id, doctor = ?query.doctor_id, "generate token");
    let record = state.vault.mint(None);
    Json(record.qr_data())
}

/// GET /qr/current: the most recently minted token.
pub async fn current_qr(State(state): State<AppState>) -> Result<Json<QrData>, StatusCode> {
    match state.vault.latest() {
        Some(record) => Ok(Json(record.qr_data())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /qr/validate/:token: report a token's validity and its recorded
/// room. Unknown tokens answer `valid: false` rather than an error, so the
/// patient flow can fall back to an existing-registration lookup.
pub async fn validate_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Json<ValidateResponse> {
    match state.vault.validate(&token) {
        Some(info) => Json(ValidateResponse {
            valid: info.valid,
            token: Some(info),
        }),
        None => Json(ValidateResponse {
            valid: false,
            token: None,
        }),
    }
}

/// POST /qr/consume/:token?roomId=: redeem a token once and push the
/// successor into the target room.
pub async fn consume_qr(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<ConsumeQuery>,
) -> Result<Json<QrData>, StatusCode> {
    match state.vault.consume(&token, query.room_id.as_deref()) {
        Ok(outcome) => {
            if let Some(room) = &outcome.room_id {
                let delivered = state.rooms.send_to_room(
                    room,
                    ServerEvent::NewQr {
                        qr: outcome.successor.value.clone(),
                        room_id: Some(room.clone()),
                    },
                );
                debug!(room = %room, delivered, "pushed successor token");
            }
            Ok(Json(outcome.successor.qr_data()))
        }
        Err(TokenError::NotFound) => Err(StatusCode::NOT_FOUND),
        Err(TokenError::AlreadyConsumed) => Err(StatusCode::CONFLICT),
    }
}

/// POST /device-doctor-mapping: open a registration session. Returns the
/// minted token so the display can reuse it without a second generate.
pub async fn create_mapping(
    State(state): State<AppState>,
    Json(payload): Json<CreateMappingRequest>,
) -> Result<Json<CreateMappingResponse>, StatusCode> {
    let mapping = state
        .storage
        .create_mapping(&payload.device_id, &payload.doctor_id, payload.notes.clone())
        .await
        .map_err(|err| {
            warn!(device = %payload.device_id, "mapping creation failed: {err}");
            storage_status(&err)
        })?;

    let qr_token = state.vault.mint(None);
    state.rooms.broadcast_all(ServerEvent::DeviceInUse {
        device_id: payload.device_id.clone(),
    });

    Ok(Json(CreateMappingResponse {
        mapping,
        qr_token: qr_token.qr_data(),
    }))
}

/// GET /device-doctor-mapping/device/:deviceId: the device's active mapping.
pub async fn get_mapping(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceDoctorMapping>, StatusCode> {
    match state.storage.get_active_mapping(&device_id).await {
        Ok(Some(mapping)) => Ok(Json(mapping)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            error!(device = %device_id, "mapping lookup failed: {err}");
            Err(storage_status(&err))
        }
    }
}

/// DELETE /device-doctor-mapping/:deviceId: end the session, freeing the
/// device for the next staff member.
pub async fn end_mapping(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceDoctorMapping>, StatusCode> {
    let mapping = state
        .storage
        .end_mapping(&device_id)
        .await
        .map_err(|err| storage_status(&err))?;

    state.rooms.broadcast_all(ServerEvent::DeviceAvailable {
        device_id: device_id.clone(),
    });

    Ok(Json(mapping))
}

/// POST /registration/:token: create the registration tied to a token.
/// The token must be known to the relay; duplicate creation is refused so a
/// token yields at most one record.
pub async fn create_registration(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(data): Json<RegistrationData>,
) -> Result<Json<Registration>, StatusCode> {
    if state.vault.get(&token).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    state
        .storage
        .create_registration(&token, data)
        .await
        .map(Json)
        .map_err(|err| {
            warn!(%token, "registration creation failed: {err}");
            storage_status(&err)
        })
}

/// GET /registration/token/:token: look up by token. Succeeds even when
/// the token no longer validates, backing the patient update fallback.
pub async fn get_registration(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<Registration>, StatusCode> {
    match state.storage.get_registration(&token).await {
        Ok(Some(registration)) => Ok(Json(registration)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            error!(%token, "registration lookup failed: {err}");
            Err(storage_status(&err))
        }
    }
}

/// PUT /registration/token/:token: update the existing record.
pub async fn update_registration(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(data): Json<RegistrationData>,
) -> Result<Json<Registration>, StatusCode> {
    state
        .storage
        .update_registration(&token, data)
        .await
        .map(Json)
        .map_err(|err| storage_status(&err))
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}
