use reqwest::StatusCode;
use thiserror::Error;

use clinic_proto::{
    CreateMappingRequest, CreateMappingResponse, DeviceDoctorMapping, QrData, Registration,
    RegistrationData, ValidateResponse,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("not found")]
    NotFound,
    #[error("device already in use")]
    DeviceInUse,
    #[error("token already consumed")]
    TokenConsumed,
    #[error("registration already exists for this token")]
    RegistrationExists,
    #[error("unexpected status {0}")]
    Status(StatusCode),
}

/// The relay's HTTP surface as the desk client sees it. A trait seam so the
/// session and registration flows can run against a fake in tests.
pub trait RegistryApi {
    fn generate_qr(
        &self,
        device_id: &str,
        doctor_id: &str,
    ) -> impl std::future::Future<Output = Result<QrData, ApiError>> + Send;

    /// The relay's most recently minted token; `NotFound` before any mint.
    fn current_qr(&self) -> impl std::future::Future<Output = Result<QrData, ApiError>> + Send;

    fn validate_token(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<ValidateResponse, ApiError>> + Send;

    fn consume_qr(
        &self,
        token: &str,
        room_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<QrData, ApiError>> + Send;

    fn create_mapping(
        &self,
        device_id: &str,
        doctor_id: &str,
        notes: Option<String>,
    ) -> impl std::future::Future<Output = Result<CreateMappingResponse, ApiError>> + Send;

    fn end_mapping(
        &self,
        device_id: &str,
    ) -> impl std::future::Future<Output = Result<DeviceDoctorMapping, ApiError>> + Send;

    fn create_registration(
        &self,
        token: &str,
        data: RegistrationData,
    ) -> impl std::future::Future<Output = Result<Registration, ApiError>> + Send;

    /// Ok(None) when no registration exists for the token.
    fn registration_by_token(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Option<Registration>, ApiError>> + Send;

    fn update_registration(
        &self,
        token: &str,
        data: RegistrationData,
    ) -> impl std::future::Future<Output = Result<Registration, ApiError>> + Send;
}

/// reqwest-backed implementation against a running relay.
pub struct HttpApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    conflict: ApiError,
) -> Result<T, ApiError> {
    match response.status() {
        status if status.is_success() => Ok(response.json().await?),
        StatusCode::NOT_FOUND => Err(ApiError::NotFound),
        StatusCode::CONFLICT => Err(conflict),
        status => Err(ApiError::Status(status)),
    }
}

impl RegistryApi for HttpApi {
    async fn generate_qr(&self, device_id: &str, doctor_id: &str) -> Result<QrData, ApiError> {
        let response = self
            .client
            .get(self.url("/qr/generate"))
            .query(&[("deviceId", device_id), ("doctorId", doctor_id)])
            .send()
            .await?;
        decode(response, ApiError::Status(StatusCode::CONFLICT)).await
    }

    async fn current_qr(&self) -> Result<QrData, ApiError> {
        let response = self.client.get(self.url("/qr/current")).send().await?;
        decode(response, ApiError::Status(StatusCode::CONFLICT)).await
    }

    async fn validate_token(&self, token: &str) -> Result<ValidateResponse, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/qr/validate/{token}")))
            .send()
            .await?;
        decode(response, ApiError::Status(StatusCode::CONFLICT)).await
    }

    async fn consume_qr(&self, token: &str, room_id: Option<&str>) -> Result<QrData, ApiError> {
        let mut request = self.client.post(self.url(&format!("/qr/consume/{token}")));
        if let Some(room_id) = room_id {
            request = request.query(&[("roomId", room_id)]);
        }
        decode(request.send().await?, ApiError::TokenConsumed).await
    }

    async fn create_mapping(
        &self,
        device_id: &str,
        doctor_id: &str,
        notes: Option<String>,
    ) -> Result<CreateMappingResponse, ApiError> {
        let response = self
            .client
            .post(self.url("/device-doctor-mapping"))
            .json(&CreateMappingRequest {
                device_id: device_id.to_string(),
                doctor_id: doctor_id.to_string(),
                notes,
            })
            .send()
            .await?;
        decode(response, ApiError::DeviceInUse).await
    }

    async fn end_mapping(&self, device_id: &str) -> Result<DeviceDoctorMapping, ApiError> {
        let response = self
            .client
            .delete(self.url(&format!("/device-doctor-mapping/{device_id}")))
            .send()
            .await?;
        decode(response, ApiError::Status(StatusCode::CONFLICT)).await
    }

    async fn create_registration(
        &self,
        token: &str,
        data: RegistrationData,
    ) -> Result<Registration, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/registration/{token}")))
            .json(&data)
            .send()
            .await?;
        decode(response, ApiError::RegistrationExists).await
    }

    async fn registration_by_token(&self, token: &str) -> Result<Option<Registration>, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/registration/token/{token}")))
            .send()
            .await?;
        match decode(response, ApiError::Status(StatusCode::CONFLICT)).await {
            Ok(registration) => Ok(Some(registration)),
            Err(ApiError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn update_registration(
        &self,
        token: &str,
        data: RegistrationData,
    ) -> Result<Registration, ApiError> {
        let response = self
            .client
            .put(self.url(&format!("/registration/token/{token}")))
            .json(&data)
            .send()
            .await?;
        decode(response, ApiError::Status(StatusCode::CONFLICT)).await
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeApi;
    use super::*;

    #[tokio::test]
    async fn current_qr_tracks_the_most_recent_mint() {
        let api = FakeApi::new();
        assert!(matches!(api.current_qr().await, Err(ApiError::NotFound)));

        api.generate_qr("dev1", "doc1").await.unwrap();
        let second = api.generate_qr("dev1", "doc1").await.unwrap();

        let current = api.current_qr().await.unwrap();
        assert_eq!(current.token, second.token);

        // Consuming mints a successor, which becomes the current token.
        let successor = api.consume_qr(&second.token, None).await.unwrap();
        assert_eq!(api.current_qr().await.unwrap().token, successor.token);
    }
}
