use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use thiserror::Error;

use chrono::Utc;
use clinic_proto::{DeviceDoctorMapping, Registration, RegistrationData};

pub type SharedStorage = Arc<Storage>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("device already in use")]
    DeviceInUse,
    #[error("no active mapping for device")]
    MappingNotFound,
    #[error("registration already exists for token")]
    RegistrationExists,
    #[error("no registration for token")]
    RegistrationNotFound,
}

/// Redis-backed persistence for mappings and registrations. Token state is
/// ephemeral and lives in [`crate::tokens::TokenVault`] instead.
#[derive(Clone)]
pub struct Storage {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl Storage {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self, StorageError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis, ttl_seconds })
    }

    /// Create a mapping for a device. The `SET NX` on the active-mapping key
    /// is the compare-and-swap enforcing at most one active mapping per
    /// device: the loser observes the key and gets `DeviceInUse`.
    pub async fn create_mapping(
        &self,
        device_id: &str,
        doctor_id: &str,
        notes: Option<String>,
    ) -> Result<DeviceDoctorMapping, StorageError> {
        let mut conn = self.redis.clone();
        let mapping =
            DeviceDoctorMapping::new(device_id.to_string(), doctor_id.to_string(), notes);

        let active_key = active_mapping_key(device_id);
        let claimed: bool = conn.set_nx(&active_key, &mapping.id).await?;
        if !claimed {
            return Err(StorageError::DeviceInUse);
        }
        conn.expire::<_, ()>(&active_key, self.ttl_seconds as i64)
            .await?;

        let serialized = serde_json::to_string(&mapping)?;
        conn.set_ex::<_, _, ()>(mapping_key(&mapping.id), serialized, self.ttl_seconds)
            .await?;

        tracing::info!(device = %device_id, doctor = %doctor_id, mapping = %mapping.id, "mapping created");
        Ok(mapping)
    }

    pub async fn get_active_mapping(
        &self,
        device_id: &str,
    ) -> Result<Option<DeviceDoctorMapping>, StorageError> {
        let mut conn = self.redis.clone();
        let mapping_id: Option<String> = conn.get(active_mapping_key(device_id)).await?;
        let Some(mapping_id) = mapping_id else {
            return Ok(None);
        };

        let serialized: Option<String> = conn.get(mapping_key(&mapping_id)).await?;
        match serialized {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// End the active mapping for a device, freeing it for the next session.
    pub async fn end_mapping(
        &self,
        device_id: &str,
    ) -> Result<DeviceDoctorMapping, StorageError> {
        let mut conn = self.redis.clone();
        let mut mapping = self
            .get_active_mapping(device_id)
            .await?
            .ok_or(StorageError::MappingNotFound)?;

        mapping.end_time = Some(Utc::now());
        mapping.is_active = false;

        let serialized = serde_json::to_string(&mapping)?;
        redis::pipe()
            .cmd("SETEX")
            .arg(mapping_key(&mapping.id))
            .arg(self.ttl_seconds)
            .arg(&serialized)
            .ignore()
            .cmd("DEL")
            .arg(active_mapping_key(device_id))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::info!(device = %device_id, mapping = %mapping.id, "mapping ended");
        Ok(mapping)
    }

    /// Create the registration tied to a token. `SET NX` guarantees a token
    /// never yields two records, even under concurrent submissions.
    pub async fn create_registration(
        &self,
        token_id: &str,
        data: RegistrationData,
    ) -> Result<Registration, StorageError> {
        let mut conn = self.redis.clone();
        let registration = Registration::new(token_id.to_string(), data);
        let serialized = serde_json::to_string(&registration)?;

        let created: bool = conn
            .set_nx(registration_key(token_id), &serialized)
            .await?;
        if !created {
            return Err(StorageError::RegistrationExists);
        }
        conn.expire::<_, ()>(registration_key(token_id), self.ttl_seconds as i64)
            .await?;

        tracing::info!(token = %token_id, registration = %registration.id, "registration created");
        Ok(registration)
    }

    pub async fn get_registration(
        &self,
        token_id: &str,
    ) -> Result<Option<Registration>, StorageError> {
        let mut conn = self.redis.clone();
        let serialized: Option<String> = conn.get(registration_key(token_id)).await?;
        match serialized {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Update the existing registration for a token, preserving its identity
    /// and creation time. Used when the token was consumed earlier.
    pub async fn update_registration(
        &self,
        token_id: &str,
        data: RegistrationData,
    ) -> Result<Registration, StorageError> {
        let mut conn = self.redis.clone();
        let mut registration = self
            .get_registration(token_id)
            .await?
            .ok_or(StorageError::RegistrationNotFound)?;

        registration.data = data;
        registration.updated_at = Utc::now();

        let serialized = serde_json::to_string(&registration)?;
        conn.set_ex::<_, _, ()>(registration_key(token_id), serialized, self.ttl_seconds)
            .await?;

        tracing::info!(token = %token_id, registration = %registration.id, "registration updated");
        Ok(registration)
    }
}

fn active_mapping_key(device_id: &str) -> String {
    format!("mapping:active:{}", device_id)
}

fn mapping_key(mapping_id: &str) -> String {
    format!("mapping:{}", mapping_id)
}

fn registration_key(token_id: &str) -> String {
    format!("registration:token:{}", token_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_builders_scope_by_identifier() {
        assert_eq!(active_mapping_key("dev1"), "mapping:active:dev1");
        assert_eq!(mapping_key("m1"), "mapping:m1");
        assert_eq!(registration_key("tok1"), "registration:token:tok1");
    }
}
