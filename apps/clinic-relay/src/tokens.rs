use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Mutex;
use thiserror::Error;

use clinic_proto::{QrData, TokenInfo};

const TOKEN_LENGTH: usize = 32;

/// Matches the default `RECORD_TTL` applied to the Redis records, so a
/// token and its registration fall out of reach together.
const DEFAULT_TTL_SECONDS: u64 = 86_400;

/// The relay's record of a one-time registration token.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub value: String,
    pub room_id: Option<String>,
    pub valid: bool,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    pub fn qr_data(&self) -> QrData {
        QrData {
            token: self.value.clone(),
            valid: self.valid,
            created_at: self.created_at,
            room_id: self.room_id.clone(),
        }
    }

    pub fn token_info(&self) -> TokenInfo {
        TokenInfo {
            value: self.value.clone(),
            valid: self.valid,
            room_id: self.room_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// Outcome of a successful consume: the invalidated token plus the successor
/// minted for the same room.
#[derive(Debug, Clone)]
pub struct Consumed {
    pub consumed: TokenRecord,
    pub successor: TokenRecord,
    /// The room the successor was pushed into, when one was resolvable.
    pub room_id: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TokenError {
    #[error("unknown token")]
    NotFound,
    #[error("token already consumed")]
    AlreadyConsumed,
}

/// Authoritative server-side token state. Tokens are ephemeral one-time
/// credentials; a room has at most one current token at any time.
pub struct TokenVault {
    tokens: DashMap<String, TokenRecord>,
    current_by_room: DashMap<String, String>,
    latest: Mutex<Option<String>>,
    ttl: chrono::Duration,
}

impl TokenVault {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL_SECONDS)
    }

    pub fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            tokens: DashMap::new(),
            current_by_room: DashMap::new(),
            latest: Mutex::new(None),
            ttl: chrono::Duration::seconds(ttl_seconds as i64),
        }
    }

    fn new_token_value() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect()
    }

    /// Mint a fresh token, optionally bound to a room. A bound token becomes
    /// that room's current token.
    pub fn mint(&self, room_id: Option<String>) -> TokenRecord {
        let record = TokenRecord {
            value: Self::new_token_value(),
            room_id: room_id.clone(),
            valid: true,
            created_at: Utc::now(),
            consumed_at: None,
        };

        if let Some(room) = room_id {
            self.current_by_room.insert(room, record.value.clone());
        }
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(record.value.clone());
        }
        self.tokens.insert(record.value.clone(), record.clone());

        tracing::debug!(token = %record.value, room = ?record.room_id, "minted token");
        record
    }

    pub fn get(&self, value: &str) -> Option<TokenRecord> {
        self.tokens.get(value).map(|entry| entry.clone())
    }

    /// The most recently minted token, backing `GET /qr/current`.
    pub fn latest(&self) -> Option<TokenRecord> {
        let value = self.latest.lock().ok()?.clone()?;
        self.get(&value)
    }

    /// The current token for a room, if one has been minted for it.
    pub fn current_for_room(&self, room_id: &str) -> Option<TokenRecord> {
        let value = self.current_by_room.get(room_id)?.clone();
        self.get(&value)
    }

    /// Look up a token for validation. Unknown tokens yield `None`; known
    /// tokens report their validity, never panicking on consumed ones.
    pub fn validate(&self, value: &str) -> Option<TokenInfo> {
        self.get(value).map(|record| record.token_info())
    }

    /// Redeem a token exactly once. The second consume of the same value
    /// fails with `AlreadyConsumed` and does not mint another successor.
    /// The successor is bound to `room_hint` when given, otherwise to the
    /// consumed token's recorded room.
    pub fn consume(&self, value: &str, room_hint: Option<&str>) -> Result<Consumed, TokenError> {
        let consumed = {
            let mut entry = self.tokens.get_mut(value).ok_or(TokenError::NotFound)?;
            if !entry.valid {
                return Err(TokenError::AlreadyConsumed);
            }
            entry.valid = false;
            entry.consumed_at = Some(Utc::now());
            entry.clone()
            // Guard dropped here; the successor mint re-enters the map.
        };

        let room_id = room_hint
            .map(str::to_string)
            .or_else(|| consumed.room_id.clone());
        let successor = self.mint(room_id.clone());

        tracing::info!(
            consumed = %consumed.value,
            successor = %successor.value,
            room = ?room_id,
            "token consumed"
        );

        Ok(Consumed {
            consumed,
            successor,
            room_id,
        })
    }

    /// Drop token records older than the vault's TTL, mirroring the expiry
    /// Redis applies to the persisted records. Consumed tokens expire from
    /// their consumption time, so the update-fallback lookup keeps working
    /// for as long as the registration record itself lives.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, record| {
            let anchor = record.consumed_at.unwrap_or(record.created_at);
            now - anchor < self.ttl
        });
        let swept = before - self.tokens.len();

        if swept > 0 {
            self.current_by_room
                .retain(|_, value| self.tokens.contains_key(value));
            if let Ok(mut latest) = self.latest.lock() {
                if latest
                    .as_ref()
                    .is_some_and(|value| !self.tokens.contains_key(value))
                {
                    *latest = None;
                }
            }
            tracing::debug!(swept, "expired tokens dropped");
        }
        swept
    }
}

impl Default for TokenVault {
    fn default() -> Self {
        Self::new()
    }
}
