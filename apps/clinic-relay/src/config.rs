use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// TTL applied to persisted mappings and registrations.
    pub record_ttl_seconds: u64,
    /// Origin used when logging composed registration links.
    pub public_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("CLINIC_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            record_ttl_seconds: env::var("RECORD_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400), // one clinic day
            public_url: env::var("CLINIC_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            record_ttl_seconds: 86_400,
            public_url: "http://localhost:5173".to_string(),
        }
    }
}
