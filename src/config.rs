use std::env;

use base64::Engine as _;
use serde::Deserialize;

const VAPID_PUBLIC_KEY_LEN: usize = 65;
const VAPID_PRIVATE_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub vapid: VapidConfig,
    pub storage: StorageConfig,
    pub dispatch: DispatchConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

/// Service-wide VAPID identity. The same key pair signs every outbound push
/// request; it is read-only shared state across dispatch workers.
#[derive(Debug, Clone, Deserialize)]
pub struct VapidConfig {
    /// Uncompressed P-256 public key, base64url (no padding), 65 bytes decoded.
    pub public_key_b64: String,
    /// Raw P-256 private scalar, 32 bytes.
    pub private_key_raw: [u8; VAPID_PRIVATE_KEY_LEN],
    /// `sub` claim of VAPID JWTs, e.g. `mailto:ops@example.com`.
    pub subject: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the object-storage HTTP API.
    pub base_url: String,
    /// Bucket holding notification images.
    pub bucket: String,
    /// Secret used to sign short-lived upload grants.
    pub signing_secret: String,
    /// Lifetime of an issued upload grant, in seconds.
    pub grant_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Maximum in-flight deliveries per broadcast. Bounded to respect
    /// push-service rate limits, not for correctness.
    pub concurrency: usize,
    /// Per-request timeout for a single push-service call (seconds).
    pub request_timeout_seconds: u64,
    /// Overall deadline for one broadcast batch (seconds). Workers still in
    /// flight at the deadline are abandoned and reported as unknown.
    pub batch_deadline_seconds: u64,
    /// TTL header sent to the push service (seconds).
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the public subscribe endpoints
    pub subscribe_per_second: u32,
    /// Burst size for the public subscribe endpoints
    pub subscribe_burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/app.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            vapid: VapidConfig::from_env()?,
            storage: StorageConfig {
                base_url: env::var("STORAGE_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:9000".to_string()),
                bucket: env::var("STORAGE_BUCKET").unwrap_or_else(|_| "push-images".to_string()),
                signing_secret: env::var("STORAGE_SIGNING_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("STORAGE_SIGNING_SECRET".to_string()))?,
                grant_ttl_seconds: env::var("STORAGE_GRANT_TTL_SECONDS")
                    .unwrap_or_else(|_| "120".to_string())
                    .parse()
                    .unwrap_or(120),
            },
            dispatch: DispatchConfig {
                concurrency: env::var("DISPATCH_CONCURRENCY")
                    .unwrap_or_else(|_| "16".to_string())
                    .parse()
                    .unwrap_or(16),
                request_timeout_seconds: env::var("DISPATCH_REQUEST_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                batch_deadline_seconds: env::var("DISPATCH_BATCH_DEADLINE_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                ttl_seconds: env::var("DISPATCH_TTL_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
            },
            rate_limit: RateLimitConfig {
                subscribe_per_second: env::var("RATE_LIMIT_SUBSCRIBE_PER_SECOND")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
                subscribe_burst: env::var("RATE_LIMIT_SUBSCRIBE_BURST")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .unwrap_or(20),
            },
        })
    }
}

impl VapidConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let public_key_b64 = env::var("VAPID_PUBLIC_KEY")
            .map_err(|_| ConfigError::MissingEnv("VAPID_PUBLIC_KEY".to_string()))?
            .trim()
            .to_string();
        let private_key_b64 = env::var("VAPID_PRIVATE_KEY")
            .map_err(|_| ConfigError::MissingEnv("VAPID_PRIVATE_KEY".to_string()))?
            .trim()
            .to_string();
        let subject =
            env::var("VAPID_SUBJECT").unwrap_or_else(|_| "mailto:admin@localhost".to_string());

        let public_raw = decode_b64url(&public_key_b64)
            .map_err(|_| ConfigError::InvalidValue("VAPID_PUBLIC_KEY".to_string()))?;
        if public_raw.len() != VAPID_PUBLIC_KEY_LEN {
            return Err(ConfigError::InvalidValue("VAPID_PUBLIC_KEY".to_string()));
        }

        let private_raw = decode_b64url(&private_key_b64)
            .map_err(|_| ConfigError::InvalidValue("VAPID_PRIVATE_KEY".to_string()))?;
        let private_key_raw: [u8; VAPID_PRIVATE_KEY_LEN] = private_raw
            .try_into()
            .map_err(|_| ConfigError::InvalidValue("VAPID_PRIVATE_KEY".to_string()))?;

        Ok(VapidConfig {
            public_key_b64,
            private_key_raw,
            subject,
        })
    }
}

fn decode_b64url(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.as_bytes())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}
