use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const SUBSCRIBER_STATUS_ACTIVE: &str = "active";
pub const SUBSCRIBER_STATUS_STALE: &str = "stale";

/// One browser push subscription. `endpoint` is the unique push-service URL;
/// `p256dh`/`auth` are the client's public key material used for per-message
/// encryption (base64url, opaque to the registry).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub status: String,
    pub failure_count: i64,
    pub created_at: NaiveDateTime,
    pub last_failure_at: Option<NaiveDateTime>,
}
