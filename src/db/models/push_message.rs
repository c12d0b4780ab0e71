use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A persisted notification. Rows exist only for dispatches that requested
/// persistence; editing a row changes display fields only and never triggers
/// redelivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PushMessage {
    pub id: String,
    pub title: String,
    pub message: String,
    pub image_url: Option<String>,
    pub url: Option<String>,
    pub created_by: String,
    pub sent_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePushMessage {
    pub title: String,
    pub message: String,
    pub image_url: Option<String>,
    pub url: Option<String>,
    pub created_by: String,
}

/// Partial update for a history entry. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePushMessage {
    pub title: Option<String>,
    pub message: Option<String>,
    pub image_url: Option<Option<String>>,
    pub url: Option<Option<String>>,
}
