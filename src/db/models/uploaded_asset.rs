use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata for an object placed in storage through a signed upload grant.
/// `public_url` must always resolve back to `(bucket, path)` for deletion.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UploadedAsset {
    pub path: String,
    pub bucket: String,
    pub public_url: String,
    pub uploaded_by: String,
    pub created_at: NaiveDateTime,
}
