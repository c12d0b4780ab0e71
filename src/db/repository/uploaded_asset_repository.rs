use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::UploadedAsset;
use crate::error::{AppError, AppResult};

// ============================================================================
// Uploaded Asset Metadata
// ============================================================================

pub struct UploadedAssetRepository;

impl UploadedAssetRepository {
    /// Record an asset when its upload grant is issued. A grant the browser
    /// never uses leaves a row behind, but the gallery cross-checks against
    /// the live storage listing so the phantom never surfaces. Re-recording
    /// the same path overwrites the row.
    pub async fn create(
        pool: &SqlitePool,
        path: &str,
        bucket: &str,
        public_url: &str,
        uploaded_by: &str,
    ) -> AppResult<UploadedAsset> {
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO uploaded_assets (path, bucket, public_url, uploaded_by, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                bucket = excluded.bucket,
                public_url = excluded.public_url,
                uploaded_by = excluded.uploaded_by
            "#,
        )
        .bind(path)
        .bind(bucket)
        .bind(public_url)
        .bind(uploaded_by)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        let row =
            sqlx::query_as::<_, UploadedAsset>("SELECT * FROM uploaded_assets WHERE path = ?")
                .bind(path)
                .fetch_one(pool)
                .await
                .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Gallery listing for one namespace prefix (e.g. `push/`), newest first.
    pub async fn list_by_prefix(pool: &SqlitePool, prefix: &str) -> AppResult<Vec<UploadedAsset>> {
        let pattern = format!("{}%", prefix);
        sqlx::query_as::<_, UploadedAsset>(
            "SELECT * FROM uploaded_assets WHERE path LIKE ? ORDER BY created_at DESC",
        )
        .bind(pattern)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Idempotent metadata delete; a missing row is not an error.
    pub async fn delete_by_path(pool: &SqlitePool, path: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM uploaded_assets WHERE path = ?")
            .bind(path)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}
