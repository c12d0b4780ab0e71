use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreatePushMessage, PushMessage, UpdatePushMessage};
use crate::error::{AppError, AppResult};

// ============================================================================
// Message History Store
// ============================================================================

pub struct PushMessageRepository;

impl PushMessageRepository {
    /// Write one history row for a persisted dispatch, stamped with the
    /// delivery time.
    pub async fn create(pool: &SqlitePool, entry: CreatePushMessage) -> AppResult<PushMessage> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO push_messages (id, title, message, image_url, url, created_by, sent_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&entry.title)
        .bind(&entry.message)
        .bind(&entry.image_url)
        .bind(&entry.url)
        .bind(&entry.created_by)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(PushMessage {
            id,
            title: entry.title,
            message: entry.message,
            image_url: entry.image_url,
            url: entry.url,
            created_by: entry.created_by,
            sent_at: now,
        })
    }

    /// All history entries, most recent first.
    pub async fn list(pool: &SqlitePool) -> AppResult<Vec<PushMessage>> {
        sqlx::query_as::<_, PushMessage>("SELECT * FROM push_messages ORDER BY sent_at DESC")
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<PushMessage>> {
        sqlx::query_as::<_, PushMessage>("SELECT * FROM push_messages WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)
    }

    /// Apply a partial edit to display fields. Does not touch `sent_at` and
    /// never triggers redelivery. Returns the updated row, or `None` if the
    /// entry does not exist.
    pub async fn update(
        pool: &SqlitePool,
        id: &str,
        changes: UpdatePushMessage,
    ) -> AppResult<Option<PushMessage>> {
        let Some(existing) = Self::find_by_id(pool, id).await? else {
            return Ok(None);
        };

        let title = changes.title.unwrap_or(existing.title);
        let message = changes.message.unwrap_or(existing.message);
        let image_url = changes.image_url.unwrap_or(existing.image_url);
        let url = changes.url.unwrap_or(existing.url);

        sqlx::query(
            "UPDATE push_messages SET title = ?, message = ?, image_url = ?, url = ? WHERE id = ?",
        )
        .bind(&title)
        .bind(&message)
        .bind(&image_url)
        .bind(&url)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(Some(PushMessage {
            id: existing.id,
            title,
            message,
            image_url,
            url,
            created_by: existing.created_by,
            sent_at: existing.sent_at,
        }))
    }

    /// Delete a history entry. Returns whether a row was removed.
    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM push_messages WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(pool: &SqlitePool) -> AppResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM push_messages")
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn entry(title: &str) -> CreatePushMessage {
        CreatePushMessage {
            title: title.to_string(),
            message: "body".to_string(),
            image_url: Some("https://cdn.example.com/a.png".to_string()),
            url: Some("/sale".to_string()),
            created_by: "op-1".to_string(),
        }
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields_and_sent_at_alone() {
        let pool = test_pool().await;
        let created = PushMessageRepository::create(&pool, entry("Original")).await.unwrap();

        let updated = PushMessageRepository::update(
            &pool,
            &created.id,
            UpdatePushMessage {
                title: Some("Edited".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(updated.title, "Edited");
        assert_eq!(updated.message, "body");
        assert_eq!(updated.image_url.as_deref(), Some("https://cdn.example.com/a.png"));
        assert_eq!(updated.sent_at, created.sent_at);
    }

    #[tokio::test]
    async fn update_can_clear_optional_fields() {
        let pool = test_pool().await;
        let created = PushMessageRepository::create(&pool, entry("With image")).await.unwrap();

        let updated = PushMessageRepository::update(
            &pool,
            &created.id,
            UpdatePushMessage {
                image_url: Some(None),
                url: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert!(updated.image_url.is_none());
        assert!(updated.url.is_none());
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_entries() {
        let pool = test_pool().await;

        let missing = PushMessageRepository::update(&pool, "no-such-id", UpdatePushMessage::default())
            .await
            .unwrap();
        assert!(missing.is_none());

        assert!(!PushMessageRepository::delete(&pool, "no-such-id").await.unwrap());

        let created = PushMessageRepository::create(&pool, entry("To delete")).await.unwrap();
        assert!(PushMessageRepository::delete(&pool, &created.id).await.unwrap());
        assert_eq!(PushMessageRepository::count(&pool).await.unwrap(), 0);
    }
}
