use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{Subscriber, SUBSCRIBER_STATUS_ACTIVE, SUBSCRIBER_STATUS_STALE};
use crate::error::{AppError, AppResult};

// ============================================================================
// Subscriber Registry
// ============================================================================

pub struct SubscriberRepository;

impl SubscriberRepository {
    /// Insert or update a subscription by endpoint. Duplicate registration is
    /// idempotent: the existing row keeps its id, the new keys overwrite the
    /// old ones and the subscriber is reactivated with a clean failure count.
    pub async fn upsert(
        pool: &SqlitePool,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
    ) -> AppResult<Subscriber> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();

        sqlx::query(
            r#"
            INSERT INTO subscribers (
                id, endpoint, p256dh, auth, status, failure_count, created_at, last_failure_at
            ) VALUES (?, ?, ?, ?, ?, 0, ?, NULL)
            ON CONFLICT(endpoint) DO UPDATE SET
                p256dh = excluded.p256dh,
                auth = excluded.auth,
                status = excluded.status,
                failure_count = 0,
                last_failure_at = NULL
            "#,
        )
        .bind(&id)
        .bind(endpoint)
        .bind(p256dh)
        .bind(auth)
        .bind(SUBSCRIBER_STATUS_ACTIVE)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        let row = sqlx::query_as::<_, Subscriber>(
            "SELECT * FROM subscribers WHERE endpoint = ? LIMIT 1",
        )
        .bind(endpoint)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Remove a subscription. A missing endpoint is a no-op so a client may
    /// retry unsubscribing safely.
    pub async fn delete_by_endpoint(pool: &SqlitePool, endpoint: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM subscribers WHERE endpoint = ?")
            .bind(endpoint)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Snapshot of active subscribers used as the delivery scope of one
    /// dispatch. Stale subscribers are excluded.
    pub async fn list_active(pool: &SqlitePool) -> AppResult<Vec<Subscriber>> {
        sqlx::query_as::<_, Subscriber>(
            "SELECT * FROM subscribers WHERE status = ? ORDER BY created_at",
        )
        .bind(SUBSCRIBER_STATUS_ACTIVE)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Record a delivery failure. Permanent failures (push service reports the
    /// endpoint gone) delete the row; transient ones bump the failure counter
    /// and keep the subscriber for future dispatches.
    pub async fn mark_failed(pool: &SqlitePool, id: &str, permanent: bool) -> AppResult<()> {
        if permanent {
            sqlx::query("DELETE FROM subscribers WHERE id = ?")
                .bind(id)
                .execute(pool)
                .await
                .map_err(AppError::Database)?;
            return Ok(());
        }

        let now = Utc::now().naive_utc();
        sqlx::query(
            "UPDATE subscribers SET failure_count = failure_count + 1, last_failure_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Soft-disable a subscription without losing its key material. Stale
    /// subscribers are skipped by every dispatch until the browser
    /// re-registers, which reactivates the row.
    pub async fn mark_stale(pool: &SqlitePool, id: &str) -> AppResult<()> {
        sqlx::query("UPDATE subscribers SET status = ? WHERE id = ?")
            .bind(SUBSCRIBER_STATUS_STALE)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    pub async fn find_by_endpoint(
        pool: &SqlitePool,
        endpoint: &str,
    ) -> AppResult<Option<Subscriber>> {
        sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE endpoint = ? LIMIT 1")
            .bind(endpoint)
            .fetch_optional(pool)
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

    #[tokio::test]
    async fn duplicate_endpoint_keeps_one_row_and_refreshes_keys() {
        let pool = test_pool().await;
        let endpoint = "https://push.example.com/send/abc";

        let first = SubscriberRepository::upsert(&pool, endpoint, "key-1", "auth-1")
            .await
            .unwrap();
        // Simulate delivery trouble before the browser re-registers.
        SubscriberRepository::mark_failed(&pool, &first.id, false)
            .await
            .unwrap();

        let second = SubscriberRepository::upsert(&pool, endpoint, "key-2", "auth-2")
            .await
            .unwrap();

        // Same identity, fresh key material, failure state reset.
        assert_eq!(second.id, first.id);
        assert_eq!(second.p256dh, "key-2");
        assert_eq!(second.auth, "auth-2");
        assert_eq!(second.failure_count, 0);
        assert!(second.last_failure_at.is_none());

        let active = SubscriberRepository::list_active(&pool).await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let pool = test_pool().await;
        let endpoint = "https://push.example.com/send/abc";
        SubscriberRepository::upsert(&pool, endpoint, "key", "auth")
            .await
            .unwrap();

        SubscriberRepository::delete_by_endpoint(&pool, endpoint)
            .await
            .unwrap();
        // Second delete of a now-missing endpoint still succeeds.
        SubscriberRepository::delete_by_endpoint(&pool, endpoint)
            .await
            .unwrap();

        assert!(SubscriberRepository::find_by_endpoint(&pool, endpoint)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_subscribers_are_excluded_until_reregistration() {
        let pool = test_pool().await;
        let endpoint = "https://push.example.com/send/abc";
        let sub = SubscriberRepository::upsert(&pool, endpoint, "key", "auth")
            .await
            .unwrap();

        SubscriberRepository::mark_stale(&pool, &sub.id).await.unwrap();
        assert!(SubscriberRepository::list_active(&pool)
            .await
            .unwrap()
            .is_empty());

        // The browser re-subscribing brings the same row back into scope.
        SubscriberRepository::upsert(&pool, endpoint, "key", "auth")
            .await
            .unwrap();
        assert_eq!(SubscriberRepository::list_active(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_removes_the_subscriber() {
        let pool = test_pool().await;
        let sub = SubscriberRepository::upsert(&pool, "https://push.example.com/send/x", "k", "a")
            .await
            .unwrap();

        SubscriberRepository::mark_failed(&pool, &sub.id, true)
            .await
            .unwrap();

        assert!(SubscriberRepository::list_active(&pool)
            .await
            .unwrap()
            .is_empty());
    }
}
