//! Broadcast dispatcher: the fan-out core.
//!
//! One broadcast is a single finite batch job. It snapshots the active
//! registry, delivers one independently encrypted message per subscriber under
//! bounded concurrency, classifies every outcome, prunes dead subscriptions
//! and optionally records a history entry. There is no queue and no
//! cross-restart retry state; transient failures get exactly one immediate
//! retry and are otherwise just reported.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::models::{CreatePushMessage, Subscriber};
use crate::db::repository::{PushMessageRepository, SubscriberRepository};
use crate::error::{AppError, AppResult};
use crate::services::webpush::{DeliveryClass, PushSubscription, PushTransport};

/// The notification content delivered to every subscriber. Serialized as the
/// plaintext of each per-subscriber ciphertext; the client's background script
/// renders it as a system notification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One broadcast request. `title` and `message` must already be plain text;
/// markup stripping happens at the HTTP layer before this type is built.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub title: String,
    pub message: String,
    pub image_url: Option<String>,
    pub url: Option<String>,
    pub persist: bool,
    pub skip_persist: bool,
    pub created_by: String,
}

/// Aggregate outcome returned to the operator. Per-subscriber detail stays in
/// the logs. `unknown_count` covers workers abandoned at the batch deadline:
/// their subscribers are never counted as failures nor pruned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub success_count: u64,
    pub permanent_failure_count: u64,
    pub transient_failure_count: u64,
    pub unknown_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

#[derive(Default)]
struct DispatchCounts {
    success: AtomicU64,
    permanent: AtomicU64,
    transient: AtomicU64,
}

pub struct Dispatcher {
    transport: Arc<dyn PushTransport>,
    concurrency: usize,
    batch_deadline: Duration,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        concurrency: usize,
        batch_deadline: Duration,
    ) -> Self {
        Self {
            transport,
            concurrency,
            batch_deadline,
        }
    }

    /// Fan one message out to everyone active at dispatch start. Subscribers
    /// registered after the snapshot are not included.
    pub async fn broadcast(
        &self,
        pool: &SqlitePool,
        request: DispatchRequest,
    ) -> AppResult<DispatchSummary> {
        let subscribers = SubscriberRepository::list_active(pool).await?;
        let total = subscribers.len() as u64;

        let payload = NotificationPayload {
            title: request.title.clone(),
            message: request.message.clone(),
            image_url: request.image_url.clone(),
            url: request.url.clone(),
        };
        let payload_bytes = serde_json::to_vec(&payload)
            .map_err(|e| AppError::PushDelivery(format!("Payload serialization failed: {}", e)))?;

        let counts = DispatchCounts::default();
        if !subscribers.is_empty() {
            let counts_ref = &counts;
            let payload_ref: &[u8] = &payload_bytes;

            let fanout =
                stream::iter(subscribers).for_each_concurrent(self.concurrency, |sub| async move {
                    let class = self.deliver_with_retry(&sub, payload_ref).await;
                    match class {
                        DeliveryClass::Success => {
                            counts_ref.success.fetch_add(1, Ordering::Relaxed);
                        }
                        DeliveryClass::PermanentFailure => {
                            counts_ref.permanent.fetch_add(1, Ordering::Relaxed);
                            // Self-healing: drop endpoints the push service
                            // has declared gone, only after the outcome is known.
                            match SubscriberRepository::mark_failed(pool, &sub.id, true).await {
                                Ok(()) => {
                                    tracing::info!(endpoint = %sub.endpoint, "Pruned dead push subscription")
                                }
                                Err(e) => {
                                    tracing::warn!(endpoint = %sub.endpoint, error = %e, "Failed to prune dead subscription")
                                }
                            }
                        }
                        DeliveryClass::TransientFailure => {
                            counts_ref.transient.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) =
                                SubscriberRepository::mark_failed(pool, &sub.id, false).await
                            {
                                tracing::warn!(endpoint = %sub.endpoint, error = %e, "Failed to record transient failure");
                            }
                        }
                    }
                });

            if tokio::time::timeout(self.batch_deadline, fanout).await.is_err() {
                tracing::warn!(
                    deadline_secs = self.batch_deadline.as_secs(),
                    "Broadcast deadline expired; abandoning in-flight deliveries"
                );
            }
        }

        let success_count = counts.success.load(Ordering::Relaxed);
        let permanent_failure_count = counts.permanent.load(Ordering::Relaxed);
        let transient_failure_count = counts.transient.load(Ordering::Relaxed);
        let unknown_count = total
            .saturating_sub(success_count + permanent_failure_count + transient_failure_count);

        let history_id = if request.persist && !request.skip_persist {
            let entry = PushMessageRepository::create(
                pool,
                CreatePushMessage {
                    title: request.title,
                    message: request.message,
                    image_url: request.image_url,
                    url: request.url,
                    created_by: request.created_by,
                },
            )
            .await?;
            Some(entry.id)
        } else {
            None
        };

        tracing::info!(
            total,
            success = success_count,
            permanent = permanent_failure_count,
            transient = transient_failure_count,
            unknown = unknown_count,
            "Broadcast dispatch finished"
        );

        Ok(DispatchSummary {
            success_count,
            permanent_failure_count,
            transient_failure_count,
            unknown_count,
            history_id,
        })
    }

    /// Degenerate one-subscriber dispatch used for onboarding confirmation.
    /// Touches neither the registry snapshot nor the history store.
    pub async fn send_single(
        &self,
        subscription: &PushSubscription,
        title: &str,
        message: &str,
    ) -> AppResult<DeliveryClass> {
        let payload = NotificationPayload {
            title: title.to_string(),
            message: message.to_string(),
            image_url: None,
            url: None,
        };
        let payload_bytes = serde_json::to_vec(&payload)
            .map_err(|e| AppError::PushDelivery(format!("Payload serialization failed: {}", e)))?;

        let first = self
            .transport
            .deliver(
                &subscription.endpoint,
                &subscription.keys.p256dh,
                &subscription.keys.auth,
                &payload_bytes,
            )
            .await;
        if first != DeliveryClass::TransientFailure {
            return Ok(first);
        }
        Ok(self
            .transport
            .deliver(
                &subscription.endpoint,
                &subscription.keys.p256dh,
                &subscription.keys.auth,
                &payload_bytes,
            )
            .await)
    }

    async fn deliver_with_retry(&self, sub: &Subscriber, payload: &[u8]) -> DeliveryClass {
        let first = self
            .transport
            .deliver(&sub.endpoint, &sub.p256dh, &sub.auth, payload)
            .await;
        if first != DeliveryClass::TransientFailure {
            return first;
        }
        // One immediate retry; after that the failure is reported, not requeued.
        self.transport
            .deliver(&sub.endpoint, &sub.p256dh, &sub.auth, payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::webpush::SubscriptionKeys;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    /// Transport with scripted per-endpoint outcomes; unknown endpoints succeed.
    struct ScriptedTransport {
        outcomes: HashMap<String, DeliveryClass>,
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: HashMap<String, DeliveryClass>) -> Self {
            Self {
                outcomes,
                attempts: Mutex::new(HashMap::new()),
            }
        }

        fn attempts_for(&self, endpoint: &str) -> u32 {
            *self.attempts.lock().unwrap().get(endpoint).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn deliver(
            &self,
            endpoint: &str,
            _p256dh: &str,
            _auth: &str,
            _payload: &[u8],
        ) -> DeliveryClass {
            *self
                .attempts
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_insert(0) += 1;
            *self
                .outcomes
                .get(endpoint)
                .unwrap_or(&DeliveryClass::Success)
        }
    }

    /// Transport that never completes within a short batch deadline.
    struct StalledTransport;

    #[async_trait]
    impl PushTransport for StalledTransport {
        async fn deliver(
            &self,
            _endpoint: &str,
            _p256dh: &str,
            _auth: &str,
            _payload: &[u8],
        ) -> DeliveryClass {
            tokio::time::sleep(Duration::from_secs(600)).await;
            DeliveryClass::Success
        }
    }

    fn dispatcher(transport: Arc<dyn PushTransport>) -> Dispatcher {
        Dispatcher::new(transport, 4, Duration::from_secs(5))
    }

    fn request(persist: bool, skip_persist: bool) -> DispatchRequest {
        DispatchRequest {
            title: "Sale starts now".to_string(),
            message: "Everything 20% off until midnight".to_string(),
            image_url: None,
            url: Some("/sale".to_string()),
            persist,
            skip_persist,
            created_by: "op-1".to_string(),
        }
    }

    async fn seed_subscribers(pool: &SqlitePool, n: usize) -> Vec<String> {
        let mut endpoints = Vec::new();
        for i in 0..n {
            let endpoint = format!("https://push.example.com/send/{}", i);
            SubscriberRepository::upsert(pool, &endpoint, "key", "auth")
                .await
                .unwrap();
            endpoints.push(endpoint);
        }
        endpoints
    }

    #[tokio::test]
    async fn gone_endpoint_is_pruned_and_counted() {
        let pool = test_pool().await;
        let endpoints = seed_subscribers(&pool, 5).await;

        let mut outcomes = HashMap::new();
        outcomes.insert(endpoints[2].clone(), DeliveryClass::PermanentFailure);
        let transport = Arc::new(ScriptedTransport::new(outcomes));
        let dispatcher = dispatcher(transport);

        let summary = dispatcher
            .broadcast(&pool, request(false, false))
            .await
            .unwrap();

        assert_eq!(summary.success_count, 4);
        assert_eq!(summary.permanent_failure_count, 1);
        assert_eq!(summary.transient_failure_count, 0);
        assert_eq!(summary.unknown_count, 0);

        let remaining = SubscriberRepository::list_active(&pool).await.unwrap();
        assert_eq!(remaining.len(), 4);
        assert!(remaining.iter().all(|s| s.endpoint != endpoints[2]));
    }

    #[tokio::test]
    async fn transient_failure_retried_once_and_subscriber_retained() {
        let pool = test_pool().await;
        let endpoints = seed_subscribers(&pool, 1).await;

        let mut outcomes = HashMap::new();
        outcomes.insert(endpoints[0].clone(), DeliveryClass::TransientFailure);
        let transport = Arc::new(ScriptedTransport::new(outcomes));
        let dispatcher = Dispatcher::new(transport.clone(), 4, Duration::from_secs(5));

        let summary = dispatcher
            .broadcast(&pool, request(false, false))
            .await
            .unwrap();

        assert_eq!(summary.transient_failure_count, 1);
        assert_eq!(transport.attempts_for(&endpoints[0]), 2);

        let remaining = SubscriberRepository::list_active(&pool).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].failure_count, 1);
    }

    #[tokio::test]
    async fn zero_subscribers_still_persists_history() {
        let pool = test_pool().await;
        let transport = Arc::new(ScriptedTransport::new(HashMap::new()));
        let dispatcher = dispatcher(transport);

        let summary = dispatcher
            .broadcast(&pool, request(true, false))
            .await
            .unwrap();

        assert_eq!(summary.success_count, 0);
        assert_eq!(summary.permanent_failure_count, 0);
        assert_eq!(summary.transient_failure_count, 0);
        assert_eq!(summary.unknown_count, 0);
        assert!(summary.history_id.is_some());

        assert_eq!(PushMessageRepository::count(&pool).await.unwrap(), 1);
        let entries = PushMessageRepository::list(&pool).await.unwrap();
        assert_eq!(entries[0].title, "Sale starts now");
    }

    #[tokio::test]
    async fn skip_persist_wins_over_persist() {
        let pool = test_pool().await;
        seed_subscribers(&pool, 2).await;
        let transport = Arc::new(ScriptedTransport::new(HashMap::new()));
        let dispatcher = dispatcher(transport);

        let summary = dispatcher
            .broadcast(&pool, request(true, true))
            .await
            .unwrap();

        assert!(summary.history_id.is_none());
        assert_eq!(PushMessageRepository::count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repush_does_not_multiply_history() {
        let pool = test_pool().await;
        seed_subscribers(&pool, 3).await;
        let transport = Arc::new(ScriptedTransport::new(HashMap::new()));
        let dispatcher = dispatcher(transport);

        // Original persisted send.
        let first = dispatcher
            .broadcast(&pool, request(true, false))
            .await
            .unwrap();
        assert!(first.history_id.is_some());
        assert_eq!(PushMessageRepository::count(&pool).await.unwrap(), 1);

        // Resend from history: skip_persist guards against duplicate rows.
        let again = dispatcher
            .broadcast(&pool, request(true, true))
            .await
            .unwrap();
        assert!(again.history_id.is_none());
        assert_eq!(PushMessageRepository::count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn deadline_abandons_workers_as_unknown_without_pruning() {
        let pool = test_pool().await;
        seed_subscribers(&pool, 3).await;

        let dispatcher = Dispatcher::new(Arc::new(StalledTransport), 4, Duration::from_millis(50));
        let summary = dispatcher
            .broadcast(&pool, request(false, false))
            .await
            .unwrap();

        assert_eq!(summary.success_count, 0);
        assert_eq!(summary.permanent_failure_count, 0);
        assert_eq!(summary.transient_failure_count, 0);
        assert_eq!(summary.unknown_count, 3);

        // A slow network must never evict live subscribers.
        let remaining = SubscriberRepository::list_active(&pool).await.unwrap();
        assert_eq!(remaining.len(), 3);
    }

    #[tokio::test]
    async fn welcome_send_targets_one_subscription_only() {
        let pool = test_pool().await;
        let transport = Arc::new(ScriptedTransport::new(HashMap::new()));
        let dispatcher = Dispatcher::new(transport.clone(), 4, Duration::from_secs(5));

        let subscription = PushSubscription {
            endpoint: "https://push.example.com/send/welcome".to_string(),
            keys: SubscriptionKeys {
                p256dh: "key".to_string(),
                auth: "auth".to_string(),
            },
        };

        let class = dispatcher
            .send_single(&subscription, "Welcome!", "Thanks for subscribing")
            .await
            .unwrap();

        assert_eq!(class, DeliveryClass::Success);
        assert_eq!(transport.attempts_for(&subscription.endpoint), 1);
        // No registry row, no history row.
        assert!(SubscriberRepository::list_active(&pool).await.unwrap().is_empty());
        assert_eq!(PushMessageRepository::count(&pool).await.unwrap(), 0);
    }
}
