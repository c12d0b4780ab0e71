use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{PushMessage, UpdatePushMessage};
use crate::db::PushMessageRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::AdminOperator;
use crate::services::dispatch::{DispatchRequest, DispatchSummary};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_messages))
        .route(
            "/:id",
            get(load_message).put(edit_message).delete(delete_message),
        )
        .route("/:id/repush", post(repush_message))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct MessageListResponse {
    pub data: Vec<PushMessage>,
}

/// Partial edit. Omitting `payload` leaves both link fields alone; sending it
/// replaces them wholesale, so an operator can clear an image by sending a
/// payload without `imageUrl`.
#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub title: Option<String>,
    pub message: Option<String>,
    pub payload: Option<EditMessagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessagePayload {
    pub image_url: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EditMessageResponse {
    pub ok: bool,
    pub data: PushMessage,
}

#[derive(Debug, Serialize)]
pub struct RepushResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub summary: DispatchSummary,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub ok: bool,
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_messages(
    State(state): State<Arc<AppState>>,
    AdminOperator(_operator): AdminOperator,
) -> AppResult<Json<MessageListResponse>> {
    let data = PushMessageRepository::list(&state.db).await?;
    Ok(Json(MessageListResponse { data }))
}

async fn load_message(
    State(state): State<Arc<AppState>>,
    AdminOperator(_operator): AdminOperator,
    Path(id): Path<String>,
) -> AppResult<Json<PushMessage>> {
    let entry = PushMessageRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))?;
    Ok(Json(entry))
}

/// Edit display fields of a history entry. Never redelivers.
async fn edit_message(
    State(state): State<Arc<AppState>>,
    AdminOperator(_operator): AdminOperator,
    Path(id): Path<String>,
    Json(request): Json<EditMessageRequest>,
) -> AppResult<Json<EditMessageResponse>> {
    let changes = UpdatePushMessage {
        title: request.title.filter(|t| !t.trim().is_empty()),
        message: request.message.filter(|m| !m.trim().is_empty()),
        image_url: request
            .payload
            .as_ref()
            .map(|p| p.image_url.clone().filter(|u| !u.is_empty())),
        url: request
            .payload
            .as_ref()
            .map(|p| p.url.clone().filter(|u| !u.is_empty())),
    };

    let updated = PushMessageRepository::update(&state.db, &id, changes)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))?;
    Ok(Json(EditMessageResponse {
        ok: true,
        data: updated,
    }))
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    AdminOperator(_operator): AdminOperator,
    Path(id): Path<String>,
) -> AppResult<Json<DeleteResponse>> {
    if !PushMessageRepository::delete(&state.db, &id).await? {
        return Err(AppError::NotFound(format!("Message {} not found", id)));
    }
    Ok(Json(DeleteResponse { ok: true }))
}

/// Re-send a stored message to the current audience. The original history row
/// stands; no new row is written.
async fn repush_message(
    State(state): State<Arc<AppState>>,
    AdminOperator(operator): AdminOperator,
    Path(id): Path<String>,
) -> AppResult<Json<RepushResponse>> {
    let entry = PushMessageRepository::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Message {} not found", id)))?;

    tracing::info!(message = %entry.id, operator = %operator.id, "Repushing history entry");

    let summary = state
        .dispatcher
        .broadcast(
            &state.db,
            DispatchRequest {
                title: entry.title,
                message: entry.message,
                image_url: entry.image_url,
                url: entry.url,
                persist: false,
                skip_persist: true,
                created_by: operator.id,
            },
        )
        .await?;

    Ok(Json(RepushResponse { ok: true, summary }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tower::ServiceExt;

    use crate::config::{
        Config, DatabaseConfig, DispatchConfig, JwtConfig, RateLimitConfig, ServerConfig,
        StorageConfig, VapidConfig,
    };
    use crate::db::models::CreatePushMessage;
    use crate::routes::auth::Claims;
    use crate::services::dispatch::Dispatcher;
    use crate::services::storage::{ObjectStore, SignedUrlStore};
    use crate::services::webpush::{DeliveryClass, PushTransport};

    struct OkTransport;

    #[async_trait]
    impl PushTransport for OkTransport {
        async fn deliver(
            &self,
            _endpoint: &str,
            _p256dh: &str,
            _auth: &str,
            _payload: &[u8],
        ) -> DeliveryClass {
            DeliveryClass::Success
        }
    }

    async fn test_state() -> Arc<AppState> {
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&db).await.unwrap();

        let storage_config = StorageConfig {
            base_url: "http://storage.local".to_string(),
            bucket: "push-images".to_string(),
            signing_secret: "test-secret".to_string(),
            grant_ttl_seconds: 120,
        };
        let storage: Arc<dyn ObjectStore> =
            Arc::new(SignedUrlStore::new(&storage_config).unwrap());

        Arc::new(AppState {
            db,
            config: Config {
                server: ServerConfig {
                    host: "127.0.0.1".to_string(),
                    port: 0,
                    frontend_url: "http://localhost:3000".to_string(),
                },
                database: DatabaseConfig {
                    url: "sqlite::memory:".to_string(),
                    max_connections: 1,
                },
                jwt: JwtConfig {
                    secret: "test-jwt-secret".to_string(),
                },
                vapid: VapidConfig {
                    public_key_b64: "unused".to_string(),
                    private_key_raw: [7u8; 32],
                    subject: "mailto:ops@example.com".to_string(),
                },
                storage: storage_config,
                dispatch: DispatchConfig {
                    concurrency: 4,
                    request_timeout_seconds: 5,
                    batch_deadline_seconds: 5,
                    ttl_seconds: 3600,
                },
                rate_limit: RateLimitConfig {
                    subscribe_per_second: 5,
                    subscribe_burst: 20,
                },
            },
            dispatcher: Dispatcher::new(Arc::new(OkTransport), 4, Duration::from_secs(5)),
            storage,
        })
    }

    fn admin_bearer() -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "op-1".to_string(),
            role: "admin".to_string(),
            exp: (now + 3600) as usize,
            iat: now as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret("test-jwt-secret".as_bytes()),
        )
        .unwrap();
        format!("Bearer {}", token)
    }

    #[tokio::test]
    async fn edit_responds_with_ok_and_updated_entry() {
        let state = test_state().await;
        let entry = PushMessageRepository::create(
            &state.db,
            CreatePushMessage {
                title: "Original".to_string(),
                message: "body".to_string(),
                image_url: None,
                url: None,
                created_by: "op-1".to_string(),
            },
        )
        .await
        .unwrap();

        let app = axum::Router::new()
            .nest("/api/messages", router())
            .with_state(state);

        let request = Request::builder()
            .method("PUT")
            .uri(format!("/api/messages/{}", entry.id))
            .header("Authorization", admin_bearer())
            .header("Content-Type", "application/json")
            .body(axum::body::Body::from(r#"{"title":"Edited"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        // Clients gate on `.ok` like every other mutating endpoint here.
        assert_eq!(json["ok"], true);
        assert_eq!(json["data"]["title"], "Edited");
        assert_eq!(json["data"]["message"], "body");
    }

    #[tokio::test]
    async fn edit_of_missing_entry_is_not_found() {
        let state = test_state().await;
        let app = axum::Router::new()
            .nest("/api/messages", router())
            .with_state(state);

        let request = Request::builder()
            .method("PUT")
            .uri("/api/messages/no-such-id")
            .header("Authorization", admin_bearer())
            .header("Content-Type", "application/json")
            .body(axum::body::Body::from(r#"{"title":"Edited"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
