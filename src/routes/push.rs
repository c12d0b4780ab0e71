use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::db::SubscriberRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::AdminOperator;
use crate::services::dispatch::{DispatchRequest, DispatchSummary};
use crate::services::webpush::{DeliveryClass, PushSubscription};
use crate::AppState;

/// Endpoints callable by the subscribing browser itself (no operator token).
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
}

/// Operator-only dispatch endpoints.
pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/send", post(send_broadcast))
        .route("/welcome", post(send_welcome))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub subscription: Option<PushSubscription>,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub title: Option<String>,
    pub message: Option<String>,
    pub image_url: Option<String>,
    pub url: Option<String>,
    pub persist: Option<bool>,
    pub skip_persist: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct WelcomeRequest {
    pub subscription: Option<PushSubscription>,
    pub title: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub summary: DispatchSummary,
}

// ============================================================================
// Handlers
// ============================================================================

/// Register (or refresh) a browser push subscription. Idempotent by endpoint.
async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscribeRequest>,
) -> AppResult<Json<OkResponse>> {
    let subscription = request
        .subscription
        .ok_or_else(|| AppError::Validation("Missing subscription".to_string()))?;
    validate_subscription(&subscription)?;

    let subscriber = SubscriberRepository::upsert(
        &state.db,
        &subscription.endpoint,
        &subscription.keys.p256dh,
        &subscription.keys.auth,
    )
    .await?;

    tracing::debug!(subscriber = %subscriber.id, "Push subscription registered");
    Ok(Json(OkResponse { ok: true }))
}

/// Remove a subscription. Succeeds even if the endpoint was never registered,
/// since unsubscribing clients may retry.
async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UnsubscribeRequest>,
) -> AppResult<Json<OkResponse>> {
    let endpoint = request
        .endpoint
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Missing endpoint".to_string()))?;

    SubscriberRepository::delete_by_endpoint(&state.db, &endpoint).await?;
    Ok(Json(OkResponse { ok: true }))
}

/// Broadcast one message to everyone active right now.
async fn send_broadcast(
    State(state): State<Arc<AppState>>,
    AdminOperator(operator): AdminOperator,
    Json(request): Json<SendRequest>,
) -> AppResult<Json<SendResponse>> {
    let title = required_text(request.title, "title")?;
    let message = required_text(request.message, "message")?;

    let summary = state
        .dispatcher
        .broadcast(
            &state.db,
            DispatchRequest {
                // The dispatcher requires plain text; rich input is reduced here.
                title: strip_html(&title),
                message: strip_html(&message),
                image_url: request.image_url.filter(|u| !u.is_empty()),
                url: request.url.filter(|u| !u.is_empty()),
                persist: request.persist.unwrap_or(true),
                skip_persist: request.skip_persist.unwrap_or(false),
                created_by: operator.id,
            },
        )
        .await?;

    Ok(Json(SendResponse { ok: true, summary }))
}

/// Onboarding confirmation to exactly one just-created subscription.
async fn send_welcome(
    State(state): State<Arc<AppState>>,
    AdminOperator(_operator): AdminOperator,
    Json(request): Json<WelcomeRequest>,
) -> AppResult<Json<OkResponse>> {
    let subscription = request
        .subscription
        .ok_or_else(|| AppError::Validation("Missing subscription".to_string()))?;
    validate_subscription(&subscription)?;
    let title = required_text(request.title, "title")?;
    let message = required_text(request.message, "message")?;

    let class = state
        .dispatcher
        .send_single(&subscription, &strip_html(&title), &strip_html(&message))
        .await?;

    if class != DeliveryClass::Success {
        tracing::warn!(endpoint = %subscription.endpoint, ?class, "Welcome push failed");
    }
    Ok(Json(OkResponse {
        ok: class == DeliveryClass::Success,
    }))
}

fn validate_subscription(subscription: &PushSubscription) -> AppResult<()> {
    if subscription.endpoint.trim().is_empty() {
        return Err(AppError::Validation(
            "Subscription endpoint is required".to_string(),
        ));
    }
    if subscription.keys.p256dh.is_empty() || subscription.keys.auth.is_empty() {
        return Err(AppError::Validation(
            "Subscription keys are required".to_string(),
        ));
    }
    Ok(())
}

fn required_text(value: Option<String>, field: &str) -> AppResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(format!("Missing {}", field)))
}

/// Reduce operator-authored content to plain text: drop tags, decode the
/// entities an editor commonly emits. The delivered body must never contain
/// HTML.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;

    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    out.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_removes_markup() {
        assert_eq!(
            strip_html("<p>Big <b>sale</b> today</p>"),
            "Big sale today"
        );
        assert_eq!(strip_html("Plain text stays"), "Plain text stays");
        assert_eq!(strip_html("a &amp; b &lt;3"), "a & b <3");
    }

    #[test]
    fn strip_html_handles_unclosed_tags() {
        assert_eq!(strip_html("broken <b tag"), "broken");
        assert_eq!(strip_html("<br/>leading"), "leading");
    }

    #[test]
    fn required_text_rejects_missing_and_blank() {
        assert!(required_text(None, "title").is_err());
        assert!(required_text(Some("   ".to_string()), "title").is_err());
        assert_eq!(
            required_text(Some(" ok ".to_string()), "title").unwrap(),
            "ok"
        );
    }

    #[test]
    fn subscription_validation_requires_endpoint_and_keys() {
        use crate::services::webpush::SubscriptionKeys;

        let good = PushSubscription {
            endpoint: "https://push.example.com/send/x".to_string(),
            keys: SubscriptionKeys {
                p256dh: "k".to_string(),
                auth: "a".to_string(),
            },
        };
        assert!(validate_subscription(&good).is_ok());

        let mut missing_endpoint = good.clone();
        missing_endpoint.endpoint = " ".to_string();
        assert!(validate_subscription(&missing_endpoint).is_err());

        let mut missing_keys = good;
        missing_keys.keys.auth = String::new();
        assert!(validate_subscription(&missing_keys).is_err());
    }
}
