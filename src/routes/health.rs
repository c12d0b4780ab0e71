use axum::Json;
use serde_json::{json, Value};

/// Liveness probe. Names the service and build version so a deploy can be
/// told apart from the edge without shelling into the container.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
