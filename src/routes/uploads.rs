use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::UploadedAsset;
use crate::db::UploadedAssetRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::AdminOperator;
use crate::services::storage::{derive_object_path, UploadGrant};
use crate::AppState;

/// Storage namespace under which notification images live.
const ASSET_NAMESPACE: &str = "push";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sign-url", post(sign_upload_url))
        .route("/delete", post(delete_upload))
}

pub fn images_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_images))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SignUrlRequest {
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUrlResponse {
    pub ok: bool,
    pub signed_upload: UploadGrant,
    pub path: String,
    pub public_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUploadRequest {
    pub path: Option<String>,
    pub bucket: Option<String>,
    pub public_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteUploadResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryImage {
    pub path: String,
    pub public_url: String,
    pub uploaded_by: Option<String>,
    pub created_at: Option<chrono::NaiveDateTime>,
}

#[derive(Debug, Serialize)]
pub struct GalleryResponse {
    pub data: Vec<GalleryImage>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Issue a short-lived signed URL so the browser uploads the image directly
/// to storage. The file bytes never pass through this service.
async fn sign_upload_url(
    State(state): State<Arc<AppState>>,
    AdminOperator(operator): AdminOperator,
    Json(request): Json<SignUrlRequest>,
) -> AppResult<Json<SignUrlResponse>> {
    let filename = request
        .filename
        .filter(|f| !f.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Missing filename".to_string()))?;

    let path = derive_object_path(ASSET_NAMESPACE, &filename);
    let grant = state.storage.issue_upload_grant(&path)?;

    UploadedAssetRepository::create(
        &state.db,
        &grant.path,
        state.storage.bucket(),
        &grant.public_url,
        &operator.id,
    )
    .await?;

    Ok(Json(SignUrlResponse {
        ok: true,
        path: grant.path.clone(),
        public_url: grant.public_url.clone(),
        signed_upload: grant,
    }))
}

/// Delete an uploaded image from storage and drop its metadata row. Callers
/// may identify the object by path or by its public URL.
async fn delete_upload(
    State(state): State<Arc<AppState>>,
    AdminOperator(_operator): AdminOperator,
    Json(request): Json<DeleteUploadRequest>,
) -> AppResult<Json<DeleteUploadResponse>> {
    let (bucket, path) = resolve_target(&state, &request)?;

    state.storage.delete_object(&bucket, &path).await?;
    UploadedAssetRepository::delete_by_path(&state.db, &path).await?;

    Ok(Json(DeleteUploadResponse { ok: true }))
}

/// Gallery of previously uploaded images, joining the storage listing with
/// locally recorded metadata. Objects missing a metadata row (e.g. uploaded
/// before this service tracked them) still appear.
async fn list_images(
    State(state): State<Arc<AppState>>,
    AdminOperator(_operator): AdminOperator,
) -> AppResult<Json<GalleryResponse>> {
    let prefix = format!("{}/", ASSET_NAMESPACE);
    let objects = state.storage.list_objects(&prefix).await?;
    let records = UploadedAssetRepository::list_by_prefix(&state.db, &prefix).await?;

    let by_path: HashMap<String, UploadedAsset> =
        records.into_iter().map(|r| (r.path.clone(), r)).collect();

    let data = objects
        .into_iter()
        .map(|name| {
            let path = if name.starts_with(&prefix) {
                name
            } else {
                format!("{}{}", prefix, name)
            };
            match by_path.get(&path) {
                Some(record) => GalleryImage {
                    public_url: record.public_url.clone(),
                    uploaded_by: Some(record.uploaded_by.clone()),
                    created_at: Some(record.created_at),
                    path,
                },
                None => GalleryImage {
                    public_url: state.storage.public_url(state.storage.bucket(), &path),
                    uploaded_by: None,
                    created_at: None,
                    path,
                },
            }
        })
        .collect();

    Ok(Json(GalleryResponse { data }))
}

fn resolve_target(
    state: &AppState,
    request: &DeleteUploadRequest,
) -> AppResult<(String, String)> {
    if let Some(path) = request.path.as_ref().filter(|p| !p.is_empty()) {
        let bucket = request
            .bucket
            .clone()
            .unwrap_or_else(|| state.storage.bucket().to_string());
        return Ok((bucket, path.clone()));
    }

    if let Some(url) = request.public_url.as_ref() {
        if let Some((bucket, path)) = state.storage.resolve_public_url(url) {
            return Ok((bucket, path));
        }
        return Err(AppError::Validation(
            "Unrecognized public URL".to_string(),
        ));
    }

    Err(AppError::Validation(
        "Provide a path or publicUrl".to_string(),
    ))
}
