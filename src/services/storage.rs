//! Asset upload broker.
//!
//! Uploads go straight from the operator's browser to object storage via a
//! short-lived signed grant; this service never proxies file bytes. The
//! concrete provider sits behind the `ObjectStore` capability trait so it can
//! be swapped without touching handlers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::StorageConfig;
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

const PUBLIC_OBJECT_SEGMENT: &str = "/object/public/";

/// A short-lived, single-path credential letting a browser PUT one object
/// directly into storage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadGrant {
    pub upload_url: String,
    pub token: String,
    pub path: String,
    pub public_url: String,
    pub expires_at: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Issue an upload grant for one storage path. Must only be called after
    /// the caller's operator identity has been verified.
    fn issue_upload_grant(&self, path: &str) -> AppResult<UploadGrant>;

    /// Names of objects under a prefix, as reported by the storage service.
    async fn list_objects(&self, prefix: &str) -> AppResult<Vec<String>>;

    /// Remove one object. A missing object is not an error.
    async fn delete_object(&self, bucket: &str, path: &str) -> AppResult<()>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    /// Invert `public_url`: recover `(bucket, path)` from a URL with the
    /// provider's known public shape.
    fn resolve_public_url(&self, url: &str) -> Option<(String, String)>;

    fn bucket(&self) -> &str;
}

/// HTTP object-storage provider using HMAC-signed upload URLs.
pub struct SignedUrlStore {
    base_url: String,
    bucket: String,
    signing_secret: String,
    grant_ttl: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
}

impl SignedUrlStore {
    pub fn new(config: &StorageConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(AppError::Request)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            signing_secret: config.signing_secret.clone(),
            grant_ttl: Duration::from_secs(config.grant_ttl_seconds),
            client,
        })
    }

    fn sign(&self, bucket: &str, path: &str, expires_at: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{}/{}:{}", bucket, path, expires_at).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Check a previously issued grant signature and expiry. Exposed for the
    /// storage-facing upload endpoint of the provider; also keeps the signing
    /// scheme honest in tests.
    pub fn verify_grant(&self, bucket: &str, path: &str, expires_at: i64, token: &str) -> bool {
        if expires_at <= Utc::now().timestamp() {
            return false;
        }
        // Constant-time comparison via the Mac verify API.
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(format!("{}/{}:{}", bucket, path, expires_at).as_bytes());
        match hex::decode(token) {
            Ok(raw) => mac.verify_slice(&raw).is_ok(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ObjectStore for SignedUrlStore {
    fn issue_upload_grant(&self, path: &str) -> AppResult<UploadGrant> {
        if path.is_empty() || path.contains("..") {
            return Err(AppError::Validation("Invalid storage path".to_string()));
        }

        let expires_at = Utc::now().timestamp() + self.grant_ttl.as_secs() as i64;
        let token = self.sign(&self.bucket, path, expires_at);
        let upload_url = format!(
            "{}/upload/{}/{}?token={}&expires={}",
            self.base_url, self.bucket, path, token, expires_at
        );

        Ok(UploadGrant {
            upload_url,
            token,
            path: path.to_string(),
            public_url: self.public_url(&self.bucket, path),
            expires_at,
        })
    }

    async fn list_objects(&self, prefix: &str) -> AppResult<Vec<String>> {
        let url = format!("{}/object/list/{}", self.base_url, self.bucket);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "prefix": prefix, "limit": 1000 }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Storage(format!(
                "Storage listing failed with status {}",
                response.status()
            )));
        }

        let entries: Vec<ObjectEntry> = response.json().await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn delete_object(&self, bucket: &str, path: &str) -> AppResult<()> {
        let url = format!("{}/object/{}/{}", self.base_url, bucket, path);
        let response = self.client.delete(&url).send().await?;

        let status = response.status();
        // Idempotent: the object being already gone is fine.
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }

        Err(AppError::Storage(format!(
            "Object delete failed with status {}",
            status
        )))
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}{}{}/{}", self.base_url, PUBLIC_OBJECT_SEGMENT, bucket, path)
    }

    fn resolve_public_url(&self, url: &str) -> Option<(String, String)> {
        let rest = url
            .strip_prefix(&self.base_url)?
            .strip_prefix(PUBLIC_OBJECT_SEGMENT)?;
        let (bucket, path) = rest.split_once('/')?;
        if bucket.is_empty() || path.is_empty() {
            return None;
        }
        Some((bucket.to_string(), path.to_string()))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Derive a namespaced, collision-resistant storage path for an upload.
pub fn derive_object_path(namespace: &str, filename: &str) -> String {
    let mut nonce = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut nonce);
    format!(
        "{}/{}-{}-{}",
        namespace,
        Utc::now().timestamp_millis(),
        hex::encode(nonce),
        sanitize_filename(filename)
    )
}

/// Reduce a client-supplied filename to a safe path segment.
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '-' || c == '.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn store() -> SignedUrlStore {
        SignedUrlStore::new(&StorageConfig {
            base_url: "http://storage.local:9000".to_string(),
            bucket: "push-images".to_string(),
            signing_secret: "test-secret".to_string(),
            grant_ttl_seconds: 120,
        })
        .unwrap()
    }

    #[test]
    fn grant_round_trips_through_verification() {
        let store = store();
        let grant = store.issue_upload_grant("push/123-banner.png").unwrap();

        assert!(store.verify_grant(
            "push-images",
            "push/123-banner.png",
            grant.expires_at,
            &grant.token
        ));
        // Wrong path or tampered token fails.
        assert!(!store.verify_grant("push-images", "push/other.png", grant.expires_at, &grant.token));
        assert!(!store.verify_grant(
            "push-images",
            "push/123-banner.png",
            grant.expires_at,
            "deadbeef"
        ));
    }

    #[test]
    fn expired_grant_is_rejected() {
        let store = store();
        let expired = Utc::now().timestamp() - 10;
        let token = store.sign("push-images", "push/a.png", expired);
        assert!(!store.verify_grant("push-images", "push/a.png", expired, &token));
    }

    #[test]
    fn grant_rejects_traversal_paths() {
        let store = store();
        assert!(store.issue_upload_grant("../etc/passwd").is_err());
        assert!(store.issue_upload_grant("").is_err());
    }

    #[test]
    fn public_url_resolution_is_inverse() {
        let store = store();
        let url = store.public_url("push-images", "push/123-banner.png");
        assert_eq!(
            url,
            "http://storage.local:9000/object/public/push-images/push/123-banner.png"
        );
        assert_eq!(
            store.resolve_public_url(&url),
            Some(("push-images".to_string(), "push/123-banner.png".to_string()))
        );

        // Foreign URLs do not resolve.
        assert_eq!(
            store.resolve_public_url("https://elsewhere.example.com/object/public/b/p"),
            None
        );
        assert_eq!(
            store.resolve_public_url("http://storage.local:9000/object/private/b/p"),
            None
        );
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("banner.png"), "banner.png");
        assert_eq!(sanitize_filename("my photo (1).png"), "my-photo--1-.png");
        assert_eq!(sanitize_filename("../../x"), "x");
        assert_eq!(sanitize_filename("???"), "upload");
    }

    #[test]
    fn derived_paths_are_namespaced_and_unique() {
        let a = derive_object_path("push", "banner.png");
        let b = derive_object_path("push", "banner.png");
        assert!(a.starts_with("push/"));
        assert!(a.ends_with("banner.png"));
        assert_ne!(a, b);
    }
}
