//! Web Push wire layer: RFC 8291 message encryption (aes128gcm) and RFC 8292
//! VAPID request signing.
//!
//! Every subscriber gets an independently encrypted ciphertext of the same
//! logical payload, keyed off that subscriber's Diffie-Hellman public key and
//! auth secret. The VAPID key pair is service-wide and shared read-only across
//! all deliveries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::Utc;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::{OsRng, RngCore};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use url::Url;

use crate::config::{DispatchConfig, VapidConfig};
use crate::error::{AppError, AppResult};

const SALT_LEN: usize = 16;
const PUBLIC_KEY_LEN: usize = 65;
const AUTH_SECRET_LEN: usize = 16;
const RECORD_SIZE: u32 = 4096;
const MAX_PAYLOAD_BYTES: usize = 3500;
const VAPID_JWT_EXP_SECS: i64 = 12 * 60 * 60;
const VAPID_JWT_SKEW_SECS: i64 = 60;

const IKM_INFO_PREFIX: &str = "WebPush: info\0";
const KEY_INFO: &str = "Content-Encoding: aes128gcm\0";
const NONCE_INFO: &str = "Content-Encoding: nonce\0";

/// The subscription object a browser hands to `subscribe`, as produced by the
/// platform push API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Per-delivery outcome classification used to drive pruning and the
/// aggregate counts reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    Success,
    /// The push service discarded this subscription (404/410) or the stored
    /// key material is unusable. Stop sending to this subscriber.
    PermanentFailure,
    /// Retryable condition: timeout, 5xx, any other 4xx.
    TransientFailure,
}

/// Map a push-service HTTP status to a delivery classification.
pub fn classify_status(status: u16) -> DeliveryClass {
    match status {
        200..=299 => DeliveryClass::Success,
        404 | 410 => DeliveryClass::PermanentFailure,
        _ => DeliveryClass::TransientFailure,
    }
}

/// Seam between the dispatcher and the actual push-service wire protocol.
/// Delivery errors are contained here: the transport always reports a
/// classification and never propagates per-subscriber failures upward.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn deliver(
        &self,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        payload: &[u8],
    ) -> DeliveryClass;
}

#[derive(Debug, Clone)]
struct CachedVapidJwt {
    jwt: String,
    exp_unix: i64,
}

/// reqwest-backed transport performing encrypt-sign-send against real push
/// services.
pub struct WebPushClient {
    client: reqwest::Client,
    vapid: VapidConfig,
    ttl_seconds: u64,
    // VAPID JWTs are cached per push-service origin; rebuilding an ES256
    // signature per subscriber would dominate dispatch cost.
    jwt_cache: Mutex<HashMap<String, CachedVapidJwt>>,
}

impl WebPushClient {
    pub fn new(vapid: VapidConfig, dispatch: &DispatchConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(dispatch.request_timeout_seconds))
            .build()
            .map_err(AppError::Request)?;

        Ok(Self {
            client,
            vapid,
            ttl_seconds: dispatch.ttl_seconds,
            jwt_cache: Mutex::new(HashMap::new()),
        })
    }

    fn vapid_jwt_for(&self, audience: &str) -> AppResult<String> {
        let now = Utc::now().timestamp();

        {
            let cache = self.jwt_cache.lock().unwrap();
            if let Some(entry) = cache.get(audience) {
                if entry.exp_unix - VAPID_JWT_SKEW_SECS > now {
                    return Ok(entry.jwt.clone());
                }
            }
        }

        let (jwt, exp_unix) = build_vapid_jwt(
            audience,
            &self.vapid.subject,
            &self.vapid.private_key_raw,
            VAPID_JWT_EXP_SECS,
        )?;
        self.jwt_cache.lock().unwrap().insert(
            audience.to_string(),
            CachedVapidJwt {
                jwt: jwt.clone(),
                exp_unix,
            },
        );
        Ok(jwt)
    }

    async fn try_deliver(
        &self,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        payload: &[u8],
    ) -> AppResult<DeliveryClass> {
        let audience = push_service_audience(endpoint)?;
        let jwt = self.vapid_jwt_for(&audience)?;

        let client_public = decode_client_public_key(p256dh)?;
        let client_auth = decode_client_auth_secret(auth)?;
        let body = encrypt_payload(payload, &client_public, &client_auth)?;

        let authorization = format!("vapid t={}, k={}", jwt, self.vapid.public_key_b64);

        let response = self
            .client
            .post(endpoint)
            .header("TTL", self.ttl_seconds.to_string())
            .header("Content-Encoding", "aes128gcm")
            .header("Content-Type", "application/octet-stream")
            .header("Urgency", "normal")
            .header("Authorization", authorization)
            .body(body)
            .send()
            .await?;

        Ok(classify_status(response.status().as_u16()))
    }
}

#[async_trait]
impl PushTransport for WebPushClient {
    async fn deliver(
        &self,
        endpoint: &str,
        p256dh: &str,
        auth: &str,
        payload: &[u8],
    ) -> DeliveryClass {
        match self.try_deliver(endpoint, p256dh, auth, payload).await {
            Ok(class) => class,
            // Unusable key material is permanent for this subscriber only.
            Err(AppError::Validation(msg)) => {
                tracing::warn!(endpoint = %endpoint, error = %msg, "Subscriber keys are malformed");
                DeliveryClass::PermanentFailure
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Push delivery attempt failed");
                DeliveryClass::TransientFailure
            }
        }
    }
}

/// Derive the VAPID `aud` claim (scheme://host[:port]) from a subscriber's
/// endpoint URL.
pub fn push_service_audience(endpoint: &str) -> AppResult<String> {
    let url = Url::parse(endpoint)
        .map_err(|e| AppError::Validation(format!("Invalid push endpoint URL: {}", e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Push endpoint missing host".to_string()))?;

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

fn decode_client_public_key(p256dh: &str) -> AppResult<[u8; PUBLIC_KEY_LEN]> {
    let raw = decode_b64url(p256dh)
        .map_err(|_| AppError::Validation("Invalid p256dh key encoding".to_string()))?;
    raw.try_into()
        .map_err(|_| AppError::Validation("Invalid p256dh key length".to_string()))
}

fn decode_client_auth_secret(auth: &str) -> AppResult<[u8; AUTH_SECRET_LEN]> {
    let raw = decode_b64url(auth)
        .map_err(|_| AppError::Validation("Invalid auth secret encoding".to_string()))?;
    raw.try_into()
        .map_err(|_| AppError::Validation("Invalid auth secret length".to_string()))
}

pub fn decode_b64url(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(input.as_bytes())
}

pub fn encode_b64url(input: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(input)
}

fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> AppResult<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|_| AppError::PushDelivery("HKDF expand failed".to_string()))?;
    Ok(okm)
}

/// Encrypt one payload for one subscriber per RFC 8291, producing the full
/// `aes128gcm` content coding: salt, record size, ephemeral public key, then
/// a single AES-128-GCM record with a `0x02` final-record delimiter.
pub fn encrypt_payload(
    plaintext: &[u8],
    client_public_raw: &[u8; PUBLIC_KEY_LEN],
    auth_secret: &[u8; AUTH_SECRET_LEN],
) -> AppResult<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(AppError::PushDelivery(
            "Push payload cannot be empty".to_string(),
        ));
    }
    if plaintext.len() > MAX_PAYLOAD_BYTES {
        return Err(AppError::PushDelivery(format!(
            "Push payload exceeds {} bytes",
            MAX_PAYLOAD_BYTES
        )));
    }

    let mut rng = OsRng;
    let mut salt = [0u8; SALT_LEN];
    rng.fill_bytes(&mut salt);

    let client_public = p256::PublicKey::from_sec1_bytes(client_public_raw)
        .map_err(|_| AppError::Validation("Invalid p256dh key".to_string()))?;

    let ephemeral_secret = EphemeralSecret::random(&mut rng);
    let ephemeral_public = p256::PublicKey::from(&ephemeral_secret);
    let ephemeral_point = ephemeral_public.to_encoded_point(false);
    let ephemeral_raw: [u8; PUBLIC_KEY_LEN] = ephemeral_point
        .as_bytes()
        .try_into()
        .map_err(|_| AppError::PushDelivery("Unexpected ephemeral key length".to_string()))?;

    let shared_secret = ephemeral_secret.diffie_hellman(&client_public);

    // key_info = "WebPush: info" || 0x00 || ua_public || as_public
    let mut ikm_info = Vec::with_capacity(IKM_INFO_PREFIX.len() + PUBLIC_KEY_LEN * 2);
    ikm_info.extend_from_slice(IKM_INFO_PREFIX.as_bytes());
    ikm_info.extend_from_slice(client_public_raw);
    ikm_info.extend_from_slice(&ephemeral_raw);

    let ikm = hkdf_sha256(
        auth_secret,
        shared_secret.raw_secret_bytes().as_slice(),
        &ikm_info,
        32,
    )?;
    let cek = hkdf_sha256(&salt, &ikm, KEY_INFO.as_bytes(), 16)?;
    let nonce = hkdf_sha256(&salt, &ikm, NONCE_INFO.as_bytes(), 12)?;

    let cipher = Aes128Gcm::new_from_slice(&cek)
        .map_err(|_| AppError::PushDelivery("Invalid CEK length".to_string()))?;

    let mut record = Vec::with_capacity(plaintext.len() + 1);
    record.extend_from_slice(plaintext);
    record.push(2); // final record delimiter

    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), record.as_slice())
        .map_err(|_| AppError::PushDelivery("AES-GCM encryption failed".to_string()))?;

    // Header: salt (16) || rs (4) || idlen (1) || keyid (65) || ciphertext.
    let mut body = Vec::with_capacity(SALT_LEN + 4 + 1 + PUBLIC_KEY_LEN + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&RECORD_SIZE.to_be_bytes());
    body.push(PUBLIC_KEY_LEN as u8);
    body.extend_from_slice(&ephemeral_raw);
    body.extend_from_slice(&ciphertext);

    Ok(body)
}

/// Build a signed ES256 VAPID JWT for one push-service origin. Returns the
/// compact JWT and its expiry.
pub fn build_vapid_jwt(
    audience: &str,
    subject: &str,
    private_key_raw: &[u8; 32],
    exp_secs: i64,
) -> AppResult<(String, i64)> {
    #[derive(Serialize)]
    struct Claims<'a> {
        aud: &'a str,
        exp: i64,
        sub: &'a str,
    }

    let header = serde_json::json!({ "typ": "JWT", "alg": "ES256" });
    let exp_unix = Utc::now().timestamp() + exp_secs;
    let claims = Claims {
        aud: audience,
        exp: exp_unix,
        sub: subject,
    };

    let header_json = serde_json::to_vec(&header)
        .map_err(|e| AppError::PushDelivery(format!("VAPID header serialization failed: {}", e)))?;
    let claims_json = serde_json::to_vec(&claims)
        .map_err(|e| AppError::PushDelivery(format!("VAPID claims serialization failed: {}", e)))?;

    let signing_input = format!(
        "{}.{}",
        encode_b64url(&header_json),
        encode_b64url(&claims_json)
    );

    let signing_key = SigningKey::from_bytes(private_key_raw.into())
        .map_err(|_| AppError::Config("Invalid VAPID private key".to_string()))?;
    let signature: p256::ecdsa::Signature = signing_key.sign(signing_input.as_bytes());
    let signature_b64 = encode_b64url(signature.to_bytes().as_slice());

    Ok((format!("{}.{}", signing_input, signature_b64), exp_unix))
}
