//! Bearer-token resolution for operator endpoints.
//!
//! Identity lives in an external service; this layer only validates the JWT
//! it is handed and reads the `sub`/`role` claims. The resolved operator is
//! passed into handlers as an extractor argument, never read from ambient
//! global state.

use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::AppState;

pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Debug, Clone)]
pub struct Operator {
    pub id: String,
    pub role: String,
}

impl Operator {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

pub fn decode_operator_token(secret: &str, token: &str) -> Result<Operator, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;

    Ok(Operator {
        id: token_data.claims.sub,
        role: token_data.claims.role,
    })
}

fn bearer_token(parts: &Parts) -> Result<String, AppError> {
    let auth_header = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::debug!("Missing or invalid Authorization header");
            AppError::Unauthorized
        })?;

    if !auth_header.to_ascii_lowercase().starts_with("bearer ") {
        tracing::debug!("Authorization header doesn't start with 'Bearer '");
        return Err(AppError::Unauthorized);
    }

    let token = auth_header[7..].trim();
    if token.is_empty() {
        return Err(AppError::Unauthorized);
    }

    Ok(token.to_string())
}

/// Extractor requiring a valid bearer token whose role claim is `admin`.
/// Rejection happens before the handler body runs, so failed authorization
/// has no side effects.
pub struct AdminOperator(pub Operator);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminOperator {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let operator = decode_operator_token(&state.config.jwt.secret, &token)?;

        if !operator.is_admin() {
            tracing::debug!(operator = %operator.id, role = %operator.role, "Operator lacks admin role");
            return Err(AppError::Forbidden);
        }

        Ok(AdminOperator(operator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn make_token(secret: &str, role: &str, exp_offset_secs: i64) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: "op-42".to_string(),
            role: role.to_string(),
            exp: (now + exp_offset_secs) as usize,
            iat: now as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_admin_token_resolves_operator() {
        let token = make_token("s3cret", "admin", 3600);
        let operator = decode_operator_token("s3cret", &token).unwrap();
        assert_eq!(operator.id, "op-42");
        assert!(operator.is_admin());
    }

    #[test]
    fn non_admin_role_is_not_admin() {
        let token = make_token("s3cret", "editor", 3600);
        let operator = decode_operator_token("s3cret", &token).unwrap();
        assert!(!operator.is_admin());
    }

    #[test]
    fn expired_or_garbage_tokens_fail() {
        let token = make_token("s3cret", "admin", -3600);
        assert!(matches!(
            decode_operator_token("s3cret", &token),
            Err(AppError::Jwt(_))
        ));
        assert!(matches!(
            decode_operator_token("s3cret", "not-a-jwt"),
            Err(AppError::Jwt(_))
        ));
        // Token signed with a different secret is rejected.
        let foreign = make_token("other", "admin", 3600);
        assert!(decode_operator_token("s3cret", &foreign).is_err());
    }
}
