//! Bearer token verification (HS256 JWTs issued by the auth service).

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;

/// Claims carried by an access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// A verified identity. Envelopes are stamped with this, never with
/// client-supplied sender fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Verifies access tokens against the shared HMAC secret.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate signature and expiry, returning the caller's identity.
    pub fn verify(&self, token: &str) -> Result<Identity, ApiError> {
        let data = jsonwebtoken::decode::<AccessClaims>(token, &self.key, &self.validation)
            .map_err(|e| {
                tracing::debug!(?e, "access token validation failed");
                ApiError::unauthorized("Invalid or expired token")
            })?;

        let claims = data.claims;
        if claims.user_id.is_empty() {
            return Err(ApiError::unauthorized("Token has no subject"));
        }

        Ok(Identity {
            user_id: claims.user_id,
            username: claims.username,
        })
    }
}

/// Mint an access token. Issuance belongs to the auth service; this exists
/// for local tooling and tests that need a token the verifier accepts.
pub fn issue_token(
    secret: &str,
    user_id: &str,
    username: &str,
    ttl: chrono::Duration,
) -> Result<String, ApiError> {
    let now = chrono::Utc::now();
    let claims = AccessClaims {
        user_id: user_id.to_string(),
        username: username.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(?e, "token encoding failed");
        ApiError::internal("token encoding failed")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn verifies_issued_token() {
        let token = issue_token(SECRET, "usr_1", "alice", chrono::Duration::minutes(5)).unwrap();
        let identity = JwtVerifier::new(SECRET).verify(&token).unwrap();
        assert_eq!(identity.user_id, "usr_1");
        assert_eq!(identity.username, "alice");
    }

    #[test]
    fn rejects_wrong_secret() {
        let token = issue_token("other", "usr_1", "alice", chrono::Duration::minutes(5)).unwrap();
        let err = JwtVerifier::new(SECRET).verify(&token).unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn rejects_expired_token() {
        let token = issue_token(SECRET, "usr_1", "alice", chrono::Duration::minutes(-10)).unwrap();
        assert!(JwtVerifier::new(SECRET).verify(&token).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(JwtVerifier::new(SECRET).verify("not-a-jwt").is_err());
    }
}
