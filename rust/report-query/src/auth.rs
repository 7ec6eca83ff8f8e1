//! Bearer JWT authentication (HS256, claims `sub`, `role`, `exp`).

use crate::{
    error::{Result, ServiceError},
    state::AppState,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use http::header::AUTHORIZATION;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    #[serde(other)]
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Role,
    pub exp: i64,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtKeys {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue(&self, principal: &Principal, ttl: Duration) -> Result<String> {
        let claims = Claims {
            sub: principal.user_id.clone(),
            role: principal.role,
            exp: Utc::now().timestamp() + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| ServiceError::Internal(anyhow::Error::new(err).context("failed to sign token")))
    }

    pub fn verify(&self, token: &str) -> Result<Principal> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|err| {
            debug!(error = %err, "rejected bearer token");
            ServiceError::Unauthenticated
        })?;
        if data.claims.sub.trim().is_empty() {
            return Err(ServiceError::Unauthenticated);
        }
        Ok(Principal {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}

fn bearer(parts: &Parts) -> Option<&str> {
    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = header.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// Rejects the request with 401 unless a valid bearer token is present.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer(parts).ok_or(ServiceError::Unauthenticated)?;
        state.jwt.verify(token).map(AuthUser)
    }
}

/// Anonymous callers pass through; a present but invalid token is still 401.
#[derive(Debug, Clone)]
pub struct OptionalAuthUser(pub Option<Principal>);

#[async_trait]
impl FromRequestParts<AppState> for OptionalAuthUser {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        match bearer(parts) {
            Some(token) => state.jwt.verify(token).map(|p| OptionalAuthUser(Some(p))),
            None => Ok(OptionalAuthUser(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify_and_tampering_fails() {
        let keys = JwtKeys::new("test-secret");
        let principal = Principal {
            user_id: "alice".into(),
            role: Role::Admin,
        };
        let token = keys.issue(&principal, Duration::from_secs(60)).unwrap();
        assert_eq!(keys.verify(&token).unwrap(), principal);

        let other = JwtKeys::new("other-secret");
        assert!(matches!(other.verify(&token), Err(ServiceError::Unauthenticated)));
        assert!(matches!(keys.verify("not-a-jwt"), Err(ServiceError::Unauthenticated)));
    }

    #[test]
    fn unknown_roles_are_plain_users() {
        let claims: Claims =
            serde_json::from_str(r#"{"sub":"bob","role":"auditor","exp":1}"#).unwrap();
        assert_eq!(claims.role, Role::User);
    }
}
