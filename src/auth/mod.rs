//! Credential verification.
//!
//! Identity comes from an external issuer; this module only verifies the
//! bearer credential and reads the subject, email and role out of it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use utoipa::ToSchema;

use crate::errors::ServiceError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Role {
    Customer,
    Admin,
}

/// Verified identity of the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// JWT claims carried by session credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: i64,
}

/// "Verify credential, return identity + role"
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, ServiceError>;
}

/// HS256 JWT verifier sharing a secret with the identity issuer
pub struct JwtCredentialVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtCredentialVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Signs a credential for `identity`; used by local tooling and tests.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, ServiceError> {
        let claims = Claims {
            sub: identity.user_id.clone(),
            email: identity.email.clone(),
            role: Some(identity.role.to_string()),
            exp: (Utc::now() + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }
}

#[async_trait]
impl CredentialVerifier for JwtCredentialVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, ServiceError> {
        let claims = decode::<Claims>(
            credential,
            &self.decoding_key,
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ServiceError::Unauthorized("Credential has expired".into())
            }
            _ => ServiceError::Unauthorized("Invalid credential".into()),
        })?
        .claims;

        if claims.sub.trim().is_empty() {
            return Err(ServiceError::Unauthorized("Credential has no subject".into()));
        }

        Ok(Identity {
            user_id: claims.sub,
            email: claims.email.filter(|email| !email.trim().is_empty()),
            role: claims
                .role
                .as_deref()
                .and_then(|role| role.parse().ok())
                .unwrap_or(Role::Customer),
        })
    }
}

/// Reads the bearer credential from the `Authorization` header
pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authenticated caller extracted from the bearer credential
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<dyn CredentialVerifier>: FromRef<S>,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = <Arc<dyn CredentialVerifier> as FromRef<S>>::from_ref(state);
        let token = bearer_token(parts)
            .ok_or_else(|| ServiceError::Unauthorized("Missing bearer credential".into()))?;
        Ok(AuthUser(verifier.verify(token).await?))
    }
}

pub fn require_admin(identity: &Identity) -> Result<(), ServiceError> {
    if identity.is_admin() {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Administrator role required".into()))
    }
}

/// Owners and administrators may act on an order
pub fn require_owner_or_admin(identity: &Identity, owner_id: &str) -> Result<(), ServiceError> {
    if identity.is_admin() || identity.user_id == owner_id {
        Ok(())
    } else {
        Err(ServiceError::Forbidden("Not allowed to access this order".into()))
    }
}
