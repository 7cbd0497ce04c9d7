//! JWT token issuing, validation, and claims.
//!
//! Centralizes all JWT handling with a shared validator for encoding and decoding.
//! Keys and validation rules are built once and cached for the application lifetime.
//!
//! This module is storage-agnostic: implement `TokenSubject` for your user type.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::identity::{AuthMethod, CallerIdentity};

/// Trait for types that can be used as JWT subjects.
pub trait TokenSubject {
    /// Caller's unique identifier, written to the `user_id` claim.
    fn user_id(&self) -> &str;
    /// Optional display name.
    fn username(&self) -> Option<&str>;
    /// Role names, in order.
    fn roles(&self) -> &[String];
}

impl TokenSubject for CallerIdentity {
    fn user_id(&self) -> &str {
        &self.user_id
    }
    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
    fn roles(&self) -> &[String] {
        &self.roles
    }
}

/// JWT claims. Custom claim keys are case-sensitive on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Caller identifier (required)
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Non-string entries are dropped on decode.
    #[serde(
        default,
        deserialize_with = "string_entries",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub roles: Vec<String>,

    /// Issuer
    pub iss: String,
    /// Audience, a single string or an array on the wire
    pub aud: Audience,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at time (Unix timestamp)
    #[serde(default)]
    pub iat: Option<i64>,
    /// Not before time (Unix timestamp)
    #[serde(default)]
    pub nbf: Option<i64>,
    /// JWT ID (unique token identifier)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// `aud` claim as registered in RFC 7519.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(aud) => aud == audience,
            Self::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

fn string_entries<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let roles = match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Array(values)) => values
            .into_iter()
            .filter_map(|value| match value {
                serde_json::Value::String(role) => Some(role),
                _ => None,
            })
            .collect(),
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(other) => {
            debug!(roles = %other, "Ignoring non-array roles claim");
            Vec::new()
        }
    };
    Ok(roles)
}

/// JWT errors.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("invalid claim: {0}")]
    InvalidClaim(&'static str),
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

impl TryFrom<Claims> for CallerIdentity {
    type Error = JwtError;

    fn try_from(claims: Claims) -> Result<Self, Self::Error> {
        if claims.user_id.is_empty() {
            return Err(JwtError::InvalidClaim("user_id"));
        }
        Ok(Self {
            user_id: claims.user_id,
            username: claims.username.filter(|name| !name.is_empty()),
            roles: claims.roles,
            method: AuthMethod::Jwt,
        })
    }
}

/// Pre-compiled JWT validator with cached encoding/decoding keys.
///
/// Thread-safe and cloneable via `Arc`. Creating keys is expensive,
/// so this caches them for the lifetime of the application.
#[derive(Clone)]
pub struct JwtValidator {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    issuer: Arc<str>,
    audience: Arc<str>,
}

impl JwtValidator {
    /// Create a validator bound to one secret, issuer and audience.
    #[must_use]
    pub fn new(secret: &SecretString, issuer: &str, audience: &str) -> Self {
        let secret_bytes = secret.expose_secret().as_bytes();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret_bytes)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret_bytes)),
            validation,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Sign an access token for any type implementing `TokenSubject`.
    pub fn issue<T: TokenSubject>(&self, subject: &T, ttl: Duration) -> Result<String, JwtError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| JwtError::Encoding(e.to_string()))?;

        let claims = Claims {
            user_id: subject.user_id().to_string(),
            username: subject.username().map(str::to_string),
            roles: subject.roles().to_vec(),
            iss: self.issuer.to_string(),
            aud: Audience::One(self.audience.to_string()),
            exp: (now + ttl).timestamp(),
            iat: Some(now.timestamp()),
            nbf: Some(now.timestamp()),
            jti: Some(Uuid::new_v4().to_string()),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Verify signature, issuer, audience and time claims, returning typed claims.
    pub fn validate(&self, token: &str) -> Result<Claims, JwtError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "JWT validation failed");
                JwtError::InvalidToken
            })
    }

    /// Validate a token and convert its claims into a caller identity.
    pub fn authenticate(&self, token: &str) -> Result<CallerIdentity, JwtError> {
        self.validate(token)?.try_into()
    }
}
