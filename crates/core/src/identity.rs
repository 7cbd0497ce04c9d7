//! Identity of the caller attached to authenticated requests.

use std::fmt;

/// How the caller proved its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Pre-shared service API key (`x-api-key`).
    ApiKey,
    /// Bearer JWT (`authorization: Bearer <token>`).
    Jwt,
}

impl AuthMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Jwt => "jwt",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated caller, injected into request extensions by the auth layer.
///
/// Single source of truth for identity across middleware and services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub username: Option<String>,
    pub roles: Vec<String>,
    pub method: AuthMethod,
}

impl CallerIdentity {
    /// Identity of a service authenticated by API key.
    ///
    /// The service name doubles as user id and username.
    #[must_use]
    pub fn service(name: &str) -> Self {
        Self {
            user_id: name.to_string(),
            username: Some(name.to_string()),
            roles: Vec::new(),
            method: AuthMethod::ApiKey,
        }
    }

    #[inline]
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    #[inline]
    #[must_use]
    pub const fn is_service(&self) -> bool {
        matches!(self.method, AuthMethod::ApiKey)
    }
}
