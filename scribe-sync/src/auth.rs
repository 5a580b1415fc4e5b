//! Connection authentication.
//!
//! Credentials travel with the WebSocket upgrade request: `token` and
//! `scope` (plus an optional `parent`) in the query string, or the token in
//! an `Authorization: Bearer` header. The server verifies them inside the
//! upgrade callback, before any sync traffic.

use std::collections::HashMap;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::protocol::close_code;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A required field was not supplied
    #[error("missing {0}")]
    MissingCredentials(&'static str),
    #[error("invalid token")]
    InvalidToken,
    /// Valid identity that is not a member of the requested scope
    #[error("user {user_id} may not access scope {scope_id}")]
    Forbidden { user_id: String, scope_id: String },
}

impl AuthError {
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::MissingCredentials(_) => close_code::MISSING_CREDENTIALS,
            AuthError::InvalidToken | AuthError::Forbidden { .. } => close_code::UNAUTHORIZED,
        }
    }
}

/// Raw credentials pulled from an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub scope_id: Option<String>,
    /// Parent folder the client is browsing from; informational only
    pub parent_id: Option<String>,
}

impl Credentials {
    /// Extract credentials from the request query and headers.
    pub fn from_request(request: &Request) -> Self {
        let mut credentials = Self::from_query(request.uri().query().unwrap_or(""));
        if credentials.token.is_none() {
            credentials.token = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty());
        }
        credentials
    }

    /// Extract credentials from a raw query string.
    pub fn from_query(query: &str) -> Self {
        let mut credentials = Credentials::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "token" => credentials.token = Some(value.into_owned()),
                "scope" => credentials.scope_id = Some(value.into_owned()),
                "parent" => credentials.parent_id = Some(value.into_owned()),
                _ => {}
            }
        }
        credentials
    }
}

/// An authenticated caller bound to one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub scope_id: String,
}

/// Verifies upgrade credentials.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, credentials: &Credentials) -> Result<Identity, AuthError>;
}

/// What a static token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub user_id: String,
    pub scopes: Vec<String>,
}

impl TokenGrant {
    pub fn new(user_id: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            scopes,
        }
    }
}

/// Token table authenticator backed by `ServerConfig::auth_tokens`.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, TokenGrant>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, TokenGrant>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, grant: TokenGrant) -> Self {
        self.tokens.insert(token.into(), grant);
        self
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> Result<Identity, AuthError> {
        let token = credentials
            .token
            .as_deref()
            .ok_or(AuthError::MissingCredentials("token"))?;
        let scope_id = credentials
            .scope_id
            .as_deref()
            .ok_or(AuthError::MissingCredentials("scope"))?;

        let grant = self.tokens.get(token).ok_or(AuthError::InvalidToken)?;
        if !grant.scopes.iter().any(|s| s == scope_id) {
            return Err(AuthError::Forbidden {
                user_id: grant.user_id.clone(),
                scope_id: scope_id.to_string(),
            });
        }

        Ok(Identity {
            user_id: grant.user_id.clone(),
            scope_id: scope_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> StaticTokenAuthenticator {
        StaticTokenAuthenticator::default()
            .with_token("secret", TokenGrant::new("ann", vec!["team".into()]))
    }

    fn request(uri: &str, bearer: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_credentials_from_query() {
        let creds = Credentials::from_query("token=abc&scope=team&parent=f%201");
        assert_eq!(creds.token.as_deref(), Some("abc"));
        assert_eq!(creds.scope_id.as_deref(), Some("team"));
        assert_eq!(creds.parent_id.as_deref(), Some("f 1"));
    }

    #[test]
    fn test_credentials_from_bearer_header() {
        let creds = Credentials::from_request(&request("/documents/d1?scope=team", Some("abc")));
        assert_eq!(creds.token.as_deref(), Some("abc"));
        assert_eq!(creds.scope_id.as_deref(), Some("team"));

        // Query token wins over header
        let creds =
            Credentials::from_request(&request("/documents/d1?token=q&scope=team", Some("h")));
        assert_eq!(creds.token.as_deref(), Some("q"));
    }

    #[test]
    fn test_authenticate_ok() {
        let identity = authenticator()
            .authenticate(&Credentials::from_query("token=secret&scope=team"))
            .unwrap();
        assert_eq!(identity.user_id, "ann");
        assert_eq!(identity.scope_id, "team");
    }

    #[test]
    fn test_authenticate_failures() {
        let auth = authenticator();

        let err = auth.authenticate(&Credentials::from_query("scope=team")).unwrap_err();
        assert_eq!(err, AuthError::MissingCredentials("token"));
        assert_eq!(err.close_code(), 4001);

        let err = auth.authenticate(&Credentials::from_query("token=secret")).unwrap_err();
        assert_eq!(err, AuthError::MissingCredentials("scope"));

        let err = auth
            .authenticate(&Credentials::from_query("token=wrong&scope=team"))
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidToken);
        assert_eq!(err.close_code(), 4003);

        let err = auth
            .authenticate(&Credentials::from_query("token=secret&scope=other"))
            .unwrap_err();
        assert!(matches!(err, AuthError::Forbidden { .. }));
        assert_eq!(err.close_code(), 4003);
    }
}
