//! Server configuration.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::auth::TokenGrant;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Persistence storage path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Quiet period after the last wire edit before a snapshot is written
    pub persist_debounce: Duration,
    /// Frames buffered per session before it is evicted as lagging
    pub outbound_capacity: usize,
    /// Static token table: token → grant
    pub auth_tokens: HashMap<String, TokenGrant>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            persist_debounce: Duration::from_millis(500),
            outbound_capacity: 256,
            auth_tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
    #[error("invalid token entry '{0}' (expected token=user@scope1|scope2)")]
    InvalidToken(String),
}

impl ServerConfig {
    /// Load configuration from `SCRIBE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = ServerConfig::default();

        if let Some(addr) = lookup("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        }

        config.storage_path = lookup("SCRIBE_STORAGE_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if let Some(value) = lookup("SCRIBE_PERSIST_DEBOUNCE_MS") {
            let ms: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: "SCRIBE_PERSIST_DEBOUNCE_MS",
                value: value.clone(),
            })?;
            config.persist_debounce = Duration::from_millis(ms);
        }

        if let Some(value) = lookup("SCRIBE_OUTBOUND_CAPACITY") {
            config.outbound_capacity = value
                .trim()
                .parse()
                .ok()
                .filter(|n: &usize| *n > 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: "SCRIBE_OUTBOUND_CAPACITY",
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup("SCRIBE_TOKENS") {
            config.auth_tokens = parse_tokens(&value)?;
        }

        Ok(config)
    }
}

/// Parse `token=user@scope1|scope2,token2=user2@scope3`.
pub fn parse_tokens(value: &str) -> Result<HashMap<String, TokenGrant>, ConfigError> {
    let mut tokens = HashMap::new();
    for entry in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let invalid = || ConfigError::InvalidToken(entry.to_string());
        let (token, grant) = entry.split_once('=').ok_or_else(invalid)?;
        let (user_id, scopes) = grant.split_once('@').ok_or_else(invalid)?;
        if token.is_empty() || user_id.is_empty() {
            return Err(invalid());
        }
        let scopes = scopes
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        tokens.insert(token.to_string(), TokenGrant::new(user_id, scopes));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.persist_debounce, Duration::from_millis(500));
        assert_eq!(config.outbound_capacity, 256);
        assert!(config.storage_path.is_none());
        assert!(config.auth_tokens.is_empty());
    }

    #[test]
    fn test_from_lookup_empty_is_default() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars = [
            ("SCRIBE_BIND_ADDR", "0.0.0.0:8080"),
            ("SCRIBE_STORAGE_PATH", "/var/lib/scribe"),
            ("SCRIBE_PERSIST_DEBOUNCE_MS", "50"),
            ("SCRIBE_OUTBOUND_CAPACITY", "16"),
            ("SCRIBE_TOKENS", "abc=ann@team|ops, xyz=bob@team"),
        ];
        let config = ServerConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/scribe")));
        assert_eq!(config.persist_debounce, Duration::from_millis(50));
        assert_eq!(config.outbound_capacity, 16);
        assert_eq!(config.auth_tokens.len(), 2);
        assert_eq!(config.auth_tokens["abc"].scopes, vec!["team", "ops"]);
        assert_eq!(config.auth_tokens["xyz"].user_id, "bob");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let vars = [("SCRIBE_PERSIST_DEBOUNCE_MS", "soon")];
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::InvalidValue { .. })
        ));

        let vars = [("SCRIBE_OUTBOUND_CAPACITY", "0")];
        assert!(ServerConfig::from_lookup(lookup(&vars)).is_err());

        assert_eq!(
            parse_tokens("missing-user"),
            Err(ConfigError::InvalidToken("missing-user".into()))
        );
    }
}
