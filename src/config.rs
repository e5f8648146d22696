//! Client configuration.
//!
//! This module holds the already-resolved values a [`crate::client::SnowClient`]
//! needs at construction: instance URL, credential material, request timeout,
//! and the directory used for persisted OAuth tokens. A `from_env()`
//! convenience reads the `SERVICENOW_*` environment variables; flag parsing
//! is the responsibility of the CLI layer and lives elsewhere.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SnowError;

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Credential material for one of the four supported auth flows.
///
/// Secrets held here must never be logged or included in error messages.
#[derive(Clone)]
pub enum AuthConfig {
    /// HTTP basic auth with a static username and password.
    Basic {
        /// Account username.
        username: String,
        /// Account password. Never log this value!
        password: String,
    },

    /// Static API key sent on every request.
    ApiKey {
        /// The opaque key. Never log this value!
        key: String,
    },

    /// OAuth 2.0 client-credentials flow.
    OAuthClientCredentials {
        /// OAuth client ID registered on the instance.
        client_id: String,
        /// OAuth client secret. Never log this value!
        client_secret: String,
    },

    /// OAuth 2.0 authorization-code flow.
    ///
    /// The interactive code exchange happens outside this crate; the core
    /// only needs a refresh token (either supplied here or previously
    /// persisted in the token store) to mint access tokens.
    OAuthAuthorizationCode {
        /// OAuth client ID registered on the instance.
        client_id: String,
        /// OAuth client secret. Never log this value!
        client_secret: String,
        /// Refresh token from a completed authorization flow, if the
        /// token store does not already hold one.
        refresh_token: Option<String>,
    },
}

/// Configuration for connecting to a ServiceNow instance.
#[derive(Clone)]
pub struct Config {
    /// Base URL of the instance (e.g., `https://dev12345.service-now.com`).
    pub instance_url: String,

    /// Credential material for the selected auth flow.
    pub auth: AuthConfig,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Directory for persisted OAuth tokens. Defaults to
    /// `$HOME/.config/snowcore/tokens` when unset.
    pub token_dir: Option<PathBuf>,
}

impl Config {
    /// Creates a configuration with default timeout and token directory.
    pub fn new(instance_url: impl Into<String>, auth: AuthConfig) -> Result<Self, SnowError> {
        let instance_url = Self::validate_instance_url(instance_url.into())?;
        Ok(Config {
            instance_url,
            auth,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            token_dir: None,
        })
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the token persistence directory.
    pub fn with_token_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.token_dir = Some(dir.into());
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// # Required Environment Variables
    ///
    /// - `SERVICENOW_INSTANCE`: Base URL of the instance
    ///
    /// The auth flow is selected from whichever credential variables are
    /// set, checked in this order:
    ///
    /// 1. `SERVICENOW_API_KEY` - API key auth
    /// 2. `SERVICENOW_CLIENT_ID` + `SERVICENOW_CLIENT_SECRET` - OAuth
    ///    (authorization-code when `SERVICENOW_REFRESH_TOKEN` is also set,
    ///    client-credentials otherwise)
    /// 3. `SERVICENOW_USERNAME` + `SERVICENOW_PASSWORD` - basic auth
    ///
    /// # Errors
    ///
    /// Returns `SnowError::Config` if the instance URL is missing or no
    /// complete credential set is present.
    pub fn from_env() -> Result<Self, SnowError> {
        let instance_url = Self::get_required_env("SERVICENOW_INSTANCE")?;

        let auth = if let Some(key) = Self::get_env("SERVICENOW_API_KEY") {
            Self::validate_secret(&key, "SERVICENOW_API_KEY")?;
            AuthConfig::ApiKey { key }
        } else if let Some(client_id) = Self::get_env("SERVICENOW_CLIENT_ID") {
            let client_secret = Self::get_required_env("SERVICENOW_CLIENT_SECRET")?;
            Self::validate_secret(&client_secret, "SERVICENOW_CLIENT_SECRET")?;
            match Self::get_env("SERVICENOW_REFRESH_TOKEN") {
                Some(refresh_token) => AuthConfig::OAuthAuthorizationCode {
                    client_id,
                    client_secret,
                    refresh_token: Some(refresh_token),
                },
                None => AuthConfig::OAuthClientCredentials {
                    client_id,
                    client_secret,
                },
            }
        } else if let Some(username) = Self::get_env("SERVICENOW_USERNAME") {
            let password = Self::get_required_env("SERVICENOW_PASSWORD")?;
            AuthConfig::Basic { username, password }
        } else {
            return Err(SnowError::config(
                "no credentials found - set SERVICENOW_API_KEY, SERVICENOW_CLIENT_ID, \
                 or SERVICENOW_USERNAME",
            ));
        };

        Config::new(instance_url, auth)
    }

    /// Returns the directory used for persisted OAuth tokens.
    pub fn resolved_token_dir(&self) -> PathBuf {
        match &self.token_dir {
            Some(dir) => dir.clone(),
            None => match env::var("HOME") {
                Ok(home) => PathBuf::from(home).join(".config/snowcore/tokens"),
                Err(_) => PathBuf::from(".snowcore/tokens"),
            },
        }
    }

    /// Gets an optional environment variable, treating empty as unset.
    fn get_env(name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Gets a required environment variable, returning an error if missing or empty.
    fn get_required_env(name: &str) -> Result<String, SnowError> {
        Self::get_env(name).ok_or_else(|| {
            SnowError::config(format!("missing required environment variable: {}", name))
        })
    }

    /// Validates and normalizes the instance base URL.
    fn validate_instance_url(url: String) -> Result<String, SnowError> {
        let url = url.trim().trim_end_matches('/').to_string();

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SnowError::config(
                "instance URL must start with http:// or https://",
            ));
        }

        // Catch URLs that parse but have no usable host
        let parsed = url::Url::parse(&url)
            .map_err(|e| SnowError::config(format!("invalid instance URL: {}", e)))?;
        if parsed.host_str().is_none() {
            return Err(SnowError::config("instance URL has no host"));
        }

        Ok(url)
    }

    /// Validates a secret is not a placeholder value.
    fn validate_secret(value: &str, name: &str) -> Result<(), SnowError> {
        let lower = value.to_lowercase();
        let placeholder_patterns = ["your_api_key", "your_secret", "placeholder", "changeme"];

        for pattern in placeholder_patterns {
            if lower.contains(pattern) {
                return Err(SnowError::config(format!(
                    "{} appears to be a placeholder value",
                    name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: tests that modify environment variables should not run in
    // parallel. from_env coverage here sticks to validation helpers.

    #[test]
    fn test_validate_instance_url_removes_trailing_slash() {
        let result = Config::validate_instance_url("https://dev1.service-now.com/".into()).unwrap();
        assert_eq!(result, "https://dev1.service-now.com");
    }

    #[test]
    fn test_validate_instance_url_requires_scheme() {
        assert!(Config::validate_instance_url("dev1.service-now.com".into()).is_err());
    }

    #[test]
    fn test_validate_secret_rejects_placeholder() {
        assert!(Config::validate_secret("your_api_key_here", "SERVICENOW_API_KEY").is_err());
    }

    #[test]
    fn test_validate_secret_accepts_real_value() {
        assert!(Config::validate_secret("abc123def456", "SERVICENOW_API_KEY").is_ok());
    }

    #[test]
    fn test_new_normalizes_url() {
        let config = Config::new(
            "https://dev1.service-now.com/",
            AuthConfig::ApiKey { key: "k".into() },
        )
        .unwrap();
        assert_eq!(config.instance_url, "https://dev1.service-now.com");
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
    }

    #[test]
    fn test_with_token_dir_overrides_default() {
        let config = Config::new(
            "https://dev1.service-now.com",
            AuthConfig::ApiKey { key: "k".into() },
        )
        .unwrap()
        .with_token_dir("/tmp/tokens");
        assert_eq!(config.resolved_token_dir(), PathBuf::from("/tmp/tokens"));
    }
}
