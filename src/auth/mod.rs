//! Authentication providers.
//!
//! Every outbound request is stamped by exactly one [`AuthProvider`]. The
//! four flows share a three-operation contract - apply, is_expired,
//! refresh - dispatched statically over an enum. Basic and API-key
//! credentials are static and never expire; the OAuth variants manage a
//! token lifecycle (see [`oauth`]) and persist refreshed tokens through a
//! [`store::TokenStore`].

pub mod oauth;
pub mod store;

use std::sync::Arc;

use crate::config::{AuthConfig, Config};
use crate::error::SnowError;

use oauth::{OAuthFlow, OAuthProvider};
use store::TokenStore;

/// Header ServiceNow expects for API-key auth.
const API_KEY_HEADER: &str = "x-sn-apikey";

/// Produces request credentials for one of the four supported flows.
pub enum AuthProvider {
    /// Static username/password pair.
    Basic {
        /// Account username.
        username: String,
        /// Account password. Never log this value!
        password: String,
    },
    /// Static opaque key, revocable server-side only.
    ApiKey {
        /// The key. Never log this value!
        key: String,
    },
    /// OAuth with a managed token lifecycle (either grant flow).
    OAuth(OAuthProvider),
}

impl AuthProvider {
    /// Builds the provider selected by the configuration.
    ///
    /// The HTTP client is injected so the token endpoint transport is
    /// explicit rather than hidden global state; OAuth variants seed their
    /// token from the store during construction.
    pub async fn from_config(
        config: &Config,
        http: reqwest::Client,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        match &config.auth {
            AuthConfig::Basic { username, password } => AuthProvider::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            AuthConfig::ApiKey { key } => AuthProvider::ApiKey { key: key.clone() },
            AuthConfig::OAuthClientCredentials {
                client_id,
                client_secret,
            } => AuthProvider::OAuth(
                OAuthProvider::new(
                    OAuthFlow::ClientCredentials,
                    &config.instance_url,
                    client_id,
                    client_secret,
                    None,
                    http,
                    store,
                )
                .await,
            ),
            AuthConfig::OAuthAuthorizationCode {
                client_id,
                client_secret,
                refresh_token,
            } => AuthProvider::OAuth(
                OAuthProvider::new(
                    OAuthFlow::AuthorizationCode,
                    &config.instance_url,
                    client_id,
                    client_secret,
                    refresh_token.clone(),
                    http,
                    store,
                )
                .await,
            ),
        }
    }

    /// Stamps the outgoing request with current credentials.
    ///
    /// OAuth variants check expiry first and refresh synchronously when
    /// needed; a failed refresh aborts with no partial application.
    pub async fn apply(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SnowError> {
        match self {
            AuthProvider::Basic { username, password } => {
                Ok(req.basic_auth(username, Some(password)))
            }
            AuthProvider::ApiKey { key } => Ok(req.header(API_KEY_HEADER, key)),
            AuthProvider::OAuth(provider) => provider.apply(req).await,
        }
    }

    /// Returns true if the held credentials need a refresh before use.
    ///
    /// Static credentials never expire.
    pub async fn is_expired(&self) -> bool {
        match self {
            AuthProvider::Basic { .. } | AuthProvider::ApiKey { .. } => false,
            AuthProvider::OAuth(provider) => provider.is_expired().await,
        }
    }

    /// Refreshes the held credentials. A no-op for static flows.
    pub async fn refresh(&self) -> Result<(), SnowError> {
        match self {
            AuthProvider::Basic { .. } | AuthProvider::ApiKey { .. } => Ok(()),
            AuthProvider::OAuth(provider) => provider.refresh().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use crate::config::AuthConfig;

    fn config_with(auth: AuthConfig) -> Config {
        Config::new("https://dev1.service-now.com", auth).unwrap()
    }

    #[tokio::test]
    async fn test_basic_never_expires_and_refresh_is_noop() {
        let config = config_with(AuthConfig::Basic {
            username: "admin".into(),
            password: "pw".into(),
        });
        let provider = AuthProvider::from_config(
            &config,
            reqwest::Client::new(),
            Arc::new(MemoryTokenStore::new()),
        )
        .await;

        assert!(matches!(provider, AuthProvider::Basic { .. }));
        assert!(!provider.is_expired().await);
        provider.refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_api_key_never_expires_and_refresh_is_noop() {
        let config = config_with(AuthConfig::ApiKey { key: "k123".into() });
        let provider = AuthProvider::from_config(
            &config,
            reqwest::Client::new(),
            Arc::new(MemoryTokenStore::new()),
        )
        .await;

        assert!(matches!(provider, AuthProvider::ApiKey { .. }));
        assert!(!provider.is_expired().await);
        provider.refresh().await.unwrap();
    }

    #[tokio::test]
    async fn test_basic_apply_sets_authorization_header() {
        let config = config_with(AuthConfig::Basic {
            username: "admin".into(),
            password: "pw".into(),
        });
        let provider = AuthProvider::from_config(
            &config,
            reqwest::Client::new(),
            Arc::new(MemoryTokenStore::new()),
        )
        .await;

        let req = provider
            .apply(reqwest::Client::new().get("https://dev1.service-now.com"))
            .await
            .unwrap()
            .build()
            .unwrap();
        let header = req.headers().get("authorization").unwrap();
        assert!(header.to_str().unwrap().starts_with("Basic "));
    }

    #[tokio::test]
    async fn test_api_key_apply_sets_key_header() {
        let config = config_with(AuthConfig::ApiKey { key: "k123".into() });
        let provider = AuthProvider::from_config(
            &config,
            reqwest::Client::new(),
            Arc::new(MemoryTokenStore::new()),
        )
        .await;

        let req = provider
            .apply(reqwest::Client::new().get("https://dev1.service-now.com"))
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.headers().get(API_KEY_HEADER).unwrap(), "k123");
    }

    #[tokio::test]
    async fn test_oauth_variant_selected_from_config() {
        let config = config_with(AuthConfig::OAuthClientCredentials {
            client_id: "cid".into(),
            client_secret: "cs".into(),
        });
        let provider = AuthProvider::from_config(
            &config,
            reqwest::Client::new(),
            Arc::new(MemoryTokenStore::new()),
        )
        .await;

        assert!(matches!(provider, AuthProvider::OAuth(_)));
        assert!(provider.is_expired().await);
    }
}
