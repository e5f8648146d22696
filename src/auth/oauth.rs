//! OAuth token lifecycle.
//!
//! Covers both OAuth flows ServiceNow supports for API access:
//! client-credentials and authorization-code. Either way the token endpoint
//! is a form-encoded POST to `{instance}/oauth_token.do`; the flows differ
//! only in the grant parameters.
//!
//! The provider holds at most one live token, guarded by a mutex held for
//! the full check-refresh-apply sequence. The coarse lock is deliberate:
//! when several callers hit an expired token at once, exactly one performs
//! the network refresh and the rest reuse the result.
//!
//! # Security
//!
//! The client secret and token material are never logged. Error messages
//! built from token endpoint responses are sanitized first.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::store::TokenStore;
use crate::error::SnowError;

/// Safety buffer subtracted from the expiry time, so a token is refreshed
/// shortly before the server would actually reject it.
const EXPIRY_BUFFER_SECS: u64 = 10;

/// An OAuth access token plus its lifecycle metadata.
///
/// `expires_at` is an absolute unix timestamp in seconds, computed at
/// issue time from the server's `expires_in` delta. It is persisted along
/// with the wire fields so a reloaded token knows its own expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Bearer token for API calls.
    pub access_token: String,
    /// Token type reported by the server, normally `Bearer`.
    pub token_type: String,
    /// Seconds until expiry at issue time (delta, not absolute).
    pub expires_in: u64,
    /// Long-lived credential for minting new access tokens. Carried
    /// forward across refreshes when the server omits a new one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Absolute expiry as a unix timestamp in seconds.
    pub expires_at: u64,
}

impl OAuthToken {
    /// Returns true if the token is unusable: empty, or past its expiry
    /// minus the safety buffer.
    pub fn is_expired(&self) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        now_unix_secs() + EXPIRY_BUFFER_SECS >= self.expires_at
    }
}

/// Wire shape of a token endpoint response.
///
/// `{access_token, token_type, expires_in, refresh_token?, scope?}` per
/// the platform contract. `expires_in` is a delta in seconds.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Which OAuth grant the provider uses to obtain tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthFlow {
    /// `grant_type=client_credentials` - no user involved.
    ClientCredentials,
    /// `grant_type=refresh_token` - refresh token from a completed
    /// interactive authorization.
    AuthorizationCode,
}

impl OAuthFlow {
    fn key_component(self) -> &'static str {
        match self {
            OAuthFlow::ClientCredentials => "client_credentials",
            OAuthFlow::AuthorizationCode => "authorization_code",
        }
    }
}

/// Derives the token-store key for a provider identity.
///
/// The key folds in the flow kind, instance URL, and client ID so two
/// providers never clobber each other's records.
pub(crate) fn storage_key(flow: OAuthFlow, instance_url: &str, client_id: &str) -> String {
    format!(
        "{}_{}_{}",
        flow.key_component(),
        sanitize_component(instance_url),
        sanitize_component(client_id)
    )
}

fn sanitize_component(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// OAuth auth provider for one (instance, client) identity.
///
/// Owns the live token exclusively; the persisted copy is owned by the
/// token store under [`storage_key`].
pub struct OAuthProvider {
    flow: OAuthFlow,
    instance_url: String,
    client_id: String,
    /// SECURITY: never log this value!
    client_secret: String,
    /// Injected transport, so tests can point it at a double.
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    key: String,
    token: Mutex<Option<OAuthToken>>,
}

impl OAuthProvider {
    /// Creates a provider, seeding the in-memory token from the store.
    ///
    /// For client-credentials a persisted token is only useful while it is
    /// still valid, so an expired record is ignored. For authorization-code
    /// an expired record still carries the refresh token and is kept; a
    /// `refresh_token` supplied by the caller fills in when the store has
    /// none.
    pub async fn new(
        flow: OAuthFlow,
        instance_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: Option<String>,
        http: reqwest::Client,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        let instance_url = instance_url.into();
        let client_id = client_id.into();
        let key = storage_key(flow, &instance_url, &client_id);

        let seeded = match store.load(&key).await {
            Ok(Some(stored)) => match flow {
                OAuthFlow::ClientCredentials if stored.is_expired() => None,
                OAuthFlow::ClientCredentials => Some(stored),
                OAuthFlow::AuthorizationCode => {
                    let mut stored = stored;
                    if stored.refresh_token.is_none() {
                        stored.refresh_token = refresh_token.clone();
                    }
                    Some(stored)
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "failed to load persisted token, starting cold");
                None
            }
        };

        // Authorization-code with no persisted record: hold an empty token
        // carrying just the refresh token, so the first apply refreshes.
        let seeded = seeded.or_else(|| {
            refresh_token.map(|rt| OAuthToken {
                access_token: String::new(),
                token_type: "Bearer".into(),
                expires_in: 0,
                refresh_token: Some(rt),
                scope: None,
                expires_at: 0,
            })
        });

        if seeded.is_some() {
            debug!(key, "seeded token from store");
        }

        Self {
            flow,
            instance_url,
            client_id,
            client_secret: client_secret.into(),
            http,
            store,
            key,
            token: Mutex::new(seeded),
        }
    }

    /// Returns true if no usable token is held.
    pub async fn is_expired(&self) -> bool {
        let held = self.token.lock().await;
        match held.as_ref() {
            Some(token) => token.is_expired(),
            None => true,
        }
    }

    /// Stamps the request with a bearer token, refreshing first if the
    /// held token is expired.
    ///
    /// The lock spans the whole expiry-check + refresh + header-mutation
    /// sequence, so concurrent callers serialize on a single refresh.
    pub async fn apply(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, SnowError> {
        let mut held = self.token.lock().await;

        let needs_refresh = match held.as_ref() {
            Some(token) => token.is_expired(),
            None => true,
        };
        if needs_refresh {
            self.refresh_locked(&mut held).await?;
        }

        // refresh_locked only returns Ok after installing a token
        let token = held
            .as_ref()
            .ok_or_else(|| SnowError::AuthRefresh {
                message: "refresh succeeded but no token held".into(),
            })?;

        Ok(req.bearer_auth(&token.access_token))
    }

    /// Unconditionally refreshes the held token.
    pub async fn refresh(&self) -> Result<(), SnowError> {
        let mut held = self.token.lock().await;
        self.refresh_locked(&mut held).await
    }

    /// Performs the token endpoint POST and swaps the held token.
    ///
    /// On any failure the held token is left exactly as it was. On success
    /// the new token is persisted best-effort: a store failure is logged,
    /// never propagated, because persistence is only a startup
    /// optimization.
    async fn refresh_locked(&self, held: &mut Option<OAuthToken>) -> Result<(), SnowError> {
        let mut params: Vec<(&str, &str)> = Vec::with_capacity(4);
        match self.flow {
            OAuthFlow::ClientCredentials => {
                params.push(("grant_type", "client_credentials"));
            }
            OAuthFlow::AuthorizationCode => {
                params.push(("grant_type", "refresh_token"));
            }
        }
        let prior_refresh = held.as_ref().and_then(|t| t.refresh_token.clone());
        if self.flow == OAuthFlow::AuthorizationCode {
            match prior_refresh.as_deref() {
                Some(rt) => params.push(("refresh_token", rt)),
                None => return Err(SnowError::MissingRefreshToken),
            }
        }
        params.push(("client_id", &self.client_id));
        params.push(("client_secret", &self.client_secret));

        let url = format!("{}/oauth_token.do", self.instance_url);
        debug!(flow = ?self.flow, "refreshing OAuth token");

        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| SnowError::AuthRefresh {
                message: SnowError::sanitize_message(
                    &format!("token endpoint request failed: {}", e),
                    &self.client_secret,
                ),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(SnowError::AuthRefresh {
                message: SnowError::sanitize_message(
                    &format!("token endpoint returned {}: {}", status, body),
                    &self.client_secret,
                ),
            });
        }

        let decoded: TokenResponse =
            response.json().await.map_err(|e| SnowError::AuthRefresh {
                message: format!("invalid token response: {}", e),
            })?;

        let token = OAuthToken {
            access_token: decoded.access_token,
            token_type: decoded.token_type.unwrap_or_else(|| "Bearer".into()),
            expires_in: decoded.expires_in,
            // Refresh tokens are carried forward until replaced
            refresh_token: decoded.refresh_token.or(prior_refresh),
            scope: decoded.scope,
            // Saturate: a bogus huge expires_in means "never", not a panic
            expires_at: now_unix_secs().saturating_add(decoded.expires_in),
        };

        if let Err(e) = self.store.save(&self.key, &token).await {
            warn!(key = %self.key, error = %e, "failed to persist refreshed token");
        }

        *held = Some(token);
        debug!(flow = ?self.flow, "token refreshed");
        Ok(())
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
