//! HTTP client for the ServiceNow REST API.
//!
//! `SnowClient` is the request execution core: every outbound call is
//! classified into an endpoint class, gated through that class's rate
//! limit bucket, stamped with current credentials (refreshing expired
//! tokens first), executed, and classified on failure for the retry
//! executor. Rate limiting and auth application happen fresh on every
//! retry attempt - a retried request re-earns its rate-limit slot and
//! re-validates its token.
//!
//! Per-resource wrappers (table, aggregate, batch, identity, cmdb,
//! catalog) are thin callers of [`SnowClient::execute`] and live in their
//! own crates.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::auth::store::{FileTokenStore, TokenStore};
use crate::auth::AuthProvider;
use crate::config::Config;
use crate::error::SnowError;
use crate::ratelimit::{classify_path, RateLimitConfig, RateLimiter};
use crate::retry::{run_with_retry, RetryPolicy};

/// Accept header for the JSON endpoints.
const ACCEPT_JSON: &str = "application/json";

/// Accept header for the XML rendition of root-instance endpoints.
const ACCEPT_XML: &str = "application/xml";

/// Maximum length for HTTP error response bodies, to avoid dragging
/// verbose server internals into error messages.
const MAX_ERROR_BODY_LEN: usize = 500;

/// Structured error envelope ServiceNow returns on failed requests.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// Request execution core for one ServiceNow instance.
///
/// Safe for concurrent use: clone it freely or share it behind an `Arc`;
/// the auth provider and rate limiter are shared across clones.
///
/// # Example
///
/// ```ignore
/// let config = Config::from_env()?;
/// let client = SnowClient::new(config).await?;
///
/// let incidents: serde_json::Value = client
///     .execute(Method::GET, "/api/now/table/incident", &[("sysparm_limit", "10")], None)
///     .await?;
/// ```
#[derive(Clone)]
pub struct SnowClient {
    /// The underlying HTTP client (cloning is cheap).
    http: reqwest::Client,

    /// Base URL of the instance, no trailing slash.
    instance_url: String,

    auth: Arc<AuthProvider>,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    timeout: Duration,
}

impl SnowClient {
    /// Creates a client from configuration, persisting OAuth tokens under
    /// the configured token directory.
    ///
    /// # Errors
    ///
    /// Returns `SnowError::HttpClient` if the HTTP client fails to
    /// initialize.
    pub async fn new(config: Config) -> Result<Self, SnowError> {
        let store = Arc::new(FileTokenStore::new(config.resolved_token_dir()));
        Self::with_token_store(config, store).await
    }

    /// Creates a client with a caller-supplied token store.
    pub async fn with_token_store(
        config: Config,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, SnowError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(SnowError::HttpClient)?;

        let auth = AuthProvider::from_config(&config, http.clone(), store).await;

        Ok(Self {
            http,
            instance_url: config.instance_url,
            auth: Arc::new(auth),
            rate_limiter: Arc::new(RateLimiter::default()),
            retry_policy: RetryPolicy::default(),
            timeout: config.timeout,
        })
    }

    /// Replaces the default retry policy for subsequent calls.
    ///
    /// Per-handle: clones of this client keep their own policy.
    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry_policy = policy;
    }

    /// Replaces all rate limit buckets.
    ///
    /// Unlike the retry policy and timeout, the limiter is shared: this
    /// takes effect for every clone of this client. In-flight waiters
    /// finish against the old buckets.
    ///
    /// # Errors
    ///
    /// Returns `SnowError::Config` for an invalid limit (zero, negative,
    /// or non-finite rate); the current buckets stay in place.
    pub fn set_rate_limits(&self, config: RateLimitConfig) -> Result<(), SnowError> {
        self.rate_limiter.update_config(config)
    }

    /// Replaces the per-request timeout, rebuilding the HTTP client.
    ///
    /// Per-handle: clones of this client keep their own timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), SnowError> {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SnowError::HttpClient)?;
        self.timeout = timeout;
        Ok(())
    }

    /// Handle to the rate limiter, for callers that want to pre-check
    /// `allow` or take reservations.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Executes a request and decodes the JSON response into `T`.
    ///
    /// Uses the client's retry policy and no cancellation. An empty
    /// response body (e.g., 204 on delete) decodes as JSON `null`.
    pub async fn execute<T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T, SnowError>
    where
        T: serde::de::DeserializeOwned,
    {
        self.execute_with(
            method,
            path,
            query,
            body,
            &self.retry_policy,
            &CancellationToken::new(),
        )
        .await
    }

    /// Executes a request with a caller-supplied retry policy and
    /// cancellation signal.
    pub async fn execute_with<T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<T, SnowError>
    where
        T: serde::de::DeserializeOwned,
    {
        let text = run_with_retry(policy, cancel, || {
            self.attempt(&method, path, query, body, ACCEPT_JSON, cancel)
        })
        .await?;

        if text.trim().is_empty() {
            return Ok(serde_json::from_str("null")?);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Executes a request and returns the raw response body.
    ///
    /// Used for the XML rendition of root-instance endpoints and any
    /// other non-JSON payloads.
    pub async fn execute_raw(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<String, SnowError> {
        let cancel = CancellationToken::new();
        run_with_retry(&self.retry_policy, &cancel, || {
            self.attempt(&method, path, query, body, ACCEPT_XML, &cancel)
        })
        .await
    }

    /// One attempt: classify, rate-limit, authenticate, send, classify
    /// the outcome. The retry executor calls this once per attempt.
    async fn attempt(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
        accept: &str,
        cancel: &CancellationToken,
    ) -> Result<String, SnowError> {
        let operation = format!("{} {}", method, path);

        let class = classify_path(path);
        self.rate_limiter.wait(class, cancel).await?;

        tracing::debug!(
            method = %method,
            path = %path,
            class = ?class,
            "making ServiceNow API request"
        );

        let url = format!("{}{}", self.instance_url, path);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("Accept", accept);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        // Refreshes an expired token before stamping; a failed refresh is
        // Authentication-kind and surfaces without retry
        let req = self.auth.apply(req).await?;

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                SnowError::timeout(self.timeout, operation.clone())
            } else {
                SnowError::Network {
                    operation: operation.clone(),
                    source: e,
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::handle_http_error(status, response).await);
        }

        let text = response.text().await.map_err(|e| SnowError::Network {
            operation,
            source: e,
        })?;
        tracing::trace!(body = %text, "ServiceNow API response");
        Ok(text)
    }

    /// Converts a non-2xx response to a classified error.
    ///
    /// Prefers the structured error envelope; falls back to (truncated)
    /// raw body text.
    async fn handle_http_error(status: StatusCode, response: reqwest::Response) -> SnowError {
        let body = response.text().await.unwrap_or_default();

        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
            if let Some(detail) = envelope.error {
                if let Some(message) = detail.message {
                    return SnowError::api(status, message, detail.detail);
                }
            }
        }

        let body = if body.len() > MAX_ERROR_BODY_LEN {
            // Localized messages are multibyte; cut on a char boundary
            let mut end = MAX_ERROR_BODY_LEN;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...[truncated]", &body[..end])
        } else {
            body
        };
        SnowError::api(status, body, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryTokenStore;
    use crate::config::AuthConfig;
    use crate::error::ErrorKind;
    use crate::ratelimit::{ClassLimit, EndpointClass};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn basic_client(server: &MockServer) -> SnowClient {
        let config = Config::new(
            server.uri(),
            AuthConfig::Basic {
                username: "admin".into(),
                password: "pw".into(),
            },
        )
        .unwrap();
        SnowClient::with_token_store(config, Arc::new(MemoryTokenStore::new()))
            .await
            .unwrap()
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[derive(Debug, Deserialize)]
    struct Envelope {
        result: Vec<serde_json::Value>,
    }

    #[tokio::test]
    async fn test_execute_decodes_result_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .and(query_param("sysparm_limit", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": [{"number": "INC0001", "short_description": "printer on fire"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = basic_client(&server).await;
        let envelope: Envelope = client
            .execute(
                Method::GET,
                "/api/now/table/incident",
                &[("sysparm_limit", "10")],
                None,
            )
            .await
            .unwrap();

        assert_eq!(envelope.result.len(), 1);
        assert_eq!(envelope.result[0]["number"], "INC0001");
    }

    #[tokio::test]
    async fn test_execute_applies_basic_auth() {
        let server = MockServer::start().await;
        // base64("admin:pw")
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .and(header("authorization", "Basic YWRtaW46cHc="))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = basic_client(&server).await;
        let _: Envelope = client
            .execute(Method::GET, "/api/now/table/incident", &[], None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_error_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut client = basic_client(&server).await;
        client.set_retry_policy(fast_policy(5));

        let envelope: Envelope = client
            .execute(Method::GET, "/api/now/table/incident", &[], None)
            .await
            .unwrap();
        assert!(envelope.result.is_empty());
    }

    #[tokio::test]
    async fn test_authentication_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = basic_client(&server).await;
        client.set_retry_policy(fast_policy(5));

        let err = client
            .execute::<Envelope>(Method::GET, "/api/now/table/incident", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_structured_error_envelope_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": {"message": "No Record found", "detail": "Record missing"},
                "status": "failure"
            })))
            .mount(&server)
            .await;

        let client = basic_client(&server).await;
        let err = client
            .execute::<serde_json::Value>(Method::GET, "/api/now/table/incident/missing", &[], None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("No Record found"));
        match err {
            SnowError::Api { detail, .. } => {
                assert_eq!(detail.as_deref(), Some("Record missing"));
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_long_multibyte_error_body_truncated_safely() {
        let server = MockServer::start().await;
        // 600 bytes of three-byte chars; truncation must not split one
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(ResponseTemplate::new(400).set_body_string("€".repeat(200)))
            .mount(&server)
            .await;

        let client = basic_client(&server).await;
        let err = client
            .execute::<Envelope>(Method::GET, "/api/now/table/incident", &[], None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Client);
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert!(err.to_string().contains("...[truncated]"));
    }

    #[tokio::test]
    async fn test_rate_limiter_shared_across_clones() {
        let server = MockServer::start().await;
        let client = basic_client(&server).await;
        let clone = client.clone();

        assert!(Arc::ptr_eq(client.rate_limiter(), clone.rate_limiter()));

        // Reconfiguring through one handle governs the other
        client
            .set_rate_limits(RateLimitConfig {
                table: ClassLimit {
                    rate: 0.001,
                    burst: 1,
                },
                ..RateLimitConfig::default()
            })
            .unwrap();
        assert!(clone.rate_limiter().allow(EndpointClass::Table));
        assert!(!clone.rate_limiter().allow(EndpointClass::Table));
    }

    #[tokio::test]
    async fn test_exhausted_retries_wrap_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(2)
            .mount(&server)
            .await;

        let mut client = basic_client(&server).await;
        client.set_retry_policy(fast_policy(2));

        let err = client
            .execute::<Envelope>(Method::GET, "/api/now/table/incident", &[], None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SnowError::RetriesExhausted { attempts: 2, .. }
        ));
        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_each_retry_consumes_a_rate_limit_permit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let mut client = basic_client(&server).await;
        client.set_retry_policy(fast_policy(3));
        // Three permits, refilling too slowly to matter in this test
        client
            .set_rate_limits(RateLimitConfig {
                table: ClassLimit {
                    rate: 0.001,
                    burst: 3,
                },
                ..RateLimitConfig::default()
            })
            .unwrap();

        let _ = client
            .execute::<Envelope>(Method::GET, "/api/now/table/incident", &[], None)
            .await
            .unwrap_err();

        // All three permits went to the three attempts
        assert!(!client.rate_limiter().allow(EndpointClass::Table));
    }

    #[tokio::test]
    async fn test_pre_cancelled_call_never_reaches_network() {
        let server = MockServer::start().await;
        // No mocks: any request would 404 and fail the test differently

        let client = basic_client(&server).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .execute_with::<Envelope>(
                Method::GET,
                "/api/now/table/incident",
                &[],
                None,
                &fast_policy(3),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SnowError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_transport_timeout_classified_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/now/table/incident"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"result": []}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let config = Config::new(
            server.uri(),
            AuthConfig::Basic {
                username: "admin".into(),
                password: "pw".into(),
            },
        )
        .unwrap()
        .with_timeout(Duration::from_millis(50));
        let mut client = SnowClient::with_token_store(config, Arc::new(MemoryTokenStore::new()))
            .await
            .unwrap();
        client.set_retry_policy(RetryPolicy::none());

        let err = client
            .execute::<Envelope>(Method::GET, "/api/now/table/incident", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_empty_body_decodes_as_null() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/now/table/incident/abc123"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = basic_client(&server).await;
        let value: serde_json::Value = client
            .execute(Method::DELETE, "/api/now/table/incident/abc123", &[], None)
            .await
            .unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn test_execute_raw_returns_xml_body() {
        let server = MockServer::start().await;
        let xml = "<xml><incident><number>INC0001</number></incident></xml>";
        Mock::given(method("GET"))
            .and(path("/incident.do"))
            .and(header("accept", "application/xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(xml))
            .mount(&server)
            .await;

        let client = basic_client(&server).await;
        let body = client
            .execute_raw(Method::GET, "/incident.do", &[("XML", "")], None)
            .await
            .unwrap();
        assert_eq!(body, xml);
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/now/table/incident"))
            .and(wiremock::matchers::body_json(serde_json::json!({
                "short_description": "printer on fire"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "result": [{"number": "INC0002"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = basic_client(&server).await;
        let body = serde_json::json!({"short_description": "printer on fire"});
        let envelope: Envelope = client
            .execute(Method::POST, "/api/now/table/incident", &[], Some(&body))
            .await
            .unwrap();
        assert_eq!(envelope.result[0]["number"], "INC0002");
    }
}
