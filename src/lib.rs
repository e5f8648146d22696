//! # snowcore
//!
//! snowcore is the request execution core for ServiceNow REST clients.
//!
//! It owns everything that happens between "a caller wants
//! `GET /api/now/table/incident`" and "here are the decoded results":
//! credential application and OAuth token lifecycle, per-endpoint-class
//! rate limiting, and bounded exponential-backoff retry. Per-resource
//! wrappers (table, aggregate, batch, identity, cmdb, catalog) and the
//! CLI/TUI layers are thin consumers of this crate.
//!
//! ## Features
//!
//! - **Four auth flows**: basic, API key, OAuth client-credentials, and
//!   OAuth authorization-code, behind one provider abstraction
//! - **Token lifecycle**: expiry tracking with a safety buffer,
//!   serialized refresh under concurrency, and owner-only on-disk
//!   persistence for startup reuse
//! - **Rate limiting**: independent token buckets per endpoint class
//!   (table, attachment, import, default) with waits, non-blocking
//!   checks, and cancellable reservations
//! - **Retries**: classified errors, exponential backoff with jitter,
//!   and immediate surfacing of permanent failures
//! - **Security**: passwords, client secrets, and API keys are never
//!   logged and are sanitized from error messages
//!
//! ## Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`config`] - Construction-time configuration and validation
//! - [`error`] - Unified error type and the status classification table
//! - [`auth`] - Auth providers, OAuth token lifecycle, token persistence
//! - [`ratelimit`] - Endpoint classification and token bucket limiters
//! - [`retry`] - Retry policies and the backoff executor
//! - [`client`] - The orchestrating HTTP client
//!
//! ## Example
//!
//! ```ignore
//! use reqwest::Method;
//! use snowcore::client::SnowClient;
//! use snowcore::config::Config;
//!
//! async fn example() -> Result<(), snowcore::error::SnowError> {
//!     let config = Config::from_env()?;
//!     let client = SnowClient::new(config).await?;
//!
//!     let incidents: serde_json::Value = client
//!         .execute(
//!             Method::GET,
//!             "/api/now/table/incident",
//!             &[("sysparm_limit", "10"), ("sysparm_query", "active=true")],
//!             None,
//!         )
//!         .await?;
//!     println!("{incidents:#}");
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! One client instance is meant to be shared by many concurrent callers.
//! The auth provider serializes token refreshes behind a mutex, so when
//! several callers hit an expired token at once only one network refresh
//! happens. Rate limit buckets admit waiters roughly FIFO per class and
//! give no ordering across classes or across logical requests.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod retry;
