//! Token persistence.
//!
//! OAuth providers persist their tokens so a restarted process can reuse a
//! still-valid access token (or at least the refresh token) instead of
//! hitting the token endpoint on startup. Persistence is an optimization,
//! not a correctness requirement: a failed save is logged and swallowed by
//! the caller.
//!
//! The file-backed store keeps one JSON record per storage key under a
//! private directory (0700 dir, 0600 files). Writes go through a temp file
//! plus rename so a crash mid-write cannot corrupt an existing record.
//! Concurrent writers to the same key from different processes are out of
//! scope; single-process ownership is assumed.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::auth::oauth::OAuthToken;
use crate::error::SnowError;

/// Storage for OAuth token material, keyed by a string derived from
/// (flow kind, instance URL, client ID).
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persists a token under the given key, replacing any prior record.
    async fn save(&self, key: &str, token: &OAuthToken) -> Result<(), SnowError>;

    /// Loads the token for a key. A never-saved key is `Ok(None)`, not an
    /// error.
    async fn load(&self, key: &str) -> Result<Option<OAuthToken>, SnowError>;

    /// Removes the record for a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), SnowError>;
}

/// File-backed token store: one JSON file per key.
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    /// Creates a store rooted at `dir`. The directory is created lazily on
    /// first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    async fn ensure_dir(&self) -> Result<(), SnowError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(SnowError::TokenStore)?;

        // Tokens are secrets: owner-only access on the directory
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(&self.dir, perms)
                .await
                .map_err(SnowError::TokenStore)?;
        }

        Ok(())
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, key: &str, token: &OAuthToken) -> Result<(), SnowError> {
        self.ensure_dir().await?;

        let json = serde_json::to_string_pretty(token)?;
        let path = self.record_path(key);
        let tmp_path = self.dir.join(format!(".{}.tmp.{}", key, std::process::id()));

        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(SnowError::TokenStore)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms)
                .await
                .map_err(SnowError::TokenStore)?;
        }

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(SnowError::TokenStore)?;

        debug!(key, path = %path.display(), "persisted token");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<OAuthToken>, SnowError> {
        let path = self.record_path(key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SnowError::TokenStore(e)),
        };

        let token: OAuthToken = serde_json::from_str(&contents)?;
        debug!(key, "loaded persisted token");
        Ok(Some(token))
    }

    async fn delete(&self, key: &str) -> Result<(), SnowError> {
        match tokio::fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SnowError::TokenStore(e)),
        }
    }
}

/// In-memory token store for tests and callers that opt out of persistence.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: tokio::sync::Mutex<std::collections::HashMap<String, OAuthToken>>,
}

impl MemoryTokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn save(&self, key: &str, token: &OAuthToken) -> Result<(), SnowError> {
        self.records
            .lock()
            .await
            .insert(key.to_string(), token.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<OAuthToken>, SnowError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), SnowError> {
        self.records.lock().await.remove(key);
        Ok(())
    }
}
