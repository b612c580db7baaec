//! Per-origin continuation tokens.
//!
//! A [`SessionStore`] maps an origin key to the continuation token the server
//! last issued for it.  At most one token is kept per origin; `set`
//! overwrites.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Error, Result};

/// Durable mapping from origin to continuation token.
///
/// # Examples
///
/// ```
/// # use relaychat::{MemorySessionStore, SessionStore};
/// # tokio_test::block_on(async {
/// let store = MemorySessionStore::new();
/// store.set("app.example.com", "s1").await.unwrap();
/// assert_eq!(
///     store.get("app.example.com").await.unwrap().as_deref(),
///     Some("s1")
/// );
/// # });
/// ```
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the token stored for `origin`, if any.
    async fn get(&self, origin: &str) -> Result<Option<String>>;

    /// Stores `token` for `origin`, replacing any previous token.
    async fn set(&self, origin: &str, token: &str) -> Result<()>;

    /// Forgets the token for `origin`.
    async fn clear(&self, origin: &str) -> Result<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.tokens
            .lock()
            .map_err(|_| Error::storage("session store lock poisoned", None))
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, origin: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(origin).cloned())
    }

    async fn set(&self, origin: &str, token: &str) -> Result<()> {
        self.lock()?.insert(origin.to_string(), token.to_string());
        Ok(())
    }

    async fn clear(&self, origin: &str) -> Result<()> {
        self.lock()?.remove(origin);
        Ok(())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(rename = "sessionIds", default)]
    session_ids: BTreeMap<String, String>,
}

/// Store persisted as a JSON document on disk.
///
/// Every operation is a read-modify-write of the whole file under a lock,
/// done with `tokio::fs` so a slow disk never blocks the runtime.  A missing
/// file reads as empty and is created on first write.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    /// Creates a store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<SessionFile> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(SessionFile::default()),
            Err(err) => return Err(Error::io("failed to read session file", err)),
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            Error::storage("failed to parse session file", Some(Box::new(err)))
        })
    }

    async fn save(&self, contents: &SessionFile) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(contents).map_err(|err| {
            Error::storage("failed to serialize session file", Some(Box::new(err)))
        })?;
        fs::write(&self.path, bytes)
            .await
            .map_err(|err| Error::io("failed to write session file", err))
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn get(&self, origin: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.session_ids.get(origin).cloned())
    }

    async fn set(&self, origin: &str, token: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        contents
            .session_ids
            .insert(origin.to_string(), token.to_string());
        self.save(&contents).await
    }

    async fn clear(&self, origin: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut contents = self.load().await?;
        if contents.session_ids.remove(origin).is_some() {
            self.save(&contents).await?;
        }
        Ok(())
    }
}
