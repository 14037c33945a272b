//! Memoization of expensive repeat lookups, keyed by opaque strings.
//!
//! `get` never evicts: the stored expiry is informational. Callers that need
//! freshness across runs call `clear` at an explicit boundary, the resync
//! orchestrator does so at the start of every pass.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry {key} is not valid JSON: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One cached value, or several stored together under a single key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "value", rename_all = "snake_case")]
pub enum CacheValue {
    Single(JsonValue),
    Many(Vec<JsonValue>),
}

impl CacheValue {
    /// The stored value: unwrapped for `Single`, an ordered list for `Many`.
    pub fn into_json(self) -> JsonValue {
        match self {
            Self::Single(value) => value,
            Self::Many(values) => JsonValue::Array(values),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CacheValue,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(value: CacheValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn put_entry(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        Ok(self.get_entry(key).await?.map(|entry| entry.value.into_json()))
    }

    async fn set(&self, key: &str, value: JsonValue) -> Result<(), CacheError> {
        self.put_entry(key, CacheEntry::new(CacheValue::Single(value))).await
    }

    async fn set_many(&self, key: &str, values: Vec<JsonValue>) -> Result<(), CacheError> {
        self.put_entry(key, CacheEntry::new(CacheValue::Many(values))).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCacheProvider {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CacheProvider for InMemoryCacheProvider {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put_entry(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// Durable backend: one JSON file per key, named by the key's SHA-256, written
/// through a temp file and an atomic rename so each write commits on its own.
#[derive(Debug, Clone)]
pub struct DiskCacheProvider {
    root: PathBuf,
}

impl DiskCacheProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", Self::sha256_hex(key.as_bytes())))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl CacheProvider for DiskCacheProvider {
    async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    async fn put_entry(&self, key: &str, entry: CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|err| io_error(&self.root, err))?;

        let bytes = serde_json::to_vec(&entry).map_err(|source| CacheError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        let path = self.entry_path(key);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| io_error(&temp_path, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| io_error(&temp_path, err))?;
        file.flush().await.map_err(|err| io_error(&temp_path, err))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(&path, err));
        }
        Ok(())
    }

    /// Removes only files this provider wrote; the root and anything else in
    /// it are left alone.
    async fn clear(&self) -> Result<(), CacheError> {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error(&self.root, err)),
        };
        let mut removed = 0usize;
        while let Some(entry) = dir.next_entry().await.map_err(|err| io_error(&self.root, err))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_owned_file_name(name) {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&path, err)),
            }
        }
        debug!(root = %self.root.display(), removed, "disk cache cleared");
        Ok(())
    }
}

/// `<sha256 hex>.json` entries and `.<uuid>.tmp` leftovers of interrupted writes.
fn is_owned_file_name(name: &str) -> bool {
    if let Some(stem) = name.strip_suffix(".json") {
        return stem.len() == 64 && stem.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    }
    name.strip_prefix('.')
        .and_then(|rest| rest.strip_suffix(".tmp"))
        .is_some_and(|id| Uuid::parse_str(id).is_ok())
}

/// Stable key for a function name plus its JSON-serializable arguments.
pub fn cache_key(namespace: &str, args: &impl Serialize) -> String {
    let encoded = serde_json::to_vec(args).unwrap_or_default();
    format!("{namespace}:{}", DiskCacheProvider::sha256_hex(&encoded))
}

/// Returns the cached value for `key`, or runs `fetch` and caches its result.
/// Cache failures are logged and treated as misses; they never fail the call.
pub async fn cached<T, E, F, Fut>(cache: &dyn CacheProvider, key: &str, fetch: F) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match cache.get_entry(key).await {
        Ok(Some(CacheEntry {
            value: CacheValue::Single(value),
            ..
        })) => match serde_json::from_value(value) {
            Ok(hit) => {
                debug!(key, "cache hit");
                return Ok(hit);
            }
            Err(err) => warn!(key, error = %err, "ignoring cached value of unexpected shape"),
        },
        Ok(_) => {}
        Err(err) => warn!(key, error = %err, "cache read failed"),
    }

    let fresh = fetch().await?;
    match serde_json::to_value(&fresh) {
        Ok(value) => {
            if let Err(err) = cache.set(key, value).await {
                warn!(key, error = %err, "cache write failed");
            }
        }
        Err(err) => warn!(key, error = %err, "value is not cacheable"),
    }
    Ok(fresh)
}

/// Like [`cached`], for a sequence stored as one multi-value entry.
pub async fn cached_pages<E, F, Fut>(
    cache: &dyn CacheProvider,
    key: &str,
    fetch: F,
) -> Result<Vec<JsonValue>, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<JsonValue>, E>>,
{
    match cache.get_entry(key).await {
        Ok(Some(CacheEntry {
            value: CacheValue::Many(values),
            ..
        })) => {
            debug!(key, items = values.len(), "cache hit");
            return Ok(values);
        }
        Ok(_) => {}
        Err(err) => warn!(key, error = %err, "cache read failed"),
    }

    let fresh = fetch().await?;
    if let Err(err) = cache.set_many(key, fresh.clone()).await {
        warn!(key, error = %err, "cache write failed");
    }
    Ok(fresh)
}
