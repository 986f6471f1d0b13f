//! Ephemeral key/value backend (Redis style)
//!
//! A single key holds the raw bytes of the whole upload and grows with the
//! store's native append. Keys carry a TTL that every append refreshes, so
//! abandoned uploads disappear on their own after the inactivity window.
//!
//! Whole-file verification is never offered here: it would mean reading the
//! entire blob back out of the store on completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{fetch_target, ContainerRecord, StoreKind, UploadStore};
use crate::error::{StoreError, StoreResult};

/// Default inactivity window before an upload expires
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Key/value operations the backend relies on
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Set `key` only if it is absent; returns whether it was set
    async fn set_new(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Append to an existing value, returning the new length
    async fn append(&self, key: &str, value: &[u8]) -> StoreResult<u64>;

    async fn len(&self, key: &str) -> StoreResult<u64>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Key/value upload store
pub struct KeyValueStore<C> {
    client: C,
    prefix: String,
    container_prefix: String,
    ttl: Duration,
}

impl<C: KeyValueClient> KeyValueStore<C> {
    /// Keys become `<prefix>:<name>` and `<prefix>container:<name>`
    pub fn new(client: C, prefix: &str, ttl: Duration) -> Self {
        Self {
            client,
            prefix: format!("{}:", prefix),
            container_prefix: format!("{}container:", prefix),
            ttl,
        }
    }

    fn data_key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn container_key(&self, name: &str) -> String {
        format!("{}{}", self.container_prefix, name)
    }
}

#[async_trait]
impl<C: KeyValueClient> UploadStore for KeyValueStore<C> {
    fn kind(&self) -> StoreKind {
        StoreKind::KeyValue
    }

    async fn exists(&self, name: &str) -> StoreResult<bool> {
        self.client.exists(&self.data_key(name)).await
    }

    async fn create(&self, name: &str, record: ContainerRecord) -> StoreResult<()> {
        if !self.client.set_new(&self.data_key(name), b"", self.ttl).await? {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        self.container_create(name, &record).await
    }

    async fn size(&self, name: &str) -> StoreResult<u64> {
        let key = self.data_key(name);
        if !self.client.exists(&key).await? {
            return Err(StoreError::NotFound(name.to_string()));
        }
        self.client.len(&key).await
    }

    async fn append(&self, name: &str, data: Bytes) -> StoreResult<()> {
        let key = self.data_key(name);
        if !self.client.exists(&key).await? {
            return Err(StoreError::NotFound(name.to_string()));
        }

        self.client.append(&key, &data).await?;
        self.client.expire(&key, self.ttl).await?;
        if self.client.exists(&self.container_key(name)).await? {
            self.client.expire(&self.container_key(name), self.ttl).await?;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&self.data_key(name)).await
    }

    async fn fetch(&self, name: &str, destination: &Path, remove_after: bool) -> StoreResult<PathBuf> {
        let data = self
            .client
            .get(&self.data_key(name))
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let target = fetch_target(destination, name).await?;
        tokio::fs::write(&target, &data).await?;

        if remove_after {
            self.delete(name).await?;
            self.container_delete(name).await?;
        }
        Ok(target)
    }

    async fn container_exists(&self, name: &str) -> StoreResult<bool> {
        self.client.exists(&self.container_key(name)).await
    }

    async fn container_create(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        let json = serde_json::to_vec(record)?;
        self.client.set(&self.container_key(name), &json, self.ttl).await
    }

    async fn container_update(&self, name: &str, record: &ContainerRecord) -> StoreResult<()> {
        self.container_create(name, record).await
    }

    async fn container_fetch(&self, name: &str) -> StoreResult<ContainerRecord> {
        let key = self.container_key(name);
        let json = self
            .client
            .get(&key)
            .await?
            .ok_or(StoreError::NotFound(key))?;
        Ok(serde_json::from_slice(&json)?)
    }

    async fn container_delete(&self, name: &str) -> StoreResult<()> {
        self.client.delete(&self.container_key(name)).await
    }
}

// ============================================================================
// In-process client
// ============================================================================

struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local key/value client with TTL expiry
///
/// Uploads do not survive a restart; intended for development and tests.
#[derive(Default)]
pub struct MemoryKeyValue {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a live entry, dropping it first if it has expired
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut MemoryEntry>) -> T) -> T {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|e| e.expires_at <= Instant::now()) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }
}

#[async_trait]
impl KeyValueClient for MemoryKeyValue {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.with_live(key, |entry| entry.is_some()))
    }

    async fn set_new(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        if self.with_live(key, |entry| entry.is_some()) {
            return Ok(false);
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn append(&self, key: &str, value: &[u8]) -> StoreResult<u64> {
        self.with_live(key, |entry| {
            let entry = entry.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            entry.value.extend_from_slice(value);
            Ok(entry.value.len() as u64)
        })
    }

    async fn len(&self, key: &str) -> StoreResult<u64> {
        Ok(self.with_live(key, |entry| entry.map(|e| e.value.len() as u64).unwrap_or(0)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.with_live(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Instant::now() + ttl;
            }
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self.with_live(key, |entry| entry.map(|e| Bytes::from(e.value.clone()))))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
