//! Resumable session persistence with pluggable backends.
//!
//! A [`ResumeRecord`] is everything needed to attempt `<resume/>` after the
//! process restarts: the session id, the inbound count to report and the
//! peer's resumption window.

use crate::error::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Stored resumable session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    /// Session id granted by `<enabled/>`
    pub session_id: String,
    /// Inbound count to report in `<resume h=../>`
    pub h: u32,
    /// Resumption window in seconds, 0 when the peer did not say
    pub max_resume: u32,
    /// Seconds since the Unix epoch when the record was taken
    pub saved_at: u64,
}

impl ResumeRecord {
    /// Take a record now
    pub fn new(session_id: String, h: u32, max_resume: u32) -> Self {
        let saved_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            session_id,
            h,
            max_resume,
            saved_at,
        }
    }

    /// Whether the peer's window has passed at `now`
    ///
    /// A deadline that does not fit in `SystemTime` counts as expired.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        if self.max_resume == 0 {
            return false;
        }
        let deadline = self
            .saved_at
            .checked_add(u64::from(self.max_resume))
            .and_then(|secs| UNIX_EPOCH.checked_add(Duration::from_secs(secs)));
        match deadline {
            Some(deadline) => now > deadline,
            None => true,
        }
    }
}

/// Persistence for resumable sessions, keyed by stream entity
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Load the record for `key`
    async fn load(&self, key: &str) -> Result<Option<ResumeRecord>, StoreError>;

    /// Replace the record for `key`
    async fn save(&self, key: &str, record: &ResumeRecord) -> Result<(), StoreError>;

    /// Remove the record for `key`
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Load the record for `key`, discarding it if its window has passed
    async fn load_live(&self, key: &str) -> Result<Option<ResumeRecord>, StoreError> {
        match self.load(key).await? {
            Some(record) if record.is_expired(SystemTime::now()) => {
                info!(
                    "Stored session {} for {} expired; discarding",
                    record.session_id, key
                );
                self.clear(key).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, ResumeRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<ResumeRecord>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, record: &ResumeRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir`, creating it on first save
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

#[async_trait]
impl ResumeStore for FileStore {
    async fn load(&self, key: &str) -> Result<Option<ResumeRecord>, StoreError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &str, record: &ResumeRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved resume record for {} to {:?}", key, path);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
