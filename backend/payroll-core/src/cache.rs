// src/cache.rs
//
// JSON file cache with per-entry expiry. Used as a read-only fallback, never as a source of
// truth.

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

use crate::payroll_client::{io_context, PayrollError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMetadata {
    key: String,
    stored_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedData<T> {
    metadata: CacheMetadata,
    data: T,
}

/// A live cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct JsonFileCache {
    dir: PathBuf,
}

impl JsonFileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PayrollError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| {
                io_context(e, format!("Failed to create cache directory: {:?}", dir))
            })?;
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// File-name-safe key. Long keys are shortened with a hash suffix.
    pub fn cache_key(&self, key: &str) -> String {
        let mut safe = key.replace(|c: char| !c.is_alphanumeric() && c != '_', "_");

        const MAX_KEY_LEN: usize = 100;
        if safe.len() > MAX_KEY_LEN {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(key.as_bytes());
            let hash = hasher.finalize();
            let prefix: String = safe.chars().take(MAX_KEY_LEN / 2).collect();
            safe = format!("{}_{}", prefix, hex::encode(&hash[..8]));
        }
        safe
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", self.cache_key(key)))
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), PayrollError> {
        let now = Utc::now();
        let cached = CachedData {
            metadata: CacheMetadata {
                key: key.to_string(),
                stored_at: now,
                expires_at: now + ttl,
            },
            data: value,
        };
        let json_string = serde_json::to_string_pretty(&cached)?;

        let path = self.path_for(key);
        let mut file = File::create(&path)
            .map_err(|e| io_context(e, format!("Failed to create cache file: {:?}", path)))?;
        file.write_all(json_string.as_bytes())
            .map_err(|e| io_context(e, format!("Failed to write to cache file: {:?}", path)))?;

        debug!("Saved data to cache for key: {}", key);
        Ok(())
    }

    /// Live entry for `key`, or `None` on a miss, an expired entry or a corrupt file.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>, PayrollError> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at<T: DeserializeOwned>(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry<T>>, PayrollError> {
        let path = self.path_for(key);
        if !path.exists() {
            debug!("Cache miss (file not found) for key: {}", key);
            return Ok(None);
        }

        let json_string = fs::read_to_string(&path)
            .map_err(|e| io_context(e, format!("Failed to read cache file: {:?}", path)))?;

        let cached: CachedData<T> = match serde_json::from_str(&json_string) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "Failed to deserialize cache file {:?}: {}. Removing corrupt cache file.",
                    path, e
                );
                if let Err(remove_err) = fs::remove_file(&path) {
                    error!("Failed to remove corrupt cache file {:?}: {}", path, remove_err);
                }
                return Ok(None);
            }
        };

        if now >= cached.metadata.expires_at {
            debug!("Cache stale for key: {}", key);
            return Ok(None);
        }

        debug!("Cache hit for key: {}", key);
        Ok(Some(CacheEntry {
            value: cached.data,
            stored_at: cached.metadata.stored_at,
            expires_at: cached.metadata.expires_at,
        }))
    }

    pub fn invalidate(&self, key: &str) -> Result<(), PayrollError> {
        let path = self.path_for(key);
        if path.exists() {
            info!("Clearing cache file: {:?}", path);
            fs::remove_file(&path)
                .map_err(|e| io_context(e, format!("Failed to remove cache file: {:?}", path)))?;
        }
        Ok(())
    }

    pub fn clear_all(&self) -> Result<(), PayrollError> {
        if !self.dir.exists() {
            return Ok(());
        }
        info!("Clearing all cache files in directory: {:?}", self.dir);
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            io_context(e, format!("Failed to read cache directory: {:?}", self.dir))
        })?;

        for entry_result in entries {
            let entry = entry_result.map_err(|e| io_context(e, "Failed to read directory entry"))?;
            let path = entry.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
                fs::remove_file(&path)
                    .map_err(|e| io_context(e, format!("Failed to remove cache file: {:?}", path)))?;
            }
        }
        Ok(())
    }
}
