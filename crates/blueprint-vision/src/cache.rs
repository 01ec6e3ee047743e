//! Content-addressed result cache with TTL and size-bounded eviction.
//!
//! ## Overview
//!
//! [`ResultCache`] is a cheap-to-clone handle around shared state. The
//! pipeline receives it explicitly; there is no process-wide instance.
//!
//! - Keys are hashed with blake3 by default ([`KeyHasher::Blake3`]); the
//!   non-cryptographic [`KeyHasher::Fast`] tier trades collision
//!   resistance for speed.
//! - Entries expire lazily on read, or in bulk via [`ResultCache::cleanup`].
//! - When an insert would exceed `max_bytes`, the oldest entries are evicted
//!   until usage drops to `evict_to_ratio` of the limit.
//! - With a backing file, every mutation is persisted best-effort. IO
//!   failures are logged and never surface to callers.
//!
//! Concurrent writers resolve last-writer-wins.

use crate::config::CacheConfig;
use crate::error::Result;
use rustc_hash::{FxHashMap, FxHasher};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Millisecond wall clock, injectable for tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    #[must_use = "creates a manual clock"]
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Key digest strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyHasher {
    /// blake3 hex digest
    #[default]
    Blake3,
    /// 64-bit Fx hash; collisions are possible
    Fast,
}

impl KeyHasher {
    #[must_use = "returns the key digest"]
    pub fn digest(&self, key: &str) -> String {
        match self {
            Self::Blake3 => blake3::hash(key.as_bytes()).to_hex().to_string(),
            Self::Fast => {
                let mut hasher = FxHasher::default();
                hasher.write(key.as_bytes());
                format!("{:016x}", hasher.finish())
            }
        }
    }
}

/// Stored value with its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub hash: String,
    pub data: serde_json::Value,
    /// Insert time, ms since the epoch
    pub timestamp: u64,
    /// Lifetime in ms
    pub ttl: u64,
    pub size_bytes: usize,
}

impl CacheEntry {
    #[inline]
    #[must_use = "returns whether the entry has expired"]
    pub const fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > self.ttl
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    /// Expired entries not yet collected
    pub expired: usize,
    pub hits: u64,
    pub misses: u64,
    pub oldest_timestamp: Option<u64>,
    pub newest_timestamp: Option<u64>,
}

impl CacheStats {
    /// Fraction of `max_bytes` in use.
    #[must_use = "returns the usage ratio"]
    pub fn usage_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        // Precision loss is irrelevant at cache sizes
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.total_bytes as f64 / self.max_bytes as f64;
        ratio
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: FxHashMap<String, CacheEntry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn remove(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn evict_oldest_until(&mut self, target_bytes: usize) -> usize {
        let mut by_age: Vec<(u64, String)> = self
            .entries
            .values()
            .map(|e| (e.timestamp, e.hash.clone()))
            .collect();
        by_age.sort();
        let mut evicted = 0;
        for (_, hash) in by_age {
            if self.total_bytes <= target_bytes {
                break;
            }
            self.remove(&hash);
            evicted += 1;
        }
        evicted
    }

    fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.values().cloned().collect()
    }
}

/// Shared handle to the result cache.
#[derive(Debug, Clone)]
pub struct ResultCache {
    state: Arc<Mutex<CacheState>>,
    config: CacheConfig,
    hasher: KeyHasher,
    clock: Arc<dyn Clock>,
    persist_path: Option<PathBuf>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl ResultCache {
    /// In-memory cache on the system clock.
    #[must_use = "creates a result cache"]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            config,
            hasher: KeyHasher::default(),
            clock: Arc::new(SystemClock),
            persist_path: None,
        }
    }

    /// Cache backed by a JSON file. Unreadable files start an empty cache.
    #[must_use = "creates a persistent result cache"]
    pub fn open(path: impl Into<PathBuf>, config: CacheConfig) -> Self {
        let path = path.into();
        let cache = Self {
            persist_path: Some(path.clone()),
            ..Self::new(config)
        };
        match load_entries(&path) {
            Ok(entries) => {
                let now = cache.clock.now_ms();
                let mut state = cache.lock();
                for entry in entries.into_iter().filter(|e| !e.is_expired(now)) {
                    state.total_bytes += entry.size_bytes;
                    state.entries.insert(entry.hash.clone(), entry);
                }
                debug!(path = %path.display(), entries = state.entries.len(), "Loaded cache");
            }
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "Failed to load cache file");
                }
            }
        }
        cache
    }

    #[must_use = "returns the cache with a different clock"]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use = "returns the cache with a different key hasher"]
    pub const fn with_hasher(mut self, hasher: KeyHasher) -> Self {
        self.hasher = hasher;
        self
    }

    #[inline]
    #[must_use = "returns the key digest"]
    pub fn hash_key(&self, key: &str) -> String {
        self.hasher.digest(key)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch a live entry. Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let hash = self.hash_key(key);
        let now = self.clock.now_ms();
        let (value, expired) = {
            let mut state = self.lock();
            match state.entries.get(&hash) {
                Some(entry) if entry.is_expired(now) => {
                    state.remove(&hash);
                    state.misses += 1;
                    (None, true)
                }
                Some(entry) => {
                    let data = entry.data.clone();
                    state.hits += 1;
                    (Some(data), false)
                }
                None => {
                    state.misses += 1;
                    (None, false)
                }
            }
        };
        if expired {
            debug!(key, "Cache entry expired");
            self.persist();
        }
        value
    }

    /// Typed [`get`](Self::get). Entries that fail to decode count as misses.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Store a value. `ttl` defaults to the configured lifetime.
    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let hash = self.hash_key(key);
        let size_bytes = value.to_string().len();
        let max = self.config.max_bytes;
        if max > 0 && size_bytes > max {
            warn!(key, size_bytes, max, "Value larger than cache limit; not cached");
            return;
        }
        let ttl = ttl.map_or(self.config.ttl_ms, |d| {
            u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
        });
        let entry = CacheEntry {
            hash: hash.clone(),
            data: value,
            timestamp: self.clock.now_ms(),
            ttl,
            size_bytes,
        };

        {
            let mut state = self.lock();
            state.remove(&hash);
            if max > 0 && state.total_bytes + size_bytes > max {
                let target = ratio_of(max, self.config.evict_to_ratio).saturating_sub(size_bytes);
                let evicted = state.evict_oldest_until(target);
                debug!(evicted, "Evicted oldest cache entries");
            }
            state.total_bytes += size_bytes;
            state.entries.insert(hash, entry);
            if max > 0 && state.total_bytes > ratio_of(max, self.config.warn_ratio) {
                warn!(
                    total_bytes = state.total_bytes,
                    max, "Cache usage above warning threshold"
                );
            }
        }
        self.persist();
    }

    /// Typed [`set`](Self::set).
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        self.set(key, serde_json::to_value(value)?, ttl);
        Ok(())
    }

    /// True if a live entry exists.
    pub fn has(&self, key: &str) -> bool {
        let hash = self.hash_key(key);
        let now = self.clock.now_ms();
        self.lock()
            .entries
            .get(&hash)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Remove an entry. Returns whether one was present.
    pub fn delete(&self, key: &str) -> bool {
        let hash = self.hash_key(key);
        let removed = self.lock().remove(&hash).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    pub fn clear(&self) {
        *self.lock() = CacheState::default();
        self.persist();
    }

    /// Drop every expired entry and return how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let removed = {
            let mut state = self.lock();
            let expired: Vec<String> = state
                .entries
                .values()
                .filter(|e| e.is_expired(now))
                .map(|e| e.hash.clone())
                .collect();
            for hash in &expired {
                state.remove(hash);
            }
            expired.len()
        };
        if removed > 0 {
            debug!(removed, "Cleaned up expired cache entries");
            self.persist();
        }
        removed
    }

    #[must_use = "returns cache statistics"]
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_ms();
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            max_bytes: self.config.max_bytes,
            expired: state.entries.values().filter(|e| e.is_expired(now)).count(),
            hits: state.hits,
            misses: state.misses,
            oldest_timestamp: state.entries.values().map(|e| e.timestamp).min(),
            newest_timestamp: state.entries.values().map(|e| e.timestamp).max(),
        }
    }

    fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let snapshot = self.lock().snapshot();
        if let Err(e) = write_entries(path, &snapshot) {
            warn!(path = %path.display(), error = %e, "Failed to persist cache");
        }
    }
}

fn ratio_of(max: usize, ratio: f64) -> usize {
    // Byte counts stay far below f64 mantissa limits
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let bytes = (max as f64 * ratio.clamp(0.0, 1.0)) as usize;
    bytes
}

fn load_entries(path: &Path) -> Result<Vec<CacheEntry>> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_entries(path: &Path, entries: &[CacheEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_vec(entries)?)?;
    Ok(())
}
