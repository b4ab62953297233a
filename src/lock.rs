//! Blocking lock with TTL leases, shared across processes.
//!
//! A [`Locker`] hands out leases: a key is held by at most one lease at a
//! time, and a lease expires on its own after its TTL so a crashed holder
//! cannot wedge a key forever. [`BlockingLock`] layers bounded retries with
//! jitter on top and runs a closure while the lease is held.
//!
//! Two backends:
//! - [`FileLocker`] keeps one lease file per key in a shared directory. This
//!   is the production backend; every process pointing at the same directory
//!   participates.
//! - [`MemoryLocker`] is the in-process equivalent, for tests and single
//!   process deployments.
//!
//! Generation time is not bounded by the lease: a holder that outlives its
//! TTL may overlap with the next holder. The raster writer's no-clobber
//! rename keeps that overlap harmless.

use crate::cache::hash_key;
use crate::file_guard::FileGuard;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out waiting for lock {key} after {attempts} attempts")]
    Timeout { key: String, attempts: u32 },
    #[error("Lock IO error: {0}")]
    Io(#[from] io::Error),
    #[error("No entropy for lease token: {0}")]
    Entropy(String),
}

/// Proof of holding a lease. Only the matching token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    fn generate() -> Result<Self, LockError> {
        let mut bytes = [0u8; 16];
        getrandom::getrandom(&mut bytes).map_err(|e| LockError::Entropy(e.to_string()))?;
        Ok(Self(bytes.iter().map(|b| format!("{b:02x}")).collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Non-blocking lease primitive.
pub trait Locker: Send + Sync {
    /// Take the lease on `key` for `ttl`, or return `None` if someone else
    /// holds an unexpired lease.
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError>;

    /// Give the lease back. A stale token (the lease expired and was taken
    /// over) is ignored.
    fn release(&self, key: &str, token: &LeaseToken) -> Result<(), LockError>;
}

// ============================================================================
// Blocking lock
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct LockSettings {
    /// Lease TTL.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to every retry.
    pub retry_jitter: Duration,
    pub key_prefix: String,
}

impl LockSettings {
    pub fn new(timeout: Duration, retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            timeout,
            retry_count,
            retry_delay,
            retry_jitter: Duration::from_millis(50),
            key_prefix: String::new(),
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

pub struct BlockingLock {
    locker: Box<dyn Locker>,
    settings: LockSettings,
}

impl BlockingLock {
    pub fn new(locker: Box<dyn Locker>, settings: LockSettings) -> Self {
        Self { locker, settings }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Run `f` while holding the lease on `key`.
    ///
    /// Makes one attempt plus `retry_count` retries. When every attempt finds
    /// the key held, returns [`LockError::Timeout`] and `f` never runs. The
    /// lease is released when `f` returns, errors or panics.
    pub fn with_blocking_lock<T, E, F>(&self, key: &str, f: F) -> Result<T, E>
    where
        E: From<LockError>,
        F: FnOnce() -> Result<T, E>,
    {
        let full_key = format!("{}{}", self.settings.key_prefix, key);
        let attempts = self.settings.attempts();

        for attempt in 1..=attempts {
            if let Some(token) = self.locker.try_acquire(&full_key, self.settings.timeout)? {
                let _lease = Lease {
                    locker: self.locker.as_ref(),
                    key: &full_key,
                    token,
                };
                return f();
            }
            if attempt < attempts {
                debug!(key = %full_key, attempt, "Lock busy, retrying");
                std::thread::sleep(self.settings.retry_delay + jitter(self.settings.retry_jitter));
            }
        }

        warn!(key = %full_key, attempts, "Gave up waiting for lock");
        Err(LockError::Timeout {
            key: full_key,
            attempts,
        }
        .into())
    }
}

/// Releases on drop, so early returns and unwinding both give the key back.
struct Lease<'a> {
    locker: &'a dyn Locker,
    key: &'a str,
    token: LeaseToken,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locker.release(self.key, &self.token) {
            warn!(key = %self.key, error = %e, "Failed to release lock");
        }
    }
}

/// Uniform random duration in `[0, max)`. No entropy means no jitter.
fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return Duration::ZERO;
    }
    let unit = (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64;
    max.mul_f64(unit)
}

// ============================================================================
// File backend
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct LeaseFile {
    token: String,
    expires_at_ms: u64,
    pid: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Lease files under one directory: `{directory}/{sha256(key)}.lock`.
///
/// A new lease is staged in a temp file and linked into place without
/// clobbering, so it appears complete or not at all. Breaking an expired
/// lease and releasing happen under the directory's `.guard` file lock.
#[derive(Debug, Clone)]
pub struct FileLocker {
    directory: PathBuf,
}

impl FileLocker {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn lease_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.lock", hash_key(key)))
    }

    fn guard_path(&self) -> PathBuf {
        self.directory.join(".guard")
    }

    /// Publish a lease file; `false` if one is already in place.
    fn publish(&self, path: &Path, lease: &LeaseFile) -> Result<bool, LockError> {
        let mut staged = tempfile::NamedTempFile::new_in(&self.directory)?;
        serde_json::to_writer(&mut staged, lease).map_err(io::Error::from)?;
        staged.flush()?;
        match staged.into_temp_path().persist_noclobber(path) {
            Ok(()) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    /// `None` when the lease vanished or cannot be parsed.
    fn read(path: &Path) -> Result<Option<LeaseFile>, LockError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(path: &Path) -> Result<(), LockError> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl Locker for FileLocker {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.lease_path(key);
        let token = LeaseToken::generate()?;
        let lease = LeaseFile {
            token: token.0.clone(),
            expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
            pid: std::process::id(),
        };

        if self.publish(&path, &lease)? {
            return Ok(Some(token));
        }

        let _guard = FileGuard::acquire(&self.guard_path())?;
        if let Some(current) = Self::read(&path)?
            && current.expires_at_ms > now_ms()
        {
            return Ok(None);
        }
        debug!(key, path = %path.display(), "Breaking expired lease");
        Self::remove(&path)?;
        Ok(self.publish(&path, &lease)?.then_some(token))
    }

    fn release(&self, key: &str, token: &LeaseToken) -> Result<(), LockError> {
        let path = self.lease_path(key);
        let _guard = FileGuard::acquire(&self.guard_path())?;
        match Self::read(&path)? {
            Some(current) if current.token == token.0 => Self::remove(&path),
            _ => {
                debug!(key, "Lease already taken over, not releasing");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Memory backend
// ============================================================================

/// In-process lease table with the same TTL semantics as [`FileLocker`].
#[derive(Debug, Default)]
pub struct MemoryLocker {
    leases: Mutex<HashMap<String, (LeaseToken, Instant)>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Locker for MemoryLocker {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>, LockError> {
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        if let Some((_, expires)) = leases.get(key)
            && *expires > now
        {
            return Ok(None);
        }
        let token = LeaseToken::generate()?;
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    fn release(&self, key: &str, token: &LeaseToken) -> Result<(), LockError> {
        let mut leases = self.leases.lock().unwrap_or_else(|p| p.into_inner());
        if leases.get(key).is_some_and(|(held, _)| held == token) {
            leases.remove(key);
        }
        Ok(())
    }
}
