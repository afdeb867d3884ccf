//! Cross-process exclusive lock over the data file, via a sidecar lock
//! file created with `create_new` semantics.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::repository::{StorageError, StorageResult};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// How long `acquire` keeps retrying before the batch fails.
    pub timeout: Duration,
    /// Sleep between acquisition attempts.
    pub poll_interval: Duration,
    /// A lock older than this is presumed abandoned and force-removed.
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: LOCK_POLL_INTERVAL,
            stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }
}

impl LockConfig {
    pub fn from_env() -> Self {
        let timeout_secs: u64 = std::env::var("DEALFOLD_LOCK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LOCK_TIMEOUT.as_secs());
        let stale_secs: u64 = std::env::var("DEALFOLD_LOCK_STALE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_LOCK_STALE_AFTER.as_secs());
        Self {
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: LOCK_POLL_INTERVAL,
            stale_after: Duration::from_secs(stale_secs),
        }
    }
}

/// Holder identity written into the lock file, so a waiting process can
/// judge staleness and operators can see who holds the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LockClaim {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
}

impl LockClaim {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: Utc::now(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// Exclusive lock guard. Released explicitly via [`FileLock::release`];
/// dropping an unreleased guard removes the lock file best-effort.
#[derive(Debug)]
pub struct FileLock {
    lock_path: PathBuf,
    released: bool,
}

pub fn lock_path_for(data_path: &Path) -> PathBuf {
    let file_name = data_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data");
    data_path.with_file_name(format!("{file_name}.lock"))
}

impl FileLock {
    /// Acquires the sidecar lock for `data_path`, retrying until
    /// `config.timeout` elapses. A lock older than `config.stale_after`
    /// is force-removed under the assumption its holder crashed.
    pub async fn acquire(data_path: &Path, config: LockConfig) -> StorageResult<Self> {
        let lock_path = lock_path_for(data_path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(parent, err))?;
        }
        let started = Instant::now();
        loop {
            let claim = serde_json::to_vec(&LockClaim::current())?;
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    if let Err(err) = write_claim(&mut file, &claim).await {
                        drop(file);
                        let _ = fs::remove_file(&lock_path).await;
                        return Err(StorageError::io(&lock_path, err));
                    }
                    return Ok(Self {
                        lock_path,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if evict_if_stale(&lock_path, config.stale_after).await {
                        continue;
                    }
                    if started.elapsed() >= config.timeout {
                        return Err(StorageError::LockTimeout {
                            path: lock_path,
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    debug!(lock = %lock_path.display(), "lock held, retrying");
                    tokio::time::sleep(config.poll_interval).await;
                }
                Err(err) => return Err(StorageError::io(&lock_path, err)),
            }
        }
    }

    /// Removes the lock file. Failures are logged, not surfaced: by this
    /// point the guarded mutation has already completed.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(err) = fs::remove_file(&self.lock_path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(lock = %self.lock_path.display(), %err, "failed to remove lock file");
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

async fn write_claim(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

/// Returns true when a stale lock was removed and acquisition should be
/// retried immediately. A slow-but-alive holder can be wrongly evicted;
/// the threshold is a liveness heuristic, not a correctness guarantee.
async fn evict_if_stale(lock_path: &Path, stale_after: Duration) -> bool {
    let age = lock_age(lock_path).await;
    match age {
        Some(age) if age > stale_after => {
            warn!(
                lock = %lock_path.display(),
                age_secs = age.as_secs(),
                "removing stale lock, presumed abandoned by a crashed holder"
            );
            fs::remove_file(lock_path).await.is_ok()
        }
        _ => false,
    }
}

async fn lock_age(lock_path: &Path) -> Option<Duration> {
    if let Ok(bytes) = fs::read(lock_path).await {
        if let Ok(claim) = serde_json::from_slice::<LockClaim>(&bytes) {
            return (Utc::now() - claim.timestamp).to_std().ok();
        }
    }
    // Unreadable or malformed claim: fall back to the file's mtime.
    let metadata = fs::metadata(lock_path).await.ok()?;
    metadata.modified().ok()?.elapsed().ok()
}
