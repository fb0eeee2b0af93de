//! Durable, TTL-aware key/value storage for cached responses.
//!
//! [`FileStore`] keeps one file per key under a cache directory. Each file
//! starts with the absolute expiry (Unix milliseconds, big-endian) followed
//! by the opaque payload. Writes go to a temporary file in the same
//! directory and are renamed into place, so a reader sees either the old
//! or the new entry and never a partial one.
//!
//! Expiry is enforced twice: eagerly on every read, and by a background
//! sweep that deletes expired files on a fixed interval.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::histogram;
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::RwLock,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::keys::hash_key;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_SWEEP_REMOVED: &str = "routecache_sweep_removed";

const ENTRY_EXTENSION: &str = "cache";
const TEMP_EXTENSION: &str = "tmp";
const EXPIRY_PREFIX_LEN: usize = 8;
const LOCK_STRIPES: usize = 64;
const MIN_TEMP_FILE_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store configuration: {0}")]
    Configuration(String),
    #[error("cache directory `{path}` is not usable: {source}")]
    Location {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("ttl must be at least one millisecond")]
    InvalidTtl,
    #[error("corrupt cache record `{}`", .path.display())]
    Corrupt { path: PathBuf },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Storage backend used by the cache middleware.
///
/// Read failures never escape `get`: they are logged and reported as a
/// miss. Write failures are returned so the caller can log them.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Return the live value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Store `value` under `key` until `now + ttl`, replacing any previous
    /// value.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Delete every expired entry, returning how many were removed.
    async fn remove_expired(&self) -> Result<usize, StoreError>;
}

/// File-backed [`CacheStore`] with a background expiry sweep.
///
/// Cloning is cheap; all clones share the directory, the locks and the
/// sweep task. The sweep stops when the last clone is dropped or when
/// [`FileStore::shutdown`] is called.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    sweep_interval: Duration,
    stripes: Box<[RwLock<()>]>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let sweeper = match self.sweeper.get_mut() {
            Ok(sweeper) => sweeper.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = sweeper {
            handle.abort();
        }
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir` and start its
    /// sweep task. Must be called from within a Tokio runtime.
    pub async fn open(dir: impl Into<PathBuf>, sweep_interval: Duration) -> Result<Self, StoreError> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(StoreError::Configuration(
                "cache path must not be empty".to_string(),
            ));
        }
        if sweep_interval.is_zero() {
            return Err(StoreError::Configuration(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Location {
                path: dir.clone(),
                source,
            })?;
        probe_writable(&dir).await?;

        let stripes = (0..LOCK_STRIPES).map(|_| RwLock::new(())).collect();
        let inner = Arc::new(Inner {
            dir,
            sweep_interval,
            stripes,
            sweeper: Mutex::new(None),
        });

        let handle = spawn_sweeper(Arc::downgrade(&inner), sweep_interval);
        *mutex_lock(&inner.sweeper, SOURCE, "open") = Some(handle);

        info!(
            target = "routecache::cache::store",
            op = "store::open",
            dir = %inner.dir.display(),
            sweep_interval_secs = sweep_interval.as_secs(),
            "Cache store opened"
        );

        Ok(Self { inner })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Stop the background sweep. Reads and writes keep working.
    pub fn shutdown(&self) {
        if let Some(handle) = mutex_lock(&self.inner.sweeper, SOURCE, "shutdown").take() {
            handle.abort();
            debug!(
                target = "routecache::cache::store",
                op = "store::shutdown",
                "Cache sweep stopped"
            );
        }
    }

    /// Number of entry files currently on disk, expired or not.
    pub async fn len(&self) -> Result<usize, StoreError> {
        let mut entries = fs::read_dir(&self.inner.dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry_hash(&entry.file_name().to_string_lossy()).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    pub(crate) async fn get_at(
        &self,
        key: &str,
        now: SystemTime,
    ) -> Result<Option<Bytes>, StoreError> {
        let hash = hash_key(key);
        let path = self.entry_path(&hash);

        {
            let _guard = self.stripe(&hash).read().await;
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            };

            let expires_at = parse_expiry(&raw).ok_or_else(|| StoreError::Corrupt {
                path: path.clone(),
            })?;
            if expires_at > unix_millis(now) {
                return Ok(Some(Bytes::from(raw).slice(EXPIRY_PREFIX_LEN..)));
            }
        }

        // Expired but not yet swept: drop it now so the next write starts clean.
        self.remove_if_expired(&hash, now).await?;
        Ok(None)
    }

    pub(crate) async fn set_at(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        now: SystemTime,
    ) -> Result<(), StoreError> {
        if ttl.as_millis() == 0 {
            return Err(StoreError::InvalidTtl);
        }

        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at = unix_millis(now).saturating_add(ttl_millis);

        let hash = hash_key(key);
        let temp_path = self
            .inner
            .dir
            .join(format!(".{}.{TEMP_EXTENSION}", Uuid::new_v4()));

        if let Err(err) = write_record(&temp_path, expires_at, value).await {
            discard_temp(&temp_path).await;
            return Err(err.into());
        }

        let renamed = {
            let _guard = self.stripe(&hash).write().await;
            fs::rename(&temp_path, self.entry_path(&hash)).await
        };
        if let Err(err) = renamed {
            discard_temp(&temp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    pub(crate) async fn remove_expired_at(&self, now: SystemTime) -> Result<usize, StoreError> {
        let mut entries = fs::read_dir(&self.inner.dir).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if let Some(hash) = entry_hash(&name) {
                match self.remove_if_expired(hash, now).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(err) => warn!(
                        target = "routecache::cache::store",
                        op = "store::sweep",
                        result = "error",
                        file = %name,
                        error = %err,
                        "Failed to evict cache entry"
                    ),
                }
            } else if is_temp_file(&name) {
                self.remove_stale_temp(&entry.path(), now).await;
            }
        }

        Ok(removed)
    }

    /// Remove the entry for `hash` if it has expired (or is unreadable).
    /// Holds the stripe write lock for the check and the delete only.
    async fn remove_if_expired(&self, hash: &str, now: SystemTime) -> Result<bool, StoreError> {
        let _guard = self.stripe(hash).write().await;
        let path = self.entry_path(hash);

        let expired = match read_expiry(&path).await {
            Ok(expires_at) => expires_at <= unix_millis(now),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => true,
            Err(err) => return Err(err.into()),
        };
        if !expired {
            return Ok(false);
        }

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_stale_temp(&self, path: &Path, now: SystemTime) {
        let min_age = self.inner.sweep_interval.max(MIN_TEMP_FILE_AGE);
        let stale = match fs::metadata(path).await.and_then(|meta| meta.modified()) {
            Ok(modified) => now
                .duration_since(modified)
                .is_ok_and(|age| age >= min_age),
            Err(_) => false,
        };
        if stale {
            discard_temp(path).await;
        }
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.inner.dir.join(format!("{hash}.{ENTRY_EXTENSION}"))
    }

    fn stripe(&self, hash: &str) -> &RwLock<()> {
        let index = hash
            .get(..2)
            .and_then(|prefix| usize::from_str_radix(prefix, 16).ok())
            .unwrap_or(0);
        &self.inner.stripes[index % self.inner.stripes.len()]
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn get(&self, key: &str) -> Option<Bytes> {
        match self.get_at(key, SystemTime::now()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    target = "routecache::cache::store",
                    op = "store::get",
                    result = "error",
                    key,
                    error = %err,
                    "Cache read failed; treating as miss"
                );
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.set_at(key, &value, ttl, SystemTime::now()).await
    }

    async fn remove_expired(&self) -> Result<usize, StoreError> {
        self.remove_expired_at(SystemTime::now()).await
    }
}

fn spawn_sweeper(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let store = FileStore { inner };

            match store.remove_expired().await {
                Ok(removed) => {
                    histogram!(METRIC_SWEEP_REMOVED).record(removed as f64);
                    debug!(
                        target = "routecache::cache::store",
                        op = "store::sweep",
                        result = "ok",
                        removed,
                        "Cache sweep finished"
                    );
                }
                Err(err) => warn!(
                    target = "routecache::cache::store",
                    op = "store::sweep",
                    result = "error",
                    error = %err,
                    "Cache sweep failed"
                ),
            }
        }
    })
}

async fn probe_writable(dir: &Path) -> Result<(), StoreError> {
    let probe = dir.join(format!(".{}.{TEMP_EXTENSION}", Uuid::new_v4()));
    let location_error = |source| StoreError::Location {
        path: dir.to_path_buf(),
        source,
    };

    fs::write(&probe, b"").await.map_err(location_error)?;
    fs::remove_file(&probe).await.map_err(location_error)?;
    Ok(())
}

async fn write_record(path: &Path, expires_at: u64, value: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(&expires_at.to_be_bytes()).await?;
    file.write_all(value).await?;
    file.flush().await?;
    Ok(())
}

async fn read_expiry(path: &Path) -> io::Result<u64> {
    let mut file = fs::File::open(path).await?;
    let mut prefix = [0u8; EXPIRY_PREFIX_LEN];
    file.read_exact(&mut prefix).await?;
    Ok(u64::from_be_bytes(prefix))
}

async fn discard_temp(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            target = "routecache::cache::store",
            op = "store::discard_temp",
            path = %path.display(),
            error = %err,
            "Failed to remove temporary cache file"
        ),
    }
}

fn parse_expiry(raw: &[u8]) -> Option<u64> {
    let prefix: [u8; EXPIRY_PREFIX_LEN] = raw.get(..EXPIRY_PREFIX_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(prefix))
}

fn entry_hash(file_name: &str) -> Option<&str> {
    let hash = file_name.strip_suffix(ENTRY_EXTENSION)?.strip_suffix('.')?;
    (hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())).then_some(hash)
}

fn is_temp_file(file_name: &str) -> bool {
    file_name.starts_with('.')
        && file_name
            .strip_suffix(TEMP_EXTENSION)
            .is_some_and(|rest| rest.ends_with('.'))
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
