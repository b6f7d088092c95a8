//! Snapshot cache coordinator (spec §4.8): disk-backed, mode-gated,
//! corruption-tolerant, with both an in-process and a cross-process
//! single-flight discipline.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

use fsg_context::PackageId;

use crate::error::{Error, Result};
use crate::logger::SnapshotLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Lazy,
    Ensure,
    Rebuild,
    None,
}

impl std::str::FromStr for CacheMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "lazy" => Ok(CacheMode::Lazy),
            "ensure" => Ok(CacheMode::Ensure),
            "rebuild" => Ok(CacheMode::Rebuild),
            "none" => Ok(CacheMode::None),
            other => Err(Error::VersionUnknown(format!("unknown cache mode '{other}'"))),
        }
    }
}

const STALE_AFTER_MS: i64 = 3 * 60 * 1000;
const POLL_INTERVAL_MS: u64 = 100;
const WAIT_BUDGET_MS: u64 = STALE_AFTER_MS as u64 + 10_000;

fn local_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

fn process_is_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{pid}")).exists()
    } else {
        true
    }
}

/// Coordinates on-disk snapshot caching for one engine instance. Cheaply
/// clonable; the in-process single-flight map is a module-global static so
/// every coordinator in the process shares it (spec §5).
#[derive(Clone)]
pub struct SnapshotCache {
    cache_root: PathBuf,
    mode: CacheMode,
}

fn engine_minor_version() -> &'static str {
    static VERSION: OnceLock<String> = OnceLock::new();
    VERSION.get_or_init(|| {
        let parsed = semver::Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version is valid semver");
        format!("v{}.{}.x", parsed.major, parsed.minor)
    })
}

impl SnapshotCache {
    pub fn new(cache_root: PathBuf, mode: CacheMode) -> Self {
        Self { cache_root, mode }
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    fn snapshot_dir(&self, package: &PackageId) -> PathBuf {
        self.cache_root
            .join(format!("{}#{}", package.id, package.version))
            .join(".fsg.snapshots")
            .join(engine_minor_version())
    }

    pub fn snapshot_path(&self, package: &PackageId, filename: &str) -> PathBuf {
        self.snapshot_dir(package).join(filename)
    }

    /// `get_snapshot` for a profile: mode-gated read/generate/write.
    pub async fn get_or_generate<F, Fut>(&self, package: &PackageId, filename: &str, generate: F) -> Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if self.mode == CacheMode::None {
            return generate().await;
        }

        let path = self.snapshot_path(package, filename);
        if let Some(cached) = read_cached(&path).await? {
            return Ok(cached);
        }

        let single_flight_key = format!("{package}/{filename}");
        let path_for_lock = path.clone();
        single_flight(single_flight_key, async move {
            if let Some(cached) = read_cached(&path_for_lock).await? {
                return Ok(cached);
            }
            let guard = match acquire_lock(&path_for_lock).await? {
                Some(guard) => guard,
                None => {
                    return read_cached(&path_for_lock).await?.ok_or_else(|| {
                        Error::Lock(format!(
                            "lock on {} was released without a cache file appearing",
                            path_for_lock.display()
                        ))
                    });
                }
            };
            let result = generate().await;
            if let Ok(value) = &result {
                write_cached(&path_for_lock, value).await?;
            }
            guard.release().await;
            result
        })
        .await
    }

    /// The `create()` pre-caching pass (spec §4.8's `create()` column).
    /// Never aborts on the first failure; accumulates per-file errors and
    /// logs a single summary at the end.
    pub async fn precache_context<F, Fut>(
        &self,
        explorer: &dyn fsg_context::PackageExplorer,
        packages: &[PackageId],
        generate: F,
        logger: &dyn SnapshotLogger,
    ) -> Vec<(String, Error)>
    where
        F: Fn(PackageId, String) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let mut errors = Vec::new();

        match self.mode {
            CacheMode::Lazy | CacheMode::None => return errors,
            CacheMode::Rebuild => {
                for package in packages {
                    let _ = tokio::fs::remove_dir_all(self.snapshot_dir(package)).await;
                }
            }
            CacheMode::Ensure => {}
        }

        for package in packages {
            let profiles = match explorer.list_profiles(package).await {
                Ok(p) => p,
                Err(e) => {
                    errors.push((package.to_string(), Error::Context(e)));
                    continue;
                }
            };

            for sd in profiles {
                let filename = format!(
                    "StructureDefinition-{}.json",
                    sd.id.clone().unwrap_or_else(|| sd.name.clone())
                );
                let path = self.snapshot_path(package, &filename);
                match read_cached(&path).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => {
                        errors.push((filename, e));
                        continue;
                    }
                }
                match generate(package.clone(), sd.url.clone()).await {
                    Ok(value) => {
                        if let Err(e) = write_cached(&path, &value).await {
                            errors.push((filename, e));
                        }
                    }
                    Err(e) => errors.push((filename, e)),
                }
            }
        }

        if !errors.is_empty() {
            logger.warn(&format!("precache: {} of the attempted files failed to generate or cache", errors.len()));
        }
        errors
    }
}

/// Treats empty files and syntactically-invalid JSON as a cache miss,
/// best-effort deleting the offending file; non-parse IO errors propagate.
async fn read_cached(path: &Path) -> Result<Option<Value>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::CacheIo(e)),
    };

    if std::str::from_utf8(&bytes).unwrap_or("").trim().is_empty() {
        let _ = tokio::fs::remove_file(path).await;
        return Ok(None);
    }

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_syntax() || e.is_eof() => {
            let _ = tokio::fs::remove_file(path).await;
            Ok(None)
        }
        Err(e) => Err(Error::CacheJson(e)),
    }
}

/// Write into a sibling temp file, then move onto the final name with
/// create-only semantics; "already exists" is treated as a win for whoever
/// got there first.
async fn write_cached(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot");
    let pid = std::process::id();
    let epoch_ms = chrono_now_ms();
    let random_hex = format!("{:x}", uuid::Uuid::new_v4().as_u128() & 0xffff_ffff_ffff);
    let tmp_path = path.with_file_name(format!("{file_name}.{pid}.{epoch_ms}.{random_hex}.tmp"));

    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp_path, &body).await.map_err(Error::CacheIo)?;

    let result = tokio::fs::hard_link(&tmp_path, path).await;
    let _ = tokio::fs::remove_file(&tmp_path).await;
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::CacheIo(e)),
    }
}

fn chrono_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockContents {
    pid: u32,
    timestamp_ms: i64,
    hostname: String,
}

fn lock_path(cache_file: &Path) -> PathBuf {
    let file_name = cache_file.file_name().and_then(|n| n.to_str()).unwrap_or("snapshot");
    cache_file.with_file_name(format!("{file_name}.lock"))
}

fn is_stale(lock: &LockContents, now_ms: i64) -> bool {
    let age = now_ms - lock.timestamp_ms;
    age > STALE_AFTER_MS || (lock.hostname == local_hostname() && !process_is_alive(lock.pid))
}

struct LockGuard {
    path: PathBuf,
    mine: LockContents,
}

impl LockGuard {
    async fn release(self) {
        if let Ok(bytes) = tokio::fs::read(&self.path).await {
            if let Ok(current) = serde_json::from_slice::<LockContents>(&bytes) {
                if current.pid == self.mine.pid
                    && current.hostname == self.mine.hostname
                    && current.timestamp_ms == self.mine.timestamp_ms
                {
                    let _ = tokio::fs::remove_file(&self.path).await;
                }
            }
        }
    }
}

/// Acquire the cross-process lock for `cache_file`. Returns `Ok(None)` if,
/// while waiting, the cache file itself appeared (meaning another writer
/// finished first and the caller should just read it).
async fn acquire_lock(cache_file: &Path) -> Result<Option<LockGuard>> {
    let lock_file = lock_path(cache_file);
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(WAIT_BUDGET_MS);

    loop {
        let now_ms = chrono_now_ms();
        let existing = tokio::fs::read(&lock_file)
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockContents>(&bytes).ok());

        let can_attempt = match &existing {
            None => true,
            Some(lock) => is_stale(lock, now_ms),
        };

        if can_attempt {
            let mine = LockContents {
                pid: std::process::id(),
                timestamp_ms: now_ms,
                hostname: local_hostname().to_string(),
            };
            if try_create_lock(&lock_file, &mine).await? {
                return Ok(Some(LockGuard { path: lock_file, mine }));
            }
        }

        if tokio::fs::try_exists(cache_file).await.unwrap_or(false) {
            return Ok(None);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Lock(format!("timed out waiting for lock on {}", cache_file.display())));
        }
        tokio::time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

async fn try_create_lock(lock_file: &Path, contents: &LockContents) -> Result<bool> {
    let tmp_name = format!(
        "{}.{}.tmp",
        lock_file.file_name().and_then(|n| n.to_str()).unwrap_or("lock"),
        uuid::Uuid::new_v4()
    );
    let tmp_path = lock_file.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, serde_json::to_vec(contents)?).await.map_err(Error::CacheIo)?;

    let result = tokio::fs::hard_link(&tmp_path, lock_file).await;
    let _ = tokio::fs::remove_file(&tmp_path).await;
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(Error::CacheIo(e)),
    }
}

type InFlightMap = AsyncMutex<HashMap<String, Arc<OnceCell<std::result::Result<Value, String>>>>>;

fn inflight_map() -> &'static InFlightMap {
    static MAP: OnceLock<InFlightMap> = OnceLock::new();
    MAP.get_or_init(|| AsyncMutex::new(HashMap::new()))
}

/// In-process single-flight: concurrent callers for the same key await the
/// first caller's result rather than generating independently.
async fn single_flight<Fut>(key: String, fut: Fut) -> Result<Value>
where
    Fut: Future<Output = Result<Value>>,
{
    let cell = {
        let mut map = inflight_map().lock().await;
        map.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    };

    let result = cell.get_or_init(|| async { fut.await.map_err(|e| e.to_string()) }).await.clone();

    inflight_map().lock().await.remove(&key);

    result.map_err(Error::Generation)
}
