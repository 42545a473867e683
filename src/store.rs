use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt as _;
use sha2::Digest as _;
use tokio::fs;
use tokio::sync::Mutex;

use crate::formats::{LogUpdate, TargetLog};

pub type LogMap = BTreeMap<String, TargetLog>;

/// Stable identifier for an address, used in every file name we write.
pub fn address_key(address: &str) -> String {
    let digest = sha2::Sha256::digest(address.as_bytes());
    hex::encode(digest)
}

/// Append-only store of fetched content, one file per successful fetch.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write(
        &self,
        address: &str,
        content: &str,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("create archive dir: {}", self.root.display()))?;

        let stem = format!(
            "{}_{}",
            address_key(address),
            fetched_at.format("%Y%m%d-%H%M%S%.3f")
        );
        for suffix in 0_u32.. {
            let name = match suffix {
                0 => format!("{stem}.html"),
                n => format!("{stem}-{n}.html"),
            };
            let path = self.root.join(name);
            match write_new(&path, content).await {
                Ok(()) => return Ok(path),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("write archive artifact: {}", path.display()));
                }
            }
        }
        anyhow::bail!("archive name space exhausted for {address}")
    }
}

async fn write_new(path: &Path, content: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt as _;

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self, address: &str) -> anyhow::Result<Option<String>>;
    async fn store(&self, address: &str, content: &str) -> anyhow::Result<()>;
    async fn remove(&self, address: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LocalFsSnapshotStore {
    root: PathBuf,
}

impl LocalFsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn snapshot_path(&self, address: &str) -> PathBuf {
        self.root.join(format!("{}_snapshot.html", address_key(address)))
    }
}

#[async_trait]
impl SnapshotStore for LocalFsSnapshotStore {
    async fn load(&self, address: &str) -> anyhow::Result<Option<String>> {
        let path = self.snapshot_path(address);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read snapshot: {}", path.display())),
        }
    }

    async fn store(&self, address: &str, content: &str) -> anyhow::Result<()> {
        write_atomic(&self.snapshot_path(address), content.as_bytes())
            .await
            .context("write snapshot")
    }

    async fn remove(&self, address: &str) -> anyhow::Result<()> {
        let path = self.snapshot_path(address);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove snapshot: {}", path.display())),
        }
    }
}

/// Per-target running log shared by every run.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn load_log(&self) -> anyhow::Result<LogMap>;
    async fn save_log(&self, log: &LogMap) -> anyhow::Result<()>;
    /// Applies `update` to one entry atomically with respect to other callers
    /// of the same store and returns the new entry.
    async fn upsert(&self, address: &str, update: &LogUpdate) -> anyhow::Result<TargetLog>;
}

/// JSON file backed log. Read-modify-write cycles hold the in-process lock
/// and an exclusive advisory lock on `<log>.lock`, so concurrent runs never
/// lose updates whether they share this store, another store on the same
/// path, or another process. Readers rely on the atomic rename instead.
#[derive(Debug)]
pub struct LocalFsLogStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl LocalFsLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn lock_file(&self) -> anyhow::Result<FileLock> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create log dir: {}", parent.display()))?;
        }
        tokio::task::spawn_blocking(move || -> anyhow::Result<FileLock> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&lock_path)
                .with_context(|| format!("open log lock: {}", lock_path.display()))?;
            file.lock_exclusive()
                .with_context(|| format!("lock log: {}", lock_path.display()))?;
            Ok(FileLock(file))
        })
        .await
        .context("join log lock task")?
    }

    async fn read(&self) -> anyhow::Result<LogMap> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(LogMap::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read log: {}", self.path.display()));
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(LogMap::new());
        }
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parse log: {}", self.path.display()))
    }

    async fn write(&self, log: &LogMap) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(log).context("serialize log")?;
        write_atomic(&self.path, &data).await.context("write log")
    }
}

#[async_trait]
impl LogStore for LocalFsLogStore {
    async fn load_log(&self) -> anyhow::Result<LogMap> {
        let _guard = self.writer.lock().await;
        self.read().await
    }

    async fn save_log(&self, log: &LogMap) -> anyhow::Result<()> {
        let _guard = self.writer.lock().await;
        let _file_lock = self.lock_file().await?;
        self.write(log).await
    }

    async fn upsert(&self, address: &str, update: &LogUpdate) -> anyhow::Result<TargetLog> {
        let _guard = self.writer.lock().await;
        let _file_lock = self.lock_file().await?;
        let mut log = self.read().await?;
        let entry = log.entry(address.to_owned()).or_default();
        entry.apply(update);
        let entry = entry.clone();
        self.write(&log).await?;
        Ok(entry)
    }
}

/// Held for the duration of a log write; released on drop.
struct FileLock(std::fs::File);

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.0) {
            tracing::warn!(?err, "failed to release log lock");
        }
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn address_key_is_deterministic() {
        let a = address_key("http://abc.onion");
        assert_eq!(a, address_key("http://abc.onion"));
        assert_ne!(a, address_key("http://abd.onion"));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn snapshot_round_trip_and_replace() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsSnapshotStore::new(temp.path().join("snapshots"));

        assert_eq!(store.load("abc.onion").await?, None);
        store.store("abc.onion", "first").await?;
        store.store("abc.onion", "second").await?;
        assert_eq!(store.load("abc.onion").await?.as_deref(), Some("second"));

        let path = store.snapshot_path("abc.onion");
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert_eq!(name, format!("{}_snapshot.html", address_key("abc.onion")));

        store.remove("abc.onion").await?;
        assert_eq!(store.load("abc.onion").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn archive_never_overwrites() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let archive = ArchiveStore::new(temp.path().join("archive"));
        let at = Utc::now();

        let first = archive.write("abc.onion", "one", at).await?;
        let second = archive.write("abc.onion", "two", at).await?;
        assert_ne!(first, second);
        assert_eq!(std::fs::read_to_string(&first)?, "one");
        assert_eq!(std::fs::read_to_string(&second)?, "two");

        let name = first.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with(&format!("{}_", address_key("abc.onion"))));
        assert!(name.ends_with(".html"));
        Ok(())
    }

    #[tokio::test]
    async fn log_upserts_accumulate() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsLogStore::new(temp.path().join("monitor_log.json"));
        let found: BTreeSet<String> = ["breach".to_owned()].into();
        let update = LogUpdate {
            has_changes: true,
            found_keywords: Some(found.clone()),
        };

        store.upsert("a", &update).await?;
        let entry = store.upsert("a", &update).await?;
        assert_eq!(entry.changes_count, 2);
        assert_eq!(entry.keywords_count, 2);
        assert_eq!(entry.last_keywords, found);

        let log = store.load_log().await?;
        assert_eq!(log.get("a"), Some(&entry));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_for_different_targets_are_not_lost() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = Arc::new(LocalFsLogStore::new(temp.path().join("monitor_log.json")));
        let update = LogUpdate {
            has_changes: true,
            found_keywords: None,
        };

        let mut tasks = tokio::task::JoinSet::new();
        for target in 0..8 {
            for _ in 0..5 {
                let store = Arc::clone(&store);
                let update = update.clone();
                tasks.spawn(async move { store.upsert(&format!("t{target}"), &update).await });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let log = store.load_log().await?;
        assert_eq!(log.len(), 8);
        assert!(log.values().all(|entry| entry.changes_count == 5));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_stores_on_one_path_do_not_lose_updates() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("monitor_log.json");
        let update = LogUpdate {
            has_changes: true,
            found_keywords: None,
        };

        let mut tasks = tokio::task::JoinSet::new();
        for target in 0..8 {
            let store = Arc::new(LocalFsLogStore::new(&path));
            for _ in 0..5 {
                let store = Arc::clone(&store);
                let update = update.clone();
                tasks.spawn(async move { store.upsert(&format!("t{target}"), &update).await });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let log = LocalFsLogStore::new(&path).load_log().await?;
        assert_eq!(log.len(), 8);
        let total: u64 = log.values().map(|entry| entry.changes_count).sum();
        assert_eq!(total, 40);
        assert!(temp.path().join("monitor_log.json.lock").exists());
        Ok(())
    }

    #[tokio::test]
    async fn save_log_replaces_whole_map() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsLogStore::new(temp.path().join("monitor_log.json"));
        let mut log = LogMap::new();
        log.insert(
            "x".to_owned(),
            TargetLog {
                changes_count: 3,
                ..TargetLog::default()
            },
        );
        store.save_log(&log).await?;
        assert_eq!(store.load_log().await?, log);
        Ok(())
    }
}
