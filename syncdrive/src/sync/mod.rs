use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use filetime::FileTime;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use crate::{
    config::Config,
    index::{Entry, FileMeta, FileStatus, Index, SharedIndex},
    peer::{PeerError, PeerManager},
};

mod diff;

pub use diff::{diff, FetchFile, SyncPlan};

#[derive(thiserror::Error, Debug)]
pub enum SyncError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("worker task failed: {0}")]
    Worker(String),

}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Worker(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
pub type SyncTx = mpsc::UnboundedSender<RemoteIndex>;
pub type SyncRx = mpsc::UnboundedReceiver<RemoteIndex>;

// A peer's index as received by the server or an exchange, queued for
// reconciliation.
#[derive(Debug)]
pub struct RemoteIndex {
    pub ip: IpAddr,
    pub index: Index,
}

enum FetchMode {
    // Fresh placeholder of the advertised size.
    New,
    // Existing file renamed aside; unchanged blocks are kept.
    Modified,
}

// Turns a remote index into directories, placeholders and block
// fetches. Download concurrency is bounded per file, blocks within a
// file are sequential.
#[derive(Debug)]
pub struct Synchronizer {

    index: SharedIndex,

    peers: Arc<PeerManager>,

    working_dir: PathBuf,

    // One permit per file downloading.
    slots: Semaphore,

}

impl Synchronizer {

    pub fn new(cfg: &Config, index: SharedIndex, peers: Arc<PeerManager>) -> Arc<Self> {
        Arc::new(Synchronizer {
            index,
            peers,
            working_dir: cfg.working_dir.clone(),
            slots: Semaphore::new(cfg.concurrent_downloads),
        })
    }

    #[tracing::instrument(name = "sync", skip(self, remote), fields(peer = %ip))]
    pub async fn reconcile(self: Arc<Self>, ip: IpAddr, remote: Index) {

        let local = self.index.snapshot().await;
        let plan = diff(&remote, &local);
        if plan.is_empty() {
            tracing::trace!("in sync, nothing to do");
            return;
        }
        tracing::info!(
            "{} new folders, {} new files, {} modified files",
            plan.new_dirs.len(),
            plan.new_files.len(),
            plan.modified.len(),
        );

        // Folders first, parents before children.
        for dir in &plan.new_dirs {
            if !crate::valid_key(dir) {
                tracing::warn!("refusing to create {}", dir);
                continue;
            }
            if let Err(e) = tokio::fs::create_dir_all(crate::resolve(&self.working_dir, dir)).await {
                tracing::warn!("cannot create {}: {}", dir, e);
                continue;
            }
            self.index.insert(dir.clone(), Entry::Directory).await;
        }

        let mut fetches = JoinSet::new();
        for file in plan.new_files {
            let sync = Arc::clone(&self);
            fetches.spawn(async move { sync.fetch_file(ip, file, FetchMode::New).await });
        }
        for file in plan.modified {
            let sync = Arc::clone(&self);
            fetches.spawn(async move { sync.fetch_file(ip, file, FetchMode::Modified).await });
        }
        while let Some(res) = fetches.join_next().await {
            if let Err(e) = res {
                tracing::error!("fetch task panicked: {}", e);
            }
        }
    }

    async fn fetch_file(&self, ip: IpAddr, file: FetchFile, mode: FetchMode) {

        let _permit = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if let Err(e) = self.try_fetch(ip, &file, mode).await {
            tracing::warn!("transfer of {} from {} failed: {}", file.path, ip, e);
            // Drop the entry so a later exchange rediscovers the file.
            // The leftover partial is swept at the next startup.
            self.index.remove(&file.path).await;
        }
    }

    async fn try_fetch(&self, ip: IpAddr, file: &FetchFile, mode: FetchMode) -> Result<()> {

        if !crate::valid_key(&file.path) {
            tracing::warn!("refusing to fetch {}", file.path);
            return Ok(());
        }
        let target = crate::resolve(&self.working_dir, &file.path);
        let partial = crate::resolve_partial(&self.working_dir, &file.path);

        match mode {

            FetchMode::New => {
                // Another exchange is already writing this file.
                if self.index.status(&file.path).await == Some(FileStatus::Writing) {
                    return Ok(());
                }
                let partial = partial.clone();
                let size = file.meta.size;
                tokio::task::spawn_blocking(move || allocate_placeholder(&partial, size))
                    .await??;
            }

            FetchMode::Modified => {
                if self.index.status(&file.path).await == Some(FileStatus::Writing) {
                    return Ok(());
                }
                if file.blocks.is_empty() {
                    // Same content under a newer stamp; adopt the stamp.
                    set_modified(&target, file.meta.modified)?;
                    let modified = disk_mtime(&target)?;
                    self.index
                        .update_file(&file.path, |meta| meta.modified = modified)
                        .await;
                    return Ok(());
                }
                tokio::fs::rename(&target, &partial).await?;
            }
        }

        self.index
            .insert(
                file.path.clone(),
                Entry::File(FileMeta {
                    size: file.meta.size,
                    modified: file.meta.modified,
                    status: FileStatus::Writing,
                    blocks: file.meta.blocks.clone(),
                }),
            )
            .await;

        // All blocks of one file come from the advertising peer, in order.
        for block in &file.blocks {
            self.peers.request_file(ip, &file.path, *block).await?;
        }

        tokio::fs::rename(&partial, &target).await?;
        set_modified(&target, file.meta.modified)?;

        // Index the stamp actually on disk so the scanner stays quiet.
        let modified = disk_mtime(&target)?;
        self.index
            .update_file(&file.path, |meta| {
                meta.status = FileStatus::Added;
                meta.modified = modified;
            })
            .await;
        tracing::info!("synced {} from {}", file.path, ip);
        Ok(())
    }
}

// Pre-sized placeholder; sparse where the platform supports it.
fn allocate_placeholder(path: &Path, size: u64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)
}

fn set_modified(path: &Path, modified: f64) -> std::io::Result<()> {
    let secs = modified as i64;
    let nanos = ((modified - secs as f64) * 1e9) as u32;
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, nanos))
}

fn disk_mtime(path: &Path) -> std::io::Result<f64> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_allocation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sub/dir/file.bin.dl_partial");

        allocate_placeholder(&path, 1024)?;
        assert_eq!(std::fs::metadata(&path)?.len(), 1024);

        // Re-allocation truncates back to the advertised size.
        allocate_placeholder(&path, 16)?;
        assert_eq!(std::fs::metadata(&path)?.len(), 16);
        Ok(())
    }

    #[test]
    fn test_set_modified_round_trips_through_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stamp");
        std::fs::File::create(&path)?;

        let stamp = 1700000000.25;
        set_modified(&path, stamp)?;
        let on_disk = disk_mtime(&path)?;
        assert!((on_disk - stamp).abs() < 1e-3, "mtime drifted: {}", on_disk);
        Ok(())
    }

    #[test]
    fn test_key_validation() {
        assert!(crate::valid_key("docs/notes.txt"));
        assert!(!crate::valid_key(""));
        assert!(!crate::valid_key("../outside"));
        assert!(!crate::valid_key("docs/../../outside"));
        assert!(!crate::valid_key("/etc/passwd"));
    }
}
