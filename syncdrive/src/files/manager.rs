use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use crate::{
    config::Config,
    index::{Entry, FileMeta, FileStatus, SharedIndex},
    PARTIAL_SUFFIX,
};
use super::{hash, ChangeKind, ChangeTx, ChangedItem, Result};

// Owns the working directory: builds the index with an initial recursive
// scan, then watches for changes on a fixed period. Block hashing is
// dispatched to the blocking worker pool and never awaited here.
#[derive(Debug, Clone)]
pub struct FileManager {

    working_dir: PathBuf,

    block_size: u64,

    scan_interval: Duration,

    index: SharedIndex,

    // Receives the changed-items list of every scanner pass that found
    // something.
    change_tx: ChangeTx,

}

impl FileManager {

    pub fn new(cfg: &Config, index: SharedIndex, change_tx: ChangeTx) -> Self {
        FileManager {
            working_dir: cfg.working_dir.clone(),
            block_size: cfg.block_size,
            scan_interval: cfg.scan_interval,
            index,
            change_tx,
        }
    }

    // Prepares the working directory and blocks until the structural part
    // of the initial scan completes. Hashing continues in the background.
    pub async fn run(&self) -> Result<()> {
        self.prepare_working_dir()?;
        self.initial_scan().await;
        tracing::info!("file watcher started on {:?}", self.working_dir);
        Ok(())
    }

    // Creates the directory if absent and sweeps partial downloads left
    // over from a previous run.
    fn prepare_working_dir(&self) -> Result<()> {

        if !self.working_dir.exists() {
            std::fs::create_dir_all(&self.working_dir)?;
            tracing::info!("created working directory {:?}", self.working_dir);
        } else if !self.working_dir.is_dir() {
            return Err(super::FileError::NotADirectory(
                self.working_dir.to_string_lossy().into_owned(),
            ));
        }

        for entry in WalkDir::new(&self.working_dir).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("startup sweep: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_partial(entry.file_name()) {
                tracing::info!("removing leftover partial {:?}", entry.path());
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!("cannot remove {:?}: {}", entry.path(), e);
                }
            }
        }

        Ok(())
    }

    async fn initial_scan(&self) {
        for entry in walk(&self.working_dir) {

            let path = match self.entry_key(&entry) {
                Some(path) => path,
                None => continue,
            };
            if entry.file_type().is_dir() {
                self.index.insert(path, Entry::Directory).await;

            } else if entry.file_type().is_file() {
                let (size, modified) = match stat(&entry) {
                    Some(meta) => meta,
                    None => continue,
                };
                self.index
                    .insert(
                        path.clone(),
                        Entry::File(FileMeta {
                            size,
                            modified,
                            status: FileStatus::Hashing,
                            blocks: Vec::new(),
                        }),
                    )
                    .await;
                self.schedule_hash(path, size);
            }
        }
    }

    // Spawns the periodic change scanner. Runs until cancelled.
    pub fn spawn_scanner(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(mgr.scan_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => mgr.scan_pass().await,
                }
            }
            tracing::info!("scanner stopped");
        })
    }

    // One pass over the working directory, comparing disk state against
    // the index. Emits the changed-items list if anything was found.
    async fn scan_pass(&self) {

        let mut changed = Vec::new();
        for entry in walk(&self.working_dir) {

            let path = match self.entry_key(&entry) {
                Some(path) => path,
                None => continue,
            };
            match self.index.get(&path).await {

                None => {
                    tracing::info!("found new item: {}", path);
                    if entry.file_type().is_file() {
                        let (size, modified) = match stat(&entry) {
                            Some(meta) => meta,
                            None => continue,
                        };
                        self.index
                            .insert(
                                path.clone(),
                                Entry::File(FileMeta {
                                    size,
                                    modified,
                                    status: FileStatus::Hashing,
                                    blocks: Vec::new(),
                                }),
                            )
                            .await;
                        self.schedule_hash(path.clone(), size);
                        changed.push(ChangedItem { path, kind: ChangeKind::New, is_file: true });
                    } else if entry.file_type().is_dir() {
                        self.index.insert(path.clone(), Entry::Directory).await;
                        changed.push(ChangedItem { path, kind: ChangeKind::New, is_file: false });
                    }
                }

                Some(Entry::File(meta)) if meta.status != FileStatus::Writing => {
                    let (size, modified) = match stat(&entry) {
                        Some(meta) => meta,
                        None => continue,
                    };
                    if modified > meta.modified || size != meta.size {
                        tracing::info!("found modified item: {}", path);
                        self.index
                            .update_file(&path, |meta| {
                                meta.size = size;
                                meta.modified = modified;
                                meta.status = FileStatus::Hashing;
                            })
                            .await;
                        self.schedule_hash(path.clone(), size);
                        changed.push(ChangedItem { path, kind: ChangeKind::Modified, is_file: true });
                    }
                }

                // Directories only ever exist; writes are suppressed.
                Some(_) => {}
            }
        }

        if !changed.is_empty() {
            self.change_tx.send(changed).ok();
        }
    }

    fn schedule_hash(&self, path: String, size: u64) {
        let index = self.index.clone();
        let block_size = self.block_size;
        let file = crate::resolve(&self.working_dir, &path);
        tokio::spawn(hash::hash_file(index, path, file, size, block_size));
    }

    // Index key: the path relative to the working directory, identical
    // on every peer regardless of where the tree lives locally.
    fn entry_key(&self, entry: &walkdir::DirEntry) -> Option<String> {
        match entry.path().strip_prefix(&self.working_dir) {
            Ok(rel) => Some(rel.to_string_lossy().into_owned()),
            Err(_) => None,
        }
    }
}

// Hidden files and in-progress downloads are invisible to the engine.
fn is_excluded(name: &OsStr) -> bool {
    match name.to_str() {
        Some(name) => name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX),
        // Paths the OS can't render as UTF-8 can't be keyed consistently
        // across peers either.
        None => true,
    }
}

fn is_partial(name: &OsStr) -> bool {
    matches!(name.to_str(), Some(name) if name.ends_with(PARTIAL_SUFFIX))
}

// Recursive traversal with hidden and partial paths pruned. Errors on
// individual entries are logged and skipped so one bad entry never stops
// a scan.
fn walk(dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.file_name()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("scan error: {}", e);
                None
            }
        })
}

fn stat(entry: &walkdir::DirEntry) -> Option<(u64, f64)> {
    match entry.metadata() {
        Ok(meta) => {
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Some((meta.len(), modified))
        }
        Err(e) => {
            tracing::warn!("cannot stat {:?}: {}", entry.path(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn config_for(dir: &Path) -> Config {
        Config {
            working_dir: dir.to_path_buf(),
            block_size: 4,
            scan_interval: Duration::from_millis(20),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_initial_scan_builds_index() -> anyhow::Result<()> {

        let dir = tempfile::tempdir()?;
        let root = dir.path().join("share");
        std::fs::create_dir_all(root.join("docs"))?;
        std::fs::File::create(root.join("hello.txt"))?.write_all(b"hello")?;
        std::fs::File::create(root.join(".hidden"))?.write_all(b"x")?;
        std::fs::File::create(root.join("stale.dl_partial"))?.write_all(b"x")?;

        let index = SharedIndex::new();
        let (change_tx, _change_rx) = mpsc::unbounded_channel();
        let mgr = FileManager::new(&config_for(&root), index.clone(), change_tx);
        mgr.run().await?;

        // Leftover partials are swept at startup.
        assert!(!root.join("stale.dl_partial").exists());

        assert_eq!(index.get("docs").await, Some(Entry::Directory));
        index.await_hashed("hello.txt").await;

        let entry = index.get("hello.txt").await.unwrap();
        let meta = entry.as_file().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.status, FileStatus::Added);
        assert_eq!(meta.blocks.len(), 2);

        // Hidden files never enter the index.
        assert!(index.get(".hidden").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_scanner_reports_new_and_modified() -> anyhow::Result<()> {

        let dir = tempfile::tempdir()?;
        let root = dir.path().join("share");
        std::fs::create_dir_all(&root)?;

        let index = SharedIndex::new();
        let (change_tx, mut change_rx) = mpsc::unbounded_channel();
        let mgr = FileManager::new(&config_for(&root), index.clone(), change_tx);
        mgr.run().await?;
        let shutdown = CancellationToken::new();
        let scanner = mgr.spawn_scanner(shutdown.clone());

        let path = root.join("new.txt");
        std::fs::File::create(&path)?.write_all(b"abcd")?;

        let changed = tokio::time::timeout(Duration::from_secs(5), change_rx.recv())
            .await?
            .expect("scanner dropped");
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].kind, ChangeKind::New);
        assert_eq!(changed[0].path, "new.txt");

        let key = "new.txt";
        index.await_hashed(key).await;

        // Grow the file; the size change alone is enough to re-index.
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(b"efgh")?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(entry) = index.get(key).await {
                let meta = entry.as_file().unwrap();
                if meta.size == 8 && meta.status == FileStatus::Added {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "modification never indexed");
            time::sleep(Duration::from_millis(20)).await;
        }

        let mut saw_modified = false;
        while let Ok(changed) = change_rx.try_recv() {
            saw_modified |= changed.iter().any(|item| item.kind == ChangeKind::Modified);
        }
        assert!(saw_modified, "no modified event emitted");

        shutdown.cancel();
        scanner.await?;
        Ok(())
    }
}
