use std::{collections::HashMap, sync::Arc};
use tokio::{sync::RwLock, time};

// MD5 digest of one file block.
pub type BlockDigest = [u8; 16];

// How often await_hashed re-checks the entry status.
const HASH_POLL_INTERVAL: time::Duration = time::Duration::from_millis(100);

// Lifecycle of a file entry.
//
// Added   - stable, all block digests present.
// Hashing - digests being computed; the entry is not advertised to peers.
// Writing - blocks being received; local change detection is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Hashing,
    Writing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {

    // Size in bytes.
    pub size: u64,

    // Seconds since the epoch, sub-second precision preserved.
    pub modified: f64,

    pub status: FileStatus,

    // One slot per block, in block order. A None means the block could
    // not be read while hashing; it compares unequal to any digest.
    pub blocks: Vec<Option<BlockDigest>>,

}

// One record in the file index. Directories carry no attributes,
// presence alone is the semantic.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Directory,
    File(FileMeta),
}

impl Entry {

    pub fn is_file(&self) -> bool {
        matches!(self, Entry::File(_))
    }

    pub fn as_file(&self) -> Option<&FileMeta> {
        match self {
            Entry::File(meta) => Some(meta),
            Entry::Directory => None,
        }
    }

    // Whether the entry may be advertised to peers. Directories always;
    // files only once their digests are complete.
    fn is_shareable(&self) -> bool {
        match self {
            Entry::Directory => true,
            Entry::File(meta) => meta.status == FileStatus::Added,
        }
    }
}

// Mapping from path (the scanner's traversal output) to entry.
pub type Index = HashMap<String, Entry>;

// The file index, shared between the scanner, the hash workers, the
// synchronizer and the inbound request handlers.
#[derive(Debug, Clone, Default)]
pub struct SharedIndex {
    inner: Arc<RwLock<Index>>,
}

impl SharedIndex {

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, path: &str) -> Option<Entry> {
        self.inner.read().await.get(path).cloned()
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.inner.read().await.contains_key(path)
    }

    pub async fn insert(&self, path: String, entry: Entry) {
        self.inner.write().await.insert(path, entry);
    }

    pub async fn remove(&self, path: &str) {
        self.inner.write().await.remove(path);
    }

    // Applies a mutation to a file entry. Returns false if the path is
    // absent or a directory.
    pub async fn update_file<F>(&self, path: &str, f: F) -> bool
    where
        F: FnOnce(&mut FileMeta),
    {
        match self.inner.write().await.get_mut(path) {
            Some(Entry::File(meta)) => {
                f(meta);
                true
            }
            _ => false,
        }
    }

    pub async fn status(&self, path: &str) -> Option<FileStatus> {
        match self.inner.read().await.get(path) {
            Some(Entry::File(meta)) => Some(meta.status),
            _ => None,
        }
    }

    // Full copy, including entries still hashing or being written.
    pub async fn snapshot(&self) -> Index {
        self.inner.read().await.clone()
    }

    // Copy of the entries fit to send to peers.
    pub async fn shared_snapshot(&self) -> Index {
        self.inner
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_shareable())
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect()
    }

    // Shareable entries restricted to the given paths.
    pub async fn shared_snapshot_of<'a, I>(&self, paths: I) -> Index
    where
        I: IntoIterator<Item = &'a str>,
    {
        let guard = self.inner.read().await;
        paths
            .into_iter()
            .filter_map(|path| {
                guard
                    .get(path)
                    .filter(|entry| entry.is_shareable())
                    .map(|entry| (path.to_owned(), entry.clone()))
            })
            .collect()
    }

    // Suspends until the entry is no longer hashing. Returns immediately
    // for directories and absent paths.
    pub async fn await_hashed(&self, path: &str) {
        while self.status(path).await == Some(FileStatus::Hashing) {
            time::sleep(HASH_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(status: FileStatus) -> Entry {
        Entry::File(FileMeta {
            size: 10,
            modified: 1000.0,
            status,
            blocks: vec![Some([0xab; 16])],
        })
    }

    #[tokio::test]
    async fn test_shared_snapshot_hides_unstable_entries() {
        let index = SharedIndex::new();
        index.insert("share/dir".into(), Entry::Directory).await;
        index.insert("share/a".into(), file(FileStatus::Added)).await;
        index.insert("share/b".into(), file(FileStatus::Hashing)).await;
        index.insert("share/c".into(), file(FileStatus::Writing)).await;

        let shared = index.shared_snapshot().await;
        assert_eq!(shared.len(), 2);
        assert!(shared.contains_key("share/dir"));
        assert!(shared.contains_key("share/a"));

        let subset = index
            .shared_snapshot_of(["share/a", "share/b", "share/missing"])
            .await;
        assert_eq!(subset.len(), 1);
        assert!(subset.contains_key("share/a"));
    }

    #[tokio::test]
    async fn test_await_hashed_returns_once_status_flips() {
        let index = SharedIndex::new();
        index.insert("share/a".into(), file(FileStatus::Hashing)).await;

        let waiter = index.clone();
        let handle = tokio::spawn(async move { waiter.await_hashed("share/a").await });

        time::sleep(time::Duration::from_millis(150)).await;
        assert!(!handle.is_finished());

        index
            .update_file("share/a", |meta| meta.status = FileStatus::Added)
            .await;
        tokio::time::timeout(time::Duration::from_secs(2), handle)
            .await
            .expect("await_hashed did not return")
            .unwrap();
    }
}
