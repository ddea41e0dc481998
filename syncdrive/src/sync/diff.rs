use crate::index::{BlockDigest, Entry, FileMeta, Index};

// One file to fetch, with the block numbers that need transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFile {
    pub path: String,
    pub meta: FileMeta,
    pub blocks: Vec<u64>,
}

#[derive(Debug, Default, PartialEq)]
pub struct SyncPlan {

    // Created before any file work, parents first.
    pub new_dirs: Vec<String>,

    // Fetched whole into a fresh placeholder.
    pub new_files: Vec<FetchFile>,

    // Same size, newer stamp: only the differing blocks move.
    pub modified: Vec<FetchFile>,

}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.new_dirs.is_empty() && self.new_files.is_empty() && self.modified.is_empty()
    }
}

// Folds a peer's index against the local one. Last writer wins by
// modification time; remote entries older than ours are ignored, and
// paths we hold that the peer lacks are never deleted.
pub fn diff(remote: &Index, local: &Index) -> SyncPlan {

    let mut plan = SyncPlan::default();
    for (path, remote_entry) in remote {
        match (remote_entry, local.get(path)) {

            (Entry::Directory, None) => plan.new_dirs.push(path.clone()),

            (Entry::File(meta), None) => plan.new_files.push(whole_file(path, meta)),

            (Entry::File(remote_meta), Some(Entry::File(local_meta)))
                if remote_meta.modified > local_meta.modified =>
            {
                if remote_meta.size == local_meta.size {
                    plan.modified.push(FetchFile {
                        path: path.clone(),
                        meta: remote_meta.clone(),
                        blocks: differing_blocks(&remote_meta.blocks, &local_meta.blocks),
                    });
                } else {
                    // Size changed: rewrite the whole file.
                    plan.new_files.push(whole_file(path, remote_meta));
                }
            }

            // Directory already present, remote copy older, or the kinds
            // disagree: leave local state alone.
            _ => {}
        }
    }

    // Lexicographic order puts parents before children.
    plan.new_dirs.sort();
    plan
}

fn whole_file(path: &str, meta: &FileMeta) -> FetchFile {
    FetchFile {
        path: path.to_owned(),
        meta: meta.clone(),
        blocks: (0..meta.blocks.len() as u64).collect(),
    }
}

// Positions whose digests differ. A digest that is missing on either
// side never matches.
fn differing_blocks(
    remote: &[Option<BlockDigest>],
    local: &[Option<BlockDigest>],
) -> Vec<u64> {
    let len = remote.len().max(local.len());
    (0..len)
        .filter(|&i| {
            match (
                remote.get(i).copied().flatten(),
                local.get(i).copied().flatten(),
            ) {
                (Some(r), Some(l)) => r != l,
                _ => true,
            }
        })
        .map(|i| i as u64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileStatus;

    fn file(modified: f64, size: u64, blocks: Vec<Option<BlockDigest>>) -> Entry {
        Entry::File(FileMeta { size, modified, status: FileStatus::Added, blocks })
    }

    #[test]
    fn test_diff_new_items() {
        let mut remote = Index::new();
        remote.insert("share/docs".into(), Entry::Directory);
        remote.insert("share/docs/notes".into(), Entry::Directory);
        remote.insert(
            "share/a".into(),
            file(100.0, 10, vec![Some([1; 16]), Some([2; 16]), Some([3; 16])]),
        );

        let plan = diff(&remote, &Index::new());
        assert_eq!(plan.new_dirs, vec!["share/docs".to_owned(), "share/docs/notes".to_owned()]);
        assert_eq!(plan.new_files.len(), 1);
        assert_eq!(plan.new_files[0].blocks, vec![0, 1, 2]);
        assert!(plan.modified.is_empty());
    }

    #[test]
    fn test_diff_same_size_fetches_differing_blocks_only() {
        let mut remote = Index::new();
        remote.insert(
            "share/a".into(),
            file(200.0, 12, vec![Some([9; 16]), Some([2; 16]), Some([8; 16])]),
        );
        let mut local = Index::new();
        local.insert(
            "share/a".into(),
            file(100.0, 12, vec![Some([1; 16]), Some([2; 16]), Some([3; 16])]),
        );

        let plan = diff(&remote, &local);
        assert!(plan.new_files.is_empty());
        assert_eq!(plan.modified.len(), 1);
        assert_eq!(plan.modified[0].blocks, vec![0, 2]);
    }

    #[test]
    fn test_diff_missing_digest_never_matches() {
        let mut remote = Index::new();
        remote.insert(
            "share/a".into(),
            file(200.0, 8, vec![Some([1; 16]), None]),
        );
        let mut local = Index::new();
        local.insert(
            "share/a".into(),
            file(100.0, 8, vec![Some([1; 16]), None]),
        );

        let plan = diff(&remote, &local);
        assert_eq!(plan.modified[0].blocks, vec![1]);
    }

    #[test]
    fn test_diff_size_change_rewrites_file() {
        let mut remote = Index::new();
        remote.insert(
            "share/a".into(),
            file(200.0, 20, vec![Some([1; 16]), Some([2; 16])]),
        );
        let mut local = Index::new();
        local.insert("share/a".into(), file(100.0, 12, vec![Some([1; 16])]));

        let plan = diff(&remote, &local);
        assert!(plan.modified.is_empty());
        assert_eq!(plan.new_files[0].blocks, vec![0, 1]);
    }

    #[test]
    fn test_diff_last_writer_wins() {
        let mut remote = Index::new();
        remote.insert("share/a".into(), file(100.0, 12, vec![Some([9; 16])]));
        let mut local = Index::new();
        // Local copy is newer; the remote one is ignored.
        local.insert("share/a".into(), file(200.0, 12, vec![Some([1; 16])]));
        // Local-only paths are never deleted.
        local.insert("share/b".into(), file(50.0, 4, vec![Some([7; 16])]));

        assert!(diff(&remote, &local).is_empty());
    }

    #[test]
    fn test_diff_identical_mtime_is_quiescent() {
        let mut remote = Index::new();
        remote.insert("share/a".into(), file(100.0, 12, vec![Some([1; 16])]));
        let local = remote.clone();
        assert!(diff(&remote, &local).is_empty());
    }
}
