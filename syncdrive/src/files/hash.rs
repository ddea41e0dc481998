use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use md5::{Digest, Md5};
use tokio::task;
use crate::index::{BlockDigest, FileStatus, SharedIndex};

// Partitions [0, size) into contiguous spans of at most block_size bytes.
// The final span may be shorter. An empty file yields a single empty span
// so its index entry still carries one digest.
pub fn block_spans(size: u64, block_size: u64) -> Vec<(u64, u64)> {
    debug_assert!(block_size > 0);

    if size == 0 {
        return vec![(0, 0)];
    }
    let mut spans = Vec::with_capacity(size.div_ceil(block_size) as usize);
    let mut offset = 0;
    while offset < size {
        let len = block_size.min(size - offset);
        spans.push((offset, len));
        offset += len;
    }
    spans
}

pub fn num_blocks(size: u64, block_size: u64) -> usize {
    if size == 0 {
        1
    } else {
        size.div_ceil(block_size) as usize
    }
}

// Reads one block and digests it. Reads whatever is available if the
// file shrank under us; the digest then simply won't match any peer's.
pub fn hash_block(path: &Path, offset: u64, len: u64) -> std::io::Result<BlockDigest> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    Ok(Md5::digest(&buf).into())
}

// Digests every block of the file on the blocking worker pool, gathers
// the results in block order and flips the indexed entry to Added. A
// block that could not be read leaves a hole rather than failing the
// whole file.
pub async fn hash_file(index: SharedIndex, path: String, file: PathBuf, size: u64, block_size: u64) {

    let mut jobs = Vec::new();
    for (offset, len) in block_spans(size, block_size) {
        let file = file.clone();
        jobs.push(task::spawn_blocking(move || hash_block(&file, offset, len)));
    }

    let mut blocks = Vec::with_capacity(jobs.len());
    for job in jobs {
        match job.await {
            Ok(Ok(digest)) => blocks.push(Some(digest)),
            Ok(Err(e)) => {
                tracing::warn!("cannot hash block of {}: {}", path, e);
                blocks.push(None);
            }
            Err(e) => {
                tracing::warn!("hash worker for {} failed: {}", path, e);
                blocks.push(None);
            }
        }
    }

    let updated = index
        .update_file(&path, |meta| {
            meta.blocks = blocks;
            meta.status = FileStatus::Added;
        })
        .await;
    if !updated {
        tracing::warn!("hashed {} but entry no longer in index", path);
    }
}
