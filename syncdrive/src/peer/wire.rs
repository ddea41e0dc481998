use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::index::{Entry, FileMeta, FileStatus, Index};
use super::{PeerError, Result};

// Acknowledgement payload for index updates.
pub const OK: &[u8] = b"OK";

const KIND_DIR: u8 = 0;
const KIND_FILE: u8 = 1;

const DIGEST_LEN: usize = 16;

// Index payload:
//   u64 entry count
//   per entry: u32 path length, path bytes (UTF-8), u8 kind;
//   files add: u64 size, f64 mtime, u64 block count,
//              per block: u8 presence flag, 16 digest bytes if present.
pub fn put_index(dst: &mut BytesMut, index: &Index) {
    dst.put_u64(index.len() as u64);
    for (path, entry) in index {
        put_str(dst, path);
        match entry {
            Entry::Directory => dst.put_u8(KIND_DIR),
            Entry::File(meta) => {
                dst.put_u8(KIND_FILE);
                dst.put_u64(meta.size);
                dst.put_f64(meta.modified);
                dst.put_u64(meta.blocks.len() as u64);
                for digest in &meta.blocks {
                    match digest {
                        Some(digest) => {
                            dst.put_u8(1);
                            dst.put_slice(digest);
                        }
                        None => dst.put_u8(0),
                    }
                }
            }
        }
    }
}

pub fn get_index(src: &mut Bytes) -> Result<Index> {

    let count = get_u64(src)?;
    let mut index = Index::new();
    for _ in 0..count {

        let path = get_str(src)?;
        let entry = match get_u8(src)? {
            KIND_DIR => Entry::Directory,
            KIND_FILE => {
                let size = get_u64(src)?;
                let modified = get_f64(src)?;
                let num_blocks = get_u64(src)?;
                let mut blocks = Vec::new();
                for _ in 0..num_blocks {
                    match get_u8(src)? {
                        0 => blocks.push(None),
                        1 => {
                            ensure(src, DIGEST_LEN)?;
                            let mut digest = [0u8; DIGEST_LEN];
                            src.copy_to_slice(&mut digest);
                            blocks.push(Some(digest));
                        }
                        _ => return Err(PeerError::Malformed("digest presence flag")),
                    }
                }
                // Peers only ever advertise stable entries.
                Entry::File(FileMeta {
                    size,
                    modified,
                    status: FileStatus::Added,
                    blocks,
                })
            }
            _ => return Err(PeerError::Malformed("entry kind")),
        };
        index.insert(path, entry);
    }

    if src.has_remaining() {
        return Err(PeerError::Malformed("trailing bytes after index"));
    }
    Ok(index)
}

// File request payload: path then block number.
pub fn put_file_request(dst: &mut BytesMut, path: &str, block: u64) {
    put_str(dst, path);
    dst.put_u64(block);
}

pub fn get_file_request(src: &mut Bytes) -> Result<(String, u64)> {
    let path = get_str(src)?;
    let block = get_u64(src)?;
    if src.has_remaining() {
        return Err(PeerError::Malformed("trailing bytes after file request"));
    }
    Ok((path, block))
}

fn put_str(dst: &mut BytesMut, s: &str) {
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn get_str(src: &mut Bytes) -> Result<String> {
    ensure(src, 4)?;
    let len = src.get_u32() as usize;
    ensure(src, len)?;
    let bytes = src.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| PeerError::Malformed("path is not UTF-8"))
}

fn get_u8(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn get_u64(src: &mut Bytes) -> Result<u64> {
    ensure(src, 8)?;
    Ok(src.get_u64())
}

fn get_f64(src: &mut Bytes) -> Result<f64> {
    ensure(src, 8)?;
    Ok(src.get_f64())
}

fn ensure(src: &Bytes, n: usize) -> Result<()> {
    if src.remaining() < n {
        return Err(PeerError::Malformed("payload truncated"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Index {
        let mut index = Index::new();
        index.insert("share/docs/notes".into(), Entry::Directory);
        index.insert(
            "share/data.bin".into(),
            Entry::File(FileMeta {
                size: 12,
                modified: 1700000123.5,
                status: FileStatus::Added,
                blocks: vec![Some([1; 16]), None, Some([2; 16])],
            }),
        );
        index.insert(
            "share/empty".into(),
            Entry::File(FileMeta {
                size: 0,
                modified: 0.0,
                status: FileStatus::Added,
                blocks: vec![Some(*b"\xd4\x1d\x8c\xd9\x8f\x00\xb2\x04\xe9\x80\x09\x98\xec\xf8\x42\x7e")],
            }),
        );
        index
    }

    #[test]
    fn test_index_round_trip() {
        let index = sample_index();
        let mut buf = BytesMut::new();
        put_index(&mut buf, &index);
        let decoded = get_index(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_file_request_round_trip() {
        let mut buf = BytesMut::new();
        put_file_request(&mut buf, "share/data.bin", 42);
        let (path, block) = get_file_request(&mut buf.freeze()).unwrap();
        assert_eq!(path, "share/data.bin");
        assert_eq!(block, 42);
    }

    #[test]
    fn test_index_rejects_truncation() {
        let mut buf = BytesMut::new();
        put_index(&mut buf, &sample_index());
        let full = buf.freeze();

        // Every strict prefix must fail rather than panic.
        for cut in 0..full.len() {
            let mut truncated = full.slice(..cut);
            assert!(get_index(&mut truncated).is_err(), "prefix of {} bytes decoded", cut);
        }
    }

    #[test]
    fn test_index_rejects_bad_kind() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        put_str(&mut buf, "share/x");
        buf.put_u8(9);
        assert!(matches!(
            get_index(&mut buf.freeze()),
            Err(PeerError::Malformed("entry kind"))
        ));
    }
}
