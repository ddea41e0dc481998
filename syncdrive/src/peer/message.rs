use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::index::Index;
use super::{wire, PeerError};

// 1-byte type followed by an 8-byte big-endian payload length.
const HEADER_LEN: usize = 9;

// Payloads above this are a framing error; nothing legitimate comes
// close (the largest payload is one sealed block or a full index).
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

const REQ_INDEX: u8 = 0;
const REQ_INDEX_UPDATE: u8 = 1;
const REQ_FILE: u8 = 2;
const RES_INDEX: u8 = 3;
const RES_INDEX_UPDATE: u8 = 4;
const RES_FILE: u8 = 5;

#[cfg_attr(test, derive(Clone))]
#[derive(Debug, PartialEq)]
pub enum Message {

    // Full index exchange: the requester sends its own index and the
    // responder replies with RES_INDEX.
    ReqIndex(Index),

    // Push of the entries that changed since the last announcement.
    ReqIndexUpdate(Index),

    // One block of one file, referenced by index key and block number.
    ReqFile { path: String, block: u64 },

    ResIndex(Index),

    // Opaque acknowledgement; the requester checks only the type.
    ResIndexUpdate,

    // Block bytes, zlib-compressed and/or sealed per configuration.
    ResFile(Vec<u8>),

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {

        let mut payload = BytesMut::new();
        let msg_type = match msg {
            Message::ReqIndex(index) => {
                wire::put_index(&mut payload, &index);
                REQ_INDEX
            }
            Message::ReqIndexUpdate(index) => {
                wire::put_index(&mut payload, &index);
                REQ_INDEX_UPDATE
            }
            Message::ReqFile { path, block } => {
                wire::put_file_request(&mut payload, &path, block);
                REQ_FILE
            }
            Message::ResIndex(index) => {
                wire::put_index(&mut payload, &index);
                RES_INDEX
            }
            Message::ResIndexUpdate => {
                payload.put_slice(wire::OK);
                RES_INDEX_UPDATE
            }
            Message::ResFile(data) => {
                payload.put_slice(&data);
                RES_FILE
            }
        };

        dst.put_u8(msg_type);
        dst.put_u64(payload.len() as u64);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read the header yet.
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let msg_type = peeker.get_u8();
        let msg_len = peeker.get_u64();

        if msg_len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(msg_len));
        }
        // Haven't received the whole payload.
        if (src.len() - HEADER_LEN) < msg_len as usize {
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut payload = src.split_to(msg_len as usize).freeze();

        let msg = match msg_type {
            REQ_INDEX => Message::ReqIndex(wire::get_index(&mut payload)?),
            REQ_INDEX_UPDATE => Message::ReqIndexUpdate(wire::get_index(&mut payload)?),
            REQ_FILE => {
                let (path, block) = wire::get_file_request(&mut payload)?;
                Message::ReqFile { path, block }
            }
            RES_INDEX => Message::ResIndex(wire::get_index(&mut payload)?),
            RES_INDEX_UPDATE => Message::ResIndexUpdate,
            RES_FILE => Message::ResFile(payload.to_vec()),
            id => {
                tracing::warn!("invalid message type: {}", id);
                return Err(PeerError::InvalidMessageType(id));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::ReqIndex(index) => write!(f, "index request with {} entries", index.len()),
            Message::ReqIndexUpdate(index) => write!(f, "index update with {} entries", index.len()),
            Message::ReqFile { path, block } => write!(f, "request for {} blk:{}", path, block),
            Message::ResIndex(index) => write!(f, "index response with {} entries", index.len()),
            Message::ResIndexUpdate => write!(f, "index update acknowledgement"),
            Message::ResFile(data) => write!(f, "file block of {} bytes", data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Entry, FileMeta, FileStatus};

    fn sample_index() -> Index {
        let mut index = Index::new();
        index.insert("share/docs".into(), Entry::Directory);
        index.insert(
            "share/hello.txt".into(),
            Entry::File(FileMeta {
                size: 5,
                modified: 1700000000.25,
                status: FileStatus::Added,
                blocks: vec![Some([0x5d; 16]), None],
            }),
        );
        index
    }

    #[test]
    fn test_msg_round_trip() {

        let msgs = [
            Message::ReqIndex(sample_index()),
            Message::ReqIndexUpdate(Index::new()),
            Message::ReqFile { path: "share/hello.txt".into(), block: 3 },
            Message::ResIndex(sample_index()),
            Message::ResIndexUpdate,
            Message::ResFile(vec![1, 2, 3, 4]),
        ];

        let mut buf = BytesMut::new();
        for msg in msgs.iter() {
            MessageCodec.encode(msg.clone(), &mut buf).unwrap();
        }
        for msg in msgs.iter() {
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, msg, "decoded message does not match expected");
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut encoded = BytesMut::new();
        let msg = Message::ReqFile { path: "share/a".into(), block: 0 };
        MessageCodec.encode(msg.clone(), &mut encoded).unwrap();

        // Feed the frame one half at a time.
        let half = encoded.len() / 2;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..half]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&encoded[half..]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_msg_decode_empty_and_incomplete() {
        let mut buf = BytesMut::new();
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[RES_FILE, 0, 0, 0]);
        assert_eq!(MessageCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_msg_decode_invalid_type() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[255, 0, 0, 0, 0, 0, 0, 0, 0]);
        match MessageCodec.decode(&mut buf) {
            Err(PeerError::InvalidMessageType(255)) => {}
            other => panic!("expected invalid message type error, got {:?}", other),
        }
    }

    #[test]
    fn test_msg_decode_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(RES_FILE);
        buf.put_u64(MAX_FRAME_LEN + 1);
        match MessageCodec.decode(&mut buf) {
            Err(PeerError::FrameTooLarge(_)) => {}
            other => panic!("expected frame too large error, got {:?}", other),
        }
    }
}
