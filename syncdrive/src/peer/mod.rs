use std::{
    collections::HashMap,
    net::IpAddr,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};
use crate::{config::Config, index::SharedIndex};

mod crypto;
mod message;
mod request;
mod server;
mod wire;

pub use message::{Message, MessageCodec};
pub use server::spawn_listener;

pub type Result<T> = std::result::Result<T, PeerError>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("frame of {0} bytes exceeds cap")]
    FrameTooLarge(u64),

    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    #[error("unexpected message type")]
    UnexpectedMessage,

    #[error("connection closed before response")]
    ConnectionClosed,

    #[error("request timed out")]
    Timeout,

    #[error("payload decryption failed")]
    Crypto,

    #[error("{0} is not available for transfer")]
    NotServable(String),

    #[error("worker task failed: {0}")]
    Worker(String),

}

impl From<tokio::task::JoinError> for PeerError {
    fn from(e: tokio::task::JoinError) -> Self {
        PeerError::Worker(e.to_string())
    }
}

// The fixed set of known peers. Keys never change after construction,
// only the online flag mutates.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<IpAddr, AtomicBool>,
}

impl PeerTable {

    pub fn new<I>(ips: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        PeerTable {
            peers: ips
                .into_iter()
                .map(|ip| (ip, AtomicBool::new(false)))
                .collect(),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.peers.contains_key(ip)
    }

    // No-op for addresses outside the fixed set.
    pub fn set_online(&self, ip: &IpAddr, online: bool) {
        if let Some(flag) = self.peers.get(ip) {
            flag.store(online, Ordering::Relaxed);
        }
    }

    pub fn is_online(&self, ip: &IpAddr) -> bool {
        self.peers
            .get(ip)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn ips(&self) -> Vec<IpAddr> {
        self.peers.keys().copied().collect()
    }
}

// Owns the wire: the allowlisted listener, outbound request/response
// round trips, payload framing and the optional compression and
// encryption transforms on block payloads.
#[derive(Debug)]
pub struct PeerManager {

    pub table: PeerTable,

    listen_addr: IpAddr,

    // Peers are dialed on the same port we listen on.
    listen_port: u16,

    working_dir: PathBuf,

    block_size: u64,

    compression: bool,

    // Key material; None disables encryption.
    psk: Option<Vec<u8>>,

    index: SharedIndex,

}

impl PeerManager {
    pub fn new(cfg: &Config, index: SharedIndex) -> Self {
        PeerManager {
            table: PeerTable::new(cfg.peers.iter().copied()),
            listen_addr: cfg.listen_addr,
            listen_port: cfg.listen_port,
            working_dir: cfg.working_dir.clone(),
            block_size: cfg.block_size,
            compression: cfg.enable_gzip,
            psk: cfg.psk(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_table_fixed_membership() {
        let known: IpAddr = "192.168.1.101".parse().unwrap();
        let unknown: IpAddr = "192.168.1.200".parse().unwrap();
        let table = PeerTable::new([known]);

        assert!(table.contains(&known));
        assert!(!table.contains(&unknown));
        assert!(!table.is_online(&known));

        table.set_online(&known, true);
        assert!(table.is_online(&known));

        // Unknown addresses are never added.
        table.set_online(&unknown, true);
        assert!(!table.contains(&unknown));
        assert!(!table.is_online(&unknown));
    }
}
