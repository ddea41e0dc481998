use std::{net::{IpAddr, Ipv4Addr}, path::PathBuf, time::Duration};

const DEFAULT_LISTEN_PORT: u16 = 8888;
const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_WORKING_DIR: &str = "./share";
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CONCURRENT_DOWNLOADS: usize = 4;
const DEFAULT_PSK: &[u8; 32] = b"syncdrive-preshared-key-32bytes!";

#[derive(Debug, Clone)]
pub struct Config {

    // Directory kept consistent across all peers.
    pub working_dir: PathBuf,

    // Peers we exchange indices with. Fixed for the process lifetime.
    pub peers: Vec<IpAddr>,

    // Address the server binds to; peers are dialed on the same port.
    pub listen_addr: IpAddr,

    pub listen_port: u16,

    // Unit of hashing and of transfer.
    pub block_size: u64,

    // zlib-compress block payloads on the wire.
    pub enable_gzip: bool,

    // Encrypt block payloads with a key derived from the pre-shared key.
    pub encryption: bool,

    pub pre_shared_key: Vec<u8>,

    // Cap on files downloading at once. Blocks within a file are sequential.
    pub concurrent_downloads: usize,

    // Period of the change scanner.
    pub scan_interval: Duration,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from(DEFAULT_WORKING_DIR),
            peers: Vec::new(),
            listen_addr: Ipv4Addr::UNSPECIFIED.into(),
            listen_port: DEFAULT_LISTEN_PORT,
            block_size: DEFAULT_BLOCK_SIZE,
            enable_gzip: true,
            encryption: false,
            pre_shared_key: DEFAULT_PSK.to_vec(),
            concurrent_downloads: DEFAULT_CONCURRENT_DOWNLOADS,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }
}

impl Config {
    // Key material for payload encryption, when enabled.
    pub(crate) fn psk(&self) -> Option<Vec<u8>> {
        self.encryption.then(|| self.pre_shared_key.clone())
    }
}
