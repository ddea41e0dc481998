use std::{
    io::{Seek, SeekFrom, Write},
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpSocket, TcpStream},
    task, time,
};
use tokio_util::codec::Framed;
use crate::index::Index;
use super::{crypto, Message, MessageCodec, PeerError, PeerManager, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

impl PeerManager {

    // Opens a fresh connection; connections are not pooled. The source
    // address is pinned to the configured bind address so the remote
    // allowlist sees us under the address it knows. The online flag
    // tracks the outcome.
    async fn connect(&self, ip: IpAddr) -> Result<Framed<TcpStream, MessageCodec>> {

        let attempt = async {
            let socket = match ip {
                IpAddr::V4(_) => TcpSocket::new_v4()?,
                IpAddr::V6(_) => TcpSocket::new_v6()?,
            };
            socket.bind(SocketAddr::new(self.listen_addr, 0))?;
            socket.connect(SocketAddr::new(ip, self.listen_port)).await
        };

        match time::timeout(CONNECT_TIMEOUT, attempt).await {
            Ok(Ok(stream)) => {
                self.table.set_online(&ip, true);
                Ok(Framed::new(stream, MessageCodec))
            }
            Ok(Err(e)) => {
                self.table.set_online(&ip, false);
                Err(e.into())
            }
            Err(_) => {
                self.table.set_online(&ip, false);
                Err(PeerError::Timeout)
            }
        }
    }

    async fn round_trip(&self, ip: IpAddr, request: Message) -> Result<Message> {
        let mut socket = self.connect(ip).await?;
        socket.send(request).await?;
        match time::timeout(RESPONSE_TIMEOUT, socket.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => Err(PeerError::ConnectionClosed),
            Err(_) => Err(PeerError::Timeout),
        }
    }

    // Sends the local index, returns the peer's.
    pub async fn request_index(&self, ip: IpAddr, local: Index) -> Result<Index> {
        tracing::info!("request index exchange with {}", ip);
        match self.round_trip(ip, Message::ReqIndex(local)).await? {
            Message::ResIndex(remote) => Ok(remote),
            _ => Err(PeerError::UnexpectedMessage),
        }
    }

    pub async fn request_index_update(&self, ip: IpAddr, changed: Index) -> Result<()> {
        tracing::info!("request index update of {}", ip);
        match self.round_trip(ip, Message::ReqIndexUpdate(changed)).await? {
            // The acknowledgement payload is opaque; only the type counts.
            Message::ResIndexUpdate => Ok(()),
            _ => Err(PeerError::UnexpectedMessage),
        }
    }

    // Fetches one block and writes it into the partial file at
    // block * block_size, reversing the sender's transforms first.
    pub async fn request_file(&self, ip: IpAddr, path: &str, block: u64) -> Result<()> {
        tracing::trace!("request {} blk:{} from {}", path, block, ip);

        let request = Message::ReqFile { path: path.to_owned(), block };
        let mut data = match self.round_trip(ip, request).await? {
            Message::ResFile(data) => data,
            _ => return Err(PeerError::UnexpectedMessage),
        };

        if let Some(psk) = &self.psk {
            data = crypto::open(&data, psk)?;
        }
        if self.compression {
            data = crypto::decompress(&data)?;
        }

        let partial = crate::resolve_partial(&self.working_dir, path);
        let offset = block * self.block_size;
        task::spawn_blocking(move || write_span(&partial, offset, &data)).await??;
        Ok(())
    }
}

fn write_span(path: &std::path::Path, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}
