use std::{
    io::{Read, Seek, SeekFrom},
    net::IpAddr,
    sync::Arc,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    task::JoinHandle,
    task::JoinSet,
    time,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::Instrument;
use crate::{
    files::block_spans,
    index::{Entry, FileStatus},
    sync::{RemoteIndex, SyncTx},
};
use super::{crypto, Message, MessageCodec, PeerError, PeerManager, Result};

// Cap on connections served at once.
const MAX_INBOUND: usize = 64;

// A peer that connects but never sends a request is cut off so it
// cannot park a handler.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(30);

// Starts the listener. Inbound indices are handed to the synchronizer
// through sync_tx; the task runs until cancelled, then drains in-flight
// handlers before returning.
pub fn spawn_listener(
    mgr: Arc<PeerManager>,
    sync_tx: SyncTx,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listen(mgr, sync_tx, shutdown).await {
            tracing::error!("listener failed: {}", e);
        }
    })
}

async fn listen(mgr: Arc<PeerManager>, sync_tx: SyncTx, shutdown: CancellationToken) -> Result<()> {

    let listener = TcpListener::bind((mgr.listen_addr, mgr.listen_port)).await?;
    tracing::info!("server listening on {}:{}", mgr.listen_addr, mgr.listen_port);

    let permits = Arc::new(Semaphore::new(MAX_INBOUND));
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {

            _ = shutdown.cancelled() => break,

            conn = listener.accept() => {
                let (stream, addr) = match conn {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("accept error: {}", e);
                        continue;
                    }
                };

                // Only allow connections from configured peers. Dropping
                // the stream closes it before any payload is read.
                let ip = addr.ip();
                if !mgr.table.contains(&ip) {
                    tracing::warn!("refusing connection from {}", addr);
                    continue;
                }
                mgr.table.set_online(&ip, true);

                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let mgr = Arc::clone(&mgr);
                let sync_tx = sync_tx.clone();
                handlers.spawn(
                    async move {
                        let _permit = permit;
                        if let Err(e) = handle_conn(mgr, sync_tx, stream, ip).await {
                            tracing::warn!("handler error: {}", e);
                        }
                    }
                    .instrument(tracing::info_span!("conn", peer = %ip)),
                );
            }

            Some(res) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = res {
                    tracing::error!("handler panicked: {}", e);
                }
            }
        }
    }

    // Stop accepting, then wait for in-flight handlers.
    drop(listener);
    while let Some(res) = handlers.join_next().await {
        if let Err(e) = res {
            tracing::error!("handler panicked: {}", e);
        }
    }
    tracing::info!("server stopped");
    Ok(())
}

// One request-response pair per connection.
async fn handle_conn(
    mgr: Arc<PeerManager>,
    sync_tx: SyncTx,
    stream: TcpStream,
    ip: IpAddr,
) -> Result<()> {

    let mut socket = Framed::new(stream, MessageCodec);
    let msg = match time::timeout(READ_TIMEOUT, socket.next()).await {
        Ok(Some(msg)) => msg?,
        // Closed without sending a request.
        Ok(None) => return Ok(()),
        Err(_) => return Err(PeerError::Timeout),
    };

    match msg {

        Message::ReqIndex(remote) => {
            tracing::info!("{} requests index exchange", ip);
            let local = mgr.index.shared_snapshot().await;
            socket.send(Message::ResIndex(local)).await?;
            sync_tx.send(RemoteIndex { ip, index: remote }).ok();
        }

        Message::ReqIndexUpdate(remote) => {
            tracing::info!("{} requests index update", ip);
            socket.send(Message::ResIndexUpdate).await?;
            sync_tx.send(RemoteIndex { ip, index: remote }).ok();
        }

        Message::ReqFile { path, block } => {
            tracing::info!("{} requests {} blk:{}", ip, path, block);
            let data = mgr.read_block(&path, block).await?;
            socket.send(Message::ResFile(data)).await?;
        }

        other => {
            tracing::warn!("invalid request from {}: {}", ip, other);
            return Err(PeerError::UnexpectedMessage);
        }
    }

    Ok(())
}

impl PeerManager {

    // Reads one block of a stable indexed file and applies the outbound
    // transforms: compress, then seal. Requests for keys outside the
    // index never touch the filesystem.
    async fn read_block(&self, path: &str, block: u64) -> Result<Vec<u8>> {

        if !crate::valid_key(path) {
            return Err(PeerError::NotServable(path.to_owned()));
        }
        let meta = match self.index.get(path).await {
            Some(Entry::File(meta)) if meta.status == FileStatus::Added => meta,
            _ => return Err(PeerError::NotServable(path.to_owned())),
        };

        let spans = block_spans(meta.size, self.block_size);
        let (offset, len) = *spans
            .get(block as usize)
            .ok_or_else(|| PeerError::NotServable(path.to_owned()))?;

        let file = crate::resolve(&self.working_dir, path);
        let mut data =
            tokio::task::spawn_blocking(move || read_span(&file, offset, len)).await??;

        if self.compression {
            data = crypto::compress(&data)?;
        }
        if let Some(psk) = &self.psk {
            data = crypto::seal(&data, psk)?;
        }
        Ok(data)
    }
}

fn read_span(path: &std::path::Path, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}
