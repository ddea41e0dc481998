use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::{
    config::Config,
    files::{ChangeRx, ChangedItem, FileError, FileManager},
    index::SharedIndex,
    peer::{self, PeerManager},
    sync::{SyncRx, SyncTx, Synchronizer},
};

#[derive(thiserror::Error, Debug)]
pub enum AppError {

    #[error("file manager error: {0}")]
    File(#[from] FileError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

}

pub type Result<T> = std::result::Result<T, AppError>;

// Supervisor owning the whole node: the shared index, the file manager
// with its scanner, the peer manager with its listener, and the
// synchronizer. All children are cancelled and drained on shutdown.
pub struct App {

    index: SharedIndex,

    files: FileManager,

    peers: Arc<PeerManager>,

    sync: Arc<Synchronizer>,

    // Changed-items lists from the scanner.
    change_rx: ChangeRx,

    // Remote indices queued for reconciliation.
    sync_rx: SyncRx,

    // Kept for the listener task.
    sync_tx: SyncTx,

    shutdown: CancellationToken,

}

impl App {

    pub fn new(cfg: Config) -> Self {

        let index = SharedIndex::new();
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();

        let files = FileManager::new(&cfg, index.clone(), change_tx);
        let peers = Arc::new(PeerManager::new(&cfg, index.clone()));
        let sync = Synchronizer::new(&cfg, index.clone(), Arc::clone(&peers));

        App {
            index,
            files,
            peers,
            sync,
            change_rx,
            sync_rx,
            sync_tx,
            shutdown: CancellationToken::new(),
        }
    }

    // Handle for stopping the node from another task; run() also stops
    // on SIGINT.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // The node's live index.
    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub async fn run(&mut self) -> Result<()> {

        // Build the index before anything touches the network.
        self.files.run().await?;
        let scanner = self.files.spawn_scanner(self.shutdown.child_token());
        let listener = peer::spawn_listener(
            Arc::clone(&self.peers),
            self.sync_tx.clone(),
            self.shutdown.child_token(),
        );

        self.initial_exchange().await;

        loop {
            tokio::select! {

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received");
                    break;
                }

                _ = self.shutdown.cancelled() => break,

                Some(items) = self.change_rx.recv() => self.spawn_change_push(items),

                Some(remote) = self.sync_rx.recv() => {
                    let sync = Arc::clone(&self.sync);
                    tokio::spawn(sync.reconcile(remote.ip, remote.index));
                }
            }
        }

        tracing::info!("stopping");
        self.shutdown.cancel();
        scanner.await.ok();
        listener.await.ok();
        tracing::info!("stopped");
        Ok(())
    }

    // One full exchange with every configured peer. An unreachable peer
    // is logged and skipped; the next announcement retries implicitly.
    async fn initial_exchange(&self) {
        for ip in self.peers.table.ips() {
            let local = self.index.shared_snapshot().await;
            match self.peers.request_index(ip, local).await {
                Ok(remote) => {
                    let sync = Arc::clone(&self.sync);
                    tokio::spawn(sync.reconcile(ip, remote));
                }
                Err(e) => tracing::warn!("peer {} unreachable: {}", ip, e),
            }
        }
    }

    // Waits for digests to settle, then pushes the changed entries to
    // every peer. Runs off the supervisor loop so a slow peer never
    // stalls scanning.
    fn spawn_change_push(&self, items: Vec<ChangedItem>) {

        let index = self.index.clone();
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {

            for item in &items {
                if item.is_file {
                    index.await_hashed(&item.path).await;
                }
            }
            let changed = index
                .shared_snapshot_of(items.iter().map(|item| item.path.as_str()))
                .await;
            if changed.is_empty() {
                return;
            }

            for ip in peers.table.ips() {
                if let Err(e) = peers.request_index_update(ip, changed.clone()).await {
                    tracing::warn!("cannot push update to {}: {}", ip, e);
                }
            }
        });
    }
}
