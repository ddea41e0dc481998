use tokio::sync::mpsc;

mod hash;
mod manager;

pub use hash::{block_spans, hash_file, num_blocks};
pub use manager::FileManager;

#[derive(thiserror::Error, Debug)]
pub enum FileError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("working directory {0} exists but is not a directory")]
    NotADirectory(String),

}

pub type Result<T> = std::result::Result<T, FileError>;
pub type ChangeTx = mpsc::UnboundedSender<Vec<ChangedItem>>;
pub type ChangeRx = mpsc::UnboundedReceiver<Vec<ChangedItem>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Modified,
}

// One observation from a scanner pass.
#[derive(Debug, Clone)]
pub struct ChangedItem {
    pub path: String,
    pub kind: ChangeKind,
    pub is_file: bool,
}
