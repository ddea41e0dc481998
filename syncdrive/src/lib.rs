mod app;
mod config;
mod files;
mod index;
mod peer;
mod sync;

// Suffix for in-progress downloads. Renamed away on completion,
// swept from the working directory on startup.
pub const PARTIAL_SUFFIX: &str = ".dl_partial";

// Index keys are working-directory-relative paths, so peers agree on
// them regardless of where each node's tree lives on disk.
pub(crate) fn resolve(dir: &std::path::Path, key: &str) -> std::path::PathBuf {
    dir.join(key)
}

pub(crate) fn resolve_partial(dir: &std::path::Path, key: &str) -> std::path::PathBuf {
    let mut path = dir.join(key).into_os_string();
    path.push(PARTIAL_SUFFIX);
    path.into()
}

// A key is only usable if it stays inside the working directory.
pub(crate) fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && std::path::Path::new(key)
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

pub use app::App;
pub use config::Config;
pub use index::{Entry, FileMeta, FileStatus, Index, SharedIndex};
