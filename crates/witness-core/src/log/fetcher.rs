//! Access to log resources by path.

use std::path::PathBuf;
use tracing::trace;

use super::LogError;

/// Path of the latest checkpoint relative to the log root.
pub const CHECKPOINT_PATH: &str = "checkpoint";

/// Fetches log resources (`checkpoint`, `tile/...`) relative to a log root.
pub trait LogFetcher: Send + Sync {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, LogError>;
}

/// Serves a log from a local directory.
#[derive(Debug, Clone)]
pub struct DirFetcher {
    root: PathBuf,
}

impl DirFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl LogFetcher for DirFetcher {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, LogError> {
        if path.split('/').any(|c| c == "..") {
            return Err(LogError::NotFound(path.to_string()));
        }
        let full = self.root.join(path);
        trace!(path = %full.display(), "Fetching log resource");
        std::fs::read(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LogError::NotFound(path.to_string()),
            _ => LogError::Fetch {
                path: path.to_string(),
                source: e,
            },
        })
    }
}
