//! Log state tracker.
//!
//! Remembers the largest checkpoint seen for a log and only ever moves
//! forward, and only after the log proves the new tree extends the old one.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::checkpoint::Checkpoint;
use super::fetcher::{CHECKPOINT_PATH, LogFetcher};
use super::merkle::{ProofBuilder, verify_consistency};
use super::note::NoteVerifier;
use super::tiles::TileHashSource;
use super::{Hash, LogError};

pub struct LogStateTracker {
    fetcher: Arc<dyn LogFetcher>,
    origin: String,
    verifier: Arc<dyn NoteVerifier>,
    latest: Checkpoint,
}

impl LogStateTracker {
    /// Create a tracker seeded from `trusted`, or from the log's current
    /// checkpoint when there is no trusted state yet.
    pub fn new(
        fetcher: Arc<dyn LogFetcher>,
        origin: &str,
        verifier: Arc<dyn NoteVerifier>,
        trusted: Option<&[u8]>,
    ) -> Result<Self, LogError> {
        let latest = match trusted {
            Some(raw) => {
                let cp = Checkpoint::parse(raw, origin, &verifier)?;
                debug!(size = cp.size, "Seeded log tracker from trusted checkpoint");
                cp
            }
            None => {
                let raw = fetcher.fetch(CHECKPOINT_PATH)?;
                let cp = Checkpoint::parse(&raw, origin, &verifier)?;
                warn!(size = cp.size, "No trusted log state, trusting current checkpoint");
                cp
            }
        };

        Ok(Self {
            fetcher,
            origin: origin.to_string(),
            verifier,
            latest,
        })
    }

    /// Create a tracker seeded from a state file if it exists.
    pub fn from_state_file(
        fetcher: Arc<dyn LogFetcher>,
        origin: &str,
        verifier: Arc<dyn NoteVerifier>,
        state_file: &Path,
    ) -> Result<Self, LogError> {
        let trusted = match std::fs::read(state_file) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Self::new(fetcher, origin, verifier, trusted.as_deref())
    }

    pub fn latest(&self) -> &Checkpoint {
        &self.latest
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn fetcher(&self) -> &dyn LogFetcher {
        self.fetcher.as_ref()
    }

    /// Fetch the log's newest checkpoint and adopt it if it provably extends
    /// the current one. Returns whether the tracked tree grew.
    pub fn update(&mut self) -> Result<bool, LogError> {
        let raw = self.fetcher.fetch(CHECKPOINT_PATH)?;
        let fetched = Checkpoint::parse(&raw, &self.origin, &self.verifier)?;

        if fetched.size < self.latest.size {
            return Err(LogError::Rollback {
                trusted: self.latest.size,
                fetched: fetched.size,
            });
        }
        if fetched.size == self.latest.size {
            if fetched.root_hash != self.latest.root_hash {
                return Err(LogError::Fork { size: fetched.size });
            }
            return Ok(false);
        }

        let proof = self.consistency_proof(self.latest.size, fetched.size)?;
        verify_consistency(
            self.latest.size,
            fetched.size,
            &proof,
            &self.latest.root_hash,
            &fetched.root_hash,
        )?;

        info!(from = self.latest.size, to = fetched.size, "Log tracker advanced");
        self.latest = fetched;
        Ok(true)
    }

    /// Consistency proof between two tree sizes, built from the log's tiles.
    pub fn consistency_proof(&self, size1: u64, size2: u64) -> Result<Vec<Hash>, LogError> {
        let source = TileHashSource::new(self.fetcher.as_ref(), size2);
        ProofBuilder::new(&source, size2).consistency_proof(size1)
    }

    /// Inclusion proof for `index` in the tree of `size` leaves.
    pub fn inclusion_proof(&self, index: u64, size: u64) -> Result<Vec<Hash>, LogError> {
        let source = TileHashSource::new(self.fetcher.as_ref(), size);
        ProofBuilder::new(&source, size).inclusion_proof(index)
    }

    /// Persist the latest checkpoint.
    pub fn save(&self, state_file: &Path) -> Result<(), LogError> {
        if let Some(parent) = state_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = state_file.with_extension("tmp");
        std::fs::write(&tmp, &self.latest.raw)?;
        std::fs::rename(&tmp, state_file)?;
        debug!(path = %state_file.display(), size = self.latest.size, "Saved log state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::memory::MemoryLog;
    use std::sync::RwLock;
    use tempfile::TempDir;

    /// Fetcher whose backing log can be swapped between calls.
    struct SharedLog(RwLock<MemoryLog>);

    impl LogFetcher for SharedLog {
        fn fetch(&self, path: &str) -> Result<Vec<u8>, LogError> {
            self.0.read().unwrap().fetch(path)
        }
    }

    fn log_with(n: u32) -> MemoryLog {
        let mut log = MemoryLog::new("tracker-log").unwrap();
        for i in 0..n {
            log.append(format!("entry {i}").as_bytes());
        }
        log.publish().unwrap();
        log
    }

    #[test]
    fn test_seed_from_log_and_update() {
        let shared = Arc::new(SharedLog(RwLock::new(log_with(10))));
        let verifier = shared.0.read().unwrap().verifier();
        let mut tracker =
            LogStateTracker::new(shared.clone(), "tracker-log", verifier, None).unwrap();
        assert_eq!(tracker.latest().size, 10);
        assert!(!tracker.update().unwrap());

        {
            let mut log = shared.0.write().unwrap();
            for i in 10..20 {
                log.append(format!("entry {i}").as_bytes());
            }
            log.publish().unwrap();
        }
        assert!(tracker.update().unwrap());
        assert_eq!(tracker.latest().size, 20);
    }

    #[test]
    fn test_forged_log_rejected() {
        let honest = log_with(10);
        let trusted = honest.checkpoint_at(10).unwrap();

        // Same key, different history.
        let mut forged = MemoryLog::with_signer("tracker-log", honest.signer().clone());
        for i in 0..20 {
            forged.append(format!("forged {i}").as_bytes());
        }
        forged.publish().unwrap();
        let verifier = forged.verifier();

        let mut tracker = LogStateTracker::new(
            Arc::new(forged),
            "tracker-log",
            verifier,
            Some(trusted.raw.as_slice()),
        )
        .unwrap();
        assert!(matches!(tracker.update(), Err(LogError::Proof(_))));
        assert_eq!(tracker.latest().size, 10);
    }

    #[test]
    fn test_rollback_rejected() {
        let big = log_with(20);
        let trusted = big.checkpoint_at(20).unwrap();
        let mut small = MemoryLog::with_signer("tracker-log", big.signer().clone());
        for i in 0..10 {
            small.append(format!("entry {i}").as_bytes());
        }
        small.publish().unwrap();
        let verifier = small.verifier();

        let mut tracker =
            LogStateTracker::new(Arc::new(small), "tracker-log", verifier, Some(trusted.raw.as_slice())).unwrap();
        assert!(matches!(
            tracker.update(),
            Err(LogError::Rollback { trusted: 20, fetched: 10 })
        ));
    }

    #[test]
    fn test_state_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state/checkpoint");
        let log = Arc::new(log_with(7));
        let verifier = log.verifier();

        let tracker =
            LogStateTracker::from_state_file(log.clone(), "tracker-log", verifier.clone(), &state).unwrap();
        tracker.save(&state).unwrap();

        let reloaded = LogStateTracker::from_state_file(log, "tracker-log", verifier, &state).unwrap();
        assert_eq!(reloaded.latest(), tracker.latest());
    }
}
