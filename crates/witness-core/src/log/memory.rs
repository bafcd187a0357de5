//! In-memory firmware log.
//!
//! Serves signed checkpoints and hash tiles through [`LogFetcher`], so the
//! tracker and verifiers can run against it exactly as against a log
//! directory. Used by tests and for staging logs on disk.

use std::path::Path;
use std::sync::Arc;

use super::checkpoint::Checkpoint;
use super::fetcher::{CHECKPOINT_PATH, LogFetcher};
use super::merkle::{HashSource, LeafHashes, ProofBuilder, leaf_hash};
use super::note::{Ed25519Signer, NoteVerifier};
use super::tiles::{TILE_HEIGHT, TILE_WIDTH, parse_tile_path, tile_path};
use super::{Hash, LogError};

pub struct MemoryLog {
    origin: String,
    signer: Ed25519Signer,
    leaves: Vec<Hash>,
    published: Option<Checkpoint>,
}

impl MemoryLog {
    /// New empty log with a freshly generated key named after `origin`.
    pub fn new(origin: &str) -> Result<Self, LogError> {
        Ok(Self::with_signer(origin, Ed25519Signer::generate(origin)?))
    }

    pub fn with_signer(origin: &str, signer: Ed25519Signer) -> Self {
        Self {
            origin: origin.to_string(),
            signer,
            leaves: Vec::new(),
            published: None,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn signer(&self) -> &Ed25519Signer {
        &self.signer
    }

    pub fn verifier(&self) -> Arc<dyn NoteVerifier> {
        Arc::new(self.signer.verifier())
    }

    pub fn size(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Append an entry, returning its index.
    pub fn append(&mut self, data: &[u8]) -> u64 {
        self.leaves.push(leaf_hash(data));
        self.leaves.len() as u64 - 1
    }

    pub fn root_at(&self, size: u64) -> Result<Hash, LogError> {
        self.check_size(size)?;
        ProofBuilder::new(&LeafHashes(&self.leaves), size).root()
    }

    /// Signed checkpoint for the first `size` entries.
    pub fn checkpoint_at(&self, size: u64) -> Result<Checkpoint, LogError> {
        let root = self.root_at(size)?;
        Checkpoint::sign(&self.origin, size, &root, &self.signer)
    }

    /// Sign the current tree and serve it as the latest checkpoint.
    pub fn publish(&mut self) -> Result<Checkpoint, LogError> {
        let cp = self.checkpoint_at(self.size())?;
        self.published = Some(cp.clone());
        Ok(cp)
    }

    /// Serve an arbitrary checkpoint as the latest one.
    pub fn publish_raw(&mut self, checkpoint: Checkpoint) {
        self.published = Some(checkpoint);
    }

    pub fn inclusion_proof(&self, index: u64, size: u64) -> Result<Vec<Hash>, LogError> {
        self.check_size(size)?;
        ProofBuilder::new(&LeafHashes(&self.leaves), size).inclusion_proof(index)
    }

    pub fn consistency_proof(&self, size1: u64, size2: u64) -> Result<Vec<Hash>, LogError> {
        self.check_size(size2)?;
        ProofBuilder::new(&LeafHashes(&self.leaves), size2).consistency_proof(size1)
    }

    /// Write the published checkpoint and every tile it needs below `dir`.
    pub fn write_to_dir(&self, dir: &Path) -> Result<(), LogError> {
        let Some(cp) = &self.published else {
            return Err(LogError::NotFound(CHECKPOINT_PATH.to_string()));
        };
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CHECKPOINT_PATH), &cp.raw)?;

        let mut level = 0u8;
        loop {
            let available = cp.size.checked_shr(level as u32 * TILE_HEIGHT as u32).unwrap_or(0);
            if available == 0 {
                break;
            }
            for index in 0..available.div_ceil(TILE_WIDTH) {
                let width = (available - index * TILE_WIDTH).min(TILE_WIDTH);
                let path = tile_path(level, index, width);
                let data = self.fetch(&path)?;
                let full = dir.join(&path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(full, data)?;
            }
            level += 1;
        }
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<(), LogError> {
        if size > self.size() {
            return Err(LogError::OutOfRange {
                what: format!("tree size {size}"),
                size: self.size(),
            });
        }
        Ok(())
    }

    fn tile(&self, level: u8, index: u64, width: u64) -> Option<Vec<u8>> {
        let stored_level = level.checked_mul(TILE_HEIGHT)?;
        let first = index.checked_mul(TILE_WIDTH)?;
        let complete = self.size().checked_shr(stored_level as u32).unwrap_or(0);
        if first + width > complete {
            return None;
        }
        let source = LeafHashes(&self.leaves);
        let mut data = Vec::with_capacity(width as usize * 32);
        for i in first..first + width {
            data.extend_from_slice(&source.node_hash(stored_level, i).ok()?);
        }
        Some(data)
    }
}

impl LogFetcher for MemoryLog {
    fn fetch(&self, path: &str) -> Result<Vec<u8>, LogError> {
        if path == CHECKPOINT_PATH {
            return self
                .published
                .as_ref()
                .map(|cp| cp.raw.clone())
                .ok_or_else(|| LogError::NotFound(path.to_string()));
        }
        parse_tile_path(path)
            .and_then(|(level, index, width)| self.tile(level, index, width))
            .ok_or_else(|| LogError::NotFound(path.to_string()))
    }
}
