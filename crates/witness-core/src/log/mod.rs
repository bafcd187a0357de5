//! Firmware transparency log client.
//!
//! Signed notes and checkpoints, RFC 6962 Merkle proofs, proof construction
//! from hash tiles, and the tracker that remembers the largest checkpoint
//! this machine has seen.

pub mod checkpoint;
pub mod fetcher;
pub mod memory;
pub mod merkle;
pub mod note;
pub mod tiles;
pub mod tracker;

use thiserror::Error;

pub use checkpoint::Checkpoint;
pub use fetcher::{DirFetcher, LogFetcher};
pub use memory::MemoryLog;
pub use merkle::{ProofError, leaf_hash, node_hash, verify_consistency, verify_inclusion};
pub use note::{Ed25519Signer, Ed25519Verifier, Note, NoteError, NoteSigner, NoteVerifier, open_note};
pub use tracker::LogStateTracker;

pub const HASH_SIZE: usize = 32;

/// SHA-256 tree hash.
pub type Hash = [u8; HASH_SIZE];

#[derive(Error, Debug)]
pub enum LogError {
    #[error("Log resource not found: {0}")]
    NotFound(String),

    #[error("Failed to fetch {path}: {source}")]
    Fetch {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("Checkpoint origin mismatch: expected {expected:?}, got {actual:?}")]
    OriginMismatch { expected: String, actual: String },

    #[error("Log rolled back: trusted size {trusted}, fetched size {fetched}")]
    Rollback { trusted: u64, fetched: u64 },

    #[error("Log forked at size {size}")]
    Fork { size: u64 },

    #[error("Invalid tile {path}: {message}")]
    Tile { path: String, message: String },

    #[error("Requested {what} beyond tree size {size}")]
    OutOfRange { what: String, size: u64 },

    #[error("Note error: {0}")]
    Note(#[from] NoteError),

    #[error("Proof error: {0}")]
    Proof(#[from] ProofError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
