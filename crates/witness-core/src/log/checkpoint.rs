//! Log checkpoints.
//!
//! The body of a checkpoint note is:
//!
//! ```text
//! <origin>
//! <tree size, decimal>
//! <root hash, base64>
//! [optional extension lines]
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;

use super::note::{NoteSigner, NoteVerifier, open_note, sign_note};
use super::{HASH_SIZE, Hash, LogError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    pub root_hash: Hash,
    /// The signed note the checkpoint was parsed from.
    pub raw: Vec<u8>,
}

impl Checkpoint {
    /// Open a signed checkpoint, requiring a valid signature by `verifier`
    /// and the expected `origin`.
    pub fn parse(raw: &[u8], origin: &str, verifier: &Arc<dyn NoteVerifier>) -> Result<Self, LogError> {
        let note = open_note(raw, std::slice::from_ref(verifier))?;
        let (cp_origin, size, root_hash) = parse_body(&note.text)?;
        if cp_origin != origin {
            return Err(LogError::OriginMismatch {
                expected: origin.to_string(),
                actual: cp_origin,
            });
        }
        Ok(Self {
            origin: cp_origin,
            size,
            root_hash,
            raw: raw.to_vec(),
        })
    }

    /// Checkpoint body text.
    pub fn body(origin: &str, size: u64, root_hash: &Hash) -> String {
        format!("{origin}\n{size}\n{}\n", STANDARD.encode(root_hash))
    }

    /// Produce a signed checkpoint.
    pub fn sign(origin: &str, size: u64, root_hash: &Hash, signer: &dyn NoteSigner) -> Result<Self, LogError> {
        let raw = sign_note(&Self::body(origin, size, root_hash), &[signer])?;
        Ok(Self {
            origin: origin.to_string(),
            size,
            root_hash: *root_hash,
            raw,
        })
    }
}

fn parse_body(text: &str) -> Result<(String, u64, Hash), LogError> {
    let mut lines = text.lines();
    let (Some(origin), Some(size), Some(hash)) = (lines.next(), lines.next(), lines.next()) else {
        return Err(LogError::Checkpoint("fewer than three lines".to_string()));
    };
    if origin.is_empty() {
        return Err(LogError::Checkpoint("empty origin".to_string()));
    }
    let size: u64 = size
        .parse()
        .map_err(|_| LogError::Checkpoint(format!("bad tree size {size:?}")))?;
    let hash_bytes = STANDARD
        .decode(hash)
        .map_err(|_| LogError::Checkpoint("root hash is not base64".to_string()))?;
    let root_hash: Hash = hash_bytes.as_slice().try_into().map_err(|_| {
        LogError::Checkpoint(format!(
            "root hash has {} bytes, expected {HASH_SIZE}",
            hash_bytes.len()
        ))
    })?;
    Ok((origin.to_string(), size, root_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::note::Ed25519Signer;

    fn signer_and_verifier() -> (Ed25519Signer, Arc<dyn NoteVerifier>) {
        let signer = Ed25519Signer::generate("transparency.example/firmware").unwrap();
        let verifier: Arc<dyn NoteVerifier> = Arc::new(signer.verifier());
        (signer, verifier)
    }

    #[test]
    fn test_sign_and_parse() {
        let (signer, verifier) = signer_and_verifier();
        let cp = Checkpoint::sign("firmware-log", 42, &[3u8; 32], &signer).unwrap();
        let parsed = Checkpoint::parse(&cp.raw, "firmware-log", &verifier).unwrap();
        assert_eq!(parsed, cp);
        assert_eq!(parsed.size, 42);
    }

    #[test]
    fn test_origin_mismatch() {
        let (signer, verifier) = signer_and_verifier();
        let cp = Checkpoint::sign("firmware-log", 1, &[0u8; 32], &signer).unwrap();
        assert!(matches!(
            Checkpoint::parse(&cp.raw, "other-log", &verifier),
            Err(LogError::OriginMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_key() {
        let (signer, _) = signer_and_verifier();
        let (_, other) = signer_and_verifier();
        let cp = Checkpoint::sign("firmware-log", 1, &[0u8; 32], &signer).unwrap();
        assert!(matches!(
            Checkpoint::parse(&cp.raw, "firmware-log", &other),
            Err(LogError::Note(_))
        ));
    }

    #[test]
    fn test_bad_bodies() {
        assert!(parse_body("origin\n12\n").is_err());
        assert!(parse_body("origin\nabc\nAAAA\n").is_err());
        assert!(parse_body("origin\n12\nAAAA\n").is_err());
        let ok = Checkpoint::body("o", 7, &[9u8; 32]);
        assert_eq!(parse_body(&ok).unwrap().1, 7);
    }
}
