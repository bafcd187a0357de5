//! Signed notes.
//!
//! A note is UTF-8 text ending in a newline, followed by a blank line and one
//! signature line per signer:
//!
//! ```text
//! <text>\n
//! \n
//! — <name> <base64(key hash || signature)>\n
//! ```
//!
//! Keys are written as `name+hash+base64(0x01 || key)` where `hash` is the
//! first four bytes of `SHA-256(name || "\n" || 0x01 || public key)` in hex.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_compact::{KeyPair, PublicKey, Seed, Signature};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

const ALG_ED25519: u8 = 0x01;
const SIG_PREFIX: &str = "\u{2014} ";
const PRIVATE_KEY_PREFIX: &str = "PRIVATE+KEY+";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NoteError {
    #[error("Malformed note: {0}")]
    Malformed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature from {name}")]
    InvalidSignature { name: String },

    #[error("Note has no signature from a known key ({unverified} unverified)")]
    Unverified { unverified: usize },

    #[error("Signing failed: {0}")]
    Sign(String),
}

/// Verifies signatures made by one key.
pub trait NoteVerifier: Send + Sync {
    fn name(&self) -> &str;
    fn key_hash(&self) -> u32;
    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool;
}

/// Signs notes with one key.
pub trait NoteSigner: Send + Sync {
    fn name(&self) -> &str;
    fn key_hash(&self) -> u32;
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, NoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteSignature {
    pub name: String,
    pub key_hash: u32,
    /// Signature bytes without the key hash prefix.
    pub signature: Vec<u8>,
}

/// Opened note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub text: String,
    /// Signatures checked against a known key.
    pub sigs: Vec<NoteSignature>,
    /// Signatures from keys not in the verifier list.
    pub unverified: Vec<NoteSignature>,
}

impl Note {
    /// Whether `verifier` produced one of the verified signatures.
    pub fn signed_by(&self, verifier: &dyn NoteVerifier) -> bool {
        self.sigs
            .iter()
            .any(|s| s.name == verifier.name() && s.key_hash == verifier.key_hash())
    }
}

pub fn key_hash(name: &str, key: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(key);
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c == '+')
}

/// Parse `msg` and check its signatures against `verifiers`.
///
/// Signatures from unknown keys are returned unverified. A signature from a
/// known key that fails to verify is an error, as is a note with no
/// verified signature at all.
pub fn open_note(msg: &[u8], verifiers: &[Arc<dyn NoteVerifier>]) -> Result<Note, NoteError> {
    let msg = std::str::from_utf8(msg)
        .map_err(|_| NoteError::Malformed("not valid UTF-8".to_string()))?;
    let split = msg
        .rfind("\n\n")
        .ok_or_else(|| NoteError::Malformed("missing signature block".to_string()))?;
    let text = &msg[..split + 1];
    let mut sig_block = &msg[split + 2..];

    if text
        .chars()
        .any(|c| c.is_control() && c != '\n')
    {
        return Err(NoteError::Malformed("control character in text".to_string()));
    }

    let mut sigs = Vec::new();
    let mut unverified = Vec::new();
    let mut seen = HashSet::new();

    while !sig_block.is_empty() {
        let end = sig_block
            .find('\n')
            .ok_or_else(|| NoteError::Malformed("unterminated signature line".to_string()))?;
        let line = &sig_block[..end];
        sig_block = &sig_block[end + 1..];

        let line = line
            .strip_prefix(SIG_PREFIX)
            .ok_or_else(|| NoteError::Malformed(format!("bad signature line {line:?}")))?;
        let (name, b64) = line
            .rsplit_once(' ')
            .ok_or_else(|| NoteError::Malformed(format!("bad signature line {line:?}")))?;
        if !valid_name(name) {
            return Err(NoteError::Malformed(format!("bad signer name {name:?}")));
        }
        let raw = STANDARD
            .decode(b64)
            .map_err(|_| NoteError::Malformed(format!("signature from {name} is not base64")))?;
        if raw.len() < 5 {
            return Err(NoteError::Malformed(format!("signature from {name} too short")));
        }
        let hash = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let sig = NoteSignature {
            name: name.to_string(),
            key_hash: hash,
            signature: raw[4..].to_vec(),
        };

        match verifiers
            .iter()
            .find(|v| v.name() == name && v.key_hash() == hash)
        {
            Some(v) => {
                if !seen.insert((name.to_string(), hash)) {
                    continue;
                }
                if !v.verify(text.as_bytes(), &sig.signature) {
                    return Err(NoteError::InvalidSignature {
                        name: name.to_string(),
                    });
                }
                sigs.push(sig);
            }
            None => unverified.push(sig),
        }
    }

    if sigs.is_empty() {
        return Err(NoteError::Unverified {
            unverified: unverified.len(),
        });
    }

    Ok(Note {
        text: text.to_string(),
        sigs,
        unverified,
    })
}

/// Sign `text` with every signer. `text` must end in a newline.
pub fn sign_note(text: &str, signers: &[&dyn NoteSigner]) -> Result<Vec<u8>, NoteError> {
    if !text.ends_with('\n') {
        return Err(NoteError::Malformed("text must end in newline".to_string()));
    }
    if text.contains("\n\n") {
        return Err(NoteError::Malformed("text must not contain blank lines".to_string()));
    }

    let mut out = String::with_capacity(text.len() + 128 * signers.len());
    out.push_str(text);
    out.push('\n');
    for signer in signers {
        let sig = signer.sign(text.as_bytes())?;
        let mut raw = Vec::with_capacity(4 + sig.len());
        raw.extend_from_slice(&signer.key_hash().to_be_bytes());
        raw.extend_from_slice(&sig);
        out.push_str(SIG_PREFIX);
        out.push_str(signer.name());
        out.push(' ');
        out.push_str(&STANDARD.encode(raw));
        out.push('\n');
    }
    Ok(out.into_bytes())
}

/// Ed25519 note verifier.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    name: String,
    hash: u32,
    key: PublicKey,
}

impl Ed25519Verifier {
    /// Parse a `name+hash+base64(0x01 || key)` verifier key.
    pub fn from_key(vkey: &str) -> Result<Self, NoteError> {
        let invalid = || NoteError::InvalidKey(format!("malformed verifier key {vkey:?}"));
        let (name, rest) = vkey.split_once('+').ok_or_else(invalid)?;
        let (hash_hex, key_b64) = rest.split_once('+').ok_or_else(invalid)?;
        if !valid_name(name) || hash_hex.len() != 8 {
            return Err(invalid());
        }
        let hash = u32::from_str_radix(hash_hex, 16).map_err(|_| invalid())?;
        let key = STANDARD.decode(key_b64).map_err(|_| invalid())?;
        if key.len() != 1 + PublicKey::BYTES || key[0] != ALG_ED25519 {
            return Err(NoteError::InvalidKey(format!(
                "verifier key for {name} is not an Ed25519 key"
            )));
        }
        if key_hash(name, &key) != hash {
            return Err(NoteError::InvalidKey(format!(
                "verifier key hash mismatch for {name}"
            )));
        }
        let pk = PublicKey::from_slice(&key[1..]).map_err(|e| NoteError::InvalidKey(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            hash,
            key: pk,
        })
    }

    /// Render the verifier key string.
    pub fn to_key(&self) -> String {
        let mut key = vec![ALG_ED25519];
        key.extend_from_slice(&self.key[..]);
        format!("{}+{:08x}+{}", self.name, self.hash, STANDARD.encode(key))
    }
}

impl NoteVerifier for Ed25519Verifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_hash(&self) -> u32 {
        self.hash
    }

    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        match Signature::from_slice(sig) {
            Ok(sig) => self.key.verify(msg, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// Ed25519 note signer.
#[derive(Debug, Clone)]
pub struct Ed25519Signer {
    name: String,
    hash: u32,
    keypair: KeyPair,
}

impl Ed25519Signer {
    /// Parse a `PRIVATE+KEY+name+hash+base64(0x01 || seed)` signer key.
    pub fn from_key(skey: &str) -> Result<Self, NoteError> {
        let invalid = || NoteError::InvalidKey("malformed signer key".to_string());
        let rest = skey.strip_prefix(PRIVATE_KEY_PREFIX).ok_or_else(invalid)?;
        let (name, rest) = rest.split_once('+').ok_or_else(invalid)?;
        let (hash_hex, key_b64) = rest.split_once('+').ok_or_else(invalid)?;
        if !valid_name(name) || hash_hex.len() != 8 {
            return Err(invalid());
        }
        let hash = u32::from_str_radix(hash_hex, 16).map_err(|_| invalid())?;
        let key = STANDARD.decode(key_b64).map_err(|_| invalid())?;
        if key.len() != 1 + Seed::BYTES || key[0] != ALG_ED25519 {
            return Err(invalid());
        }
        let seed = Seed::from_slice(&key[1..]).map_err(|e| NoteError::InvalidKey(e.to_string()))?;
        let signer = Self::from_seed(name, seed);
        if signer.hash != hash {
            return Err(NoteError::InvalidKey(format!("signer key hash mismatch for {name}")));
        }
        Ok(signer)
    }

    /// Create a fresh key pair for `name`.
    pub fn generate(name: &str) -> Result<Self, NoteError> {
        if !valid_name(name) {
            return Err(NoteError::InvalidKey(format!("bad key name {name:?}")));
        }
        Ok(Self::from_seed(name, KeyPair::generate().sk.seed()))
    }

    fn from_seed(name: &str, seed: Seed) -> Self {
        let keypair = KeyPair::from_seed(seed);
        let mut public = vec![ALG_ED25519];
        public.extend_from_slice(&keypair.pk[..]);
        Self {
            name: name.to_string(),
            hash: key_hash(name, &public),
            keypair,
        }
    }

    /// Render the signer key string.
    pub fn to_key(&self) -> String {
        let mut key = vec![ALG_ED25519];
        key.extend_from_slice(&self.keypair.sk.seed()[..]);
        format!(
            "{PRIVATE_KEY_PREFIX}{}+{:08x}+{}",
            self.name,
            self.hash,
            STANDARD.encode(key)
        )
    }

    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier {
            name: self.name.clone(),
            hash: self.hash,
            key: self.keypair.pk.clone(),
        }
    }
}

impl NoteSigner for Ed25519Signer {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_hash(&self) -> u32 {
        self.hash
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, NoteError> {
        Ok(self.keypair.sk.sign(msg, None)[..].to_vec())
    }
}
