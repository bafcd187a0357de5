//! RFC 6962 / RFC 9162 Merkle tree primitives.
//!
//! **Leaf hash**: `SHA-256(0x00 || data)`
//! **Node hash**: `SHA-256(0x01 || left || right)`
//!
//! Verification follows the iterative algorithms of RFC 9162 section 2.1.3.2
//! (inclusion) and 2.1.4.2 (consistency). Proof construction works over any
//! [`HashSource`] able to produce the hash of a perfect subtree.

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{Hash, LogError};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("Leaf index {index} out of range for tree size {size}")]
    IndexOutOfRange { index: u64, size: u64 },

    #[error("Tree size {size1} larger than {size2}")]
    SizeOrder { size1: u64, size2: u64 },

    #[error("Proof has wrong length")]
    WrongLength,

    #[error("Root mismatch: computed {computed}, expected {expected}")]
    RootMismatch { computed: String, expected: String },
}

pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root of the empty tree.
pub fn empty_root() -> Hash {
    Sha256::digest(b"").into()
}

/// Verify that `leaf` is at `index` in the tree of `size` leaves with `root`.
pub fn verify_inclusion(
    index: u64,
    size: u64,
    leaf: &Hash,
    proof: &[Hash],
    root: &Hash,
) -> Result<(), ProofError> {
    if index >= size {
        return Err(ProofError::IndexOutOfRange { index, size });
    }

    let mut fnode = index;
    let mut snode = size - 1;
    let mut r = *leaf;

    for p in proof {
        if snode == 0 {
            return Err(ProofError::WrongLength);
        }
        if fnode & 1 == 1 || fnode == snode {
            r = node_hash(p, &r);
            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            r = node_hash(&r, p);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(ProofError::WrongLength);
    }
    check_root(&r, root)
}

/// Verify that the tree of `size2` leaves with `root2` extends the tree of
/// `size1` leaves with `root1`.
pub fn verify_consistency(
    size1: u64,
    size2: u64,
    proof: &[Hash],
    root1: &Hash,
    root2: &Hash,
) -> Result<(), ProofError> {
    if size1 > size2 {
        return Err(ProofError::SizeOrder { size1, size2 });
    }
    if size1 == size2 {
        if !proof.is_empty() {
            return Err(ProofError::WrongLength);
        }
        return check_root(root2, root1);
    }
    if size1 == 0 {
        // Every tree extends the empty tree.
        return if proof.is_empty() {
            Ok(())
        } else {
            Err(ProofError::WrongLength)
        };
    }
    if proof.is_empty() {
        return Err(ProofError::WrongLength);
    }

    let mut path = Vec::with_capacity(proof.len() + 1);
    if size1.is_power_of_two() {
        path.push(*root1);
    }
    path.extend_from_slice(proof);

    let mut fnode = size1 - 1;
    let mut snode = size2 - 1;
    while fnode & 1 == 1 {
        fnode >>= 1;
        snode >>= 1;
    }

    let mut fr = path[0];
    let mut sr = path[0];
    for c in &path[1..] {
        if snode == 0 {
            return Err(ProofError::WrongLength);
        }
        if fnode & 1 == 1 || fnode == snode {
            fr = node_hash(c, &fr);
            sr = node_hash(c, &sr);
            while fnode & 1 == 0 && fnode != 0 {
                fnode >>= 1;
                snode >>= 1;
            }
        } else {
            sr = node_hash(&sr, c);
        }
        fnode >>= 1;
        snode >>= 1;
    }

    if snode != 0 {
        return Err(ProofError::WrongLength);
    }
    check_root(&fr, root1)?;
    check_root(&sr, root2)
}

fn check_root(computed: &Hash, expected: &Hash) -> Result<(), ProofError> {
    if computed == expected {
        Ok(())
    } else {
        Err(ProofError::RootMismatch {
            computed: hex::encode(computed),
            expected: hex::encode(expected),
        })
    }
}

/// Provides hashes of perfect subtrees.
///
/// `node_hash(level, index)` is the root of the subtree covering leaves
/// `[index << level, (index + 1) << level)`.
pub trait HashSource {
    fn node_hash(&self, level: u8, index: u64) -> Result<Hash, LogError>;
}

/// Builds roots and proofs for a tree of a fixed size.
pub struct ProofBuilder<'a, S: HashSource + ?Sized> {
    source: &'a S,
    size: u64,
}

impl<'a, S: HashSource + ?Sized> ProofBuilder<'a, S> {
    pub fn new(source: &'a S, size: u64) -> Self {
        Self { source, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn root(&self) -> Result<Hash, LogError> {
        if self.size == 0 {
            return Ok(empty_root());
        }
        self.subtree(0, self.size)
    }

    pub fn inclusion_proof(&self, index: u64) -> Result<Vec<Hash>, LogError> {
        if index >= self.size {
            return Err(LogError::OutOfRange {
                what: format!("leaf {index}"),
                size: self.size,
            });
        }
        let mut proof = Vec::new();
        self.path(index, 0, self.size, &mut proof)?;
        Ok(proof)
    }

    /// Proof that this tree extends the tree of `size1` leaves.
    pub fn consistency_proof(&self, size1: u64) -> Result<Vec<Hash>, LogError> {
        if size1 > self.size {
            return Err(LogError::OutOfRange {
                what: format!("consistency from size {size1}"),
                size: self.size,
            });
        }
        let mut proof = Vec::new();
        if size1 > 0 && size1 < self.size {
            self.subproof(size1, 0, self.size, true, &mut proof)?;
        }
        Ok(proof)
    }

    fn subtree(&self, start: u64, end: u64) -> Result<Hash, LogError> {
        let n = end - start;
        if n.is_power_of_two() && start % n == 0 {
            let level = n.trailing_zeros() as u8;
            return self.source.node_hash(level, start >> level);
        }
        let k = split_point(n);
        let left = self.subtree(start, start + k)?;
        let right = self.subtree(start + k, end)?;
        Ok(node_hash(&left, &right))
    }

    fn path(&self, m: u64, start: u64, end: u64, out: &mut Vec<Hash>) -> Result<(), LogError> {
        let n = end - start;
        if n == 1 {
            return Ok(());
        }
        let k = split_point(n);
        if m < start + k {
            self.path(m, start, start + k, out)?;
            out.push(self.subtree(start + k, end)?);
        } else {
            self.path(m, start + k, end, out)?;
            out.push(self.subtree(start, start + k)?);
        }
        Ok(())
    }

    fn subproof(
        &self,
        m: u64,
        start: u64,
        end: u64,
        complete: bool,
        out: &mut Vec<Hash>,
    ) -> Result<(), LogError> {
        let n = end - start;
        if m == n {
            if !complete {
                out.push(self.subtree(start, end)?);
            }
            return Ok(());
        }
        let k = split_point(n);
        if m <= k {
            self.subproof(m, start, start + k, complete, out)?;
            out.push(self.subtree(start + k, end)?);
        } else {
            self.subproof(m - k, start + k, end, false, out)?;
            out.push(self.subtree(start, start + k)?);
        }
        Ok(())
    }
}

/// Largest power of two strictly less than `n` (n > 1).
fn split_point(n: u64) -> u64 {
    1 << (63 - (n - 1).leading_zeros())
}

/// [`HashSource`] over leaf hashes held in memory.
pub struct LeafHashes<'a>(pub &'a [Hash]);

impl HashSource for LeafHashes<'_> {
    fn node_hash(&self, level: u8, index: u64) -> Result<Hash, LogError> {
        if level == 0 {
            return self.0.get(index as usize).copied().ok_or_else(|| LogError::OutOfRange {
                what: format!("leaf {index}"),
                size: self.0.len() as u64,
            });
        }
        let left = self.node_hash(level - 1, index * 2)?;
        let right = self.node_hash(level - 1, index * 2 + 1)?;
        Ok(node_hash(&left, &right))
    }
}
