//! Merkle root computation over chunk checksums.
//!
//! The root condenses the ordered chunk checksums into one 32-byte value
//! that both endpoints can compute independently at completion time. Any
//! difference in chunk content, order, or count changes the root.

use sha2::{Digest, Sha256};

/// Computes the Merkle root over ordered chunk checksums.
///
/// Pairs of nodes are hashed together level by level; an unpaired node at
/// the end of a level is promoted unchanged. A single checksum is its own
/// root. Returns `None` for an empty list, which has no meaningful root.
#[must_use]
pub fn merkle_root(checksums: &[[u8; 32]]) -> Option<[u8; 32]> {
    if checksums.is_empty() {
        return None;
    }

    let mut level = checksums.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    next.push(hasher.finalize().into());
                }
                [odd] => next.push(*odd),
                _ => unreachable!("chunks(2) yields one or two elements"),
            }
        }
        level = next;
    }

    Some(level[0])
}
