//! SHA-256 hashing with single-byte domain tags.
//!
//! Every internal node of the tree hashes a tag byte before its inputs; the
//! tag encodes which layer the node lives in (see `def` for the tag map), so
//! nodes from different layers can never be confused. Entry leaves are plain
//! SHA-256 over the entry payload.

use sha2::{Digest, Sha256};

/// A 32-byte hash value.
pub type Hash32 = [u8; 32];

/// All-zero hash, used as a placeholder before a slot is computed.
pub const ZERO_HASH32: Hash32 = [0u8; 32];

/// Plain SHA-256 of `a`.
pub fn hash<T: AsRef<[u8]>>(a: T) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.finalize().into()
}

/// SHA-256 of a tag byte followed by `a`.
pub fn hash1<T: AsRef<[u8]>>(tag: u8, a: T) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(a);
    hasher.finalize().into()
}

/// SHA-256 of a tag byte followed by two child values.
pub fn hash2<A: AsRef<[u8]>, B: AsRef<[u8]>>(tag: u8, a: A, b: B) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// Like [`hash2`], with the child order swapped when `exchange_ab` is set.
/// Proof verification uses this to place the verified node left or right.
pub fn hash2x<A: AsRef<[u8]>, B: AsRef<[u8]>>(tag: u8, a: A, b: B, exchange_ab: bool) -> Hash32 {
    if exchange_ab {
        hash2(tag, b, a)
    } else {
        hash2(tag, a, b)
    }
}

/// In-place variant of [`hash2`] for hot loops over preallocated node arrays.
pub fn node_hash_inplace<A: AsRef<[u8]>, B: AsRef<[u8]>>(
    tag: u8,
    target: &mut [u8],
    src_a: A,
    src_b: B,
) {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(src_a);
    hasher.update(src_b);
    target.copy_from_slice(&hasher.finalize());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_separates_domains() {
        assert_ne!(hash2(1, b"ab", b"cd"), hash2(2, b"ab", b"cd"));
        assert_ne!(hash1(1, b"abcd"), hash2(1, b"ab", b"cd"));
    }

    #[test]
    fn hash2x_swaps() {
        assert_eq!(hash2x(3, b"l", b"r", false), hash2(3, b"l", b"r"));
        assert_eq!(hash2x(3, b"l", b"r", true), hash2(3, b"r", b"l"));
    }

    #[test]
    fn inplace_matches_owned() {
        let mut out = [0u8; 32];
        node_hash_inplace(7, &mut out, b"left", b"right");
        assert_eq!(out, hash2(7, b"left", b"right"));
    }
}
