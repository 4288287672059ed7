//! Inclusion proofs for serial-numbered entries.
//!
//! A proof carries the entry's leaf hash, its eleven siblings inside the
//! twig, the twig's bitmap root (needed to recompute the twig root), the
//! sibling chain through the twig-root tree up to the fixed top, the
//! active-bits tree's top (the combining sibling) and the root. Verification
//! refolds the chain, picking left or right at each step from the serial
//! number's bits (twig layer) and the twig id's bits (upper layer).

use crate::def::{
    slot_of, twig_id_of, twig_tree_tag, LEAF_COUNT_IN_TWIG, MAX_UPPER_LEVEL, ROOT_COMBINE_TAG,
    TWIG_ROOT_TAG,
};
use crate::error::{Result, TreeError};
use crate::merkletree::tree::Tree;
use crate::merkletree::twig::NULL_TWIG;
use crate::utils::hasher::{self, Hash32, ZERO_HASH32};
use byteorder::{ByteOrder, LittleEndian};
use std::io;

const TWIG_LEVELS: usize = 11;
// leaf + twig siblings + bitmap root + upper siblings + combining + root
const HASH_COUNT: usize = 1 + TWIG_LEVELS + 1 + MAX_UPPER_LEVEL as usize + 1 + 1;
const HEADER_SIZE: usize = 8 + 8 + 4;

/// A serialized-friendly inclusion proof for one serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofPath {
    pub serial_num: i64,
    /// Leaf hash of the proven entry.
    pub leaf: Hash32,
    /// Siblings inside the twig's left tree, leaf level first.
    pub twig_siblings: [Hash32; TWIG_LEVELS],
    /// The twig's bitmap root.
    pub active_bits_mtl3: Hash32,
    /// Siblings through the twig-root tree, lowest upper level first.
    pub upper_siblings: [Hash32; MAX_UPPER_LEVEL as usize],
    /// Top of the active-bits tree.
    pub combining_sibling: Hash32,
    /// Block root the proof commits to.
    pub root: Hash32,
}

impl ProofPath {
    pub fn twig_id(&self) -> u64 {
        twig_id_of(self.serial_num)
    }

    /// Recomputes the root from the path. With `expect_root_match` the
    /// result must equal the stored root. Returns the recomputed root.
    pub fn check(&self, expect_root_match: bool) -> Result<Hash32> {
        let slot = slot_of(self.serial_num) as u64;
        let mut cur = self.leaf;
        for (level, sibling) in self.twig_siblings.iter().enumerate() {
            let self_is_right = (slot >> level) & 1 == 1;
            cur = hasher::hash2x(level as u8, cur, *sibling, self_is_right);
        }
        cur = hasher::hash2(TWIG_ROOT_TAG, cur, self.active_bits_mtl3);
        let twig_id = self.twig_id();
        for level in 1..=MAX_UPPER_LEVEL {
            let sibling = self.upper_siblings[level as usize - 1];
            let self_is_right = (twig_id >> (level - 1)) & 1 == 1;
            cur = hasher::hash2x(twig_tree_tag(level), cur, sibling, self_is_right);
        }
        let root = hasher::hash2(ROOT_COMBINE_TAG, self.combining_sibling, cur);
        if expect_root_match && root != self.root {
            return Err(TreeError::corrupt("proof does not match its root", 0));
        }
        Ok(root)
    }

    /// Serializes as a header (serial number, twig id, hash count) followed
    /// by the hashes in path order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(HEADER_SIZE + HASH_COUNT * 32);
        let mut num = [0u8; 8];
        LittleEndian::write_i64(&mut num, self.serial_num);
        res.extend_from_slice(&num);
        LittleEndian::write_u64(&mut num, self.twig_id());
        res.extend_from_slice(&num);
        LittleEndian::write_u32(&mut num[..4], HASH_COUNT as u32);
        res.extend_from_slice(&num[..4]);
        res.extend_from_slice(&self.leaf);
        for h in &self.twig_siblings {
            res.extend_from_slice(h);
        }
        res.extend_from_slice(&self.active_bits_mtl3);
        for h in &self.upper_siblings {
            res.extend_from_slice(h);
        }
        res.extend_from_slice(&self.combining_sibling);
        res.extend_from_slice(&self.root);
        res
    }
}

/// Parses a proof serialized by [`ProofPath::to_bytes`].
pub fn bytes_to_proof_path(bz: &[u8]) -> Result<ProofPath> {
    if bz.len() != HEADER_SIZE + HASH_COUNT * 32 {
        return Err(TreeError::corrupt("proof blob has the wrong length", 0));
    }
    let serial_num = LittleEndian::read_i64(&bz[..8]);
    let twig_id = LittleEndian::read_u64(&bz[8..16]);
    let count = LittleEndian::read_u32(&bz[16..20]) as usize;
    if serial_num < 0 || twig_id != twig_id_of(serial_num) || count != HASH_COUNT {
        return Err(TreeError::corrupt("proof header is inconsistent", 0));
    }
    let mut hashes = bz[HEADER_SIZE..].chunks_exact(32);
    let mut take = || {
        let mut h = ZERO_HASH32;
        h.copy_from_slice(hashes.next().unwrap());
        h
    };
    let leaf = take();
    let mut twig_siblings = [ZERO_HASH32; TWIG_LEVELS];
    for h in twig_siblings.iter_mut() {
        *h = take();
    }
    let active_bits_mtl3 = take();
    let mut upper_siblings = [ZERO_HASH32; MAX_UPPER_LEVEL as usize];
    for h in upper_siblings.iter_mut() {
        *h = take();
    }
    let combining_sibling = take();
    let root = take();
    Ok(ProofPath {
        serial_num,
        leaf,
        twig_siblings,
        active_bits_mtl3,
        upper_siblings,
        combining_sibling,
        root,
    })
}

impl Tree {
    /// Builds the inclusion proof of `sn` against the current root. Callable
    /// between blocks only; serial numbers inside the youngest twig that were
    /// not appended yet prove as null leaves.
    pub fn get_proof(&self, sn: i64) -> Result<ProofPath> {
        if self.has_pending_updates() {
            return Err(TreeError::bug("get_proof called inside a block"));
        }
        if sn < 0 {
            return Err(TreeError::bug(format!("invalid serial number {}", sn)));
        }
        let twig_id = twig_id_of(sn);
        if twig_id > self.youngest_twig_id {
            return Err(TreeError::bug(format!("serial number {} is unallocated", sn)));
        }
        if twig_id < self.pruned_to_twig_id {
            return Err(TreeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("twig {} was head-pruned", twig_id),
            )));
        }
        let slot = slot_of(sn);

        let mut leaf = ZERO_HASH32;
        let mut twig_siblings = [ZERO_HASH32; TWIG_LEVELS];
        let mut idx = LEAF_COUNT_IN_TWIG + slot;
        if twig_id == self.youngest_twig_id {
            leaf = self.mtree_for_youngest_twig[idx as usize];
            for sibling in twig_siblings.iter_mut() {
                *sibling = self.mtree_for_youngest_twig[(idx ^ 1) as usize];
                idx >>= 1;
            }
        } else {
            let tf = self.twig_file();
            tf.get_hash_node(twig_id, idx, &mut leaf)?;
            for sibling in twig_siblings.iter_mut() {
                tf.get_hash_node(twig_id, idx ^ 1, sibling)?;
                idx >>= 1;
            }
        }

        let active_bits_mtl3 = match self.active_twigs.get(&twig_id) {
            Some(twig) => twig.active_bits_mtl3,
            // evicted twigs hold no live entries, their bitmap is all zero
            None => NULL_TWIG.active_bits_mtl3,
        };

        let mut upper_siblings = [ZERO_HASH32; MAX_UPPER_LEVEL as usize];
        for level in 1..=MAX_UPPER_LEVEL {
            let nth = (twig_id >> (level - 1)) ^ 1;
            upper_siblings[level as usize - 1] = self.upper_node_hash(false, level - 1, nth)?;
        }
        let combining_sibling = self.upper_node_hash(true, MAX_UPPER_LEVEL, 0)?;
        let root = self.root()?;

        let path = ProofPath {
            serial_num: sn,
            leaf,
            twig_siblings,
            active_bits_mtl3,
            upper_siblings,
            combining_sibling,
            root,
        };
        debug_assert_eq!(path.check(false).unwrap(), root);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let mut path = ProofPath {
            serial_num: 2048 * 3 + 17,
            leaf: [1; 32],
            twig_siblings: [[2; 32]; TWIG_LEVELS],
            active_bits_mtl3: [3; 32],
            upper_siblings: [[4; 32]; MAX_UPPER_LEVEL as usize],
            combining_sibling: [5; 32],
            root: [6; 32],
        };
        path.twig_siblings[7] = [77; 32];
        path.upper_siblings[13] = [13; 32];
        let bz = path.to_bytes();
        let got = bytes_to_proof_path(&bz).unwrap();
        assert_eq!(path, got);

        // a tampered header is rejected
        let mut bad = bz.clone();
        bad[8] ^= 0xff; // twig id no longer matches the serial number
        assert!(bytes_to_proof_path(&bad).is_err());
        assert!(bytes_to_proof_path(&bz[..bz.len() - 1]).is_err());
    }

    #[test]
    fn check_detects_tampering() {
        // build a self-consistent path over arbitrary hashes
        let mut path = ProofPath {
            serial_num: 5,
            leaf: [9; 32],
            twig_siblings: [[8; 32]; TWIG_LEVELS],
            active_bits_mtl3: [7; 32],
            upper_siblings: [[6; 32]; MAX_UPPER_LEVEL as usize],
            combining_sibling: [5; 32],
            root: ZERO_HASH32,
        };
        path.root = path.check(false).unwrap();
        path.check(true).unwrap();

        let mut bad = path.clone();
        bad.leaf[0] ^= 1;
        assert!(bad.check(true).is_err());
        let mut bad = path;
        bad.combining_sibling[0] ^= 1;
        assert!(bad.check(true).is_err());
    }
}
