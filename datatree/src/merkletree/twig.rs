//! Twigs: fixed groups of 2048 entries and their Merkle state.
//!
//! A twig combines two small trees. The left tree hashes the 2048 entry
//! payload hashes through 11 levels into `left_root`. The right side
//! condenses the 2048-bit active bitmap through three summary levels
//! (`active_bits_mtl1/2/3`). `twig_root` ties both together and is what the
//! upper trees see.

use crate::def::{LEAF_COUNT_IN_TWIG, MAX_UPPER_LEVEL, TWIG_ROOT_TAG};
use crate::def::{bits_tree_tag, twig_tree_tag};
use crate::entryfile::entry::Entry;
use crate::utils::hasher::{self, Hash32, ZERO_HASH32};
use lazy_static::lazy_static;

/// Node array of one twig's left tree.
///
/// Node `i` at level `L` (leaves are level 0) is stored at index
/// `(2048 >> L) + i`; the parent of index `i` is `i / 2`, so index 1 holds
/// the left root and indices 2048..4096 hold the leaves.
pub type TwigMt = [Hash32]; // 4096 slots

lazy_static! {
    /// Leaf hash for entries that were never written.
    pub static ref NULL_ENTRY_HASH: Hash32 = Entry::null().hash(&[]);
    /// Fully synced left tree whose every leaf is the null entry hash.
    pub static ref NULL_MT_FOR_TWIG: Box<TwigMt> = make_null_mt();
    /// A twig with no entries and an all-zero bitmap.
    pub static ref NULL_TWIG: Box<Twig> = make_null_twig();
    /// Per-level null nodes of the twig-root upper tree; index 0 is the null
    /// twig's root.
    pub static ref NULL_NODES_IN_TWIG_TREE: [Hash32; MAX_UPPER_LEVEL as usize + 1] =
        make_null_upper(NULL_TWIG.twig_root, twig_tree_tag);
    /// Per-level null nodes of the active-bits upper tree; index 0 is the
    /// null twig's bitmap root.
    pub static ref NULL_NODES_IN_BITS_TREE: [Hash32; MAX_UPPER_LEVEL as usize + 1] =
        make_null_upper(NULL_TWIG.active_bits_mtl3, bits_tree_tag);
}

fn make_null_mt() -> Box<TwigMt> {
    let mut mt = vec![ZERO_HASH32; 4096].into_boxed_slice();
    for leaf in mt.iter_mut().skip(2048) {
        *leaf = *NULL_ENTRY_HASH;
    }
    sync_mtree(&mut mt, 0, LEAF_COUNT_IN_TWIG - 1);
    mt
}

fn make_null_twig() -> Box<Twig> {
    let mut twig = Box::new(Twig::new());
    for slot in 0..4 {
        twig.sync_l1(slot);
    }
    twig.sync_l2();
    twig.sync_l3();
    twig.left_root = NULL_MT_FOR_TWIG[1];
    twig.sync_top();
    twig
}

fn make_null_upper(leaf: Hash32, tag: fn(u8) -> u8) -> [Hash32; MAX_UPPER_LEVEL as usize + 1] {
    let mut nodes = [ZERO_HASH32; MAX_UPPER_LEVEL as usize + 1];
    nodes[0] = leaf;
    for level in 1..=MAX_UPPER_LEVEL {
        let below = nodes[level as usize - 1];
        nodes[level as usize] = hasher::hash2(tag(level), below, below);
    }
    nodes
}

/// Recomputes the internal nodes of a left tree after the leaves in
/// `[start, end]` changed.
pub fn sync_mtree(mt: &mut TwigMt, start: u32, end: u32) {
    debug_assert!(start <= end && end < LEAF_COUNT_IN_TWIG);
    let mut lo = start as usize;
    let mut hi = end as usize;
    for level in 0u8..=10 {
        let base = (LEAF_COUNT_IN_TWIG >> level) as usize;
        let mut j = lo & !1;
        let last = hi | 1;
        while j <= last {
            let i = base + j;
            let h = hasher::hash2(level, &mt[i], &mt[i + 1]);
            mt[i / 2] = h;
            j += 2;
        }
        lo >>= 1;
        hi >>= 1;
    }
}

/// The null left tree's node at `level` (0..=11), any position.
pub fn null_mt_hash(level: u8) -> Hash32 {
    debug_assert!(level <= 11);
    NULL_MT_FOR_TWIG[(2048 >> level) as usize]
}

/// In-memory record of one twig.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Twig {
    /// Entry-file offset where this twig's first entry was appended.
    pub first_entry_pos: i64,
    /// Active bitmap: bit `i` is set iff the entry at slot `i` is live.
    pub active_bits: ActiveBits,
    /// First summary level: one hash per 512-bit bitmap chunk.
    pub active_bits_mtl1: [Hash32; 4],
    /// Second summary level.
    pub active_bits_mtl2: [Hash32; 2],
    /// Bitmap root.
    pub active_bits_mtl3: Hash32,
    /// Root over the 2048 entry hashes.
    pub left_root: Hash32,
    /// `H(left_root, active_bits_mtl3)`.
    pub twig_root: Hash32,
}

impl Default for Twig {
    fn default() -> Self {
        Self::new()
    }
}

impl Twig {
    pub fn new() -> Self {
        Self {
            first_entry_pos: 0,
            active_bits: ActiveBits::new(),
            active_bits_mtl1: [ZERO_HASH32; 4],
            active_bits_mtl2: [ZERO_HASH32; 2],
            active_bits_mtl3: ZERO_HASH32,
            left_root: ZERO_HASH32,
            twig_root: ZERO_HASH32,
        }
    }

    /// Recomputes the first-level summary of bitmap chunk `slot` (0..4).
    pub fn sync_l1(&mut self, slot: usize) {
        self.active_bits_mtl1[slot] = hasher::hash1(8, self.active_bits.chunk(slot));
    }

    pub fn sync_l2(&mut self) {
        self.active_bits_mtl2[0] =
            hasher::hash2(9, self.active_bits_mtl1[0], self.active_bits_mtl1[1]);
        self.active_bits_mtl2[1] =
            hasher::hash2(9, self.active_bits_mtl1[2], self.active_bits_mtl1[3]);
    }

    pub fn sync_l3(&mut self) {
        self.active_bits_mtl3 =
            hasher::hash2(10, self.active_bits_mtl2[0], self.active_bits_mtl2[1]);
    }

    pub fn sync_top(&mut self) {
        self.twig_root = hasher::hash2(TWIG_ROOT_TAG, self.left_root, self.active_bits_mtl3);
    }
}

/// 2048-bit active bitmap of one twig.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveBits([u8; 256]);

impl Default for ActiveBits {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveBits {
    pub fn new() -> Self {
        Self([0; 256])
    }

    pub fn set_bit(&mut self, offset: u32) {
        assert!(offset < LEAF_COUNT_IN_TWIG, "bit offset out of range");
        self.0[(offset >> 3) as usize] |= 1 << (offset & 0x7);
    }

    pub fn clear_bit(&mut self, offset: u32) {
        assert!(offset < LEAF_COUNT_IN_TWIG, "bit offset out of range");
        self.0[(offset >> 3) as usize] &= !(1 << (offset & 0x7));
    }

    pub fn get_bit(&self, offset: u32) -> bool {
        assert!(offset < LEAF_COUNT_IN_TWIG, "bit offset out of range");
        self.0[(offset >> 3) as usize] & (1 << (offset & 0x7)) != 0
    }

    /// One of the four 64-byte (512-bit) chunks the summary levels hash.
    pub fn chunk(&self, slot: usize) -> &[u8] {
        &self.0[slot * 64..(slot + 1) * 64]
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }
}


#[cfg(test)]
mod twig_tests {
    use super::*;

    #[test]
    fn incremental_sync_matches_full_sync() {
        let mut a = NULL_MT_FOR_TWIG.clone();
        let mut b = NULL_MT_FOR_TWIG.clone();
        for (i, leaf) in [(3usize, [1u8; 32]), (4, [2u8; 32]), (2047, [3u8; 32])] {
            a[2048 + i] = leaf;
            b[2048 + i] = leaf;
        }
        sync_mtree(&mut a, 0, LEAF_COUNT_IN_TWIG - 1);
        sync_mtree(&mut b, 3, 4);
        sync_mtree(&mut b, 2047, 2047);
        assert_eq!(&a[..], &b[..]);
    }

    #[test]
    fn sync_levels_follow_the_tag_map() {
        let mut twig = Twig::new();
        for offset in [1u32, 700, 2000] {
            twig.active_bits.set_bit(offset);
        }
        for slot in 0..4 {
            twig.sync_l1(slot);
        }
        twig.sync_l2();
        twig.sync_l3();
        twig.left_root = [88; 32];
        twig.sync_top();

        assert_eq!(
            twig.active_bits_mtl1[1],
            hasher::hash1(8, twig.active_bits.chunk(1))
        );
        assert_eq!(
            twig.active_bits_mtl2[0],
            hasher::hash2(9, twig.active_bits_mtl1[0], twig.active_bits_mtl1[1])
        );
        assert_eq!(
            twig.active_bits_mtl3,
            hasher::hash2(10, twig.active_bits_mtl2[0], twig.active_bits_mtl2[1])
        );
        assert_eq!(
            twig.twig_root,
            hasher::hash2(TWIG_ROOT_TAG, twig.left_root, twig.active_bits_mtl3)
        );
    }

    #[test]
    fn null_tables_are_internally_consistent() {
        // every internal node of the null left tree hashes its children
        for i in 1..2048usize {
            assert_eq!(
                NULL_MT_FOR_TWIG[i],
                hasher::hash2(
                    child_tag(i),
                    NULL_MT_FOR_TWIG[2 * i],
                    NULL_MT_FOR_TWIG[2 * i + 1]
                )
            );
        }
        assert_eq!(NULL_TWIG.left_root, NULL_MT_FOR_TWIG[1]);
        assert_eq!(
            NULL_TWIG.twig_root,
            hasher::hash2(TWIG_ROOT_TAG, NULL_TWIG.left_root, NULL_TWIG.active_bits_mtl3)
        );
        assert_eq!(NULL_NODES_IN_TWIG_TREE[0], NULL_TWIG.twig_root);
        assert_eq!(
            NULL_NODES_IN_TWIG_TREE[1],
            hasher::hash2(twig_tree_tag(1), NULL_TWIG.twig_root, NULL_TWIG.twig_root)
        );
        assert_ne!(NULL_NODES_IN_TWIG_TREE[1], NULL_NODES_IN_BITS_TREE[1]);
    }

    // tag used when the node stored at index i was computed: the level of
    // its children (node 1 is the root at level 11, children at 10)
    fn child_tag(i: usize) -> u8 {
        let floor_log2 = (usize::BITS - 1 - i.leading_zeros()) as u8;
        10 - floor_log2
    }
}
