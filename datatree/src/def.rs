//! Constants shared across the data tree.
//!
//! The on-disk values (magic bytes, terminators, entry size limit) must stay
//! bit-exact: they are part of the entry file format. The tree-geometry
//! constants fix how serial numbers map onto twigs and how high the upper
//! trees reach.

/// Marker that opens every entry frame on disk.
pub const MAGIC_BYTES: [u8; 8] = *b"ILOVEYOU";

/// Terminates the magic-position list inside an entry frame.
pub const MAGIC_POS_END: u32 = u32::MAX;

/// Terminates the deactivated-serial-number list inside an entry payload.
pub const DEACT_SN_END: u64 = u64::MAX;

/// Upper bound on the byte length of a serialized entry (~16 MiB).
pub const MAX_ENTRY_BYTES: usize = (1 << 24) - 1;

/// Serial number carried by the null entry.
pub const NULL_SERIAL_NUM: i64 = -1;

/// A twig holds 2^11 leaves.
pub const TWIG_SHIFT: u32 = 11;

/// Number of entry leaves per twig (2048).
pub const LEAF_COUNT_IN_TWIG: u32 = 1 << TWIG_SHIFT;

/// Mask extracting the leaf slot within a twig from a serial number.
pub const TWIG_MASK: u32 = LEAF_COUNT_IN_TWIG - 1;

/// Hash tag combining a twig's left root with its bitmap root.
pub const TWIG_ROOT_TAG: u8 = 11;

/// Height of both upper trees above their per-twig leaves. Serial numbers are
/// non-negative i64, so twig ids fit in 52 bits and position 0 at this level
/// covers the whole twig space.
pub const MAX_UPPER_LEVEL: u8 = 52;

/// Hash tag of the node combining the two upper-tree tops into the root.
pub const ROOT_COMBINE_TAG: u8 = 64;

/// Tag offset separating the active-bits tree from the twig-root tree.
pub const BITS_TREE_TAG_BASE: u8 = 64;

/// Most deactivated serial numbers one entry may carry; longer runs are
/// spread over synthesized filler appends.
pub const DEACTIVED_SN_LIST_MAX_LEN: usize = 64;

/// Fewest twigs `prune_twigs` accepts in one call.
pub const MIN_PRUNE_COUNT: u64 = 2;

/// Subdirectory of the entry log.
pub const ENTRIES_PATH: &str = "entries";

/// Subdirectory of the twig Merkle-tree snapshots.
pub const TWIG_PATH: &str = "twigmt";

/// Twig id owning a serial number.
pub fn twig_id_of(sn: i64) -> u64 {
    debug_assert!(sn >= 0);
    (sn as u64) >> TWIG_SHIFT
}

/// Leaf slot of a serial number within its twig.
pub fn slot_of(sn: i64) -> u32 {
    debug_assert!(sn >= 0);
    (sn as u64 & TWIG_MASK as u64) as u32
}

/// Domain tag for a twig-root-tree node at upper level `level` (1..=52).
pub fn twig_tree_tag(level: u8) -> u8 {
    TWIG_ROOT_TAG + level
}

/// Domain tag for an active-bits-tree node at upper level `level` (1..=52).
pub fn bits_tree_tag(level: u8) -> u8 {
    BITS_TREE_TAG_BASE + TWIG_ROOT_TAG + level
}

/// Decides whether a serial-number range is worth compacting: true when the
/// range has enough entries but too few of them are still active.
///
/// The target utilization is `utilization_ratio / utilization_div`, e.g. 7/10
/// for 70%.
pub fn is_compactible(
    utilization_div: i64,
    utilization_ratio: i64,
    compact_thres: i64,
    active_count: usize,
    sn_start: u64,
    sn_end: u64,
) -> bool {
    if active_count < compact_thres as usize {
        return false;
    }
    let total_count = (sn_end - sn_start) as usize;
    total_count * utilization_ratio as usize >= active_count * utilization_div as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sn_geometry() {
        assert_eq!(twig_id_of(0), 0);
        assert_eq!(twig_id_of(2047), 0);
        assert_eq!(twig_id_of(2048), 1);
        assert_eq!(slot_of(2048), 0);
        assert_eq!(slot_of(4095), 2047);
        assert_eq!(twig_id_of(i64::MAX), (1u64 << 52) - 1);
    }

    #[test]
    fn tags_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for level in 1..=MAX_UPPER_LEVEL {
            assert!(seen.insert(twig_tree_tag(level)));
            assert!(seen.insert(bits_tree_tag(level)));
        }
        assert!(seen.insert(ROOT_COMBINE_TAG));
        assert!(seen.insert(TWIG_ROOT_TAG));
    }

    #[test]
    fn compactible_thresholds() {
        // below the entry threshold: never compact
        assert!(!is_compactible(10, 7, 1000, 800, 0, 10_000));
        // utilization 80% > 70% target: keep as is
        assert!(!is_compactible(10, 7, 100, 800, 0, 1000));
        // utilization 50% < 70% target: compact
        assert!(is_compactible(10, 7, 100, 500, 0, 1000));
    }
}
