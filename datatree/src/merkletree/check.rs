//! Invariant walkers used by tests: hash-consistency checks over one tree,
//! and structural comparison between two trees (e.g. a live tree against its
//! reloaded or recovered double). All of them panic on the first mismatch.

use crate::def::{bits_tree_tag, twig_tree_tag, TWIG_ROOT_TAG};
use crate::merkletree::tree::Tree;
use crate::merkletree::twig::{Twig, TwigMt};
use crate::utils::hasher;

/// Checks that every internal node of a twig's left tree hashes its
/// children.
pub fn check_mt(mt: &TwigMt) {
    let mut level = 10i32;
    let mut stride = 1usize;
    while stride <= 1024 {
        for i in stride..2 * stride {
            let want = hasher::hash2(level as u8, mt[2 * i], mt[2 * i + 1]);
            if mt[i] != want {
                panic!("left-tree mismatch at index {} (children level {})", i, level);
            }
        }
        stride *= 2;
        level -= 1;
    }
}

/// Checks a twig's bitmap summaries and roots against its bitmap.
pub fn check_twig(twig_id: u64, twig: &Twig) {
    for slot in 0..4 {
        let want = hasher::hash1(8, twig.active_bits.chunk(slot));
        assert_eq!(
            twig.active_bits_mtl1[slot], want,
            "twig {} bitmap level 1 slot {}",
            twig_id, slot
        );
    }
    for pair in 0..2 {
        let want = hasher::hash2(
            9,
            twig.active_bits_mtl1[2 * pair],
            twig.active_bits_mtl1[2 * pair + 1],
        );
        assert_eq!(
            twig.active_bits_mtl2[pair], want,
            "twig {} bitmap level 2 pair {}",
            twig_id, pair
        );
    }
    assert_eq!(
        twig.active_bits_mtl3,
        hasher::hash2(10, twig.active_bits_mtl2[0], twig.active_bits_mtl2[1]),
        "twig {} bitmap root",
        twig_id
    );
    assert_eq!(
        twig.twig_root,
        hasher::hash2(TWIG_ROOT_TAG, twig.left_root, twig.active_bits_mtl3),
        "twig {} root",
        twig_id
    );
}

/// Checks every cached upper-tree node against its children. Nodes whose
/// children fell behind the prune frontier are skipped.
pub fn check_upper_nodes(tree: &Tree) {
    for (pos, parent) in tree.upper_tree.nodes.iter() {
        let level = pos.level();
        if level == 0 {
            continue; // evicted leaves have nothing below them in the cache
        }
        let bits = pos.in_bits_tree();
        let left = tree.upper_node_hash(bits, level - 1, 2 * pos.nth());
        let right = tree.upper_node_hash(bits, level - 1, 2 * pos.nth() + 1);
        let (left, right) = match (left, right) {
            (Ok(l), Ok(r)) => (l, r),
            _ => continue,
        };
        let tag = if bits {
            bits_tree_tag(level)
        } else {
            twig_tree_tag(level)
        };
        assert_eq!(
            *parent,
            hasher::hash2(tag, left, right),
            "upper node mismatch: bits={} level={} nth={}",
            bits,
            level,
            pos.nth()
        );
    }
}

/// Full hash-consistency sweep over one tree.
pub fn check_hash_consistency(tree: &Tree) {
    for (&twig_id, twig) in tree.active_twigs.iter() {
        check_twig(twig_id, twig);
    }
    check_upper_nodes(tree);
    check_mt(&tree.mtree_for_youngest_twig);
}

/// Asserts both trees hold identical twig-level state: counters, active
/// twigs, bitmaps, and the youngest twig's left tree.
pub fn compare_tree_twigs(a: &Tree, b: &Tree) {
    assert_eq!(a.next_sn, b.next_sn, "next serial number");
    assert_eq!(a.youngest_twig_id, b.youngest_twig_id, "youngest twig id");
    assert_eq!(a.oldest_twig_id, b.oldest_twig_id, "oldest twig id");
    assert_eq!(a.pruned_to_twig_id, b.pruned_to_twig_id, "prune frontier");
    let mut a_ids: Vec<u64> = a.active_twigs.keys().copied().collect();
    let mut b_ids: Vec<u64> = b.active_twigs.keys().copied().collect();
    a_ids.sort_unstable();
    b_ids.sort_unstable();
    assert_eq!(a_ids, b_ids, "active twig sets");
    for id in a_ids {
        let (ta, tb) = (&a.active_twigs[&id], &b.active_twigs[&id]);
        assert_eq!(ta, tb, "twig {}", id);
    }
    assert_eq!(
        &a.mtree_for_youngest_twig[..],
        &b.mtree_for_youngest_twig[..],
        "youngest twig left tree"
    );
}

/// Asserts `a`'s node cache is contained in (`subset`) or equal to `b`'s.
pub fn compare_tree_nodes(a: &Tree, b: &Tree, subset: bool) {
    if !subset {
        assert_eq!(
            a.upper_tree.nodes.len(),
            b.upper_tree.nodes.len(),
            "node cache sizes"
        );
    }
    for (pos, hash) in a.upper_tree.nodes.iter() {
        let other = b.upper_tree.nodes.get(pos).unwrap_or_else(|| {
            panic!(
                "node missing: bits={} level={} nth={}",
                pos.in_bits_tree(),
                pos.level(),
                pos.nth()
            )
        });
        assert_eq!(
            hash,
            other,
            "node value: bits={} level={} nth={}",
            pos.in_bits_tree(),
            pos.level(),
            pos.nth()
        );
    }
}
