//! Rebuilding a tree from disk, with or without edge-node hints.
//!
//! An edge node is an upper-tree node on the frontier between "only
//! reachable through pruned history" and "recomputable from the on-disk
//! twigs". [`recover_tree`] seeds the node cache with the edge nodes, rebuilds
//! the roots of evicted-but-unpruned twigs from the twig-MT file, replays the
//! entry log to re-derive every active twig's bitmap and leaf hashes, and
//! syncs the upper trees; the caller compares the returned root against its
//! durable copy. [`load_tree`] is the hint-free variant for stores that were
//! never head-pruned: it scans everything from offset zero.

use crate::config::Config;
use crate::def::{slot_of, twig_id_of, TWIG_MASK, TWIG_ROOT_TAG, TWIG_SHIFT};
use crate::entryfile::entry::Entry;
use crate::error::{Result, TreeError};
use crate::merkletree::tree::{NodePos, Tree};
use crate::merkletree::twig::{self, NULL_MT_FOR_TWIG, NULL_TWIG};
use crate::merkletree::twigfile::TWIG_SIZE;
use crate::utils::hasher::{self, Hash32, ZERO_HASH32};
use byteorder::{ByteOrder, LittleEndian};
use hpfile::PreReader;
use log::{debug, info};

/// One upper-tree node on the prune frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeNode {
    pub pos: NodePos,
    pub value: Hash32,
}

const EDGE_STRIDE: usize = 4 + 8 + 32;
const BITS_TREE_LEVEL_FLAG: u32 = 1 << 31;

/// Serializes edge nodes as a count-prefixed list of
/// `(level:u32, position:u64, hash:[32])` records; bit 31 of the level marks
/// the active-bits tree.
pub fn edge_nodes_to_bytes(edge_nodes: &[EdgeNode]) -> Vec<u8> {
    let mut res = Vec::with_capacity(4 + edge_nodes.len() * EDGE_STRIDE);
    let mut num = [0u8; 8];
    LittleEndian::write_u32(&mut num[..4], edge_nodes.len() as u32);
    res.extend_from_slice(&num[..4]);
    for node in edge_nodes {
        let mut level = node.pos.level() as u32;
        if node.pos.in_bits_tree() {
            level |= BITS_TREE_LEVEL_FLAG;
        }
        LittleEndian::write_u32(&mut num[..4], level);
        res.extend_from_slice(&num[..4]);
        LittleEndian::write_u64(&mut num, node.pos.nth());
        res.extend_from_slice(&num);
        res.extend_from_slice(&node.value);
    }
    res
}

/// Parses a blob produced by [`edge_nodes_to_bytes`].
pub fn bytes_to_edge_nodes(bz: &[u8]) -> Result<Vec<EdgeNode>> {
    if bz.len() < 4 {
        return Err(TreeError::corrupt("edge-node blob is too short", 0));
    }
    let count = LittleEndian::read_u32(&bz[..4]) as usize;
    if bz.len() != 4 + count * EDGE_STRIDE {
        return Err(TreeError::corrupt("edge-node blob has the wrong length", 0));
    }
    let mut res = Vec::with_capacity(count);
    for i in 0..count {
        let at = 4 + i * EDGE_STRIDE;
        let level = LittleEndian::read_u32(&bz[at..at + 4]);
        let nth = LittleEndian::read_u64(&bz[at + 4..at + 12]);
        let bits_tree = level & BITS_TREE_LEVEL_FLAG != 0;
        let pos = NodePos::new(bits_tree, (level & !BITS_TREE_LEVEL_FLAG) as u8, nth);
        let mut value = ZERO_HASH32;
        value.copy_from_slice(&bz[at + 12..at + EDGE_STRIDE]);
        res.push(EdgeNode { pos, value });
    }
    Ok(res)
}

impl Tree {
    // Replays one entry during recovery: deactivations first, then the
    // appended serial number itself.
    fn replay_entry(
        &mut self,
        entry: &Entry,
        deact_list: &[i64],
        oldest_twig_id: u64,
        next_pos: i64,
    ) -> Result<()> {
        let sn = entry.serial_num;
        if sn != self.next_sn {
            return Err(TreeError::corrupt(
                format!("serial number gap: want {}, read {}", self.next_sn, sn),
                next_pos,
            ));
        }
        for &d in deact_list {
            if twig_id_of(d) < oldest_twig_id {
                continue; // deactivation inside an already-evicted twig
            }
            let twig = self
                .active_twigs
                .get_mut(&twig_id_of(d))
                .ok_or_else(|| TreeError::Recovery(format!("deactivation of {} has no twig", d)))?;
            twig.active_bits.clear_bit(slot_of(d));
        }
        let twig_id = twig_id_of(sn);
        let slot = slot_of(sn);
        if !entry.is_filler() {
            let twig = self
                .active_twigs
                .get_mut(&twig_id)
                .ok_or_else(|| TreeError::Recovery(format!("entry {} has no twig", sn)))?;
            twig.active_bits.set_bit(slot);
        }
        self.mtree_for_youngest_twig[(2048 + slot) as usize] = entry.hash(deact_list);
        self.next_sn = sn + 1;

        if slot == TWIG_MASK {
            // the twig is complete: finish its left tree and roll over
            twig::sync_mtree(&mut self.mtree_for_youngest_twig, 0, TWIG_MASK);
            let left_root = self.mtree_for_youngest_twig[1];
            let twig = self.active_twigs.get_mut(&twig_id).unwrap();
            twig.left_root = left_root;
            self.youngest_twig_id = twig_id + 1;
            let mut fresh = Box::new(NULL_TWIG.as_ref().clone());
            fresh.first_entry_pos = next_pos;
            self.active_twigs.insert(self.youngest_twig_id, fresh);
            self.mtree_for_youngest_twig = NULL_MT_FOR_TWIG.clone();
        } else {
            self.youngest_twig_id = twig_id;
        }
        Ok(())
    }

    // Scans the entry log from `start` and replays everything.
    fn replay_entries(&mut self, start: i64, oldest_twig_id: u64) -> Result<()> {
        let size = self.entry_file().size();
        let mut pre = PreReader::new();
        let mut pos = start;
        while pos < size {
            let (entry, deact, next) = self
                .entry_file()
                .read_entry_with_pre_reader(pos, &mut pre)?;
            self.replay_entry(&entry, &deact, oldest_twig_id, next)?;
            pos = next;
        }
        Ok(())
    }

    // Refolds the bitmap summaries, twig roots and the left root of the
    // youngest twig after a replay.
    fn sync_replayed_twigs(&mut self) -> Result<Vec<u64>> {
        let youngest = self.youngest_twig_id;
        // the youngest twig's left tree was rebuilt leaf by leaf
        twig::sync_mtree(&mut self.mtree_for_youngest_twig, 0, TWIG_MASK);
        let left_root = self.mtree_for_youngest_twig[1];
        let mut n_list = Vec::new();
        let oldest = self.oldest_twig_id;
        for twig_id in oldest..=youngest {
            let twig = self
                .active_twigs
                .get_mut(&twig_id)
                .ok_or_else(|| TreeError::Recovery(format!("twig {} missing after replay", twig_id)))?;
            if twig_id == youngest {
                twig.left_root = left_root;
            }
            for slot in 0..4 {
                twig.sync_l1(slot);
            }
            twig.sync_l2();
            twig.sync_l3();
            twig.sync_top();
            if n_list.last() != Some(&(twig_id / 2)) {
                n_list.push(twig_id / 2);
            }
        }
        Ok(n_list)
    }
}

fn recover_impl(
    mut tree: Tree,
    edge_nodes: &[EdgeNode],
    last_pruned_twig_id: u64,
    oldest_twig_id: u64,
    youngest_twig_id: u64,
) -> Result<(Tree, Hash32)> {
    tree.pruned_to_twig_id = last_pruned_twig_id;
    tree.oldest_twig_id = oldest_twig_id;
    tree.next_sn = (oldest_twig_id << TWIG_SHIFT) as i64;

    for node in edge_nodes {
        tree.upper_tree.set(node.pos, node.value);
    }

    // twig roots of evicted twigs come from the twig-MT file; a level-0 edge
    // node already covers the twig left of an odd frontier
    let mut start_inactive = last_pruned_twig_id;
    for node in edge_nodes {
        if !node.pos.in_bits_tree() && node.pos.level() == 0 {
            start_inactive = start_inactive.max(node.pos.nth() + 1);
        }
    }
    for twig_id in start_inactive..oldest_twig_id {
        let mut left_root = ZERO_HASH32;
        tree.twig_file().get_hash_root(twig_id, &mut left_root)?;
        let twig_root = hasher::hash2(TWIG_ROOT_TAG, left_root, NULL_TWIG.active_bits_mtl3);
        tree.upper_tree.set(NodePos::twig_tree(0, twig_id), twig_root);
        tree.upper_tree
            .set(NodePos::bits_tree(0, twig_id), NULL_TWIG.active_bits_mtl3);
    }

    let scan_start = tree.twig_file().get_first_entry_pos(oldest_twig_id)?;
    let mut oldest = Box::new(NULL_TWIG.as_ref().clone());
    oldest.first_entry_pos = scan_start;
    tree.active_twigs.insert(oldest_twig_id, oldest);
    tree.youngest_twig_id = oldest_twig_id;

    debug!(
        "recover: edges={} pruned_to={} oldest={} scan from {}",
        edge_nodes.len(),
        last_pruned_twig_id,
        oldest_twig_id,
        scan_start
    );
    tree.replay_entries(scan_start, oldest_twig_id)?;
    if tree.youngest_twig_id != youngest_twig_id {
        return Err(TreeError::Recovery(format!(
            "twig range mismatch: scanned up to {}, expected {}",
            tree.youngest_twig_id, youngest_twig_id
        )));
    }

    let replayed = tree.sync_replayed_twigs()?;
    let mut n_list: Vec<u64> = Vec::new();
    for twig_id in start_inactive..oldest_twig_id {
        if n_list.last() != Some(&(twig_id / 2)) {
            n_list.push(twig_id / 2);
        }
    }
    for nth in replayed {
        if n_list.last() != Some(&nth) {
            n_list.push(nth);
        }
    }
    let root = tree.sync_upper_nodes(n_list)?;
    info!(
        "recovered tree: twigs {}..={}, next sn {}",
        tree.oldest_twig_id, tree.youngest_twig_id, tree.next_sn
    );
    Ok((tree, root))
}

/// Rebuilds a tree from `config.dir` plus an edge-node snapshot.
///
/// `file_sizes` is `[entry_file_size, twig_file_size]` as of the snapshot;
/// both files are truncated to it first, discarding bytes written after the
/// snapshot's block fence. The caller is expected to compare the returned
/// root against its durable copy.
pub fn recover_tree(
    config: &Config,
    edge_nodes: &[EdgeNode],
    last_pruned_twig_id: u64,
    oldest_twig_id: u64,
    youngest_twig_id: u64,
    file_sizes: [i64; 2],
) -> Result<(Tree, Hash32)> {
    let mut tree = Tree::blank(config)?;
    tree.truncate_files(file_sizes[0], file_sizes[1])?;
    recover_impl(
        tree,
        edge_nodes,
        last_pruned_twig_id,
        oldest_twig_id,
        youngest_twig_id,
    )
}

/// Rebuilds a tree by scanning the whole entry log, without edge-node hints.
/// Only valid while nothing has been head-pruned. `oldest_twig_id` is the
/// eviction frontier, which is not derivable from disk.
pub fn load_tree(config: &Config, oldest_twig_id: u64) -> Result<(Tree, Hash32)> {
    let tree = Tree::blank(config)?;
    let youngest_twig_id = (tree.twig_file_size() / TWIG_SIZE) as u64;
    recover_impl(tree, &[], 0, oldest_twig_id, youngest_twig_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_node_blob_round_trip() {
        let nodes = vec![
            EdgeNode {
                pos: NodePos::twig_tree(0, 7),
                value: [1; 32],
            },
            EdgeNode {
                pos: NodePos::bits_tree(0, 7),
                value: [2; 32],
            },
            EdgeNode {
                pos: NodePos::twig_tree(5, 123),
                value: [3; 32],
            },
            EdgeNode {
                pos: NodePos::bits_tree(52, 0),
                value: [4; 32],
            },
        ];
        let bz = edge_nodes_to_bytes(&nodes);
        assert_eq!(bz.len(), 4 + nodes.len() * EDGE_STRIDE);
        let got = bytes_to_edge_nodes(&bz).unwrap();
        assert_eq!(nodes, got);

        assert!(bytes_to_edge_nodes(&bz[..bz.len() - 1]).is_err());
        assert!(bytes_to_edge_nodes(&[]).is_err());
        assert_eq!(bytes_to_edge_nodes(&edge_nodes_to_bytes(&[])).unwrap(), vec![]);
    }
}
