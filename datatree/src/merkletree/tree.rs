//! The tree engine: an append-only entry log under a twig-structured Merkle
//! forest.
//!
//! All mutations happen on one writer thread, serially. Between two
//! `end_block` calls the engine only tracks dirtiness (bitmap chunks touched,
//! the changed leaf range of the youngest twig); `end_block` recomputes the
//! affected hashes bottom-up and returns the block root together with an
//! edge-node snapshot.
//!
//! Above the twigs sit two sparse trees sharing one node cache: the twig-root
//! tree authenticates each twig's combined root, the active-bits tree its
//! bitmap root. Both are padded with per-level null constants up to a fixed
//! top level and the block root combines the two tops.

use crate::config::Config;
use crate::def::{
    bits_tree_tag, slot_of, twig_id_of, twig_tree_tag, DEACTIVED_SN_LIST_MAX_LEN, ENTRIES_PATH,
    LEAF_COUNT_IN_TWIG, MAX_UPPER_LEVEL, MIN_PRUNE_COUNT, TWIG_MASK, TWIG_PATH,
};
use crate::entryfile::entry::{self, Entry};
use crate::entryfile::{EntryFile, EntryFileWriter};
use crate::error::{Result, TreeError};
use crate::merkletree::recover::{edge_nodes_to_bytes, EdgeNode};
use crate::merkletree::twig::{
    self, Twig, TwigMt, NULL_MT_FOR_TWIG, NULL_NODES_IN_BITS_TREE, NULL_NODES_IN_TWIG_TREE,
    NULL_TWIG,
};
use crate::merkletree::twigfile::{TwigFile, TwigFileWriter, TWIG_SIZE};
use crate::utils::hasher::{self, Hash32};
use log::info;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Packed address of an upper-tree node: one bit selects the active-bits
/// tree, 7 bits the level (0 = per-twig leaves), 56 bits the position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodePos(u64);

impl NodePos {
    const BITS_TREE_FLAG: u64 = 1 << 63;
    const NTH_MASK: u64 = (1 << 56) - 1;

    pub fn twig_tree(level: u8, nth: u64) -> NodePos {
        debug_assert!(level <= MAX_UPPER_LEVEL && nth <= Self::NTH_MASK);
        NodePos(((level as u64) << 56) | nth)
    }

    pub fn bits_tree(level: u8, nth: u64) -> NodePos {
        NodePos(Self::BITS_TREE_FLAG | Self::twig_tree(level, nth).0)
    }

    pub fn new(bits_tree: bool, level: u8, nth: u64) -> NodePos {
        if bits_tree {
            Self::bits_tree(level, nth)
        } else {
            Self::twig_tree(level, nth)
        }
    }

    pub fn in_bits_tree(&self) -> bool {
        self.0 & Self::BITS_TREE_FLAG != 0
    }

    pub fn level(&self) -> u8 {
        ((self.0 >> 56) & 0x7f) as u8
    }

    pub fn nth(&self) -> u64 {
        self.0 & Self::NTH_MASK
    }
}

/// Null node of one upper tree at `level`.
pub fn null_upper_node(bits_tree: bool, level: u8) -> Hash32 {
    if bits_tree {
        NULL_NODES_IN_BITS_TREE[level as usize]
    } else {
        NULL_NODES_IN_TWIG_TREE[level as usize]
    }
}

/// Shared node cache of the two upper trees.
///
/// Level 0 holds the leaves of evicted twigs (their twig root and bitmap
/// root); the leaves of active twigs live in the twig records themselves.
#[derive(Default)]
pub struct UpperTree {
    pub(crate) nodes: HashMap<NodePos, Hash32>,
}

impl UpperTree {
    pub fn new() -> UpperTree {
        UpperTree {
            nodes: HashMap::new(),
        }
    }

    pub fn get(&self, pos: NodePos) -> Option<&Hash32> {
        self.nodes.get(&pos)
    }

    pub fn set(&mut self, pos: NodePos, hash: Hash32) {
        self.nodes.insert(pos, hash);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The engine owning the entry log, the twig records and the upper trees.
pub struct Tree {
    pub(crate) entry_file_wr: EntryFileWriter,
    pub(crate) twig_file_wr: TwigFileWriter,
    dir_name: String,

    pub(crate) youngest_twig_id: u64,
    pub(crate) oldest_twig_id: u64,
    pub(crate) pruned_to_twig_id: u64,
    pub(crate) next_sn: i64,

    pub(crate) active_twigs: HashMap<u64, Box<Twig>>,
    pub(crate) mtree_for_youngest_twig: Box<TwigMt>,
    // changed leaf range of the youngest twig, -1 when clean
    mt_change_start: i32,
    mt_change_end: i32,
    // twigs whose left_root changed since the last end_block
    left_root_dirty: BTreeSet<u64>,
    // 512-bit bitmap chunks touched since the last end_block, keyed by sn>>9
    touched_chunks: BTreeSet<i64>,
    // deactivations waiting to be serialized into the next append
    pending_deact: Vec<i64>,

    pub(crate) upper_tree: UpperTree,
}

impl Tree {
    /// Opens the files without seeding any twig; recovery fills the rest in.
    pub(crate) fn blank(config: &Config) -> Result<Tree> {
        let entry_dir = format!("{}/{}", config.dir, ENTRIES_PATH);
        let twig_dir = format!("{}/{}", config.dir, TWIG_PATH);
        let entry_file = Arc::new(EntryFile::new(
            config.wrbuf_size as i64,
            config.file_segment_size as i64,
            &entry_dir,
        )?);
        let records_per_segment = (config.file_segment_size as i64 / TWIG_SIZE).max(1);
        let twig_file = Arc::new(TwigFile::new(records_per_segment, &twig_dir)?);
        Ok(Tree {
            entry_file_wr: EntryFileWriter::new(entry_file, config.wrbuf_size),
            twig_file_wr: TwigFileWriter::new(twig_file),
            dir_name: config.dir.clone(),
            youngest_twig_id: 0,
            oldest_twig_id: 0,
            pruned_to_twig_id: 0,
            next_sn: 0,
            active_twigs: HashMap::new(),
            mtree_for_youngest_twig: NULL_MT_FOR_TWIG.clone(),
            mt_change_start: -1,
            mt_change_end: -1,
            left_root_dirty: BTreeSet::new(),
            touched_chunks: BTreeSet::new(),
            pending_deact: Vec::new(),
            upper_tree: UpperTree::new(),
        })
    }

    /// Creates a fresh, empty tree under `config.dir`.
    pub fn new(config: &Config) -> Result<Tree> {
        let mut tree = Tree::blank(config)?;
        if tree.entry_file_wr.entry_file.size() != 0 {
            return Err(TreeError::bug(format!(
                "directory {} already holds a tree",
                tree.dir_name
            )));
        }
        tree.active_twigs.insert(0, Box::new(NULL_TWIG.as_ref().clone()));
        Ok(tree)
    }

    pub fn next_serial_num(&self) -> i64 {
        self.next_sn
    }

    pub fn youngest_twig_id(&self) -> u64 {
        self.youngest_twig_id
    }

    pub fn oldest_twig_id(&self) -> u64 {
        self.oldest_twig_id
    }

    pub fn entry_file_size(&self) -> i64 {
        self.entry_file_wr.entry_file.size()
    }

    pub fn twig_file_size(&self) -> i64 {
        self.twig_file_wr.twig_file.size()
    }

    pub(crate) fn entry_file(&self) -> &Arc<EntryFile> {
        &self.entry_file_wr.entry_file
    }

    pub(crate) fn twig_file(&self) -> &Arc<TwigFile> {
        &self.twig_file_wr.twig_file
    }

    // Anything still waiting for end_block?
    pub(crate) fn has_pending_updates(&self) -> bool {
        self.mt_change_start >= 0
            || !self.touched_chunks.is_empty()
            || !self.left_root_dirty.is_empty()
            || !self.pending_deact.is_empty()
    }

    /// Appends an entry; the engine assigns the serial number (the entry's
    /// own `serial_num` field is ignored) and attaches all buffered
    /// deactivations. Returns the entry-file offset.
    pub fn append_entry(&mut self, entry: &Entry) -> Result<i64> {
        let deact = std::mem::take(&mut self.pending_deact);
        self.append_entry_with_deact(entry, deact)
    }

    fn append_entry_with_deact(&mut self, entry: &Entry, deact: Vec<i64>) -> Result<i64> {
        let sn = self.next_sn;
        let twig_id = twig_id_of(sn);
        debug_assert_eq!(twig_id, self.youngest_twig_id);
        let slot = slot_of(sn);

        let mut e = entry.clone();
        e.serial_num = sn;
        let payload = e.payload_to_bytes(&deact);
        let leaf = hasher::hash(&payload);
        let body = entry::escape_payload(payload);
        let pos = self.entry_file_wr.append(&body)?;

        let idx = (LEAF_COUNT_IN_TWIG + slot) as usize;
        self.mtree_for_youngest_twig[idx] = leaf;
        if self.mt_change_start < 0 {
            self.mt_change_start = slot as i32;
        }
        self.mt_change_end = slot as i32;

        if !e.is_filler() {
            let twig = self
                .active_twigs
                .get_mut(&twig_id)
                .expect("the youngest twig is always active");
            twig.active_bits.set_bit(slot);
            self.touched_chunks.insert(sn >> 9);
        }

        self.next_sn = sn + 1;
        if slot == TWIG_MASK {
            self.seal_youngest_twig()?;
        }
        Ok(pos)
    }

    // The youngest twig is full: finish its left tree, snapshot it to the
    // twig file and roll over to a fresh twig.
    fn seal_youngest_twig(&mut self) -> Result<()> {
        self.sync_mt_for_youngest_twig();
        let end_pos = self.entry_file_wr.entry_file.size();
        self.twig_file_wr
            .append_twig(&self.mtree_for_youngest_twig, end_pos)?;
        self.youngest_twig_id += 1;
        let mut fresh = Box::new(NULL_TWIG.as_ref().clone());
        fresh.first_entry_pos = end_pos;
        self.active_twigs.insert(self.youngest_twig_id, fresh);
        self.mtree_for_youngest_twig = NULL_MT_FOR_TWIG.clone();
        Ok(())
    }

    /// Marks the entry at `sn` inactive. The deactivation is buffered and
    /// becomes durable inside the next append; a full buffer forces a
    /// synthesized filler append.
    pub fn deactivate_entry(&mut self, sn: i64) -> Result<()> {
        if sn < 0 || sn >= self.next_sn {
            return Err(TreeError::bug(format!("serial number {} out of range", sn)));
        }
        let twig_id = twig_id_of(sn);
        let slot = slot_of(sn);
        let twig = self
            .active_twigs
            .get_mut(&twig_id)
            .ok_or_else(|| TreeError::bug(format!("twig {} is already evicted", twig_id)))?;
        if !twig.active_bits.get_bit(slot) {
            return Err(TreeError::bug(format!("serial number {} is already inactive", sn)));
        }
        twig.active_bits.clear_bit(slot);
        self.touched_chunks.insert(sn >> 9);
        self.pending_deact.push(sn);
        if self.pending_deact.len() >= DEACTIVED_SN_LIST_MAX_LEN {
            self.flush_deactivations()?;
        }
        Ok(())
    }

    // Forces the buffered deactivations onto disk through a filler append.
    fn flush_deactivations(&mut self) -> Result<()> {
        if self.pending_deact.is_empty() {
            return Ok(());
        }
        let deact = std::mem::take(&mut self.pending_deact);
        self.append_entry_with_deact(&Entry::null(), deact)?;
        Ok(())
    }

    /// Whether the entry at `sn` is live. False for unknown, evicted and
    /// pruned serial numbers.
    pub fn get_active_bit(&self, sn: i64) -> bool {
        if sn < 0 || sn >= self.next_sn {
            return false;
        }
        match self.active_twigs.get(&twig_id_of(sn)) {
            Some(twig) => twig.active_bits.get_bit(slot_of(sn)),
            None => false,
        }
    }

    /// Number of live entries in an active twig.
    pub fn active_count_in_twig(&self, twig_id: u64) -> u32 {
        match self.active_twigs.get(&twig_id) {
            Some(twig) => twig.active_bits.count_ones(),
            None => 0,
        }
    }

    /// Reads back every live entry of an active twig, in slot order.
    pub fn get_active_entries_in_twig(&self, twig_id: u64) -> Result<Vec<Entry>> {
        let twig = self
            .active_twigs
            .get(&twig_id)
            .ok_or_else(|| TreeError::bug(format!("twig {} is not active", twig_id)))?;
        let ef = &self.entry_file_wr.entry_file;
        let end = ef.size();
        let mut pos = twig.first_entry_pos;
        let mut res = Vec::new();
        for slot in 0..LEAF_COUNT_IN_TWIG {
            if pos >= end {
                break; // the youngest twig may not be full yet
            }
            if twig.active_bits.get_bit(slot) {
                let (e, _, next) = ef.read_entry(pos)?;
                res.push(e);
                pos = next;
            } else {
                pos = ef.skip_entry(pos)?;
            }
        }
        Ok(res)
    }

    /// Flushes both files to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.entry_file_wr.flush()?;
        self.twig_file_wr.flush()?;
        Ok(())
    }

    /// Closes the underlying files. The tree is unusable afterwards.
    pub fn close(&mut self) {
        self.entry_file_wr.entry_file.close();
        self.twig_file_wr.twig_file.close();
    }

    /// The block fence: makes buffered deactivations durable, recomputes all
    /// dirty hashes up to the root and flushes the files. Returns the root
    /// and the serialized edge-node snapshot.
    pub fn end_block(&mut self) -> Result<(Hash32, Vec<u8>)> {
        self.flush_deactivations()?;
        self.sync_mt_for_youngest_twig();
        let mut dirty_twigs = self.sync_bitmap_levels();
        dirty_twigs.extend(std::mem::take(&mut self.left_root_dirty));
        // the root path over the youngest twig is refreshed every block so
        // the node cache always matches what a rebuild from disk computes
        dirty_twigs.insert(self.youngest_twig_id);
        let n_list = self.sync_twig_roots(dirty_twigs)?;
        let root = self.sync_upper_nodes(n_list)?;
        self.sync()?;
        let edges = self.collect_edge_nodes()?;
        Ok((root, edge_nodes_to_bytes(&edges)))
    }

    // Recomputes the changed leaf range of the youngest twig and refreshes
    // its left root.
    pub(crate) fn sync_mt_for_youngest_twig(&mut self) {
        if self.mt_change_start < 0 {
            return;
        }
        twig::sync_mtree(
            &mut self.mtree_for_youngest_twig,
            self.mt_change_start as u32,
            self.mt_change_end as u32,
        );
        self.mt_change_start = -1;
        self.mt_change_end = -1;
        let left_root = self.mtree_for_youngest_twig[1];
        let twig = self
            .active_twigs
            .get_mut(&self.youngest_twig_id)
            .expect("the youngest twig is always active");
        twig.left_root = left_root;
        self.left_root_dirty.insert(self.youngest_twig_id);
    }

    // Recomputes the bitmap summary levels of every touched twig; returns
    // the set of twigs whose bitmap root changed.
    fn sync_bitmap_levels(&mut self) -> BTreeSet<u64> {
        let chunks = std::mem::take(&mut self.touched_chunks);
        let mut dirty = BTreeSet::new();
        for chunk in chunks {
            let twig_id = (chunk >> 2) as u64;
            let slot = (chunk & 3) as usize;
            if let Some(twig) = self.active_twigs.get_mut(&twig_id) {
                twig.sync_l1(slot);
                dirty.insert(twig_id);
            }
        }
        for &twig_id in &dirty {
            let twig = self.active_twigs.get_mut(&twig_id).unwrap();
            twig.sync_l2();
            twig.sync_l3();
        }
        dirty
    }

    // Refreshes the twig roots of all dirty twigs; returns the sorted,
    // deduplicated list of their parent positions at upper level 1.
    fn sync_twig_roots(&mut self, dirty_twigs: BTreeSet<u64>) -> Result<Vec<u64>> {
        let mut n_list: Vec<u64> = Vec::with_capacity(dirty_twigs.len());
        for twig_id in dirty_twigs {
            let twig = self
                .active_twigs
                .get_mut(&twig_id)
                .ok_or_else(|| TreeError::bug(format!("dirty twig {} is not active", twig_id)))?;
            twig.sync_top();
            if n_list.last() != Some(&(twig_id / 2)) {
                n_list.push(twig_id / 2);
            }
        }
        Ok(n_list)
    }

    // Recomputes both upper trees bottom-up along the dirty positions and
    // returns the combined root.
    pub(crate) fn sync_upper_nodes(&mut self, n_list: Vec<u64>) -> Result<Hash32> {
        let mut list = n_list;
        for level in 1..=MAX_UPPER_LEVEL {
            let mut next: Vec<u64> = Vec::with_capacity(list.len() / 2 + 1);
            for &nth in &list {
                let tl = self.upper_node_hash(false, level - 1, 2 * nth)?;
                let tr = self.upper_node_hash(false, level - 1, 2 * nth + 1)?;
                self.upper_tree
                    .set(NodePos::twig_tree(level, nth), hasher::hash2(twig_tree_tag(level), tl, tr));
                let bl = self.upper_node_hash(true, level - 1, 2 * nth)?;
                let br = self.upper_node_hash(true, level - 1, 2 * nth + 1)?;
                self.upper_tree
                    .set(NodePos::bits_tree(level, nth), hasher::hash2(bits_tree_tag(level), bl, br));
                if next.last() != Some(&(nth / 2)) {
                    next.push(nth / 2);
                }
            }
            list = next;
        }
        self.root()
    }

    /// The current block root. Only meaningful right after `end_block`.
    pub fn root(&self) -> Result<Hash32> {
        let bits_top = self.upper_node_hash(true, MAX_UPPER_LEVEL, 0)?;
        let twig_top = self.upper_node_hash(false, MAX_UPPER_LEVEL, 0)?;
        Ok(hasher::hash2(crate::def::ROOT_COMBINE_TAG, bits_top, twig_top))
    }

    // Node of one upper tree; level 0 resolves through the twig records.
    pub(crate) fn upper_node_hash(&self, bits_tree: bool, level: u8, nth: u64) -> Result<Hash32> {
        if level == 0 {
            return self.twig_leaf_hash(bits_tree, nth);
        }
        if let Some(h) = self.upper_tree.get(NodePos::new(bits_tree, level, nth)) {
            return Ok(*h);
        }
        if nth > (self.youngest_twig_id >> level) {
            return Ok(null_upper_node(bits_tree, level));
        }
        Err(TreeError::Recovery(format!(
            "missing upper node: tree={} level={} nth={}",
            if bits_tree { "bits" } else { "twig" },
            level,
            nth
        )))
    }

    fn twig_leaf_hash(&self, bits_tree: bool, twig_id: u64) -> Result<Hash32> {
        if let Some(twig) = self.active_twigs.get(&twig_id) {
            return Ok(if bits_tree {
                twig.active_bits_mtl3
            } else {
                twig.twig_root
            });
        }
        if let Some(h) = self.upper_tree.get(NodePos::new(bits_tree, 0, twig_id)) {
            return Ok(*h);
        }
        if twig_id > self.youngest_twig_id {
            return Ok(null_upper_node(bits_tree, 0));
        }
        Err(TreeError::Recovery(format!(
            "missing twig leaf: tree={} twig={}",
            if bits_tree { "bits" } else { "twig" },
            twig_id
        )))
    }

    /// Drops the in-memory record of the oldest twig. Its leaf hashes move
    /// into the node cache so sibling paths and proofs keep working. The
    /// compaction protocol guarantees every entry in it is already inactive.
    pub fn evict_twig(&mut self, twig_id: u64) -> Result<()> {
        if self.has_pending_updates() {
            return Err(TreeError::bug("evict_twig called inside a block"));
        }
        if twig_id != self.oldest_twig_id {
            return Err(TreeError::bug(format!(
                "evicting twig {} but the oldest is {}",
                twig_id, self.oldest_twig_id
            )));
        }
        if twig_id >= self.youngest_twig_id {
            return Err(TreeError::bug("cannot evict an incomplete twig"));
        }
        let twig = self
            .active_twigs
            .remove(&twig_id)
            .ok_or_else(|| TreeError::bug(format!("twig {} is not active", twig_id)))?;
        self.upper_tree
            .set(NodePos::twig_tree(0, twig_id), twig.twig_root);
        self.upper_tree
            .set(NodePos::bits_tree(0, twig_id), twig.active_bits_mtl3);
        self.oldest_twig_id = twig_id + 1;
        Ok(())
    }

    /// Head-prunes both files past the evicted twigs `[from_twig, to_twig)`
    /// and drops node-cache entries that fell behind the new frontier.
    pub fn prune_twigs(&mut self, from_twig: u64, to_twig: u64) -> Result<()> {
        if self.has_pending_updates() {
            return Err(TreeError::bug("prune_twigs called inside a block"));
        }
        if from_twig != self.pruned_to_twig_id {
            return Err(TreeError::bug(format!(
                "pruning must continue at twig {}, not {}",
                self.pruned_to_twig_id, from_twig
            )));
        }
        if to_twig > self.oldest_twig_id {
            return Err(TreeError::bug("pruning twigs that are not evicted yet"));
        }
        if to_twig <= from_twig || to_twig - from_twig < MIN_PRUNE_COUNT {
            // a plain error rather than a debug abort: callers probe this
            return Err(TreeError::BugDetected(format!(
                "pruning {}..{} is below the minimum of {} twigs",
                from_twig, to_twig, MIN_PRUNE_COUNT
            )));
        }
        let entry_off = self.twig_file_wr.twig_file.get_first_entry_pos(to_twig)?;
        self.entry_file_wr.entry_file.prune_head(entry_off)?;
        // keep the record before the frontier: it holds the first entry
        // position of twig `to_twig`
        self.twig_file_wr
            .twig_file
            .prune_head((to_twig as i64 - 1) * TWIG_SIZE)?;
        self.pruned_to_twig_id = to_twig;
        self.prune_upper_nodes();
        info!(
            "pruned twigs {}..{} of {}; entry file now starts at {}",
            from_twig, to_twig, self.dir_name, entry_off
        );
        Ok(())
    }

    // After advancing the prune frontier only two kinds of nodes matter on
    // its left: the frontier's left siblings (the edge nodes) and everything
    // at or right of the frontier path.
    fn prune_upper_nodes(&mut self) {
        let frontier = self.pruned_to_twig_id;
        self.upper_tree.nodes.retain(|pos, _| {
            let boundary = frontier >> pos.level();
            pos.nth() >= boundary || (boundary & 1 == 1 && pos.nth() + 1 == boundary)
        });
    }

    /// The edge nodes of the current prune frontier: the minimal set that,
    /// together with the on-disk twigs, rebuilds both upper trees.
    pub fn collect_edge_nodes(&self) -> Result<Vec<EdgeNode>> {
        let frontier = self.pruned_to_twig_id;
        let mut res = Vec::new();
        if frontier == 0 {
            return Ok(res);
        }
        for level in 0..=MAX_UPPER_LEVEL {
            let p = frontier >> level;
            if p & 1 == 1 {
                for bits_tree in [false, true] {
                    let pos = NodePos::new(bits_tree, level, p - 1);
                    let value = *self.upper_tree.get(pos).ok_or_else(|| {
                        TreeError::Recovery(format!(
                            "edge node missing from the cache: level={} nth={}",
                            level,
                            p - 1
                        ))
                    })?;
                    res.push(EdgeNode { pos, value });
                }
            }
        }
        Ok(res)
    }

    pub(crate) fn truncate_files(&mut self, entry_file_size: i64, twig_file_size: i64) -> Result<()> {
        info!(
            "truncating {}: entry file {} -> {}, twig file {} -> {}",
            self.dir_name,
            self.entry_file_wr.entry_file.size(),
            entry_file_size,
            self.twig_file_wr.twig_file.size(),
            twig_file_size
        );
        self.entry_file_wr.entry_file.truncate(entry_file_size)?;
        self.twig_file_wr.twig_file.truncate(twig_file_size)?;
        Ok(())
    }
}
