//! On-disk snapshots of completed twigs' left trees.
//!
//! When a twig fills up, its 2048 leaf hashes are written here together with
//! a small header, one fixed-size record per twig:
//!
//! ```text
//! last_entry_end_pos:i64 | xxh32(header):u32 | 2048 * 32 leaf bytes
//! ```
//!
//! `last_entry_end_pos` is the entry-file offset right after the twig's last
//! entry, which is where the next twig's first entry begins. Only leaves are
//! stored; internal left-tree nodes are folded from the leaf range on demand.
//! Records sit on a head-prunable file whose segment size is a multiple of
//! the record size, so record `t` always starts at `t * TWIG_SIZE`.

use crate::def::LEAF_COUNT_IN_TWIG;
use crate::error::{Result, TreeError};
use crate::merkletree::twig::TwigMt;
use crate::utils::hasher::{self, Hash32};
use byteorder::{ByteOrder, LittleEndian};
use hpfile::HPFile;
use std::io;
use std::path::Path;
use std::sync::Arc;
use xxhash_rust::xxh32;

const HEADER_SIZE: i64 = 12;

/// Bytes one twig record occupies.
pub const TWIG_SIZE: i64 = HEADER_SIZE + (LEAF_COUNT_IN_TWIG as i64) * 32;

/// Per-twig leaf-hash snapshots over a head-prunable file.
#[derive(Debug)]
pub struct TwigFile {
    pub hp_file: HPFile,
}

impl TwigFile {
    /// Opens the file with segments holding `records_per_segment` records.
    pub fn new(records_per_segment: i64, dir: impl AsRef<Path>) -> Result<TwigFile> {
        debug_assert!(records_per_segment > 0);
        let hp_file = HPFile::new(TWIG_SIZE, records_per_segment * TWIG_SIZE, dir)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(TwigFile { hp_file })
    }

    pub fn size(&self) -> i64 {
        self.hp_file.size()
    }

    /// Appends the record of a completed twig.
    pub fn append_twig(
        &self,
        m_tree: &TwigMt,
        last_entry_end_pos: i64,
        buffer: &mut Vec<u8>,
    ) -> Result<()> {
        if last_entry_end_pos < 0 {
            return Err(TreeError::bug("negative entry-file position"));
        }
        if m_tree.len() != 2 * LEAF_COUNT_IN_TWIG as usize {
            return Err(TreeError::bug("twig merkle tree has the wrong size"));
        }
        let mut record = Vec::with_capacity(TWIG_SIZE as usize);
        let mut head = [0u8; HEADER_SIZE as usize];
        LittleEndian::write_i64(&mut head[..8], last_entry_end_pos);
        let checksum = xxh32::xxh32(&head[..8], 0);
        LittleEndian::write_u32(&mut head[8..], checksum);
        record.extend_from_slice(&head);
        for leaf in &m_tree[LEAF_COUNT_IN_TWIG as usize..] {
            record.extend_from_slice(leaf);
        }
        self.hp_file.append(&record, buffer)?;
        Ok(())
    }

    /// Entry-file offset of the first entry of `twig_id`, read from the
    /// previous twig's record header.
    pub fn get_first_entry_pos(&self, twig_id: u64) -> Result<i64> {
        if twig_id == 0 {
            return Ok(0);
        }
        let off = (twig_id as i64 - 1) * TWIG_SIZE;
        let mut head = [0u8; HEADER_SIZE as usize];
        self.hp_file.read_at(&mut head, off)?;
        if LittleEndian::read_u32(&head[8..]) != xxh32::xxh32(&head[..8], 0) {
            return Err(TreeError::corrupt("twig record header checksum mismatch", off));
        }
        Ok(LittleEndian::read_i64(&head[..8]))
    }

    /// Left-tree node `node_id` (TwigMt indexing, 1..4096) of a stored twig.
    /// Leaves are read directly; internal nodes are folded from their leaf
    /// range.
    pub fn get_hash_node(&self, twig_id: u64, node_id: u32, out: &mut Hash32) -> Result<()> {
        if node_id == 0 || node_id >= 2 * LEAF_COUNT_IN_TWIG {
            return Err(TreeError::bug(format!("invalid twig node id {}", node_id)));
        }
        let record_off = twig_id as i64 * TWIG_SIZE + HEADER_SIZE;
        if node_id >= LEAF_COUNT_IN_TWIG {
            let off = record_off + (node_id - LEAF_COUNT_IN_TWIG) as i64 * 32;
            self.hp_file.read_at(&mut out[..], off)?;
            return Ok(());
        }
        // node_id sits at level L = 11 - floor_log2(node_id) and covers
        // 1 << L leaves starting at (node_id - 2^floor_log2) << L
        let floor_log2 = 31 - node_id.leading_zeros();
        let level = 11 - floor_log2;
        let count = 1usize << level;
        let first_leaf = (node_id - (1 << floor_log2)) << level;
        let mut buf = vec![0u8; count * 32];
        self.hp_file
            .read_at(&mut buf, record_off + first_leaf as i64 * 32)?;
        let mut nodes: Vec<Hash32> = buf
            .chunks_exact(32)
            .map(|c| {
                let mut h = [0u8; 32];
                h.copy_from_slice(c);
                h
            })
            .collect();
        let mut tag = 0u8;
        while nodes.len() > 1 {
            for i in 0..nodes.len() / 2 {
                nodes[i] = hasher::hash2(tag, nodes[2 * i], nodes[2 * i + 1]);
            }
            nodes.truncate(nodes.len() / 2);
            tag += 1;
        }
        *out = nodes[0];
        Ok(())
    }

    /// Left root of a stored twig.
    pub fn get_hash_root(&self, twig_id: u64, out: &mut Hash32) -> Result<()> {
        self.get_hash_node(twig_id, 1, out)
    }

    pub fn truncate(&self, size: i64) -> Result<()> {
        Ok(self.hp_file.truncate(size)?)
    }

    pub fn prune_head(&self, off: i64) -> Result<()> {
        Ok(self.hp_file.prune_head(off)?)
    }

    pub fn close(&self) {
        self.hp_file.close();
    }
}

/// Single-writer handle pairing the shared [`TwigFile`] with its buffer.
pub struct TwigFileWriter {
    pub twig_file: Arc<TwigFile>,
    wrbuf: Vec<u8>,
}

impl TwigFileWriter {
    pub fn new(twig_file: Arc<TwigFile>) -> TwigFileWriter {
        TwigFileWriter {
            twig_file,
            wrbuf: Vec::new(),
        }
    }

    pub fn append_twig(&mut self, m_tree: &TwigMt, last_entry_end_pos: i64) -> Result<()> {
        self.twig_file
            .append_twig(m_tree, last_entry_end_pos, &mut self.wrbuf)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.twig_file.hp_file.flush(&mut self.wrbuf)?)
    }
}
