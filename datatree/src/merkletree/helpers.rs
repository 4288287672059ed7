//! Small builders shared by the test suites.

use crate::config::Config;
use crate::entryfile::entry::Entry;
use crate::error::Result;
use crate::merkletree::tree::Tree;

/// A config with tiny buffers and segments, so a handful of entries already
/// exercises segment rollover and head pruning.
pub fn small_config(dir: &str) -> Config {
    let mut config = Config::from_dir(dir);
    config.set_small_files(1024, 8192);
    config
}

/// A deterministic entry whose fields are derived from `n`.
pub fn test_entry(n: i64) -> Entry {
    Entry {
        key: format!("key-{:06}", n).into_bytes(),
        value: format!("value-{:06}", n).into_bytes(),
        next_key: format!("key-{:06}", n + 1).into_bytes(),
        height: n / 100,
        last_height: -1,
        serial_num: 0, // assigned by the engine
    }
}

/// Builds a tree with `entry_count` appended entries, then deactivates
/// `deact_sn_list` and closes the block. Returns the tree, its root and the
/// edge-node blob.
pub fn build_test_tree(
    config: &Config,
    entry_count: i64,
    deact_sn_list: &[i64],
) -> Result<(Tree, [u8; 32], Vec<u8>)> {
    let mut tree = Tree::new(config)?;
    for n in 0..entry_count {
        tree.append_entry(&test_entry(n))?;
    }
    for &sn in deact_sn_list {
        tree.deactivate_entry(sn)?;
    }
    let (root, edges) = tree.end_block()?;
    Ok((tree, root, edges))
}
