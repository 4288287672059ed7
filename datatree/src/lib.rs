//! A versioned, authenticated key-value data tree for blockchain state.
//!
//! Entries are appended to a head-prunable log and grouped into twigs of
//! 2048; each twig keeps an active bitmap and a small Merkle tree, and two
//! sparse upper trees combine all twig roots and bitmap roots into one block
//! root. The engine supports O(log N) activation/deactivation, per-entry
//! inclusion proofs, edge-node snapshots for fast recovery, and head-pruning
//! of fully-deactivated history.
//!
//! Main entry points:
//! - [`Tree`]: append/deactivate entries, close blocks, evict and prune
//!   twigs, build proofs.
//! - [`recover_tree`]/[`load_tree`]: rebuild a tree from disk.
//! - [`merkletree::check`]: consistency checks and tree comparison, for
//!   tests.
//!
//! The engine is single-writer during a block; `end_block` is the fence that
//! recomputes every dirty hash and yields the root.

pub mod config;
pub mod def;
pub mod entryfile;
pub mod error;
pub mod merkletree;
pub mod utils;

pub use config::Config;
pub use entryfile::{Entry, EntryFile};
pub use error::{Result, TreeError};
pub use merkletree::proof::{bytes_to_proof_path, ProofPath};
pub use merkletree::recover::{
    bytes_to_edge_nodes, edge_nodes_to_bytes, load_tree, recover_tree, EdgeNode,
};
pub use merkletree::tree::{NodePos, Tree, UpperTree};
