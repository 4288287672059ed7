//! Error kinds surfaced by the data tree.
//!
//! `Corrupt`, `BugDetected` and `Recovery` are not recoverable locally; the
//! caller is expected to abort or rebuild the tree. `Io` wraps the underlying
//! file-system failures, including reads into a head-pruned range.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TreeError>;

#[derive(Error, Debug)]
pub enum TreeError {
    /// On-disk data failed a structural check: bad magic, oversize length,
    /// checksum mismatch, out-of-range escape position.
    #[error("corrupt store: {reason} (offset {offset})")]
    Corrupt { reason: String, offset: i64 },

    /// A read or write failed, including reads below the head-prune point.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A caller violated an engine precondition (double deactivation, prune
    /// before evict, serial number out of range).
    #[error("bug detected: {0}")]
    BugDetected(String),

    /// The provided edge-node set cannot rebuild the declared twig range.
    #[error("recovery failed: {0}")]
    Recovery(String),
}

impl TreeError {
    pub fn corrupt(reason: impl Into<String>, offset: i64) -> TreeError {
        TreeError::Corrupt {
            reason: reason.into(),
            offset,
        }
    }

    /// Precondition violations abort debug builds and surface as errors in
    /// release builds.
    pub fn bug(msg: impl Into<String>) -> TreeError {
        let msg = msg.into();
        debug_assert!(false, "bug detected: {}", msg);
        TreeError::BugDetected(msg)
    }
}
