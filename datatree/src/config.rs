//! Tuning knobs for the data tree.

/// Default threshold on the number of active entries before compaction is
/// worth considering.
pub const COMPACT_THRES: i64 = 20_000_000;

/// Default target utilization numerator (7/10 = 70%).
pub const UTILIZATION_RATIO: i64 = 7;

/// Default target utilization denominator.
pub const UTILIZATION_DIV: i64 = 10;

/// Configuration of one tree instance.
///
/// `file_segment_size` must be a multiple of `wrbuf_size`; both files sit on
/// head-prunable segment files of this size, so it also sets the granularity
/// at which pruning can reclaim disk space.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory; the entry log and twig snapshots live in
    /// subdirectories of it.
    pub dir: String,
    /// Write buffer size in bytes.
    pub wrbuf_size: usize,
    /// Segment file size in bytes.
    pub file_segment_size: usize,
    /// Active-entry threshold fed to `def::is_compactible`.
    pub compact_thres: i64,
    /// Target utilization numerator.
    pub utilization_ratio: i64,
    /// Target utilization denominator.
    pub utilization_div: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: "datatree".to_string(),
            wrbuf_size: 256 * 1024,
            file_segment_size: 16 * 1024 * 1024,
            compact_thres: COMPACT_THRES,
            utilization_ratio: UTILIZATION_RATIO,
            utilization_div: UTILIZATION_DIV,
        }
    }
}

impl Config {
    pub fn from_dir(dir: &str) -> Self {
        Config {
            dir: dir.to_string(),
            ..Config::default()
        }
    }

    pub fn from_dir_and_compact_opt(
        dir: &str,
        compact_thres: i64,
        utilization_ratio: i64,
        utilization_div: i64,
    ) -> Self {
        Config {
            dir: dir.to_string(),
            compact_thres,
            utilization_ratio,
            utilization_div,
            ..Config::default()
        }
    }

    /// Shrinks buffers and segments, keeping them compatible. Handy for tests
    /// that want many segment files from little data.
    pub fn set_small_files(&mut self, wrbuf_size: usize, file_segment_size: usize) {
        assert!(file_segment_size % wrbuf_size == 0);
        self.wrbuf_size = wrbuf_size;
        self.file_segment_size = file_segment_size;
    }
}
