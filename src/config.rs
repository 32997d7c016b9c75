//! Run configuration for conversion scanning and sharding.

use crate::error::{ConvError, Result};
use crate::read_pairer::{AlignedRead, Mate, Strand};

// ============================================================================
// Library Orientation
// ============================================================================

/// Which transcript strand each mate reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    /// Read1 is antisense to the transcript (dUTP / TruSeq stranded)
    #[default]
    Read1Antisense,
    /// Read1 is sense to the transcript (ligation / SOLiD style)
    Read1Sense,
}

impl Orientation {
    /// True when the read derives from the reverse transcript strand, in which
    /// case reference and observed bases are complemented before inspection.
    pub fn is_reverse_transcript(&self, read: &AlignedRead) -> bool {
        let read1_forward = match (read.mate, read.strand) {
            (Mate::First, Strand::Forward) | (Mate::Second, Strand::Reverse) => true,
            (Mate::First, Strand::Reverse) | (Mate::Second, Strand::Forward) => false,
        };
        match self {
            Orientation::Read1Antisense => read1_forward,
            Orientation::Read1Sense => !read1_forward,
        }
    }
}

// ============================================================================
// Scan Configuration
// ============================================================================

/// Conversion scanning options
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Count G->T substitutions
    pub use_g_t: bool,
    /// Count G->C substitutions
    pub use_g_c: bool,
    /// Inspect read1 of each pair
    pub use_read1: bool,
    /// Inspect read2 of each pair
    pub use_read2: bool,
    /// Inside the mates' shared span, require both mates to show the conversion
    pub only_consider_overlap: bool,
    /// Minimum qualifying conversions before a pair's conversions count
    pub min_conversions: u32,
    /// Library strandedness
    pub orientation: Orientation,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            use_g_t: true,
            use_g_c: false,
            use_read1: true,
            use_read2: true,
            only_consider_overlap: false,
            min_conversions: 1,
            orientation: Orientation::default(),
        }
    }
}

impl ScanConfig {
    /// Check mutually-required flag combinations.
    pub fn validate(&self) -> Result<()> {
        if !self.use_g_t && !self.use_g_c {
            return Err(ConvError::Configuration(
                "at least one of use_g_t / use_g_c must be enabled".to_string(),
            ));
        }
        if !self.use_read1 && !self.use_read2 {
            return Err(ConvError::Configuration(
                "at least one of use_read1 / use_read2 must be enabled".to_string(),
            ));
        }
        if self.only_consider_overlap && !(self.use_read1 && self.use_read2) {
            return Err(ConvError::Configuration(
                "only_consider_overlap requires both use_read1 and use_read2".to_string(),
            ));
        }
        Ok(())
    }

    /// Both conversion types are reported separately when enabled together.
    pub fn reports_both_types(&self) -> bool {
        self.use_g_t && self.use_g_c
    }

    /// Is `observed` (strand-normalised) an enabled target over a reference G?
    #[inline]
    pub fn is_target(&self, observed: u8) -> bool {
        (self.use_g_t && observed == b'T') || (self.use_g_c && observed == b'C')
    }
}

// ============================================================================
// Pipeline Configuration
// ============================================================================

/// How the read-pair stream is partitioned into shards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardStrategy {
    /// Every shard streams the whole file and keeps reads whose name hashes to it
    #[default]
    ReadNameHash,
    /// Chromosomes are dealt round-robin to shards and fetched through the index
    Chromosome,
}

/// Configuration for the sharded pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of independent shards (one worker thread each)
    pub shard_count: usize,
    /// Partitioning scheme
    pub strategy: ShardStrategy,
    /// htslib decompression threads per worker
    pub read_threads: usize,
    /// Keep per-pair tallies for the per-pair table
    pub keep_pair_tallies: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shard_count: 1,
            strategy: ShardStrategy::default(),
            read_threads: 1,
            keep_pair_tallies: false,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(ConvError::Configuration(
                "shard_count must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
