//! Genomic positions, exclusion masks and per-position conversion tallies.
//!
//! Masks are built once before any worker starts and are only read afterwards,
//! so they are shared by reference across shards without locking.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

// ============================================================================
// GenomicPosition
// ============================================================================

/// A (chromosome, 1-based position) coordinate.
///
/// Ordered by chromosome name, then position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenomicPosition {
    pub chrom: Arc<str>,
    pub pos: u32,
}

impl GenomicPosition {
    pub fn new(chrom: impl Into<Arc<str>>, pos: u32) -> Self {
        Self { chrom: chrom.into(), pos }
    }
}

impl fmt::Display for GenomicPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chrom, self.pos)
    }
}

// ============================================================================
// Position Sets (masks)
// ============================================================================

/// Immutable membership set of genomic positions, grouped per chromosome so
/// lookups need no allocation.
#[derive(Debug, Clone, Default)]
pub struct PositionSet {
    by_chrom: FxHashMap<String, FxHashSet<u32>>,
    len: usize,
}

/// Known SNP positions to ignore
pub type VariantMask = PositionSet;

/// Manually excluded positions
pub type PositionMask = PositionSet;

impl PositionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one 1-based position.
    pub fn insert(&mut self, chrom: &str, pos: u32) {
        let inserted = match self.by_chrom.get_mut(chrom) {
            Some(set) => set.insert(pos),
            None => {
                let mut set = FxHashSet::default();
                set.insert(pos);
                self.by_chrom.insert(chrom.to_string(), set);
                true
            }
        };
        if inserted {
            self.len += 1;
        }
    }

    /// Add every position of the inclusive 1-based range `[start, end]`.
    pub fn insert_range(&mut self, chrom: &str, start: u32, end: u32) {
        if start > end {
            return;
        }
        let set = self.by_chrom.entry(chrom.to_string()).or_default();
        for pos in start..=end {
            if set.insert(pos) {
                self.len += 1;
            }
        }
    }

    #[inline]
    pub fn contains(&self, chrom: &str, pos: u32) -> bool {
        self.by_chrom
            .get(chrom)
            .map_or(false, |set| set.contains(&pos))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl FromIterator<GenomicPosition> for PositionSet {
    fn from_iter<I: IntoIterator<Item = GenomicPosition>>(iter: I) -> Self {
        let mut set = PositionSet::new();
        for p in iter {
            set.insert(&p.chrom, p.pos);
        }
        set
    }
}

// ============================================================================
// Per-position tallies
// ============================================================================

/// Conversion counts keyed by genomic position.
///
/// Merging is pure summation, so the combined result is independent of the
/// order shards finish in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionTally {
    counts: FxHashMap<GenomicPosition, u64>,
}

impl PositionTally {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, position: GenomicPosition, count: u64) {
        *self.counts.entry(position).or_insert(0) += count;
    }

    pub fn get(&self, position: &GenomicPosition) -> u64 {
        self.counts.get(position).copied().unwrap_or(0)
    }

    /// Fold another tally into this one.
    pub fn merge(&mut self, other: PositionTally) {
        if self.counts.is_empty() {
            self.counts = other.counts;
            return;
        }
        for (position, count) in other.counts {
            self.add(position, count);
        }
    }

    /// Entries sorted by chromosome then position.
    pub fn sorted(&self) -> Vec<(&GenomicPosition, u64)> {
        let mut entries: Vec<_> = self.counts.iter().map(|(p, c)| (p, *c)).collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
