//! Gene Aggregation
//!
//! Folds per-pair conversion tallies into per-gene accumulators using the
//! pair's gene weights:
//!
//! ```text
//! assigned_pairs[gene] += weight
//! conversions[gene]    += weight * pair_conversions
//! ```
//!
//! Weights are fixed-point (10^-9 units). Each pair's weight is rounded once
//! and everything after that is integer arithmetic, so merging shard
//! accumulators in any order gives bit-identical totals.

use std::fmt;
use std::ops::{Add, AddAssign};

use rustc_hash::FxHashMap;

use crate::gene_assign::{Assignment, GeneTable, GeneWeights};
use crate::scanner::ConversionTally;

// ============================================================================
// Fixed-point weight
// ============================================================================

/// Ticks per unit weight
pub const WEIGHT_SCALE: u128 = 1_000_000_000;

/// Non-negative fixed-point weight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Weight(u128);

impl Weight {
    pub const ZERO: Weight = Weight(0);
    pub const ONE: Weight = Weight(WEIGHT_SCALE);

    /// Round a probability-like value to the nearest tick. Negative and NaN
    /// values become zero.
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() || value <= 0.0 {
            return Weight::ZERO;
        }
        Weight((value * WEIGHT_SCALE as f64).round() as u128)
    }

    pub fn from_count(count: u64) -> Self {
        Weight(count as u128 * WEIGHT_SCALE)
    }

    /// Multiply by an integer count.
    #[inline]
    pub fn scaled(self, count: u32) -> Self {
        Weight(self.0 * count as u128)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self / denominator`, or `None` for a zero denominator.
    pub fn ratio(self, denominator: Weight) -> Option<f64> {
        if denominator.is_zero() {
            None
        } else {
            Some(self.0 as f64 / denominator.0 as f64)
        }
    }
}

impl Add for Weight {
    type Output = Weight;

    fn add(self, rhs: Weight) -> Weight {
        Weight(self.0 + rhs.0)
    }
}

impl AddAssign for Weight {
    fn add_assign(&mut self, rhs: Weight) {
        self.0 += rhs.0;
    }
}

impl fmt::Display for Weight {
    /// Up to four decimals, trailing zeros trimmed: `1`, `0.6`, `2.35`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TICKS_PER_DIGIT: u128 = WEIGHT_SCALE / 10_000;
        let rounded = (self.0 + TICKS_PER_DIGIT / 2) / TICKS_PER_DIGIT;
        let whole = rounded / 10_000;
        let frac = rounded % 10_000;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:04}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

// ============================================================================
// Accumulators
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneAccumulator {
    pub assigned_pairs: Weight,
    pub conversions: Weight,
    pub g_t: Weight,
    pub g_c: Weight,
    pub g_positions: Weight,
}

impl GeneAccumulator {
    #[inline]
    fn add(&mut self, weight: Weight, tally: Option<&ConversionTally>) {
        self.assigned_pairs += weight;
        if let Some(t) = tally {
            self.conversions += weight.scaled(t.conversions());
            self.g_t += weight.scaled(t.g_t);
            self.g_c += weight.scaled(t.g_c);
            self.g_positions += weight.scaled(t.g_positions);
        }
    }

    fn merge(&mut self, other: &GeneAccumulator) {
        self.assigned_pairs += other.assigned_pairs;
        self.conversions += other.conversions;
        self.g_t += other.g_t;
        self.g_c += other.g_c;
        self.g_positions += other.g_positions;
    }
}

/// Final per-gene row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneResult {
    pub gene_id: String,
    pub assigned_pairs: Weight,
    pub conversions: Weight,
    pub g_t: Weight,
    pub g_c: Weight,
    pub g_positions: Weight,
}

impl GeneResult {
    /// Conversions per inspected reference G.
    pub fn conversion_rate(&self) -> Option<f64> {
        self.conversions.ratio(self.g_positions)
    }
}

/// Per-gene accumulators indexed by `GeneTable` position
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneAggregator {
    genes: Vec<GeneAccumulator>,
}

impl GeneAggregator {
    pub fn new(gene_count: usize) -> Self {
        Self {
            genes: vec![GeneAccumulator::default(); gene_count],
        }
    }

    /// Fold one pair. A missing tally counts as zero conversions.
    pub fn add(&mut self, weights: &GeneWeights, tally: Option<&ConversionTally>) {
        for &(gene, weight) in weights {
            let idx = gene as usize;
            if idx >= self.genes.len() {
                self.genes.resize(idx + 1, GeneAccumulator::default());
            }
            self.genes[idx].add(Weight::from_f64(weight), tally);
        }
    }

    /// Combine with another shard's accumulators.
    pub fn merge(&mut self, other: &GeneAggregator) {
        if other.genes.len() > self.genes.len() {
            self.genes.resize(other.genes.len(), GeneAccumulator::default());
        }
        for (acc, theirs) in self.genes.iter_mut().zip(&other.genes) {
            acc.merge(theirs);
        }
    }

    /// Join a tally table with an assignment stream by read name.
    ///
    /// Unassigned pairs contribute nothing; assigned pairs absent from
    /// `tallies` contribute their weight with zero conversions.
    pub fn join<'a, I>(
        gene_count: usize,
        tallies: &FxHashMap<Vec<u8>, ConversionTally>,
        assignments: I,
    ) -> Self
    where
        I: IntoIterator<Item = (&'a [u8], &'a Assignment)>,
    {
        let mut aggregator = GeneAggregator::new(gene_count);
        for (name, assignment) in assignments {
            if let Assignment::Genes(weights) = assignment {
                aggregator.add(weights, tallies.get(name));
            }
        }
        aggregator
    }

    pub fn get(&self, gene: u32) -> Option<&GeneAccumulator> {
        self.genes.get(gene as usize)
    }

    /// One row per gene with non-zero assignment, sorted by gene identifier.
    pub fn results(&self, table: &GeneTable) -> Vec<GeneResult> {
        let mut rows: Vec<GeneResult> = self
            .genes
            .iter()
            .enumerate()
            .filter(|(_, acc)| !acc.assigned_pairs.is_zero())
            .map(|(idx, acc)| GeneResult {
                gene_id: table.name(idx as u32).to_string(),
                assigned_pairs: acc.assigned_pairs,
                conversions: acc.conversions,
                g_t: acc.g_t,
                g_c: acc.g_c,
                g_positions: acc.g_positions,
            })
            .collect();
        rows.sort_unstable_by(|a, b| a.gene_id.cmp(&b.gene_id));
        rows
    }
}

// ============================================================================
// Tests
// ============================================================================
