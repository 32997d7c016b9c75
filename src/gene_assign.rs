//! Read-to-Gene Assignment
//!
//! Two ways of turning a read pair into gene weights behind one trait:
//! - `ExactAssigner`: unique overlap of the pair's footprint with gene
//!   intervals, using per-chromosome coitrees
//! - `ProbabilisticAssigner`: per-transcript posterior probabilities collapsed
//!   onto genes through a transcript->gene map
//!
//! Trees store `u32` gene indices instead of gene names, keeping nodes small.

use coitrees::{COITree, IntervalNode, IntervalTree};
use log::info;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::read_pairer::ReadPair;

// ============================================================================
// Data Structures
// ============================================================================

/// Gene interval from an annotation BED
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneInterval {
    pub chrom: String,
    /// 0-based start
    pub start: u32,
    /// Exclusive end
    pub end: u32,
    pub gene_id: String,
}

/// Interned gene identifiers; accumulators are indexed by position here.
#[derive(Debug, Clone, Default)]
pub struct GeneTable {
    names: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl GeneTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index for `name`, adding it if new.
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn name(&self, idx: u32) -> &str {
        &self.names[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// `(gene index, weight)` for one read pair
pub type GeneWeights = Vec<(u32, f64)>;

/// Why a pair received no gene weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnassignedReason {
    /// Footprint overlaps no gene
    NoOverlap,
    /// Footprint overlaps more than one gene
    Ambiguous,
    /// No posterior row, or none of its transcripts carry mass
    NoPosterior,
    /// Mates aligned to different chromosomes
    MateChromosomeMismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    Genes(GeneWeights),
    Unassigned(UnassignedReason),
}

/// Produces a gene-weight distribution for a read pair.
///
/// Implementations are immutable once built and shared by every shard.
pub trait GeneAssigner: Send + Sync {
    fn genes(&self) -> &GeneTable;

    fn assign(&self, pair: &ReadPair) -> Assignment;
}

// ============================================================================
// Exact mode
// ============================================================================

pub type GeneTree = COITree<u32, u32>;

/// Unique-overlap assignment against gene intervals
pub struct ExactAssigner {
    genes: GeneTable,
    trees: FxHashMap<String, GeneTree>,
}

impl ExactAssigner {
    /// Build per-chromosome trees in parallel.
    pub fn new(intervals: &[GeneInterval]) -> Self {
        let mut genes = GeneTable::new();
        let mut chrom_intervals: FxHashMap<String, Vec<IntervalNode<u32, u32>>> =
            FxHashMap::default();

        for interval in intervals {
            if interval.end <= interval.start {
                continue;
            }
            let idx = genes.intern(&interval.gene_id);
            // coitrees uses end-inclusive intervals, BED is half-open [start, end)
            let node = IntervalNode::new(interval.start as i32, (interval.end - 1) as i32, idx);
            chrom_intervals
                .entry(interval.chrom.clone())
                .or_default()
                .push(node);
        }

        let chrom_list: Vec<_> = chrom_intervals.into_iter().collect();
        let trees: FxHashMap<String, GeneTree> = chrom_list
            .into_par_iter()
            .map(|(chrom, nodes)| {
                let tree = COITree::new(&nodes);
                (chrom, tree)
            })
            .collect();

        info!(
            "Built gene trees: {} genes on {} chromosomes",
            genes.len(),
            trees.len()
        );
        Self { genes, trees }
    }

    /// Genes overlapping the 1-based inclusive range, deduplicated.
    pub fn overlapping(&self, chrom: &str, start: u32, end: u32) -> Vec<u32> {
        let mut hits: Vec<u32> = Vec::new();
        if let Some(tree) = self.trees.get(chrom) {
            tree.query(start as i32 - 1, end as i32 - 1, |node| {
                let idx: u32 = node.metadata.clone();
                if !hits.contains(&idx) {
                    hits.push(idx);
                }
            });
        }
        hits
    }
}

impl GeneAssigner for ExactAssigner {
    fn genes(&self) -> &GeneTable {
        &self.genes
    }

    fn assign(&self, pair: &ReadPair) -> Assignment {
        let Some((chrom, start, end)) = pair.footprint() else {
            return Assignment::Unassigned(UnassignedReason::MateChromosomeMismatch);
        };
        match self.overlapping(chrom, start, end).as_slice() {
            [] => Assignment::Unassigned(UnassignedReason::NoOverlap),
            [gene] => Assignment::Genes(vec![(*gene, 1.0)]),
            _ => Assignment::Unassigned(UnassignedReason::Ambiguous),
        }
    }
}

// ============================================================================
// Probabilistic mode
// ============================================================================

/// Posterior probabilities of one read pair, `(transcript, probability)`
pub type PosteriorRow = Vec<(String, f64)>;

/// Assignment from posterior transcript probabilities
pub struct ProbabilisticAssigner {
    genes: GeneTable,
    /// Collapsed gene weights keyed by read name
    rows: FxHashMap<Vec<u8>, GeneWeights>,
    unmapped_transcripts: usize,
}

impl ProbabilisticAssigner {
    /// Collapse every posterior row onto genes up front.
    pub fn new(
        posteriors: FxHashMap<Vec<u8>, PosteriorRow>,
        tx2gene: &FxHashMap<String, String>,
    ) -> Self {
        let mut gene_names: Vec<&String> = tx2gene.values().collect();
        gene_names.sort_unstable();
        gene_names.dedup();

        let mut genes = GeneTable::new();
        for name in gene_names {
            genes.intern(name);
        }
        let tx_index: FxHashMap<&str, u32> = tx2gene
            .iter()
            .filter_map(|(tx, gene)| genes.get(gene).map(|idx| (tx.as_str(), idx)))
            .collect();

        let mut unmapped_transcripts = 0;
        let rows: FxHashMap<Vec<u8>, GeneWeights> = posteriors
            .into_iter()
            .map(|(name, row)| {
                let (weights, unmapped) = collapse(&row, &tx_index);
                unmapped_transcripts += unmapped;
                (name, weights)
            })
            .collect();

        info!(
            "Loaded posteriors for {} read pairs over {} genes",
            rows.len(),
            genes.len()
        );
        if unmapped_transcripts > 0 {
            log::warn!(
                "{} posterior entries name transcripts missing from the transcript-to-gene map",
                unmapped_transcripts
            );
        }
        Self {
            genes,
            rows,
            unmapped_transcripts,
        }
    }

    /// Posterior entries dropped because their transcript has no gene.
    pub fn unmapped_transcripts(&self) -> usize {
        self.unmapped_transcripts
    }

    /// Gene weights for a read name, if it had a posterior row.
    pub fn weights(&self, name: &[u8]) -> Option<&GeneWeights> {
        self.rows.get(name)
    }
}

/// Sum transcript probabilities per gene, without renormalising.
///
/// Returns the weights in first-seen gene order and the number of entries
/// whose transcript is unknown.
fn collapse(row: &PosteriorRow, tx_index: &FxHashMap<&str, u32>) -> (GeneWeights, usize) {
    let mut weights: GeneWeights = Vec::new();
    let mut unmapped = 0;
    for (tx, prob) in row {
        if prob.is_nan() || *prob <= 0.0 {
            continue;
        }
        let Some(&gene) = tx_index.get(tx.as_str()) else {
            unmapped += 1;
            continue;
        };
        match weights.iter_mut().find(|(g, _)| *g == gene) {
            Some((_, w)) => *w += prob,
            None => weights.push((gene, *prob)),
        }
    }
    (weights, unmapped)
}

impl GeneAssigner for ProbabilisticAssigner {
    fn genes(&self) -> &GeneTable {
        &self.genes
    }

    fn assign(&self, pair: &ReadPair) -> Assignment {
        match self.rows.get(&pair.name) {
            Some(weights) if !weights.is_empty() => Assignment::Genes(weights.clone()),
            _ => Assignment::Unassigned(UnassignedReason::NoPosterior),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
