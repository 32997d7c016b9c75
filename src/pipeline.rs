//! Parallel Scan Pipeline
//!
//! Splits the read-pair stream into independent shards, scans and assigns
//! every pair inside its shard, and merges the shard accumulators.
//!
//! # Threading
//! - One scoped worker thread per shard, each with its OWN htslib reader
//!   (`bam::Record` holds an `Rc<HeaderView>` and must not cross threads)
//! - Only plain accumulators cross back over a bounded crossbeam channel
//! - Masks, gene trees and posteriors are borrowed read-only by all workers
//!
//! # Determinism
//! Every accumulator merges by integer addition, so the merged result does not
//! depend on the shard count or on the order shards finish in.
//!
//! # Failure
//! The first fatal error raises a shared cancellation flag. Remaining workers
//! stop at their next check and the run returns `ShardFailure`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use log::{debug, info, warn};

use crate::aggregate::{GeneAggregator, GeneResult};
use crate::config::{PipelineConfig, ShardStrategy};
use crate::error::{ConvError, Result};
use crate::gene_assign::{Assignment, GeneAssigner, UnassignedReason};
use crate::positions::PositionTally;
use crate::read_pairer::{AlignmentSource, PairingStats, ReadPair, ReadPairer};
use crate::scanner::{ConversionScanner, ConversionTally};

/// Pairs processed between cancellation checks
const CANCEL_CHECK_INTERVAL: usize = 4096;

// ============================================================================
// Statistics
// ============================================================================

/// Run statistics, summed across shards
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Reads seen
    pub total_reads: usize,
    /// Reads dropped by the pairing filters
    pub reads_filtered: usize,
    /// Reads whose mate never appeared
    pub orphan_reads: usize,
    /// Pairs formed
    pub pairs_processed: usize,
    /// Pairs whose records could not be interpreted
    pub pairs_skipped_parse: usize,
    /// Pairs with conversions below the minimum
    pub pairs_below_threshold: usize,
    /// Pairs with at least one counted conversion
    pub pairs_with_conversions: usize,
    /// Pairs with a gene assignment
    pub pairs_assigned: usize,
    pub unassigned_no_overlap: usize,
    pub unassigned_ambiguous: usize,
    pub unassigned_no_posterior: usize,
    pub unassigned_mate_chromosome: usize,
}

impl ScanStats {
    /// Merge stats from multiple shards into a single aggregate
    pub fn merge(self, other: Self) -> Self {
        Self {
            total_reads: self.total_reads + other.total_reads,
            reads_filtered: self.reads_filtered + other.reads_filtered,
            orphan_reads: self.orphan_reads + other.orphan_reads,
            pairs_processed: self.pairs_processed + other.pairs_processed,
            pairs_skipped_parse: self.pairs_skipped_parse + other.pairs_skipped_parse,
            pairs_below_threshold: self.pairs_below_threshold + other.pairs_below_threshold,
            pairs_with_conversions: self.pairs_with_conversions + other.pairs_with_conversions,
            pairs_assigned: self.pairs_assigned + other.pairs_assigned,
            unassigned_no_overlap: self.unassigned_no_overlap + other.unassigned_no_overlap,
            unassigned_ambiguous: self.unassigned_ambiguous + other.unassigned_ambiguous,
            unassigned_no_posterior: self.unassigned_no_posterior + other.unassigned_no_posterior,
            unassigned_mate_chromosome: self.unassigned_mate_chromosome
                + other.unassigned_mate_chromosome,
        }
    }

    fn absorb_pairing(&mut self, pairing: PairingStats) {
        self.total_reads += pairing.total_reads;
        self.reads_filtered += pairing.reads_filtered;
        self.orphan_reads += pairing.orphan_reads;
    }

    fn record_unassigned(&mut self, reason: UnassignedReason) {
        match reason {
            UnassignedReason::NoOverlap => self.unassigned_no_overlap += 1,
            UnassignedReason::Ambiguous => self.unassigned_ambiguous += 1,
            UnassignedReason::NoPosterior => self.unassigned_no_posterior += 1,
            UnassignedReason::MateChromosomeMismatch => self.unassigned_mate_chromosome += 1,
        }
    }

    pub fn unassigned(&self) -> usize {
        self.unassigned_no_overlap
            + self.unassigned_ambiguous
            + self.unassigned_no_posterior
            + self.unassigned_mate_chromosome
    }

    pub fn log_summary(&self) {
        info!("  Total reads: {}", self.total_reads);
        info!("  Reads filtered: {}", self.reads_filtered);
        info!("  Orphan reads (mate not found): {}", self.orphan_reads);
        info!("  Pairs processed: {}", self.pairs_processed);
        info!("  Pairs with conversions: {}", self.pairs_with_conversions);
        info!("  Pairs below conversion minimum: {}", self.pairs_below_threshold);
        info!("  Pairs assigned to genes: {}", self.pairs_assigned);
        info!(
            "  Pairs unassigned: {} (no overlap {}, ambiguous {}, no posterior {}, split chromosomes {})",
            self.unassigned(),
            self.unassigned_no_overlap,
            self.unassigned_ambiguous,
            self.unassigned_no_posterior,
            self.unassigned_mate_chromosome
        );
        if self.pairs_skipped_parse > 0 {
            warn!("  Pairs skipped (malformed records): {}", self.pairs_skipped_parse);
        }
    }
}

// ============================================================================
// Shard planning
// ============================================================================

/// Work assigned to one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPlan {
    /// Stream the whole file, keep names hashing to `index`
    NameHash { index: usize, count: usize },
    /// Fetch these target ids through the index
    Chromosomes(Vec<u32>),
}

/// Split the work into `count` shards.
pub fn plan_shards(strategy: ShardStrategy, count: usize, n_chroms: usize) -> Vec<ShardPlan> {
    match strategy {
        ShardStrategy::ReadNameHash => (0..count)
            .map(|index| ShardPlan::NameHash { index, count })
            .collect(),
        ShardStrategy::Chromosome => {
            let mut groups = vec![Vec::new(); count];
            for tid in 0..n_chroms {
                groups[tid % count].push(tid as u32);
            }
            groups.into_iter().map(ShardPlan::Chromosomes).collect()
        }
    }
}

// ============================================================================
// Per-shard work
// ============================================================================

/// Everything one shard produces
#[derive(Debug, Default)]
pub struct ShardOutput {
    pub genes: GeneAggregator,
    pub positions: PositionTally,
    pub stats: ScanStats,
    pub pair_tallies: Vec<(Vec<u8>, ConversionTally)>,
}

impl ShardOutput {
    fn merge(&mut self, other: ShardOutput) {
        self.genes.merge(&other.genes);
        self.positions.merge(other.positions);
        self.stats = self.stats.merge(other.stats);
        self.pair_tallies.extend(other.pair_tallies);
    }
}

/// Scans and assigns pairs, folding them straight into shard accumulators so
/// memory stays bounded by gene count.
struct ShardWorker<'s> {
    scanner: &'s ConversionScanner<'s>,
    assigner: &'s dyn GeneAssigner,
    keep_pair_tallies: bool,
    output: ShardOutput,
}

impl<'s> ShardWorker<'s> {
    fn new(
        scanner: &'s ConversionScanner<'s>,
        assigner: &'s dyn GeneAssigner,
        keep_pair_tallies: bool,
    ) -> Self {
        Self {
            scanner,
            assigner,
            keep_pair_tallies,
            output: ShardOutput {
                genes: GeneAggregator::new(assigner.genes().len()),
                ..Default::default()
            },
        }
    }

    fn consume<I>(&mut self, pairs: I, cancel: &AtomicBool) -> Result<()>
    where
        I: Iterator<Item = Result<ReadPair>>,
    {
        for (n, item) in pairs.enumerate() {
            if n % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return Err(ConvError::Cancelled);
            }
            match item {
                Ok(pair) => self.process(&pair)?,
                Err(e) if e.is_record_error() => {
                    self.output.stats.pairs_skipped_parse += 1;
                    debug!("Skipping pair: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn process(&mut self, pair: &ReadPair) -> Result<()> {
        let stats = &mut self.output.stats;
        stats.pairs_processed += 1;

        let tally = match self.scanner.scan(pair, &mut self.output.positions) {
            Ok(tally) => {
                if tally.below_threshold {
                    stats.pairs_below_threshold += 1;
                } else if tally.conversions() > 0 {
                    stats.pairs_with_conversions += 1;
                }
                Some(tally)
            }
            Err(e) if e.is_record_error() => {
                stats.pairs_skipped_parse += 1;
                debug!("Skipping pair scan: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        if self.keep_pair_tallies {
            if let Some(t) = tally {
                self.output.pair_tallies.push((pair.name.clone(), t));
            }
        }

        match self.assigner.assign(pair) {
            Assignment::Genes(weights) => {
                stats.pairs_assigned += 1;
                self.output.genes.add(&weights, tally.as_ref());
            }
            Assignment::Unassigned(reason) => stats.record_unassigned(reason),
        }
        Ok(())
    }
}

fn scan_shard(
    source: &AlignmentSource,
    plan: ShardPlan,
    scanner: &ConversionScanner,
    assigner: &dyn GeneAssigner,
    config: &PipelineConfig,
    cancel: &AtomicBool,
) -> Result<ShardOutput> {
    let t0 = Instant::now();
    let mut worker = ShardWorker::new(scanner, assigner, config.keep_pair_tallies);

    match &plan {
        ShardPlan::NameHash { index, count } => {
            let mut reader = source.reader(config.read_threads)?;
            let mut pairer = ReadPairer::new(&mut reader, source.chromosomes().clone())
                .with_name_shard(*index, *count);
            worker.consume(&mut pairer, cancel)?;
            worker.output.stats.absorb_pairing(pairer.stats());
        }
        ShardPlan::Chromosomes(tids) => {
            let mut reader = source.indexed_reader(config.read_threads)?;
            for &tid in tids {
                reader.fetch(tid as i32)?;
                // Fresh pair buffer per chromosome
                let mut pairer = ReadPairer::new(&mut reader, source.chromosomes().clone());
                worker.consume(&mut pairer, cancel)?;
                worker.output.stats.absorb_pairing(pairer.stats());
            }
        }
    }

    debug!(
        "Shard {:?} done: {} pairs in {}ms",
        plan,
        worker.output.stats.pairs_processed,
        t0.elapsed().as_millis()
    );
    Ok(worker.output)
}

// ============================================================================
// Fan-out / fan-in
// ============================================================================

/// Run `work` once per shard on its own thread and collect the results in
/// shard order.
///
/// If any shard fails (error or panic) the others are cancelled and the run
/// fails with `ShardFailure`, carrying the first non-cancellation error.
pub fn fan_out<S, T, F>(shards: Vec<S>, work: F) -> Result<Vec<T>>
where
    S: Send,
    T: Send,
    F: Fn(S, &AtomicBool) -> Result<T> + Sync,
{
    let total = shards.len();
    let cancel = AtomicBool::new(false);
    let (tx, rx) = bounded::<(usize, Result<T>)>(total.max(1));

    thread::scope(|scope| {
        let handles: Vec<_> = shards
            .into_iter()
            .enumerate()
            .map(|(idx, shard)| {
                let tx = tx.clone();
                let cancel = &cancel;
                let work = &work;
                scope.spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| work(shard, cancel)))
                        .unwrap_or_else(|payload| Err(ConvError::WorkerPanic(panic_message(&*payload))));
                    if result.is_err() {
                        cancel.store(true, Ordering::Relaxed);
                    }
                    tx.send((idx, result)).ok();
                })
            })
            .collect();
        drop(tx);

        let mut outputs: Vec<Option<T>> = (0..total).map(|_| None).collect();
        let mut first_error: Option<String> = None;
        for (idx, result) in rx.iter() {
            match result {
                Ok(output) => outputs[idx] = Some(output),
                Err(ConvError::Cancelled) => {}
                Err(e) => {
                    warn!("Shard {} failed: {}", idx, e);
                    first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                first_error.get_or_insert_with(|| "worker thread panicked".to_string());
            }
        }

        let failed = outputs.iter().filter(|o| o.is_none()).count();
        if failed > 0 {
            return Err(ConvError::ShardFailure {
                failed,
                total,
                first: first_error.unwrap_or_else(|| "cancelled".to_string()),
            });
        }
        Ok(outputs.into_iter().flatten().collect())
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Merged result of a whole run
#[derive(Debug)]
pub struct PipelineOutput {
    /// Per-gene rows, sorted by gene identifier
    pub genes: Vec<GeneResult>,
    pub positions: PositionTally,
    /// Per-pair tallies sorted by read name (empty unless requested)
    pub pair_tallies: Vec<(Vec<u8>, ConversionTally)>,
    pub stats: ScanStats,
}

/// Scan `source` and aggregate conversions per gene.
///
/// Configuration is validated before any reader is opened.
pub fn run_pipeline(
    source: &AlignmentSource,
    scanner: &ConversionScanner,
    assigner: &dyn GeneAssigner,
    config: &PipelineConfig,
) -> Result<PipelineOutput> {
    scanner.config().validate()?;
    config.validate()?;
    if config.strategy == ShardStrategy::Chromosome && !source.has_index() {
        return Err(ConvError::Configuration(format!(
            "chromosome sharding requires an index for {}",
            source.path().display()
        )));
    }

    let t0 = Instant::now();
    let plans = plan_shards(config.strategy, config.shard_count, source.chromosomes().len());
    info!(
        "Scanning {} with {} shard(s) ({:?})",
        source.path().display(),
        plans.len(),
        config.strategy
    );

    let outputs = fan_out(plans, |plan, cancel| {
        scan_shard(source, plan, scanner, assigner, config, cancel)
    })?;

    let mut merged = ShardOutput {
        genes: GeneAggregator::new(assigner.genes().len()),
        ..Default::default()
    };
    for output in outputs {
        merged.merge(output);
    }
    merged.pair_tallies.sort_by(|a, b| a.0.cmp(&b.0));

    let genes = merged.genes.results(assigner.genes());
    info!(
        "Scan complete in {:.2}s: {} genes with assigned pairs",
        t0.elapsed().as_secs_f64(),
        genes.len()
    );
    merged.stats.log_summary();

    Ok(PipelineOutput {
        genes,
        positions: merged.positions,
        pair_tallies: merged.pair_tallies,
        stats: merged.stats,
    })
}

// ============================================================================
// Tests
// ============================================================================
