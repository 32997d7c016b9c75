//! gconv: per-gene G->T / G->C conversion quantification from paired-end
//! alignments.
//!
//! Read pairs are streamed from a BAM, scanned for reference-G conversions
//! (outside SNP and manual masks), assigned to genes by interval overlap or
//! transcript posteriors, and aggregated into per-gene totals.

pub mod aggregate; // Fixed-point per-gene accumulators
pub mod cigar_utils; // CIGAR + MD walk yielding aligned (ref, read) bases
pub mod config;
pub mod error;
pub mod gene_assign; // Exact (interval) and probabilistic assignment
pub mod inputs; // BED / VCF / TSV loaders
pub mod pipeline; // Sharded scan, assign and merge
pub mod positions;
pub mod read_pairer;
pub mod report;
pub mod scanner;
pub mod seq_decode;

#[cfg(test)]
mod test_utils;

pub use aggregate::{GeneAggregator, GeneResult, Weight};
pub use config::{Orientation, PipelineConfig, ScanConfig, ShardStrategy};
pub use error::{ConvError, Result};
pub use gene_assign::{
    Assignment, ExactAssigner, GeneAssigner, GeneInterval, ProbabilisticAssigner, UnassignedReason,
};
pub use pipeline::{run_pipeline, PipelineOutput, ScanStats};
pub use positions::{GenomicPosition, PositionMask, PositionTally, VariantMask};
pub use read_pairer::{AlignmentSource, ReadPair, ReadPairer};
pub use scanner::{ConversionScanner, ConversionTally};
