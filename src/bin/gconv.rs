//! Command-line entry point: load inputs, run the sharded scan, write reports.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{info, warn};

use gconv::gene_assign::GeneAssigner;
use gconv::inputs::{
    load_gene_intervals, load_position_mask, load_posteriors, load_tx2gene, load_variant_mask,
};
use gconv::report::{self, StagedFile};
use gconv::{
    run_pipeline, AlignmentSource, ConversionScanner, ExactAssigner, Orientation, PipelineConfig,
    PositionMask, ProbabilisticAssigner, ScanConfig, ShardStrategy, VariantMask,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ShardBy {
    /// Every shard streams the file and keeps its share of read names
    NameHash,
    /// Chromosomes are split across shards (requires an index)
    Chromosome,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LibraryOrientation {
    /// Read1 antisense to the transcript (dUTP)
    Read1Antisense,
    /// Read1 sense to the transcript
    Read1Sense,
}

/// Quantify G->T / G->C conversions per gene from a paired-end BAM.
#[derive(Debug, Parser)]
#[command(name = "gconv", version)]
struct Args {
    /// Coordinate-sorted paired-end BAM with MD tags
    #[arg(long)]
    bam: PathBuf,

    /// Per-gene report (TSV)
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Gene intervals (BED: chrom, start, end, gene_id) for exact assignment
    #[arg(long, conflicts_with = "posteriors", required_unless_present = "posteriors")]
    gene_bed: Option<PathBuf>,

    /// Posterior table (read_name, transcript, probability) for probabilistic assignment
    #[arg(long, requires = "tx2gene")]
    posteriors: Option<PathBuf>,

    /// Transcript-to-gene table (transcript, gene)
    #[arg(long)]
    tx2gene: Option<PathBuf>,

    /// Known SNPs to exclude (VCF, optionally bgzipped)
    #[arg(long)]
    snp_vcf: Option<PathBuf>,

    /// Manually masked regions (BED)
    #[arg(long)]
    mask_bed: Option<PathBuf>,

    /// Count G->T conversions
    #[arg(long)]
    use_g_t: bool,

    /// Count G->C conversions
    #[arg(long)]
    use_g_c: bool,

    /// Inspect read1
    #[arg(long)]
    use_read1: bool,

    /// Inspect read2
    #[arg(long)]
    use_read2: bool,

    /// Where mates overlap, count a conversion only if both mates show it
    #[arg(long)]
    only_consider_overlap: bool,

    /// Minimum conversions for a pair's conversions to count
    #[arg(long, default_value_t = 1)]
    min_conversions: u32,

    /// Library strandedness
    #[arg(long, value_enum, default_value = "read1-antisense")]
    orientation: LibraryOrientation,

    /// Number of shards (worker threads)
    #[arg(short = 'j', long, default_value_t = 1)]
    shards: usize,

    /// Sharding strategy
    #[arg(long, value_enum, default_value = "name-hash")]
    shard_by: ShardBy,

    /// htslib decompression threads per worker
    #[arg(long, default_value_t = 1)]
    read_threads: usize,

    /// Per-position conversion table (TSV)
    #[arg(long)]
    positions_output: Option<PathBuf>,

    /// Per-pair conversion table (TSV)
    #[arg(long)]
    pairs_output: Option<PathBuf>,

    /// Build a BAI if the BAM has no index
    #[arg(long)]
    build_index: bool,
}

impl Args {
    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            use_g_t: self.use_g_t,
            use_g_c: self.use_g_c,
            use_read1: self.use_read1,
            use_read2: self.use_read2,
            only_consider_overlap: self.only_consider_overlap,
            min_conversions: self.min_conversions,
            orientation: match self.orientation {
                LibraryOrientation::Read1Antisense => Orientation::Read1Antisense,
                LibraryOrientation::Read1Sense => Orientation::Read1Sense,
            },
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            shard_count: self.shards,
            strategy: match self.shard_by {
                ShardBy::NameHash => ShardStrategy::ReadNameHash,
                ShardBy::Chromosome => ShardStrategy::Chromosome,
            },
            read_threads: self.read_threads,
            keep_pair_tallies: self.pairs_output.is_some(),
        }
    }

    fn assigner(&self) -> Result<Box<dyn GeneAssigner>> {
        if let Some(bed) = &self.gene_bed {
            let intervals = load_gene_intervals(bed)?;
            return Ok(Box::new(ExactAssigner::new(&intervals)));
        }
        let posteriors = self.posteriors.as_ref().context("Missing --gene-bed or --posteriors")?;
        let tx2gene = self.tx2gene.as_ref().context("--posteriors requires --tx2gene")?;
        let assigner = ProbabilisticAssigner::new(load_posteriors(posteriors)?, &load_tx2gene(tx2gene)?);
        if assigner.genes().is_empty() {
            warn!("No genes in {}; every pair will be unassigned", tx2gene.display());
        }
        Ok(Box::new(assigner))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let scan_config = args.scan_config();
    let pipeline_config = args.pipeline_config();
    scan_config.validate()?;
    pipeline_config.validate()?;

    let source = AlignmentSource::open(&args.bam)
        .with_context(|| format!("Failed to open BAM {}", args.bam.display()))?;
    if args.build_index {
        source.ensure_index()?;
    }

    let variants = match &args.snp_vcf {
        Some(path) => load_variant_mask(path)?,
        None => VariantMask::new(),
    };
    let mask = match &args.mask_bed {
        Some(path) => load_position_mask(path)?,
        None => PositionMask::new(),
    };
    let assigner = args.assigner()?;

    let scanner = ConversionScanner::new(&scan_config, &variants, &mask);
    let output = run_pipeline(&source, &scanner, assigner.as_ref(), &pipeline_config)?;

    let both_types = scan_config.reports_both_types();
    let mut staged: Vec<StagedFile> = Vec::new();
    let result = (|| -> gconv::Result<()> {
        staged.push(report::stage(&args.output, |w| {
            report::write_gene_table(w, &output.genes, both_types)
        })?);
        if let Some(path) = &args.positions_output {
            staged.push(report::stage(path, |w| report::write_position_table(w, &output.positions))?);
        }
        if let Some(path) = &args.pairs_output {
            staged.push(report::stage(path, |w| report::write_pair_table(w, &output.pair_tallies))?);
        }
        Ok(())
    })();
    if let Err(e) = result {
        report::discard(staged);
        return Err(e).context("Failed to write reports");
    }
    report::commit(staged)?;

    info!(
        "Wrote {} genes to {} ({} pairs assigned, {} unassigned)",
        output.genes.len(),
        args.output.display(),
        output.stats.pairs_assigned,
        output.stats.unassigned()
    );
    Ok(())
}
