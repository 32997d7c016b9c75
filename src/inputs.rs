//! Loaders turning annotation and mask files into the in-memory structures
//! the scanner and assigners consume.
//!
//! Every loader accepts plain text or gzip (`.gz`, `.bgz`).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use log::info;
use noodles_bgzf as bgzf;
use noodles_vcf as vcf;
use rustc_hash::FxHashMap;

use crate::gene_assign::{GeneInterval, PosteriorRow};
use crate::positions::{PositionMask, VariantMask};

fn is_gzipped(path: &Path) -> bool {
    let name = path.to_string_lossy().to_lowercase();
    name.ends_with(".gz") || name.ends_with(".bgz")
}

/// Buffered line reader over a plain or gzipped file.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if is_gzipped(path) {
        Ok(Box::new(BufReader::with_capacity(1024 * 1024, MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::with_capacity(1024 * 1024, file)))
    }
}

fn is_bed_header(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("track") || line.starts_with("browser") || line.trim().is_empty()
}

fn parse_u32(field: &str, what: &str, line_no: usize) -> Result<u32> {
    field
        .trim()
        .parse::<u32>()
        .with_context(|| format!("line {line_no}: failed to parse {what} '{field}'"))
}

// ============================================================================
// Masks
// ============================================================================

/// Manual mask from BED (`chrom start end`), expanded to 1-based positions
/// `start+1..=end`.
pub fn load_position_mask(path: &Path) -> Result<PositionMask> {
    let mut mask = PositionMask::new();
    for (idx, line) in open_text(path)?.lines().enumerate() {
        let line = line?;
        if is_bed_header(&line) {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            return Err(anyhow!("line {}: expected at least 3 BED columns", idx + 1));
        }
        let start = parse_u32(fields[1], "start", idx + 1)?;
        let end = parse_u32(fields[2], "end", idx + 1)?;
        mask.insert_range(fields[0], start + 1, end);
    }
    info!("Loaded {} masked positions from {}", mask.len(), path.display());
    Ok(mask)
}

/// SNP mask from a VCF: every reference position spanned by REF.
pub fn load_variant_mask(path: &Path) -> Result<VariantMask> {
    let file = File::open(path).with_context(|| format!("Failed to open VCF {}", path.display()))?;
    let mask = if is_gzipped(path) {
        variant_mask_from_reader(BufReader::with_capacity(1024 * 1024, bgzf::Reader::new(file)))?
    } else {
        variant_mask_from_reader(BufReader::with_capacity(1024 * 1024, file))?
    };
    info!("Loaded {} SNP positions from {}", mask.len(), path.display());
    Ok(mask)
}

fn variant_mask_from_reader<R: BufRead>(reader: R) -> Result<VariantMask> {
    let mut vcf_reader = vcf::io::Reader::new(reader);
    vcf_reader.read_header().context("Failed to read VCF header")?;

    let mut mask = VariantMask::new();
    for result in vcf_reader.records() {
        let record = result.context("Failed to read VCF record")?;
        let pos = match record.variant_start() {
            Some(Ok(p)) => p.get() as u32, // 1-based
            _ => continue,
        };
        let ref_len = record.reference_bases().len().max(1) as u32;
        mask.insert_range(record.reference_sequence_name(), pos, pos + ref_len - 1);
    }
    Ok(mask)
}

// ============================================================================
// Annotation
// ============================================================================

/// Gene intervals from BED (`chrom start end gene_id ...`).
pub fn load_gene_intervals(path: &Path) -> Result<Vec<GeneInterval>> {
    let mut genes = Vec::new();
    for (idx, line) in open_text(path)?.lines().enumerate() {
        let line = line?;
        if is_bed_header(&line) {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            return Err(anyhow!("line {}: expected at least 4 BED columns", idx + 1));
        }
        genes.push(GeneInterval {
            chrom: fields[0].to_string(),
            start: parse_u32(fields[1], "start", idx + 1)?,
            end: parse_u32(fields[2], "end", idx + 1)?,
            gene_id: fields[3].trim().to_string(),
        });
    }
    info!("Loaded {} gene intervals from {}", genes.len(), path.display());
    Ok(genes)
}

/// Transcript-to-gene table (`transcript<TAB>gene`).
pub fn load_tx2gene(path: &Path) -> Result<FxHashMap<String, String>> {
    let mut map = FxHashMap::default();
    for (idx, line) in open_text(path)?.lines().enumerate() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        match (fields.next(), fields.next()) {
            (Some(tx), Some(gene)) => {
                map.insert(tx.trim().to_string(), gene.trim().to_string());
            }
            _ => return Err(anyhow!("line {}: expected transcript and gene columns", idx + 1)),
        }
    }
    info!("Loaded {} transcript-to-gene entries", map.len());
    Ok(map)
}

/// Posterior probabilities in long format (`read_name<TAB>transcript<TAB>probability`).
///
/// Rows for the same read are gathered in file order. A first line whose
/// probability column is not a number is treated as a header.
pub fn load_posteriors(path: &Path) -> Result<FxHashMap<Vec<u8>, PosteriorRow>> {
    let mut rows: FxHashMap<Vec<u8>, PosteriorRow> = FxHashMap::default();
    let mut entries = 0usize;
    for (idx, line) in open_text(path)?.lines().enumerate() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            return Err(anyhow!("line {}: expected read, transcript and probability", idx + 1));
        }
        let prob = match fields[2].trim().parse::<f64>() {
            Ok(p) => p,
            Err(_) if idx == 0 => continue,
            Err(e) => {
                return Err(anyhow!("line {}: bad probability '{}': {}", idx + 1, fields[2], e));
            }
        };
        rows.entry(fields[0].as_bytes().to_vec())
            .or_default()
            .push((fields[1].to_string(), prob));
        entries += 1;
    }
    info!("Loaded {} posterior entries for {} read pairs", entries, rows.len());
    Ok(rows)
}

// ============================================================================
// Tests
// ============================================================================
