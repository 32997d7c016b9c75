//! Tab-separated output tables.
//!
//! Files are first written next to their destination with a `.tmp` suffix and
//! only renamed into place once every table of the run has been written.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::aggregate::GeneResult;
use crate::error::{ConvError, Result};
use crate::positions::PositionTally;
use crate::scanner::ConversionTally;

// ============================================================================
// Table writers
// ============================================================================

/// Per-gene report, one row per gene sorted by identifier.
///
/// ```text
/// gene_id  assigned_pairs  conversions  [g_t  g_c]  g_positions  conversion_rate
/// ```
pub fn write_gene_table<W: Write>(out: &mut W, genes: &[GeneResult], both_types: bool) -> io::Result<()> {
    if both_types {
        writeln!(out, "gene_id\tassigned_pairs\tconversions\tg_t\tg_c\tg_positions\tconversion_rate")?;
    } else {
        writeln!(out, "gene_id\tassigned_pairs\tconversions\tg_positions\tconversion_rate")?;
    }
    for gene in genes {
        let rate = match gene.conversion_rate() {
            Some(r) => format!("{r:.6}"),
            None => "NA".to_string(),
        };
        if both_types {
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                gene.gene_id, gene.assigned_pairs, gene.conversions, gene.g_t, gene.g_c, gene.g_positions, rate
            )?;
        } else {
            writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}",
                gene.gene_id, gene.assigned_pairs, gene.conversions, gene.g_positions, rate
            )?;
        }
    }
    Ok(())
}

/// Converted positions sorted by chromosome then position.
pub fn write_position_table<W: Write>(out: &mut W, positions: &PositionTally) -> io::Result<()> {
    writeln!(out, "chrom\tpos\tconversions")?;
    for (position, count) in positions.sorted() {
        writeln!(out, "{}\t{}\t{}", position.chrom, position.pos, count)?;
    }
    Ok(())
}

/// Per-pair tallies, expected sorted by read name.
pub fn write_pair_table<W: Write>(out: &mut W, pairs: &[(Vec<u8>, ConversionTally)]) -> io::Result<()> {
    writeln!(out, "read_name\tg_t\tg_c\tg_positions")?;
    for (name, tally) in pairs {
        out.write_all(name)?;
        writeln!(out, "\t{}\t{}\t{}", tally.g_t, tally.g_c, tally.g_positions)?;
    }
    Ok(())
}

// ============================================================================
// Staged output files
// ============================================================================

/// A fully written temporary file waiting to be renamed.
#[derive(Debug)]
pub struct StagedFile {
    tmp: PathBuf,
    dest: PathBuf,
}

fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write a table to `<dest>.tmp`.
pub fn stage<F>(dest: &Path, write: F) -> Result<StagedFile>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let tmp = tmp_path(dest);
    let io_err = |source| ConvError::Io {
        path: tmp.clone(),
        source,
    };

    let result = File::create(&tmp).and_then(|file| {
        let mut writer = BufWriter::with_capacity(1024 * 1024, file);
        write(&mut writer)?;
        writer.flush()
    });
    if let Err(e) = result {
        fs::remove_file(&tmp).ok();
        return Err(io_err(e));
    }
    Ok(StagedFile {
        tmp,
        dest: dest.to_path_buf(),
    })
}

/// Rename every staged file into place.
pub fn commit(staged: Vec<StagedFile>) -> Result<()> {
    for file in staged {
        fs::rename(&file.tmp, &file.dest).map_err(|source| ConvError::Io {
            path: file.dest.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Remove staged files after a later failure.
pub fn discard(staged: Vec<StagedFile>) {
    for file in staged {
        fs::remove_file(&file.tmp).ok();
    }
}

// ============================================================================
// Tests
// ============================================================================
