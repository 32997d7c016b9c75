//! Read Pairing
//!
//! Streams alignment records, drops the ones that cannot contribute (unmapped,
//! secondary, supplementary, improper pairs) and joins mates by read name.
//!
//! - FxHashMap keyed by raw name bytes holds reads whose mate is still pending
//! - One `bam::Record` buffer is reused for every read
//! - Optional name-hash selection lets N independent streams split one file

use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rust_htslib::bam::record::Aux;
use rust_htslib::{bam, bam::Read as BamRead};
use rustc_hash::{FxHashMap, FxHasher};

use crate::cigar_utils::{reference_len, AlignOp};
use crate::error::{ConvError, Result};
use crate::seq_decode::decode_seq_into;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strand {
    Forward,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mate {
    First,
    Second,
}

/// One mate of a pair, decoded out of its BAM record
#[derive(Debug, Clone)]
pub struct AlignedRead {
    pub chrom: Arc<str>,
    /// 1-based leftmost reference position
    pub start: u32,
    pub ops: Vec<AlignOp>,
    pub seq: Vec<u8>,
    /// Raw MD tag, if present
    pub md: Option<Vec<u8>>,
    pub strand: Strand,
    pub mate: Mate,
}

impl AlignedRead {
    /// Decode a record whose target id has already been validated.
    fn from_record(record: &bam::Record, chrom: Arc<str>) -> Self {
        let mut seq = Vec::new();
        decode_seq_into(record, &mut seq);

        let md = match record.aux(b"MD") {
            Ok(Aux::String(s)) => Some(s.as_bytes().to_vec()),
            _ => None,
        };

        Self {
            chrom,
            start: (record.pos() + 1) as u32,
            ops: record.cigar().iter().map(AlignOp::from).collect(),
            seq,
            md,
            strand: if record.is_reverse() { Strand::Reverse } else { Strand::Forward },
            mate: if record.is_first_in_template() { Mate::First } else { Mate::Second },
        }
    }

    /// 1-based inclusive last reference position.
    pub fn end(&self) -> u32 {
        let len = reference_len(&self.ops);
        if len == 0 {
            self.start
        } else {
            self.start + len - 1
        }
    }
}

/// Both mates of one fragment; read1 carries the first-in-template flag.
#[derive(Debug, Clone)]
pub struct ReadPair {
    pub name: Vec<u8>,
    pub read1: AlignedRead,
    pub read2: AlignedRead,
}

impl ReadPair {
    pub fn name_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Reference span covered by both mates when they are on the same
    /// chromosome, as 1-based inclusive `(start, end)`.
    pub fn footprint(&self) -> Option<(&str, u32, u32)> {
        if self.read1.chrom != self.read2.chrom {
            return None;
        }
        Some((
            &*self.read1.chrom,
            self.read1.start.min(self.read2.start),
            self.read1.end().max(self.read2.end()),
        ))
    }

    /// Reference interval covered by both mates, if any.
    pub fn shared_span(&self) -> Option<(u32, u32)> {
        if self.read1.chrom != self.read2.chrom {
            return None;
        }
        let start = self.read1.start.max(self.read2.start);
        let end = self.read1.end().min(self.read2.end());
        (start <= end).then_some((start, end))
    }
}

/// Statistics for read pairing
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PairingStats {
    /// Reads seen by this stream (after shard selection)
    pub total_reads: usize,
    /// Unmapped, secondary, supplementary, improper or split-chromosome reads
    pub reads_filtered: usize,
    /// Pairs yielded
    pub pairs: usize,
    /// Reads whose mate never appeared
    pub orphan_reads: usize,
}

impl PairingStats {
    pub fn merge(self, other: Self) -> Self {
        Self {
            total_reads: self.total_reads + other.total_reads,
            reads_filtered: self.reads_filtered + other.reads_filtered,
            pairs: self.pairs + other.pairs,
            orphan_reads: self.orphan_reads + other.orphan_reads,
        }
    }
}

/// Stable assignment of read names to one of `count` shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameShard {
    pub index: usize,
    pub count: usize,
}

impl NameShard {
    #[inline]
    pub fn keeps(&self, name: &[u8]) -> bool {
        self.count <= 1 || shard_of(name, self.count) == self.index
    }
}

/// Shard index for a read name (FxHasher, identical on every run).
pub fn shard_of(name: &[u8], count: usize) -> usize {
    let mut hasher = FxHasher::default();
    hasher.write(name);
    (hasher.finish() % count as u64) as usize
}

// ============================================================================
// Alignment Source
// ============================================================================

/// A BAM file on disk plus its chromosome names.
#[derive(Debug, Clone)]
pub struct AlignmentSource {
    path: PathBuf,
    chroms: Arc<[Arc<str>]>,
}

impl AlignmentSource {
    /// Open the file once to validate it and read the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = bam::Reader::from_path(&path)?;
        let header = reader.header();
        let chroms: Vec<Arc<str>> = (0..header.target_count())
            .map(|tid| Arc::from(String::from_utf8_lossy(header.tid2name(tid)).as_ref()))
            .collect();
        Ok(Self {
            path,
            chroms: chroms.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Chromosome names in header order (index = tid)
    pub fn chromosomes(&self) -> &Arc<[Arc<str>]> {
        &self.chroms
    }

    pub fn has_index(&self) -> bool {
        bam::IndexedReader::from_path(&self.path).is_ok()
    }

    /// Build a BAI next to the file unless one is already usable.
    pub fn ensure_index(&self) -> Result<()> {
        if self.has_index() {
            return Ok(());
        }
        log::info!("Building index for {}", self.path.display());
        bam::index::build(&self.path, None, bam::index::Type::Bai, 1)?;
        Ok(())
    }

    /// Sequential reader over the whole file.
    pub fn reader(&self, threads: usize) -> Result<bam::Reader> {
        let mut reader = bam::Reader::from_path(&self.path)?;
        if threads > 1 {
            if let Err(e) = reader.set_threads(threads) {
                warn!("Could not start {} decompression threads, reading single-threaded: {}", threads, e);
            }
        }
        Ok(reader)
    }

    /// Indexed reader for per-chromosome fetches.
    pub fn indexed_reader(&self, threads: usize) -> Result<bam::IndexedReader> {
        let mut reader = bam::IndexedReader::from_path(&self.path)?;
        if threads > 1 {
            if let Err(e) = reader.set_threads(threads) {
                warn!("Could not start {} decompression threads, reading single-threaded: {}", threads, e);
            }
        }
        Ok(reader)
    }
}

// ============================================================================
// Read Pairing Iterator
// ============================================================================

/// Iterator that yields mate pairs from any htslib reader
///
/// Yields `Err(RecordParse)` for a pair whose mates cannot be told apart and
/// `Err(Htslib)` when the underlying stream fails. Orphans are counted once
/// the stream is exhausted.
pub struct ReadPairer<'a, R: BamRead> {
    reader: &'a mut R,
    chroms: Arc<[Arc<str>]>,
    selector: Option<NameShard>,
    /// Key: read name, Value: first mate seen
    unpaired: FxHashMap<Vec<u8>, bam::Record>,
    record: bam::Record,
    stats: PairingStats,
    done: bool,
}

impl<'a, R: BamRead> ReadPairer<'a, R> {
    pub fn new(reader: &'a mut R, chroms: Arc<[Arc<str>]>) -> Self {
        Self {
            reader,
            chroms,
            selector: None,
            unpaired: FxHashMap::default(),
            record: bam::Record::new(),
            stats: PairingStats::default(),
            done: false,
        }
    }

    /// Only keep reads whose name hashes to `index` of `count`.
    pub fn with_name_shard(mut self, index: usize, count: usize) -> Self {
        self.selector = Some(NameShard { index, count });
        self
    }

    pub fn stats(&self) -> PairingStats {
        self.stats
    }

    /// Check if a read can contribute to a pair
    ///
    /// Filters:
    /// - Must be mapped
    /// - Must be proper pair
    /// - Must not be secondary alignment
    /// - Must not be supplementary alignment
    /// - Mate must be on the same chromosome
    fn passes_filters(read: &bam::Record) -> bool {
        !read.is_unmapped()
            && read.is_proper_pair()
            && !read.is_secondary()
            && !read.is_supplementary()
            && read.tid() == read.mtid()
    }

    fn chrom_of(&self, read: &bam::Record) -> Option<Arc<str>> {
        usize::try_from(read.tid())
            .ok()
            .and_then(|tid| self.chroms.get(tid))
            .cloned()
    }

    fn make_pair(&self, read: bam::Record, mate: bam::Record) -> Result<ReadPair> {
        if read.is_first_in_template() == mate.is_first_in_template() {
            return Err(ConvError::record(
                read.qname(),
                "both mates carry the same template position flag",
            ));
        }
        let chrom = self
            .chrom_of(&read)
            .ok_or_else(|| ConvError::record(read.qname(), "target id not in header"))?;

        let (first, second) = if read.is_first_in_template() {
            (read, mate)
        } else {
            (mate, read)
        };
        Ok(ReadPair {
            name: first.qname().to_vec(),
            read1: AlignedRead::from_record(&first, chrom.clone()),
            read2: AlignedRead::from_record(&second, chrom),
        })
    }

    fn finish(&mut self) {
        self.done = true;
        self.stats.orphan_reads += self.unpaired.len();
        if !self.unpaired.is_empty() {
            debug!("{} reads without a mate", self.unpaired.len());
        }
        self.unpaired.clear();
    }
}

impl<R: BamRead> Iterator for ReadPairer<'_, R> {
    type Item = Result<ReadPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.reader.read(&mut self.record) {
                None => {
                    self.finish();
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                Some(Ok(())) => {}
            }

            if let Some(selector) = &self.selector {
                if !selector.keeps(self.record.qname()) {
                    continue;
                }
            }
            self.stats.total_reads += 1;

            if !Self::passes_filters(&self.record) {
                self.stats.reads_filtered += 1;
                continue;
            }

            let read = std::mem::replace(&mut self.record, bam::Record::new());
            match self.unpaired.remove(read.qname()) {
                Some(mate) => {
                    self.stats.pairs += 1;
                    return Some(self.make_pair(read, mate));
                }
                None => {
                    self.unpaired.insert(read.qname().to_vec(), read);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
