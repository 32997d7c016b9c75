//! Fixture builders shared by the unit tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rust_htslib::bam;
use rust_htslib::bam::header::HeaderRecord;
use rust_htslib::bam::record::{Aux, Cigar, CigarString};

use crate::cigar_utils::AlignOp;
use crate::read_pairer::{AlignedRead, Mate, ReadPair, Strand};

const FLAG_PAIRED: u16 = 0x1;
const FLAG_PROPER: u16 = 0x2;
const FLAG_REVERSE: u16 = 0x10;
const FLAG_MATE_REVERSE: u16 = 0x20;
const FLAG_FIRST: u16 = 0x40;
const FLAG_SECOND: u16 = 0x80;
const FLAG_SECONDARY: u16 = 0x100;

pub const CHROM_LEN: u32 = 100_000;

// ============================================================================
// In-memory reads
// ============================================================================

pub fn cigar_ops(cigar: &str) -> Vec<Cigar> {
    let mut ops = Vec::new();
    let mut len = 0u32;
    for c in cigar.chars() {
        if let Some(d) = c.to_digit(10) {
            len = len * 10 + d;
            continue;
        }
        ops.push(match c {
            'M' => Cigar::Match(len),
            'I' => Cigar::Ins(len),
            'D' => Cigar::Del(len),
            'N' => Cigar::RefSkip(len),
            'S' => Cigar::SoftClip(len),
            'H' => Cigar::HardClip(len),
            'P' => Cigar::Pad(len),
            '=' => Cigar::Equal(len),
            'X' => Cigar::Diff(len),
            other => panic!("bad CIGAR op {other}"),
        });
        len = 0;
    }
    ops
}

pub fn parse_cigar(cigar: &str) -> Vec<AlignOp> {
    cigar_ops(cigar).iter().map(AlignOp::from).collect()
}

pub fn read_on(
    chrom: &str,
    mate: Mate,
    strand: Strand,
    start: u32,
    cigar: &str,
    seq: &[u8],
    md: &str,
) -> AlignedRead {
    AlignedRead {
        chrom: Arc::from(chrom),
        start,
        ops: parse_cigar(cigar),
        seq: seq.to_vec(),
        md: Some(md.as_bytes().to_vec()),
        strand,
        mate,
    }
}

/// A read on chr1.
pub fn read_at(mate: Mate, strand: Strand, start: u32, cigar: &str, seq: &[u8], md: &str) -> AlignedRead {
    read_on("chr1", mate, strand, start, cigar, seq, md)
}

pub fn pair(name: &str, read1: AlignedRead, read2: AlignedRead) -> ReadPair {
    ReadPair {
        name: name.as_bytes().to_vec(),
        read1,
        read2,
    }
}

// ============================================================================
// Synthetic reference
// ============================================================================

/// Deterministic pseudo-random reference base.
pub fn reference_base(tid: i32, pos: u32) -> u8 {
    let mut x = (pos as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (tid as u64 + 1);
    x ^= x >> 29;
    b"ACGT"[(x % 4) as usize]
}

/// MD tag describing `read` against `reference` for an all-match CIGAR.
pub fn md_tag(reference: &[u8], read: &[u8]) -> String {
    let mut md = String::new();
    let mut run = 0;
    for (r, q) in reference.iter().zip(read) {
        if r == q {
            run += 1;
        } else {
            md.push_str(&run.to_string());
            md.push(*r as char);
            run = 0;
        }
    }
    md.push_str(&run.to_string());
    md
}

/// Sequence and MD tag of a `len`M read starting at `start` (1-based), with
/// every position where `convert` returns true and the reference is G
/// observed as T.
pub fn synthetic_read(tid: i32, start: u32, len: u32, convert: impl Fn(u32) -> bool) -> (Vec<u8>, String) {
    let reference: Vec<u8> = (start..start + len).map(|p| reference_base(tid, p)).collect();
    let read: Vec<u8> = reference
        .iter()
        .zip(start..)
        .map(|(&b, pos)| if b == b'G' && convert(pos) { b'T' } else { b })
        .collect();
    let md = md_tag(&reference, &read);
    (read, md)
}

// ============================================================================
// BAM fixtures
// ============================================================================

#[derive(Debug, Clone)]
pub struct FixtureRead {
    name: String,
    tid: i32,
    start: u32,
    mate_start: u32,
    cigar: String,
    seq: Vec<u8>,
    md: Option<String>,
    flags: u16,
}

impl FixtureRead {
    pub fn new(name: &str, tid: i32, start: u32, cigar: &str, seq: &[u8], md: &str) -> Self {
        Self {
            name: name.to_string(),
            tid,
            start,
            mate_start: start,
            cigar: cigar.to_string(),
            seq: seq.to_vec(),
            md: Some(md.to_string()),
            flags: FLAG_PAIRED | FLAG_PROPER,
        }
    }

    pub fn first(mut self) -> Self {
        self.flags |= FLAG_FIRST;
        self
    }

    pub fn second(mut self) -> Self {
        self.flags |= FLAG_SECOND;
        self
    }

    pub fn reverse(mut self) -> Self {
        self.flags |= FLAG_REVERSE;
        self
    }

    pub fn mate_reverse(mut self) -> Self {
        self.flags |= FLAG_MATE_REVERSE;
        self
    }

    pub fn secondary(mut self) -> Self {
        self.flags |= FLAG_SECONDARY;
        self
    }

    pub fn improper(mut self) -> Self {
        self.flags &= !FLAG_PROPER;
        self
    }

    pub fn without_md(mut self) -> Self {
        self.md = None;
        self
    }

    pub fn mate_at(mut self, start: u32) -> Self {
        self.mate_start = start;
        self
    }

    fn to_record(&self) -> bam::Record {
        let cigar = CigarString(cigar_ops(&self.cigar));
        let qual = vec![30u8; self.seq.len()];
        let mut rec = bam::Record::new();
        rec.set(self.name.as_bytes(), Some(&cigar), &self.seq, &qual);
        rec.set_tid(self.tid);
        rec.set_pos(self.start as i64 - 1);
        rec.set_mtid(self.tid);
        rec.set_mpos(self.mate_start as i64 - 1);
        rec.set_mapq(60);
        rec.set_flags(self.flags);
        if let Some(md) = &self.md {
            rec.push_aux(b"MD", Aux::String(md)).unwrap();
        }
        rec
    }
}

/// Builds small coordinate-sorted BAM files.
#[derive(Debug, Clone, Default)]
pub struct BamFixture {
    chroms: Vec<String>,
    reads: Vec<FixtureRead>,
}

impl BamFixture {
    pub fn new(chroms: &[&str]) -> Self {
        Self {
            chroms: chroms.iter().map(|c| c.to_string()).collect(),
            reads: Vec::new(),
        }
    }

    pub fn push(&mut self, read: FixtureRead) {
        self.reads.push(read);
    }

    /// Read1 forward at `start1`, read2 reverse at `start2`.
    #[allow(clippy::too_many_arguments)]
    pub fn pair(
        mut self,
        name: &str,
        tid: i32,
        start1: u32,
        cigar1: &str,
        seq1: &[u8],
        md1: &str,
        start2: u32,
        cigar2: &str,
        seq2: &[u8],
        md2: &str,
    ) -> Self {
        self.push(
            FixtureRead::new(name, tid, start1, cigar1, seq1, md1)
                .first()
                .mate_reverse()
                .mate_at(start2),
        );
        self.push(
            FixtureRead::new(name, tid, start2, cigar2, seq2, md2)
                .second()
                .reverse()
                .mate_at(start1),
        );
        self
    }

    fn header(&self) -> bam::Header {
        let mut header = bam::Header::new();
        let mut hd = HeaderRecord::new(b"HD");
        hd.push_tag(b"VN", "1.6");
        hd.push_tag(b"SO", "coordinate");
        header.push_record(&hd);
        for chrom in &self.chroms {
            let mut sq = HeaderRecord::new(b"SQ");
            sq.push_tag(b"SN", chrom);
            sq.push_tag(b"LN", CHROM_LEN);
            header.push_record(&sq);
        }
        header
    }

    pub fn write_unindexed(&self, dir: &Path, file: &str) -> PathBuf {
        let path = dir.join(file);
        let mut reads = self.reads.clone();
        reads.sort_by_key(|r| (r.tid, r.start));
        {
            let mut writer = bam::Writer::from_path(&path, &self.header(), bam::Format::Bam).unwrap();
            for read in &reads {
                writer.write(&read.to_record()).unwrap();
            }
        }
        path
    }

    /// Write and build a BAI.
    pub fn write(&self, dir: &Path, file: &str) -> PathBuf {
        let path = self.write_unindexed(dir, file);
        bam::index::build(&path, None, bam::index::Type::Bai, 1).unwrap();
        path
    }
}
