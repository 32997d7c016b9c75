//! CIGAR-aware reference/read coordinate walking
//!
//! Maps every aligned read base to its reference position and reference base.
//! The reference base is reconstructed from the read's MD tag, which is walked
//! in lockstep with the CIGAR.
//!
//! # Key Concepts
//!
//! When a read has insertions, deletions or introns, `ref_pos = start + offset`
//! is WRONG. Each operation advances the two cursors differently:
//!
//! ## CIGAR Operations
//! - M/=/X: consume both ref and query (1:1 mapping, candidates for inspection)
//! - I: consume query only (insertion in read)
//! - D/N: consume ref only (deletion / intron skip)
//! - S: consume query only (soft clip)
//! - H/P: consume neither
//!
//! ## MD Tag
//! `[0-9]+(([A-Z]|\^[A-Z]+)[0-9]+)*`. Numbers are runs of matching bases,
//! letters are the reference base at a mismatch, `^` introduces deleted
//! reference bases. Introns (N) do not appear in MD.

use rust_htslib::bam::record::Cigar;
use thiserror::Error;

// ============================================================================
// Alignment operations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignOpKind {
    /// M, = or X
    Match,
    Insertion,
    Deletion,
    /// N (intron)
    Skip,
    SoftClip,
    HardClip,
    Padding,
}

impl AlignOpKind {
    #[inline]
    pub fn consumes_ref(self) -> bool {
        matches!(self, AlignOpKind::Match | AlignOpKind::Deletion | AlignOpKind::Skip)
    }

    #[inline]
    pub fn consumes_query(self) -> bool {
        matches!(
            self,
            AlignOpKind::Match | AlignOpKind::Insertion | AlignOpKind::SoftClip
        )
    }

    /// Insertions and deletions make the flanking base placement ambiguous.
    #[inline]
    fn is_indel(self) -> bool {
        matches!(self, AlignOpKind::Insertion | AlignOpKind::Deletion)
    }
}

/// One CIGAR operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignOp {
    pub kind: AlignOpKind,
    pub len: u32,
}

impl AlignOp {
    pub fn new(kind: AlignOpKind, len: u32) -> Self {
        Self { kind, len }
    }
}

impl From<&Cigar> for AlignOp {
    fn from(op: &Cigar) -> Self {
        match *op {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                AlignOp::new(AlignOpKind::Match, len)
            }
            Cigar::Ins(len) => AlignOp::new(AlignOpKind::Insertion, len),
            Cigar::Del(len) => AlignOp::new(AlignOpKind::Deletion, len),
            Cigar::RefSkip(len) => AlignOp::new(AlignOpKind::Skip, len),
            Cigar::SoftClip(len) => AlignOp::new(AlignOpKind::SoftClip, len),
            Cigar::HardClip(len) => AlignOp::new(AlignOpKind::HardClip, len),
            Cigar::Pad(len) => AlignOp::new(AlignOpKind::Padding, len),
        }
    }
}

/// Number of reference bases spanned by the alignment (including D and N).
pub fn reference_len(ops: &[AlignOp]) -> u32 {
    ops.iter()
        .filter(|op| op.kind.consumes_ref())
        .map(|op| op.len)
        .sum()
}

/// Number of query bases the CIGAR accounts for.
pub fn query_len(ops: &[AlignOp]) -> usize {
    ops.iter()
        .filter(|op| op.kind.consumes_query())
        .map(|op| op.len as usize)
        .sum()
}

// ============================================================================
// MD tag
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdToken {
    /// Run of reference-matching bases
    Matches(u32),
    /// Reference base at a mismatch
    Mismatch(u8),
    /// Deleted reference bases
    Deletion(Vec<u8>),
}

/// Errors from the coordinate walk. Each one invalidates the whole read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalkError {
    #[error("malformed MD tag at byte {0}")]
    MalformedMd(usize),
    #[error("MD tag describes fewer aligned bases than the CIGAR")]
    MdExhausted,
    #[error("MD tag describes more bases than the CIGAR")]
    MdTrailing,
    #[error("CIGAR deletion of {cigar} bases disagrees with MD deletion of {md}")]
    DeletionMismatch { cigar: u32, md: usize },
    #[error("CIGAR covers {cigar} query bases but sequence has {seq}")]
    SequenceLength { cigar: usize, seq: usize },
}

/// Tokenise an MD tag.
pub fn parse_md(md: &[u8]) -> Result<Vec<MdToken>, WalkError> {
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < md.len() {
        let c = md[i];
        if c.is_ascii_digit() {
            let mut run: u32 = 0;
            while i < md.len() && md[i].is_ascii_digit() {
                run = run
                    .checked_mul(10)
                    .and_then(|r| r.checked_add((md[i] - b'0') as u32))
                    .ok_or(WalkError::MalformedMd(i))?;
                i += 1;
            }
            tokens.push(MdToken::Matches(run));
        } else if c == b'^' {
            let begin = i + 1;
            i = begin;
            while i < md.len() && md[i].is_ascii_alphabetic() {
                i += 1;
            }
            if i == begin {
                return Err(WalkError::MalformedMd(begin - 1));
            }
            tokens.push(MdToken::Deletion(md[begin..i].to_ascii_uppercase()));
        } else if c.is_ascii_alphabetic() {
            tokens.push(MdToken::Mismatch(c.to_ascii_uppercase()));
            i += 1;
        } else {
            return Err(WalkError::MalformedMd(i));
        }
    }
    Ok(tokens)
}

/// Cursor over MD tokens that hands out one reference base at a time.
struct MdCursor {
    tokens: std::vec::IntoIter<MdToken>,
    pending_matches: u32,
    peeked: Option<MdToken>,
}

impl MdCursor {
    fn new(tokens: Vec<MdToken>) -> Self {
        Self {
            tokens: tokens.into_iter(),
            pending_matches: 0,
            peeked: None,
        }
    }

    /// Next non-empty token, skipping zero-length match runs.
    fn next_token(&mut self) -> Option<MdToken> {
        loop {
            match self.peeked.take().or_else(|| self.tokens.next())? {
                MdToken::Matches(0) => continue,
                token => return Some(token),
            }
        }
    }

    /// Reference base for one aligned position; `None` means "same as read".
    fn next_base(&mut self) -> Result<Option<u8>, WalkError> {
        if self.pending_matches > 0 {
            self.pending_matches -= 1;
            return Ok(None);
        }
        match self.next_token() {
            Some(MdToken::Matches(n)) => {
                self.pending_matches = n - 1;
                Ok(None)
            }
            Some(MdToken::Mismatch(base)) => Ok(Some(base)),
            Some(token @ MdToken::Deletion(_)) => {
                self.peeked = Some(token);
                Err(WalkError::MdExhausted)
            }
            None => Err(WalkError::MdExhausted),
        }
    }

    fn take_deletion(&mut self, len: u32) -> Result<(), WalkError> {
        if self.pending_matches > 0 {
            return Err(WalkError::DeletionMismatch { cigar: len, md: 0 });
        }
        match self.next_token() {
            Some(MdToken::Deletion(bases)) if bases.len() == len as usize => Ok(()),
            Some(MdToken::Deletion(bases)) => Err(WalkError::DeletionMismatch {
                cigar: len,
                md: bases.len(),
            }),
            _ => Err(WalkError::DeletionMismatch { cigar: len, md: 0 }),
        }
    }

    fn finish(mut self) -> Result<(), WalkError> {
        if self.pending_matches > 0 || self.next_token().is_some() {
            return Err(WalkError::MdTrailing);
        }
        Ok(())
    }
}

// ============================================================================
// Coordinate walk
// ============================================================================

/// One aligned (M/=/X) base of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedBase {
    /// 1-based reference position
    pub ref_pos: u32,
    /// 0-based index into the read sequence
    pub query_idx: usize,
    /// Reference base (uppercase)
    pub ref_base: u8,
    /// Observed base (uppercase)
    pub read_base: u8,
    /// Directly before or after an insertion or deletion
    pub flanks_indel: bool,
}

/// Walk every aligned base of a read, calling `visit` in reference order.
///
/// # Arguments
/// * `start` - 1-based leftmost reference position
/// * `ops` - CIGAR operations
/// * `seq` - Read sequence as stored in the record
/// * `md` - Raw MD tag
///
/// Nothing is visited when the walk fails; the read must be treated as
/// malformed.
pub fn walk_aligned_bases<F>(
    start: u32,
    ops: &[AlignOp],
    seq: &[u8],
    md: &[u8],
    mut visit: F,
) -> Result<(), WalkError>
where
    F: FnMut(AlignedBase),
{
    let expected = query_len(ops);
    if expected != seq.len() {
        return Err(WalkError::SequenceLength {
            cigar: expected,
            seq: seq.len(),
        });
    }

    // Resolve everything first so a late failure leaves `visit` untouched.
    let mut bases = Vec::with_capacity(seq.len());
    let mut cursor = MdCursor::new(parse_md(md)?);
    let mut ref_pos = start;
    let mut query_idx = 0usize;

    for (i, op) in ops.iter().enumerate() {
        match op.kind {
            AlignOpKind::Match => {
                let after_indel = i > 0 && ops[i - 1].kind.is_indel();
                let before_indel = ops.get(i + 1).map_or(false, |next| next.kind.is_indel());
                for offset in 0..op.len {
                    let read_base = seq[query_idx].to_ascii_uppercase();
                    let ref_base = cursor.next_base()?.unwrap_or(read_base);
                    bases.push(AlignedBase {
                        ref_pos,
                        query_idx,
                        ref_base,
                        read_base,
                        flanks_indel: (after_indel && offset == 0)
                            || (before_indel && offset + 1 == op.len),
                    });
                    ref_pos += 1;
                    query_idx += 1;
                }
            }
            AlignOpKind::Deletion => {
                cursor.take_deletion(op.len)?;
                ref_pos += op.len;
            }
            AlignOpKind::Skip => ref_pos += op.len,
            AlignOpKind::Insertion | AlignOpKind::SoftClip => query_idx += op.len as usize,
            AlignOpKind::HardClip | AlignOpKind::Padding => {}
        }
    }
    cursor.finish()?;

    bases.into_iter().for_each(&mut visit);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
