//! Conversion Scanner
//!
//! Finds reference-G positions in a read pair where the observed base is an
//! enabled substitution (G->T, G->C), after strand normalisation and masking.
//!
//! # Per-pair algorithm
//! 1. Walk each inspected mate's aligned bases (CIGAR + MD)
//! 2. Complement reference and observed bases for reverse-transcript reads
//! 3. Keep reference-G bases that are not adjacent to an indel and are absent
//!    from both masks
//! 4. Resolve positions covered by both mates so each counts once per pair
//! 5. Apply the minimum-conversion threshold
//!
//! Per-position tallies are only updated after the whole pair has been
//! resolved, so a malformed mate leaves them untouched.

use std::sync::Arc;

use crate::cigar_utils::walk_aligned_bases;
use crate::config::ScanConfig;
use crate::error::{ConvError, Result};
use crate::positions::{GenomicPosition, PositionMask, PositionTally, VariantMask};
use crate::read_pairer::{AlignedRead, ReadPair};
use crate::seq_decode::complement;

// ============================================================================
// Per-pair tally
// ============================================================================

/// Conversion evidence for one read pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionTally {
    /// Qualifying G->T conversions
    pub g_t: u32,
    /// Qualifying G->C conversions
    pub g_c: u32,
    /// Countable reference-G positions inspected
    pub g_positions: u32,
    /// Conversions were found but fewer than the configured minimum
    pub below_threshold: bool,
}

impl ConversionTally {
    #[inline]
    pub fn conversions(&self) -> u32 {
        self.g_t + self.g_c
    }
}

/// One strand-normalised reference-G observation
#[derive(Debug, Clone, Copy)]
struct Candidate {
    pos: u32,
    observed: u8,
}

// ============================================================================
// Scanner
// ============================================================================

/// Scans read pairs against shared, read-only masks.
pub struct ConversionScanner<'a> {
    config: &'a ScanConfig,
    variants: &'a VariantMask,
    mask: &'a PositionMask,
}

impl<'a> ConversionScanner<'a> {
    pub fn new(config: &'a ScanConfig, variants: &'a VariantMask, mask: &'a PositionMask) -> Self {
        Self {
            config,
            variants,
            mask,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        self.config
    }

    /// Scan one pair, adding its converted positions to `positions`.
    ///
    /// A `RecordParse` error means the pair was skipped and `positions` was
    /// not modified.
    pub fn scan(&self, pair: &ReadPair, positions: &mut PositionTally) -> Result<ConversionTally> {
        let first = if self.config.use_read1 {
            Some(self.candidates(pair, &pair.read1)?)
        } else {
            None
        };
        let second = if self.config.use_read2 {
            Some(self.candidates(pair, &pair.read2)?)
        } else {
            None
        };

        let mut tally = ConversionTally::default();
        let mut converted: Vec<(Arc<str>, u32)> = Vec::new();

        match (first, second) {
            (Some(c1), Some(c2)) if pair.read1.chrom == pair.read2.chrom => {
                let shared = if self.config.only_consider_overlap {
                    pair.shared_span()
                } else {
                    None
                };
                let chrom = &pair.read1.chrom;
                for (pos, o1, o2) in merge_by_position(&c1, &c2) {
                    let inside_shared = shared.map_or(false, |(s, e)| pos >= s && pos <= e);
                    let observed = match (o1, o2) {
                        (Some(a), Some(b)) => self.resolve_both(a, b),
                        (Some(a), None) | (None, Some(a)) => {
                            if inside_shared {
                                continue;
                            }
                            self.config.is_target(a).then_some(a)
                        }
                        (None, None) => continue,
                    };
                    self.count(&mut tally, &mut converted, chrom, pos, observed);
                }
            }
            (first, second) => {
                // Single inspected mate, or mates on different chromosomes
                for (read, candidates) in [(&pair.read1, first), (&pair.read2, second)] {
                    let Some(candidates) = candidates else { continue };
                    for c in candidates {
                        let observed = self.config.is_target(c.observed).then_some(c.observed);
                        self.count(&mut tally, &mut converted, &read.chrom, c.pos, observed);
                    }
                }
            }
        }

        if tally.conversions() < self.config.min_conversions {
            tally.below_threshold = tally.conversions() > 0;
            tally.g_t = 0;
            tally.g_c = 0;
            return Ok(tally);
        }

        for (chrom, pos) in converted {
            positions.add(GenomicPosition { chrom, pos }, 1);
        }
        Ok(tally)
    }

    /// A position seen by both mates. Read1's base classifies the conversion
    /// when overlap consistency is off.
    fn resolve_both(&self, read1: u8, read2: u8) -> Option<u8> {
        if self.config.only_consider_overlap {
            (read1 == read2 && self.config.is_target(read1)).then_some(read1)
        } else if self.config.is_target(read1) {
            Some(read1)
        } else if self.config.is_target(read2) {
            Some(read2)
        } else {
            None
        }
    }

    #[inline]
    fn count(
        &self,
        tally: &mut ConversionTally,
        converted: &mut Vec<(Arc<str>, u32)>,
        chrom: &Arc<str>,
        pos: u32,
        observed: Option<u8>,
    ) {
        tally.g_positions += 1;
        match observed {
            Some(b'T') => tally.g_t += 1,
            Some(b'C') => tally.g_c += 1,
            _ => return,
        }
        converted.push((chrom.clone(), pos));
    }

    /// Strand-normalised, unmasked reference-G positions of one mate, in
    /// reference order.
    fn candidates(&self, pair: &ReadPair, read: &AlignedRead) -> Result<Vec<Candidate>> {
        let md = read
            .md
            .as_deref()
            .ok_or_else(|| ConvError::record(&pair.name, "missing MD tag"))?;
        let reverse = self.config.orientation.is_reverse_transcript(read);

        let mut out = Vec::new();
        walk_aligned_bases(read.start, &read.ops, &read.seq, md, |base| {
            if base.flanks_indel {
                return;
            }
            let (ref_base, observed) = if reverse {
                (complement(base.ref_base), complement(base.read_base))
            } else {
                (base.ref_base, base.read_base)
            };
            if ref_base != b'G' {
                return;
            }
            if self.variants.contains(&read.chrom, base.ref_pos)
                || self.mask.contains(&read.chrom, base.ref_pos)
            {
                return;
            }
            out.push(Candidate {
                pos: base.ref_pos,
                observed,
            });
        })
        .map_err(|e| ConvError::record(&pair.name, e.to_string()))?;
        Ok(out)
    }
}

/// Merge two position-sorted candidate lists into `(pos, read1, read2)`.
fn merge_by_position(a: &[Candidate], b: &[Candidate]) -> Vec<(u32, Option<u8>, Option<u8>)> {
    let mut merged = Vec::with_capacity(a.len().max(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        match (a.get(i), b.get(j)) {
            (Some(x), Some(y)) if x.pos == y.pos => {
                merged.push((x.pos, Some(x.observed), Some(y.observed)));
                i += 1;
                j += 1;
            }
            (Some(x), Some(y)) if x.pos < y.pos => {
                merged.push((x.pos, Some(x.observed), None));
                i += 1;
            }
            (Some(_), Some(y)) => {
                merged.push((y.pos, None, Some(y.observed)));
                j += 1;
            }
            (Some(x), None) => {
                merged.push((x.pos, Some(x.observed), None));
                i += 1;
            }
            (None, Some(y)) => {
                merged.push((y.pos, None, Some(y.observed)));
                j += 1;
            }
            (None, None) => break,
        }
    }
    merged
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Orientation;
    use crate::read_pairer::{Mate, Strand};
    use crate::test_utils::{pair, read_at};

    /// Read1 reverse / read2 forward: forward-transcript reads under dUTP,
    /// so bases are inspected as stored.
    fn forward_pair(r1: (u32, &str, &[u8], &str), r2: (u32, &str, &[u8], &str)) -> ReadPair {
        pair(
            "frag",
            read_at(Mate::First, Strand::Reverse, r1.0, r1.1, r1.2, r1.3),
            read_at(Mate::Second, Strand::Forward, r2.0, r2.1, r2.2, r2.3),
        )
    }

    fn scan_with(config: &ScanConfig, p: &ReadPair) -> (ConversionTally, PositionTally) {
        let variants = VariantMask::new();
        let mask = PositionMask::new();
        let scanner = ConversionScanner::new(config, &variants, &mask);
        let mut positions = PositionTally::new();
        let tally = scanner.scan(p, &mut positions).unwrap();
        (tally, positions)
    }

    #[test]
    fn test_single_g_to_t() {
        // Reference AAGAA at 98..102; read1 shows T at 100
        let p = forward_pair((98, "5M", b"AATAA", "2G2"), (300, "5M", b"CCCCC", "5"));
        let (tally, positions) = scan_with(&ScanConfig::default(), &p);

        assert_eq!(tally.g_t, 1);
        assert_eq!(tally.g_c, 0);
        assert_eq!(tally.g_positions, 1);
        assert_eq!(positions.get(&GenomicPosition::new("chr1", 100)), 1);
    }

    #[test]
    fn test_masked_position_is_not_a_candidate() {
        let p = forward_pair((98, "5M", b"AATAA", "2G2"), (300, "5M", b"CCCCC", "5"));
        let config = ScanConfig::default();
        let mut variants = VariantMask::new();
        variants.insert("chr1", 100);
        let mask = PositionMask::new();
        let scanner = ConversionScanner::new(&config, &variants, &mask);
        let mut positions = PositionTally::new();

        let tally = scanner.scan(&p, &mut positions).unwrap();
        assert_eq!(tally.conversions(), 0);
        assert_eq!(tally.g_positions, 0);
        assert!(positions.is_empty());

        let empty = VariantMask::new();
        let mut manual = PositionMask::new();
        manual.insert_range("chr1", 99, 101);
        let scanner = ConversionScanner::new(&config, &empty, &manual);
        let tally = scanner.scan(&p, &mut positions).unwrap();
        assert_eq!(tally.conversions(), 0);
        assert!(positions.is_empty());
    }

    #[test]
    fn test_reverse_transcript_read_is_complemented() {
        // Read1 forward under dUTP derives from the reverse strand. Reference C
        // observed A is a G->T on the transcript.
        let r1 = read_at(Mate::First, Strand::Forward, 10, "4M", b"TTAT", "2C1");
        let r2 = read_at(Mate::Second, Strand::Reverse, 200, "4M", b"TTTT", "4");
        let p = pair("frag", r1, r2);
        let (tally, _) = scan_with(&ScanConfig::default(), &p);
        assert_eq!(tally.g_t, 1);
        assert_eq!(tally.g_positions, 1);

        // Same bases read as sense: reference C is not a candidate.
        let sense = ScanConfig {
            orientation: Orientation::Read1Sense,
            ..Default::default()
        };
        let (tally, _) = scan_with(&sense, &p);
        assert_eq!(tally.conversions(), 0);
        assert_eq!(tally.g_positions, 0);
    }

    #[test]
    fn test_reverse_transcript_g_to_c() {
        // Reference C observed G on a reverse-transcript read is G->C.
        let r1 = read_at(Mate::First, Strand::Forward, 10, "4M", b"TTGT", "2C1");
        let r2 = read_at(Mate::Second, Strand::Reverse, 200, "4M", b"TTTT", "4");
        let p = pair("frag", r1, r2);

        let both = ScanConfig {
            use_g_c: true,
            ..Default::default()
        };
        let (tally, positions) = scan_with(&both, &p);
        assert_eq!(tally.g_c, 1);
        assert_eq!(tally.g_t, 0);
        assert_eq!(positions.get(&GenomicPosition::new("chr1", 12)), 1);

        let (tally, positions) = scan_with(&ScanConfig::default(), &p);
        assert_eq!(tally.conversions(), 0);
        assert_eq!(tally.g_positions, 1);
        assert!(positions.is_empty());
    }

    #[test]
    fn test_conversion_types_are_selectable() {
        // G->T at 1, G->C at 3
        let p = forward_pair((1, "4M", b"TACA", "G1G1"), (300, "4M", b"AAAA", "4"));

        let (gt_only, _) = scan_with(&ScanConfig::default(), &p);
        assert_eq!((gt_only.g_t, gt_only.g_c), (1, 0));

        let both = ScanConfig { use_g_c: true, ..Default::default() };
        let (tally, _) = scan_with(&both, &p);
        assert_eq!((tally.g_t, tally.g_c), (1, 1));
        assert_eq!(tally.g_positions, 2);

        let gc_only = ScanConfig { use_g_t: false, use_g_c: true, ..Default::default() };
        let (tally, _) = scan_with(&gc_only, &p);
        assert_eq!((tally.g_t, tally.g_c), (0, 1));
    }

    #[test]
    fn test_overlap_counts_each_position_once() {
        // Both mates cover 100; read1 shows T, read2 shows G
        let p = forward_pair((98, "5M", b"AATAA", "2G2"), (99, "5M", b"AGAAA", "5"));

        let (tally, positions) = scan_with(&ScanConfig::default(), &p);
        assert_eq!(tally.g_t, 1);
        assert_eq!(tally.g_positions, 1);
        assert_eq!(positions.total(), 1);

        let strict = ScanConfig { only_consider_overlap: true, ..Default::default() };
        let (tally, positions) = scan_with(&strict, &p);
        assert_eq!(tally.g_t, 0);
        assert_eq!(tally.g_positions, 1);
        assert!(positions.is_empty());
    }

    #[test]
    fn test_overlap_requires_agreement_from_both_mates() {
        let p = forward_pair((98, "5M", b"AATAA", "2G2"), (99, "5M", b"ATAAA", "1G3"));
        let strict = ScanConfig { only_consider_overlap: true, ..Default::default() };
        let (tally, positions) = scan_with(&strict, &p);
        assert_eq!(tally.g_t, 1);
        assert_eq!(positions.get(&GenomicPosition::new("chr1", 100)), 1);
    }

    #[test]
    fn test_overlap_mode_outside_shared_span() {
        // Conversion at 98 is covered only by read1, outside the shared span 100..102
        let p = forward_pair((98, "5M", b"TAAAA", "G4"), (100, "5M", b"AAAAA", "5"));
        let strict = ScanConfig { only_consider_overlap: true, ..Default::default() };
        let (tally, _) = scan_with(&strict, &p);
        assert_eq!(tally.g_t, 1);

        // Inside the shared span, but read1's base at 100 touches a deletion
        // so only read2 observes it
        let p = forward_pair((98, "3M1D2M", b"AATAA", "2G^C2"), (99, "6M", b"ATAAAA", "1G4"));
        let (strict_tally, _) = scan_with(&strict, &p);
        let (loose_tally, _) = scan_with(&ScanConfig::default(), &p);
        assert_eq!(strict_tally.conversions(), 0);
        assert_eq!(strict_tally.g_positions, 0);
        assert_eq!(loose_tally.conversions(), 1);
    }

    #[test]
    fn test_min_conversions_threshold() {
        let p = forward_pair((1, "4M", b"TATA", "G1G1"), (300, "4M", b"AAAA", "4"));

        let two = ScanConfig { min_conversions: 2, ..Default::default() };
        let (tally, positions) = scan_with(&two, &p);
        assert_eq!(tally.g_t, 2);
        assert!(!tally.below_threshold);
        assert_eq!(positions.total(), 2);

        let three = ScanConfig { min_conversions: 3, ..Default::default() };
        let (tally, positions) = scan_with(&three, &p);
        assert_eq!(tally.conversions(), 0);
        assert_eq!(tally.g_positions, 2);
        assert!(tally.below_threshold);
        assert!(positions.is_empty());
    }

    #[test]
    fn test_only_selected_mates_are_inspected() {
        let p = forward_pair((98, "5M", b"AATAA", "2G2"), (300, "5M", b"TAAAA", "G4"));

        let read2_only = ScanConfig { use_read1: false, ..Default::default() };
        let (tally, positions) = scan_with(&read2_only, &p);
        assert_eq!(tally.g_t, 1);
        assert_eq!(positions.get(&GenomicPosition::new("chr1", 300)), 1);
        assert_eq!(positions.get(&GenomicPosition::new("chr1", 100)), 0);
    }

    #[test]
    fn test_missing_md_is_a_record_error() {
        let mut p = forward_pair((98, "5M", b"AATAA", "2G2"), (300, "5M", b"TAAAA", "G4"));
        p.read2.md = None;
        let config = ScanConfig::default();
        let variants = VariantMask::new();
        let mask = PositionMask::new();
        let scanner = ConversionScanner::new(&config, &variants, &mask);
        let mut positions = PositionTally::new();

        let err = scanner.scan(&p, &mut positions).unwrap_err();
        assert!(err.is_record_error());
        assert!(positions.is_empty());
    }

    #[test]
    fn test_overlap_tightening_never_increases() {
        let pairs = vec![
            forward_pair((98, "5M", b"AATAA", "2G2"), (99, "5M", b"AGAAA", "5")),
            forward_pair((98, "5M", b"AATAA", "2G2"), (99, "5M", b"ATAAA", "1G3")),
            forward_pair((1, "4M", b"TATA", "G1G1"), (3, "4M", b"GATT", "2G1")),
            forward_pair((10, "6M", b"GGTGTG", "2G1G1"), (12, "6M", b"TGGGAA", "G5")),
        ];
        let loose = ScanConfig::default();
        let strict = ScanConfig { only_consider_overlap: true, ..Default::default() };
        for p in &pairs {
            let (l, _) = scan_with(&loose, p);
            let (s, _) = scan_with(&strict, p);
            assert!(s.conversions() <= l.conversions(), "{}", p.name_str());
        }
    }
}
