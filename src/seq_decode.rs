//! Base-level helpers: 4-bit BAM sequence decoding and strand complementing.

use rust_htslib::bam;

/// BAM 4-bit base code -> ASCII
const DECODE_BASE: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

/// Decode a BAM record's 4-bit encoded sequence into `out`.
///
/// Avoids the intermediate allocation of `read.seq().as_bytes()` when the
/// caller already owns a buffer.
pub fn decode_seq_into(read: &bam::Record, out: &mut Vec<u8>) {
    let seq = read.seq();
    let len = seq.len();

    out.clear();
    out.reserve(len);
    for packed in seq.encoded.iter().copied() {
        out.push(DECODE_BASE[(packed >> 4) as usize]);
        out.push(DECODE_BASE[(packed & 0x0F) as usize]);
    }
    // Odd-length sequences carry a padding nibble.
    out.truncate(len);
}

/// Watson-Crick complement; IUPAC ambiguity codes other than N map to N.
#[inline]
pub fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        _ => b'N',
    }
}
