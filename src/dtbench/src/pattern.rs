//! Data-pattern fill and payload verification.
//!
//! Each device-sized sub-block is laid out as
//! `[block tag][write-order][prefix][payload]`; the payload carries the
//! pattern. IOT words are functions of the sub-block's LBA so the data is
//! self-describing and survives random overwrites. The optional LBDATA and
//! TIMESTAMP overlays claim the first payload words and are skipped by the
//! comparator.

use crate::options::PatternSpec;
use btag::PatternModifiers;

/// Per-word increment of the IOT pattern.
pub const IOT_SEED: u32 = 0x0101_0101;

/// Buffers are primed with this before reads so pad verification can tell
/// untouched tail bytes from transferred data.
pub const PAD_BYTE: u8 = 0xDD;

/// Byte counts ahead of the payload within one sub-block.
#[derive(Debug, Copy, Clone)]
pub struct BlockLayout {
    /// Block tag plus opaque area.
    pub header: usize,
    /// NUL-padded prefix bytes.
    pub prefix: usize,
}

impl BlockLayout {
    pub fn payload_start(&self) -> usize {
        self.header + self.prefix
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PatternMismatch {
    /// Byte offset of the first differing word within the sub-block.
    pub offset: usize,
    pub expected: u32,
    pub actual: u32,
}

/// How many leading payload words the overlays consume.
fn overlay_words(modifiers: PatternModifiers) -> usize {
    let mut n = 0;
    if modifiers.contains(PatternModifiers::LBDATA) {
        n += 1;
    }
    if modifiers.contains(PatternModifiers::TIMESTAMP) {
        n += 1;
    }
    n
}

fn expected_word(spec: &PatternSpec, pattern_file: Option<&[u8]>, lba: u64, index: usize) -> u32 {
    match spec {
        PatternSpec::Iot => (lba as u32).wrapping_add(IOT_SEED.wrapping_mul(index as u32)),
        PatternSpec::Incr => {
            let base = (index * 4) as u32;
            u32::from_le_bytes([
                base as u8,
                base.wrapping_add(1) as u8,
                base.wrapping_add(2) as u8,
                base.wrapping_add(3) as u8,
            ])
        }
        PatternSpec::Pattern(word) => *word,
        PatternSpec::File(_) => {
            let bytes = pattern_file.unwrap_or(&[0u8; 4]);
            let at = index * 4;
            u32::from_le_bytes([
                bytes[at % bytes.len()],
                bytes[(at + 1) % bytes.len()],
                bytes[(at + 2) % bytes.len()],
                bytes[(at + 3) % bytes.len()],
            ])
        }
    }
}

/// The 32-bit pattern word recorded in the block tag for this sub-block.
pub fn pattern_word(spec: &PatternSpec, lba: u64) -> u32 {
    match spec {
        PatternSpec::Iot => lba as u32,
        PatternSpec::Incr => 0x0302_0100,
        PatternSpec::Pattern(word) => *word,
        PatternSpec::File(_) => 0,
    }
}

/// Fill one sub-block's payload region.
pub fn fill_payload(
    block: &mut [u8],
    layout: BlockLayout,
    lba: u64,
    spec: &PatternSpec,
    pattern_file: Option<&[u8]>,
    modifiers: PatternModifiers,
    write_secs: u32,
) {
    let start = layout.payload_start();
    debug_assert!(start <= block.len() && (block.len() - start) % 4 == 0);

    let words = (block.len() - start) / 4;
    for index in 0..words {
        let word = expected_word(spec, pattern_file, lba, index);
        let at = start + index * 4;
        block[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }

    let mut at = start;
    if modifiers.contains(PatternModifiers::LBDATA) {
        block[at..at + 4].copy_from_slice(&(lba as u32).to_le_bytes());
        at += 4;
    }
    if modifiers.contains(PatternModifiers::TIMESTAMP) {
        block[at..at + 4].copy_from_slice(&write_secs.to_le_bytes());
    }
}

/// Compare one sub-block's payload region word-by-word against the
/// expected pattern, skipping overlay words. Reports the first mismatch.
pub fn verify_payload(
    block: &[u8],
    layout: BlockLayout,
    lba: u64,
    spec: &PatternSpec,
    pattern_file: Option<&[u8]>,
    modifiers: PatternModifiers,
) -> Result<(), PatternMismatch> {
    let start = layout.payload_start();
    let words = (block.len() - start) / 4;
    for index in overlay_words(modifiers)..words {
        let at = start + index * 4;
        let actual = u32::from_le_bytes(block[at..at + 4].try_into().unwrap());
        let expected = expected_word(spec, pattern_file, lba, index);
        if actual != expected {
            return Err(PatternMismatch {
                offset: at,
                expected,
                actual,
            });
        }
    }
    Ok(())
}

/// After a short read, every byte past the transferred count must still be
/// the pad. Returns the offset of the first disturbed byte.
pub fn verify_pad(buf: &[u8], transferred: usize) -> Option<usize> {
    buf[transferred..]
        .iter()
        .position(|&b| b != PAD_BYTE)
        .map(|at| transferred + at)
}
