// SPDX-License-Identifier: AGPL-3.0-only
//! Sample FIFO readout
//!
//! The raw ADC FIFO packs two 14-bit samples per 32-bit word, first sample
//! in the low half. The downconverter FIFO carries one signed word per I or
//! Q value. Words reach the HPS either from the staging SDRAM after a DMA
//! transfer or by popping the FIFO read port directly.

use crate::error::Result;
use crate::mmio::Peripheral;
use nmr_fpga::fifo as reg;

/// Split packed FIFO words into samples, low half first.
#[allow(clippy::cast_possible_truncation)]
pub fn unpack_words(words: &[u32]) -> Vec<u16> {
    let mut samples = Vec::with_capacity(words.len() * reg::SAMPLES_PER_WORD);
    for &w in words {
        samples.push((w & reg::SAMPLE_MASK) as u16);
        samples.push(((w >> reg::UPPER_SHIFT) & reg::SAMPLE_MASK) as u16);
    }
    samples
}

/// Reinterpret downconverter words as signed values.
#[allow(clippy::cast_possible_wrap)]
pub fn signed_words(words: &[u32]) -> Vec<i32> {
    words.iter().map(|&w| w as i32).collect()
}

/// Copy `words` words out of the staging memory, starting at word
/// `word_offset`.
///
/// # Errors
///
/// Propagates bus errors.
pub fn read_staging(sdram: &Peripheral<'_>, word_offset: usize, words: usize) -> Result<Vec<u32>> {
    (word_offset..word_offset + words)
        .map(|i| sdram.read(i * 4))
        .collect()
}

/// Pop the FIFO until its fill level reads zero.
///
/// The level is read once, counted down locally while popping, and re-read
/// whenever the local count reaches zero, so words arriving during the
/// drain are collected too. The read port is never touched while the level
/// says empty. At most `limit` words are popped.
///
/// # Errors
///
/// Propagates bus errors.
pub fn drain(out: &Peripheral<'_>, csr: &Peripheral<'_>, limit: usize) -> Result<Vec<u32>> {
    let mut words = Vec::new();
    let mut level = csr.read(reg::LEVEL)?;
    while level > 0 {
        if words.len() >= limit {
            tracing::warn!("{}: still {level} words after {limit}, stopping", out.name());
            break;
        }
        words.push(out.read(0)?);
        level -= 1;
        if level == 0 {
            level = csr.read(reg::LEVEL)?;
        }
    }
    tracing::debug!("{}: drained {} words", out.name(), words.len());
    Ok(words)
}
