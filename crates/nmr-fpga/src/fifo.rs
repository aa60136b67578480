// SPDX-License-Identifier: AGPL-3.0-only
//! Altera Avalon on-chip FIFO, input-side CSR.
//!
//! The FIFO is 32 bits wide and carries two ADC symbols per beat: sample
//! `2n` in bits 13:0 and sample `2n+1` in bits 29:16.

/// Fill level in words.
pub const LEVEL: usize = 0x00;
/// Status register.
pub const STATUS: usize = 0x04;

/// Significant bits of one ADC sample.
pub const SAMPLE_MASK: u32 = 0x3FFF;
/// Bit offset of the second sample inside a FIFO word.
pub const UPPER_SHIFT: u32 = 16;
/// Samples carried per FIFO word.
pub const SAMPLES_PER_WORD: usize = 2;
