// SPDX-License-Identifier: AGPL-3.0-only
//! AD5724R quad 12-bit DAC command words (24-bit SPI frames).
//!
//! ```text
//! 23   22   21..19   18..16   15..0
//! R/W  0    REG      A2..A0   data
//! ```

// ── Frame fields ─────────────────────────────────────────────────────────────

/// Write frame.
pub const WR: u32 = 0;
/// Read frame.
pub const RD: u32 = 1 << 23;

/// DAC data register.
pub const REG_DAC: u32 = 0;
/// Output range select register.
pub const REG_RANGE: u32 = 0b001 << 19;
/// Power control register.
pub const REG_POWER: u32 = 0b010 << 19;
/// Control register.
pub const REG_CONTROL: u32 = 0b011 << 19;

/// Channel A.
pub const DAC_A: u32 = 0;
/// Channel B.
pub const DAC_B: u32 = 0b001 << 16;
/// Channel C.
pub const DAC_C: u32 = 0b010 << 16;
/// Channel D.
pub const DAC_D: u32 = 0b011 << 16;
/// All channels.
pub const DAC_ALL: u32 = 0b100 << 16;

// ── Register payloads ────────────────────────────────────────────────────────

/// Output range ±5 V.
pub const RANGE_PN5: u32 = 0b011;

/// Control register function: no operation (clocks out a pending read).
pub const CTRL_NOP: u32 = 0;
/// Control register function: option bits.
pub const CTRL_OPTIONS: u32 = 0b001 << 16;
/// Option bit: current-limit clamp enable.
pub const CLAMP_EN: u32 = 1 << 2;

/// Power register: channel A powered up.
pub const PU_A: u32 = 1 << 0;
/// Power register: channel B powered up.
pub const PU_B: u32 = 1 << 1;
/// Power register: channel C powered up.
pub const PU_C: u32 = 1 << 2;
/// Power register: channel D powered up.
pub const PU_D: u32 = 1 << 3;
/// Power register: internal reference powered up.
pub const PU_REF: u32 = 1 << 4;
/// Power register: thermal shutdown alert.
pub const TSD: u32 = 1 << 5;
/// Power register: channel A overcurrent.
pub const OC_A: u32 = 1 << 7;
/// Power register: channel B overcurrent.
pub const OC_B: u32 = 1 << 8;
/// Power register: channel C overcurrent.
pub const OC_C: u32 = 1 << 9;
/// Power register: channel D overcurrent.
pub const OC_D: u32 = 1 << 10;

// ── Code conversion ──────────────────────────────────────────────────────────

/// Full-scale output voltage for the ±5 V range.
pub const FULL_SCALE_V: f64 = 5.0;
/// Codes per full-scale half range (twos complement, 12 bit).
pub const HALF_RANGE_CODES: f64 = 2048.0;
/// Largest code.
pub const CODE_MAX: i32 = 2047;
/// Smallest code.
pub const CODE_MIN: i32 = -2048;
/// Shift of the 12-bit code inside the data field.
pub const CODE_SHIFT: u32 = 4;
/// 12-bit code mask.
pub const CODE_MASK: u32 = 0x0FFF;
