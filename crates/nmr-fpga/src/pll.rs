// SPDX-License-Identifier: AGPL-3.0-only
//! Cyclone V `altera_pll_reconfig` register block.
//!
//! Output frequency of counter `C` on a PLL fed by the 50 MHz fabric clock:
//!
//! ```text
//! f_vco = f_ref × M / N          (600 … 1600 MHz)
//! f_out = f_vco / C
//! ```
//!
//! One dynamic phase-shift step is 1/8 of a VCO period.

// ── Registers ────────────────────────────────────────────────────────────────

/// Mode: 0 = waitrequest, 1 = polling.
pub const MODE: usize = 0x00;
/// Status: bit 0 set once the last reconfiguration has finished.
pub const STATUS: usize = 0x04;
/// Write 1 to apply the pending counter settings.
pub const START: usize = 0x08;
/// N (pre-scale) counter.
pub const N_COUNTER: usize = 0x0C;
/// M (feedback) counter.
pub const M_COUNTER: usize = 0x10;
/// C (output) counter; the counter index is encoded in the word.
pub const C_COUNTER: usize = 0x14;
/// Dynamic phase shift.
pub const DPS: usize = 0x18;

/// Polling mode value for [`MODE`].
pub const MODE_POLLING: u32 = 1;
/// Reconfiguration done bit of [`STATUS`].
pub const STATUS_DONE: u32 = 1 << 0;

// ── Counter word ─────────────────────────────────────────────────────────────

/// Shift of the high count.
pub const COUNT_HIGH_SHIFT: u32 = 8;
/// Counter bypass (divide by one).
pub const COUNT_BYPASS: u32 = 1 << 16;
/// Odd division: high and low counts differ by one, duty stays 50 %.
pub const COUNT_ODD: u32 = 1 << 17;
/// Shift of the counter index in a C-counter word.
pub const C_SELECT_SHIFT: u32 = 18;
/// Largest division a counter supports.
pub const COUNT_MAX: u32 = 512;

// ── Phase shift word ─────────────────────────────────────────────────────────

/// Mask of the number of phase steps.
pub const DPS_STEPS_MASK: u32 = 0xFFFF;
/// Shift of the counter index in a DPS word.
pub const DPS_SELECT_SHIFT: u32 = 16;
/// Shift direction: set for positive (later) phase.
pub const DPS_UP: u32 = 1 << 21;
/// Phase steps per VCO period.
pub const DPS_STEPS_PER_VCO_PERIOD: f64 = 8.0;

// ── Analog limits ────────────────────────────────────────────────────────────

/// Reference clock into both reconfigurable PLLs, MHz.
pub const REF_CLOCK_MHZ: f64 = 50.0;
/// Lowest legal VCO frequency, MHz.
pub const VCO_MIN_MHZ: f64 = 600.0;
/// Highest legal VCO frequency, MHz.
pub const VCO_MAX_MHZ: f64 = 1600.0;
/// Largest N that keeps the phase detector above 5 MHz.
pub const N_MAX: u32 = 10;
