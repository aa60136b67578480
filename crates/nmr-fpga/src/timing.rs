// SPDX-License-Identifier: AGPL-3.0-only
//! Clock ratios and HDL timing errata.
//!
//! All three clocks derive from the RF (Larmor) frequency `f`:
//!
//! ```text
//! FSM clock  = 16 f   (pulse and delay counters)
//! ADC clock  =  4 f   (LTC1746 sample clock, init delay counter)
//! ```
//!
//! With `f` in MHz a duration in µs multiplied by a clock in MHz gives ticks.

/// FSM clock / RF frequency. Fixed in the HDL.
pub const FSM_CLOCK_RATIO: f64 = 16.0;
/// ADC clock / RF frequency. Fixed in the HDL.
pub const ADC_CLOCK_RATIO: f64 = 4.0;

/// Smallest ADC init delay the window generator honours; lower values are
/// forced up to this in the HDL.
pub const INIT_DELAY_MIN_TICKS: u32 = 2;
/// Latency of the window generator when the init delay is at the floor,
/// in ADC ticks.
pub const INIT_DELAY_FLOOR_LATENCY: f64 = 2.25;
/// Latency added on top of any init delay above the floor, in ADC ticks.
pub const INIT_DELAY_INHERENT: f64 = 0.25;

/// Timing-uncertainty guard of the acquisition window, in RF periods.
pub const ACQ_GUARD_RF_PERIODS: f64 = 10.0;

/// FSM ticks per ADC tick.
pub const FSM_TICKS_PER_ADC_TICK: f64 = FSM_CLOCK_RATIO / ADC_CLOCK_RATIO;
/// Signal-window stretch for single-echo modes (FID, noise), relative to
/// the acquisition window.
pub const SINGLE_ECHO_WINDOW_FACTOR: f64 = 10.0;
/// Fixed init delay used by FID acquisitions.
pub const FID_INIT_DELAY_TICKS: u32 = 2;
/// Fixed init delay used by noise acquisitions.
pub const NOISE_INIT_DELAY_TICKS: u32 = 3;

/// Pulse/delay placeholder written during frequency sweeps.
pub const SWEEP_PLACEHOLDER_TICKS: u32 = 100;

/// Default downconversion decimation factor.
pub const DEFAULT_DECIMATION: u32 = 4;
/// ADC DC bias subtracted in the fabric, from a noise calibration run.
pub const ADC_DC_BIAS: u32 = 9732;
/// Word written to the quadrature FIR port after a filter reset.
pub const FIR_Q_INIT_WORD: u32 = 20;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_runs_four_times_adc() {
        assert!((FSM_TICKS_PER_ADC_TICK - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn floor_latency_exceeds_inherent() {
        assert!(INIT_DELAY_FLOOR_LATENCY > f64::from(INIT_DELAY_MIN_TICKS));
        assert!(INIT_DELAY_INHERENT < 1.0);
    }
}
