// SPDX-License-Identifier: AGPL-3.0-only
//! PLL controller capability
//!
//! The acquisition core needs four things from the clocking hardware:
//! program a channel's frequency, shift its phase, reset the PLL and wait
//! for lock. [`PllControl`] is that contract; after
//! [`wait_pll_lock`](PllControl::wait_pll_lock) returns, the clock is stable
//! at the configured frequency and phase.
//!
//! [`FabricPll`] implements it for the two `altera_pll_reconfig` blocks in
//! the design. Reset and lock detection go through `ctrl_out` / `ctrl_in`.

use crate::control::ControlRegisterState;
use crate::error::{NmrError, Result};
use crate::mmio::Peripheral;
use crate::poll::{PollConfig, Waiter};
use nmr_fpga::pll as reg;
use nmr_fpga::regs::{ctrl_in, ctrl_out};
use std::collections::HashMap;
use std::time::Duration;

/// One of the reconfigurable PLLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PllBlock {
    /// Drives the pulse-sequence FSM (16 × RF)
    NmrSystem,
    /// Four-phase RF source used by frequency sweeps
    Analyzer,
}

impl PllBlock {
    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Self::NmrSystem => "NMR system PLL",
            Self::Analyzer => "analyzer PLL",
        }
    }

    fn reset_mask(self) -> u32 {
        match self {
            Self::NmrSystem => ctrl_out::PLL_NMR_SYS_RST,
            Self::Analyzer => ctrl_out::PLL_ANALYZER_RST,
        }
    }

    fn lock_mask(self) -> u32 {
        match self {
            Self::NmrSystem => ctrl_in::PLL_NMR_SYS_LOCK,
            Self::Analyzer => ctrl_in::PLL_ANALYZER_LOCK,
        }
    }

    fn lock_operation(self) -> &'static str {
        match self {
            Self::NmrSystem => "NMR system PLL lock",
            Self::Analyzer => "analyzer PLL lock",
        }
    }
}

/// Clock programming capability consumed by the sequencer.
pub trait PllControl {
    /// Program output `channel` of `block` to `freq_mhz` with duty cycle
    /// `duty` (0..1).
    ///
    /// # Errors
    ///
    /// Returns `Config` if the frequency cannot be synthesised, or a bus or
    /// timeout error from the reconfiguration block.
    fn set_pll(&mut self, block: PllBlock, channel: u32, freq_mhz: f64, duty: f64) -> Result<()>;

    /// Shift output `channel` of `block` to `degrees` of its own period.
    ///
    /// # Errors
    ///
    /// As for [`PllControl::set_pll`].
    fn set_phase(&mut self, block: PllBlock, channel: u32, degrees: f64) -> Result<()>;

    /// Pulse the PLL reset line.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    fn reset_pll(&mut self, block: PllBlock, ctrl: &mut ControlRegisterState) -> Result<()>;

    /// Block until the PLL reports lock.
    ///
    /// # Errors
    ///
    /// Returns `HardwareTimeout` if lock is not observed within the bound.
    fn wait_pll_lock(&mut self, block: PllBlock) -> Result<()>;
}

/// Counter settings realising one output frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllSettings {
    /// Pre-scale counter
    pub n: u32,
    /// Feedback counter
    pub m: u32,
    /// Output counter
    pub c: u32,
    /// Resulting VCO frequency, MHz
    pub vco_mhz: f64,
    /// Resulting output frequency, MHz
    pub actual_mhz: f64,
}

impl PllSettings {
    /// Search integer N/M/C for the output frequency closest to `freq_mhz`.
    ///
    /// Candidates keep the VCO inside its legal range; among equally close
    /// results the first found (smallest N, then smallest C) wins.
    ///
    /// # Errors
    ///
    /// Returns `Config` when no counter combination keeps the VCO in range.
    pub fn solve(freq_mhz: f64) -> Result<Self> {
        if !freq_mhz.is_finite() || freq_mhz <= 0.0 {
            return Err(NmrError::config(format!(
                "PLL frequency must be positive, got {freq_mhz} MHz"
            )));
        }

        let mut best: Option<Self> = None;
        for n in 1..=reg::N_MAX {
            for c in 1..=reg::COUNT_MAX {
                let vco_target = freq_mhz * f64::from(c);
                if vco_target < reg::VCO_MIN_MHZ {
                    continue;
                }
                if vco_target > reg::VCO_MAX_MHZ {
                    break;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let m = (vco_target * f64::from(n) / reg::REF_CLOCK_MHZ).round() as u32;
                if m == 0 || m > reg::COUNT_MAX {
                    continue;
                }
                let vco_mhz = reg::REF_CLOCK_MHZ * f64::from(m) / f64::from(n);
                if !(reg::VCO_MIN_MHZ..=reg::VCO_MAX_MHZ).contains(&vco_mhz) {
                    continue;
                }
                let actual_mhz = vco_mhz / f64::from(c);
                let better = best.map_or(true, |b| {
                    (actual_mhz - freq_mhz).abs() < (b.actual_mhz - freq_mhz).abs()
                });
                if better {
                    best = Some(Self {
                        n,
                        m,
                        c,
                        vco_mhz,
                        actual_mhz,
                    });
                }
            }
        }

        best.ok_or_else(|| {
            NmrError::config(format!("{freq_mhz} MHz cannot be synthesised by the fabric PLL"))
        })
    }
}

/// Encode a division ratio into a counter word.
pub fn encode_counter(count: u32, duty: f64) -> u32 {
    if count <= 1 {
        return reg::COUNT_BYPASS;
    }
    let (high, low, odd) = if (duty - 0.5).abs() < f64::EPSILON {
        (count.div_ceil(2), count / 2, count % 2 == 1)
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let high = ((f64::from(count) * duty).round() as u32).clamp(1, count - 1);
        (high, count - high, false)
    };
    let mut word = (low & 0xFF) | ((high & 0xFF) << reg::COUNT_HIGH_SHIFT);
    if odd {
        word |= reg::COUNT_ODD;
    }
    word
}

/// Timing of PLL operations.
#[derive(Debug, Clone, Copy)]
pub struct PllTiming {
    /// Bound on lock after reset
    pub lock_timeout: Duration,
    /// Bound on one reconfiguration
    pub reconfig_timeout: Duration,
    /// Interval between status polls
    pub poll_interval: Duration,
    /// Hold time of the reset pulse
    pub reset_hold: Duration,
}

/// [`PllControl`] over the two `altera_pll_reconfig` blocks.
pub struct FabricPll<'a> {
    ctrl_out: Peripheral<'a>,
    ctrl_in: Peripheral<'a>,
    system: Peripheral<'a>,
    analyzer: Peripheral<'a>,
    waiter: Waiter<'a>,
    timing: PllTiming,
    output_counters: HashMap<(PllBlock, u32), u32>,
}

impl<'a> FabricPll<'a> {
    /// Create the controller.
    pub fn new(
        ctrl_out: Peripheral<'a>,
        ctrl_in: Peripheral<'a>,
        system: Peripheral<'a>,
        analyzer: Peripheral<'a>,
        waiter: Waiter<'a>,
        timing: PllTiming,
    ) -> Self {
        Self {
            ctrl_out,
            ctrl_in,
            system,
            analyzer,
            waiter,
            timing,
            output_counters: HashMap::new(),
        }
    }

    /// Put both reconfiguration blocks in polling mode.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn init_reconfig(&self) -> Result<()> {
        self.system.write(reg::MODE, reg::MODE_POLLING)?;
        self.analyzer.write(reg::MODE, reg::MODE_POLLING)
    }

    fn block(&self, block: PllBlock) -> &Peripheral<'a> {
        match block {
            PllBlock::NmrSystem => &self.system,
            PllBlock::Analyzer => &self.analyzer,
        }
    }

    fn apply(&self, block: PllBlock) -> Result<()> {
        let regs = self.block(block);
        regs.write(reg::START, 1)?;
        self.waiter.poll_until(
            &PollConfig {
                operation: "PLL reconfiguration",
                timeout: self.timing.reconfig_timeout,
                interval: self.timing.poll_interval,
            },
            || Ok((regs.read(reg::STATUS)? & reg::STATUS_DONE != 0).then_some(())),
        )
    }
}

impl PllControl for FabricPll<'_> {
    fn set_pll(&mut self, block: PllBlock, channel: u32, freq_mhz: f64, duty: f64) -> Result<()> {
        let s = PllSettings::solve(freq_mhz)?;
        tracing::debug!(
            "{} ch{channel}: {freq_mhz:.4} MHz -> N={} M={} C={} (vco {:.1} MHz, out {:.4} MHz)",
            block.name(),
            s.n,
            s.m,
            s.c,
            s.vco_mhz,
            s.actual_mhz
        );

        let regs = self.block(block);
        regs.write(reg::N_COUNTER, encode_counter(s.n, 0.5))?;
        regs.write(reg::M_COUNTER, encode_counter(s.m, 0.5))?;
        regs.write(
            reg::C_COUNTER,
            encode_counter(s.c, duty) | (channel << reg::C_SELECT_SHIFT),
        )?;
        self.apply(block)?;

        self.output_counters.insert((block, channel), s.c);
        Ok(())
    }

    fn set_phase(&mut self, block: PllBlock, channel: u32, degrees: f64) -> Result<()> {
        let c = self
            .output_counters
            .get(&(block, channel))
            .copied()
            .ok_or_else(|| {
                NmrError::invalid_state(format!(
                    "{} ch{channel} phase set before frequency",
                    block.name()
                ))
            })?;

        let steps_per_turn = f64::from(c) * reg::DPS_STEPS_PER_VCO_PERIOD;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let steps = ((degrees.rem_euclid(360.0) / 360.0) * steps_per_turn).round() as u32;
        if steps == 0 {
            return Ok(());
        }

        tracing::debug!("{} ch{channel}: phase {degrees} deg = {steps} steps", block.name());
        self.block(block).write(
            reg::DPS,
            (steps & reg::DPS_STEPS_MASK) | (channel << reg::DPS_SELECT_SHIFT) | reg::DPS_UP,
        )?;
        self.apply(block)
    }

    fn reset_pll(&mut self, block: PllBlock, ctrl: &mut ControlRegisterState) -> Result<()> {
        ctrl.set_pll_reset(block.reset_mask(), true);
        ctrl.commit(&self.ctrl_out)?;
        self.waiter.sleep(self.timing.reset_hold);
        ctrl.set_pll_reset(block.reset_mask(), false);
        ctrl.commit(&self.ctrl_out)
    }

    fn wait_pll_lock(&mut self, block: PllBlock) -> Result<()> {
        let mask = block.lock_mask();
        self.waiter.poll_until(
            &PollConfig {
                operation: block.lock_operation(),
                timeout: self.timing.lock_timeout,
                interval: self.timing.poll_interval,
            },
            || Ok((self.ctrl_in.read(0)? & mask != 0).then_some(())),
        )?;
        tracing::debug!("{} locked", block.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_exact_fsm_clock() {
        // 2 MHz RF -> 32 MHz FSM clock
        let s = PllSettings::solve(32.0).unwrap();
        assert!((s.actual_mhz - 32.0).abs() < 1e-9);
        assert!(s.vco_mhz >= reg::VCO_MIN_MHZ && s.vco_mhz <= reg::VCO_MAX_MHZ);
    }

    #[test]
    fn solve_is_close_for_awkward_frequency() {
        let s = PllSettings::solve(4.2837).unwrap();
        assert!((s.actual_mhz - 4.2837).abs() / 4.2837 < 2e-3);
    }

    #[test]
    fn solve_rejects_impossible_frequencies() {
        assert!(PllSettings::solve(0.0).is_err());
        assert!(PllSettings::solve(2000.0).is_err());
    }

    #[test]
    fn counter_encoding() {
        assert_eq!(encode_counter(1, 0.5), reg::COUNT_BYPASS);
        assert_eq!(encode_counter(4, 0.5), 2 | (2 << 8));
        assert_eq!(encode_counter(5, 0.5), 2 | (3 << 8) | reg::COUNT_ODD);
        assert_eq!(encode_counter(10, 0.3), 7 | (3 << 8));
    }
}
