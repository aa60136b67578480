// SPDX-License-Identifier: AGPL-3.0-only
//! `ctrl_out` mirror
//!
//! The `ctrl_out` PIO carries every HPS-driven control line. Sequencing code
//! mutates an explicit [`ControlRegisterState`] through named methods and
//! then [`commit`](ControlRegisterState::commit)s it; nothing else writes
//! the register. The state is passed by `&mut` through the sequencing
//! functions, so there is exactly one owner of the mirror at a time.

use crate::error::Result;
use crate::mmio::Peripheral;
use nmr_fpga::regs::ctrl_out;

/// Value of the `ctrl_out` register as last written (or loaded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegisterState {
    value: u32,
}

impl Default for ControlRegisterState {
    fn default() -> Self {
        Self::from_value(ctrl_out::DEFAULT)
    }
}

impl ControlRegisterState {
    /// Mirror an explicit register value.
    pub const fn from_value(value: u32) -> Self {
        Self { value }
    }

    /// Read the live register into a new mirror.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn load(reg: &Peripheral<'_>) -> Result<Self> {
        Ok(Self::from_value(reg.read(0)?))
    }

    /// Write the mirror to the register.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn commit(&self, reg: &Peripheral<'_>) -> Result<()> {
        reg.write(0, self.value)
    }

    /// Current mirrored value.
    pub const fn value(&self) -> u32 {
        self.value
    }

    fn set(&mut self, mask: u32, on: bool) {
        if on {
            self.value |= mask;
        } else {
            self.value &= !mask;
        }
    }

    fn is_set(&self, mask: u32) -> bool {
        self.value & mask != 0
    }

    // ── FSM ──────────────────────────────────────────────────────────────────

    /// Raise the FSM start line.
    pub fn set_start(&mut self) {
        self.set(ctrl_out::FSM_START, true);
    }

    /// Lower the FSM start line.
    pub fn clear_start(&mut self) {
        self.set(ctrl_out::FSM_START, false);
    }

    /// Whether the start line is high.
    pub fn start(&self) -> bool {
        self.is_set(ctrl_out::FSM_START)
    }

    /// Pulse the acquisition controller reset high.
    pub fn assert_controller_reset(&mut self) {
        self.set(ctrl_out::NMR_CNT_RESET, true);
    }

    /// Release the acquisition controller reset.
    pub fn release_controller_reset(&mut self) {
        self.set(ctrl_out::NMR_CNT_RESET, false);
    }

    // ── Phase cycling ────────────────────────────────────────────────────────

    /// Select the 180°-shifted RF phase.
    pub fn enable_phase_cycle(&mut self) {
        self.set(ctrl_out::PHASE_CYCLING, true);
    }

    /// Select the reference RF phase.
    pub fn disable_phase_cycle(&mut self) {
        self.set(ctrl_out::PHASE_CYCLING, false);
    }

    /// Flip the RF phase relative to the previous scan.
    pub fn toggle_phase_cycle(&mut self) {
        self.value ^= ctrl_out::PHASE_CYCLING;
    }

    /// Whether the shifted phase is selected.
    pub fn phase_cycle(&self) -> bool {
        self.is_set(ctrl_out::PHASE_CYCLING)
    }

    // ── Buffers ──────────────────────────────────────────────────────────────

    /// Hold the raw ADC FIFO in reset.
    pub fn assert_fifo_reset(&mut self) {
        self.set(ctrl_out::ADC_FIFO_RST, true);
    }

    /// Release the raw ADC FIFO reset.
    pub fn release_fifo_reset(&mut self) {
        self.set(ctrl_out::ADC_FIFO_RST, false);
    }

    /// Hold both downconversion FIR filters in reset (active-low lines).
    pub fn assert_fir_reset(&mut self) {
        self.set(
            ctrl_out::DCONV_FIR_RST_RESET_N | ctrl_out::DCONV_FIR_Q_RST_RESET_N,
            false,
        );
    }

    /// Release both FIR filters.
    pub fn release_fir_reset(&mut self) {
        self.set(
            ctrl_out::DCONV_FIR_RST_RESET_N | ctrl_out::DCONV_FIR_Q_RST_RESET_N,
            true,
        );
    }

    // ── Clocking ─────────────────────────────────────────────────────────────

    /// Assert or release the reset line for `mask` (one of the PLL reset
    /// bits).
    pub fn set_pll_reset(&mut self, mask: u32, asserted: bool) {
        self.set(mask, asserted);
    }

    /// Route the RF gate path to the transmitter (normal operation).
    pub fn select_rf_gate_path(&mut self) {
        self.set(ctrl_out::NMR_CLK_GATE_AVLN, true);
    }

    /// Route the analyzer PLL to the transmitter (frequency sweeps).
    pub fn select_analyzer_path(&mut self) {
        self.set(ctrl_out::NMR_CLK_GATE_AVLN, false);
    }

    /// Whether the analyzer PLL path is selected.
    pub fn analyzer_path(&self) -> bool {
        !self.is_set(ctrl_out::NMR_CLK_GATE_AVLN)
    }

    // ── Transmitter ──────────────────────────────────────────────────────────

    /// Enable or disable the TX amplifier.
    pub fn set_tx_enable(&mut self, on: bool) {
        self.set(ctrl_out::TX_EN, on);
    }

    /// Shut the TX amplifier down while receiving, or keep it powered.
    pub fn set_tx_shutdown(&mut self, on: bool) {
        self.set(ctrl_out::TX_SD, on);
    }

    // ── Preamp DAC ───────────────────────────────────────────────────────────

    /// Drive the AD5724R CLR line (active low) asserted or idle.
    pub fn set_dac_clear(&mut self, asserted: bool) {
        self.set(ctrl_out::DAC_CLR, !asserted);
    }

    /// Drive the AD5724R LDAC line (active low) asserted or idle.
    pub fn set_dac_load(&mut self, asserted: bool) {
        self.set(ctrl_out::DAC_LDAC_EN, !asserted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_edge_leaves_other_bits() {
        let mut s = ControlRegisterState::from_value(ctrl_out::TX_EN);
        s.set_start();
        assert_eq!(s.value(), ctrl_out::TX_EN | ctrl_out::FSM_START);
        s.clear_start();
        assert_eq!(s.value(), ctrl_out::TX_EN);
    }

    #[test]
    fn phase_toggle_alternates() {
        let mut s = ControlRegisterState::from_value(0);
        s.toggle_phase_cycle();
        assert!(s.phase_cycle());
        s.toggle_phase_cycle();
        assert!(!s.phase_cycle());
        s.enable_phase_cycle();
        s.disable_phase_cycle();
        assert_eq!(s.value(), 0);
    }

    #[test]
    fn active_low_lines() {
        let mut s = ControlRegisterState::default();
        s.assert_fir_reset();
        assert_eq!(s.value() & ctrl_out::DCONV_FIR_RST_RESET_N, 0);
        s.release_fir_reset();
        assert_ne!(s.value() & ctrl_out::DCONV_FIR_Q_RST_RESET_N, 0);

        s.set_dac_clear(true);
        assert_eq!(s.value() & ctrl_out::DAC_CLR, 0);
        s.set_dac_clear(false);
        assert_ne!(s.value() & ctrl_out::DAC_CLR, 0);
    }

    #[test]
    fn clock_path_selection() {
        let mut s = ControlRegisterState::from_value(0);
        assert!(s.analyzer_path());
        s.select_rf_gate_path();
        assert!(!s.analyzer_path());
        s.select_analyzer_path();
        assert!(s.analyzer_path());
    }
}
