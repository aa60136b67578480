// SPDX-License-Identifier: AGPL-3.0-only
//! Peripheral base offsets and control/status bit map.
//!
//! Offsets under "Lightweight bridge" are relative to
//! [`crate::bridge::LW_H2F_BASE`]; offsets under "AXI bridge" are relative
//! to [`crate::bridge::H2F_BASE`]. Values track the current Qsys build of
//! the spectrometer design and must be regenerated if the system is
//! re-laid out.

// ── Lightweight bridge: control PIOs ─────────────────────────────────────────

/// `ctrl_out` PIO: every HPS-driven control line (see [`ctrl_out`]).
pub const CTRL_OUT: usize = 0x0000_0200;
/// `ctrl_in` PIO: status lines from the fabric (see [`ctrl_in`]).
pub const CTRL_IN: usize = 0x0000_0210;

// ── Lightweight bridge: pulse-sequence parameters ────────────────────────────

/// 90° pulse length, FSM clock ticks.
pub const PULSE_90DEG: usize = 0x0000_0300;
/// Delay after the 90° pulse (no signal window), FSM clock ticks.
pub const DELAY_NOSIG: usize = 0x0000_0310;
/// 180° pulse length, FSM clock ticks.
pub const PULSE_180DEG: usize = 0x0000_0320;
/// Delay after each 180° pulse (signal window), FSM clock ticks.
pub const DELAY_SIG: usize = 0x0000_0330;
/// ADC acquisition start delay inside the signal window, ADC clock ticks.
pub const INIT_DELAY: usize = 0x0000_0340;
/// Echoes per scan.
pub const ECHOES_PER_SCAN: usize = 0x0000_0350;
/// ADC samples per echo.
pub const SAMPLES_PER_ECHO: usize = 0x0000_0360;
/// Receiver / duplexer enable delay, ADC clock ticks.
pub const RX_DELAY: usize = 0x0000_0370;
/// T1 inversion-recovery pulse length, FSM clock ticks (0 disables).
pub const PULSE_T1: usize = 0x0000_0380;
/// T1 inversion-recovery delay, FSM clock ticks.
pub const DELAY_T1: usize = 0x0000_0390;
/// Downconversion decimation factor.
pub const DEC_FACT: usize = 0x0000_03A0;
/// ADC DC bias subtracted before downconversion.
pub const ADC_VAL_SUB: usize = 0x0000_03B0;

// ── Lightweight bridge: data path ────────────────────────────────────────────

/// Raw ADC FIFO output (read port). Also the raw DMA read address.
pub const ADC_FIFO_OUT: usize = 0x0000_4000;
/// Raw ADC FIFO input-side CSR (fill level).
pub const ADC_FIFO_CSR: usize = 0x0000_4020;
/// Downconverted FIFO output (read port). Also the dconv DMA read address.
pub const DCONV_FIFO_OUT: usize = 0x0000_4040;
/// Downconverted FIFO input-side CSR (fill level).
pub const DCONV_FIFO_CSR: usize = 0x0000_4060;
/// DMA engine moving raw ADC words to SDRAM.
pub const DMA_FIFO: usize = 0x0000_4100;
/// DMA engine moving downconverted words to SDRAM.
pub const DMA_DCONV: usize = 0x0000_4140;
/// In-phase downconversion FIR coefficient port.
pub const DCONV_FIR_I: usize = 0x0000_4800;
/// Quadrature downconversion FIR coefficient port.
pub const DCONV_FIR_Q: usize = 0x0000_4C00;

// ── Lightweight bridge: clocking ─────────────────────────────────────────────

/// Reconfiguration block of the NMR system PLL (FSM clock).
pub const NMR_SYS_PLL_RECONFIG: usize = 0x0000_1000;
/// Reconfiguration block of the analyzer PLL (RF sweep source).
pub const ANALYZER_PLL_RECONFIG: usize = 0x0000_1100;

// ── Lightweight bridge: auxiliary buses ──────────────────────────────────────

/// Internal I2C master driving the relay expanders.
pub const I2C_INT: usize = 0x0000_0800;
/// SPI master for the preamplifier DAC (AD5724R).
pub const DAC_PREAMP: usize = 0x0000_0900;
/// SPI master for the gradient DAC.
pub const DAC_GRAD: usize = 0x0000_0920;
/// SPI master for the matching-network capacitor relays.
pub const SPI_MTCH_NTWRK: usize = 0x0000_0940;
/// SPI master for the analog front-end relays.
pub const SPI_AFE_RELAYS: usize = 0x0000_0960;

// ── AXI bridge ───────────────────────────────────────────────────────────────

/// Staging SDRAM. DMA engines write here; the HPS reads it back.
pub const SDRAM: usize = 0x0000_0000;
/// Span of the staging SDRAM slave.
pub const SDRAM_SPAN: usize = 0x0200_0000;
/// Board switches PIO.
pub const SWITCHES: usize = 0x0300_0000;

/// `ctrl_out` bit positions.
pub mod ctrl_out {
    /// Edge-triggered start of the pulse-sequence FSM.
    pub const FSM_START: u32 = 1 << 0;
    /// Reset of the NMR system PLL.
    pub const PLL_NMR_SYS_RST: u32 = 1 << 1;
    /// Reset of the analyzer PLL.
    pub const PLL_ANALYZER_RST: u32 = 1 << 2;
    /// Flips the RF phase by 180° for the next scan.
    pub const PHASE_CYCLING: u32 = 1 << 3;
    /// Reset of the raw ADC FIFO.
    pub const ADC_FIFO_RST: u32 = 1 << 4;
    /// LTC1746 ADC reset.
    pub const ADC_RST: u32 = 1 << 5;
    /// Selects the RF gate path (set) or the analyzer PLL path (clear).
    pub const NMR_CLK_GATE_AVLN: u32 = 1 << 6;
    /// Resets the acquisition controller (clears the ADC window token).
    pub const NMR_CNT_RESET: u32 = 1 << 7;
    /// Active-low reset of the in-phase FIR filter.
    pub const DCONV_FIR_RST_RESET_N: u32 = 1 << 8;
    /// Active-low reset of the quadrature FIR filter.
    pub const DCONV_FIR_Q_RST_RESET_N: u32 = 1 << 9;
    /// Shuts the TX amplifier down while receiving.
    pub const TX_SD: u32 = 1 << 10;
    /// Enables the TX amplifier.
    pub const TX_EN: u32 = 1 << 11;
    /// AD5724R asynchronous clear (active low).
    pub const DAC_CLR: u32 = 1 << 12;
    /// AD5724R LDAC (active low).
    pub const DAC_LDAC_EN: u32 = 1 << 13;

    /// Power-on value: TX enabled, FIR filters released, DAC lines idle high.
    pub const DEFAULT: u32 =
        TX_EN | DCONV_FIR_RST_RESET_N | DCONV_FIR_Q_RST_RESET_N | DAC_CLR | DAC_LDAC_EN;
}

/// `ctrl_in` bit positions.
pub mod ctrl_in {
    /// Pulse-sequence FSM is running.
    pub const NMR_SEQ_RUN: u32 = 1 << 0;
    /// NMR system PLL locked.
    pub const PLL_NMR_SYS_LOCK: u32 = 1 << 1;
    /// Analyzer PLL locked.
    pub const PLL_ANALYZER_LOCK: u32 = 1 << 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_out_bits_are_distinct() {
        let bits = [
            ctrl_out::FSM_START,
            ctrl_out::PLL_NMR_SYS_RST,
            ctrl_out::PLL_ANALYZER_RST,
            ctrl_out::PHASE_CYCLING,
            ctrl_out::ADC_FIFO_RST,
            ctrl_out::ADC_RST,
            ctrl_out::NMR_CLK_GATE_AVLN,
            ctrl_out::NMR_CNT_RESET,
            ctrl_out::DCONV_FIR_RST_RESET_N,
            ctrl_out::DCONV_FIR_Q_RST_RESET_N,
            ctrl_out::TX_SD,
            ctrl_out::TX_EN,
            ctrl_out::DAC_CLR,
            ctrl_out::DAC_LDAC_EN,
        ];
        let combined = bits.iter().fold(0u32, |acc, b| {
            assert_eq!(acc & b, 0, "bit {b:#x} reused");
            acc | b
        });
        assert_eq!(combined.count_ones() as usize, bits.len());
    }

    #[test]
    fn default_leaves_sequencer_idle() {
        assert_eq!(ctrl_out::DEFAULT & ctrl_out::FSM_START, 0);
        assert_eq!(ctrl_out::DEFAULT & ctrl_out::ADC_FIFO_RST, 0);
        assert_ne!(ctrl_out::DEFAULT & ctrl_out::TX_EN, 0);
    }

    #[test]
    fn fifo_ports_do_not_overlap_csr() {
        assert_ne!(ADC_FIFO_OUT, ADC_FIFO_CSR);
        assert_ne!(DCONV_FIFO_OUT, DCONV_FIFO_CSR);
        assert_ne!(DMA_FIFO, DMA_DCONV);
    }
}
