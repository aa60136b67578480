// SPDX-License-Identifier: AGPL-3.0-only
//! Peripheral handles of one FPGA design
//!
//! Built from the two bridge windows (lightweight HPS-to-FPGA for control
//! and status, full HPS-to-FPGA AXI for the staging SDRAM). The map borrows
//! the buses; the caller owns the mappings.

use crate::mmio::{Peripheral, RegisterAccess};
use nmr_fpga::regs;

/// Every register block the driver touches.
#[derive(Debug, Clone, Copy)]
pub struct HardwareMap<'a> {
    /// HPS-driven control lines
    pub ctrl_out: Peripheral<'a>,
    /// FPGA status lines
    pub ctrl_in: Peripheral<'a>,

    /// 90° pulse length
    pub pulse1: Peripheral<'a>,
    /// Delay after the 90° pulse
    pub delay1: Peripheral<'a>,
    /// 180° pulse length
    pub pulse2: Peripheral<'a>,
    /// Delay after each 180° pulse
    pub delay2: Peripheral<'a>,
    /// ADC start delay
    pub init_delay: Peripheral<'a>,
    /// Echoes per scan
    pub echoes: Peripheral<'a>,
    /// Samples per echo
    pub samples: Peripheral<'a>,
    /// Receiver enable delay
    pub rx_delay: Peripheral<'a>,
    /// T1 inversion pulse
    pub t1_pulse: Peripheral<'a>,
    /// T1 recovery delay
    pub t1_delay: Peripheral<'a>,
    /// Downconversion decimation factor
    pub dec_fact: Peripheral<'a>,
    /// ADC DC bias subtraction
    pub adc_val_sub: Peripheral<'a>,
    /// Quadrature FIR filter
    pub fir_q: Peripheral<'a>,

    /// Raw ADC FIFO read port
    pub adc_fifo: Peripheral<'a>,
    /// Raw ADC FIFO status
    pub adc_fifo_csr: Peripheral<'a>,
    /// Downconverted FIFO read port
    pub dconv_fifo: Peripheral<'a>,
    /// Downconverted FIFO status
    pub dconv_fifo_csr: Peripheral<'a>,
    /// DMA engine draining the raw FIFO
    pub dma_raw: Peripheral<'a>,
    /// DMA engine draining the downconverted FIFO
    pub dma_dconv: Peripheral<'a>,
    /// Staging SDRAM (AXI window)
    pub sdram: Peripheral<'a>,

    /// NMR system PLL reconfiguration block
    pub sys_pll: Peripheral<'a>,
    /// Analyzer PLL reconfiguration block
    pub analyzer_pll: Peripheral<'a>,

    /// I2C master for the relay expanders
    pub i2c: Peripheral<'a>,
    /// SPI master for the preamp DAC
    pub dac_preamp: Peripheral<'a>,
    /// SPI master for the matching-network relays
    pub spi_mtch: Peripheral<'a>,
    /// SPI master for the AFE relays
    pub spi_afe: Peripheral<'a>,
}

impl<'a> HardwareMap<'a> {
    /// Build the map over a lightweight-bridge bus and an AXI-bridge bus.
    pub fn new(lw: &'a dyn RegisterAccess, axi: &'a dyn RegisterAccess) -> Self {
        let p = |base, name| Peripheral::new(lw, base, name);
        Self {
            ctrl_out: p(regs::CTRL_OUT, "ctrl_out"),
            ctrl_in: p(regs::CTRL_IN, "ctrl_in"),
            pulse1: p(regs::PULSE_90DEG, "pulse1"),
            delay1: p(regs::DELAY_NOSIG, "delay1"),
            pulse2: p(regs::PULSE_180DEG, "pulse2"),
            delay2: p(regs::DELAY_SIG, "delay2"),
            init_delay: p(regs::INIT_DELAY, "init_delay"),
            echoes: p(regs::ECHOES_PER_SCAN, "echoes_per_scan"),
            samples: p(regs::SAMPLES_PER_ECHO, "samples_per_echo"),
            rx_delay: p(regs::RX_DELAY, "rx_delay"),
            t1_pulse: p(regs::PULSE_T1, "t1_pulse"),
            t1_delay: p(regs::DELAY_T1, "t1_delay"),
            dec_fact: p(regs::DEC_FACT, "dec_fact"),
            adc_val_sub: p(regs::ADC_VAL_SUB, "adc_val_sub"),
            fir_q: p(regs::DCONV_FIR_Q, "fir_q"),
            adc_fifo: p(regs::ADC_FIFO_OUT, "adc_fifo"),
            adc_fifo_csr: p(regs::ADC_FIFO_CSR, "adc_fifo_csr"),
            dconv_fifo: p(regs::DCONV_FIFO_OUT, "dconv_fifo"),
            dconv_fifo_csr: p(regs::DCONV_FIFO_CSR, "dconv_fifo_csr"),
            dma_raw: p(regs::DMA_FIFO, "dma_raw"),
            dma_dconv: p(regs::DMA_DCONV, "dma_dconv"),
            sdram: Peripheral::new(axi, regs::SDRAM, "sdram"),
            sys_pll: p(regs::NMR_SYS_PLL_RECONFIG, "sys_pll"),
            analyzer_pll: p(regs::ANALYZER_PLL_RECONFIG, "analyzer_pll"),
            i2c: p(regs::I2C_INT, "i2c"),
            dac_preamp: p(regs::DAC_PREAMP, "dac_preamp"),
            spi_mtch: p(regs::SPI_MTCH_NTWRK, "spi_mtch"),
            spi_afe: p(regs::SPI_AFE_RELAYS, "spi_afe"),
        }
    }
}
