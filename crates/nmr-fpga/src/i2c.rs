// SPDX-License-Identifier: AGPL-3.0-only
//! Altera Avalon I2C master and the TCA9555 relay expanders behind it.

// ── I2C master registers ─────────────────────────────────────────────────────

/// Transfer command FIFO.
pub const TFR_CMD: usize = 0x00;
/// Receive data FIFO.
pub const RX_DATA: usize = 0x04;
/// Control register.
pub const CTRL: usize = 0x08;
/// Interrupt status enable.
pub const ISER: usize = 0x0C;
/// Interrupt status. Error bits are cleared by writing them back.
pub const ISR: usize = 0x10;
/// Status register.
pub const STATUS: usize = 0x14;
/// SCL low period, in core clock cycles.
pub const SCL_LOW: usize = 0x20;
/// SCL high period, in core clock cycles.
pub const SCL_HIGH: usize = 0x24;
/// SDA hold time, in core clock cycles.
pub const SDA_HOLD: usize = 0x28;

/// `CTRL.CORE_EN`.
pub const CORE_EN: u32 = 1 << 0;

/// `ISR` bits.
pub mod isr {
    /// TFR_CMD level at or above threshold.
    pub const TX_READY: u32 = 1 << 0;
    /// RX_DATA level at or above threshold.
    pub const RX_READY: u32 = 1 << 1;
    /// NACK received.
    pub const NACK_DET: u32 = 1 << 2;
    /// Bus arbitration lost.
    pub const ARBLOST_DET: u32 = 1 << 3;
    /// RX FIFO overrun, data lost.
    pub const RX_OVER: u32 = 1 << 4;

    /// Bits that latch an error and are cleared by writing them back.
    pub const ERRORS: u32 = RX_OVER | ARBLOST_DET | NACK_DET;
}

/// `TFR_CMD` fields.
pub mod tfr {
    /// Issue a START before this byte.
    pub const STA: u32 = 1 << 9;
    /// Issue a STOP after this byte.
    pub const STO: u32 = 1 << 8;
    /// Shift of the 7-bit address in an address byte.
    pub const AD_SHIFT: u32 = 1;
    /// Read (1) / write (0) flag of an address byte.
    pub const RW_READ: u32 = 1 << 0;
    /// Data byte mask.
    pub const DATA_MASK: u32 = 0xFF;
}

/// 100 kHz SCL from the 50 MHz core clock.
pub const SCL_PERIOD_100KHZ: u32 = 250;
/// Minimum SDA hold.
pub const SDA_HOLD_DEFAULT: u32 = 1;

// ── TCA9555 ──────────────────────────────────────────────────────────────────

/// 8-bit bus address of the first expander.
pub const EXPANDER0_ADDR: u8 = 0x40;
/// 8-bit bus address of the second expander.
pub const EXPANDER1_ADDR: u8 = 0x42;

/// TCA9555 output port 0.
pub const TCA_OUT_PORT0: u8 = 0x02;
/// TCA9555 output port 1.
pub const TCA_OUT_PORT1: u8 = 0x03;
/// TCA9555 configuration port 0 (1 = input).
pub const TCA_CONF_PORT0: u8 = 0x06;
/// TCA9555 configuration port 1 (1 = input).
pub const TCA_CONF_PORT1: u8 = 0x07;
