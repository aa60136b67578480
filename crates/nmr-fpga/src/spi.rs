// SPDX-License-Identifier: AGPL-3.0-only
//! Altera Avalon SPI master.

/// Received data.
pub const RXDATA: usize = 0x00;
/// Data to transmit.
pub const TXDATA: usize = 0x04;
/// Status register.
pub const STATUS: usize = 0x08;
/// Control register.
pub const CONTROL: usize = 0x0C;

/// `STATUS` bits.
pub mod status {
    /// Transmitter shift register empty: the transfer has finished.
    pub const TMT: u32 = 1 << 5;
    /// Transmitter ready for new data.
    pub const TRDY: u32 = 1 << 6;
    /// Receive data ready.
    pub const RRDY: u32 = 1 << 7;
}
