// SPDX-License-Identifier: AGPL-3.0-only
//! Altera Avalon DMA controller (legacy `altera_avalon_dma`).
//!
//! Register offsets are in bytes. The `LENGTH` register counts bytes and
//! decrements as the transfer proceeds; its residual after `DONE` is the
//! number of bytes that were requested but never moved.

// ── Registers ────────────────────────────────────────────────────────────────

/// Status register. Writing any value clears `DONE`.
pub const STATUS: usize = 0x00;
/// Read master start address.
pub const READADDR: usize = 0x04;
/// Write master start address.
pub const WRITEADDR: usize = 0x08;
/// Transfer length in bytes.
pub const LENGTH: usize = 0x0C;
/// Control register.
pub const CONTROL: usize = 0x18;

/// `STATUS` bits.
pub mod status {
    /// Transaction complete.
    pub const DONE: u32 = 1 << 0;
    /// Transaction in progress.
    pub const BUSY: u32 = 1 << 1;
    /// Completed on read-side end-of-packet.
    pub const REOP: u32 = 1 << 2;
    /// Completed on write-side end-of-packet.
    pub const WEOP: u32 = 1 << 3;
    /// Completed because `LENGTH` reached zero.
    pub const LEN: u32 = 1 << 4;
}

/// `CONTROL` bits.
pub mod control {
    /// Byte transfers.
    pub const BYTE: u32 = 1 << 0;
    /// Half-word transfers.
    pub const HW: u32 = 1 << 1;
    /// Word transfers.
    pub const WORD: u32 = 1 << 2;
    /// Start the transfer.
    pub const GO: u32 = 1 << 3;
    /// Interrupt enable.
    pub const I_EN: u32 = 1 << 4;
    /// End on read-side end-of-packet.
    pub const REEN: u32 = 1 << 5;
    /// End on write-side end-of-packet.
    pub const WEEN: u32 = 1 << 6;
    /// End when `LENGTH` reaches zero.
    pub const LEEN: u32 = 1 << 7;
    /// Read from a constant address (FIFO source).
    pub const RCON: u32 = 1 << 8;
    /// Write to a constant address.
    pub const WCON: u32 = 1 << 9;
    /// Double-word transfers.
    pub const DOUBLEWORD: u32 = 1 << 10;
    /// Quad-word transfers.
    pub const QUADWORD: u32 = 1 << 11;
    /// Software reset. Must be written twice.
    pub const SWRST: u32 = 1 << 12;
}

/// Control word for a FIFO → memory word transfer bounded by length.
pub const FIFO_TO_MEM: u32 = control::WORD | control::LEEN | control::RCON;
