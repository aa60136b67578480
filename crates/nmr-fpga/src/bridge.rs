// SPDX-License-Identifier: AGPL-3.0-only
//! HPS-to-FPGA bridge windows on the Cyclone V SoC.
//!
//! Two windows are mapped from `/dev/mem`:
//!
//! ```text
//! 0xC000_0000  H2F AXI master (64 MB window used)  staging SDRAM, switches
//! 0xFF20_0000  H2F lightweight AXI master (2 MB)   every control peripheral
//! ```
//!
//! Peripheral offsets in [`crate::regs`] are relative to one of these
//! windows. DMA engines inside the fabric address the same slaves by their
//! Qsys base, which is why [`crate::regs`] offsets double as DMA addresses.

/// Physical base of the lightweight HPS-to-FPGA bridge.
pub const LW_H2F_BASE: u64 = 0xFF20_0000;

/// Span of the lightweight bridge window.
pub const LW_H2F_SPAN: usize = 0x0020_0000;

/// Physical base of the HPS-to-FPGA AXI bridge.
pub const H2F_BASE: u64 = 0xC000_0000;

/// Span of the AXI bridge window that is mapped.
pub const H2F_SPAN: usize = 0x0400_0000;

/// Device node used for physical memory access.
pub const DEV_MEM: &str = "/dev/mem";
