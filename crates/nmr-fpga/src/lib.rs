// SPDX-License-Identifier: AGPL-3.0-only
//! Register model of the NMR spectrometer FPGA design.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure description of the soft-core system the HPS talks to: bridge
//! windows, peripheral base offsets, control/status bit positions and the
//! register layouts of the Altera IP blocks (legacy DMA controller,
//! on-chip FIFO, I2C master, SPI master) plus the AD5724R DAC command words.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bridge`] | HPS-to-FPGA bridge windows (physical base and span) |
//! | [`regs`] | Peripheral base offsets and `ctrl_out` / `ctrl_in` bit map |
//! | [`dma`] | Altera Avalon DMA controller registers |
//! | [`fifo`] | Altera Avalon FIFO CSR registers |
//! | [`i2c`] | Altera Avalon I2C master and TCA9555 expander registers |
//! | [`pll`] | Cyclone V PLL reconfiguration block |
//! | [`spi`] | Altera Avalon SPI master registers |
//! | [`dac`] | AD5724R quad DAC command words |
//! | [`timing`] | Clock ratios and HDL timing errata |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod dac;
pub mod dma;
pub mod fifo;
pub mod i2c;
pub mod pll;
pub mod regs;
pub mod spi;
pub mod timing;
