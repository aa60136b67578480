// SPDX-License-Identifier: AGPL-3.0-only
//! I2C relay bank
//!
//! Two TCA9555 16-bit port expanders behind the Altera I2C master switch
//! the front-end relays. The expanders cannot be read back reliably, so the
//! port values last written are mirrored in a [`RelayBankState`] owned by
//! the caller and every update rewrites all four ports.
//!
//! Bus errors latched in `ISR` (NACK, arbitration loss, RX overrun) are
//! logged and cleared after each command word. They do not fail the
//! update: the relays are rewritten in full on the next one.

use crate::error::Result;
use crate::mmio::Peripheral;
use crate::poll::Waiter;
use nmr_fpga::i2c::{self as reg, isr, tfr};
use std::time::Duration;

/// Port values last written to the two expanders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayBankState {
    /// Expander 0, port 1 in the high byte
    pub expander0: u16,
    /// Expander 1, port 1 in the high byte
    pub expander1: u16,
}

impl RelayBankState {
    /// Set (`enable`) or clear the bits in each mask.
    pub fn apply(&mut self, enable: bool, mask0: u16, mask1: u16) {
        if enable {
            self.expander0 |= mask0;
            self.expander1 |= mask1;
        } else {
            self.expander0 &= !mask0;
            self.expander1 &= !mask1;
        }
    }
}

/// Port direction masks (1 = input), per expander.
const EXPANDER0_DIRECTION: (u8, u8) = (0x00, 0x0F);
const EXPANDER1_DIRECTION: (u8, u8) = (0xFF, 0x00);

/// Relay bank driver.
pub struct I2cRelayBank<'a> {
    regs: Peripheral<'a>,
    waiter: Waiter<'a>,
    settle: Duration,
}

impl<'a> I2cRelayBank<'a> {
    /// Driver for the I2C master at `regs`. `settle` is waited after the
    /// core is disabled so the last transfer completes on the wire.
    pub fn new(regs: Peripheral<'a>, waiter: Waiter<'a>, settle: Duration) -> Self {
        Self {
            regs,
            waiter,
            settle,
        }
    }

    /// Update `state` and push it to both expanders.
    ///
    /// # Errors
    ///
    /// Propagates register access errors. Bus conditions reported by the
    /// core are logged, not returned.
    pub fn write(&self, state: &mut RelayBankState, enable: bool, mask0: u16, mask1: u16) -> Result<()> {
        state.apply(enable, mask0, mask1);
        tracing::debug!(
            "Relay bank: expander0={:#06x} expander1={:#06x}",
            state.expander0,
            state.expander1
        );

        self.regs.write(reg::ISR, isr::ERRORS)?;
        self.regs.write(reg::CTRL, reg::CORE_EN)?;
        self.regs.write(reg::SCL_LOW, reg::SCL_PERIOD_100KHZ)?;
        self.regs.write(reg::SCL_HIGH, reg::SCL_PERIOD_100KHZ)?;
        self.regs.write(reg::SDA_HOLD, reg::SDA_HOLD_DEFAULT)?;

        for (addr, direction, ports) in [
            (reg::EXPANDER0_ADDR, EXPANDER0_DIRECTION, state.expander0),
            (reg::EXPANDER1_ADDR, EXPANDER1_DIRECTION, state.expander1),
        ] {
            let [low, high] = ports.to_le_bytes();
            self.write_register(addr, reg::TCA_CONF_PORT0, direction.0)?;
            self.write_register(addr, reg::TCA_CONF_PORT1, direction.1)?;
            self.write_register(addr, reg::TCA_OUT_PORT0, low)?;
            self.write_register(addr, reg::TCA_OUT_PORT1, high)?;
        }

        self.regs.write(reg::CTRL, 0)?;
        self.waiter.sleep(self.settle);
        Ok(())
    }

    /// One TCA9555 register write: address, register pointer, value.
    fn write_register(&self, addr: u8, register: u8, value: u8) -> Result<()> {
        self.command(tfr::STA | (u32::from(addr >> 1) << tfr::AD_SHIFT))?;
        self.command(u32::from(register) & tfr::DATA_MASK)?;
        self.command(tfr::STO | (u32::from(value) & tfr::DATA_MASK))
    }

    fn command(&self, word: u32) -> Result<()> {
        self.regs.write(reg::TFR_CMD, word)?;
        self.check_status().map(|_| ())
    }

    /// Read `ISR`, log what it reports and clear latched errors.
    ///
    /// # Errors
    ///
    /// Propagates register access errors.
    pub fn check_status(&self) -> Result<u32> {
        let status = self.regs.read(reg::ISR)?;
        for (bit, what) in [
            (isr::RX_OVER, "receive FIFO overrun, data lost"),
            (isr::ARBLOST_DET, "bus arbitration lost"),
            (isr::NACK_DET, "NACK received"),
        ] {
            if status & bit != 0 {
                tracing::warn!("{}: {what}", self.regs.name());
                self.regs.write(reg::ISR, bit)?;
            }
        }
        if status & isr::RX_READY != 0 {
            tracing::debug!("{}: RX_DATA at threshold", self.regs.name());
        }
        if status & isr::TX_READY != 0 {
            tracing::debug!("{}: TFR_CMD at threshold", self.regs.name());
        }
        Ok(status)
    }
}
