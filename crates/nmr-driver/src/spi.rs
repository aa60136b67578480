// SPDX-License-Identifier: AGPL-3.0-only
//! SPI peripherals
//!
//! Three Altera SPI masters drive auxiliary front-end hardware:
//!
//! - the matching-network capacitor relays (shunt and series banks),
//! - the AFE preamp input relays,
//! - the AD5724R quad DAC biasing the preamp.
//!
//! Every transfer waits for `STATUS.TMT` with a bound; a master that never
//! finishes is a `Bus` error.

use crate::config::DriverConfig;
use crate::control::ControlRegisterState;
use crate::error::{NmrError, Result};
use crate::mmio::Peripheral;
use crate::poll::{PollConfig, Waiter};
use nmr_fpga::dac;
use nmr_fpga::spi::{self as reg, status};
use std::time::Duration;

const STATUS_POLL: Duration = Duration::from_micros(10);
const CLEAR_PULSE: Duration = Duration::from_micros(1);
const LOAD_PULSE: Duration = Duration::from_micros(50);
const READBACK_SETTLE: Duration = Duration::from_micros(100);

/// One Altera SPI master.
#[derive(Clone)]
pub struct SpiMaster<'a> {
    regs: Peripheral<'a>,
    waiter: Waiter<'a>,
    timeout: Duration,
}

impl<'a> SpiMaster<'a> {
    /// Master at `regs`; each status wait gives up after `timeout`.
    pub fn new(regs: Peripheral<'a>, waiter: Waiter<'a>, timeout: Duration) -> Self {
        Self {
            regs,
            waiter,
            timeout,
        }
    }

    /// Shift one frame out and wait until the shift register is empty.
    ///
    /// # Errors
    ///
    /// `Bus` if the transfer does not finish in time.
    pub fn transmit(&self, word: u32) -> Result<()> {
        self.regs.write(reg::TXDATA, word)?;
        self.wait_status(status::TMT, "TMT")
    }

    /// Wait for receive data and read it.
    ///
    /// # Errors
    ///
    /// `Bus` if no data arrives in time.
    pub fn receive(&self) -> Result<u32> {
        self.wait_status(status::RRDY, "RRDY")?;
        self.regs.read(reg::RXDATA)
    }

    fn wait_status(&self, bit: u32, flag: &'static str) -> Result<()> {
        let cfg = PollConfig {
            operation: "spi status",
            timeout: self.timeout,
            interval: STATUS_POLL,
        };
        self.waiter
            .poll_until(&cfg, || Ok((self.regs.read(reg::STATUS)? & bit != 0).then_some(())))
            .map_err(|e| match e {
                NmrError::HardwareTimeout { duration_ms, .. } => NmrError::bus(
                    "spi",
                    format!("{}: {flag} not set after {duration_ms}ms", self.regs.name()),
                ),
                other => other,
            })
    }
}

// ── Relays ───────────────────────────────────────────────────────────────────

/// Pack the 12-bit shunt and series capacitor codes into the 24-bit relay
/// frame: `shunt[11:4] | shunt[3:0] series[11:8] | series[7:0]`.
pub fn matching_network_word(c_shunt: u16, c_series: u16) -> u32 {
    let series_lsb = u32::from(c_series & 0xFF);
    let mid = (u32::from(c_shunt & 0x0F) << 4) | u32::from((c_series >> 8) & 0x0F);
    let shunt_msb = u32::from((c_shunt >> 4) & 0xFF);
    (shunt_msb << 16) | (mid << 8) | series_lsb
}

/// Switch the matching-network capacitors. Zero disconnects a bank.
///
/// # Errors
///
/// `Bus` on a stuck transfer.
pub fn write_matching_network(spi: &SpiMaster<'_>, c_shunt: u16, c_series: u16) -> Result<()> {
    tracing::debug!("Matching network: shunt={c_shunt} series={c_series}");
    spi.transmit(matching_network_word(c_shunt, c_series))
}

/// Set the AFE preamp input relays.
///
/// # Errors
///
/// `Bus` on a stuck transfer.
pub fn write_pamp_relays(spi: &SpiMaster<'_>, value: u32) -> Result<()> {
    tracing::debug!("Preamp relays: {value:#x}");
    spi.transmit(value)
}

// ── AD5724R ──────────────────────────────────────────────────────────────────

/// DAC output selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacChannel {
    /// Output A
    A,
    /// Output B
    B,
    /// Output C
    C,
    /// Output D
    D,
    /// All outputs at once
    All,
}

impl DacChannel {
    fn address(self) -> u32 {
        match self {
            Self::A => dac::DAC_A,
            Self::B => dac::DAC_B,
            Self::C => dac::DAC_C,
            Self::D => dac::DAC_D,
            Self::All => dac::DAC_ALL,
        }
    }
}

/// Twos-complement 12-bit code for `volts` on the ±5 V range, truncated
/// toward zero and clamped to the code range.
#[allow(clippy::cast_possible_truncation)]
pub fn voltage_code(volts: f64) -> i32 {
    let code = (volts / dac::FULL_SCALE_V * dac::HALF_RANGE_CODES) as i32;
    code.clamp(dac::CODE_MIN, dac::CODE_MAX)
}

/// Power control register contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacPowerStatus(pub u32);

impl DacPowerStatus {
    /// Device is in thermal shutdown.
    pub fn thermal_shutdown(self) -> bool {
        self.0 & dac::TSD != 0
    }

    /// Channels reporting overcurrent.
    pub fn overcurrent(self) -> Vec<DacChannel> {
        [
            (dac::OC_A, DacChannel::A),
            (dac::OC_B, DacChannel::B),
            (dac::OC_C, DacChannel::C),
            (dac::OC_D, DacChannel::D),
        ]
        .into_iter()
        .filter(|&(bit, _)| self.0 & bit != 0)
        .map(|(_, ch)| ch)
        .collect()
    }

    /// Reference and all four outputs are powered.
    pub fn all_powered(self) -> bool {
        let all = dac::PU_A | dac::PU_B | dac::PU_C | dac::PU_D | dac::PU_REF;
        self.0 & all == all
    }
}

/// Board wiring of the optional DAC lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacWiring {
    /// SDO reaches the FPGA: writes can be read back and retried
    pub sdo: bool,
    /// LDAC reaches the FPGA: outputs update on an explicit pulse
    pub ldac: bool,
    /// Write attempts before a readback mismatch is an error
    pub max_attempts: u32,
}

impl DacWiring {
    /// Wiring as configured.
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            sdo: config.dac_sdo_wired,
            ldac: config.dac_ldac_wired,
            max_attempts: config.dac_max_attempts.max(1),
        }
    }
}

/// AD5724R preamp bias DAC.
pub struct Ad5724r<'a> {
    spi: SpiMaster<'a>,
    ctrl_out: Peripheral<'a>,
    wiring: DacWiring,
}

impl<'a> Ad5724r<'a> {
    /// DAC on `spi`; `ctrl_out` carries its CLR and LDAC lines.
    pub fn new(spi: SpiMaster<'a>, ctrl_out: Peripheral<'a>, wiring: DacWiring) -> Self {
        Self {
            spi,
            ctrl_out,
            wiring,
        }
    }

    /// Power up all outputs and the reference, select ±5 V, enable the
    /// current clamp, then pulse CLR.
    ///
    /// # Errors
    ///
    /// `Bus` on a stuck transfer.
    pub fn init(&self, ctrl: &mut ControlRegisterState) -> Result<()> {
        self.spi.transmit(
            dac::WR | dac::REG_POWER | dac::PU_A | dac::PU_B | dac::PU_C | dac::PU_D | dac::PU_REF,
        )?;
        self.spi
            .transmit(dac::WR | dac::REG_RANGE | dac::DAC_ALL | dac::RANGE_PN5)?;
        self.spi
            .transmit(dac::WR | dac::REG_CONTROL | dac::CTRL_OPTIONS | dac::CLAMP_EN)?;

        ctrl.set_dac_clear(true);
        ctrl.commit(&self.ctrl_out)?;
        self.spi.waiter.sleep(CLEAR_PULSE);
        ctrl.set_dac_clear(false);
        ctrl.commit(&self.ctrl_out)?;
        self.spi.waiter.sleep(CLEAR_PULSE);
        tracing::info!("Preamp DAC initialised");
        Ok(())
    }

    /// Read a register: send the read frame, clock the answer out with a
    /// NOP, then collect it.
    fn read_register(&self, frame: u32) -> Result<u32> {
        self.spi.transmit(dac::RD | frame)?;
        self.spi.transmit(dac::WR | dac::REG_CONTROL | dac::CTRL_NOP)?;
        self.spi.receive()
    }

    /// Read the power register and log any alert.
    ///
    /// # Errors
    ///
    /// `Bus` on a stuck transfer.
    pub fn power_status(&self) -> Result<DacPowerStatus> {
        let st = DacPowerStatus(self.read_register(dac::REG_POWER)?);
        if st.thermal_shutdown() {
            tracing::warn!("Preamp DAC in thermal shutdown");
        }
        for ch in st.overcurrent() {
            tracing::warn!("Preamp DAC output {ch:?} overcurrent");
        }
        tracing::debug!("Preamp DAC power register: {:#06x}", st.0);
        Ok(st)
    }

    /// Set `channel` to `volts`. Returns the code written.
    ///
    /// With SDO wired the data register is read back and the write repeated
    /// until it matches, up to the configured number of attempts. With LDAC
    /// wired the outputs are updated by a load pulse.
    ///
    /// # Errors
    ///
    /// `Bus` on a stuck transfer or when the readback never matches.
    pub fn write_voltage(
        &self,
        ctrl: &mut ControlRegisterState,
        channel: DacChannel,
        volts: f64,
    ) -> Result<i32> {
        let code = voltage_code(volts);
        #[allow(clippy::cast_sign_loss)]
        let field = (code as u32) & dac::CODE_MASK;
        let frame = dac::REG_DAC | channel.address();

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.spi.transmit(dac::WR | frame | (field << dac::CODE_SHIFT))?;
            if !self.wiring.sdo {
                break;
            }
            let readback = (self.read_register(frame)? >> dac::CODE_SHIFT) & dac::CODE_MASK;
            self.spi.waiter.sleep(READBACK_SETTLE);
            self.power_status()?;
            if readback == field {
                break;
            }
            tracing::warn!(
                "Preamp DAC {channel:?}: wrote {field:#05x}, read {readback:#05x} (attempt {attempt})"
            );
            if attempt >= self.wiring.max_attempts {
                return Err(NmrError::bus(
                    "spi",
                    format!("DAC {channel:?} readback mismatch after {attempt} attempts"),
                ));
            }
        }

        if self.wiring.ldac {
            ctrl.set_dac_load(true);
            ctrl.commit(&self.ctrl_out)?;
            self.spi.waiter.sleep(LOAD_PULSE);
            ctrl.set_dac_load(false);
            ctrl.commit(&self.ctrl_out)?;
            self.spi.waiter.sleep(LOAD_PULSE);
        }
        tracing::debug!("Preamp DAC {channel:?} = {volts:.3} V (code {code})");
        Ok(code)
    }
}
