// SPDX-License-Identifier: AGPL-3.0-only
//! System bring-up and per-session setup
//!
//! `init_defaults` puts a freshly configured FPGA into a known state. A
//! measurement session then writes its own registers with
//! [`SessionSetup::apply`], runs, and hands the transmitter back with
//! [`SessionSetup::finish`]. Frequency sweeps borrow the transmitter in one
//! of two ways, see [`SweepKind`].

use crate::acquisition::{AcquisitionRunner, SweepRequest};
use crate::control::ControlRegisterState;
use crate::error::{NmrError, Result};
use crate::hwmap::HardwareMap;
use crate::pll::{FabricPll, PllControl};
use crate::poll::Waiter;
use crate::spi::{write_matching_network, SpiMaster};
use nmr_fpga::timing;
use std::time::Duration;

/// Receiver delay written at bring-up, ADC ticks.
pub const DEFAULT_RX_DELAY_TICKS: u32 = 20;

const DEFAULT_SETTLE: Duration = Duration::from_micros(100);
const FIR_RESET_PULSE: Duration = Duration::from_micros(1);
const CONTROLLER_RESET_PULSE: Duration = Duration::from_micros(10);

/// Bring the control lines, PLL reconfiguration blocks and acquisition
/// controller to their defaults.
///
/// The controller reset clears the ADC window token, which otherwise can
/// stay latched when the ADC clock starts after the window opens and keep
/// the sequencer from running.
///
/// # Errors
///
/// Propagates bus errors.
pub fn init_defaults(
    hw: &HardwareMap<'_>,
    waiter: &Waiter<'_>,
    pll: &FabricPll<'_>,
    ctrl: &mut ControlRegisterState,
) -> Result<()> {
    *ctrl = ControlRegisterState::default();
    ctrl.commit(&hw.ctrl_out)?;
    waiter.sleep(DEFAULT_SETTLE);

    pll.init_reconfig()?;

    ctrl.select_rf_gate_path();
    ctrl.release_fir_reset();
    ctrl.assert_controller_reset();
    ctrl.commit(&hw.ctrl_out)?;
    waiter.sleep(CONTROLLER_RESET_PULSE);
    ctrl.release_controller_reset();
    ctrl.commit(&hw.ctrl_out)?;

    hw.rx_delay.write(0, DEFAULT_RX_DELAY_TICKS)?;
    tracing::info!("System initialised");
    Ok(())
}

/// Disconnect the matching network.
///
/// # Errors
///
/// `Bus` on a stuck transfer.
pub fn close_system(matching: &SpiMaster<'_>) -> Result<()> {
    write_matching_network(matching, 0, 0)?;
    tracing::info!("Matching network disconnected");
    Ok(())
}

/// Registers written once per measurement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSetup {
    /// Inversion pulse before the sequence, FSM ticks (0 disables)
    pub t1_pulse_ticks: u32,
    /// Delay after the inversion pulse, FSM ticks
    pub t1_delay_ticks: u32,
    /// Shut the TX amplifier down while receiving
    pub tx_shutdown: bool,
    /// Downconverter decimation factor
    pub decimation: u32,
    /// Subtracted from every ADC sample
    pub adc_dc_bias: u32,
}

impl Default for SessionSetup {
    fn default() -> Self {
        Self {
            t1_pulse_ticks: 0,
            t1_delay_ticks: 0,
            tx_shutdown: true,
            decimation: timing::DEFAULT_DECIMATION,
            adc_dc_bias: timing::ADC_DC_BIAS,
        }
    }
}

impl SessionSetup {
    /// Write the session registers and pulse the FIR filters through reset.
    ///
    /// # Errors
    ///
    /// `Config` for a zero decimation, before any write; bus errors.
    pub fn apply(
        &self,
        hw: &HardwareMap<'_>,
        waiter: &Waiter<'_>,
        ctrl: &mut ControlRegisterState,
    ) -> Result<()> {
        if self.decimation == 0 {
            return Err(NmrError::config("decimation factor must be at least 1"));
        }
        hw.t1_pulse.write(0, self.t1_pulse_ticks)?;
        hw.t1_delay.write(0, self.t1_delay_ticks)?;
        hw.dec_fact.write(0, self.decimation)?;

        ctrl.set_tx_shutdown(self.tx_shutdown);
        ctrl.commit(&hw.ctrl_out)?;

        ctrl.assert_fir_reset();
        ctrl.commit(&hw.ctrl_out)?;
        waiter.sleep(FIR_RESET_PULSE);
        ctrl.release_fir_reset();
        ctrl.commit(&hw.ctrl_out)?;
        waiter.sleep(FIR_RESET_PULSE);
        hw.fir_q.write(0, timing::FIR_Q_INIT_WORD)?;

        hw.adc_val_sub.write(0, self.adc_dc_bias)?;
        tracing::debug!(
            "Session: T1 {}/{} ticks, decimation {}, tx_sd {}",
            self.t1_pulse_ticks,
            self.t1_delay_ticks,
            self.decimation,
            self.tx_shutdown
        );
        Ok(())
    }

    /// Re-enable the TX amplifier.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn finish(hw: &HardwareMap<'_>, ctrl: &mut ControlRegisterState) -> Result<()> {
        ctrl.set_tx_enable(true);
        ctrl.commit(&hw.ctrl_out)
    }
}

/// How a frequency sweep uses the transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Reflection measurement: TX stays powered during reception
    Wobble,
    /// Preamp gain characterization: TX amplifier disabled
    PampChar,
}

impl SweepKind {
    /// Directory tag.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Wobble => "wobble",
            Self::PampChar => "pamp_char",
        }
    }

    fn prepare(self, ctrl: &mut ControlRegisterState) {
        match self {
            Self::Wobble => ctrl.set_tx_shutdown(false),
            Self::PampChar => ctrl.set_tx_enable(false),
        }
    }

    fn restore(self, ctrl: &mut ControlRegisterState) {
        match self {
            Self::Wobble => ctrl.set_tx_shutdown(true),
            Self::PampChar => ctrl.set_tx_enable(true),
        }
    }
}

/// Samples per sweep point: `round(sampling / step)`.
///
/// # Errors
///
/// `Config` for a non-positive step or a count out of range.
pub fn sweep_samples(sampling_mhz: f64, step_mhz: f64) -> Result<u32> {
    let n = (sampling_mhz / step_mhz).round();
    if !(step_mhz > 0.0 && n.is_finite() && n >= 1.0 && n <= f64::from(u32::MAX)) {
        return Err(NmrError::config(format!(
            "cannot take {sampling_mhz} / {step_mhz} samples per sweep point"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(n as u32)
}

/// Run a sweep with the transmitter set up for `kind`. The transmitter
/// bits are restored whether or not the sweep succeeds.
///
/// # Errors
///
/// The sweep's error, else a bus error from restoring `ctrl_out`.
pub fn run_sweep_session<P: PllControl>(
    runner: &mut AcquisitionRunner<'_, P>,
    ctrl: &mut ControlRegisterState,
    kind: SweepKind,
    req: &SweepRequest,
    sink: &mut dyn FnMut(f64, &[u16]) -> Result<()>,
) -> Result<u32> {
    let ctrl_out = runner.hardware().ctrl_out;
    kind.prepare(ctrl);
    ctrl.commit(&ctrl_out)?;

    let result = runner.sweep(ctrl, req, sink);

    kind.restore(ctrl);
    let restored = ctrl.commit(&ctrl_out);
    let points = result?;
    restored?;
    Ok(points)
}
