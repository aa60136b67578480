// SPDX-License-Identifier: AGPL-3.0-only
//! Pulse-sequence FSM sequencer
//!
//! ```text
//!  Idle ──configure──▶ Configured ──start──▶ Running ──wait_done──▶ Done
//!   ▲                      │  reset_buffer / apply_phase              │
//!   └──────────────────────┴────────────── finish ◀───────────────────┘
//! ```
//!
//! `configure` writes the whole register image, then programs and locks the
//! clocks. `start` refuses to run unless the buffer was reset after
//! configuration, and produces a single rising-then-falling edge on the
//! start line. A [`Sequencer`] lives for one shot; the caller guarantees
//! that only one exists at a time for a given set of registers.

use crate::control::ControlRegisterState;
use crate::error::{NmrError, Result};
use crate::hwmap::HardwareMap;
use crate::params::PulseSequenceParams;
use crate::pll::{PllBlock, PllControl};
use crate::poll::{PollConfig, Waiter};
use nmr_fpga::regs::ctrl_in;
use std::fmt;
use std::time::Duration;

/// Phases of the four analyzer PLL outputs, degrees.
pub const ANALYZER_PHASES: [f64; 4] = [0.0, 90.0, 180.0, 270.0];

/// Sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    /// Nothing programmed for this shot
    Idle,
    /// Registers written and clocks locked
    Configured,
    /// Start edge issued; the hardware is sequencing
    Running,
    /// The hardware has cleared its running bit
    Done,
}

impl fmt::Display for FsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Configured => "Configured",
            Self::Running => "Running",
            Self::Done => "Done",
        };
        f.write_str(s)
    }
}

/// Clock frequencies for one shot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockPlan {
    /// NMR system PLL output 0 (FSM clock), MHz
    pub system_mhz: f64,
    /// Analyzer PLL frequency for sweeps, MHz; `None` leaves it untouched
    pub analyzer_mhz: Option<f64>,
}

/// What happens to the phase-cycle bit before the start edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseMode {
    /// Flip the RF phase relative to the previous shot
    Alternate,
    /// Reference phase
    ForceOff,
    /// Keep whatever the mirror holds
    Leave,
}

/// Bounds and delays used by the sequencer.
#[derive(Debug, Clone, Copy)]
pub struct FsmTiming {
    /// Bound on the running bit clearing
    pub run_timeout: Duration,
    /// Interval between status polls
    pub poll_interval: Duration,
    /// Hold and settle time of reset pulses
    pub settle: Duration,
}

/// Drives the FSM through one shot.
pub struct Sequencer<'a> {
    hw: HardwareMap<'a>,
    waiter: Waiter<'a>,
    timing: FsmTiming,
    state: FsmState,
    buffer_reset: bool,
}

impl<'a> Sequencer<'a> {
    /// Create an idle sequencer.
    pub fn new(hw: HardwareMap<'a>, waiter: Waiter<'a>, timing: FsmTiming) -> Self {
        Self {
            hw,
            waiter,
            timing,
            state: FsmState::Idle,
            buffer_reset: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> FsmState {
        self.state
    }

    fn expect(&self, wanted: FsmState, action: &str) -> Result<()> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(NmrError::invalid_state(format!(
                "cannot {action} while {} (needs {wanted})",
                self.state
            )))
        }
    }

    /// Write the register image and lock the clocks.
    ///
    /// `rx_delay_ticks` is written first when given. The seven sequence
    /// registers follow in a fixed order, then the system PLL (and the
    /// analyzer PLL, if planned) is programmed, reset and awaited.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless idle; otherwise bus, configuration or timeout
    /// errors from the PLL.
    pub fn configure(
        &mut self,
        ctrl: &mut ControlRegisterState,
        params: &PulseSequenceParams,
        rx_delay_ticks: Option<u32>,
        clocks: &ClockPlan,
        pll: &mut dyn PllControl,
    ) -> Result<()> {
        self.expect(FsmState::Idle, "configure")?;

        if let Some(rx) = rx_delay_ticks {
            self.hw.rx_delay.write(0, rx)?;
        }
        let hw = &self.hw;
        for (reg, value) in [
            (&hw.pulse1, params.pulse1_ticks),
            (&hw.delay1, params.delay1_ticks),
            (&hw.pulse2, params.pulse2_ticks),
            (&hw.delay2, params.delay2_ticks),
            (&hw.init_delay, params.init_adc_delay_ticks),
            (&hw.echoes, params.echoes_per_scan),
            (&hw.samples, params.samples_per_echo),
        ] {
            reg.write(0, value)?;
        }
        tracing::debug!("Sequence registers written: {params:?}");

        pll.set_pll(PllBlock::NmrSystem, 0, clocks.system_mhz, 0.5)?;
        pll.reset_pll(PllBlock::NmrSystem, ctrl)?;
        pll.set_phase(PllBlock::NmrSystem, 0, 0.0)?;
        pll.wait_pll_lock(PllBlock::NmrSystem)?;

        if let Some(freq) = clocks.analyzer_mhz {
            for channel in 0..4 {
                pll.set_pll(PllBlock::Analyzer, channel, freq, 0.5)?;
            }
            pll.reset_pll(PllBlock::Analyzer, ctrl)?;
            pll.wait_pll_lock(PllBlock::Analyzer)?;
            for (channel, degrees) in (0..).zip(ANALYZER_PHASES) {
                pll.set_phase(PllBlock::Analyzer, channel, degrees)?;
            }
            pll.wait_pll_lock(PllBlock::Analyzer)?;
        }

        self.state = FsmState::Configured;
        self.buffer_reset = false;
        Ok(())
    }

    /// Pulse the ADC FIFO reset, holding each level for the settle time.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless configured; bus errors.
    pub fn reset_buffer(&mut self, ctrl: &mut ControlRegisterState) -> Result<()> {
        self.expect(FsmState::Configured, "reset the buffer")?;
        ctrl.assert_fifo_reset();
        ctrl.commit(&self.hw.ctrl_out)?;
        self.waiter.sleep(self.timing.settle);
        ctrl.release_fifo_reset();
        ctrl.commit(&self.hw.ctrl_out)?;
        self.waiter.sleep(self.timing.settle);
        self.buffer_reset = true;
        Ok(())
    }

    /// Set the phase-cycle bit for this shot. It stays as written until the
    /// next shot's `apply_phase`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless configured; bus errors.
    pub fn apply_phase(&mut self, ctrl: &mut ControlRegisterState, mode: PhaseMode) -> Result<()> {
        self.expect(FsmState::Configured, "change the RF phase")?;
        match mode {
            PhaseMode::Alternate => ctrl.toggle_phase_cycle(),
            PhaseMode::ForceOff => ctrl.disable_phase_cycle(),
            PhaseMode::Leave => return Ok(()),
        }
        ctrl.commit(&self.hw.ctrl_out)
    }

    /// Route the analyzer PLL to the transmitter for the coming run.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless configured; bus errors.
    pub fn gate_analyzer(&mut self, ctrl: &mut ControlRegisterState) -> Result<()> {
        self.expect(FsmState::Configured, "gate the analyzer clock")?;
        ctrl.select_analyzer_path();
        ctrl.commit(&self.hw.ctrl_out)?;
        self.waiter.sleep(self.timing.settle);
        Ok(())
    }

    /// Issue the start edge: the line goes high, then low, with nothing in
    /// between.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless configured with a fresh buffer reset; bus
    /// errors.
    pub fn start(&mut self, ctrl: &mut ControlRegisterState) -> Result<()> {
        self.expect(FsmState::Configured, "start")?;
        if !self.buffer_reset {
            return Err(NmrError::invalid_state(
                "cannot start before the ADC buffer is reset",
            ));
        }
        ctrl.set_start();
        ctrl.commit(&self.hw.ctrl_out)?;
        ctrl.clear_start();
        ctrl.commit(&self.hw.ctrl_out)?;
        self.state = FsmState::Running;
        tracing::debug!("FSM started");
        Ok(())
    }

    /// Block until the sequence-running bit clears.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless running; `HardwareTimeout` or `Cancelled`.
    pub fn wait_done(&mut self) -> Result<()> {
        self.expect(FsmState::Running, "wait for completion")?;
        let ctrl_in = self.hw.ctrl_in;
        self.waiter.poll_until(
            &PollConfig {
                operation: "pulse sequence",
                timeout: self.timing.run_timeout,
                interval: self.timing.poll_interval,
            },
            || Ok((ctrl_in.read(0)? & ctrl_in::NMR_SEQ_RUN == 0).then_some(())),
        )?;
        self.state = FsmState::Done;
        tracing::debug!("FSM done");
        Ok(())
    }

    /// Return to idle after a completed shot.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless done.
    pub fn finish(&mut self) -> Result<()> {
        self.expect(FsmState::Done, "finish")?;
        self.state = FsmState::Idle;
        self.buffer_reset = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::CancelToken;
    use crate::sim::{SimClock, SimPll, SimulatedFpga};
    use nmr_fpga::regs;

    fn timing() -> FsmTiming {
        FsmTiming {
            run_timeout: Duration::from_millis(5),
            poll_interval: Duration::from_micros(10),
            settle: Duration::from_micros(10),
        }
    }

    fn params() -> PulseSequenceParams {
        PulseSequenceParams {
            pulse1_ticks: 160,
            delay1_ticks: 560,
            pulse2_ticks: 320,
            delay2_ticks: 1280,
            init_adc_delay_ticks: 128,
            samples_per_echo: 64,
            echoes_per_scan: 8,
        }
    }

    const PLAN: ClockPlan = ClockPlan {
        system_mhz: 32.0,
        analyzer_mhz: None,
    };

    #[test]
    fn full_cycle_orders_writes() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let hw = HardwareMap::new(fpga.lw(), fpga.axi());
        let mut seq = Sequencer::new(hw, Waiter::new(&clock, CancelToken::new()), timing());
        let mut ctrl = ControlRegisterState::default();
        let mut pll = SimPll::default();

        seq.configure(&mut ctrl, &params(), Some(0), &PLAN, &mut pll).unwrap();
        assert_eq!(seq.state(), FsmState::Configured);
        seq.reset_buffer(&mut ctrl).unwrap();
        seq.apply_phase(&mut ctrl, PhaseMode::ForceOff).unwrap();
        seq.start(&mut ctrl).unwrap();
        seq.wait_done().unwrap();
        seq.finish().unwrap();
        assert_eq!(seq.state(), FsmState::Idle);

        let order: Vec<usize> = fpga
            .lw_writes()
            .iter()
            .map(|w| w.offset)
            .filter(|o| (regs::RX_DELAY - 0x70..=regs::RX_DELAY).contains(o))
            .collect();
        assert_eq!(
            order,
            [
                regs::RX_DELAY,
                regs::PULSE_90DEG,
                regs::DELAY_NOSIG,
                regs::PULSE_180DEG,
                regs::DELAY_SIG,
                regs::INIT_DELAY,
                regs::ECHOES_PER_SCAN,
                regs::SAMPLES_PER_ECHO,
            ]
        );
        assert_eq!(pll.locks, vec![PllBlock::NmrSystem]);
    }

    #[test]
    fn start_requires_buffer_reset() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let hw = HardwareMap::new(fpga.lw(), fpga.axi());
        let mut seq = Sequencer::new(hw, Waiter::new(&clock, CancelToken::new()), timing());
        let mut ctrl = ControlRegisterState::default();

        let err = seq.start(&mut ctrl).unwrap_err();
        assert!(matches!(err, NmrError::InvalidState { .. }));

        seq.configure(&mut ctrl, &params(), None, &PLAN, &mut SimPll::default())
            .unwrap();
        let err = seq.start(&mut ctrl).unwrap_err();
        assert!(err.to_string().contains("buffer"));
        assert!(!ctrl.start());
    }

    #[test]
    fn analyzer_plan_programs_four_phases() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let hw = HardwareMap::new(fpga.lw(), fpga.axi());
        let mut seq = Sequencer::new(hw, Waiter::new(&clock, CancelToken::new()), timing());
        let mut pll = SimPll::default();
        let plan = ClockPlan {
            system_mhz: 16.0,
            analyzer_mhz: Some(4.0),
        };
        seq.configure(
            &mut ControlRegisterState::default(),
            &params(),
            None,
            &plan,
            &mut pll,
        )
        .unwrap();
        let analyzer_phases: Vec<f64> = pll
            .phases
            .iter()
            .filter(|(b, _, _)| *b == PllBlock::Analyzer)
            .map(|(_, _, d)| *d)
            .collect();
        assert_eq!(analyzer_phases, ANALYZER_PHASES);
        assert_eq!(
            pll.locks,
            vec![PllBlock::NmrSystem, PllBlock::Analyzer, PllBlock::Analyzer]
        );
    }

    #[test]
    fn stuck_sequence_times_out() {
        let fpga = SimulatedFpga::new();
        fpga.set_run_polls(u32::MAX);
        let clock = SimClock::new();
        let hw = HardwareMap::new(fpga.lw(), fpga.axi());
        let mut seq = Sequencer::new(hw, Waiter::new(&clock, CancelToken::new()), timing());
        let mut ctrl = ControlRegisterState::default();
        seq.configure(&mut ctrl, &params(), None, &PLAN, &mut SimPll::default())
            .unwrap();
        seq.reset_buffer(&mut ctrl).unwrap();
        seq.start(&mut ctrl).unwrap();
        let err = seq.wait_done().unwrap_err();
        assert!(matches!(err, NmrError::HardwareTimeout { .. }));
        assert_eq!(seq.state(), FsmState::Running);
    }
}
