// SPDX-License-Identifier: AGPL-3.0-only
//! Acquisition sequence runner
//!
//! One [`AcquisitionRunner::run_shot`] call is one complete single-shot
//! acquisition:
//!
//! ```text
//! plan (validated, no I/O)
//!   └─▶ scan spacing ─▶ configure (registers, PLLs) ─▶ buffer reset
//!         ─▶ phase bit ─▶ [analyzer gate] ─▶ start edge
//!         ─▶ retrieval:  DMA    start every transfer, wait every transfer,
//!                               wait for the FSM, read the staging SDRAM
//!                        FIFO   wait for the FSM, settle, drain by level
//!         ─▶ [RF gate restored] ─▶ count check ─▶ unpack
//! ```
//!
//! CPMG, FID, noise and sweep points differ only in the plan. Every check
//! that can reject a plan runs before the first register write.
//!
//! The runner assumes exclusive use of the FPGA for its lifetime; nothing
//! here locks the registers.

use crate::accumulate::{Accumulator, IterationEngine, IterationObserver, RunSummary};
use crate::config::{CaptureMode, DriverConfig, Retrieval};
use crate::control::ControlRegisterState;
use crate::dma::{DmaEngine, DmaTiming};
use crate::error::{NmrError, Result};
use crate::fifo;
use crate::fsm::{ClockPlan, FsmTiming, PhaseMode, Sequencer};
use crate::hwmap::HardwareMap;
use crate::params::{
    self, ClockDomains, CpmgRequest, CpmgTiming, PulseSequenceParams, SingleEchoTiming,
};
use crate::pll::{PllControl, PllSettings};
use crate::poll::Waiter;
use nmr_fpga::{fifo as fifo_reg, regs, timing};
use std::time::Duration;

/// Samples of one acquisition, by channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanData {
    /// Raw 14-bit ADC samples, `samples_per_echo × echoes_per_scan`
    pub raw: Option<Vec<u16>>,
    /// Interleaved downconverted I/Q words
    pub dconv: Option<Vec<i32>>,
}

/// Per-scan options shared by the iterated modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOptions {
    /// Pause before each shot
    pub scan_spacing: Duration,
    /// Alternate the RF phase and the accumulation sign
    pub phase_cycle: bool,
}

/// Everything [`AcquisitionRunner::run_shot`] needs for one shot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotPlan {
    /// Register image
    pub params: PulseSequenceParams,
    /// Receiver enable delay to program, if any
    pub rx_delay_ticks: Option<u32>,
    /// PLL frequencies
    pub clocks: ClockPlan,
    /// Phase-cycle bit handling
    pub phase: PhaseMode,
    /// Pause before the shot
    pub scan_spacing: Duration,
    /// Channels read back
    pub capture: CaptureMode,
    /// How words reach the HPS
    pub retrieval: Retrieval,
    /// Route the analyzer PLL to the transmitter during the run
    pub analyzer_gate: bool,
    /// Downconversion decimation factor
    pub decimation: u32,
}

impl ShotPlan {
    /// Raw FIFO words expected.
    pub fn raw_words(&self) -> usize {
        self.params.raw_words()
    }

    /// Downconverted FIFO words expected.
    pub fn dconv_words(&self) -> usize {
        self.params.dconv_words(self.decimation)
    }

    /// Byte offset of the downconverted block in the staging SDRAM.
    pub fn dconv_staging_offset(&self) -> usize {
        self.params.total_samples() * 4
    }

    /// Reject a plan the hardware cannot carry out.
    ///
    /// # Errors
    ///
    /// `Config` for an odd raw sample count, a capture that does not fit
    /// the staging memory, or a clock the fabric PLL cannot synthesise.
    pub fn validate(&self) -> Result<()> {
        if !self.capture.raw && !self.capture.downconverted {
            return Err(NmrError::config("capture mode selects no channel"));
        }
        let total = self.params.total_samples();
        if total == 0 {
            return Err(NmrError::config("sequence captures no samples"));
        }
        if self.capture.raw && total % fifo_reg::SAMPLES_PER_WORD != 0 {
            return Err(NmrError::config(format!(
                "raw capture needs an even number of samples, got {total}"
            )));
        }
        if self.retrieval == Retrieval::Dma {
            let end = self.dconv_staging_offset() + self.dconv_words() * 4;
            if end > regs::SDRAM_SPAN {
                return Err(NmrError::config(format!(
                    "capture needs {end} bytes of staging memory, {} available",
                    regs::SDRAM_SPAN
                )));
            }
        }
        PllSettings::solve(self.clocks.system_mhz)?;
        if let Some(freq) = self.clocks.analyzer_mhz {
            PllSettings::solve(freq)?;
        }
        Ok(())
    }

    fn accumulator(&self) -> Accumulator {
        Accumulator::new(
            self.capture.raw.then(|| self.params.total_samples()),
            self.capture.downconverted.then(|| self.dconv_words()),
        )
    }
}

/// Frequency sweep (`tx_acq`): one sweep point per frequency from `start`
/// to `stop` inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepRequest {
    /// First frequency, MHz
    pub start_mhz: f64,
    /// Last frequency, MHz
    pub stop_mhz: f64,
    /// Step, MHz
    pub step_mhz: f64,
    /// ADC sampling frequency, MHz
    pub sampling_mhz: f64,
    /// Samples per point; forced even
    pub samples: u32,
}

impl SweepRequest {
    /// Sample count after rounding up to even.
    pub fn even_samples(&self) -> u32 {
        self.samples + self.samples % 2
    }

    /// Frequencies visited, in order.
    ///
    /// The stop frequency is compared with half a step of slack so that it
    /// is included despite accumulated rounding.
    ///
    /// # Errors
    ///
    /// `Config` for a non-positive step or non-finite bounds.
    pub fn frequencies(&self) -> Result<Vec<f64>> {
        if !(self.step_mhz.is_finite() && self.step_mhz > 0.0) {
            return Err(NmrError::config("sweep step must be positive"));
        }
        if !(self.start_mhz.is_finite() && self.stop_mhz.is_finite()) {
            return Err(NmrError::config("sweep bounds must be finite"));
        }
        let limit = self.stop_mhz + self.step_mhz / 2.0;
        let mut out = Vec::new();
        let mut f = self.start_mhz;
        while f < limit {
            out.push(f);
            f += self.step_mhz;
        }
        Ok(out)
    }
}

/// Sequences single shots and iterated runs over one FPGA.
pub struct AcquisitionRunner<'a, P: PllControl> {
    hw: HardwareMap<'a>,
    waiter: Waiter<'a>,
    config: DriverConfig,
    pll: P,
}

impl<'a, P: PllControl> AcquisitionRunner<'a, P> {
    /// Create a runner.
    pub fn new(hw: HardwareMap<'a>, waiter: Waiter<'a>, config: DriverConfig, pll: P) -> Self {
        Self {
            hw,
            waiter,
            config,
            pll,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// PLL controller.
    pub fn pll(&self) -> &P {
        &self.pll
    }

    /// Peripheral handles.
    pub fn hardware(&self) -> &HardwareMap<'a> {
        &self.hw
    }

    /// Waiter used for every delay and poll.
    pub fn waiter(&self) -> &Waiter<'a> {
        &self.waiter
    }

    fn fsm_timing(&self) -> FsmTiming {
        FsmTiming {
            run_timeout: self.config.fsm_timeout,
            poll_interval: self.config.poll_interval,
            settle: self.config.settle,
        }
    }

    fn dma_timing(&self) -> DmaTiming {
        DmaTiming {
            timeout: self.config.dma_timeout,
            poll_interval: self.config.poll_interval,
            busy_backoff: self.config.dma_busy_backoff,
        }
    }

    fn plan(&self, params: PulseSequenceParams, clocks: ClockPlan) -> ShotPlan {
        ShotPlan {
            params,
            rx_delay_ticks: None,
            clocks,
            phase: PhaseMode::Leave,
            scan_spacing: Duration::ZERO,
            capture: self.config.capture,
            retrieval: self.config.retrieval,
            analyzer_gate: false,
            decimation: self.config.decimation,
        }
    }

    // ── Plans ────────────────────────────────────────────────────────────────

    /// Validated CPMG plan.
    ///
    /// # Errors
    ///
    /// `Config` from the parameter calculator or plan validation.
    pub fn cpmg_plan(&self, req: &CpmgRequest, opts: &ScanOptions) -> Result<(CpmgTiming, ShotPlan)> {
        let t = params::compute_cpmg(req, &self.config.timing_limits())?;
        let plan = ShotPlan {
            rx_delay_ticks: Some(t.rx_delay_ticks),
            phase: if opts.phase_cycle {
                PhaseMode::Alternate
            } else {
                PhaseMode::Leave
            },
            scan_spacing: opts.scan_spacing,
            ..self.plan(t.params, system_clock(&t.clocks))
        };
        plan.validate()?;
        Ok((t, plan))
    }

    /// Validated FID plan. The phase-cycle bit is forced off.
    ///
    /// # Errors
    ///
    /// `Config` from the parameter calculator or plan validation.
    pub fn fid_plan(
        &self,
        base_freq_mhz: f64,
        pulse_us: f64,
        samples: u32,
        scan_spacing: Duration,
    ) -> Result<(SingleEchoTiming, ShotPlan)> {
        let t = params::compute_fid(base_freq_mhz, pulse_us, samples, self.config.decimation)?;
        let plan = ShotPlan {
            phase: PhaseMode::ForceOff,
            scan_spacing,
            ..self.plan(t.params, system_clock(&t.clocks))
        };
        plan.validate()?;
        Ok((t, plan))
    }

    /// Validated noise plan. The phase-cycle bit is forced off.
    ///
    /// # Errors
    ///
    /// `Config` from the parameter calculator or plan validation.
    pub fn noise_plan(
        &self,
        base_freq_mhz: f64,
        samples: u32,
        scan_spacing: Duration,
    ) -> Result<(SingleEchoTiming, ShotPlan)> {
        let t = params::compute_noise(base_freq_mhz, samples, self.config.decimation)?;
        let plan = ShotPlan {
            phase: PhaseMode::ForceOff,
            scan_spacing,
            ..self.plan(t.params, system_clock(&t.clocks))
        };
        plan.validate()?;
        Ok((t, plan))
    }

    /// Validated plan of one sweep point: raw samples only, read by FIFO
    /// drain, with the analyzer PLL at `freq_mhz` gated to the transmitter.
    ///
    /// # Errors
    ///
    /// `Config` for an odd or zero sample count or non-positive frequencies.
    pub fn sweep_point_plan(&self, freq_mhz: f64, sampling_mhz: f64, samples: u32) -> Result<ShotPlan> {
        let params = params::compute_sweep_point(samples)?;
        let system = ClockDomains::from_base(sampling_mhz)?.base_mhz * timing::ADC_CLOCK_RATIO;
        if !(freq_mhz.is_finite() && freq_mhz > 0.0) {
            return Err(NmrError::config(format!(
                "sweep frequency must be positive, got {freq_mhz} MHz"
            )));
        }
        let plan = ShotPlan {
            capture: CaptureMode::RAW,
            retrieval: Retrieval::DirectFifo,
            analyzer_gate: true,
            ..self.plan(
                params,
                ClockPlan {
                    system_mhz: system,
                    analyzer_mhz: Some(freq_mhz),
                },
            )
        };
        plan.validate()?;
        Ok(plan)
    }

    // ── Single shots ─────────────────────────────────────────────────────────

    /// Run one shot.
    ///
    /// # Errors
    ///
    /// `Config` if the plan is invalid (nothing written), `DataIntegrity`
    /// on a short or long capture, `HardwareTimeout`, `Cancelled`, or bus
    /// errors.
    pub fn run_shot(&mut self, ctrl: &mut ControlRegisterState, plan: &ShotPlan) -> Result<ScanData> {
        plan.validate()?;
        self.waiter.sleep(plan.scan_spacing);

        let mut seq = Sequencer::new(self.hw, self.waiter.clone(), self.fsm_timing());
        seq.configure(
            ctrl,
            &plan.params,
            plan.rx_delay_ticks,
            &plan.clocks,
            &mut self.pll,
        )?;
        seq.reset_buffer(ctrl)?;
        seq.apply_phase(ctrl, plan.phase)?;
        if plan.analyzer_gate {
            seq.gate_analyzer(ctrl)?;
        }
        seq.start(ctrl)?;

        let captured = self.retrieve(&mut seq, plan);

        if plan.analyzer_gate {
            ctrl.select_rf_gate_path();
            ctrl.commit(&self.hw.ctrl_out)?;
            self.waiter.sleep(self.config.settle);
        }
        let words = captured?;
        seq.finish()?;
        words.unpack(plan)
    }

    fn retrieve(&self, seq: &mut Sequencer<'_>, plan: &ShotPlan) -> Result<CapturedWords> {
        match plan.retrieval {
            Retrieval::Dma => self.retrieve_dma(seq, plan),
            Retrieval::DirectFifo => self.retrieve_fifo(seq, plan),
        }
    }

    fn retrieve_dma(&self, seq: &mut Sequencer<'_>, plan: &ShotPlan) -> Result<CapturedWords> {
        let raw_dma = DmaEngine::new(self.hw.dma_raw);
        let dconv_dma = DmaEngine::new(self.hw.dma_dconv);
        let raw_words = plan.raw_words();
        let dconv_words = plan.dconv_words();
        let dconv_offset = plan.dconv_staging_offset();

        if plan.capture.raw {
            raw_dma.transfer(
                dma_address(regs::ADC_FIFO_OUT)?,
                dma_address(regs::SDRAM)?,
                word_count(raw_words)?,
            )?;
        }
        if plan.capture.downconverted {
            dconv_dma.transfer(
                dma_address(regs::DCONV_FIFO_OUT)?,
                dma_address(regs::SDRAM + dconv_offset)?,
                word_count(dconv_words)?,
            )?;
        }

        let timing = self.dma_timing();
        let raw_moved = if plan.capture.raw {
            Some(raw_dma.wait_done(&self.waiter, &timing)?.transferred_words(raw_words))
        } else {
            None
        };
        let dconv_moved = if plan.capture.downconverted {
            Some(dconv_dma.wait_done(&self.waiter, &timing)?.transferred_words(dconv_words))
        } else {
            None
        };
        seq.wait_done()?;

        let sdram = &self.hw.sdram;
        Ok(CapturedWords {
            raw: raw_moved
                .map(|n| fifo::read_staging(sdram, 0, n))
                .transpose()?,
            dconv: dconv_moved
                .map(|n| fifo::read_staging(sdram, dconv_offset / 4, n))
                .transpose()?,
        })
    }

    fn retrieve_fifo(&self, seq: &mut Sequencer<'_>, plan: &ShotPlan) -> Result<CapturedWords> {
        seq.wait_done()?;
        self.waiter.sleep(self.config.fifo_drain_settle);

        let hw = &self.hw;
        Ok(CapturedWords {
            raw: plan
                .capture
                .raw
                .then(|| fifo::drain(&hw.adc_fifo, &hw.adc_fifo_csr, plan.raw_words() * 2))
                .transpose()?,
            dconv: plan
                .capture
                .downconverted
                .then(|| fifo::drain(&hw.dconv_fifo, &hw.dconv_fifo_csr, plan.dconv_words() * 2))
                .transpose()?,
        })
    }

    /// One CPMG shot.
    ///
    /// # Errors
    ///
    /// As for [`AcquisitionRunner::run_shot`].
    pub fn run_cpmg(
        &mut self,
        ctrl: &mut ControlRegisterState,
        req: &CpmgRequest,
        opts: &ScanOptions,
    ) -> Result<ScanData> {
        let (_, plan) = self.cpmg_plan(req, opts)?;
        self.run_shot(ctrl, &plan)
    }

    /// One FID shot.
    ///
    /// # Errors
    ///
    /// As for [`AcquisitionRunner::run_shot`].
    pub fn run_fid(
        &mut self,
        ctrl: &mut ControlRegisterState,
        base_freq_mhz: f64,
        pulse_us: f64,
        samples: u32,
    ) -> Result<ScanData> {
        let (_, plan) = self.fid_plan(base_freq_mhz, pulse_us, samples, Duration::ZERO)?;
        self.run_shot(ctrl, &plan)
    }

    /// One noise shot.
    ///
    /// # Errors
    ///
    /// As for [`AcquisitionRunner::run_shot`].
    pub fn run_noise(
        &mut self,
        ctrl: &mut ControlRegisterState,
        base_freq_mhz: f64,
        samples: u32,
    ) -> Result<ScanData> {
        let (_, plan) = self.noise_plan(base_freq_mhz, samples, Duration::ZERO)?;
        self.run_shot(ctrl, &plan)
    }

    /// One sweep point; returns the raw samples.
    ///
    /// # Errors
    ///
    /// As for [`AcquisitionRunner::run_shot`].
    pub fn run_sweep_point(
        &mut self,
        ctrl: &mut ControlRegisterState,
        freq_mhz: f64,
        sampling_mhz: f64,
        samples: u32,
    ) -> Result<Vec<u16>> {
        let plan = self.sweep_point_plan(freq_mhz, sampling_mhz, samples)?;
        let scan = self.run_shot(ctrl, &plan)?;
        scan.raw
            .ok_or_else(|| NmrError::integrity(0, plan.params.total_samples()))
    }

    // ── Iterated runs ────────────────────────────────────────────────────────

    /// Repeat `plan` and accumulate.
    ///
    /// # Errors
    ///
    /// As for [`IterationEngine::run`].
    pub fn iterate(
        &mut self,
        ctrl: &mut ControlRegisterState,
        plan: &ShotPlan,
        iterations: u32,
        phase_cycle: bool,
        observer: &mut dyn IterationObserver,
    ) -> Result<RunSummary> {
        plan.validate()?;
        tracing::info!(
            "Running {iterations} iterations ({} raw, {} dconv words each)",
            plan.raw_words(),
            plan.dconv_words()
        );
        let engine = IterationEngine::new(iterations, phase_cycle)
            .with_cancel(self.waiter.cancel_token().clone());
        engine.run(plan.accumulator(), |_| self.run_shot(ctrl, plan), observer)
    }

    /// CPMG, `iterations` times, with optional phase cycling.
    ///
    /// # Errors
    ///
    /// `Config` before any register write; otherwise as for
    /// [`AcquisitionRunner::iterate`].
    pub fn cpmg_iterate(
        &mut self,
        ctrl: &mut ControlRegisterState,
        req: &CpmgRequest,
        opts: &ScanOptions,
        iterations: u32,
        observer: &mut dyn IterationObserver,
    ) -> Result<(CpmgTiming, RunSummary)> {
        let (timing, plan) = self.cpmg_plan(req, opts)?;
        let summary = self.iterate(ctrl, &plan, iterations, opts.phase_cycle, observer)?;
        Ok((timing, summary))
    }

    /// FID, `iterations` times.
    ///
    /// # Errors
    ///
    /// As for [`AcquisitionRunner::cpmg_iterate`].
    pub fn fid_iterate(
        &mut self,
        ctrl: &mut ControlRegisterState,
        base_freq_mhz: f64,
        pulse_us: f64,
        samples: u32,
        scan_spacing: Duration,
        iterations: u32,
        observer: &mut dyn IterationObserver,
    ) -> Result<(SingleEchoTiming, RunSummary)> {
        let (timing, plan) = self.fid_plan(base_freq_mhz, pulse_us, samples, scan_spacing)?;
        let summary = self.iterate(ctrl, &plan, iterations, false, observer)?;
        Ok((timing, summary))
    }

    /// Noise, `iterations` times.
    ///
    /// # Errors
    ///
    /// As for [`AcquisitionRunner::cpmg_iterate`].
    pub fn noise_iterate(
        &mut self,
        ctrl: &mut ControlRegisterState,
        base_freq_mhz: f64,
        samples: u32,
        scan_spacing: Duration,
        iterations: u32,
        observer: &mut dyn IterationObserver,
    ) -> Result<(SingleEchoTiming, RunSummary)> {
        let (timing, plan) = self.noise_plan(base_freq_mhz, samples, scan_spacing)?;
        let summary = self.iterate(ctrl, &plan, iterations, false, observer)?;
        Ok((timing, summary))
    }

    /// Frequency sweep. `sink` receives each point's frequency and samples.
    /// Returns the number of points acquired.
    ///
    /// A point whose capture fails an iteration-local check (see
    /// [`NmrError::is_iteration_local`]) is logged and skipped; the sweep
    /// moves on to the next frequency.
    ///
    /// # Errors
    ///
    /// `Config` before any register write; the first run-fatal error of any
    /// point; any error from `sink`.
    pub fn sweep(
        &mut self,
        ctrl: &mut ControlRegisterState,
        req: &SweepRequest,
        sink: &mut dyn FnMut(f64, &[u16]) -> Result<()>,
    ) -> Result<u32> {
        let samples = req.even_samples();
        let freqs = req.frequencies()?;
        for &f in &freqs {
            self.sweep_point_plan(f, req.sampling_mhz, samples)?;
        }
        tracing::info!(
            "Sweep {:.3}..{:.3} MHz, {} points of {samples} samples",
            req.start_mhz,
            req.stop_mhz,
            freqs.len()
        );

        let mut points = 0;
        let mut skipped = 0;
        for f in freqs {
            self.waiter.cancel_token().check()?;
            match self.run_sweep_point(ctrl, f, req.sampling_mhz, samples) {
                Ok(data) => {
                    sink(f, &data)?;
                    points += 1;
                }
                Err(e) if e.is_iteration_local() => {
                    tracing::warn!("Sweep point {f:.3} MHz skipped: {e}");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
            self.waiter.sleep(self.config.sweep_point_gap);
        }
        if skipped > 0 {
            tracing::warn!("Sweep finished with {skipped} of {} points skipped", points + skipped);
        }
        Ok(points)
    }
}

fn system_clock(clocks: &ClockDomains) -> ClockPlan {
    ClockPlan {
        system_mhz: clocks.fsm_mhz,
        analyzer_mhz: None,
    }
}

fn dma_address(offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .map_err(|_| NmrError::config(format!("DMA address {offset:#x} out of range")))
}

fn word_count(words: usize) -> Result<u32> {
    u32::try_from(words)
        .map_err(|_| NmrError::config(format!("transfer of {words} words too long")))
}

/// Words as retrieved, before the count check.
struct CapturedWords {
    raw: Option<Vec<u32>>,
    dconv: Option<Vec<u32>>,
}

impl CapturedWords {
    fn unpack(self, plan: &ShotPlan) -> Result<ScanData> {
        if let Some(raw) = &self.raw {
            if raw.len() != plan.raw_words() {
                tracing::warn!(
                    "Raw capture: {} words, expected {}; scan flushed",
                    raw.len(),
                    plan.raw_words()
                );
                return Err(NmrError::integrity(
                    raw.len() * fifo_reg::SAMPLES_PER_WORD,
                    plan.params.total_samples(),
                ));
            }
        }
        if let Some(dconv) = &self.dconv {
            if dconv.len() != plan.dconv_words() {
                tracing::warn!(
                    "Downconverted capture: {} words, expected {}; scan flushed",
                    dconv.len(),
                    plan.dconv_words()
                );
                return Err(NmrError::integrity(dconv.len(), plan.dconv_words()));
            }
        }
        Ok(ScanData {
            raw: self.raw.as_deref().map(fifo::unpack_words),
            dconv: self.dconv.as_deref().map(fifo::signed_words),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::NoopObserver;
    use crate::poll::CancelToken;
    use crate::sim::{SimClock, SimPll, SimulatedFpga};
    use nmr_fpga::regs::ctrl_out;

    fn request() -> CpmgRequest {
        CpmgRequest {
            base_freq_mhz: 2.0,
            pulse1_us: 5.0,
            pulse2_us: 10.0,
            echo_spacing_us: 50.0,
            samples_per_echo: 16,
            echoes_per_scan: 4,
            echo_shift_us: 0.0,
        }
    }

    fn runner<'a>(
        fpga: &'a SimulatedFpga,
        clock: &'a SimClock,
        config: DriverConfig,
    ) -> AcquisitionRunner<'a, SimPll> {
        fpga.lw().write_word(regs::DEC_FACT, config.decimation).unwrap();
        fpga.clear_log();
        AcquisitionRunner::new(
            HardwareMap::new(fpga.lw(), fpga.axi()),
            Waiter::new(clock, CancelToken::new()),
            config,
            SimPll::default(),
        )
    }

    #[test]
    fn dma_shot_returns_both_channels() {
        let fpga = SimulatedFpga::new();
        fpga.set_raw_sample(0x123);
        fpga.set_dconv_value(-7);
        let clock = SimClock::new();
        let mut r = runner(&fpga, &clock, DriverConfig::default());
        let mut ctrl = ControlRegisterState::default();

        let scan = r.run_cpmg(&mut ctrl, &request(), &ScanOptions::default()).unwrap();
        assert_eq!(scan.raw.unwrap(), vec![0x123; 64]);
        assert_eq!(scan.dconv.unwrap(), vec![-7; 32]);
        assert_eq!(fpga.starts(), 1);
    }

    #[test]
    fn fifo_shot_matches_dma_shot() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let config = DriverConfig {
            retrieval: Retrieval::DirectFifo,
            ..DriverConfig::default()
        };
        let mut r = runner(&fpga, &clock, config);
        let scan = r
            .run_cpmg(&mut ControlRegisterState::default(), &request(), &ScanOptions::default())
            .unwrap();
        assert_eq!(scan.raw.map(|v| v.len()), Some(64));
        assert_eq!(scan.dconv.map(|v| v.len()), Some(32));
        assert_eq!(fpga.raw_fifo_level(), 0);
    }

    #[test]
    fn short_capture_is_integrity_error() {
        let fpga = SimulatedFpga::new();
        fpga.set_raw_shortfall(2);
        let clock = SimClock::new();
        let mut r = runner(&fpga, &clock, DriverConfig::default());
        let err = r
            .run_cpmg(&mut ControlRegisterState::default(), &request(), &ScanOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            NmrError::DataIntegrity {
                captured: 60,
                requested: 64
            }
        ));
    }

    #[test]
    fn invalid_plan_writes_nothing() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let mut r = runner(&fpga, &clock, DriverConfig::default());
        let mut req = request();
        req.samples_per_echo = 18;
        let err = r
            .run_cpmg(&mut ControlRegisterState::default(), &req, &ScanOptions::default())
            .unwrap_err();
        assert!(matches!(err, NmrError::Config { .. }));
        assert!(fpga.writes().is_empty());
    }

    #[test]
    fn phase_cycling_alternates_bit() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let mut r = runner(&fpga, &clock, DriverConfig::default());
        let mut ctrl = ControlRegisterState::default();
        let opts = ScanOptions {
            phase_cycle: true,
            ..ScanOptions::default()
        };
        r.run_cpmg(&mut ctrl, &request(), &opts).unwrap();
        assert!(ctrl.phase_cycle());
        r.run_cpmg(&mut ctrl, &request(), &opts).unwrap();
        assert!(!ctrl.phase_cycle());
    }

    #[test]
    fn fid_forces_phase_off() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let mut r = runner(&fpga, &clock, DriverConfig::default());
        let mut ctrl = ControlRegisterState::default();
        ctrl.enable_phase_cycle();
        let scan = r.run_fid(&mut ctrl, 2.0, 10.0, 100).unwrap();
        assert!(!ctrl.phase_cycle());
        assert_eq!(scan.raw.map(|v| v.len()), Some(100));
        assert_eq!(fpga.register(regs::PULSE_90DEG), 0);
        assert_eq!(fpga.register(regs::INIT_DELAY), 2);
    }

    #[test]
    fn sweep_point_gates_analyzer_and_restores() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let mut r = runner(&fpga, &clock, DriverConfig::default());
        let mut ctrl = ControlRegisterState::default();
        ctrl.select_rf_gate_path();

        let samples = r.run_sweep_point(&mut ctrl, 4.2, 16.0, 40).unwrap();
        assert_eq!(samples.len(), 40);
        assert!(!ctrl.analyzer_path());

        let gate_writes: Vec<bool> = fpga
            .lw_writes()
            .iter()
            .filter(|w| w.offset == regs::CTRL_OUT)
            .map(|w| w.value & ctrl_out::NMR_CLK_GATE_AVLN == 0)
            .collect();
        assert!(gate_writes.contains(&true));
        assert_eq!(gate_writes.last(), Some(&false));
        assert_eq!(r.pll().frequencies[0].2, 64.0);
    }

    #[test]
    fn sweep_frequencies_include_stop() {
        let req = SweepRequest {
            start_mhz: 1.0,
            stop_mhz: 1.3,
            step_mhz: 0.1,
            sampling_mhz: 16.0,
            samples: 41,
        };
        assert_eq!(req.frequencies().unwrap().len(), 4);
        assert_eq!(req.even_samples(), 42);
    }

    #[test]
    fn iterate_discards_bad_scan_and_continues() {
        let fpga = SimulatedFpga::new();
        fpga.set_raw_sample(10);
        fpga.set_raw_shortfall_at(2, 1);
        let clock = SimClock::new();
        let mut r = runner(
            &fpga,
            &clock,
            DriverConfig {
                capture: CaptureMode::RAW,
                ..DriverConfig::default()
            },
        );
        let (_, summary) = r
            .cpmg_iterate(
                &mut ControlRegisterState::default(),
                &request(),
                &ScanOptions::default(),
                3,
                &mut NoopObserver,
            )
            .unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.discarded, 1);
        assert_eq!(summary.accumulator.raw_sum().unwrap(), &[20; 64][..]);
        assert!(summary.accumulator.dconv_sum().is_none());
        assert_eq!(fpga.starts(), 3);
    }

    #[test]
    fn dma_timeout_aborts() {
        let fpga = SimulatedFpga::new();
        fpga.set_dma_never_done(true);
        let clock = SimClock::new();
        let config = DriverConfig {
            dma_timeout: Duration::from_secs(2),
            ..DriverConfig::default()
        };
        let mut r = runner(&fpga, &clock, config);
        let err = r
            .cpmg_iterate(
                &mut ControlRegisterState::default(),
                &request(),
                &ScanOptions::default(),
                4,
                &mut NoopObserver,
            )
            .unwrap_err();
        assert!(matches!(err, NmrError::HardwareTimeout { .. }));
        assert_eq!(fpga.starts(), 1);
    }

    #[test]
    fn staging_overflow_rejected() {
        let fpga = SimulatedFpga::new();
        let clock = SimClock::new();
        let r = runner(&fpga, &clock, DriverConfig::default());
        let (_, mut plan) = r.cpmg_plan(&request(), &ScanOptions::default()).unwrap();
        plan.params.echoes_per_scan = 1 << 22;
        assert!(matches!(plan.validate(), Err(NmrError::Config { .. })));
    }
}
