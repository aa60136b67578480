// SPDX-License-Identifier: AGPL-3.0-only
//! End-to-end acquisition tests against the simulated FPGA
//!
//! Each test runs the same path the CLI does: session setup, then single
//! shots or iterated runs through `AcquisitionRunner`.

use nmr_driver::{
    AcquisitionRunner, CancelToken, CaptureMode, ControlRegisterState, CpmgRequest, DriverConfig,
    HardwareMap, NmrError, NoopObserver, Retrieval, ScanOptions, SessionSetup, SimClock, SimPll,
    SimulatedFpga, SweepRequest, Waiter,
};
use nmr_fpga::regs::{self, ctrl_out};
use std::time::Duration;

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

/// Session registers written, log cleared, runner ready.
fn setup<'a>(
    fpga: &'a SimulatedFpga,
    clock: &'a SimClock,
    config: DriverConfig,
) -> (AcquisitionRunner<'a, SimPll>, ControlRegisterState) {
    let hw = HardwareMap::new(fpga.lw(), fpga.axi());
    let waiter = Waiter::new(clock, CancelToken::new());
    let mut ctrl = ControlRegisterState::default();
    SessionSetup {
        decimation: config.decimation,
        ..SessionSetup::default()
    }
    .apply(&hw, &waiter, &mut ctrl)
    .unwrap();
    fpga.clear_log();
    (AcquisitionRunner::new(hw, waiter, config, SimPll::default()), ctrl)
}

#[test]
fn cpmg_register_image_end_to_end() {
    let fpga = SimulatedFpga::new();
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());

    runner
        .run_cpmg(&mut ctrl, &request(), &ScanOptions::default())
        .unwrap();

    assert_eq!(fpga.register(regs::PULSE_180DEG), 320);
    assert_eq!(fpga.register(regs::DELAY_SIG), 1280);
    assert_eq!(fpga.register(regs::PULSE_90DEG), 160);
    assert_eq!(fpga.register(regs::SAMPLES_PER_ECHO), 16);
    assert_eq!(fpga.register(regs::ECHOES_PER_SCAN), 4);
    assert_eq!(runner.pll().frequencies[0].2, 32.0);
}

#[test]
fn parameters_are_written_before_start() {
    let fpga = SimulatedFpga::new();
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());
    runner
        .run_cpmg(&mut ctrl, &request(), &ScanOptions::default())
        .unwrap();

    let writes = fpga.lw_writes();
    let start = writes
        .iter()
        .position(|w| w.offset == regs::CTRL_OUT && w.value & ctrl_out::FSM_START != 0)
        .unwrap();
    for reg in [
        regs::PULSE_90DEG,
        regs::DELAY_NOSIG,
        regs::PULSE_180DEG,
        regs::DELAY_SIG,
        regs::INIT_DELAY,
        regs::ECHOES_PER_SCAN,
        regs::SAMPLES_PER_ECHO,
        regs::RX_DELAY,
    ] {
        let last = writes.iter().rposition(|w| w.offset == reg).unwrap();
        assert!(last < start, "register {reg:#x} written after start");
    }
    // the FIFO reset is released before the start edge
    let fifo_released = writes[..start]
        .iter()
        .rev()
        .find(|w| w.offset == regs::CTRL_OUT)
        .map(|w| w.value & ctrl_out::ADC_FIFO_RST == 0);
    assert_eq!(fifo_released, Some(true));
}

#[test]
fn rejected_timing_touches_no_register() {
    let fpga = SimulatedFpga::new();
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());
    let req = CpmgRequest {
        echo_spacing_us: 5.0,
        ..request()
    };
    let err = runner
        .cpmg_iterate(&mut ctrl, &req, &ScanOptions::default(), 4, &mut NoopObserver)
        .unwrap_err();
    assert!(matches!(err, NmrError::Config { .. }));
    assert!(fpga.writes().is_empty());
    assert_eq!(fpga.starts(), 0);
}

#[test]
fn unreachable_pll_frequency_touches_no_register() {
    let fpga = SimulatedFpga::new();
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());
    // 16 x 150 MHz puts the system clock above the VCO range
    let req = CpmgRequest {
        base_freq_mhz: 150.0,
        ..request()
    };
    let err = runner
        .cpmg_iterate(&mut ctrl, &req, &ScanOptions::default(), 4, &mut NoopObserver)
        .unwrap_err();
    assert!(matches!(err, NmrError::Config { .. }));
    assert!(fpga.writes().is_empty());
    assert_eq!(fpga.starts(), 0);
    assert!(runner.pll().frequencies.is_empty());
}

#[test]
fn sweep_skips_short_point_and_finishes() {
    let fpga = SimulatedFpga::new();
    fpga.set_raw_shortfall_at(2, 1);
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());
    let req = SweepRequest {
        start_mhz: 4.0,
        stop_mhz: 4.2,
        step_mhz: 0.1,
        sampling_mhz: 4.0,
        samples: 8,
    };
    let mut seen = Vec::new();
    let mut sink = |f: f64, data: &[u16]| {
        assert_eq!(data.len(), 8);
        seen.push(f);
        Ok::<(), NmrError>(())
    };
    let points = runner.sweep(&mut ctrl, &req, &mut sink).unwrap();
    assert_eq!(points, 2);
    assert_eq!(seen.len(), 2);
    assert!((seen[0] - 4.0).abs() < 1e-9);
    assert!((seen[1] - 4.2).abs() < 1e-9);
    assert_eq!(fpga.starts(), 3);
}

#[test]
fn phase_cycling_cancels_constant_offset() {
    let fpga = SimulatedFpga::new();
    fpga.set_raw_sample(100);
    fpga.set_dconv_value(-3);
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());

    let cycled = ScanOptions {
        phase_cycle: true,
        ..ScanOptions::default()
    };
    let (_, summary) = runner
        .cpmg_iterate(&mut ctrl, &request(), &cycled, 4, &mut NoopObserver)
        .unwrap();
    assert_eq!(summary.completed, 4);
    assert!(summary.accumulator.raw_sum().unwrap().iter().all(|&s| s == 0));
    assert!(summary.accumulator.dconv_sum().unwrap().iter().all(|&s| s == 0));

    let (_, summary) = runner
        .cpmg_iterate(&mut ctrl, &request(), &ScanOptions::default(), 4, &mut NoopObserver)
        .unwrap();
    assert_eq!(summary.accumulator.raw_sum().unwrap(), &[400; 64][..]);
    assert_eq!(summary.accumulator.dconv_sum().unwrap(), &[-12; 32][..]);
}

#[test]
fn short_transfer_discards_scan_without_touching_sums() {
    let fpga = SimulatedFpga::new();
    fpga.set_raw_sample(5);
    fpga.set_raw_shortfall(1);
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());

    let (_, summary) = runner
        .cpmg_iterate(&mut ctrl, &request(), &ScanOptions::default(), 3, &mut NoopObserver)
        .unwrap();
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.discarded, 3);
    assert!(summary.accumulator.raw_sum().unwrap().iter().all(|&s| s == 0));
    assert!(summary.accumulator.dconv_sum().unwrap().iter().all(|&s| s == 0));
    assert_eq!(fpga.starts(), 3);
}

#[test]
fn dma_reporting_done_while_busy_is_waited_out() {
    let fpga = SimulatedFpga::new();
    fpga.set_raw_sample(1);
    fpga.set_dma_busy_polls(5);
    let clock = SimClock::new();
    let (mut runner, mut ctrl) = setup(&fpga, &clock, DriverConfig::default());
    let scan = runner
        .run_cpmg(&mut ctrl, &request(), &ScanOptions::default())
        .unwrap();
    assert_eq!(scan.raw.unwrap(), vec![1; 64]);
}

#[test]
fn dma_timeout_aborts_the_run() {
    let fpga = SimulatedFpga::new();
    fpga.set_dma_never_done(true);
    let clock = SimClock::new();
    let config = DriverConfig {
        dma_timeout: Duration::from_millis(50),
        ..DriverConfig::default()
    };
    let (mut runner, mut ctrl) = setup(&fpga, &clock, config);
    let err = runner
        .cpmg_iterate(&mut ctrl, &request(), &ScanOptions::default(), 10, &mut NoopObserver)
        .unwrap_err();
    assert!(matches!(err, NmrError::HardwareTimeout { .. }));
    assert_eq!(fpga.starts(), 1);
}

#[test]
fn fsm_that_never_finishes_times_out() {
    let fpga = SimulatedFpga::new();
    fpga.set_run_polls(u32::MAX);
    let clock = SimClock::new();
    let config = DriverConfig {
        retrieval: Retrieval::DirectFifo,
        fsm_timeout: Duration::from_millis(20),
        ..DriverConfig::default()
    };
    let (mut runner, mut ctrl) = setup(&fpga, &clock, config);
    let err = runner
        .run_cpmg(&mut ctrl, &request(), &ScanOptions::default())
        .unwrap_err();
    assert!(matches!(err, NmrError::HardwareTimeout { .. }));
}

#[test]
fn direct_fifo_raw_only_capture() {
    let fpga = SimulatedFpga::new();
    fpga.set_raw_sample(0x1FFF);
    let clock = SimClock::new();
    let config = DriverConfig {
        retrieval: Retrieval::DirectFifo,
        capture: CaptureMode::RAW,
        ..DriverConfig::default()
    };
    let (mut runner, mut ctrl) = setup(&fpga, &clock, config);
    let (timing, summary) = runner
        .fid_iterate(&mut ctrl, 2.0, 10.0, 32, Duration::from_millis(1), 2, &mut NoopObserver)
        .unwrap();
    assert_eq!(timing.params.init_adc_delay_ticks, 2);
    assert_eq!(summary.accumulator.raw_sum().unwrap(), &[0x3FFE; 32][..]);
    assert!(summary.accumulator.dconv_sum().is_none());
    // scan spacing is slept once per shot
    assert!(clock.now() >= Duration::from_millis(2));
}

#[test]
fn cancelled_run_stops_before_next_shot() {
    let fpga = SimulatedFpga::new();
    let clock = SimClock::new();
    let hw = HardwareMap::new(fpga.lw(), fpga.axi());
    let token = CancelToken::new();
    let mut runner = AcquisitionRunner::new(
        hw,
        Waiter::new(&clock, token.clone()),
        DriverConfig::default(),
        SimPll::default(),
    );
    token.cancel();
    let err = runner
        .noise_iterate(
            &mut ControlRegisterState::default(),
            2.0,
            16,
            Duration::ZERO,
            5,
            &mut NoopObserver,
        )
        .unwrap_err();
    assert!(matches!(err, NmrError::Cancelled));
    assert_eq!(fpga.starts(), 0);
}
