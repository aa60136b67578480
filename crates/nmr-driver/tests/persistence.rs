// SPDX-License-Identifier: AGPL-3.0-only
//! Measurement output written from simulated runs

use nmr_driver::persist::{
    self, CURRENT_FOLDER_FILE, DCONV_SUM_FILE, HISTORY_FILE, PARAMETER_FILE, RAW_SUM_FILE,
};
use nmr_driver::system::{run_sweep_session, sweep_samples};
use nmr_driver::{
    AcquisitionRunner, CancelToken, ControlRegisterState, CpmgRequest, DriverConfig, HardwareMap,
    RunDirectory, ScanOptions, ScanWriter, SessionSetup, SimClock, SimPll, SimulatedFpga,
    SweepKind, SweepRequest, Waiter,
};
use std::fs;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

#[test]
fn cpmg_run_directory_contents() {
    let root = TempDir::new().unwrap();
    let fpga = SimulatedFpga::new();
    fpga.set_raw_sample(3);
    let clock = SimClock::new();
    let hw = HardwareMap::new(fpga.lw(), fpga.axi());
    let waiter = Waiter::new(&clock, CancelToken::new());
    let mut ctrl = ControlRegisterState::default();
    SessionSetup::default().apply(&hw, &waiter, &mut ctrl).unwrap();
    let mut runner = AcquisitionRunner::new(hw, waiter, DriverConfig::default(), SimPll::default());

    let req = CpmgRequest {
        base_freq_mhz: 2.0,
        pulse1_us: 5.0,
        pulse2_us: 10.0,
        echo_spacing_us: 50.0,
        samples_per_echo: 8,
        echoes_per_scan: 2,
        echo_shift_us: 0.0,
    };
    let opts = ScanOptions {
        scan_spacing: Duration::from_millis(200),
        phase_cycle: false,
    };

    let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let dir = RunDirectory::create(root.path(), "cpmg", at).unwrap();
    let mut writer = ScanWriter::new(&dir, 8);
    let (timing, summary) = runner
        .cpmg_iterate(&mut ctrl, &req, &opts, 2, &mut writer)
        .unwrap();
    dir.write_parameters(&persist::cpmg_record(&req, &timing, &opts, 2))
        .unwrap();
    dir.write_sums(&summary.accumulator).unwrap();
    dir.publish("compute_iterate").unwrap();

    assert_eq!(dir.name(), "2023_11_14_22_13_20_cpmg");
    let par = fs::read_to_string(dir.path().join(PARAMETER_FILE)).unwrap();
    assert!(par.contains("nrIterations = 2\n"));
    assert!(par.contains("ieTime = 200\n"));
    assert!(par.contains("usePhaseCycle = 0\n"));

    let asum = fs::read_to_string(dir.path().join(RAW_SUM_FILE)).unwrap();
    assert_eq!(asum.lines().count(), 16);
    assert!(asum.lines().all(|l| l == "6"));
    let dconv = fs::read_to_string(dir.path().join(DCONV_SUM_FILE)).unwrap();
    assert_eq!(dconv.lines().count(), 8);

    for i in 1..=2 {
        let avg = fs::read_to_string(dir.path().join(format!("avg_{i:03}"))).unwrap();
        assert_eq!(avg.lines().collect::<Vec<_>>(), vec!["6"; 8]);
    }

    assert_eq!(
        fs::read_to_string(root.path().join(HISTORY_FILE)).unwrap(),
        "compute_iterate([data_folder,'2023_11_14_22_13_20_cpmg']);\n"
    );
    assert_eq!(
        fs::read_to_string(root.path().join(CURRENT_FOLDER_FILE)).unwrap(),
        "2023_11_14_22_13_20_cpmg\n"
    );
}

#[test]
fn wobble_writes_one_file_per_point() {
    let root = TempDir::new().unwrap();
    let fpga = SimulatedFpga::new();
    let clock = SimClock::new();
    let hw = HardwareMap::new(fpga.lw(), fpga.axi());
    let mut runner = AcquisitionRunner::new(
        hw,
        Waiter::new(&clock, CancelToken::new()),
        DriverConfig::default(),
        SimPll::default(),
    );
    let mut ctrl = ControlRegisterState::default();

    let req = SweepRequest {
        start_mhz: 4.0,
        stop_mhz: 4.2,
        step_mhz: 0.1,
        sampling_mhz: 4.0,
        samples: sweep_samples(4.0, 0.1).unwrap(),
    };
    let dir = RunDirectory::create(root.path(), SweepKind::Wobble.tag(), UNIX_EPOCH).unwrap();
    dir.write_parameters(&persist::sweep_record(&req)).unwrap();
    let points = run_sweep_session(
        &mut runner,
        &mut ctrl,
        SweepKind::Wobble,
        &req,
        &mut |f, samples| dir.write_sweep_point(f, samples),
    )
    .unwrap();
    assert_eq!(points, 3);

    for name in ["tx_acq_4.000", "tx_acq_4.100", "tx_acq_4.200"] {
        let data = fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(data.lines().count(), 40);
    }
    let par = fs::read_to_string(dir.path().join(PARAMETER_FILE)).unwrap();
    assert!(par.starts_with("freqSta = 4.000\nfreqSto = 4.200\nfreqSpa = 0.100\nnSamples = 40\n"));
    assert!(!ctrl.analyzer_path());
}
