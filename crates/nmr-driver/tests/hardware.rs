// SPDX-License-Identifier: AGPL-3.0-only
//! On-board tests
//!
//! These map the HPS-to-FPGA bridges through `/dev/mem` and drive the real
//! fabric. Run as root on the DE1-SoC with the spectrometer bitstream loaded:
//! `cargo test -p nmr-driver --test hardware -- --ignored`

use nmr_driver::prelude::*;
use nmr_driver::{init_defaults, CaptureMode};
use nmr_fpga::bridge;

fn with_board(f: impl FnOnce(&HardwareMap<'_>, &Waiter<'_>, FabricPll<'_>, ControlRegisterState)) {
    let lw = PhysicalRegion::map(bridge::LW_H2F_BASE, bridge::LW_H2F_SPAN).expect("map lightweight bridge");
    let axi = PhysicalRegion::map(bridge::H2F_BASE, bridge::H2F_SPAN).expect("map AXI bridge");
    let hw = HardwareMap::new(&lw, &axi);
    let clock = SystemClock::new();
    let waiter = Waiter::new(&clock, CancelToken::new());
    let pll = FabricPll::new(
        hw.ctrl_out,
        hw.ctrl_in,
        hw.sys_pll,
        hw.analyzer_pll,
        waiter.clone(),
        DriverConfig::default().pll_timing(),
    );
    let mut ctrl = ControlRegisterState::default();
    init_defaults(&hw, &waiter, &pll, &mut ctrl).expect("init");
    f(&hw, &waiter, pll, ctrl);
}

#[test]
#[ignore] // Requires hardware
fn test_system_pll_locks() {
    with_board(|hw, _waiter, mut pll, mut ctrl| {
        use nmr_driver::{PllBlock, PllControl};
        pll.set_pll(PllBlock::NmrSystem, 0, 68.8, 0.5).expect("program");
        pll.reset_pll(PllBlock::NmrSystem, &mut ctrl).expect("reset");
        pll.wait_pll_lock(PllBlock::NmrSystem).expect("lock");
        ctrl.commit(&hw.ctrl_out).expect("commit");
    });
}

#[test]
#[ignore] // Requires hardware
fn test_single_cpmg_shot() {
    with_board(|hw, waiter, pll, mut ctrl| {
        let config = DriverConfig::default();
        SessionSetup::default().apply(hw, waiter, &mut ctrl).expect("session");
        let mut runner = AcquisitionRunner::new(*hw, waiter.clone(), config, pll);
        let req = CpmgRequest {
            base_freq_mhz: 4.3,
            pulse1_us: 5.0,
            pulse2_us: 10.0,
            echo_spacing_us: 200.0,
            samples_per_echo: 64,
            echoes_per_scan: 16,
            echo_shift_us: 0.0,
        };
        let scan = runner
            .run_cpmg(&mut ctrl, &req, &ScanOptions::default())
            .expect("shot");
        assert_eq!(scan.raw.map(|r| r.len()), Some(64 * 16));
        SessionSetup::finish(hw, &mut ctrl).expect("finish");
        println!("CPMG shot OK");
    });
}

#[test]
#[ignore] // Requires hardware
fn test_noise_fifo_vs_dma() {
    with_board(|hw, waiter, pll, mut ctrl| {
        SessionSetup::default().apply(hw, waiter, &mut ctrl).expect("session");
        let config = DriverConfig {
            capture: CaptureMode::RAW,
            ..DriverConfig::default()
        };
        let mut runner = AcquisitionRunner::new(*hw, waiter.clone(), config, pll);
        let scan = runner.run_noise(&mut ctrl, 4.3, 256).expect("noise");
        let raw = scan.raw.expect("raw channel");
        let mean = raw.iter().map(|&s| f64::from(s)).sum::<f64>() / raw.len() as f64;
        println!("noise mean: {mean:.1} LSB over {} samples", raw.len());
    });
}
