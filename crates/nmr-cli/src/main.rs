// SPDX-License-Identifier: AGPL-3.0-only
//! `nmr`: command-line front end for the FPGA/HPS NMR spectrometer.
//!
//! ```text
//! USAGE:
//!   nmr init                                   Bring the fabric to its defaults
//!   nmr cpmg <freq> <p90> <p180> ... <tx_sd>   Iterated CPMG acquisition
//!   nmr fid <freq> <p> <dtcl> <ie> <n> <it>    Iterated FID acquisition
//!   nmr noise <fsamp> <ie> <n> <it>            Iterated noise acquisition
//!   nmr wobble <start> <stop> <step> <fsamp>   Matching-network sweep
//!   nmr pamp-char <start> <stop> <step> <fs>   Preamp characterisation sweep
//!   nmr params <freq> <shift> <p90> ...        Print CPMG timing, no hardware
//!   nmr preamp-dac <vbias> <vvarac>            Set the preamp bias DAC
//!   nmr match-network <cshunt> <cseries>       Switch matching capacitors
//!   nmr pamp-relay <value>                     Set the preamp relays
//!   nmr relay-bank <mask0> <mask1>             Set the I2C relay expanders
//! ```
//!
//! Measurements land in a timestamped folder under `--output-root`.
//! `--simulate` runs every command against an in-process FPGA model.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use nmr_driver::persist::{self, RunDirectory, ScanWriter};
use nmr_driver::system::{run_sweep_session, sweep_samples};
use nmr_driver::{
    compute_cpmg, Ad5724r, AcquisitionRunner, CancelToken, Clock, ControlRegisterState,
    CpmgRequest, DacChannel, DacWiring, DriverConfig, FabricPll, HardwareMap, I2cRelayBank,
    IterationObserver, NmrError, PhysicalRegion, RelayBankState, RunSummary, ScanData,
    ScanOptions, SessionSetup, SimClock, SimulatedFpga, SpiMaster, SweepKind, SweepRequest,
    SystemClock, Waiter,
};
use nmr_fpga::bridge;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nmr", about = "FPGA/HPS NMR spectrometer CLI", version)]
struct Cli {
    /// Run against the simulated FPGA instead of /dev/mem.
    #[arg(long, global = true)]
    simulate: bool,
    /// Directory receiving measurement folders and the history file.
    #[arg(long, global = true, default_value = ".")]
    output_root: PathBuf,
    /// More log output (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Reset control lines, PLL reconfiguration and the acquisition controller.
    Init,
    /// Iterated CPMG acquisition.
    #[command(allow_negative_numbers = true)]
    Cpmg(CpmgArgs),
    /// Iterated free-induction-decay acquisition.
    Fid {
        /// RF frequency, MHz.
        freq_mhz: f64,
        /// Excitation pulse length, µs.
        pulse_us: f64,
        /// Excitation pulse duty cycle (unused by this fabric).
        pulse_duty: f64,
        /// Pause before each scan, µs.
        scan_spacing_us: u64,
        /// ADC samples per scan.
        samples: u32,
        /// Number of scans.
        iterations: u32,
    },
    /// Iterated noise acquisition (receiver only).
    Noise {
        /// ADC sampling frequency, MHz. The sequencer runs at a quarter of it.
        sampling_mhz: f64,
        /// Pause before each scan, µs.
        scan_spacing_us: u64,
        /// ADC samples per scan.
        samples: u32,
        /// Number of scans.
        iterations: u32,
    },
    /// Sweep the transmitter across a band to tune the matching network.
    Wobble(SweepArgs),
    /// Sweep the analyzer across a band to characterise the preamp.
    PampChar(SweepArgs),
    /// Print the resolved CPMG timing without touching hardware.
    #[command(allow_negative_numbers = true)]
    Params {
        /// RF frequency, MHz.
        freq_mhz: f64,
        /// Acquisition window shift, µs.
        echo_shift_us: f64,
        /// 90° pulse length, µs.
        pulse1_us: f64,
        /// 180° pulse length, µs.
        pulse2_us: f64,
        /// Echo spacing, µs.
        echo_spacing_us: f64,
        /// ADC samples per echo.
        samples_per_echo: u32,
    },
    /// Set the preamp bias (DAC A) and varactor (DAC B) voltages.
    #[command(allow_negative_numbers = true)]
    PreampDac {
        /// Bias voltage, V.
        vbias: f64,
        /// Varactor voltage, V.
        vvarac: f64,
    },
    /// Switch the matching-network capacitor banks (0 disconnects).
    MatchNetwork {
        /// Shunt capacitor code, 12 bits.
        #[arg(value_parser = parse_u16)]
        c_shunt: u16,
        /// Series capacitor code, 12 bits.
        #[arg(value_parser = parse_u16)]
        c_series: u16,
    },
    /// Set the preamp input relays.
    PampRelay {
        /// Relay word.
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
    /// Switch relays on the two I2C expanders.
    RelayBank {
        /// Bits of expander 0.
        #[arg(value_parser = parse_u16)]
        mask0: u16,
        /// Bits of expander 1.
        #[arg(value_parser = parse_u16)]
        mask1: u16,
        /// Clear the masked relays instead of setting them.
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Args)]
struct CpmgArgs {
    /// RF frequency, MHz.
    freq_mhz: f64,
    /// 90° pulse length, µs.
    pulse1_us: f64,
    /// 180° pulse length, µs.
    pulse2_us: f64,
    /// 90° pulse duty cycle (unused by this fabric).
    pulse1_duty: f64,
    /// 180° pulse duty cycle (unused by this fabric).
    pulse2_duty: f64,
    /// Echo spacing, µs.
    echo_spacing_us: f64,
    /// Pause before each scan, µs.
    scan_spacing_us: u64,
    /// ADC samples per echo.
    samples_per_echo: u32,
    /// Echoes per scan.
    echoes_per_scan: u32,
    /// Acquisition window shift, µs.
    echo_shift_us: f64,
    /// Number of scans.
    iterations: u32,
    /// Phase cycling (0 or 1).
    phase_cycle: u8,
    /// T1 inversion pulse, FSM ticks (0 disables).
    t1_pulse_ticks: u32,
    /// T1 recovery delay, FSM ticks.
    t1_delay_ticks: u32,
    /// Shut the TX amplifier down while receiving (0 or 1).
    tx_shutdown: u8,
}

#[derive(Args)]
struct SweepArgs {
    /// First frequency, MHz.
    start_mhz: f64,
    /// Last frequency, MHz.
    stop_mhz: f64,
    /// Frequency step, MHz.
    step_mhz: f64,
    /// ADC sampling frequency, MHz.
    sampling_mhz: f64,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s}: {e}"))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let v = parse_u32(s)?;
    u16::try_from(v).map_err(|_| format!("{s} does not fit in 16 bits"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    let sim = cli.simulate;
    let root = cli.output_root.as_path();

    match cli.command {
        Cmd::Params {
            freq_mhz,
            echo_shift_us,
            pulse1_us,
            pulse2_us,
            echo_spacing_us,
            samples_per_echo,
        } => cmd_params(&CpmgRequest {
            base_freq_mhz: freq_mhz,
            pulse1_us,
            pulse2_us,
            echo_spacing_us,
            samples_per_echo,
            echoes_per_scan: 1,
            echo_shift_us,
        })?,
        Cmd::Init => with_rig(sim, cmd_init)?,
        Cmd::Cpmg(args) => with_rig(sim, |rig| cmd_cpmg(rig, root, &args))?,
        Cmd::Fid {
            freq_mhz,
            pulse_us,
            pulse_duty,
            scan_spacing_us,
            samples,
            iterations,
        } => with_rig(sim, |rig| {
            tracing::debug!("Duty cycle {pulse_duty:.2} is fixed by the fabric");
            cmd_fid(rig, root, freq_mhz, pulse_us, scan_spacing_us, samples, iterations)
        })?,
        Cmd::Noise {
            sampling_mhz,
            scan_spacing_us,
            samples,
            iterations,
        } => with_rig(sim, |rig| {
            cmd_noise(rig, root, sampling_mhz, scan_spacing_us, samples, iterations)
        })?,
        Cmd::Wobble(args) => with_rig(sim, |rig| cmd_sweep(rig, root, SweepKind::Wobble, &args))?,
        Cmd::PampChar(args) => {
            with_rig(sim, |rig| cmd_sweep(rig, root, SweepKind::PampChar, &args))?;
        }
        Cmd::PreampDac { vbias, vvarac } => with_rig(sim, |rig| cmd_preamp_dac(rig, vbias, vvarac))?,
        Cmd::MatchNetwork { c_shunt, c_series } => with_rig(sim, |rig| {
            nmr_driver::spi::write_matching_network(&rig.spi(rig.hw.spi_mtch), c_shunt, c_series)?;
            println!("Matching network: shunt={c_shunt} series={c_series}");
            Ok(())
        })?,
        Cmd::PampRelay { value } => with_rig(sim, |rig| {
            nmr_driver::spi::write_pamp_relays(&rig.spi(rig.hw.spi_afe), value)?;
            println!("Preamp relays: {value:#x}");
            Ok(())
        })?,
        Cmd::RelayBank {
            mask0,
            mask1,
            disable,
        } => with_rig(sim, |rig| cmd_relay_bank(rig, mask0, mask1, !disable))?,
    }

    Ok(())
}

// ── Hardware plumbing ────────────────────────────────────────────────────────

/// Register buses of either the board or the simulator.
enum Bus {
    Board {
        lw: PhysicalRegion,
        axi: PhysicalRegion,
    },
    Sim(SimulatedFpga),
}

impl Bus {
    fn open(simulate: bool) -> Result<Self> {
        if simulate {
            tracing::info!("Using the simulated FPGA");
            return Ok(Self::Sim(SimulatedFpga::new()));
        }
        let lw = PhysicalRegion::map(bridge::LW_H2F_BASE, bridge::LW_H2F_SPAN)
            .context("mapping the lightweight HPS-to-FPGA bridge (root required)")?;
        let axi = PhysicalRegion::map(bridge::H2F_BASE, bridge::H2F_SPAN)
            .context("mapping the HPS-to-FPGA AXI bridge")?;
        Ok(Self::Board { lw, axi })
    }

    fn hardware(&self) -> HardwareMap<'_> {
        match self {
            Self::Board { lw, axi } => HardwareMap::new(lw, axi),
            Self::Sim(fpga) => HardwareMap::new(fpga.lw(), fpga.axi()),
        }
    }
}

/// Open the buses, build a [`Rig`] over them and run `f`.
fn with_rig(simulate: bool, f: impl FnOnce(&Rig<'_>) -> Result<()>) -> Result<()> {
    let bus = Bus::open(simulate)?;
    let clock: Box<dyn Clock> = if simulate {
        Box::new(SimClock::new())
    } else {
        Box::new(SystemClock::new())
    };
    let rig = Rig {
        hw: bus.hardware(),
        waiter: Waiter::new(clock.as_ref(), CancelToken::new()),
        config: DriverConfig::from_env()?,
    };
    f(&rig)
}

/// Everything a command needs to talk to the fabric.
struct Rig<'a> {
    hw: HardwareMap<'a>,
    waiter: Waiter<'a>,
    config: DriverConfig,
}

impl<'a> Rig<'a> {
    fn pll(&self) -> FabricPll<'a> {
        FabricPll::new(
            self.hw.ctrl_out,
            self.hw.ctrl_in,
            self.hw.sys_pll,
            self.hw.analyzer_pll,
            self.waiter.clone(),
            self.config.pll_timing(),
        )
    }

    fn runner(&self) -> AcquisitionRunner<'a, FabricPll<'a>> {
        AcquisitionRunner::new(self.hw, self.waiter.clone(), self.config.clone(), self.pll())
    }

    fn spi(&self, regs: nmr_driver::Peripheral<'a>) -> SpiMaster<'a> {
        SpiMaster::new(regs, self.waiter.clone(), self.config.spi_timeout)
    }

    fn control(&self) -> Result<ControlRegisterState> {
        Ok(ControlRegisterState::load(&self.hw.ctrl_out)?)
    }

    fn session(&self, t1_pulse_ticks: u32, t1_delay_ticks: u32, tx_shutdown: bool) -> SessionSetup {
        SessionSetup {
            t1_pulse_ticks,
            t1_delay_ticks,
            tx_shutdown,
            decimation: self.config.decimation,
            ..SessionSetup::default()
        }
    }
}

/// Reports progress and optionally writes every scan.
struct RunObserver<'d> {
    scans: Option<ScanWriter<'d>>,
}

impl<'d> RunObserver<'d> {
    fn new(dir: &'d RunDirectory, samples_per_echo: usize, write_scans: bool) -> Self {
        Self {
            scans: write_scans.then(|| ScanWriter::new(dir, samples_per_echo)),
        }
    }
}

impl IterationObserver for RunObserver<'_> {
    fn on_progress(&mut self, percent: f64) {
        eprintln!("progress: {percent:.0}%");
    }

    fn on_scan(&mut self, iteration: u32, scan: &ScanData) -> nmr_driver::Result<()> {
        match self.scans.as_mut() {
            Some(w) => w.on_scan(iteration, scan),
            None => Ok(()),
        }
    }

    fn on_discard(&mut self, iteration: u32, error: &NmrError) {
        eprintln!("scan {iteration} discarded: {error}");
    }
}

fn report(dir: &RunDirectory, summary: &RunSummary) -> Result<()> {
    println!(
        "{}: {} scans, {} discarded",
        dir.path().display(),
        summary.completed,
        summary.discarded
    );
    if summary.completed == 0 && summary.discarded > 0 {
        bail!("every scan was discarded, sums are empty");
    }
    Ok(())
}

fn spacing(us: u64) -> Duration {
    Duration::from_micros(us)
}

// ── Commands ─────────────────────────────────────────────────────────────────

fn cmd_params(req: &CpmgRequest) -> Result<()> {
    let timing = compute_cpmg(req, &DriverConfig::from_env()?.timing_limits())?;
    let c = &timing.clocks;
    let p = &timing.params;
    println!("FSM clock      : {:.3} MHz", c.fsm_mhz);
    println!("ADC clock      : {:.3} MHz", c.adc_mhz);
    println!("p90            : {} ticks ({:.3} µs)", p.pulse1_ticks, c.fsm_us(p.pulse1_ticks));
    println!("d90            : {} ticks ({:.3} µs)", p.delay1_ticks, c.fsm_us(p.delay1_ticks));
    println!("p180           : {} ticks ({:.3} µs)", p.pulse2_ticks, c.fsm_us(p.pulse2_ticks));
    println!("d180           : {} ticks ({:.3} µs)", p.delay2_ticks, c.fsm_us(p.delay2_ticks));
    println!("echo time      : {:.3} µs", timing.echo_time_us());
    println!(
        "ADC init delay : {} ticks ({:.3} µs)",
        p.init_adc_delay_ticks,
        c.adc_us(p.init_adc_delay_ticks)
    );
    println!("RX delay       : {} ticks", timing.rx_delay_ticks);
    println!("window excess  : {:.3} µs", timing.excess_us);
    if timing.init_delay_clamped {
        println!("(ADC init delay clamped to its minimum)");
    }
    Ok(())
}

fn cmd_init(rig: &Rig<'_>) -> Result<()> {
    let mut ctrl = rig.control()?;
    nmr_driver::init_defaults(&rig.hw, &rig.waiter, &rig.pll(), &mut ctrl)?;
    println!("System initialised");
    Ok(())
}

fn cmd_cpmg(rig: &Rig<'_>, root: &Path, args: &CpmgArgs) -> Result<()> {
    let req = CpmgRequest {
        base_freq_mhz: args.freq_mhz,
        pulse1_us: args.pulse1_us,
        pulse2_us: args.pulse2_us,
        echo_spacing_us: args.echo_spacing_us,
        samples_per_echo: args.samples_per_echo,
        echoes_per_scan: args.echoes_per_scan,
        echo_shift_us: args.echo_shift_us,
    };
    let opts = ScanOptions {
        scan_spacing: spacing(args.scan_spacing_us),
        phase_cycle: args.phase_cycle != 0,
    };
    tracing::debug!(
        "Duty cycles {:.2}/{:.2} are fixed by the fabric",
        args.pulse1_duty,
        args.pulse2_duty
    );
    // reject bad timing before a folder or register is touched
    compute_cpmg(&req, &rig.config.timing_limits())?;

    let mut ctrl = rig.control()?;
    rig.session(args.t1_pulse_ticks, args.t1_delay_ticks, args.tx_shutdown != 0)
        .apply(&rig.hw, &rig.waiter, &mut ctrl)?;

    let dir = RunDirectory::create(root, "cpmg", SystemTime::now())?;
    let mut observer = RunObserver::new(&dir, req.samples_per_echo as usize, rig.config.write_scans);
    let result = rig
        .runner()
        .cpmg_iterate(&mut ctrl, &req, &opts, args.iterations, &mut observer);
    SessionSetup::finish(&rig.hw, &mut ctrl)?;
    let (timing, summary) = result?;

    dir.write_parameters(&persist::cpmg_record(&req, &timing, &opts, args.iterations))?;
    dir.write_sums(&summary.accumulator)?;
    dir.publish("compute_iterate")?;
    report(&dir, &summary)
}

fn cmd_fid(
    rig: &Rig<'_>,
    root: &Path,
    freq_mhz: f64,
    pulse_us: f64,
    scan_spacing_us: u64,
    samples: u32,
    iterations: u32,
) -> Result<()> {
    let mut ctrl = rig.control()?;
    rig.session(0, 0, true).apply(&rig.hw, &rig.waiter, &mut ctrl)?;

    let dir = RunDirectory::create(root, "fid", SystemTime::now())?;
    let mut observer = RunObserver::new(&dir, samples as usize, rig.config.write_scans);
    let scan_spacing = spacing(scan_spacing_us);
    let result = rig.runner().fid_iterate(
        &mut ctrl,
        freq_mhz,
        pulse_us,
        samples,
        scan_spacing,
        iterations,
        &mut observer,
    );
    SessionSetup::finish(&rig.hw, &mut ctrl)?;
    let (timing, summary) = result?;

    dir.write_parameters(&persist::fid_record(pulse_us, &timing, scan_spacing, iterations))?;
    dir.write_sums(&summary.accumulator)?;
    dir.publish("fid_iterate")?;
    report(&dir, &summary)
}

fn cmd_noise(
    rig: &Rig<'_>,
    root: &Path,
    sampling_mhz: f64,
    scan_spacing_us: u64,
    samples: u32,
    iterations: u32,
) -> Result<()> {
    let base_mhz = sampling_mhz / 4.0;
    let mut ctrl = rig.control()?;
    rig.session(0, 0, true).apply(&rig.hw, &rig.waiter, &mut ctrl)?;

    let dir = RunDirectory::create(root, "noise", SystemTime::now())?;
    let mut observer = RunObserver::new(&dir, samples as usize, rig.config.write_scans);
    let scan_spacing = spacing(scan_spacing_us);
    let result = rig.runner().noise_iterate(
        &mut ctrl,
        base_mhz,
        samples,
        scan_spacing,
        iterations,
        &mut observer,
    );
    SessionSetup::finish(&rig.hw, &mut ctrl)?;
    let (timing, summary) = result?;

    dir.write_parameters(&persist::noise_record(&timing, scan_spacing, iterations))?;
    dir.write_sums(&summary.accumulator)?;
    dir.publish("fid_iterate")?;
    report(&dir, &summary)
}

fn cmd_sweep(rig: &Rig<'_>, root: &Path, kind: SweepKind, args: &SweepArgs) -> Result<()> {
    let req = SweepRequest {
        start_mhz: args.start_mhz,
        stop_mhz: args.stop_mhz,
        step_mhz: args.step_mhz,
        sampling_mhz: args.sampling_mhz,
        samples: sweep_samples(args.sampling_mhz, args.step_mhz)?,
    };
    // validates the band before a folder is created
    req.frequencies()?;

    let mut ctrl = rig.control()?;
    let dir = RunDirectory::create(root, kind.tag(), SystemTime::now())?;
    dir.write_parameters(&persist::sweep_record(&req))?;
    let points = run_sweep_session(&mut rig.runner(), &mut ctrl, kind, &req, &mut |f, samples| {
        dir.write_sweep_point(f, samples)
    })?;
    dir.publish("tx_acq")?;
    println!("{}: {points} points", dir.path().display());
    Ok(())
}

fn cmd_preamp_dac(rig: &Rig<'_>, vbias: f64, vvarac: f64) -> Result<()> {
    let mut ctrl = rig.control()?;
    let dac = Ad5724r::new(
        rig.spi(rig.hw.dac_preamp),
        rig.hw.ctrl_out,
        DacWiring::from_config(&rig.config),
    );
    dac.init(&mut ctrl)?;
    let bias = dac.write_voltage(&mut ctrl, DacChannel::A, vbias)?;
    let varac = dac.write_voltage(&mut ctrl, DacChannel::B, vvarac)?;
    println!("Preamp DAC: vbias {vbias:.3} V (code {bias}), vvarac {vvarac:.3} V (code {varac})");
    Ok(())
}

fn cmd_relay_bank(rig: &Rig<'_>, mask0: u16, mask1: u16, enable: bool) -> Result<()> {
    let bank = I2cRelayBank::new(rig.hw.i2c, rig.waiter.clone(), rig.config.i2c_settle);
    let mut state = RelayBankState::default();
    bank.write(&mut state, enable, mask0, mask1)?;
    println!(
        "Relay bank: expander0={:#06x} expander1={:#06x}",
        state.expander0, state.expander1
    );
    Ok(())
}
