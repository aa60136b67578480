// SPDX-License-Identifier: AGPL-3.0-only
//! Measurement output directories
//!
//! Each run gets `<root>/YYYY_MM_DD_HH_MM_SS_<tag>` (UTC):
//!
//! | File | Contents |
//! |------|----------|
//! | `acqu.par` | `key = value` lines describing the resolved timing |
//! | `asum` | raw-channel sum, one integer per line |
//! | `dconvi` | downconverted sum (interleaved I/Q), one integer per line |
//! | `dat_NNN`, `avg_NNN` | optional per-scan raw data and per-echo-position sum |
//! | `tx_acq_F.FFF` | raw samples of one sweep point |
//!
//! Publishing a run appends a line naming it to `measurement_history.txt`
//! and overwrites `current_folder.txt`, both in the root, for the analysis
//! scripts that pick up the latest run.

use crate::accumulate::{Accumulator, IterationObserver};
use crate::acquisition::{ScanData, ScanOptions, SweepRequest};
use crate::error::{NmrError, Result};
use crate::params::{CpmgRequest, CpmgTiming, SingleEchoTiming};
use std::fmt::{Display, Write as _};
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Parameter record file.
pub const PARAMETER_FILE: &str = "acqu.par";
/// Raw-channel sum file.
pub const RAW_SUM_FILE: &str = "asum";
/// Downconverted-channel sum file.
pub const DCONV_SUM_FILE: &str = "dconvi";
/// Run index, appended to.
pub const HISTORY_FILE: &str = "measurement_history.txt";
/// Latest run, overwritten.
pub const CURRENT_FOLDER_FILE: &str = "current_folder.txt";

/// Ordered `key = value` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterRecord {
    entries: Vec<(String, String)>,
}

impl ParameterRecord {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value as displayed.
    pub fn push(&mut self, key: &str, value: impl Display) -> &mut Self {
        self.entries.push((key.to_string(), value.to_string()));
        self
    }

    /// Append a float with three decimals.
    pub fn push_f64(&mut self, key: &str, value: f64) -> &mut Self {
        self.push(key, format!("{value:.3}"))
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// File contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            let _ = writeln!(out, "{k} = {v}");
        }
        out
    }
}

fn tick_entry(ticks: u32, clock_mhz: f64) -> String {
    format!("{ticks} @ {clock_mhz:.3} MHz")
}

fn millis(d: Duration) -> u128 {
    d.as_millis()
}

/// Record of a CPMG run.
pub fn cpmg_record(
    req: &CpmgRequest,
    timing: &CpmgTiming,
    opts: &ScanOptions,
    iterations: u32,
) -> ParameterRecord {
    let c = &timing.clocks;
    let p = &timing.params;
    let mut r = ParameterRecord::new();
    r.push_f64("b1Freq", c.base_mhz)
        .push_f64("p90LengthGiven", req.pulse1_us)
        .push_f64("p90LengthRun", c.fsm_us(p.pulse1_ticks))
        .push("p90LengthCnt", tick_entry(p.pulse1_ticks, c.fsm_mhz))
        .push_f64("d90LengthRun", c.fsm_us(p.delay1_ticks))
        .push("d90LengthCnt", tick_entry(p.delay1_ticks, c.fsm_mhz))
        .push_f64("p180LengthGiven", req.pulse2_us)
        .push_f64("p180LengthRun", c.fsm_us(p.pulse2_ticks))
        .push("p180LengthCnt", tick_entry(p.pulse2_ticks, c.fsm_mhz))
        .push_f64("d180LengthRun", c.fsm_us(p.delay2_ticks))
        .push("d180LengthCnt", tick_entry(p.delay2_ticks, c.fsm_mhz))
        .push_f64("echoTimeRun", timing.echo_time_us())
        .push_f64("echoTimeGiven", req.echo_spacing_us)
        .push("ieTime", millis(opts.scan_spacing))
        .push("nrPnts", p.samples_per_echo)
        .push("nrEchoes", p.echoes_per_scan)
        .push_f64("echoShift", req.echo_shift_us)
        .push("nrIterations", iterations)
        .push("dummyEchoes", 0)
        .push_f64("adcFreq", c.adc_mhz)
        .push_f64("dwellTime", c.dwell_us())
        .push("usePhaseCycle", u8::from(opts.phase_cycle))
        .push_f64("rxDelayRun", timing.rx_delay_us)
        .push("initDelayCnt", p.init_adc_delay_ticks);
    r
}

fn single_echo_record(
    r: &mut ParameterRecord,
    timing: &SingleEchoTiming,
    scan_spacing: Duration,
    iterations: u32,
) {
    let c = &timing.clocks;
    let p = &timing.params;
    r.push_f64("d180LengthRun", c.fsm_us(p.delay2_ticks))
        .push("d180LengthCnt", tick_entry(p.delay2_ticks, c.fsm_mhz))
        .push("ieTime", millis(scan_spacing))
        .push("nrPnts", p.samples_per_echo)
        .push_f64("echoShift", p.effective_init_delay() / c.adc_mhz)
        .push("nrIterations", iterations)
        .push("dummyEchoes", 0)
        .push_f64("adcFreq", c.adc_mhz)
        .push_f64("dwellTime", c.dwell_us());
}

/// Record of an FID run.
pub fn fid_record(
    pulse_us: f64,
    timing: &SingleEchoTiming,
    scan_spacing: Duration,
    iterations: u32,
) -> ParameterRecord {
    let c = &timing.clocks;
    let p = &timing.params;
    let mut r = ParameterRecord::new();
    r.push_f64("b1Freq", c.base_mhz)
        .push_f64("p180LengthGiven", pulse_us)
        .push_f64("p180LengthRun", c.fsm_us(p.pulse2_ticks))
        .push("p180LengthCnt", tick_entry(p.pulse2_ticks, c.fsm_mhz));
    single_echo_record(&mut r, timing, scan_spacing, iterations);
    r
}

/// Record of a noise run.
pub fn noise_record(timing: &SingleEchoTiming, scan_spacing: Duration, iterations: u32) -> ParameterRecord {
    let mut r = ParameterRecord::new();
    r.push_f64("b1Freq", timing.clocks.base_mhz);
    single_echo_record(&mut r, timing, scan_spacing, iterations);
    r
}

/// Record of a frequency sweep.
pub fn sweep_record(req: &SweepRequest) -> ParameterRecord {
    let mut r = ParameterRecord::new();
    r.push_f64("freqSta", req.start_mhz)
        .push_f64("freqSto", req.stop_mhz)
        .push_f64("freqSpa", req.step_mhz)
        .push("nSamples", req.even_samples())
        .push_f64("freqSamp", req.sampling_mhz);
    r
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    (year, month as u32, day as u32)
}

/// `YYYY_MM_DD_HH_MM_SS_<tag>` for `at`, in UTC.
///
/// # Errors
///
/// `Config` for a time before the Unix epoch.
pub fn folder_name(tag: &str, at: SystemTime) -> Result<String> {
    let secs = at
        .duration_since(UNIX_EPOCH)
        .map_err(|_| NmrError::config("system clock is before 1970"))?
        .as_secs();
    let secs = i64::try_from(secs).map_err(|_| NmrError::config("timestamp out of range"))?;
    let (y, mo, d) = civil_from_days(secs.div_euclid(86_400));
    let tod = secs.rem_euclid(86_400);
    Ok(format!(
        "{y:04}_{mo:02}_{d:02}_{:02}_{:02}_{:02}_{tag}",
        tod / 3600,
        tod / 60 % 60,
        tod % 60
    ))
}

fn write_lines<T: Display>(path: &Path, values: impl IntoIterator<Item = T>) -> Result<()> {
    let mut out = String::new();
    for v in values {
        let _ = writeln!(out, "{v}");
    }
    fs::write(path, out)?;
    Ok(())
}

/// One run's output directory.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    root: PathBuf,
    name: String,
    path: PathBuf,
}

impl RunDirectory {
    /// Create `<root>/<timestamp>_<tag>`. The root is created if missing.
    ///
    /// # Errors
    ///
    /// `Io` if a directory cannot be created, including when the run
    /// directory already exists.
    pub fn create(root: impl AsRef<Path>, tag: &str, at: SystemTime) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let name = folder_name(tag, at)?;
        let path = root.join(&name);
        fs::create_dir(&path)?;
        tracing::info!("Measurement folder: {}", path.display());
        Ok(Self { root, name, path })
    }

    /// Directory name, relative to the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `acqu.par`.
    ///
    /// # Errors
    ///
    /// `Io` on write failure.
    pub fn write_parameters(&self, record: &ParameterRecord) -> Result<()> {
        fs::write(self.path.join(PARAMETER_FILE), record.render())?;
        Ok(())
    }

    /// Write `asum` and `dconvi` for the channels that were captured.
    ///
    /// # Errors
    ///
    /// `Io` on write failure.
    pub fn write_sums(&self, acc: &Accumulator) -> Result<()> {
        if let Some(raw) = acc.raw_sum() {
            write_lines(&self.path.join(RAW_SUM_FILE), raw)?;
        }
        if let Some(dconv) = acc.dconv_sum() {
            write_lines(&self.path.join(DCONV_SUM_FILE), dconv)?;
        }
        Ok(())
    }

    /// Write `dat_NNN` (raw scan) and `avg_NNN` (sum over echoes at each
    /// sample position).
    ///
    /// # Errors
    ///
    /// `Io` on write failure.
    pub fn write_scan(&self, iteration: u32, scan: &ScanData, samples_per_echo: usize) -> Result<()> {
        let Some(raw) = &scan.raw else {
            return Ok(());
        };
        write_lines(&self.path.join(format!("dat_{iteration:03}")), raw)?;

        let width = samples_per_echo.max(1);
        let mut per_position = vec![0u64; width];
        for (i, &s) in raw.iter().enumerate() {
            per_position[i % width] += u64::from(s);
        }
        write_lines(&self.path.join(format!("avg_{iteration:03}")), per_position)
    }

    /// Write the raw samples of one sweep point.
    ///
    /// # Errors
    ///
    /// `Io` on write failure.
    pub fn write_sweep_point(&self, freq_mhz: f64, samples: &[u16]) -> Result<()> {
        write_lines(&self.path.join(format!("tx_acq_{freq_mhz:.3}")), samples)
    }

    /// Announce the run: append `<script>([data_folder,'<name>']);` to the
    /// history and point `current_folder.txt` at it.
    ///
    /// # Errors
    ///
    /// `Io` on write failure.
    pub fn publish(&self, script: &str) -> Result<()> {
        let mut history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(HISTORY_FILE))?;
        writeln!(history, "{script}([data_folder,'{}']);", self.name)?;
        fs::write(self.root.join(CURRENT_FOLDER_FILE), format!("{}\n", self.name))?;
        Ok(())
    }
}

/// Observer writing every accepted scan into a run directory.
pub struct ScanWriter<'d> {
    dir: &'d RunDirectory,
    samples_per_echo: usize,
}

impl<'d> ScanWriter<'d> {
    /// Write scans of `samples_per_echo`-sample echoes into `dir`.
    pub fn new(dir: &'d RunDirectory, samples_per_echo: usize) -> Self {
        Self {
            dir,
            samples_per_echo,
        }
    }
}

impl IterationObserver for ScanWriter<'_> {
    fn on_scan(&mut self, iteration: u32, scan: &ScanData) -> Result<()> {
        self.dir.write_scan(iteration, scan, self.samples_per_echo)
    }
}
