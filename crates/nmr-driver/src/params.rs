// SPDX-License-Identifier: AGPL-3.0-only
//! Parameter calculator
//!
//! Converts physical timing (µs, MHz) into the integer tick counts the
//! pulse-sequence FSM is programmed with. Two clock domains are involved,
//! both fixed multiples of the RF frequency `f`:
//!
//! ```text
//!            p90      d90        p180     d180 (signal window)
//!         ┌───────┐          ┌────────┐
//! FSM  ───┘       └──────────┘        └──────[ init | acq window | tail ]──
//!         16 f ticks                          4 f ticks (ADC domain)
//! ```
//!
//! Every check that can reject a request happens here, before anything is
//! written to hardware.

use crate::error::{NmrError, Result};
use nmr_fpga::timing;

/// FSM and ADC clock frequencies derived from one RF frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockDomains {
    /// RF (Larmor) frequency, MHz
    pub base_mhz: f64,
    /// Pulse-sequence FSM clock, MHz (16 × base)
    pub fsm_mhz: f64,
    /// ADC sample clock, MHz (4 × base)
    pub adc_mhz: f64,
}

impl ClockDomains {
    /// Derive both clock domains from the RF frequency.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the frequency is not a positive finite number.
    pub fn from_base(base_mhz: f64) -> Result<Self> {
        if !base_mhz.is_finite() || base_mhz <= 0.0 {
            return Err(NmrError::config(format!(
                "RF frequency must be positive, got {base_mhz} MHz"
            )));
        }
        Ok(Self {
            base_mhz,
            fsm_mhz: base_mhz * timing::FSM_CLOCK_RATIO,
            adc_mhz: base_mhz * timing::ADC_CLOCK_RATIO,
        })
    }

    /// Nearest FSM tick count for a duration in µs.
    pub fn fsm_ticks(&self, us: f64) -> i64 {
        round_ticks(us * self.fsm_mhz)
    }

    /// Nearest ADC tick count for a duration in µs.
    pub fn adc_ticks(&self, us: f64) -> i64 {
        round_ticks(us * self.adc_mhz)
    }

    /// Duration of `ticks` FSM clocks, µs.
    pub fn fsm_us(&self, ticks: u32) -> f64 {
        f64::from(ticks) / self.fsm_mhz
    }

    /// Duration of `ticks` ADC clocks, µs.
    pub fn adc_us(&self, ticks: u32) -> f64 {
        f64::from(ticks) / self.adc_mhz
    }

    /// ADC sample period, µs.
    pub fn dwell_us(&self) -> f64 {
        1.0 / self.adc_mhz
    }
}

#[allow(clippy::cast_possible_truncation)]
fn round_ticks(ticks: f64) -> i64 {
    ticks.round() as i64
}

fn to_register(name: &str, ticks: i64) -> Result<u32> {
    u32::try_from(ticks).map_err(|_| {
        NmrError::config(format!("{name} of {ticks} ticks does not fit its register"))
    })
}

/// Register image of one pulse sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PulseSequenceParams {
    /// 90° pulse, FSM ticks
    pub pulse1_ticks: u32,
    /// Delay after the 90° pulse, FSM ticks
    pub delay1_ticks: u32,
    /// 180° pulse, FSM ticks
    pub pulse2_ticks: u32,
    /// Delay after each 180° pulse, FSM ticks
    pub delay2_ticks: u32,
    /// ADC start inside the signal window, ADC ticks
    pub init_adc_delay_ticks: u32,
    /// ADC samples per echo
    pub samples_per_echo: u32,
    /// Echoes per scan
    pub echoes_per_scan: u32,
}

impl PulseSequenceParams {
    /// Samples in one scan (`samples_per_echo × echoes_per_scan`).
    pub fn total_samples(&self) -> usize {
        self.samples_per_echo as usize * self.echoes_per_scan as usize
    }

    /// 32-bit FIFO words carrying one scan of raw samples.
    pub fn raw_words(&self) -> usize {
        self.total_samples() / nmr_fpga::fifo::SAMPLES_PER_WORD
    }

    /// Words of interleaved I/Q produced by the downconverter for one scan.
    pub fn dconv_words(&self, decimation: u32) -> usize {
        self.total_samples() * 2 / decimation.max(1) as usize
    }

    /// Effective ADC start latency in ADC ticks, including the HDL erratum:
    /// 2.25 ticks at or below the floor, otherwise the register value plus
    /// 0.25.
    pub fn effective_init_delay(&self) -> f64 {
        effective_init_delay(self.init_adc_delay_ticks)
    }
}

/// Effective latency of an init-delay register value, ADC ticks.
pub fn effective_init_delay(ticks: u32) -> f64 {
    if ticks <= timing::INIT_DELAY_MIN_TICKS {
        timing::INIT_DELAY_FLOOR_LATENCY
    } else {
        f64::from(ticks) + timing::INIT_DELAY_INHERENT
    }
}

/// Physical description of a CPMG echo train.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpmgRequest {
    /// RF frequency, MHz
    pub base_freq_mhz: f64,
    /// 90° pulse length, µs
    pub pulse1_us: f64,
    /// 180° pulse length, µs
    pub pulse2_us: f64,
    /// Echo spacing tE (180° start to next 180° start), µs
    pub echo_spacing_us: f64,
    /// ADC samples per echo
    pub samples_per_echo: u32,
    /// Echoes per scan
    pub echoes_per_scan: u32,
    /// Shift of the acquisition window from the centre of the 180° delay, µs
    pub echo_shift_us: f64,
}

/// Limits that are properties of the installation rather than the sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingLimits {
    /// Downconversion decimation factor
    pub decimation: u32,
    /// Receiver / duplexer enable delay, µs
    pub rx_delay_us: f64,
    /// Acquisition-window timing guard, in RF periods
    pub guard_rf_periods: f64,
}

impl Default for TimingLimits {
    fn default() -> Self {
        Self {
            decimation: timing::DEFAULT_DECIMATION,
            rx_delay_us: 0.0,
            guard_rf_periods: timing::ACQ_GUARD_RF_PERIODS,
        }
    }
}

/// Validated CPMG timing, ready to program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpmgTiming {
    /// Clock domains the ticks are counted in
    pub clocks: ClockDomains,
    /// Register image
    pub params: PulseSequenceParams,
    /// Receiver enable delay register value, ADC ticks
    pub rx_delay_ticks: u32,
    /// Receiver enable delay actually realised, µs
    pub rx_delay_us: f64,
    /// ADC acquisition window, µs
    pub acquisition_window_us: f64,
    /// Slack left in the 180° delay around the acquisition window, µs
    pub excess_us: f64,
    /// Whether the hardware will clamp the init delay up to its floor
    pub init_delay_clamped: bool,
}

impl CpmgTiming {
    /// Echo period the hardware will actually run, µs.
    pub fn echo_time_us(&self) -> f64 {
        self.clocks
            .fsm_us(self.params.pulse2_ticks + self.params.delay2_ticks)
    }
}

/// Compute and validate the register image of a CPMG sequence.
///
/// ```text
/// pulse ticks   = round(pulse_us × fsm)
/// delay2 ticks  = round(tE × fsm) − pulse2 ticks
/// delay1 ticks  = round((tE/2 − p90/2 − p180/2) × fsm)
/// init ticks    = round(((delay2 − acq)/2 + echo_shift) × adc − 0.25)
/// ```
///
/// # Errors
///
/// Returns `Config` when the decimation does not divide `samples_per_echo`,
/// the acquisition window does not fit before the next pulse, the safety
/// margin is negative, or any tick count is out of register range.
pub fn compute_cpmg(req: &CpmgRequest, limits: &TimingLimits) -> Result<CpmgTiming> {
    let clocks = ClockDomains::from_base(req.base_freq_mhz)?;

    for (name, value) in [
        ("pulse1", req.pulse1_us),
        ("pulse2", req.pulse2_us),
        ("echo spacing", req.echo_spacing_us),
        ("echo shift", req.echo_shift_us),
        ("rx delay", limits.rx_delay_us),
    ] {
        if !value.is_finite() {
            return Err(NmrError::config(format!("{name} is not a finite number")));
        }
    }
    if req.pulse1_us < 0.0 || req.pulse2_us < 0.0 || req.echo_spacing_us <= 0.0 {
        return Err(NmrError::config(
            "pulse lengths must be non-negative and echo spacing positive",
        ));
    }
    check_samples(req.samples_per_echo, limits.decimation)?;
    if req.echoes_per_scan == 0 {
        return Err(NmrError::config("echoes_per_scan must be at least 1"));
    }

    let pulse1 = to_register("pulse1", clocks.fsm_ticks(req.pulse1_us))?;
    let pulse2 = to_register("pulse2", clocks.fsm_ticks(req.pulse2_us))?;
    let delay2 = to_register(
        "delay2",
        clocks.fsm_ticks(req.echo_spacing_us) - i64::from(pulse2),
    )?;
    let delay1 = to_register(
        "delay1",
        clocks.fsm_ticks(req.echo_spacing_us / 2.0 - req.pulse1_us / 2.0 - req.pulse2_us / 2.0),
    )?;

    let acquisition_window_us = f64::from(req.samples_per_echo) / clocks.adc_mhz;
    let signal_window_us = req.echo_spacing_us - req.pulse2_us;
    if acquisition_window_us > signal_window_us {
        return Err(NmrError::config(format!(
            "acquisition window ({acquisition_window_us:.1} us) exceeds tE - p180 \
             ({signal_window_us:.1} us); increase tE, reduce samples or shorten p180"
        )));
    }

    let rx_delay_ticks = to_register("rx delay", clocks.adc_ticks(limits.rx_delay_us))?;
    let rx_delay_us = clocks.adc_us(rx_delay_ticks);
    let guard_us = limits.guard_rf_periods / clocks.base_mhz;

    let excess_us = (req.echo_spacing_us - acquisition_window_us) / 2.0
        - req.echo_shift_us
        - guard_us
        - rx_delay_us;
    if excess_us < 0.0 {
        return Err(NmrError::config(format!(
            "acquisition window exceeds the 180 degree delay window by {:.1} us; \
             increase tE, reduce samples, shorten p180, adjust echo shift or rx delay",
            -excess_us
        )));
    }

    let centred_start_us =
        (clocks.fsm_us(delay2) - acquisition_window_us) / 2.0 + req.echo_shift_us;
    #[allow(clippy::cast_possible_truncation)]
    let init_ticks =
        (centred_start_us * clocks.adc_mhz - timing::INIT_DELAY_INHERENT).round() as i64;
    let init_adc_delay_ticks = to_register("init delay", init_ticks.max(0))?;

    let init_delay_clamped = init_adc_delay_ticks < timing::INIT_DELAY_MIN_TICKS;
    if init_delay_clamped {
        tracing::warn!(
            "computed ADC init delay {init_adc_delay_ticks} < {} clks; the HDL forces it to {}",
            timing::INIT_DELAY_MIN_TICKS,
            timing::INIT_DELAY_MIN_TICKS
        );
    }

    let params = PulseSequenceParams {
        pulse1_ticks: pulse1,
        delay1_ticks: delay1,
        pulse2_ticks: pulse2,
        delay2_ticks: delay2,
        init_adc_delay_ticks,
        samples_per_echo: req.samples_per_echo,
        echoes_per_scan: req.echoes_per_scan,
    };

    tracing::debug!(
        "CPMG p90 {:.3}us ({pulse1}) d90 {:.3}us ({delay1}) p180 {:.3}us ({pulse2}) \
         d180 {:.3}us ({delay2}) init {:.3}us ({init_adc_delay_ticks}) acq {acquisition_window_us:.3}us",
        clocks.fsm_us(pulse1),
        clocks.fsm_us(delay1),
        clocks.fsm_us(pulse2),
        clocks.fsm_us(delay2),
        params.effective_init_delay() / clocks.adc_mhz,
    );

    Ok(CpmgTiming {
        clocks,
        params,
        rx_delay_ticks,
        rx_delay_us,
        acquisition_window_us,
        excess_us,
        init_delay_clamped,
    })
}

fn check_samples(samples_per_echo: u32, decimation: u32) -> Result<()> {
    if decimation == 0 {
        return Err(NmrError::config("decimation factor must be at least 1"));
    }
    if samples_per_echo == 0 {
        return Err(NmrError::config("samples_per_echo must be at least 1"));
    }
    if samples_per_echo % decimation != 0 {
        let hint = if samples_per_echo < decimation {
            " (samples_per_echo is less than the decimation factor)"
        } else {
            ""
        };
        return Err(NmrError::config(format!(
            "samples_per_echo ({samples_per_echo}) is not a multiple of the decimation \
             factor ({decimation}){hint}"
        )));
    }
    Ok(())
}

/// Register image of a single-echo mode (FID or noise).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleEchoTiming {
    /// Clock domains the ticks are counted in
    pub clocks: ClockDomains,
    /// Register image
    pub params: PulseSequenceParams,
}

/// FID: one excitation pulse, then a signal window ten times the
/// acquisition window with the ADC started at the floor delay.
///
/// # Errors
///
/// Returns `Config` for a non-positive frequency, a negative pulse, or a
/// sample count the decimation does not divide.
pub fn compute_fid(
    base_freq_mhz: f64,
    pulse_us: f64,
    samples: u32,
    decimation: u32,
) -> Result<SingleEchoTiming> {
    let clocks = ClockDomains::from_base(base_freq_mhz)?;
    if !pulse_us.is_finite() || pulse_us < 0.0 {
        return Err(NmrError::config("pulse length must be non-negative"));
    }
    check_samples(samples, decimation)?;
    Ok(SingleEchoTiming {
        clocks,
        params: PulseSequenceParams {
            pulse1_ticks: 0,
            delay1_ticks: 0,
            pulse2_ticks: to_register("pulse", clocks.fsm_ticks(pulse_us))?,
            delay2_ticks: single_echo_window(samples)?,
            init_adc_delay_ticks: timing::FID_INIT_DELAY_TICKS,
            samples_per_echo: samples,
            echoes_per_scan: 1,
        },
    })
}

/// Noise: no pulses at all, receiver window as for FID.
///
/// # Errors
///
/// As for [`compute_fid`].
pub fn compute_noise(base_freq_mhz: f64, samples: u32, decimation: u32) -> Result<SingleEchoTiming> {
    let clocks = ClockDomains::from_base(base_freq_mhz)?;
    check_samples(samples, decimation)?;
    Ok(SingleEchoTiming {
        clocks,
        params: PulseSequenceParams {
            pulse1_ticks: 0,
            delay1_ticks: 0,
            pulse2_ticks: 0,
            delay2_ticks: single_echo_window(samples)?,
            init_adc_delay_ticks: timing::NOISE_INIT_DELAY_TICKS,
            samples_per_echo: samples,
            echoes_per_scan: 1,
        },
    })
}

fn single_echo_window(samples: u32) -> Result<u32> {
    #[allow(clippy::cast_possible_truncation)]
    let ticks = (f64::from(samples)
        * timing::FSM_TICKS_PER_ADC_TICK
        * timing::SINGLE_ECHO_WINDOW_FACTOR)
        .round() as i64;
    to_register("delay2", ticks)
}

/// Register image of one frequency-sweep point.
///
/// Pulses and the first delay hold a harmless placeholder; the signal window
/// is twice the acquisition window (in FSM ticks) with the ADC window
/// centred in it.
///
/// # Errors
///
/// Returns `Config` for an odd or zero sample count.
pub fn compute_sweep_point(samples: u32) -> Result<PulseSequenceParams> {
    if samples == 0 || samples % 2 != 0 {
        return Err(NmrError::config(format!(
            "sweep sample count must be even and non-zero, got {samples}"
        )));
    }
    let delay2 = samples
        .checked_mul(8)
        .ok_or_else(|| NmrError::config("sweep sample count too large"))?;
    Ok(PulseSequenceParams {
        pulse1_ticks: timing::SWEEP_PLACEHOLDER_TICKS,
        delay1_ticks: timing::SWEEP_PLACEHOLDER_TICKS,
        pulse2_ticks: timing::SWEEP_PLACEHOLDER_TICKS,
        delay2_ticks: delay2,
        init_adc_delay_ticks: samples / 2,
        samples_per_echo: samples,
        echoes_per_scan: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CpmgRequest {
        CpmgRequest {
            base_freq_mhz: 2.0,
            pulse1_us: 5.0,
            pulse2_us: 10.0,
            echo_spacing_us: 50.0,
            samples_per_echo: 64,
            echoes_per_scan: 8,
            echo_shift_us: 0.0,
        }
    }

    #[test]
    fn clock_domains_follow_fixed_ratios() {
        let c = ClockDomains::from_base(2.0).unwrap();
        assert!((c.fsm_mhz - 32.0).abs() < 1e-12);
        assert!((c.adc_mhz - 8.0).abs() < 1e-12);
        assert!(ClockDomains::from_base(0.0).is_err());
        assert!(ClockDomains::from_base(f64::NAN).is_err());
    }

    #[test]
    fn end_to_end_tick_counts() {
        let t = compute_cpmg(&request(), &TimingLimits::default()).unwrap();
        assert_eq!(t.params.pulse2_ticks, 320);
        assert_eq!(t.params.delay2_ticks, 1280);
        assert_eq!(t.params.pulse1_ticks, 160);
        // 25 - 2.5 - 5 = 17.5 us
        assert_eq!(t.params.delay1_ticks, 560);
        // ((40 - 8) / 2) us * 8 MHz - 0.25
        assert_eq!(t.params.init_adc_delay_ticks, 128);
        assert!(!t.init_delay_clamped);
        assert!((t.echo_time_us() - 50.0).abs() < 1e-9);
        // (50 - 8) / 2 - 0 - 10/2 - 0
        assert!((t.excess_us - 16.0).abs() < 1e-9);
    }

    #[test]
    fn ticks_round_trip_within_one_tick() {
        for base in [1.0, 2.0, 4.3, 7.77] {
            for p in [0.0, 1.3, 5.0, 12.345] {
                let req = CpmgRequest {
                    base_freq_mhz: base,
                    pulse1_us: p,
                    pulse2_us: 2.0 * p,
                    echo_spacing_us: 200.0,
                    samples_per_echo: 32,
                    echoes_per_scan: 4,
                    echo_shift_us: 0.5,
                };
                let t = compute_cpmg(&req, &TimingLimits::default()).unwrap();
                let tick_us = 1.0 / t.clocks.fsm_mhz;
                assert!((t.clocks.fsm_us(t.params.pulse1_ticks) - p).abs() <= tick_us);
                assert!((t.clocks.fsm_us(t.params.pulse2_ticks) - 2.0 * p).abs() <= tick_us);
                let period = t.clocks.fsm_us(t.params.pulse2_ticks + t.params.delay2_ticks);
                assert!((period - 200.0).abs() <= tick_us);
            }
        }
    }

    #[test]
    fn decimation_must_divide_samples() {
        let mut req = request();
        req.samples_per_echo = 66;
        let err = compute_cpmg(&req, &TimingLimits::default()).unwrap_err();
        assert!(matches!(err, NmrError::Config { .. }));

        req.samples_per_echo = 2;
        let err = compute_cpmg(&req, &TimingLimits::default()).unwrap_err();
        assert!(err.to_string().contains("less than"));
    }

    #[test]
    fn acquisition_window_must_fit_before_next_pulse() {
        let mut req = request();
        // 336 samples at 8 MHz = 42 us > 50 - 10
        req.samples_per_echo = 336;
        let err = compute_cpmg(&req, &TimingLimits::default()).unwrap_err();
        assert!(err.to_string().contains("exceeds tE - p180"));
    }

    #[test]
    fn negative_margin_rejected() {
        let mut req = request();
        req.echo_shift_us = 17.0;
        let err = compute_cpmg(&req, &TimingLimits::default()).unwrap_err();
        assert!(err.to_string().contains("by 1.0 us"));

        let limits = TimingLimits {
            rx_delay_us: 20.0,
            ..TimingLimits::default()
        };
        assert!(compute_cpmg(&request(), &limits).is_err());
    }

    #[test]
    fn small_init_delay_is_flagged_not_rejected() {
        let mut req = request();
        req.echo_shift_us = -15.9;
        let t = compute_cpmg(&req, &TimingLimits::default()).unwrap();
        assert!(t.params.init_adc_delay_ticks < 2);
        assert!(t.init_delay_clamped);
        assert!((t.params.effective_init_delay() - 2.25).abs() < 1e-12);
    }

    #[test]
    fn rx_delay_is_quantised_to_adc_ticks() {
        let limits = TimingLimits {
            rx_delay_us: 1.06,
            ..TimingLimits::default()
        };
        let t = compute_cpmg(&request(), &limits).unwrap();
        assert_eq!(t.rx_delay_ticks, 8);
        assert!((t.rx_delay_us - 1.0).abs() < 1e-12);
    }

    #[test]
    fn effective_init_delay_erratum() {
        assert!((effective_init_delay(0) - 2.25).abs() < 1e-12);
        assert!((effective_init_delay(2) - 2.25).abs() < 1e-12);
        assert!((effective_init_delay(3) - 3.25).abs() < 1e-12);
    }

    #[test]
    fn fid_and_noise_images() {
        let fid = compute_fid(2.0, 10.0, 100, 4).unwrap().params;
        assert_eq!(fid.pulse1_ticks, 0);
        assert_eq!(fid.delay1_ticks, 0);
        assert_eq!(fid.pulse2_ticks, 320);
        assert_eq!(fid.delay2_ticks, 4000);
        assert_eq!(fid.init_adc_delay_ticks, 2);
        assert_eq!(fid.echoes_per_scan, 1);

        let noise = compute_noise(2.0, 100, 4).unwrap().params;
        assert_eq!(noise.pulse2_ticks, 0);
        assert_eq!(noise.delay2_ticks, 4000);
        assert_eq!(noise.init_adc_delay_ticks, 3);

        assert!(compute_fid(2.0, 10.0, 102, 4).is_err());
    }

    #[test]
    fn sweep_point_image() {
        let p = compute_sweep_point(200).unwrap();
        assert_eq!(p.delay2_ticks, 1600);
        assert_eq!(p.init_adc_delay_ticks, 100);
        assert_eq!(p.pulse1_ticks, 100);
        assert!(compute_sweep_point(201).is_err());
    }

    #[test]
    fn word_counts() {
        let t = compute_cpmg(&request(), &TimingLimits::default()).unwrap();
        assert_eq!(t.params.total_samples(), 512);
        assert_eq!(t.params.raw_words(), 256);
        assert_eq!(t.params.dconv_words(4), 256);
    }
}
