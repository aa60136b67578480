// SPDX-License-Identifier: AGPL-3.0-only
//! Driver configuration
//!
//! Every bound, delay and strategy switch the sequencing code uses lives in
//! [`DriverConfig`]. [`DriverConfig::default`] gives the values the hardware
//! was commissioned with; [`DriverConfig::from_env`] overlays `NMR_*`
//! environment variables:
//!
//! | Variable | Field | Format |
//! |----------|-------|--------|
//! | `NMR_PLL_LOCK_TIMEOUT_MS` | `pll_lock_timeout` | integer ms |
//! | `NMR_FSM_TIMEOUT_MS` | `fsm_timeout` | integer ms |
//! | `NMR_DMA_TIMEOUT_MS` | `dma_timeout` | integer ms |
//! | `NMR_DMA_BACKOFF_MS` | `dma_busy_backoff` | integer ms |
//! | `NMR_DECIMATION` | `decimation` | integer ≥ 1 |
//! | `NMR_RX_DELAY_US` | `rx_delay_us` | float |
//! | `NMR_CAPTURE` | `capture` | `raw`, `dconv` or `both` |
//! | `NMR_RETRIEVAL` | `retrieval` | `dma` or `fifo` |
//! | `NMR_DAC_ATTEMPTS` | `dac_max_attempts` | integer ≥ 1 |
//! | `NMR_DAC_SDO` | `dac_sdo_wired` | `0`/`1`/`true`/`false` |
//! | `NMR_DAC_LDAC` | `dac_ldac_wired` | `0`/`1`/`true`/`false` |
//! | `NMR_WRITE_SCANS` | `write_scans` | `0`/`1`/`true`/`false` |

use crate::error::{NmrError, Result};
use crate::params::TimingLimits;
use crate::pll::PllTiming;
use nmr_fpga::timing;
use std::str::FromStr;
use std::time::Duration;

/// Which FIFO channels an acquisition reads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureMode {
    /// Raw 14-bit ADC samples
    pub raw: bool,
    /// Downconverted, decimated I/Q words
    pub downconverted: bool,
}

impl CaptureMode {
    /// Raw channel only.
    pub const RAW: Self = Self {
        raw: true,
        downconverted: false,
    };
    /// Downconverted channel only.
    pub const DCONV: Self = Self {
        raw: false,
        downconverted: true,
    };
    /// Both channels.
    pub const BOTH: Self = Self {
        raw: true,
        downconverted: true,
    };
}

impl Default for CaptureMode {
    fn default() -> Self {
        Self::BOTH
    }
}

impl FromStr for CaptureMode {
    type Err = NmrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::RAW),
            "dconv" => Ok(Self::DCONV),
            "both" => Ok(Self::BOTH),
            other => Err(NmrError::config(format!(
                "unknown capture mode '{other}' (expected raw, dconv or both)"
            ))),
        }
    }
}

/// How captured words reach the HPS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retrieval {
    /// FIFO → staging SDRAM by the DMA engines, then read from SDRAM
    #[default]
    Dma,
    /// Wait for the sequence to finish, then pop the FIFO word by word
    DirectFifo,
}

impl FromStr for Retrieval {
    type Err = NmrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dma" => Ok(Self::Dma),
            "fifo" => Ok(Self::DirectFifo),
            other => Err(NmrError::config(format!(
                "unknown retrieval strategy '{other}' (expected dma or fifo)"
            ))),
        }
    }
}

/// Driver tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Bound on PLL lock after reset
    pub pll_lock_timeout: Duration,
    /// Bound on one PLL reconfiguration
    pub pll_reconfig_timeout: Duration,
    /// Bound on the sequence-running bit clearing
    pub fsm_timeout: Duration,
    /// Bound on a DMA transfer
    pub dma_timeout: Duration,
    /// Sleep inserted whenever a DMA engine reports BUSY
    pub dma_busy_backoff: Duration,
    /// Interval between status polls
    pub poll_interval: Duration,
    /// Hold and settle time of reset pulses
    pub settle: Duration,
    /// Wait between sequence end and a direct FIFO drain
    pub fifo_drain_settle: Duration,
    /// Channels read back
    pub capture: CaptureMode,
    /// Retrieval strategy for CPMG/FID/noise
    pub retrieval: Retrieval,
    /// Downconversion decimation factor
    pub decimation: u32,
    /// Receiver enable delay, µs
    pub rx_delay_us: f64,
    /// Acquisition-window guard, RF periods
    pub guard_rf_periods: f64,
    /// Bound on one SPI transfer
    pub spi_timeout: Duration,
    /// Pause after an I2C command sequence
    pub i2c_settle: Duration,
    /// Write-verify attempts for the preamp DAC
    pub dac_max_attempts: u32,
    /// Whether the DAC SDO line is wired (enables write-verify)
    pub dac_sdo_wired: bool,
    /// Whether the DAC LDAC line is wired (enables the load pulse)
    pub dac_ldac_wired: bool,
    /// Pause between frequency sweep points
    pub sweep_point_gap: Duration,
    /// Write every scan to its own `dat_NNN` file
    pub write_scans: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pll_lock_timeout: Duration::from_secs(1),
            pll_reconfig_timeout: Duration::from_millis(100),
            fsm_timeout: Duration::from_secs(30),
            dma_timeout: Duration::from_secs(30),
            dma_busy_backoff: Duration::from_millis(500),
            poll_interval: Duration::from_micros(1),
            settle: Duration::from_micros(10),
            fifo_drain_settle: Duration::from_micros(300),
            capture: CaptureMode::BOTH,
            retrieval: Retrieval::Dma,
            decimation: timing::DEFAULT_DECIMATION,
            rx_delay_us: 0.0,
            guard_rf_periods: timing::ACQ_GUARD_RF_PERIODS,
            spi_timeout: Duration::from_millis(100),
            i2c_settle: Duration::from_millis(10),
            dac_max_attempts: 5,
            dac_sdo_wired: false,
            dac_ldac_wired: false,
            sweep_point_gap: Duration::from_micros(100),
            write_scans: false,
        }
    }
}

impl DriverConfig {
    /// Defaults overlaid with `NMR_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a malformed value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a malformed value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        let millis = |key: &str| -> Result<Option<Duration>> {
            lookup(key)
                .map(|v| parse::<u64>(key, &v).map(Duration::from_millis))
                .transpose()
        };
        let flag = |key: &str| -> Result<Option<bool>> {
            lookup(key).map(|v| parse_bool(key, &v)).transpose()
        };

        if let Some(d) = millis("NMR_PLL_LOCK_TIMEOUT_MS")? {
            cfg.pll_lock_timeout = d;
        }
        if let Some(d) = millis("NMR_FSM_TIMEOUT_MS")? {
            cfg.fsm_timeout = d;
        }
        if let Some(d) = millis("NMR_DMA_TIMEOUT_MS")? {
            cfg.dma_timeout = d;
        }
        if let Some(d) = millis("NMR_DMA_BACKOFF_MS")? {
            cfg.dma_busy_backoff = d;
        }
        if let Some(v) = lookup("NMR_DECIMATION") {
            cfg.decimation = parse("NMR_DECIMATION", &v)?;
        }
        if let Some(v) = lookup("NMR_RX_DELAY_US") {
            cfg.rx_delay_us = parse("NMR_RX_DELAY_US", &v)?;
        }
        if let Some(v) = lookup("NMR_CAPTURE") {
            cfg.capture = v.parse()?;
        }
        if let Some(v) = lookup("NMR_RETRIEVAL") {
            cfg.retrieval = v.parse()?;
        }
        if let Some(v) = lookup("NMR_DAC_ATTEMPTS") {
            cfg.dac_max_attempts = parse("NMR_DAC_ATTEMPTS", &v)?;
        }
        if let Some(b) = flag("NMR_DAC_SDO")? {
            cfg.dac_sdo_wired = b;
        }
        if let Some(b) = flag("NMR_DAC_LDAC")? {
            cfg.dac_ldac_wired = b;
        }
        if let Some(b) = flag("NMR_WRITE_SCANS")? {
            cfg.write_scans = b;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values no acquisition can run with.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.decimation == 0 {
            return Err(NmrError::config("decimation must be at least 1"));
        }
        if self.dac_max_attempts == 0 {
            return Err(NmrError::config("DAC write attempts must be at least 1"));
        }
        if !self.rx_delay_us.is_finite() || self.rx_delay_us < 0.0 {
            return Err(NmrError::config("rx delay must be a non-negative number"));
        }
        if !self.capture.raw && !self.capture.downconverted {
            return Err(NmrError::config("capture mode selects no channel"));
        }
        Ok(())
    }

    /// PLL timing derived from this configuration.
    pub fn pll_timing(&self) -> PllTiming {
        PllTiming {
            lock_timeout: self.pll_lock_timeout,
            reconfig_timeout: self.pll_reconfig_timeout,
            poll_interval: self.poll_interval,
            reset_hold: self.settle,
        }
    }

    /// Parameter calculator limits derived from this configuration.
    pub fn timing_limits(&self) -> TimingLimits {
        TimingLimits {
            decimation: self.decimation,
            rx_delay_us: self.rx_delay_us,
            guard_rf_periods: self.guard_rf_periods,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| NmrError::config(format!("{key}: cannot parse '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(NmrError::config(format!("{key}: '{value}' is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_hardware() {
        let cfg = DriverConfig::default();
        assert_eq!(cfg.dma_busy_backoff, Duration::from_millis(500));
        assert_eq!(cfg.decimation, 4);
        assert_eq!(cfg.capture, CaptureMode::BOTH);
        assert_eq!(cfg.retrieval, Retrieval::Dma);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn environment_overrides() {
        let cfg = DriverConfig::from_lookup(lookup(&[
            ("NMR_DMA_TIMEOUT_MS", "250"),
            ("NMR_DECIMATION", "8"),
            ("NMR_CAPTURE", "raw"),
            ("NMR_RETRIEVAL", "FIFO"),
            ("NMR_DAC_SDO", "1"),
        ]))
        .unwrap();
        assert_eq!(cfg.dma_timeout, Duration::from_millis(250));
        assert_eq!(cfg.decimation, 8);
        assert_eq!(cfg.capture, CaptureMode::RAW);
        assert_eq!(cfg.retrieval, Retrieval::DirectFifo);
        assert!(cfg.dac_sdo_wired);
        assert_eq!(cfg.timing_limits().decimation, 8);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        for pairs in [
            [("NMR_DECIMATION", "four")],
            [("NMR_DECIMATION", "0")],
            [("NMR_CAPTURE", "all")],
            [("NMR_DAC_LDAC", "maybe")],
            [("NMR_PLL_LOCK_TIMEOUT_MS", "-1")],
        ] {
            let err = DriverConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, NmrError::Config { .. }), "{pairs:?}");
        }
    }
}
