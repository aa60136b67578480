// SPDX-License-Identifier: AGPL-3.0-only
//! Iteration and accumulation engine
//!
//! Runs N single-shot acquisitions and folds each into running sums. With
//! phase cycling, iterations are signed by parity (1-indexed: odd adds,
//! even subtracts) so that artifacts which do not follow the RF phase
//! cancel out. Only the sums survive an iteration; scans are handed to the
//! observer and dropped.
//!
//! Errors are classified with [`NmrError::is_iteration_local`]: a bad
//! scan is skipped and the run goes on, anything else ends the run.

use crate::acquisition::ScanData;
use crate::error::{NmrError, Result};
use crate::poll::CancelToken;

/// Sign applied to iteration `iteration` (1-indexed).
pub fn iteration_sign(iteration: u32, phase_cycle: bool) -> i64 {
    if phase_cycle && iteration % 2 == 0 {
        -1
    } else {
        1
    }
}

/// Running sums of one multi-iteration run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Accumulator {
    raw_sum: Option<Vec<i64>>,
    dconv_sum: Option<Vec<i64>>,
}

impl Accumulator {
    /// Zeroed sums for the enabled channels.
    pub fn new(raw_len: Option<usize>, dconv_len: Option<usize>) -> Self {
        Self {
            raw_sum: raw_len.map(|n| vec![0; n]),
            dconv_sum: dconv_len.map(|n| vec![0; n]),
        }
    }

    /// Raw-channel sum, if that channel is captured.
    pub fn raw_sum(&self) -> Option<&[i64]> {
        self.raw_sum.as_deref()
    }

    /// Downconverted-channel sum, if that channel is captured.
    pub fn dconv_sum(&self) -> Option<&[i64]> {
        self.dconv_sum.as_deref()
    }

    /// Add `scan × sign` to the sums.
    ///
    /// Every channel is checked before anything is added, so a rejected
    /// scan leaves the sums untouched.
    ///
    /// # Errors
    ///
    /// `DataIntegrity` if a captured channel is missing or has the wrong
    /// length.
    pub fn apply(&mut self, scan: &ScanData, sign: i64) -> Result<()> {
        check_len(self.raw_sum.as_deref(), scan.raw.as_ref().map(Vec::len))?;
        check_len(self.dconv_sum.as_deref(), scan.dconv.as_ref().map(Vec::len))?;

        if let (Some(sum), Some(raw)) = (self.raw_sum.as_mut(), scan.raw.as_ref()) {
            for (acc, &s) in sum.iter_mut().zip(raw) {
                *acc += sign * i64::from(s);
            }
        }
        if let (Some(sum), Some(dconv)) = (self.dconv_sum.as_mut(), scan.dconv.as_ref()) {
            for (acc, &s) in sum.iter_mut().zip(dconv) {
                *acc += sign * i64::from(s);
            }
        }
        Ok(())
    }
}

fn check_len(sum: Option<&[i64]>, captured: Option<usize>) -> Result<()> {
    match sum {
        Some(sum) if captured != Some(sum.len()) => {
            Err(NmrError::integrity(captured.unwrap_or(0), sum.len()))
        }
        _ => Ok(()),
    }
}

/// Hooks called while a run progresses. Every method defaults to a no-op.
pub trait IterationObserver {
    /// Completion crossed another 10 percentage points (and at 100%).
    fn on_progress(&mut self, _percent: f64) {}

    /// A scan was accepted into the sums.
    ///
    /// # Errors
    ///
    /// An error here aborts the run.
    fn on_scan(&mut self, _iteration: u32, _scan: &ScanData) -> Result<()> {
        Ok(())
    }

    /// A scan was discarded.
    fn on_discard(&mut self, _iteration: u32, _error: &NmrError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl IterationObserver for NoopObserver {}

/// Outcome of [`IterationEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Scans folded into the sums
    pub completed: u32,
    /// Scans dropped for iteration-local errors
    pub discarded: u32,
    /// Final sums
    pub accumulator: Accumulator,
}

/// Step between progress reports, percentage points.
const PROGRESS_STEP: f64 = 10.0;

/// Repeats a single-shot acquisition and accumulates the results.
#[derive(Debug, Clone)]
pub struct IterationEngine {
    iterations: u32,
    phase_cycle: bool,
    cancel: CancelToken,
}

impl IterationEngine {
    /// Engine for `iterations` scans.
    pub fn new(iterations: u32, phase_cycle: bool) -> Self {
        Self {
            iterations,
            phase_cycle,
            cancel: CancelToken::new(),
        }
    }

    /// Stop between iterations once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every iteration, calling `acquire(i)` for i in `1..=N`.
    ///
    /// # Errors
    ///
    /// The first error that is not iteration-local (timeouts, bus errors,
    /// cancellation, observer failures). Sums gathered so far are dropped
    /// with it.
    pub fn run<F>(
        &self,
        mut accumulator: Accumulator,
        mut acquire: F,
        observer: &mut dyn IterationObserver,
    ) -> Result<RunSummary>
    where
        F: FnMut(u32) -> Result<ScanData>,
    {
        let mut completed = 0;
        let mut discarded = 0;
        let mut reported = 0.0;

        for i in 1..=self.iterations {
            self.cancel.check()?;

            let accepted = acquire(i).and_then(|scan| {
                accumulator.apply(&scan, iteration_sign(i, self.phase_cycle))?;
                Ok(scan)
            });
            match accepted {
                Ok(scan) => {
                    completed += 1;
                    observer.on_scan(i, &scan)?;
                }
                Err(e) if e.is_iteration_local() => {
                    tracing::warn!("Iteration {i} discarded: {e}");
                    discarded += 1;
                    observer.on_discard(i, &e);
                }
                Err(e) => {
                    tracing::error!("Run aborted at iteration {i}: {e}");
                    return Err(e);
                }
            }

            let percent = f64::from(i) * 100.0 / f64::from(self.iterations);
            if percent >= reported + PROGRESS_STEP || i == self.iterations {
                tracing::info!("Progress: {percent:.0}%");
                observer.on_progress(percent);
                reported = percent;
            }
        }

        Ok(RunSummary {
            completed,
            discarded,
            accumulator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scan(v: u16, n: usize) -> ScanData {
        ScanData {
            raw: Some(vec![v; n]),
            dconv: Some(vec![i32::from(v); n / 2]),
        }
    }

    #[test]
    fn parity_rule() {
        assert_eq!(iteration_sign(1, true), 1);
        assert_eq!(iteration_sign(2, true), -1);
        assert_eq!(iteration_sign(3, true), 1);
        assert_eq!(iteration_sign(2, false), 1);
    }

    #[test]
    fn phase_cycled_constant_cancels() {
        let engine = IterationEngine::new(4, true);
        let summary = engine
            .run(
                Accumulator::new(Some(8), Some(4)),
                |_| Ok(scan(7, 8)),
                &mut NoopObserver,
            )
            .unwrap();
        assert_eq!(summary.completed, 4);
        assert!(summary.accumulator.raw_sum().unwrap().iter().all(|&s| s == 0));
        assert!(summary.accumulator.dconv_sum().unwrap().iter().all(|&s| s == 0));
    }

    #[test]
    fn plain_accumulation_adds() {
        let engine = IterationEngine::new(4, false);
        let summary = engine
            .run(
                Accumulator::new(Some(8), None),
                |_| Ok(scan(7, 8)),
                &mut NoopObserver,
            )
            .unwrap();
        assert_eq!(summary.accumulator.raw_sum().unwrap(), &[28; 8]);
        assert!(summary.accumulator.dconv_sum().is_none());
    }

    #[test]
    fn wrong_length_leaves_sums_untouched() {
        let mut acc = Accumulator::new(Some(8), Some(4));
        acc.apply(&scan(3, 8), 1).unwrap();
        let before = acc.clone();

        let bad = ScanData {
            raw: Some(vec![1; 8]),
            dconv: Some(vec![1; 3]),
        };
        let err = acc.apply(&bad, 1).unwrap_err();
        assert!(matches!(err, NmrError::DataIntegrity { captured: 3, requested: 4 }));
        assert_eq!(acc, before);

        let missing = ScanData {
            raw: None,
            dconv: Some(vec![1; 4]),
        };
        assert!(acc.apply(&missing, 1).is_err());
        assert_eq!(acc, before);
    }

    #[test]
    fn local_errors_skip_the_scan() {
        let engine = IterationEngine::new(3, false);
        let summary = engine
            .run(
                Accumulator::new(Some(2), None),
                |i| {
                    if i == 2 {
                        Err(NmrError::integrity(1, 2))
                    } else {
                        Ok(ScanData {
                            raw: Some(vec![5, 5]),
                            dconv: None,
                        })
                    }
                },
                &mut NoopObserver,
            )
            .unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.discarded, 1);
        assert_eq!(summary.accumulator.raw_sum().unwrap(), &[10, 10]);
    }

    #[test]
    fn timeout_aborts_run() {
        let engine = IterationEngine::new(5, false);
        let mut calls = 0;
        let err = engine
            .run(
                Accumulator::new(Some(2), None),
                |_| {
                    calls += 1;
                    Err(NmrError::timeout("dma_raw", Duration::from_secs(1)))
                },
                &mut NoopObserver,
            )
            .unwrap_err();
        assert!(matches!(err, NmrError::HardwareTimeout { .. }));
        assert_eq!(calls, 1);
    }

    #[derive(Default)]
    struct Recorder {
        progress: Vec<f64>,
        scans: Vec<u32>,
        discards: Vec<u32>,
    }

    impl IterationObserver for Recorder {
        fn on_progress(&mut self, percent: f64) {
            self.progress.push(percent);
        }

        fn on_scan(&mut self, iteration: u32, _scan: &ScanData) -> Result<()> {
            self.scans.push(iteration);
            Ok(())
        }

        fn on_discard(&mut self, iteration: u32, _error: &NmrError) {
            self.discards.push(iteration);
        }
    }

    #[test]
    fn progress_in_ten_point_steps() {
        let mut rec = Recorder::default();
        IterationEngine::new(40, false)
            .run(
                Accumulator::new(Some(2), None),
                |_| {
                    Ok(ScanData {
                        raw: Some(vec![0, 0]),
                        dconv: None,
                    })
                },
                &mut rec,
            )
            .unwrap();
        assert_eq!(
            rec.progress,
            vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0]
        );
        assert_eq!(rec.scans.len(), 40);
        assert!(rec.discards.is_empty());
    }

    #[test]
    fn cancel_stops_between_iterations() {
        let token = CancelToken::new();
        token.cancel();
        let err = IterationEngine::new(3, false)
            .with_cancel(token)
            .run(Accumulator::default(), |_| Ok(ScanData::default()), &mut NoopObserver)
            .unwrap_err();
        assert!(matches!(err, NmrError::Cancelled));
    }
}
