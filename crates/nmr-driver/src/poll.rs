// SPDX-License-Identifier: AGPL-3.0-only
//! Bounded polling and cooperative cancellation
//!
//! The hardware offers no interrupts to the HPS for any of the events the
//! core waits on (PLL lock, FSM done, DMA done), so every wait is a poll on
//! the calling thread. Each poll here is bounded by a [`Deadline`] measured
//! on an injected [`Clock`], and checks a [`CancelToken`] between
//! observations. Register write sequences are never interrupted.

use crate::clock::Clock;
use crate::error::{NmrError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag, cheap to clone and share with a signal
/// handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create an un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect at the next poll.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`NmrError::Cancelled`] if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once [`CancelToken::cancel`] has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(NmrError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Poll configuration
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Name used in timeout errors and logs
    pub operation: &'static str,
    /// Give up after this long
    pub timeout: Duration,
    /// Sleep between observations
    pub interval: Duration,
}

/// Point in time after which a wait is abandoned.
#[derive(Clone, Copy)]
pub struct Deadline<'c> {
    clock: &'c dyn Clock,
    started: Duration,
    limit: Duration,
    operation: &'static str,
}

impl<'c> Deadline<'c> {
    /// Start measuring `limit` from now.
    pub fn start(clock: &'c dyn Clock, operation: &'static str, limit: Duration) -> Self {
        Self {
            clock,
            started: clock.now(),
            limit,
            operation,
        }
    }

    /// Time spent since [`Deadline::start`].
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.started)
    }

    /// Fail with `HardwareTimeout` once the limit has elapsed.
    ///
    /// # Errors
    ///
    /// Returns `HardwareTimeout` naming the operation.
    pub fn check(&self) -> Result<()> {
        if self.elapsed() >= self.limit {
            tracing::warn!("{} timed out after {:?}", self.operation, self.limit);
            return Err(NmrError::timeout(self.operation, self.limit));
        }
        Ok(())
    }
}

/// Clock and cancel token shared by every wait of one acquisition.
#[derive(Clone)]
pub struct Waiter<'c> {
    clock: &'c dyn Clock,
    cancel: CancelToken,
}

impl<'c> Waiter<'c> {
    /// Create a waiter over `clock`.
    pub fn new(clock: &'c dyn Clock, cancel: CancelToken) -> Self {
        Self { clock, cancel }
    }

    /// Underlying clock.
    pub fn clock(&self) -> &'c dyn Clock {
        self.clock
    }

    /// Cancel token observed by polls.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fixed delay (settle time, scan spacing).
    pub fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            self.clock.sleep(duration);
        }
    }

    /// Start a deadline on this waiter's clock.
    pub fn deadline(&self, operation: &'static str, limit: Duration) -> Deadline<'c> {
        Deadline::start(self.clock, operation, limit)
    }

    /// Poll `probe` until it yields a value.
    ///
    /// The probe runs at least once, even with a zero timeout. Between
    /// observations the cancel token is checked, then the deadline, then the
    /// waiter sleeps for `config.interval`.
    ///
    /// # Errors
    ///
    /// Returns the probe's error, `Cancelled`, or `HardwareTimeout`.
    pub fn poll_until<T, F>(&self, config: &PollConfig, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Result<Option<T>>,
    {
        let deadline = self.deadline(config.operation, config.timeout);
        let mut polls: u64 = 0;
        loop {
            polls += 1;
            if let Some(value) = probe()? {
                tracing::trace!("{} complete after {polls} polls", config.operation);
                return Ok(value);
            }
            self.cancel.check()?;
            deadline.check()?;
            self.clock.sleep(config.interval);
        }
    }
}
