// SPDX-License-Identifier: AGPL-3.0-only
//! DMA transfer manager
//!
//! Each FIFO has its own legacy Avalon DMA controller moving 32-bit words
//! into the staging SDRAM. Transfers are length-terminated: the engine
//! counts `LENGTH` down to zero while the read address stays constant (the
//! FIFO port).
//!
//! There is no interrupt path to the HPS, so [`DmaEngine::wait_done`] polls
//! the status register. Completion means DONE set **and** BUSY clear; a
//! status reading both is still in flight. Whenever BUSY is seen the poll
//! backs off for a fixed interval, which is the only flow control between
//! the HPS and the bus.

use crate::error::Result;
use crate::mmio::Peripheral;
use crate::poll::{PollConfig, Waiter};
use nmr_fpga::dma::{self as reg, control, status};
use std::time::Duration;

/// Why a DMA transfer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// End-of-packet on the read side
    ReadEndOfPacket,
    /// End-of-packet on the write side
    WriteEndOfPacket,
    /// The length counter reached zero
    LengthExhausted,
}

/// Final state of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCompletion {
    /// Status register at completion
    pub status: u32,
    /// `LENGTH` register at completion, bytes not transferred
    pub residual_bytes: u32,
    /// Status observations made
    pub polls: u64,
    /// Observations that reported BUSY
    pub busy_observations: u64,
}

impl DmaCompletion {
    /// Completion reasons flagged in the status word.
    pub fn reasons(&self) -> Vec<CompletionReason> {
        [
            (status::REOP, CompletionReason::ReadEndOfPacket),
            (status::WEOP, CompletionReason::WriteEndOfPacket),
            (status::LEN, CompletionReason::LengthExhausted),
        ]
        .into_iter()
        .filter(|(mask, _)| self.status & mask != 0)
        .map(|(_, reason)| reason)
        .collect()
    }

    /// Words actually moved out of `requested`.
    pub fn transferred_words(&self, requested: usize) -> usize {
        requested.saturating_sub(self.residual_bytes as usize / 4)
    }
}

/// Poll bounds for [`DmaEngine::wait_done`].
#[derive(Debug, Clone, Copy)]
pub struct DmaTiming {
    /// Give up after this long
    pub timeout: Duration,
    /// Interval between observations when not busy
    pub poll_interval: Duration,
    /// Sleep after each BUSY observation
    pub busy_backoff: Duration,
}

/// One DMA controller.
#[derive(Debug, Clone, Copy)]
pub struct DmaEngine<'a> {
    regs: Peripheral<'a>,
}

impl<'a> DmaEngine<'a> {
    /// Wrap the controller at `regs`.
    pub fn new(regs: Peripheral<'a>) -> Self {
        Self { regs }
    }

    /// Software reset. The controller only honours the reset bit when it is
    /// written twice in a row.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn reset(&self) -> Result<()> {
        self.regs.write(reg::CONTROL, control::SWRST)?;
        self.regs.write(reg::CONTROL, control::SWRST)
    }

    /// Reset the controller and start a FIFO → memory transfer of
    /// `length_words` 32-bit words.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn transfer(&self, read_addr: u32, write_addr: u32, length_words: u32) -> Result<()> {
        tracing::debug!(
            "{}: {length_words} words {read_addr:#x} -> {write_addr:#x}",
            self.regs.name()
        );
        self.reset()?;
        self.regs.write(reg::STATUS, 0)?;
        self.regs.write(reg::READADDR, read_addr)?;
        self.regs.write(reg::WRITEADDR, write_addr)?;
        self.regs.write(reg::LENGTH, length_words.saturating_mul(4))?;
        self.regs.write(reg::CONTROL, reg::FIFO_TO_MEM)?;
        self.regs.write(reg::CONTROL, reg::FIFO_TO_MEM | control::GO)
    }

    /// Block until DONE is set and BUSY is clear.
    ///
    /// # Errors
    ///
    /// `HardwareTimeout` if the transfer does not complete in time,
    /// `Cancelled`, or bus errors.
    pub fn wait_done(&self, waiter: &Waiter<'_>, timing: &DmaTiming) -> Result<DmaCompletion> {
        let mut polls = 0u64;
        let mut busy_observations = 0u64;
        let status = waiter.poll_until(
            &PollConfig {
                operation: self.regs.name(),
                timeout: timing.timeout,
                interval: timing.poll_interval,
            },
            || {
                polls += 1;
                let s = self.regs.read(reg::STATUS)?;
                if s & status::BUSY != 0 {
                    busy_observations += 1;
                    tracing::trace!("{} busy (status {s:#x})", self.regs.name());
                    waiter.sleep(timing.busy_backoff);
                    return Ok(None);
                }
                Ok((s & status::DONE != 0).then_some(s))
            },
        )?;
        let residual_bytes = self.regs.read(reg::LENGTH)?;

        let done = DmaCompletion {
            status,
            residual_bytes,
            polls,
            busy_observations,
        };
        tracing::debug!(
            "{} done: {:?}, {residual_bytes} bytes left, {busy_observations} busy polls",
            self.regs.name(),
            done.reasons()
        );
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NmrError;
    use crate::mmio::RegisterAccess;
    use crate::poll::CancelToken;
    use crate::sim::SimClock;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// Status register that replays a script, then repeats its last value.
    struct Scripted {
        status: RefCell<VecDeque<u32>>,
        writes: RefCell<Vec<(usize, u32)>>,
    }

    impl Scripted {
        fn new(script: &[u32]) -> Self {
            Self {
                status: RefCell::new(script.iter().copied().collect()),
                writes: RefCell::default(),
            }
        }
    }

    impl RegisterAccess for Scripted {
        fn read_word(&self, offset: usize) -> Result<u32> {
            if offset != reg::STATUS {
                return Ok(0);
            }
            let mut q = self.status.borrow_mut();
            Ok(if q.len() > 1 {
                q.pop_front().unwrap_or(0)
            } else {
                q.front().copied().unwrap_or(0)
            })
        }

        fn write_word(&self, offset: usize, value: u32) -> Result<()> {
            self.writes.borrow_mut().push((offset, value));
            Ok(())
        }
    }

    fn timing() -> DmaTiming {
        DmaTiming {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_micros(1),
            busy_backoff: Duration::from_millis(500),
        }
    }

    #[test]
    fn transfer_programs_controller_in_order() {
        let bus = Scripted::new(&[0]);
        let dma = DmaEngine::new(Peripheral::new(&bus, 0, "dma"));
        dma.transfer(0x4000, 0x100, 256).unwrap();
        assert_eq!(
            *bus.writes.borrow(),
            vec![
                (reg::CONTROL, control::SWRST),
                (reg::CONTROL, control::SWRST),
                (reg::STATUS, 0),
                (reg::READADDR, 0x4000),
                (reg::WRITEADDR, 0x100),
                (reg::LENGTH, 1024),
                (reg::CONTROL, reg::FIFO_TO_MEM),
                (reg::CONTROL, reg::FIFO_TO_MEM | control::GO),
            ]
        );
    }

    #[test]
    fn busy_and_done_is_not_complete() {
        let both = status::DONE | status::BUSY;
        let bus = Scripted::new(&[both, both, status::DONE | status::LEN]);
        let clock = SimClock::new();
        let waiter = Waiter::new(&clock, CancelToken::new());
        let dma = DmaEngine::new(Peripheral::new(&bus, 0, "dma"));

        let done = dma.wait_done(&waiter, &timing()).unwrap();
        assert_eq!(done.polls, 3);
        assert_eq!(done.busy_observations, 2);
        assert_eq!(done.reasons(), vec![CompletionReason::LengthExhausted]);
        // two backoffs plus two poll intervals
        assert_eq!(
            clock.now(),
            Duration::from_millis(1000) + Duration::from_micros(2)
        );
    }

    #[test]
    fn never_done_times_out() {
        let bus = Scripted::new(&[status::DONE | status::BUSY]);
        let clock = SimClock::new();
        let waiter = Waiter::new(&clock, CancelToken::new());
        let dma = DmaEngine::new(Peripheral::new(&bus, 0, "dma"));
        let err = dma.wait_done(&waiter, &timing()).unwrap_err();
        assert!(matches!(err, NmrError::HardwareTimeout { .. }));
    }

    #[test]
    fn transferred_words_from_residual() {
        let done = DmaCompletion {
            status: status::DONE | status::REOP,
            residual_bytes: 8,
            polls: 1,
            busy_observations: 0,
        };
        assert_eq!(done.transferred_words(100), 98);
        assert_eq!(done.reasons(), vec![CompletionReason::ReadEndOfPacket]);
    }
}
