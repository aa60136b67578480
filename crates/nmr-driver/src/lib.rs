// SPDX-License-Identifier: AGPL-3.0-only
//! Control and acquisition core for the FPGA/HPS NMR spectrometer.
//!
//! The HPS programs a pulse-sequence state machine in the FPGA fabric over
//! memory-mapped registers, starts it, waits for it, and pulls the sampled
//! echoes out of the on-chip FIFOs. This crate owns that whole path:
//!
//! ```text
//! CpmgRequest ─► params (ticks) ─► fsm::Sequencer ─► dma / fifo ─► ScanData
//!                                                                   │
//!                          RunSummary ◄─ accumulate::IterationEngine ◄─┘
//! ```
//!
//! All register traffic goes through [`RegisterAccess`]. On the board that is
//! a [`PhysicalRegion`] over `/dev/mem`; in tests it is a [`SimulatedFpga`],
//! so every sequence can be exercised without hardware.
//!
//! # Quick start
//!
//! ```no_run
//! use nmr_driver::prelude::*;
//! use nmr_fpga::bridge;
//!
//! # fn main() -> nmr_driver::Result<()> {
//! let lw = PhysicalRegion::map(bridge::LW_H2F_BASE, bridge::LW_H2F_SPAN)?;
//! let axi = PhysicalRegion::map(bridge::H2F_BASE, bridge::H2F_SPAN)?;
//! let hw = HardwareMap::new(&lw, &axi);
//! let clock = SystemClock::new();
//! let waiter = Waiter::new(&clock, CancelToken::new());
//! let config = DriverConfig::from_env()?;
//! let pll = FabricPll::new(
//!     hw.ctrl_out,
//!     hw.ctrl_in,
//!     hw.sys_pll,
//!     hw.analyzer_pll,
//!     waiter.clone(),
//!     config.pll_timing(),
//! );
//! let mut ctrl = ControlRegisterState::load(&hw.ctrl_out)?;
//! let mut runner = AcquisitionRunner::new(hw, waiter, config, pll);
//! let req = CpmgRequest {
//!     base_freq_mhz: 4.3,
//!     pulse1_us: 5.0,
//!     pulse2_us: 10.0,
//!     echo_spacing_us: 100.0,
//!     samples_per_echo: 64,
//!     echoes_per_scan: 32,
//!     echo_shift_us: 0.0,
//! };
//! let (_timing, summary) =
//!     runner.cpmg_iterate(&mut ctrl, &req, &ScanOptions::default(), 16, &mut NoopObserver)?;
//! println!("{} scans, {} discarded", summary.completed, summary.discarded);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod accumulate;
pub mod acquisition;
pub mod clock;
pub mod config;
pub mod control;
pub mod dma;
mod error;
pub mod fifo;
pub mod fsm;
pub mod hwmap;
pub mod i2c;
pub mod mmio;
pub mod params;
pub mod persist;
pub mod pll;
pub mod poll;
pub mod sim;
pub mod spi;
pub mod system;

pub use accumulate::{
    iteration_sign, Accumulator, IterationEngine, IterationObserver, NoopObserver, RunSummary,
};
pub use acquisition::{AcquisitionRunner, ScanData, ScanOptions, ShotPlan, SweepRequest};
pub use clock::{Clock, SystemClock};
pub use config::{CaptureMode, DriverConfig, Retrieval};
pub use control::ControlRegisterState;
pub use dma::{CompletionReason, DmaCompletion, DmaEngine, DmaTiming};
pub use error::{NmrError, Result};
pub use fsm::{ClockPlan, FsmState, FsmTiming, PhaseMode, Sequencer};
pub use hwmap::HardwareMap;
pub use i2c::{I2cRelayBank, RelayBankState};
pub use mmio::{Peripheral, PhysicalRegion, RegisterAccess};
pub use params::{
    compute_cpmg, compute_fid, compute_noise, compute_sweep_point, ClockDomains, CpmgRequest,
    CpmgTiming, PulseSequenceParams, SingleEchoTiming, TimingLimits,
};
pub use persist::{ParameterRecord, RunDirectory, ScanWriter};
pub use pll::{FabricPll, PllBlock, PllControl, PllTiming};
pub use poll::{CancelToken, PollConfig, Waiter};
pub use sim::{SimClock, SimPll, SimulatedFpga};
pub use spi::{Ad5724r, DacChannel, DacWiring, SpiMaster};
pub use system::{close_system, init_defaults, SessionSetup, SweepKind};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AcquisitionRunner, CancelToken, ControlRegisterState, CpmgRequest, DriverConfig,
        FabricPll, HardwareMap, IterationObserver, NmrError, NoopObserver, PhysicalRegion,
        Result, RunDirectory, ScanData, ScanOptions, SessionSetup, SweepRequest, SystemClock,
        Waiter,
    };
}
