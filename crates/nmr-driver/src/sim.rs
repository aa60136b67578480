// SPDX-License-Identifier: AGPL-3.0-only
//! Simulated FPGA
//!
//! An in-memory model of the register map, good enough to run every
//! acquisition mode end to end without hardware:
//!
//! - plain registers read back what was written;
//! - a rising edge on `FSM_START` fills both FIFOs from the programmed
//!   `SAMPLES_PER_ECHO`, `ECHOES_PER_SCAN` and `DEC_FACT` registers and
//!   holds `NMR_SEQ_RUN` for a configurable number of status reads;
//! - `ADC_FIFO_RST` empties the FIFOs; PLL lock bits drop while the PLL
//!   reset is asserted and return when it is released;
//! - each DMA controller honours `SWRST`, moves FIFO words into the staging
//!   SDRAM on `GO`, and reports `LENGTH` residue when the FIFO ran short;
//! - the SPI masters are always ready and the AD5724R answers readbacks;
//! - the I2C interrupt status register is write-one-to-clear.
//!
//! Every write is logged in order, so tests can assert on register
//! sequencing. [`SimClock`] is a virtual clock that only advances when
//! something sleeps.
//!
//! The model is single-threaded (`RefCell`), like the driver.

use crate::clock::Clock;
use crate::control::ControlRegisterState;
use crate::error::{NmrError, Result};
use crate::mmio::RegisterAccess;
use crate::pll::{PllBlock, PllControl};
use nmr_fpga::regs::{self, ctrl_in, ctrl_out};
use nmr_fpga::{dac, dma, fifo, i2c, pll, spi};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// Bridge a logged write went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Lightweight HPS-to-FPGA bridge
    Lightweight,
    /// HPS-to-FPGA AXI bridge
    Axi,
}

/// One logged register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    /// Bridge window
    pub window: Window,
    /// Byte offset in the window
    pub offset: usize,
    /// Value written
    pub value: u32,
}

#[derive(Debug, Default)]
struct DmaModel {
    status: u32,
    read_addr: u32,
    write_addr: u32,
    length: u32,
    busy_left: u32,
}

#[derive(Debug)]
struct State {
    regs: HashMap<usize, u32>,
    sdram: HashMap<usize, u32>,
    writes: Vec<WriteRecord>,

    raw_fifo: VecDeque<u32>,
    dconv_fifo: VecDeque<u32>,
    run_left: u32,
    sys_locked: bool,
    analyzer_locked: bool,
    dma_raw: DmaModel,
    dma_dconv: DmaModel,
    i2c_isr: u32,
    dac_regs: HashMap<u32, u32>,
    dac_pending: Option<u32>,
    dac_rx: u32,

    raw_sample: u16,
    dconv_value: i32,
    raw_shortfall_words: usize,
    shortfall_shot: Option<(u32, usize)>,
    run_polls: u32,
    dma_busy_polls: u32,
    dma_never_done: bool,
    pll_never_locks: bool,
    dac_corrupt_reads: u32,
    dac_alerts: u32,
    spi_stuck: bool,
    starts: u32,
}

impl Default for State {
    fn default() -> Self {
        let mut regs = HashMap::new();
        regs.insert(regs::CTRL_OUT, ctrl_out::DEFAULT);
        Self {
            regs,
            sdram: HashMap::new(),
            writes: Vec::new(),
            raw_fifo: VecDeque::new(),
            dconv_fifo: VecDeque::new(),
            run_left: 0,
            sys_locked: true,
            analyzer_locked: true,
            dma_raw: DmaModel::default(),
            dma_dconv: DmaModel::default(),
            i2c_isr: 0,
            dac_regs: HashMap::new(),
            dac_pending: None,
            dac_rx: 0,
            raw_sample: 0x0800,
            dconv_value: 100,
            raw_shortfall_words: 0,
            shortfall_shot: None,
            run_polls: 3,
            dma_busy_polls: 0,
            dma_never_done: false,
            pll_never_locks: false,
            dac_corrupt_reads: 0,
            dac_alerts: 0,
            spi_stuck: false,
            starts: 0,
        }
    }
}

const DAC_REG_FIELD: u32 = 0b111 << 19;

fn in_block(offset: usize, base: usize, span: usize) -> Option<usize> {
    (base..base + span).contains(&offset).then(|| offset - base)
}

impl State {
    fn reg(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn lw_read(&mut self, offset: usize) -> u32 {
        if offset == regs::CTRL_IN {
            let mut v = 0;
            if self.run_left > 0 {
                self.run_left = self.run_left.saturating_sub(1);
                v |= ctrl_in::NMR_SEQ_RUN;
            }
            if self.sys_locked {
                v |= ctrl_in::PLL_NMR_SYS_LOCK;
            }
            if self.analyzer_locked {
                v |= ctrl_in::PLL_ANALYZER_LOCK;
            }
            return v;
        }
        if offset == regs::ADC_FIFO_OUT {
            return self.raw_fifo.pop_front().unwrap_or(0);
        }
        if offset == regs::ADC_FIFO_CSR + fifo::LEVEL {
            return u32::try_from(self.raw_fifo.len()).unwrap_or(u32::MAX);
        }
        if offset == regs::DCONV_FIFO_OUT {
            return self.dconv_fifo.pop_front().unwrap_or(0);
        }
        if offset == regs::DCONV_FIFO_CSR + fifo::LEVEL {
            return u32::try_from(self.dconv_fifo.len()).unwrap_or(u32::MAX);
        }
        if let Some(r) = in_block(offset, regs::DMA_FIFO, 0x20) {
            return Self::dma_read(&mut self.dma_raw, r, self.dma_never_done);
        }
        if let Some(r) = in_block(offset, regs::DMA_DCONV, 0x20) {
            return Self::dma_read(&mut self.dma_dconv, r, self.dma_never_done);
        }
        if offset == regs::NMR_SYS_PLL_RECONFIG + pll::STATUS
            || offset == regs::ANALYZER_PLL_RECONFIG + pll::STATUS
        {
            return pll::STATUS_DONE;
        }
        for base in [regs::DAC_PREAMP, regs::DAC_GRAD, regs::SPI_MTCH_NTWRK, regs::SPI_AFE_RELAYS] {
            match in_block(offset, base, 0x20) {
                Some(spi::STATUS) => {
                    return if self.spi_stuck {
                        0
                    } else {
                        spi::status::TMT | spi::status::TRDY | spi::status::RRDY
                    };
                }
                Some(spi::RXDATA) if base == regs::DAC_PREAMP => return self.dac_rx,
                _ => {}
            }
        }
        if offset == regs::I2C_INT + i2c::ISR {
            return self.i2c_isr;
        }
        self.reg(offset)
    }

    fn dma_read(engine: &mut DmaModel, reg: usize, never_done: bool) -> u32 {
        match reg {
            dma::STATUS => {
                if never_done {
                    return dma::status::BUSY;
                }
                if engine.busy_left > 0 {
                    engine.busy_left -= 1;
                    return engine.status | dma::status::DONE | dma::status::BUSY;
                }
                engine.status
            }
            dma::READADDR => engine.read_addr,
            dma::WRITEADDR => engine.write_addr,
            dma::LENGTH => engine.length,
            _ => 0,
        }
    }

    fn lw_write(&mut self, offset: usize, value: u32) {
        if offset == regs::CTRL_OUT {
            self.ctrl_out_changed(self.reg(regs::CTRL_OUT), value);
        }
        if let Some(r) = in_block(offset, regs::DMA_FIFO, 0x20) {
            self.dma_write(true, r, value);
            return;
        }
        if let Some(r) = in_block(offset, regs::DMA_DCONV, 0x20) {
            self.dma_write(false, r, value);
            return;
        }
        if offset == regs::I2C_INT + i2c::ISR {
            self.i2c_isr &= !value;
            return;
        }
        if offset == regs::DAC_PREAMP + spi::TXDATA {
            self.dac_frame(value);
        }
        self.regs.insert(offset, value);
    }

    fn ctrl_out_changed(&mut self, old: u32, new: u32) {
        let rose = |mask: u32| old & mask == 0 && new & mask != 0;
        let fell = |mask: u32| old & mask != 0 && new & mask == 0;

        if rose(ctrl_out::ADC_FIFO_RST) {
            self.raw_fifo.clear();
            self.dconv_fifo.clear();
        }
        if rose(ctrl_out::PLL_NMR_SYS_RST) {
            self.sys_locked = false;
        }
        if fell(ctrl_out::PLL_NMR_SYS_RST) {
            self.sys_locked = !self.pll_never_locks;
        }
        if rose(ctrl_out::PLL_ANALYZER_RST) {
            self.analyzer_locked = false;
        }
        if fell(ctrl_out::PLL_ANALYZER_RST) {
            self.analyzer_locked = !self.pll_never_locks;
        }
        if rose(ctrl_out::FSM_START) {
            self.run_sequence();
        }
    }

    fn run_sequence(&mut self) {
        let samples = self.reg(regs::SAMPLES_PER_ECHO) as usize;
        let echoes = self.reg(regs::ECHOES_PER_SCAN) as usize;
        let decimation = (self.reg(regs::DEC_FACT).max(1)) as usize;
        let total = samples * echoes;

        let shot = self.starts + 1;
        let extra = match self.shortfall_shot {
            Some((at, words)) if at == shot => words,
            _ => 0,
        };
        let raw_words = (total / fifo::SAMPLES_PER_WORD)
            .saturating_sub(self.raw_shortfall_words + extra);
        let s = u32::from(self.raw_sample) & fifo::SAMPLE_MASK;
        self.raw_fifo
            .extend(std::iter::repeat(s | (s << fifo::UPPER_SHIFT)).take(raw_words));

        #[allow(clippy::cast_sign_loss)]
        let d = self.dconv_value as u32;
        self.dconv_fifo
            .extend(std::iter::repeat(d).take(total * 2 / decimation));

        self.run_left = self.run_polls;
        self.starts += 1;
    }

    fn dma_write(&mut self, raw: bool, reg: usize, value: u32) {
        let engine = if raw {
            &mut self.dma_raw
        } else {
            &mut self.dma_dconv
        };
        match reg {
            dma::STATUS => engine.status = 0,
            dma::READADDR => engine.read_addr = value,
            dma::WRITEADDR => engine.write_addr = value,
            dma::LENGTH => engine.length = value,
            dma::CONTROL if value & dma::control::SWRST != 0 => {
                *engine = DmaModel::default();
            }
            dma::CONTROL if value & dma::control::GO != 0 => self.dma_go(raw),
            _ => {}
        }
    }

    fn dma_go(&mut self, raw: bool) {
        let busy = self.dma_busy_polls;
        let engine = if raw {
            &mut self.dma_raw
        } else {
            &mut self.dma_dconv
        };
        let sdram = &mut self.sdram;
        let source = match engine.read_addr as usize {
            regs::ADC_FIFO_OUT => &mut self.raw_fifo,
            regs::DCONV_FIFO_OUT => &mut self.dconv_fifo,
            _ => return,
        };
        let mut dst = engine.write_addr as usize;
        while engine.length >= 4 {
            let Some(word) = source.pop_front() else {
                break;
            };
            sdram.insert(dst, word);
            dst += 4;
            engine.length -= 4;
        }
        engine.status = dma::status::DONE
            | if engine.length == 0 {
                dma::status::LEN
            } else {
                dma::status::REOP
            };
        engine.busy_left = busy;
    }

    fn dac_frame(&mut self, frame: u32) {
        if let Some(out) = self.dac_pending.take() {
            self.dac_rx = out;
        }
        let key = frame & 0x3F_0000;
        if frame & dac::RD != 0 {
            let mut value = self.dac_regs.get(&key).copied().unwrap_or(0);
            if key == dac::REG_POWER {
                value |= self.dac_alerts;
            }
            if key & DAC_REG_FIELD == dac::REG_DAC && self.dac_corrupt_reads > 0 {
                self.dac_corrupt_reads -= 1;
                value ^= 1 << dac::CODE_SHIFT;
            }
            self.dac_pending = Some(value);
        } else if key != dac::REG_CONTROL {
            self.dac_regs.insert(key, frame & 0xFFFF);
        }
    }
}

/// Register view of one bridge window of a [`SimulatedFpga`].
#[derive(Debug)]
pub struct SimWindow {
    window: Window,
    state: Rc<RefCell<State>>,
}

impl RegisterAccess for SimWindow {
    fn read_word(&self, offset: usize) -> Result<u32> {
        if offset % 4 != 0 {
            return Err(NmrError::OutOfBounds { offset, limit: 0 });
        }
        let mut s = self.state.borrow_mut();
        Ok(match self.window {
            Window::Lightweight => s.lw_read(offset),
            Window::Axi => s.sdram.get(&offset).copied().unwrap_or(0),
        })
    }

    fn write_word(&self, offset: usize, value: u32) -> Result<()> {
        if offset % 4 != 0 {
            return Err(NmrError::OutOfBounds { offset, limit: 0 });
        }
        let mut s = self.state.borrow_mut();
        s.writes.push(WriteRecord {
            window: self.window,
            offset,
            value,
        });
        match self.window {
            Window::Lightweight => s.lw_write(offset, value),
            Window::Axi => {
                s.sdram.insert(offset, value);
            }
        }
        Ok(())
    }
}

/// In-memory FPGA with both bridge windows.
#[derive(Debug)]
pub struct SimulatedFpga {
    lw: SimWindow,
    axi: SimWindow,
}

impl Default for SimulatedFpga {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFpga {
    /// A powered-up FPGA: PLLs locked, FIFOs empty, `ctrl_out` at its
    /// default.
    pub fn new() -> Self {
        let state = Rc::new(RefCell::new(State::default()));
        Self {
            lw: SimWindow {
                window: Window::Lightweight,
                state: Rc::clone(&state),
            },
            axi: SimWindow {
                window: Window::Axi,
                state,
            },
        }
    }

    /// Lightweight-bridge bus.
    pub fn lw(&self) -> &dyn RegisterAccess {
        &self.lw
    }

    /// AXI-bridge bus.
    pub fn axi(&self) -> &dyn RegisterAccess {
        &self.axi
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.lw.state.borrow_mut())
    }

    /// Every write so far, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.with(|s| s.writes.clone())
    }

    /// Writes through the lightweight bridge, in order.
    pub fn lw_writes(&self) -> Vec<WriteRecord> {
        self.with(|s| {
            s.writes
                .iter()
                .filter(|w| w.window == Window::Lightweight)
                .copied()
                .collect()
        })
    }

    /// Forget the write log.
    pub fn clear_log(&self) {
        self.with(|s| s.writes.clear());
    }

    /// Last value written to (or held by) a lightweight-bridge register.
    pub fn register(&self, offset: usize) -> u32 {
        self.with(|s| s.reg(offset))
    }

    /// Number of FSM start edges seen.
    pub fn starts(&self) -> u32 {
        self.with(|s| s.starts)
    }

    /// Raw words currently queued in the ADC FIFO.
    pub fn raw_fifo_level(&self) -> usize {
        self.with(|s| s.raw_fifo.len())
    }

    /// Value of every raw sample the next runs produce.
    pub fn set_raw_sample(&self, sample: u16) {
        self.with(|s| s.raw_sample = sample);
    }

    /// Value of every downconverted word the next runs produce.
    pub fn set_dconv_value(&self, value: i32) {
        self.with(|s| s.dconv_value = value);
    }

    /// Drop `words` raw FIFO words from every run.
    pub fn set_raw_shortfall(&self, words: usize) {
        self.with(|s| s.raw_shortfall_words = words);
    }

    /// Drop `words` raw FIFO words from the `shot`-th run only (1-based).
    pub fn set_raw_shortfall_at(&self, shot: u32, words: usize) {
        self.with(|s| s.shortfall_shot = Some((shot, words)));
    }

    /// Status reads for which `NMR_SEQ_RUN` stays set after a start.
    pub fn set_run_polls(&self, polls: u32) {
        self.with(|s| s.run_polls = polls);
    }

    /// Status reads reporting DONE together with BUSY after each `GO`.
    pub fn set_dma_busy_polls(&self, polls: u32) {
        self.with(|s| s.dma_busy_polls = polls);
    }

    /// Make both DMA controllers report BUSY forever.
    pub fn set_dma_never_done(&self, stuck: bool) {
        self.with(|s| s.dma_never_done = stuck);
    }

    /// Keep PLL lock bits low after the next reset.
    pub fn set_pll_never_locks(&self, stuck: bool) {
        self.with(|s| s.pll_never_locks = stuck);
    }

    /// Corrupt the next `reads` DAC data-register readbacks.
    pub fn set_dac_corrupt_reads(&self, reads: u32) {
        self.with(|s| s.dac_corrupt_reads = reads);
    }

    /// Alert bits reported by the DAC power register.
    pub fn set_dac_alerts(&self, bits: u32) {
        self.with(|s| s.dac_alerts = bits);
    }

    /// Make every SPI master report busy forever.
    pub fn set_spi_stuck(&self, stuck: bool) {
        self.with(|s| s.spi_stuck = stuck);
    }

    /// Raise I2C interrupt status bits.
    pub fn raise_i2c_status(&self, bits: u32) {
        self.with(|s| s.i2c_isr |= bits);
    }

    /// Current I2C interrupt status.
    pub fn i2c_status(&self) -> u32 {
        self.with(|s| s.i2c_isr)
    }

    /// Word at byte `offset` of the staging SDRAM.
    pub fn sdram_word(&self, offset: usize) -> u32 {
        self.with(|s| s.sdram.get(&offset).copied().unwrap_or(0))
    }
}

/// Virtual monotonic clock. `sleep` advances it; nothing else does.
#[derive(Debug, Default)]
pub struct SimClock {
    now: Cell<Duration>,
}

impl SimClock {
    /// A clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now.get()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        let step = if duration.is_zero() {
            Duration::from_nanos(1)
        } else {
            duration
        };
        self.now.set(self.now.get() + step);
    }
}

/// Recording [`PllControl`] that locks instantly.
#[derive(Debug, Default)]
pub struct SimPll {
    /// `set_pll` calls: block, channel, MHz
    pub frequencies: Vec<(PllBlock, u32, f64)>,
    /// `set_phase` calls: block, channel, degrees
    pub phases: Vec<(PllBlock, u32, f64)>,
    /// `reset_pll` calls
    pub resets: Vec<PllBlock>,
    /// Successful `wait_pll_lock` calls
    pub locks: Vec<PllBlock>,
    /// Block whose lock wait fails
    pub fail_lock: Option<PllBlock>,
}

impl PllControl for SimPll {
    fn set_pll(&mut self, block: PllBlock, channel: u32, freq_mhz: f64, _duty: f64) -> Result<()> {
        self.frequencies.push((block, channel, freq_mhz));
        Ok(())
    }

    fn set_phase(&mut self, block: PllBlock, channel: u32, degrees: f64) -> Result<()> {
        self.phases.push((block, channel, degrees));
        Ok(())
    }

    fn reset_pll(&mut self, block: PllBlock, _ctrl: &mut ControlRegisterState) -> Result<()> {
        self.resets.push(block);
        Ok(())
    }

    fn wait_pll_lock(&mut self, block: PllBlock) -> Result<()> {
        if self.fail_lock == Some(block) {
            return Err(NmrError::timeout(block.name(), Duration::from_secs(1)));
        }
        self.locks.push(block);
        Ok(())
    }
}
