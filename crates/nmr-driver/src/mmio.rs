// SPDX-License-Identifier: AGPL-3.0-only
//! Register access layer
//!
//! Everything above this module talks to hardware through [`RegisterAccess`]:
//! ordered 32-bit reads and writes at byte offsets into a bridge window. No
//! caching, no reordering. Two implementations exist:
//!
//! - [`PhysicalRegion`]: a `/dev/mem` window mapped with `rustix`, accessed
//!   with volatile loads and stores.
//! - [`crate::sim::SimulatedFpga`]: an in-memory model for CI and
//!   `--simulate` runs.
//!
//! Register handles ([`Peripheral`]) borrow a bus; they never own the
//! mapping. The mapping lives for as long as the process-level bracket that
//! created it.

use crate::error::{NmrError, Result};
use rustix::fs::OFlags;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;

/// Ordered, side-effecting word access to a register window.
pub trait RegisterAccess {
    /// Read the 32-bit word at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the offset lies outside the window.
    fn read_word(&self, offset: usize) -> Result<u32>;

    /// Write the 32-bit word at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the offset lies outside the window.
    fn write_word(&self, offset: usize, value: u32) -> Result<()>;
}

/// A window of physical address space mapped from `/dev/mem`.
#[derive(Debug)]
pub struct PhysicalRegion {
    ptr: NonNull<u8>,
    size: usize,
    phys_base: u64,
    _file: File,
}

impl PhysicalRegion {
    /// Map `size` bytes of physical memory starting at `phys_base`.
    ///
    /// The device node is opened `O_RDWR | O_SYNC` so that accesses reach the
    /// bridge uncached.
    ///
    /// # Errors
    ///
    /// Returns error if the device node cannot be opened (usually missing
    /// root privileges) or the mapping is refused.
    pub fn map(phys_base: u64, size: usize) -> Result<Self> {
        Self::map_from(nmr_fpga::bridge::DEV_MEM, phys_base, size)
    }

    /// Map `size` bytes at `phys_base` from an arbitrary device node.
    ///
    /// # Errors
    ///
    /// See [`PhysicalRegion::map`].
    pub fn map_from(device: &str, phys_base: u64, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(NmrError::mapping("window size is 0"));
        }

        tracing::debug!("Mapping {device} @ {phys_base:#x} (+{size:#x})");

        #[allow(clippy::cast_possible_wrap)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlags::SYNC.bits() as i32)
            .open(device)
            .map_err(|e| NmrError::mapping(format!("Cannot open {device}: {e}")))?;

        // SAFETY: the file descriptor was just opened read/write, size is
        // non-zero, and the mapping is released in Drop before the file is
        // closed (field order keeps `_file` alive until after munmap).
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                phys_base,
            )
        }
        .map_err(|e| NmrError::mapping(format!("mmap {phys_base:#x} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| NmrError::mapping("mmap returned a null pointer"))?;

        tracing::info!("Mapped {size:#x} bytes of {phys_base:#x} at {ptr:p}");

        Ok(Self {
            ptr,
            size,
            phys_base,
            _file: file,
        })
    }

    /// Physical base address of the window.
    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Window size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset.checked_add(4).map_or(true, |end| end > self.size) {
            return Err(NmrError::OutOfBounds {
                offset,
                limit: self.size,
            });
        }
        Ok(())
    }
}

impl RegisterAccess for PhysicalRegion {
    fn read_word(&self, offset: usize) -> Result<u32> {
        self.check(offset)?;

        // SAFETY: offset is word aligned and offset + 4 <= size (checked
        // above), so the pointer stays inside the live mapping. Volatile
        // because bridge registers have read side effects (FIFO pops).
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };

        tracing::trace!("rd {:#x} = {value:#x}", self.phys_base + offset as u64);
        Ok(value)
    }

    fn write_word(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset)?;

        tracing::trace!("wr {:#x} = {value:#x}", self.phys_base + offset as u64);

        // SAFETY: as for read_word. Writes go straight to the bridge; the
        // mapping is MAP_SHARED and the fd is O_SYNC.
        #[allow(clippy::cast_ptr_alignment)]
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }
}

impl Drop for PhysicalRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in `map_from` and
        // are unmapped exactly once.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            tracing::error!("munmap of {:#x} failed: {e}", self.phys_base);
        }
    }
}

// SAFETY: the region is plain device memory; moving the owner to another
// thread does not invalidate the mapping. It is deliberately not Sync: one
// acquisition at a time owns the registers.
unsafe impl Send for PhysicalRegion {}

/// Named register block: a bus plus the block's base offset.
///
/// This is the handle the acquisition core receives. It is `Copy` and
/// borrows the bus, so creation and teardown of the mapping stay with the
/// caller.
#[derive(Clone, Copy)]
pub struct Peripheral<'a> {
    bus: &'a dyn RegisterAccess,
    base: usize,
    name: &'static str,
}

impl<'a> Peripheral<'a> {
    /// Create a handle for the block at `base` on `bus`.
    pub fn new(bus: &'a dyn RegisterAccess, base: usize, name: &'static str) -> Self {
        Self { bus, base, name }
    }

    /// Read the register at byte offset `reg` inside the block.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn read(&self, reg: usize) -> Result<u32> {
        self.bus.read_word(self.base + reg)
    }

    /// Write the register at byte offset `reg` inside the block.
    ///
    /// # Errors
    ///
    /// Propagates bus errors.
    pub fn write(&self, reg: usize, value: u32) -> Result<()> {
        self.bus.write_word(self.base + reg, value)
    }

    /// Base offset on the bus.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Block name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Peripheral<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Scratch(RefCell<HashMap<usize, u32>>);

    impl RegisterAccess for Scratch {
        fn read_word(&self, offset: usize) -> Result<u32> {
            Ok(self.0.borrow().get(&offset).copied().unwrap_or(0))
        }
        fn write_word(&self, offset: usize, value: u32) -> Result<()> {
            self.0.borrow_mut().insert(offset, value);
            Ok(())
        }
    }

    #[test]
    fn peripheral_offsets_are_relative_to_base() {
        let bus = Scratch::default();
        let p = Peripheral::new(&bus, 0x100, "test");
        p.write(0x8, 0xdead_beef).unwrap();
        assert_eq!(bus.read_word(0x108).unwrap(), 0xdead_beef);
        assert_eq!(p.read(0x8).unwrap(), 0xdead_beef);
        assert_eq!(format!("{p:?}"), "Peripheral { name: \"test\", base: 0x100 }");
    }

    #[test]
    fn zero_sized_window_rejected() {
        let err = PhysicalRegion::map_from("/dev/null", 0, 0).unwrap_err();
        assert!(matches!(err, NmrError::Mapping { .. }));
    }

    #[test]
    #[ignore] // Requires hardware
    fn map_lightweight_bridge() {
        let region = PhysicalRegion::map(
            nmr_fpga::bridge::LW_H2F_BASE,
            nmr_fpga::bridge::LW_H2F_SPAN,
        )
        .unwrap();
        assert!(region.read_word(nmr_fpga::regs::CTRL_IN).is_ok());
        assert!(region.read_word(region.size()).is_err());
    }
}
