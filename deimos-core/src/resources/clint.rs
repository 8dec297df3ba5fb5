//! Core Local Interruptor

use crate::bus::{AccessWidth, Bus};
use crate::interrupt::DynIrqLine;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const MSIP_ADDR: u64 = 0x0;
pub const MTIMECMP_ADDR_LO: u64 = 0x4000;
pub const MTIMECMP_ADDR_HI: u64 = MTIMECMP_ADDR_LO + 4;
pub const MTIME_ADDR_LO: u64 = 0xBFF8;
pub const MTIME_ADDR_HI: u64 = MTIME_ADDR_LO + 4;

/// Size of the CLINT register block.
pub const SIZE: u64 = 0x1_0000;

/// Advertised timebase frequency of `mtime`, in Hz.
///
/// `mtime` is a monotonic counter advanced by the driving board; the platform's device tree
/// advertises this frequency so the guest can convert ticks to wall-clock time.
pub const TIMEBASE_FREQ: u64 = 10_000_000;

/// Core Local Interruptor for a single hart.
///
/// Exposes `msip` (bit 0 drives the MSIP wire), `mtimecmp`, and `mtime` as 32-bit memory-mapped
/// registers (64-bit accesses to the two timer registers are also accepted). `mtimecmp <= mtime`
/// asserts the MTIP wire; every write to either register re-evaluates the comparison.
///
/// All register words are atomic cells: host device threads may observe `mtime` while the hart
/// is mid-`step`, and the wire assertions themselves go through atomics as well.
#[derive(Debug)]
pub struct Clint {
    msip: AtomicU32,
    mtimecmp: AtomicU64,
    mtime: AtomicU64,
    msip_line: DynIrqLine,
    mtip_line: DynIrqLine,
}

impl Clint {
    /// Create a new CLINT in reset state.
    ///
    /// `msip_line` and `mtip_line` must be wired to the MSIP/MTIP bits of the hart's `mip`.
    pub fn new(msip_line: DynIrqLine, mtip_line: DynIrqLine) -> Self {
        Self {
            msip: AtomicU32::new(0),
            // Resetting mtimecmp to all-ones keeps MTIP deasserted until the guest programs a
            // deadline.
            mtimecmp: AtomicU64::new(u64::MAX),
            mtime: AtomicU64::new(0),
            msip_line,
            mtip_line,
        }
    }

    /// Restart the CLINT, setting everything to its reset state.
    pub fn reset(&self) {
        self.msip.store(0, Ordering::SeqCst);
        self.mtimecmp.store(u64::MAX, Ordering::SeqCst);
        self.mtime.store(0, Ordering::SeqCst);
        self.msip_line.lower();
        self.mtip_line.lower();
    }

    /// Advance `mtime` by `ticks` and re-evaluate the MTIP wire.
    pub fn tick(&self, ticks: u64) {
        self.mtime.fetch_add(ticks, Ordering::SeqCst);
        self.evaluate_mtip();
    }

    /// Current value of the `mtime` counter.
    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::SeqCst)
    }

    /// Current value of the `mtimecmp` register.
    pub fn mtimecmp(&self) -> u64 {
        self.mtimecmp.load(Ordering::SeqCst)
    }

    fn evaluate_mtip(&self) {
        let pending = self.mtimecmp.load(Ordering::SeqCst) <= self.mtime.load(Ordering::SeqCst);
        match pending {
            true => self.mtip_line.raise(),
            false => self.mtip_line.lower(),
        }
    }

    fn evaluate_msip(&self) {
        match self.msip.load(Ordering::SeqCst) & 1 != 0 {
            true => self.msip_line.raise(),
            false => self.msip_line.lower(),
        }
    }

    fn read_u32(&self, offset: u64) -> u32 {
        match offset {
            MSIP_ADDR => self.msip.load(Ordering::SeqCst),
            MTIMECMP_ADDR_LO => self.mtimecmp.load(Ordering::SeqCst) as u32,
            MTIMECMP_ADDR_HI => (self.mtimecmp.load(Ordering::SeqCst) >> 32) as u32,
            MTIME_ADDR_LO => self.mtime.load(Ordering::SeqCst) as u32,
            MTIME_ADDR_HI => (self.mtime.load(Ordering::SeqCst) >> 32) as u32,
            _ => 0,
        }
    }

    fn write_u32(&self, offset: u64, value: u32) {
        match offset {
            MSIP_ADDR => {
                // Only bit 0 is implemented.
                self.msip.store(value & 1, Ordering::SeqCst);
                self.evaluate_msip();
            }
            // Half-word writes merge into the 64-bit register; each one re-evaluates MTIP
            // against the merged value.
            MTIMECMP_ADDR_LO => {
                let old = self.mtimecmp.load(Ordering::SeqCst);
                self.mtimecmp
                    .store(old & 0xFFFF_FFFF_0000_0000 | value as u64, Ordering::SeqCst);
                self.evaluate_mtip();
            }
            MTIMECMP_ADDR_HI => {
                let old = self.mtimecmp.load(Ordering::SeqCst);
                self.mtimecmp
                    .store(old & 0xFFFF_FFFF | (value as u64) << 32, Ordering::SeqCst);
                self.evaluate_mtip();
            }
            MTIME_ADDR_LO => {
                let old = self.mtime.load(Ordering::SeqCst);
                self.mtime
                    .store(old & 0xFFFF_FFFF_0000_0000 | value as u64, Ordering::SeqCst);
                self.evaluate_mtip();
            }
            MTIME_ADDR_HI => {
                let old = self.mtime.load(Ordering::SeqCst);
                self.mtime
                    .store(old & 0xFFFF_FFFF | (value as u64) << 32, Ordering::SeqCst);
                self.evaluate_mtip();
            }
            _ => {}
        }
    }

    fn write_u64(&self, offset: u64, value: u64) {
        match offset {
            MTIMECMP_ADDR_LO => {
                self.mtimecmp.store(value, Ordering::SeqCst);
                self.evaluate_mtip();
            }
            MTIME_ADDR_LO => {
                self.mtime.store(value, Ordering::SeqCst);
                self.evaluate_mtip();
            }
            _ => {}
        }
    }
}

impl Bus for Clint {
    fn supports(&self, width: AccessWidth) -> bool {
        matches!(width, AccessWidth::Word | AccessWidth::Doubleword)
    }

    fn read(&self, offset: u64, width: AccessWidth) -> u64 {
        if offset & 0b11 != 0 {
            return 0;
        }
        match width {
            AccessWidth::Word => self.read_u32(offset) as u64,
            AccessWidth::Doubleword => {
                let lo = self.read_u32(offset) as u64;
                let hi = self.read_u32(offset + 4) as u64;
                hi << 32 | lo
            }
            _ => 0,
        }
    }

    fn read_debug(&self, offset: u64, width: AccessWidth) -> u64 {
        self.read(offset, width)
    }

    fn write(&self, offset: u64, width: AccessWidth, value: u64) {
        if offset & 0b11 != 0 {
            return;
        }
        match width {
            AccessWidth::Word => self.write_u32(offset, value as u32),
            AccessWidth::Doubleword => self.write_u64(offset, value),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::MipWire;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn clint() -> (Clint, Arc<AtomicU64>) {
        let word = Arc::new(AtomicU64::new(0));
        let msip = MipWire::new(Arc::clone(&word), 3).into_dyn();
        let mtip = MipWire::new(Arc::clone(&word), 7).into_dyn();
        (Clint::new(msip, mtip), word)
    }

    #[test]
    fn test_msip() {
        let (clint, word) = clint();
        clint.write(MSIP_ADDR, AccessWidth::Word, 1);
        assert_eq!(1 << 3, word.load(Ordering::SeqCst));
        assert_eq!(1, clint.read(MSIP_ADDR, AccessWidth::Word));
        clint.write(MSIP_ADDR, AccessWidth::Word, 0);
        assert_eq!(0, word.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mtip_on_tick() {
        let (clint, word) = clint();
        clint.write(MTIMECMP_ADDR_LO, AccessWidth::Doubleword, 100);
        clint.tick(99);
        assert_eq!(0, word.load(Ordering::SeqCst));
        clint.tick(1);
        assert_eq!(1 << 7, word.load(Ordering::SeqCst));
        // Pushing the deadline out lowers the wire again.
        clint.write(MTIMECMP_ADDR_LO, AccessWidth::Doubleword, 1000);
        assert_eq!(0, word.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mtimecmp_half_writes() {
        let (clint, word) = clint();
        clint.tick(0x1_0000_0064);
        // Writing only the low half leaves the high half at all-ones, keeping MTIP low.
        clint.write(MTIMECMP_ADDR_LO, AccessWidth::Word, 0x50);
        assert_eq!(0, word.load(Ordering::SeqCst));
        clint.write(MTIMECMP_ADDR_HI, AccessWidth::Word, 0x1);
        assert_eq!(1 << 7, word.load(Ordering::SeqCst));
        assert_eq!(0x1_0000_0050, clint.mtimecmp());
        assert_eq!(
            0x1_0000_0050,
            clint.read(MTIMECMP_ADDR_LO, AccessWidth::Doubleword)
        );
    }
}
