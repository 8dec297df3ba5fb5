//! System controller: the MMIO word through which the guest requests reset or poweroff.

use crate::bus::{AccessWidth, Bus};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Magic value written to request a system reset.
pub const RESET_MAGIC: u32 = 0x5555;
/// Magic value written to request a system poweroff.
pub const POWEROFF_MAGIC: u32 = 0x7777;

/// Size of the system controller register block.
pub const SIZE: u64 = 0x1000;

/// Power state signal latched by the system controller, checked by the board's interpreter loop
/// after every instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PowerEvent {
    Reset,
    PowerOff,
}

/// Shared latch for the most recent power event.
///
/// An atomic cell so that out-of-core device bodies (e.g. a watchdog on a host thread) could
/// assert it as well.
#[derive(Debug, Default)]
pub struct PowerLatch(AtomicU8);

impl PowerLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self, event: PowerEvent) {
        let value = match event {
            PowerEvent::Reset => 1,
            PowerEvent::PowerOff => 2,
        };
        self.0.store(value, Ordering::SeqCst);
    }

    /// Consume the latched event, if any.
    pub fn take(&self) -> Option<PowerEvent> {
        match self.0.swap(0, Ordering::SeqCst) {
            1 => Some(PowerEvent::Reset),
            2 => Some(PowerEvent::PowerOff),
            _ => None,
        }
    }
}

/// The system controller MMIO block.
///
/// A single write-only word at offset 0: `0x5555` requests reset, `0x7777` requests poweroff,
/// all other values are undefined and ignored here.
#[derive(Debug)]
pub struct Syscon {
    latch: Arc<PowerLatch>,
}

impl Syscon {
    pub fn new(latch: Arc<PowerLatch>) -> Self {
        Self { latch }
    }
}

impl Bus for Syscon {
    fn supports(&self, width: AccessWidth) -> bool {
        width == AccessWidth::Word
    }

    fn read(&self, _offset: u64, _width: AccessWidth) -> u64 {
        0
    }

    fn read_debug(&self, _offset: u64, _width: AccessWidth) -> u64 {
        0
    }

    fn write(&self, offset: u64, _width: AccessWidth, value: u64) {
        if offset != 0 {
            return;
        }
        match value as u32 {
            RESET_MAGIC => self.latch.signal(PowerEvent::Reset),
            POWEROFF_MAGIC => self.latch.signal(PowerEvent::PowerOff),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch() {
        let latch = PowerLatch::new();
        let syscon = Syscon::new(Arc::clone(&latch));
        assert_eq!(None, latch.take());
        syscon.write(0, AccessWidth::Word, POWEROFF_MAGIC as u64);
        assert_eq!(Some(PowerEvent::PowerOff), latch.take());
        // The latch is consumed by take().
        assert_eq!(None, latch.take());
        syscon.write(0, AccessWidth::Word, RESET_MAGIC as u64);
        assert_eq!(Some(PowerEvent::Reset), latch.take());
        // Unknown magic values and other offsets are ignored.
        syscon.write(0, AccessWidth::Word, 0x1234);
        syscon.write(4, AccessWidth::Word, RESET_MAGIC as u64);
        assert_eq!(None, latch.take());
    }
}
