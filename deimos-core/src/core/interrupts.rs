//! The interrupt-pending/interrupt-enable register pair and interrupt selection.

use crate::core::Interrupt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// mip/mie bits writable by machine-level software. The machine-level pending bits (MSIP,
/// MTIP, MEIP) are driven purely by hardware wires.
const MIP_WRITE_MASK: u64 = 0x222;
/// Implemented mie bits: SSIE, MSIE, STIE, MTIE, SEIE, MEIE.
const MIE_WRITE_MASK: u64 = 0xAAA;
/// sip bits writable from S-mode.
const SIP_WRITE_MASK: u64 = 1 << Interrupt::SUPERVISOR_SOFTWARE;

/// The hart's interrupt-pending and interrupt-enable state.
///
/// `mip` is defined as the logical OR of two sources:
/// - the *wires* word, an atomic cell shared with the CLINT and PLIC (and any host device
///   thread holding one of their lines), and
/// - the *software* word, the bits written through the mip/sip CSRs.
#[derive(Debug)]
pub struct Interrupts {
    wires: Arc<AtomicU64>,
    software: u64,
    mie: u64,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::with_wires(Arc::new(AtomicU64::new(0)))
    }

    /// Create the interrupt file around an existing wire word. The platform allocates the word
    /// first so the CLINT/PLIC can be built before the core.
    pub fn with_wires(wires: Arc<AtomicU64>) -> Self {
        Self {
            wires,
            software: 0,
            mie: 0,
        }
    }

    /// The shared word CLINT/PLIC wires assert into. Bit positions follow the mip layout.
    pub fn wire_word(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.wires)
    }

    pub fn reset(&mut self) {
        self.software = 0;
        self.mie = 0;
        // Wires are left as-is: they reflect device state, which resets separately.
    }

    pub fn read_mip(&self) -> u64 {
        self.wires.load(Ordering::SeqCst) | self.software
    }

    pub fn write_mip(&mut self, value: u64, mask: u64) {
        let mask = mask & MIP_WRITE_MASK;
        self.software = self.software & !mask | value & mask;
    }

    pub fn read_mie(&self) -> u64 {
        self.mie
    }

    pub fn write_mie(&mut self, value: u64, mask: u64) {
        let mask = mask & MIE_WRITE_MASK;
        self.mie = self.mie & !mask | value & mask;
    }

    /// sip is a restricted view of mip: only bits delegated by mideleg are visible.
    pub fn read_sip(&self, mideleg: u64) -> u64 {
        self.read_mip() & mideleg
    }

    pub fn write_sip(&mut self, value: u64, mask: u64, mideleg: u64) {
        self.write_mip(value, mask & SIP_WRITE_MASK & mideleg);
    }

    /// sie is a restricted view of mie: only bits delegated by mideleg are visible.
    pub fn read_sie(&self, mideleg: u64) -> u64 {
        self.mie & mideleg
    }

    pub fn write_sie(&mut self, value: u64, mask: u64, mideleg: u64) {
        self.write_mie(value, mask & mideleg);
    }

    /// Returns whether any enabled interrupt is pending, regardless of global enables.
    /// This is the WFI wake-up condition.
    pub fn any_pending(&self) -> bool {
        self.read_mip() & self.mie != 0
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_is_or_of_wires_and_software() {
        let mut interrupts = Interrupts::new();
        let wires = interrupts.wire_word();
        wires.store(1 << 7, Ordering::SeqCst); // MTIP wire
        interrupts.write_mip(1 << 1, u64::MAX); // SSIP by software
        assert_eq!((1 << 7) | (1 << 1), interrupts.read_mip());
        // MTIP can't be cleared by software, only by the wire.
        interrupts.write_mip(0, u64::MAX);
        assert_eq!(1 << 7, interrupts.read_mip());
        wires.store(0, Ordering::SeqCst);
        assert_eq!(0, interrupts.read_mip());
    }

    #[test]
    fn test_enable_gates_wakeup() {
        let mut interrupts = Interrupts::new();
        interrupts.wire_word().store(1 << 11, Ordering::SeqCst);
        assert!(!interrupts.any_pending());
        interrupts.write_mie(1 << 11, u64::MAX);
        assert!(interrupts.any_pending());
    }

    #[test]
    fn test_mie_write_mask() {
        let mut interrupts = Interrupts::new();
        interrupts.write_mie(u64::MAX, u64::MAX);
        assert_eq!(0xAAA, interrupts.read_mie());
    }

    #[test]
    fn test_sie_sip_views() {
        let mut interrupts = Interrupts::new();
        let mideleg = 0x222;
        interrupts.write_mie(u64::MAX, u64::MAX);
        assert_eq!(0x222, interrupts.read_sie(mideleg));
        interrupts.write_sip(1 << 1, u64::MAX, mideleg);
        assert_eq!(1 << 1, interrupts.read_sip(mideleg));
        // STIP is not writable through sip.
        interrupts.write_sip(1 << 5, u64::MAX, mideleg);
        assert_eq!(0, interrupts.read_sip(mideleg) & (1 << 5));
    }
}
