use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An interrupt request line into the hart.
///
/// Implementations must be callable from host device threads; the assertion must become visible
/// to the hart at the next instruction boundary at the latest.
pub trait IrqLine: Send + Sync {
    fn raise(&self);

    fn lower(&self);
}

pub struct DynIrqLine(pub Box<dyn IrqLine>);

impl Deref for DynIrqLine {
    type Target = dyn IrqLine;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for DynIrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynIrqLine").finish_non_exhaustive()
    }
}

/// An [`IrqLine`] that sets/clears one bit of a hart's hardware-asserted `mip` word.
///
/// The word itself is an atomic cell shared with the hart (see
/// [`Interrupts`](crate::core::interrupts::Interrupts)), which is what allows the CLINT and PLIC
/// to assert wires from outside the interpreter loop.
pub struct MipWire {
    word: Arc<AtomicU64>,
    bit: u32,
}

impl MipWire {
    pub fn new(word: Arc<AtomicU64>, bit: u32) -> Self {
        assert!(bit < 64);
        Self { word, bit }
    }

    pub fn into_dyn(self) -> DynIrqLine {
        DynIrqLine(Box::new(self))
    }
}

impl IrqLine for MipWire {
    fn raise(&self) {
        self.word.fetch_or(1 << self.bit, Ordering::SeqCst);
    }

    fn lower(&self) {
        self.word.fetch_and(!(1 << self.bit), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_wire() {
        let word = Arc::new(AtomicU64::new(0));
        let mtip = MipWire::new(Arc::clone(&word), 7);
        let msip = MipWire::new(Arc::clone(&word), 3);
        mtip.raise();
        msip.raise();
        assert_eq!((1 << 7) | (1 << 3), word.load(Ordering::SeqCst));
        mtip.lower();
        assert_eq!(1 << 3, word.load(Ordering::SeqCst));
        // Raising an already-raised line is idempotent.
        msip.raise();
        assert_eq!(1 << 3, word.load(Ordering::SeqCst));
    }
}
