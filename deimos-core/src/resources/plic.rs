//! Platform-Level Interrupt Controller

use crate::bus::{AccessWidth, Bus};
use crate::interrupt::DynIrqLine;
use std::sync::Mutex;

/// Number of interrupt sources, including the reserved source 0 ("no interrupt").
pub const NUM_SOURCES: usize = 32;

/// Highest supported priority value; priority registers are WARL-clamped to this.
pub const MAX_PRIORITY: u32 = 7;

pub const PRIORITY_BASE_ADDR: u64 = 0x0;
pub const PENDING_ADDR: u64 = 0x1000;
pub const ENABLE_BASE_ADDR: u64 = 0x2000;
pub const ENABLE_CONTEXT_STRIDE: u64 = 0x80;
pub const THRESHOLD_BASE_ADDR: u64 = 0x20_0000;
pub const CONTEXT_STRIDE: u64 = 0x1000;

/// Size of the PLIC register block.
pub const SIZE: u64 = 0x40_0000;

/// The two interrupt contexts of the single hart.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Context {
    /// Context 0, wired to the MEIP bit.
    Machine = 0,
    /// Context 1, wired to the SEIP bit.
    Supervisor = 1,
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct State {
    priorities: [u32; NUM_SOURCES],
    pending: u32,
    /// Sources that have been claimed but not yet completed. The gateway blocks new pends for
    /// these until completion.
    served: u32,
    enabled: [u32; 2],
    threshold: [u32; 2],
}

impl State {
    fn new() -> Self {
        Self {
            priorities: [0; NUM_SOURCES],
            pending: 0,
            served: 0,
            enabled: [0; 2],
            threshold: [0; 2],
        }
    }

    /// Best pending source for a context: the highest-priority pending+enabled source whose
    /// priority strictly exceeds the context's threshold. Ties break to the lowest source id.
    /// Returns 0 if there is none.
    fn best_pending(&self, context: usize) -> u32 {
        let mut best = 0;
        let mut best_priority = self.threshold[context];
        for source in 1..NUM_SOURCES {
            if self.pending & (1 << source) == 0 || self.enabled[context] & (1 << source) == 0 {
                continue;
            }
            if self.priorities[source] > best_priority {
                best = source as u32;
                best_priority = self.priorities[source];
            }
        }
        best
    }

    fn claim(&mut self, context: usize) -> u32 {
        let source = self.best_pending(context);
        if source != 0 {
            self.pending &= !(1 << source);
            self.served |= 1 << source;
        }
        source
    }

    fn complete(&mut self, source: u32) {
        if (1..NUM_SOURCES as u32).contains(&source) {
            self.served &= !(1 << source);
        }
    }

    fn needs_interrupt(&self, context: usize) -> bool {
        self.best_pending(context) != 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AddrAccessor {
    Priority(usize),
    Pending,
    Enabled(usize),
    Threshold(usize),
    ClaimComplete(usize),
}

impl AddrAccessor {
    fn from_offset(offset: u64) -> Option<Self> {
        const PRIORITY_LAST_ADDR: u64 = PRIORITY_BASE_ADDR + 4 * (NUM_SOURCES as u64 - 1);
        match offset {
            PRIORITY_BASE_ADDR..=PRIORITY_LAST_ADDR => {
                Some(Self::Priority((offset / 4) as usize))
            }
            PENDING_ADDR => Some(Self::Pending),
            _ if offset == ENABLE_BASE_ADDR => Some(Self::Enabled(0)),
            _ if offset == ENABLE_BASE_ADDR + ENABLE_CONTEXT_STRIDE => Some(Self::Enabled(1)),
            _ if offset == THRESHOLD_BASE_ADDR => Some(Self::Threshold(0)),
            _ if offset == THRESHOLD_BASE_ADDR + CONTEXT_STRIDE => Some(Self::Threshold(1)),
            _ if offset == THRESHOLD_BASE_ADDR + 4 => Some(Self::ClaimComplete(0)),
            _ if offset == THRESHOLD_BASE_ADDR + CONTEXT_STRIDE + 4 => {
                Some(Self::ClaimComplete(1))
            }
            _ => None,
        }
    }
}

/// Platform-Level Interrupt Controller with two contexts (M-mode and S-mode of the single hart).
///
/// Devices assert sources through [`Plic::raise`]; a context whose best pending source is
/// non-zero asserts its external-interrupt wire (MEIP or SEIP) on the hart. Internal state sits
/// behind a mutex so device host threads can raise lines while the hart is between (or inside)
/// instructions; the hart only observes the wire word, which is atomic.
#[derive(Debug)]
pub struct Plic {
    state: Mutex<State>,
    meip_line: DynIrqLine,
    seip_line: DynIrqLine,
}

impl Plic {
    /// Create a new PLIC in reset state.
    pub fn new(meip_line: DynIrqLine, seip_line: DynIrqLine) -> Self {
        Self {
            state: Mutex::new(State::new()),
            meip_line,
            seip_line,
        }
    }

    pub fn reset(&self) {
        self.update(|state| *state = State::new());
    }

    /// Assert interrupt source `source`.
    ///
    /// Raises while the source is being served (claimed but not completed) are gated off.
    pub fn raise(&self, source: u8) {
        let source = source as usize % NUM_SOURCES;
        if source == 0 {
            return;
        }
        self.update(|state| {
            if state.served & (1 << source) == 0 {
                state.pending |= 1 << source;
            }
        });
    }

    /// Deassert interrupt source `source`.
    ///
    /// The PLIC latches pends, so lowering a line has no effect on already-pending state.
    pub fn lower(&self, _source: u8) {}

    fn read_u32(&self, offset: u64) -> u32 {
        let Some(accessor) = AddrAccessor::from_offset(offset) else {
            return 0;
        };
        match accessor {
            AddrAccessor::Priority(i) => self.state.lock().unwrap().priorities[i],
            AddrAccessor::Pending => self.state.lock().unwrap().pending,
            AddrAccessor::Enabled(c) => self.state.lock().unwrap().enabled[c],
            AddrAccessor::Threshold(c) => self.state.lock().unwrap().threshold[c],
            AddrAccessor::ClaimComplete(c) => self.update(|state| state.claim(c)),
        }
    }

    fn read_u32_debug(&self, offset: u64) -> u32 {
        let Some(accessor) = AddrAccessor::from_offset(offset) else {
            return 0;
        };
        let state = self.state.lock().unwrap();
        match accessor {
            AddrAccessor::Priority(i) => state.priorities[i],
            AddrAccessor::Pending => state.pending,
            AddrAccessor::Enabled(c) => state.enabled[c],
            AddrAccessor::Threshold(c) => state.threshold[c],
            AddrAccessor::ClaimComplete(c) => state.best_pending(c),
        }
    }

    fn write_u32(&self, offset: u64, value: u32) {
        let Some(accessor) = AddrAccessor::from_offset(offset) else {
            return;
        };
        self.update(|state| match accessor {
            AddrAccessor::Priority(i) => {
                if i != 0 {
                    state.priorities[i] = value.min(MAX_PRIORITY);
                }
            }
            // Pending bits are set by sources, not software.
            AddrAccessor::Pending => {}
            AddrAccessor::Enabled(c) => {
                // Source 0 doesn't exist, its enable bit is hardwired to zero.
                state.enabled[c] = value & !1;
            }
            AddrAccessor::Threshold(c) => state.threshold[c] = value.min(MAX_PRIORITY),
            AddrAccessor::ClaimComplete(c) => {
                let _ = c;
                state.complete(value);
            }
        });
    }

    /// Run `op` on the state and update both wires if the "best pending" outcome changed.
    fn update<R>(&self, op: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let before = [state.needs_interrupt(0), state.needs_interrupt(1)];
        let result = op(&mut state);
        let after = [state.needs_interrupt(0), state.needs_interrupt(1)];
        drop(state);
        for (context, line) in [&self.meip_line, &self.seip_line].into_iter().enumerate() {
            match (before[context], after[context]) {
                (false, true) => line.raise(),
                (true, false) => line.lower(),
                _ => {}
            }
        }
        result
    }
}

impl Bus for Plic {
    fn supports(&self, width: AccessWidth) -> bool {
        width == AccessWidth::Word
    }

    fn read(&self, offset: u64, width: AccessWidth) -> u64 {
        if offset & 0b11 != 0 || width != AccessWidth::Word {
            return 0;
        }
        self.read_u32(offset) as u64
    }

    fn read_debug(&self, offset: u64, width: AccessWidth) -> u64 {
        if offset & 0b11 != 0 || width != AccessWidth::Word {
            return 0;
        }
        self.read_u32_debug(offset) as u64
    }

    fn write(&self, offset: u64, width: AccessWidth, value: u64) {
        if offset & 0b11 != 0 || width != AccessWidth::Word {
            return;
        }
        self.write_u32(offset, value as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::MipWire;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const MEIP: u64 = 1 << 11;
    const SEIP: u64 = 1 << 9;

    fn plic() -> (Plic, Arc<AtomicU64>) {
        let word = Arc::new(AtomicU64::new(0));
        let meip = MipWire::new(Arc::clone(&word), 11).into_dyn();
        let seip = MipWire::new(Arc::clone(&word), 9).into_dyn();
        (Plic::new(meip, seip), word)
    }

    fn claim_addr(context: u64) -> u64 {
        THRESHOLD_BASE_ADDR + CONTEXT_STRIDE * context + 4
    }

    #[test]
    fn test_disabled_source_does_not_interrupt() {
        let (plic, word) = plic();
        plic.write_u32(PRIORITY_BASE_ADDR + 4 * 5, 3);
        plic.raise(5);
        assert_eq!(0, word.load(Ordering::SeqCst));
        plic.write_u32(ENABLE_BASE_ADDR, 1 << 5);
        plic.raise(5);
        assert_eq!(MEIP, word.load(Ordering::SeqCst));
    }

    #[test]
    fn test_claim_complete_cycle() {
        let (plic, word) = plic();
        plic.write_u32(PRIORITY_BASE_ADDR + 4 * 7, 2);
        plic.write_u32(ENABLE_BASE_ADDR + ENABLE_CONTEXT_STRIDE, 1 << 7);
        plic.raise(7);
        assert_eq!(SEIP, word.load(Ordering::SeqCst));
        assert_eq!(7, plic.read_u32(claim_addr(1)));
        // Claim cleared pending and lowered the wire.
        assert_eq!(0, word.load(Ordering::SeqCst));
        // Raises while served are gated off.
        plic.raise(7);
        assert_eq!(0, word.load(Ordering::SeqCst));
        plic.write_u32(claim_addr(1), 7);
        plic.raise(7);
        assert_eq!(SEIP, word.load(Ordering::SeqCst));
    }

    #[test]
    fn test_priority_and_tie_break() {
        let (plic, _word) = plic();
        plic.write_u32(PRIORITY_BASE_ADDR + 4 * 3, 1);
        plic.write_u32(PRIORITY_BASE_ADDR + 4 * 4, 5);
        plic.write_u32(PRIORITY_BASE_ADDR + 4 * 9, 5);
        plic.write_u32(ENABLE_BASE_ADDR, (1 << 3) | (1 << 4) | (1 << 9));
        plic.raise(3);
        plic.raise(4);
        plic.raise(9);
        // Highest priority wins; among sources 4 and 9 (same priority) the lowest id wins.
        assert_eq!(4, plic.read_u32(claim_addr(0)));
        assert_eq!(9, plic.read_u32(claim_addr(0)));
        assert_eq!(3, plic.read_u32(claim_addr(0)));
        assert_eq!(0, plic.read_u32(claim_addr(0)));
    }

    #[test]
    fn test_threshold_gates() {
        let (plic, word) = plic();
        plic.write_u32(PRIORITY_BASE_ADDR + 4 * 2, 3);
        plic.write_u32(ENABLE_BASE_ADDR, 1 << 2);
        plic.write_u32(THRESHOLD_BASE_ADDR, 3);
        plic.raise(2);
        // Priority must strictly exceed the threshold.
        assert_eq!(0, word.load(Ordering::SeqCst));
        plic.write_u32(THRESHOLD_BASE_ADDR, 2);
        assert_eq!(MEIP, word.load(Ordering::SeqCst));
    }
}
