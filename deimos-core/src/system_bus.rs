use crate::bus::AccessWidth;
use core::fmt;
use std::fmt::Debug;
use std::ops::Deref;
use std::rc::Rc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    /// Regular reads.
    Read,
    /// Regular writes.
    Write,
    /// Instruction fetches.
    Execute,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Read => "R",
            Self::Write => "W",
            Self::Execute => "X",
        })
    }
}

/// Master interface of the interconnect through which a core reaches physical memory and MMIO.
///
/// Unlike [`Bus`](crate::bus::Bus), addresses here are absolute physical addresses; the
/// implementation is responsible for routing each access to the resource mapped at that address.
/// Accesses to vacant regions read as zero and drop writes; [`accepts`](SystemBus::accepts) is
/// how the core distinguishes those from real ones before committing to an access.
pub trait SystemBus: Debug {
    /// Returns whether an access of `size` bytes at physical `address` would be served by a
    /// mapped resource (for `Execute`, by a fetch-capable one).
    fn accepts(&self, address: u64, size: u64, access_type: AccessType) -> bool;

    /// Invoke a read access for physical `address`.
    fn read(&self, address: u64, width: AccessWidth) -> u64;

    /// Request an effect-free read for physical `address`.
    fn read_debug(&self, address: u64, width: AccessWidth) -> u64;

    /// Invoke a write access for physical `address`.
    fn write(&self, address: u64, width: AccessWidth, value: u64);
}

impl<B: SystemBus> SystemBus for Rc<B> {
    fn accepts(&self, address: u64, size: u64, access_type: AccessType) -> bool {
        self.deref().accepts(address, size, access_type)
    }

    fn read(&self, address: u64, width: AccessWidth) -> u64 {
        self.deref().read(address, width)
    }

    fn read_debug(&self, address: u64, width: AccessWidth) -> u64 {
        self.deref().read_debug(address, width)
    }

    fn write(&self, address: u64, width: AccessWidth, value: u64) {
        self.deref().write(address, width, value)
    }
}
