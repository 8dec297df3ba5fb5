//! Physical memory map: non-overlapping address ranges routed to shared resources.

use crate::bus::{AccessWidth, Bus};
use crate::system_bus::{AccessType, SystemBus};
use crate::AddressRange;
use log::debug;
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;

/// Stable identity of a resource registered in a [`MemoryMap`].
///
/// Ranges refer to resources by id, so platform wiring (e.g. the PLIC living in the map *and*
/// holding interrupt lines into the hart) can be expressed without ownership cycles.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DeviceId(usize);

/// Band of the physical address space in which resources may be auto-placed.
///
/// The platform reserves everything below `0x1000_0000` for fixed-placement resources (boot
/// flash, system controller, CLINT, PLIC).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Band {
    /// MMIO device band: `0x1000_0000..=0x7FFF_FFFF`.
    Device,
    /// Physical memory band: `0x8000_0000..=0xFFFF_FFFF`.
    Memory,
}

impl Band {
    fn range(self) -> AddressRange {
        match self {
            Band::Device => crate::address_range![0x1000_0000, 0x7FFF_FFFF],
            Band::Memory => crate::address_range![0x8000_0000, 0xFFFF_FFFF],
        }
    }

    /// Placement alignment within the band. Device registers are paged; memory is GiB-friendly
    /// but only needs page alignment too.
    fn alignment(self) -> u64 {
        0x1000
    }
}

/// Mutable builder for a [`MemoryMap`].
///
/// The map is only ever mutated here, during platform construction; once built it is read-only
/// for the rest of the simulation.
#[derive(Debug, Default)]
pub struct MemoryMapBuilder {
    devices: Vec<Rc<dyn Bus>>,
    ranges: Vec<(AddressRange, DeviceId)>,
}

impl MemoryMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` at the explicitly chosen `base` address.
    pub fn add_at(
        &mut self,
        base: u64,
        size: u64,
        device: Rc<dyn Bus>,
    ) -> Result<DeviceId, MemoryMapError> {
        let range = AddressRange::sized(base, size)
            .map_err(|_| MemoryMapError::InvalidRange { base, size })?;
        self.insert(range, device)
    }

    /// Register `device` at the first free spot of the given band (first-fit).
    pub fn add_auto(
        &mut self,
        band: Band,
        size: u64,
        device: Rc<dyn Bus>,
    ) -> Result<DeviceId, MemoryMapError> {
        let band_range = band.range();
        let alignment = band.alignment();
        let mut base = band_range.start();
        // self.ranges is kept sorted, so one pass suffices.
        for (range, _) in &self.ranges {
            if range.end() < base {
                continue;
            }
            if range.start() > base && range.start() - base >= size {
                break;
            }
            base = (range.end() + 1).next_multiple_of(alignment);
        }
        let range = AddressRange::sized(base, size)
            .map_err(|_| MemoryMapError::BandFull { band, size })?;
        if !band_range.contains(range.end()) {
            return Err(MemoryMapError::BandFull { band, size });
        }
        self.insert(range, device)
    }

    fn insert(
        &mut self,
        range: AddressRange,
        device: Rc<dyn Bus>,
    ) -> Result<DeviceId, MemoryMapError> {
        for (existing, _) in &self.ranges {
            if existing.overlaps(range) {
                return Err(MemoryMapError::Overlap {
                    new: range,
                    existing: *existing,
                });
            }
        }
        let id = DeviceId(self.devices.len());
        self.devices.push(device);
        self.ranges.push((range, id));
        self.ranges.sort_by_key(|(range, _)| range.start());
        Ok(id)
    }

    /// Returns the range a previously registered resource was placed at.
    pub fn range_for(&self, id: DeviceId) -> Option<AddressRange> {
        self.ranges
            .iter()
            .find(|(_, other)| *other == id)
            .map(|(range, _)| *range)
    }

    pub fn build(self) -> MemoryMap {
        MemoryMap {
            devices: self.devices,
            ranges: self.ranges,
            last_hit: Cell::new(0),
        }
    }
}

/// Immutable map of the 64-bit physical address space onto registered resources.
///
/// Keeps a single-entry cache of the last range that served an access; the hart's fetch stream
/// and most data traffic hit the same range repeatedly, so the cache short-circuits the binary
/// search on the hot path.
#[derive(Debug)]
pub struct MemoryMap {
    devices: Vec<Rc<dyn Bus>>,
    /// Sorted by start address; ranges don't overlap.
    ranges: Vec<(AddressRange, DeviceId)>,
    last_hit: Cell<usize>,
}

impl MemoryMap {
    /// Returns the range containing `address` and the resource it routes to, or `None` for
    /// vacant addresses.
    pub fn lookup(&self, address: u64) -> Option<(AddressRange, &dyn Bus)> {
        let index = self.lookup_index(address)?;
        let (range, id) = self.ranges[index];
        Some((range, &*self.devices[id.0]))
    }

    fn lookup_index(&self, address: u64) -> Option<usize> {
        let last = self.last_hit.get();
        if let Some((range, _)) = self.ranges.get(last) {
            if range.contains(address) {
                return Some(last);
            }
        }
        let index = self
            .ranges
            .partition_point(|(range, _)| range.start() <= address)
            .checked_sub(1)?;
        let (range, _) = self.ranges[index];
        range.contains(address).then(|| {
            self.last_hit.set(index);
            index
        })
    }

    /// Returns the resource registered under `id` and the range it was placed at.
    pub fn device(&self, id: DeviceId) -> Option<(AddressRange, &dyn Bus)> {
        let (range, _) = self.ranges.iter().find(|(_, other)| *other == id)?;
        Some((*range, &*self.devices[id.0]))
    }

    /// Routed single-width access; `None` if `address` is vacant.
    fn route(&self, address: u64) -> Option<(u64, &dyn Bus)> {
        let (range, device) = self.lookup(address)?;
        Some((address - range.start(), device))
    }
}

impl SystemBus for MemoryMap {
    fn accepts(&self, address: u64, size: u64, access_type: AccessType) -> bool {
        let Some(end) = size.checked_sub(1).and_then(|d| address.checked_add(d)) else {
            return false;
        };
        let Some((range, device)) = self.lookup(address) else {
            return false;
        };
        // An access must be served by a single resource; the map never splits one.
        if !range.contains(end) {
            return false;
        }
        match access_type {
            AccessType::Execute => device.is_fetchable(),
            AccessType::Read | AccessType::Write => true,
        }
    }

    fn read(&self, address: u64, width: AccessWidth) -> u64 {
        match self.route(address) {
            Some((offset, device)) if device.supports(width) => device.read(offset, width),
            Some(_) => 0,
            None => {
                debug!("Read of vacant physical address {address:#018x}");
                0
            }
        }
    }

    fn read_debug(&self, address: u64, width: AccessWidth) -> u64 {
        match self.route(address) {
            Some((offset, device)) if device.supports(width) => device.read_debug(offset, width),
            _ => 0,
        }
    }

    fn write(&self, address: u64, width: AccessWidth, value: u64) {
        match self.route(address) {
            Some((offset, device)) if device.supports(width) => device.write(offset, width, value),
            Some(_) => {}
            None => debug!("Write to vacant physical address {address:#018x} dropped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MemoryMapError {
    /// Attempt to add an address range that overlaps with a previously added address range.
    #[error("address range {new} overlaps with previously added range {existing}")]
    Overlap {
        new: AddressRange,
        existing: AddressRange,
    },
    #[error("invalid address range: base {base:#x}, size {size:#x}")]
    InvalidRange { base: u64, size: u64 },
    #[error("no free range of size {size:#x} left in {band:?} band")]
    BandFull { band: Band, size: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ram::Ram;

    fn ram(size: usize) -> Rc<dyn Bus> {
        Rc::new(Ram::new(size).unwrap())
    }

    #[test]
    fn test_overlap_rejected() {
        let mut builder = MemoryMapBuilder::new();
        builder.add_at(0x1000, 0x1000, ram(0x1000)).unwrap();
        assert!(matches!(
            builder.add_at(0x1800, 0x1000, ram(0x1000)),
            Err(MemoryMapError::Overlap { .. })
        ));
    }

    #[test]
    fn test_first_fit_placement() {
        let mut builder = MemoryMapBuilder::new();
        let a = builder.add_auto(Band::Device, 0x1000, ram(0x1000)).unwrap();
        let b = builder.add_auto(Band::Device, 0x1000, ram(0x1000)).unwrap();
        assert_eq!(0x1000_0000, builder.range_for(a).unwrap().start());
        assert_eq!(0x1000_1000, builder.range_for(b).unwrap().start());
        let c = builder.add_auto(Band::Memory, 0x1000, ram(0x1000)).unwrap();
        assert_eq!(0x8000_0000, builder.range_for(c).unwrap().start());
    }

    #[test]
    fn test_first_fit_reuses_gap() {
        let mut builder = MemoryMapBuilder::new();
        builder.add_at(0x1000_2000, 0x1000, ram(0x1000)).unwrap();
        let a = builder.add_auto(Band::Device, 0x2000, ram(0x2000)).unwrap();
        assert_eq!(0x1000_0000, builder.range_for(a).unwrap().start());
        let b = builder.add_auto(Band::Device, 0x4000, ram(0x4000)).unwrap();
        assert_eq!(0x1000_3000, builder.range_for(b).unwrap().start());
    }

    #[test]
    fn test_routing_and_vacant() {
        let mut builder = MemoryMapBuilder::new();
        builder.add_at(0x8000_0000, 0x1000, ram(0x1000)).unwrap();
        let map = builder.build();
        map.write(0x8000_0010, AccessWidth::Doubleword, 0x1122_3344_5566_7788);
        assert_eq!(
            0x1122_3344_5566_7788,
            map.read(0x8000_0010, AccessWidth::Doubleword)
        );
        // Repeated hits exercise the last-hit cache.
        assert_eq!(0x7788, map.read(0x8000_0010, AccessWidth::Halfword));
        assert_eq!(0, map.read(0x9000_0000, AccessWidth::Word));
        assert!(map.accepts(0x8000_0000, 8, AccessType::Read));
        assert!(!map.accepts(0x8000_0FFC, 8, AccessType::Read));
        assert!(!map.accepts(0x9000_0000, 1, AccessType::Read));
    }
}
