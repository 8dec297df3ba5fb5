//! Virtual-memory translation: satp, the Sv39/Sv48 page walk, and the software TLBs.

use super::Core;
use crate::bus::AccessWidth;
use crate::system_bus::{AccessType, SystemBus};
use crate::PrivilegeLevel;
use bitvec::{order::Lsb0, view::BitView};
use log::{debug, trace};
use thiserror::Error;

/// log2(page size in bytes).
const PAGE_SHIFT: u32 = 12;
/// Number of virtual-page-number bits consumed per page-table level.
const VPN_BITS: u32 = 9;
/// log2(PTE size in bytes).
const PTE_SHIFT: u32 = 3;

/// Number of entries of each of the three direct-mapped TLBs.
pub const TLB_ENTRIES: usize = 256;

/// Supported address-translation schemes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SatpMode {
    /// No translation.
    Bare,
    /// Page-based 39-bit virtual addressing (3 levels).
    Sv39,
    /// Page-based 48-bit virtual addressing (4 levels).
    Sv48,
}

impl SatpMode {
    fn levels(self) -> u32 {
        match self {
            SatpMode::Bare => 0,
            SatpMode::Sv39 => 3,
            SatpMode::Sv48 => 4,
        }
    }

    fn va_bits(self) -> u32 {
        match self {
            SatpMode::Bare => 64,
            SatpMode::Sv39 => 39,
            SatpMode::Sv48 => 48,
        }
    }
}

/// The satp CSR.
///
/// > The satp register is considered active when the effective privilege mode is S-mode or
/// > U-mode. [...] The MODE field is WARL: an implementation is not required to support all
/// > defined MODE settings.
#[derive(Debug, Clone)]
pub struct Satp {
    mode: SatpMode,
    asid: u16,
    ppn: u64,
}

impl Default for Satp {
    fn default() -> Self {
        Self {
            mode: SatpMode::Bare,
            asid: 0,
            ppn: 0,
        }
    }
}

impl Satp {
    pub fn mode(&self) -> SatpMode {
        self.mode
    }

    pub fn asid(&self) -> u16 {
        self.asid
    }

    pub fn ppn(&self) -> u64 {
        self.ppn
    }

    pub fn read(&self) -> u64 {
        let mode: u64 = match self.mode {
            SatpMode::Bare => 0,
            SatpMode::Sv39 => 8,
            SatpMode::Sv48 => 9,
        };
        mode << 60 | (self.asid as u64) << 44 | self.ppn
    }

    pub fn write(&mut self, value: u64, mask: u64) {
        let value = self.read() & !mask | value & mask;
        // MODE is WARL: writing an unsupported scheme leaves the field unchanged.
        self.mode = match value >> 60 {
            0 => SatpMode::Bare,
            8 => SatpMode::Sv39,
            9 => SatpMode::Sv48,
            _ => self.mode,
        };
        self.asid = ((value >> 44) & 0xFFFF) as u16;
        self.ppn = value & 0x0FFF_FFFF_FFFF;
    }
}

mod pte {
    use bitvec::{field::BitField, order::Lsb0, slice::BitSlice};

    pub const V: usize = 0;
    pub const R: usize = 1;
    pub const W: usize = 2;
    pub const X: usize = 3;
    pub const U: usize = 4;
    pub const A: usize = 6;
    pub const D: usize = 7;

    pub fn ppn(entry: &BitSlice<u64, Lsb0>) -> u64 {
        entry[10..54].load_le()
    }
}

/// One translation cached from a page walk.
///
/// The tag packs everything the translation depended on: virtual page number, ASID, the
/// privilege the access executed at, and the SUM/MXR state. A context change therefore misses
/// naturally instead of requiring a flush.
#[derive(Debug, Copy, Clone)]
struct TlbEntry {
    tag: u64,
    /// Physical address of the (4 KiB) page frame.
    page_base: u64,
    /// Virtual page number, kept for address-selective SFENCE.VMA.
    vpn: u64,
    asid: u16,
}

const TAG_INVALID: u64 = u64::MAX;

fn tag(vpn: u64, asid: u16, privilege: PrivilegeLevel, sum: bool, mxr: bool) -> u64 {
    debug_assert!(vpn < 1 << 36);
    vpn | (asid as u64) << 36
        | (privilege as u64) << 52
        | (sum as u64) << 54
        | (mxr as u64) << 55
}

/// A direct-mapped software TLB, indexed by the low virtual-page-number bits.
#[derive(Debug)]
pub struct Tlb {
    entries: Box<[TlbEntry; TLB_ENTRIES]>,
}

impl Tlb {
    fn new() -> Self {
        Self {
            entries: Box::new(
                [TlbEntry {
                    tag: TAG_INVALID,
                    page_base: 0,
                    vpn: 0,
                    asid: 0,
                }; TLB_ENTRIES],
            ),
        }
    }

    fn lookup(&self, tag: u64, vpn: u64) -> Option<u64> {
        let entry = &self.entries[vpn as usize % TLB_ENTRIES];
        (entry.tag == tag).then_some(entry.page_base)
    }

    fn insert(&mut self, tag: u64, vpn: u64, asid: u16, page_base: u64) {
        self.entries[vpn as usize % TLB_ENTRIES] = TlbEntry {
            tag,
            page_base,
            vpn,
            asid,
        };
    }

    fn flush_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.tag = TAG_INVALID;
        }
    }

    fn flush_matching(&mut self, asid: Option<u16>, vpn: Option<u64>) {
        for entry in self.entries.iter_mut() {
            let asid_matches = asid.map_or(true, |asid| entry.asid == asid);
            let vpn_matches = vpn.map_or(true, |vpn| entry.vpn == vpn);
            if asid_matches && vpn_matches {
                entry.tag = TAG_INVALID;
            }
        }
    }
}

/// The memory-management unit state owned by a core: satp plus one TLB per access kind.
#[derive(Debug)]
pub struct Mmu {
    pub(super) satp: Satp,
    fetch_tlb: Tlb,
    load_tlb: Tlb,
    store_tlb: Tlb,
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            satp: Satp::default(),
            fetch_tlb: Tlb::new(),
            load_tlb: Tlb::new(),
            store_tlb: Tlb::new(),
        }
    }

    fn tlb(&self, access_type: AccessType) -> &Tlb {
        match access_type {
            AccessType::Execute => &self.fetch_tlb,
            AccessType::Read => &self.load_tlb,
            AccessType::Write => &self.store_tlb,
        }
    }

    fn tlb_mut(&mut self, access_type: AccessType) -> &mut Tlb {
        match access_type {
            AccessType::Execute => &mut self.fetch_tlb,
            AccessType::Read => &mut self.load_tlb,
            AccessType::Write => &mut self.store_tlb,
        }
    }

    /// Drop all cached translations.
    pub fn flush_all(&mut self) {
        self.fetch_tlb.flush_all();
        self.load_tlb.flush_all();
        self.store_tlb.flush_all();
    }

    /// `SFENCE.VMA` semantics: flush translations matching the given ASID and/or virtual
    /// address; `None` (a zero register operand) means "all".
    pub fn fence_vma(&mut self, vaddr: Option<u64>, asid: Option<u16>) {
        let vpn = vaddr.map(|vaddr| vaddr >> PAGE_SHIFT);
        self.fetch_tlb.flush_matching(asid, vpn);
        self.load_tlb.flush_matching(asid, vpn);
        self.store_tlb.flush_matching(asid, vpn);
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors of the memory subsystem, each carrying the faulting *virtual* address.
///
/// Which RISC-V exception they map to depends on the access kind; see
/// [`MemoryError::as_exception`].
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error("misaligned access at {0:#x}")]
    Misaligned(u64),
    #[error("access fault at {0:#x}")]
    AccessFault(u64),
    #[error("page fault at {0:#x}")]
    PageFault(u64),
}

impl MemoryError {
    /// Convert to the precise exception for the access kind that raised it.
    pub fn as_exception(&self, access_type: AccessType) -> super::Exception {
        use super::Exception;
        match (access_type, self) {
            (AccessType::Execute, Self::Misaligned(a)) => {
                Exception::InstructionAddressMisaligned(*a)
            }
            (AccessType::Execute, Self::AccessFault(a)) => Exception::InstructionAccessFault(*a),
            (AccessType::Execute, Self::PageFault(a)) => Exception::InstructionPageFault(*a),
            (AccessType::Read, Self::Misaligned(a)) => Exception::LoadAddressMisaligned(*a),
            (AccessType::Read, Self::AccessFault(a)) => Exception::LoadAccessFault(*a),
            (AccessType::Read, Self::PageFault(a)) => Exception::LoadPageFault(*a),
            (AccessType::Write, Self::Misaligned(a)) => {
                Exception::StoreOrAmoAddressMisaligned(*a)
            }
            (AccessType::Write, Self::AccessFault(a)) => Exception::StoreOrAmoAccessFault(*a),
            (AccessType::Write, Self::PageFault(a)) => Exception::StoreOrAmoPageFault(*a),
        }
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

impl<B: SystemBus> Core<B> {
    /// The privilege level at which loads and stores execute.
    ///
    /// > When MPRV=1, load and store memory addresses are translated and protected, and
    /// > endianness is applied, as though the current privilege mode were set to MPP.
    pub(super) fn effective_privilege(&self, access_type: AccessType) -> PrivilegeLevel {
        match access_type {
            // Instruction address-translation and protection are unaffected by MPRV.
            AccessType::Execute => self.privilege_mode,
            AccessType::Read | AccessType::Write => match self.status.mprv() {
                true => self.status.mpp(),
                false => self.privilege_mode,
            },
        }
    }

    /// Translate a virtual address for one access of the given kind.
    pub(super) fn translate(
        &mut self,
        vaddr: u64,
        access_type: AccessType,
    ) -> MemoryResult<u64> {
        self.translate_common(vaddr, access_type, false)
    }

    fn translate_common(
        &mut self,
        vaddr: u64,
        access_type: AccessType,
        debug: bool,
    ) -> MemoryResult<u64> {
        let privilege = self.effective_privilege(access_type);
        let mode = self.mmu.satp.mode();
        if privilege == PrivilegeLevel::Machine || mode == SatpMode::Bare {
            return Ok(vaddr);
        }
        // The virtual address must be canonical (sign-extended from VA_BITS). Checked before
        // the TLB so a non-canonical address can't alias a cached translation.
        let shift = 64 - mode.va_bits();
        if ((vaddr as i64) << shift >> shift) as u64 != vaddr {
            return Err(MemoryError::PageFault(vaddr));
        }
        let vpn = vaddr >> PAGE_SHIFT;
        let tag = tag(
            vpn & ((1 << 36) - 1),
            self.mmu.satp.asid(),
            privilege,
            self.status.sum(),
            self.status.mxr(),
        );
        if let Some(page_base) = self.mmu.tlb(access_type).lookup(tag, vpn) {
            return Ok(page_base | (vaddr & ((1 << PAGE_SHIFT) - 1)));
        }
        let page_base = self.page_walk(vaddr, access_type, privilege, !debug)?;
        if !debug {
            let asid = self.mmu.satp.asid();
            self.mmu
                .tlb_mut(access_type)
                .insert(tag, vpn, asid, page_base);
        }
        Ok(page_base | (vaddr & ((1 << PAGE_SHIFT) - 1)))
    }

    /// The Sv39/Sv48 page-table walk. With `update_ad`, A and D bits are set in place as a
    /// hardware walker would; without it the walk is side-effect free (host debug reads).
    fn page_walk(
        &mut self,
        vaddr: u64,
        access_type: AccessType,
        privilege: PrivilegeLevel,
        update_ad: bool,
    ) -> MemoryResult<u64> {
        let mode = self.mmu.satp.mode();
        let levels = mode.levels();
        let fault = || {
            debug!(
                vaddr, access_type:%;
                "Page walk fault"
            );
            MemoryError::PageFault(vaddr)
        };
        // STEP 1
        let mut table = self.mmu.satp.ppn() << PAGE_SHIFT;
        for level in (0..levels).rev() {
            // STEP 2
            let vpn = (vaddr >> (PAGE_SHIFT + level * VPN_BITS)) & ((1 << VPN_BITS) - 1);
            let entry_address = table + (vpn << PTE_SHIFT);
            let mut entry = self.read_pte(entry_address, vaddr)?;
            let entry_bits = entry.view_bits_mut::<Lsb0>();
            // STEP 3: V must be set, W-without-R is reserved, and so are the high bits
            // claimed by Svpbmt/Svnapot, which are not implemented.
            if !entry_bits[pte::V]
                || (!entry_bits[pte::R] && entry_bits[pte::W])
                || entry_bits[54..64].any()
            {
                return Err(fault());
            }
            // STEP 4
            if !entry_bits[pte::R] && !entry_bits[pte::X] {
                // This PTE is a pointer to the next level of the page table.
                // But if we're at the last level, this is a page fault.
                if level == 0 {
                    return Err(fault());
                }
                // D, A, and U are reserved in non-leaf PTEs.
                if entry_bits[pte::D] || entry_bits[pte::A] || entry_bits[pte::U] {
                    return Err(fault());
                }
                table = pte::ppn(entry_bits) << PAGE_SHIFT;
                continue;
            }
            // STEP 5: permission checks against the access kind and privilege.
            let user_page = entry_bits[pte::U];
            match privilege {
                PrivilegeLevel::User => {
                    if !user_page {
                        return Err(fault());
                    }
                }
                PrivilegeLevel::Supervisor => {
                    // U-pages are never executable from S-mode, and only readable/writable
                    // when SUM is set.
                    if user_page
                        && (access_type == AccessType::Execute || !self.status.sum())
                    {
                        return Err(fault());
                    }
                }
                PrivilegeLevel::Machine => unreachable!("M-mode accesses bypass translation"),
            }
            let allowed = match access_type {
                AccessType::Execute => entry_bits[pte::X],
                AccessType::Read => {
                    entry_bits[pte::R] || (self.status.mxr() && entry_bits[pte::X])
                }
                AccessType::Write => entry_bits[pte::R] && entry_bits[pte::W],
            };
            if !allowed {
                return Err(fault());
            }
            // STEP 6: a superpage leaf must be aligned to its size.
            let mut ppn = pte::ppn(entry_bits);
            if level != 0 {
                let alignment_mask = (1 << (level * VPN_BITS)) - 1;
                if ppn & alignment_mask != 0 {
                    return Err(fault());
                }
                // STEP 8 (partly): the low PPN bits come from the virtual address.
                ppn |= (vaddr >> PAGE_SHIFT) & alignment_mask;
            }
            // STEP 7: update A/D in place, as a hardware walker would, instead of faulting.
            if update_ad
                && (!entry_bits[pte::A]
                    || (access_type == AccessType::Write && !entry_bits[pte::D]))
            {
                entry_bits.set(pte::A, true);
                if access_type == AccessType::Write {
                    entry_bits.set(pte::D, true);
                }
                self.write_pte(entry_address, entry, vaddr)?;
            }
            trace!(
                vaddr, level;
                "Page walk hit"
            );
            return Ok(ppn << PAGE_SHIFT);
        }
        // Bare mode never enters the walk; Sv39/Sv48 loops always return.
        unreachable!()
    }

    fn read_pte(&mut self, entry_address: u64, vaddr: u64) -> MemoryResult<u64> {
        const_assert!(1 << PTE_SHIFT == 8);
        if !self
            .system_bus
            .accepts(entry_address, 8, AccessType::Read)
        {
            return Err(MemoryError::AccessFault(vaddr));
        }
        Ok(self.system_bus.read(entry_address, AccessWidth::Doubleword))
    }

    fn write_pte(&mut self, entry_address: u64, entry: u64, vaddr: u64) -> MemoryResult<()> {
        if !self
            .system_bus
            .accepts(entry_address, 8, AccessType::Write)
        {
            return Err(MemoryError::AccessFault(vaddr));
        }
        self.system_bus
            .write(entry_address, AccessWidth::Doubleword, entry);
        Ok(())
    }

    /// Checked physical access: the bus must accept the full span.
    fn access_physical(
        &self,
        paddr: u64,
        vaddr: u64,
        size: u64,
        access_type: AccessType,
    ) -> MemoryResult<()> {
        if self.system_bus.accepts(paddr, size, access_type) {
            Ok(())
        } else {
            debug!(
                vaddr, paddr, size, access_type:%;
                "Memory access not accepted by system bus"
            );
            Err(MemoryError::AccessFault(vaddr))
        }
    }

    /// Fetch one instruction (16-bit parcel granularity) at the given pc.
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit little-endian parcels,
    /// > regardless of memory system endianness.
    pub(super) fn fetch_instruction(&mut self, pc: u64) -> MemoryResult<u32> {
        if pc & 1 != 0 {
            return Err(MemoryError::Misaligned(pc));
        }
        let low = self.fetch_parcel(pc)?;
        if low & 0b11 != 0b11 {
            return Ok(low as u32);
        }
        // 32-bit instruction: the second parcel may live on the next page.
        let high = self.fetch_parcel(pc + 2)?;
        Ok((high as u32) << 16 | low as u32)
    }

    fn fetch_parcel(&mut self, vaddr: u64) -> MemoryResult<u16> {
        let paddr = self.translate(vaddr, AccessType::Execute)?;
        self.access_physical(paddr, vaddr, 2, AccessType::Execute)?;
        Ok(self.system_bus.read(paddr, AccessWidth::Halfword) as u16)
    }

    /// Load of `width` bytes at `vaddr`, zero-extended into a u64.
    ///
    /// Misaligned loads that cross a page boundary are decomposed into byte accesses; each
    /// byte's translation can fault independently and precisely.
    pub(super) fn load(&mut self, vaddr: u64, width: AccessWidth) -> MemoryResult<u64> {
        trace!("Loading {width} from memory at vaddr {vaddr:#018x}");
        let size = width.size();
        if crosses_page(vaddr, size) {
            let mut value = 0u64;
            for index in 0..size {
                let byte = self.load_single(vaddr + index, AccessWidth::Byte)?;
                value |= byte << (8 * index);
            }
            return Ok(value);
        }
        self.load_single(vaddr, width)
    }

    fn load_single(&mut self, vaddr: u64, width: AccessWidth) -> MemoryResult<u64> {
        let paddr = self.translate(vaddr, AccessType::Read)?;
        self.access_physical(paddr, vaddr, width.size(), AccessType::Read)?;
        Ok(self.system_bus.read(paddr, width))
    }

    /// Side-effect-free load for host inspection. Never updates A/D bits or the TLBs.
    pub fn load_debug(&mut self, vaddr: u64, width: AccessWidth) -> MemoryResult<u64> {
        let paddr = self.translate_common(vaddr, AccessType::Read, true)?;
        self.access_physical(paddr, vaddr, width.size(), AccessType::Read)?;
        Ok(self.system_bus.read_debug(paddr, width))
    }

    /// Store of `width` bytes at `vaddr`.
    pub(super) fn store(
        &mut self,
        vaddr: u64,
        width: AccessWidth,
        value: u64,
    ) -> MemoryResult<()> {
        trace!(value; "Storing {width} to memory at vaddr {vaddr:#018x}");
        let size = width.size();
        if crosses_page(vaddr, size) {
            // Translate every byte up front so a fault in a later page aborts the whole
            // store without partial effects.
            let mut paddrs = [0u64; 8];
            for index in 0..size {
                let byte_vaddr = vaddr + index;
                let paddr = self.translate(byte_vaddr, AccessType::Write)?;
                self.access_physical(paddr, byte_vaddr, 1, AccessType::Write)?;
                paddrs[index as usize] = paddr;
            }
            for index in 0..size {
                let paddr = paddrs[index as usize];
                self.clear_reservation_if_overlapping(paddr, 1);
                self.system_bus
                    .write(paddr, AccessWidth::Byte, value >> (8 * index) & 0xFF);
            }
            return Ok(());
        }
        let paddr = self.translate(vaddr, AccessType::Write)?;
        self.access_physical(paddr, vaddr, size, AccessType::Write)?;
        self.clear_reservation_if_overlapping(paddr, size);
        self.system_bus.write(paddr, width, value);
        Ok(())
    }
}

/// Whether an access of `size` bytes at `vaddr` spans a page boundary.
fn crosses_page(vaddr: u64, size: u64) -> bool {
    vaddr & ((1 << PAGE_SHIFT) - 1) > (1 << PAGE_SHIFT) - size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satp_warl_mode() {
        let mut satp = Satp::default();
        satp.write(8 << 60 | 0x1234 << 44 | 0x8_0000, u64::MAX);
        assert_eq!(SatpMode::Sv39, satp.mode());
        assert_eq!(0x1234, satp.asid());
        assert_eq!(0x8_0000, satp.ppn());
        // Sv57 (10) is unsupported: MODE is preserved, the other fields are written.
        satp.write(10 << 60 | 0x9_0000, u64::MAX);
        assert_eq!(SatpMode::Sv39, satp.mode());
        assert_eq!(0, satp.asid());
        assert_eq!(0x9_0000, satp.ppn());
        satp.write(9 << 60, u64::MAX);
        assert_eq!(SatpMode::Sv48, satp.mode());
    }

    #[test]
    fn test_tlb_tag_context_sensitivity() {
        let mut tlb = Tlb::new();
        let t_user = tag(0x42, 1, PrivilegeLevel::User, false, false);
        let t_super = tag(0x42, 1, PrivilegeLevel::Supervisor, false, false);
        tlb.insert(t_user, 0x42, 1, 0x8000_0000);
        assert_eq!(Some(0x8000_0000), tlb.lookup(t_user, 0x42));
        // A different privilege level (or SUM/MXR state) misses.
        assert_eq!(None, tlb.lookup(t_super, 0x42));
        assert_ne!(
            tag(0x42, 1, PrivilegeLevel::User, true, false),
            tag(0x42, 1, PrivilegeLevel::User, false, false)
        );
    }

    #[test]
    fn test_tlb_selective_flush() {
        let mut tlb = Tlb::new();
        let t1 = tag(0x10, 1, PrivilegeLevel::Supervisor, false, false);
        let t2 = tag(0x20, 2, PrivilegeLevel::Supervisor, false, false);
        tlb.insert(t1, 0x10, 1, 0x1000);
        tlb.insert(t2, 0x20, 2, 0x2000);
        tlb.flush_matching(Some(1), None);
        assert_eq!(None, tlb.lookup(t1, 0x10));
        assert_eq!(Some(0x2000), tlb.lookup(t2, 0x20));
        tlb.flush_matching(None, Some(0x20));
        assert_eq!(None, tlb.lookup(t2, 0x20));
    }

    #[test]
    fn test_crosses_page() {
        assert!(!crosses_page(0x1000, 8));
        assert!(!crosses_page(0x1FF8, 8));
        assert!(crosses_page(0x1FF9, 8));
        assert!(crosses_page(0x1FFF, 2));
        assert!(!crosses_page(0x1FFF, 1));
    }
}
