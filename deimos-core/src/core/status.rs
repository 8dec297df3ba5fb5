use crate::{PrivilegeLevel, RawPrivilegeLevel};
use bitvec::{field::BitField, order::Lsb0, view::BitView};

// Mask of mstatus bits readable through sstatus: SD, UXL, MXR, SUM, XS, FS, VS, SPP, UBE,
// SPIE, SIE.
const SSTATUS_READ_MASK: u64 = 1 << 63 | 0b11 << 32 | 0xD_E762;
// Writable through sstatus: MXR, SUM, FS, SPP, SPIE, SIE.
const SSTATUS_WRITE_MASK: u64 = 0xC_6122;

// Writable mstatus bits: TSR, TW, TVM, MXR, SUM, MPRV, FS, MPP, SPP, MPIE, SPIE, MIE, SIE.
const MSTATUS_WRITE_MASK: u64 = 0x7E_79AA;

/// Encoded state of the `FS` (floating-point unit state) field.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FsState {
    /// All floating-point state access raises illegal-instruction.
    Off = 0,
    Initial = 1,
    Clean = 2,
    Dirty = 3,
}

impl FsState {
    fn from_u2(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::Off,
            1 => Self::Initial,
            2 => Self::Clean,
            _ => Self::Dirty,
        }
    }
}

/// Provides the mstatus and sstatus registers.
///
/// > The mstatus register is an MXLEN-bit read/write register [...]. The mstatus register keeps
/// > track of and controls the hart’s current operating state. A restricted view of mstatus
/// > appears as the sstatus register in the S-level ISA.
///
/// The register is RV64-shaped: there is no mstatush, and `UXL`/`SXL` are read-only fields fixed
/// to 64-bit. All endianness control bits (`UBE`, `SBE`, `MBE`) are hardwired to little-endian.
#[derive(Debug, Clone)]
pub struct Status {
    mstatus: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
    pub const FS: usize = 13;
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
    pub const TVM: usize = 20;
    pub const TW: usize = 21;
    pub const TSR: usize = 22;
    pub const SD: usize = 63;
}

/// `UXL`/`SXL` are fixed to `2` (XLEN=64).
const XL_FIELDS: u64 = 0b1010 << 32;

impl Status {
    pub fn new() -> Self {
        Self { mstatus: 0 }
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    /// Sets the MIE (M-mode Interrupt Enable) bit to `value`.
    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    /// Sets the SIE (S-mode Interrupt Enable) bit to `value`.
    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is set.
    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    /// Sets the MPIE (M-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is set.
    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    /// Sets the SPIE (S-mode Previous Interrupt Enable) bit to `value`.
    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// Returns the privilege level encoded by the MPP (M-mode Previous Privilege level) field.
    ///
    /// The MPP field is **WARL**.
    pub fn mpp(&self) -> PrivilegeLevel {
        RawPrivilegeLevel::from_u2(
            self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le(),
        )
        .try_into()
        .unwrap()
    }

    /// Sets the privilege level encoded by the MPP (M-mode Previous Privilege level) field.
    ///
    /// The MPP field is **WARL**.
    pub fn set_mpp(&mut self, value: RawPrivilegeLevel) {
        let Ok(value) = PrivilegeLevel::try_from(value) else {
            // MPP is a WARL field, so ignore illegal values.
            return;
        };
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..(idx::MPP + 2)].store_le(value as u8);
    }

    /// Returns the privilege level encoded by the SPP (S-mode Previous Privilege level) field.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.mstatus.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    /// Sets the SPP (S-mode Previous Privilege level) field. Only U and S can be encoded;
    /// illegal values are ignored (WARL).
    pub fn set_spp(&mut self, value: RawPrivilegeLevel) {
        match PrivilegeLevel::try_from(value) {
            Ok(value) if value <= PrivilegeLevel::Supervisor => {
                let bit = value as u8 != 0;
                self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPP, bit);
            }
            _ => {} // SPP is a WARL field, so ignore illegal values.
        };
    }

    /// Returns `true` if the MPRV (Modify PRiVilege) bit is set.
    pub fn mprv(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPRV]
    }

    /// Sets the MPRV (Modify PRiVilege) bit to `value`.
    pub fn set_mprv(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPRV, value);
    }

    /// Returns `true` if the SUM (permit Supervisor User Memory access) bit is set.
    pub fn sum(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SUM]
    }

    /// Returns `true` if the MXR (Make eXecutable Readable) bit is set.
    pub fn mxr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MXR]
    }

    /// Returns `true` if the TVM (Trap Virtual Memory) bit is set.
    ///
    /// > When TVM=1, attempts to read or write the satp CSR or execute an SFENCE.VMA [...]
    /// > instruction while executing in S-mode will raise an illegal-instruction exception.
    pub fn tvm(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::TVM]
    }

    /// Returns `true` if the TW (Timeout Wait) bit is set.
    ///
    /// > When TW=1, then if WFI is executed in any less-privileged mode, and it does not
    /// > complete within an implementation-specific, bounded time limit, the WFI instruction
    /// > causes an illegal-instruction exception.
    pub fn tw(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::TW]
    }

    /// Returns `true` if the TSR (Trap SRET) bit is set.
    pub fn tsr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::TSR]
    }

    /// Returns the state of the FS (floating-point unit status) field.
    pub fn fs(&self) -> FsState {
        FsState::from_u2(self.mstatus.view_bits::<Lsb0>()[idx::FS..(idx::FS + 2)].load_le())
    }

    /// Sets the FS (floating-point unit status) field.
    pub fn set_fs(&mut self, value: FsState) {
        self.mstatus.view_bits_mut::<Lsb0>()[idx::FS..(idx::FS + 2)].store_le(value as u8);
    }

    /// Read the full mstatus register.
    pub fn read_mstatus(&self) -> u64 {
        let mut value = self.mstatus | XL_FIELDS;
        // SD summarizes dirty extension state; only FS exists here.
        if self.fs() == FsState::Dirty {
            value |= 1 << idx::SD;
        }
        value
    }

    /// Write the (masked) mstatus register. Read-only and unimplemented fields are preserved.
    pub fn write_mstatus(&mut self, value: u64, mask: u64) {
        let mask = mask & MSTATUS_WRITE_MASK;
        let old_mpp = self.mpp();
        self.mstatus = self.mstatus & !mask | value & mask;
        // MPP is WARL; restore the old value if the reserved encoding was written.
        if mask & (0b11 << idx::MPP) != 0 {
            let raw = RawPrivilegeLevel::from_u2(((self.mstatus >> idx::MPP) & 0b11) as u8);
            if PrivilegeLevel::try_from(raw).is_err() {
                self.set_mpp(old_mpp.into());
            }
        }
    }

    /// Read the sstatus view of mstatus.
    pub fn read_sstatus(&self) -> u64 {
        self.read_mstatus() & SSTATUS_READ_MASK
    }

    /// Write the (masked) sstatus view of mstatus.
    pub fn write_sstatus(&mut self, value: u64, mask: u64) {
        self.write_mstatus(value, mask & SSTATUS_WRITE_MASK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xl_fields_fixed() {
        let status = Status::new();
        // UXL = SXL = 2 (64-bit), read-only.
        assert_eq!(0b10, (status.read_mstatus() >> 32) & 0b11);
        assert_eq!(0b10, (status.read_mstatus() >> 34) & 0b11);
        let mut status = Status::new();
        status.write_mstatus(u64::MAX, u64::MAX);
        assert_eq!(0b10, (status.read_mstatus() >> 32) & 0b11);
    }

    #[test]
    fn test_mpp_warl() {
        let mut status = Status::new();
        status.set_mpp(RawPrivilegeLevel::Supervisor);
        assert_eq!(PrivilegeLevel::Supervisor, status.mpp());
        // Writing the reserved encoding through the register leaves MPP unchanged.
        status.write_mstatus(0b10 << 11, 0b11 << 11);
        assert_eq!(PrivilegeLevel::Supervisor, status.mpp());
        status.write_mstatus(0b11 << 11, 0b11 << 11);
        assert_eq!(PrivilegeLevel::Machine, status.mpp());
    }

    #[test]
    fn test_sstatus_subset() {
        let mut status = Status::new();
        // MIE is invisible through sstatus.
        status.write_sstatus(1 << 3, u64::MAX);
        assert!(!status.mie());
        status.write_sstatus(1 << 1, u64::MAX);
        assert!(status.sie());
        assert_ne!(0, status.read_sstatus() & (1 << 1));
        // TVM is machine-level only.
        status.write_sstatus(1 << 20, u64::MAX);
        assert!(!status.tvm());
    }

    #[test]
    fn test_sd_tracks_fs() {
        let mut status = Status::new();
        assert_eq!(0, status.read_mstatus() >> 63);
        status.set_fs(FsState::Dirty);
        assert_eq!(1, status.read_mstatus() >> 63);
        assert_eq!(1, status.read_sstatus() >> 63);
        status.set_fs(FsState::Clean);
        assert_eq!(0, status.read_mstatus() >> 63);
    }
}
