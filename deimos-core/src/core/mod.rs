//! Provides the RV64 hart implementation.

mod counters;
pub mod csr;
mod execute;
mod fpu;
mod interrupts;
pub mod mmu;
mod status;
mod trap;

use crate::bus::AccessWidth;
use crate::decoder::table::DeclKind;
use crate::decoder::Decoder;
use crate::instruction::Opcode;
use crate::registers::Registers;
use crate::system_bus::{AccessType, SystemBus};
use crate::{Alignment, PrivilegeLevel, RawPrivilegeLevel};
use counters::{Counteren, Counters};
use execute::Executor;
use fpu::Fpu;
use interrupts::Interrupts;
use log::{debug, trace};
use mmu::{MemoryError, MemoryResult, Mmu};
use status::{FsState, Status};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use thiserror::Error;
use trap::Trap;

pub use csr::CsrSpecifier;

/// Reservation-set granule for LR/SC, in bytes. RISC-V permits any granule of at least XLEN
/// bits; the addressed doubleword is a safe baseline.
pub const RESERVATION_GRANULE: u64 = 8;

const NO_RESERVATION: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct Config {
    /// > The mhartid CSR is an MXLEN-bit read-only register containing the integer ID of the
    /// > hardware thread running the code. This register must be readable in any
    /// > implementation. [...] at least one hart must have a hart ID of zero.
    pub hart_id: u64,
    /// Physical memory address of the memory-mapped mtime register.
    /// The register should be 64 bits wide, and the address must support reads of 8 bytes.
    ///
    /// Note that this address is accessed directly on the system bus, bypassing address
    /// translation.
    pub mtime_address: u64,
    /// Address to which the core's PC register is reset.
    pub reset_vector: u64,
}

/// RISC-V core implementing the RV64IMAFDC_Zifencei ISA with M/S/U privilege modes.
///
/// As we don't support hardware multithreading, every core always only has a single hart.
/// We therefore don't model RISC-V harts explicitly, but rather consider [`Core`] to be the
/// whole of a core with a single hart.
///
/// > From the perspective of software running in a given execution environment, a hart is a
/// > resource that autonomously fetches and executes RISC-V instructions within that execution
/// > environment.
///
/// The core exclusively owns its registers, CSR file, TLBs, and reservation; the only state
/// shared with the outside is the interrupt wire word (see
/// [`Interrupts`](interrupts::Interrupts)) and whatever the system bus routes to.
#[derive(Debug)]
pub struct Core<B: SystemBus> {
    /// Configuration options for this core. See [`Config`].
    config: Config,
    /// The system bus via which physical memory is accessed by this core.
    system_bus: B,
    /// The decoder tree, built once from the instruction table.
    decoder: Decoder,
    /// General purpose registers: x and pc registers.
    registers: Registers,
    /// The core's current privilege mode.
    privilege_mode: PrivilegeLevel,
    /// Staged address of the next instruction; control-transfer handlers overwrite this.
    next_pc: u64,
    /// Status (mstatus, sstatus) register state.
    status: Status,
    /// Trap setup and trap handling registers.
    trap: Trap,
    /// The cycle/instret counters.
    counters: Counters,
    mcounteren: Counteren,
    scounteren: Counteren,
    /// Interrupt pending/enable state, including the shared wire word.
    interrupts: Interrupts,
    /// Address translation state: satp and the software TLBs.
    mmu: Mmu,
    /// Floating-point register file and float CSRs.
    fpu: Fpu,
    /// Physical base of the armed reservation granule, or [`NO_RESERVATION`].
    reservation: u64,
    /// Set by WFI; cleared when an enabled interrupt becomes pending or a trap is taken.
    waiting_for_interrupt: bool,
}

impl<B: SystemBus> Core<B> {
    /// The misa CSR value: MXL=64, extensions A, C, D, F, I, M, S, U.
    ///
    /// > The misa CSR is a WARL read-write register reporting the ISA supported by the hart.
    pub const MISA: u64 = 2 << 62 | 0x14112D;
    /// The mvendorid CSR is set to 0 to indicate this is a non-commercial implementation.
    pub const MVENDORID: u64 = 0;
    /// The marchid CSR is set to 0 to indicate it is not implemented.
    pub const MARCHID: u64 = 0;
    /// The mimpid CSR is set to 0 to indicate it is not implemented.
    pub const MIMPID: u64 = 0;
    /// The mconfigptr CSR is set to 0 to indicate the configuration structure does not exist.
    pub const MCONFIGPTR: u64 = 0;

    pub fn new(system_bus: B, decoder: Decoder, config: Config) -> Self {
        Self::with_interrupt_wires(system_bus, decoder, config, Arc::new(AtomicU64::new(0)))
    }

    /// Create a core whose hardware-asserted mip bits live in `wires`, an atomic word the
    /// platform shares with its interrupt sources.
    pub fn with_interrupt_wires(
        system_bus: B,
        decoder: Decoder,
        config: Config,
        wires: Arc<AtomicU64>,
    ) -> Self {
        let registers = Registers::new(config.reset_vector);
        Self {
            config,
            system_bus,
            decoder,
            registers,
            privilege_mode: PrivilegeLevel::Machine,
            next_pc: 0,
            status: Status::new(),
            trap: Trap::new(),
            counters: Counters::new(),
            mcounteren: Counteren::default(),
            scounteren: Counteren::default(),
            interrupts: Interrupts::with_wires(wires),
            mmu: Mmu::new(),
            fpu: Fpu::new(),
            reservation: NO_RESERVATION,
            waiting_for_interrupt: false,
        }
    }

    /// Provide a read-only view of this core's configuration.
    ///
    /// It is not possible to modify the configuration after creation.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the Hart ID that was assigned to this core's single Hart.
    pub fn hart_id(&self) -> u64 {
        self.config.hart_id
    }

    /// Returns the current privilege mode.
    pub fn privilege_mode(&self) -> PrivilegeLevel {
        self.privilege_mode
    }

    /// Provides immutable access to the general purpose (x) registers, and the pc register.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    /// Provides mutable access to the general purpose (x) registers, and the pc register.
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    /// The atomic word CLINT/PLIC interrupt wires assert into.
    pub fn interrupt_wires(&self) -> Arc<AtomicU64> {
        self.interrupts.wire_word()
    }

    /// Returns `true` while the hart is parked by WFI.
    pub fn is_waiting_for_interrupt(&self) -> bool {
        self.waiting_for_interrupt
    }

    /// Access to the system bus this core was built around.
    pub fn system_bus(&self) -> &B {
        &self.system_bus
    }

    /// Generate a Reset: all hart state returns to its power-on values, with the pc at the
    /// reset vector. Bus-side device state is not touched.
    pub fn reset(&mut self) {
        self.registers = Registers::new(self.config.reset_vector);
        self.privilege_mode = PrivilegeLevel::Machine;
        self.status = Status::new();
        self.trap = Trap::new();
        self.counters = Counters::new();
        self.mcounteren = Counteren::default();
        self.scounteren = Counteren::default();
        self.interrupts.reset();
        self.mmu = Mmu::new();
        self.fpu = Fpu::new();
        self.reservation = NO_RESERVATION;
        self.waiting_for_interrupt = false;
    }

    /// Fetch the next instruction at pc and execute it.
    ///
    /// This is the only operation that advances emulated time. Interrupts are polled at entry,
    /// so they are taken exactly between instructions.
    pub fn step(&mut self) {
        if self.waiting_for_interrupt {
            if self.interrupts.any_pending() {
                self.waiting_for_interrupt = false;
            } else {
                self.counters.increment_cycle();
                return;
            }
        }
        if let Some(interrupt) = self.pending_interrupt() {
            debug!(
                code = interrupt.code();
                "Taking interrupt"
            );
            self.enter_trap(TrapCause::Interrupt(interrupt));
            self.counters.increment_cycle();
            return;
        }
        let pc = self.registers.pc();
        let raw = match self.fetch_instruction(pc) {
            Ok(raw) => raw,
            Err(err) => {
                self.counters.increment_cycle();
                self.enter_trap(TrapCause::Exception(err.as_exception(AccessType::Execute)));
                return;
            }
        };
        self.step_with_raw(raw);
    }

    /// Decode and execute a single raw instruction word as if fetched at the current pc.
    pub fn step_with_raw(&mut self, raw: u32) {
        let pc = self.registers.pc();
        let decoded = self
            .decoder
            .decode(raw)
            .map(|(decl, args)| (decl.kind, decl.size, args));
        let result = match decoded {
            None | Some((DeclKind::Illegal, _, _)) => {
                Err(Exception::IllegalInstruction(Some(raw)))
            }
            Some((DeclKind::Nop, size, _)) => {
                self.next_pc = pc.wrapping_add(size as u64);
                Ok(None)
            }
            Some((DeclKind::Instruction(opcode), size, args)) => {
                self.next_pc = pc.wrapping_add(size as u64);
                let mut executor = Executor { core: self };
                executor.execute(opcode, args).map(|()| Some(opcode))
            }
        };
        self.counters.increment_cycle();
        match result {
            Ok(opcode) => {
                // ECALL and EBREAK are not considered to retire.
                match opcode {
                    Some(Opcode::Ecall) | Some(Opcode::Ebreak) => {}
                    _ => self.counters.increment_instret(),
                }
                *self.registers.pc_mut() = self.next_pc;
            }
            Err(exception) => self.enter_trap(TrapCause::Exception(exception)),
        }
    }

    /// Select the interrupt to take at this instruction boundary, if any.
    ///
    /// > An interrupt i will trap to M-mode [...] if all of the following are true: (a) either
    /// > the current privilege mode is M and the MIE bit in the mstatus register is set, or the
    /// > current privilege mode has less privilege than M-mode; (b) bit i is set in both mip
    /// > and mie; and (c) bit i is not set in mideleg.
    /// > An interrupt i will trap to S-mode if both of the following are true: (a) either the
    /// > current privilege mode is S and the SIE bit in the sstatus register is set, or the
    /// > current privilege mode has less privilege than S-mode; and (b) bit i is set in both
    /// > sip and sie.
    fn pending_interrupt(&self) -> Option<Interrupt> {
        let pending = self.interrupts.read_mip() & self.interrupts.read_mie();
        if pending == 0 {
            return None;
        }
        let mideleg = self.trap.mideleg.mask();
        let m_gate = self.privilege_mode < PrivilegeLevel::Machine || self.status.mie();
        let s_gate = self.privilege_mode < PrivilegeLevel::Supervisor
            || (self.privilege_mode == PrivilegeLevel::Supervisor && self.status.sie());
        let takeable = (if m_gate { pending & !mideleg } else { 0 })
            | (if s_gate && self.privilege_mode <= PrivilegeLevel::Supervisor {
                pending & mideleg
            } else {
                0
            });
        Interrupt::PRIORITY_ORDER
            .into_iter()
            .find(|interrupt| takeable & (1 << interrupt.code()) != 0)
    }

    /// Deliver a trap: write the cause/epc/tval registers of the destination mode, stack the
    /// interrupt-enable and privilege fields, and redirect the pc.
    fn enter_trap(&mut self, cause: TrapCause) {
        let pc = self.registers.pc();
        let privilege_mode = self.privilege_mode;
        // Any trap invalidates the reservation and wakes the hart.
        self.clear_reservation();
        self.waiting_for_interrupt = false;
        // Determine if we should be delegating. Note that `delegate == true` does not
        // necessarily mean the trap will be handled in S-mode, since traps that occur while
        // running in M-mode are always handled in M-mode.
        let delegate = match cause {
            TrapCause::Exception(exception) => self.trap.medeleg.should_delegate(exception),
            TrapCause::Interrupt(interrupt) => self.trap.mideleg.should_delegate(interrupt),
        };
        let trap_to_s_mode = delegate && privilege_mode <= PrivilegeLevel::Supervisor;
        let (code, interrupt) = match cause {
            TrapCause::Exception(exception) => (exception.code(), None),
            TrapCause::Interrupt(interrupt) => (interrupt.code(), Some(interrupt)),
        };
        let cause_value = code | (interrupt.is_some() as u64) << 63;
        let tval = match cause {
            TrapCause::Exception(exception) => exception.tval(pc),
            TrapCause::Interrupt(_) => 0,
        };
        trace!(
            cause = cause_value, tval, pc, to_s = trap_to_s_mode;
            "Entering trap"
        );
        match trap_to_s_mode {
            true => {
                self.trap.write_scause(cause_value, u64::MAX);
                self.trap.write_sepc(pc, u64::MAX);
                self.trap.write_stval(tval, u64::MAX);
                *self.registers.pc_mut() = self.trap.stvec.trap_handler_address(interrupt);
                let status = &mut self.status;
                status.set_spie(status.sie());
                status.set_sie(false);
                status.set_spp(privilege_mode.into());
                self.privilege_mode = PrivilegeLevel::Supervisor;
            }
            false => {
                self.trap.write_mcause(cause_value, u64::MAX);
                self.trap.write_mepc(pc, u64::MAX);
                self.trap.write_mtval(tval, u64::MAX);
                *self.registers.pc_mut() = self.trap.mtvec.trap_handler_address(interrupt);
                let status = &mut self.status;
                status.set_mpie(status.mie());
                status.set_mie(false);
                status.set_mpp(privilege_mode.into());
                self.privilege_mode = PrivilegeLevel::Machine;
            }
        }
    }

    //
    // Reservation set (LR/SC).
    //

    pub(crate) fn clear_reservation(&mut self) {
        self.reservation = NO_RESERVATION;
    }

    /// Drop the reservation if a store to `[paddr, paddr + size)` overlaps its granule.
    pub(crate) fn clear_reservation_if_overlapping(&mut self, paddr: u64, size: u64) {
        if self.reservation == NO_RESERVATION {
            return;
        }
        if paddr < self.reservation + RESERVATION_GRANULE && self.reservation < paddr + size {
            self.reservation = NO_RESERVATION;
        }
    }

    /// Natural alignment check for the atomic instructions, which never decompose.
    fn check_atomic_alignment(vaddr: u64, width: AccessWidth) -> MemoryResult<()> {
        let aligned = Alignment::natural_for_size(width.size())
            .is_some_and(|alignment| alignment.is_aligned(vaddr));
        match aligned {
            true => Ok(()),
            false => Err(MemoryError::Misaligned(vaddr)),
        }
    }

    /// Load-reserved: naturally-aligned load that arms the reservation.
    pub(crate) fn load_reserved(
        &mut self,
        vaddr: u64,
        width: AccessWidth,
    ) -> MemoryResult<u64> {
        Self::check_atomic_alignment(vaddr, width)?;
        let paddr = self.translate(vaddr, AccessType::Read)?;
        if !self.system_bus.accepts(paddr, width.size(), AccessType::Read) {
            return Err(MemoryError::AccessFault(vaddr));
        }
        let value = self.system_bus.read(paddr, width);
        self.reservation = paddr & !(RESERVATION_GRANULE - 1);
        Ok(value)
    }

    /// Store-conditional: returns `true` on success. The reservation is consumed either way.
    pub(crate) fn store_conditional(
        &mut self,
        vaddr: u64,
        width: AccessWidth,
        value: u64,
    ) -> MemoryResult<bool> {
        Self::check_atomic_alignment(vaddr, width)?;
        let paddr = self.translate(vaddr, AccessType::Write)?;
        if !self
            .system_bus
            .accepts(paddr, width.size(), AccessType::Write)
        {
            return Err(MemoryError::AccessFault(vaddr));
        }
        let success = self.reservation == paddr & !(RESERVATION_GRANULE - 1);
        self.clear_reservation();
        if success {
            self.system_bus.write(paddr, width, value);
        }
        Ok(success)
    }

    /// Atomic read-modify-write. Single-hart, so no bus locking; the reservation is
    /// unconditionally invalidated, even when the AMO doesn't touch its granule.
    pub(crate) fn amo(
        &mut self,
        vaddr: u64,
        width: AccessWidth,
        op: impl FnOnce(u64) -> u64,
    ) -> MemoryResult<u64> {
        Self::check_atomic_alignment(vaddr, width)?;
        let paddr = self.translate(vaddr, AccessType::Write)?;
        if !self
            .system_bus
            .accepts(paddr, width.size(), AccessType::Write)
        {
            return Err(MemoryError::AccessFault(vaddr));
        }
        self.clear_reservation();
        let old = self.system_bus.read(paddr, width);
        self.system_bus.write(paddr, width, op(old));
        Ok(old)
    }

    //
    // CSR file.
    //

    /// Read the value of a CSR by its specifier.
    ///
    /// `privilege_level` indicates at what privilege level the read is performed. If the CSR
    /// that is being read requires a higher privilege level, a [`CsrAccessError::Privileged`]
    /// is returned.
    pub fn read_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<u64, CsrAccessError> {
        self.check_csr_access(specifier, privilege_level)?;
        match specifier {
            //
            // Float CSRs. Gated on mstatus.FS.
            //
            csr::FFLAGS | csr::FRM | csr::FCSR => {
                if self.status.fs() == FsState::Off {
                    return Err(CsrAccessError::FsOff);
                }
                Ok(match specifier {
                    csr::FFLAGS => self.fpu.read_fflags(),
                    csr::FRM => self.fpu.read_frm(),
                    _ => self.fpu.read_fcsr(),
                })
            }
            //
            // Unprivileged counter shadows, gated by the counter-enable chain.
            //
            csr::CYCLE => {
                self.check_counter_access(specifier, privilege_level, Counteren::cycle_enabled)?;
                Ok(self.counters.read_mcycle())
            }
            csr::TIME => {
                self.check_counter_access(specifier, privilege_level, Counteren::time_enabled)?;
                Ok(self.read_mtime())
            }
            csr::INSTRET => {
                self.check_counter_access(
                    specifier,
                    privilege_level,
                    Counteren::instret_enabled,
                )?;
                Ok(self.counters.read_minstret())
            }
            //
            // Machine info registers
            //
            csr::MISA => Ok(Self::MISA),
            csr::MVENDORID => Ok(Self::MVENDORID),
            csr::MARCHID => Ok(Self::MARCHID),
            csr::MIMPID => Ok(Self::MIMPID),
            csr::MCONFIGPTR => Ok(Self::MCONFIGPTR),
            csr::MHARTID => Ok(self.config.hart_id),
            //
            // Status registers
            //
            csr::MSTATUS => Ok(self.status.read_mstatus()),
            csr::SSTATUS => Ok(self.status.read_sstatus()),
            //
            // Trap setup registers
            //
            csr::MTVEC => Ok(self.trap.mtvec.read()),
            csr::MEDELEG => Ok(self.trap.medeleg.read()),
            csr::MIDELEG => Ok(self.trap.mideleg.read()),
            csr::MIE => Ok(self.interrupts.read_mie()),
            csr::MCOUNTEREN => Ok(self.mcounteren.read()),
            csr::STVEC => Ok(self.trap.stvec.read()),
            csr::SCOUNTEREN => Ok(self.scounteren.read()),
            csr::SIE => Ok(self.interrupts.read_sie(self.trap.mideleg.mask())),
            //
            // Machine trap handling
            //
            csr::MSCRATCH => Ok(self.trap.read_mscratch()),
            csr::MEPC => Ok(self.trap.read_mepc()),
            csr::MCAUSE => Ok(self.trap.read_mcause()),
            csr::MTVAL => Ok(self.trap.read_mtval()),
            csr::MIP => Ok(self.interrupts.read_mip()),
            //
            // Supervisor trap handling
            //
            csr::SSCRATCH => Ok(self.trap.read_sscratch()),
            csr::SEPC => Ok(self.trap.read_sepc()),
            csr::SCAUSE => Ok(self.trap.read_scause()),
            csr::STVAL => Ok(self.trap.read_stval()),
            csr::SIP => Ok(self.interrupts.read_sip(self.trap.mideleg.mask())),
            //
            // Address translation
            //
            csr::SATP => {
                self.check_satp_access(privilege_level)?;
                Ok(self.mmu.satp.read())
            }
            //
            // Machine counters
            //
            csr::MCYCLE => Ok(self.counters.read_mcycle()),
            csr::MINSTRET => Ok(self.counters.read_minstret()),
            _ => Err(CsrAccessError::CsrUnsupported(specifier)),
        }
    }

    /// Write a (masked) value to a CSR by its specifier.
    ///
    /// Only the bits of `value` for which the corresponding bit in `mask` is `1` will be
    /// written. However, even if `mask == 0`, write side effects will still be performed.
    pub fn write_csr(
        &mut self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
        value: u64,
        mask: u64,
    ) -> Result<(), CsrWriteError> {
        self.check_csr_access(specifier, privilege_level)?;
        if csr::is_read_only(specifier) {
            return Err(CsrWriteError::WriteToReadOnly);
        }
        match specifier {
            csr::FFLAGS | csr::FRM | csr::FCSR => {
                if self.status.fs() == FsState::Off {
                    return Err(CsrAccessError::FsOff.into());
                }
                match specifier {
                    csr::FFLAGS => self.fpu.write_fflags(value, mask),
                    csr::FRM => self.fpu.write_frm(value, mask),
                    _ => self.fpu.write_fcsr(value, mask),
                }
                self.status.set_fs(FsState::Dirty);
            }
            // misa is WARL; this implementation ignores attempts to change the ISA.
            csr::MISA => {}
            //
            // Status registers. A write that changes the translation context drops the TLBs.
            //
            csr::MSTATUS | csr::SSTATUS => {
                let before = (self.status.sum(), self.status.mxr(), self.status.mprv());
                match specifier {
                    csr::MSTATUS => self.status.write_mstatus(value, mask),
                    _ => self.status.write_sstatus(value, mask),
                }
                if before != (self.status.sum(), self.status.mxr(), self.status.mprv()) {
                    self.mmu.flush_all();
                }
            }
            //
            // Trap setup registers
            //
            csr::MTVEC => self.trap.mtvec.write(value, mask),
            csr::MEDELEG => self.trap.medeleg.write(value, mask),
            csr::MIDELEG => self.trap.mideleg.write(value, mask),
            csr::MIE => self.interrupts.write_mie(value, mask),
            csr::MCOUNTEREN => self.mcounteren.write(value, mask),
            csr::STVEC => self.trap.stvec.write(value, mask),
            csr::SCOUNTEREN => self.scounteren.write(value, mask),
            csr::SIE => {
                let mideleg = self.trap.mideleg.mask();
                self.interrupts.write_sie(value, mask, mideleg);
            }
            //
            // Machine trap handling
            //
            csr::MSCRATCH => self.trap.write_mscratch(value, mask),
            csr::MEPC => self.trap.write_mepc(value, mask),
            csr::MCAUSE => self.trap.write_mcause(value, mask),
            csr::MTVAL => self.trap.write_mtval(value, mask),
            csr::MIP => self.interrupts.write_mip(value, mask),
            //
            // Supervisor trap handling
            //
            csr::SSCRATCH => self.trap.write_sscratch(value, mask),
            csr::SEPC => self.trap.write_sepc(value, mask),
            csr::SCAUSE => self.trap.write_scause(value, mask),
            csr::STVAL => self.trap.write_stval(value, mask),
            csr::SIP => {
                let mideleg = self.trap.mideleg.mask();
                self.interrupts.write_sip(value, mask, mideleg);
            }
            //
            // Address translation. Any write drops the TLBs.
            //
            csr::SATP => {
                self.check_satp_access(privilege_level)?;
                self.mmu.satp.write(value, mask);
                self.mmu.flush_all();
            }
            //
            // Machine counters
            //
            csr::MCYCLE => self.counters.write_mcycle(value, mask),
            csr::MINSTRET => self.counters.write_minstret(value, mask),
            _ => Err(CsrAccessError::CsrUnsupported(specifier))?,
        }
        Ok(())
    }

    fn check_csr_access(
        &self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
    ) -> Result<(), CsrAccessError> {
        if !csr::is_valid(specifier) {
            return Err(CsrAccessError::CsrUnsupported(specifier));
        }
        let required_level = csr::required_privilege_level(specifier);
        if privilege_level < required_level {
            return Err(CsrAccessError::Privileged {
                specifier,
                required_level,
                actual_level: privilege_level,
            });
        }
        Ok(())
    }

    /// The counter-enable chain: mcounteren gates S-mode and U-mode reads, scounteren
    /// additionally gates U-mode reads.
    fn check_counter_access(
        &self,
        specifier: CsrSpecifier,
        privilege_level: PrivilegeLevel,
        enabled: impl Fn(&Counteren) -> bool,
    ) -> Result<(), CsrAccessError> {
        let allowed = match privilege_level {
            PrivilegeLevel::Machine => true,
            PrivilegeLevel::Supervisor => enabled(&self.mcounteren),
            PrivilegeLevel::User => enabled(&self.mcounteren) && enabled(&self.scounteren),
        };
        match allowed {
            true => Ok(()),
            false => Err(CsrAccessError::CounterDisabled(specifier)),
        }
    }

    /// > When TVM=1, attempts to read or write the satp CSR [...] while executing in S-mode
    /// > will raise an illegal-instruction exception.
    fn check_satp_access(&self, privilege_level: PrivilegeLevel) -> Result<(), CsrAccessError> {
        if privilege_level == PrivilegeLevel::Supervisor && self.status.tvm() {
            return Err(CsrAccessError::TrapVirtualMemory);
        }
        Ok(())
    }

    /// Performs a read of the memory-mapped mtime register.
    pub fn read_mtime(&self) -> u64 {
        self.system_bus
            .read_debug(self.config.mtime_address, AccessWidth::Doubleword)
    }
}

/// Errors that can occur when attempting to access a CSR.
#[derive(Error, Debug)]
pub enum CsrAccessError {
    #[error("unsupported CSR: {0:#05X}")]
    CsrUnsupported(CsrSpecifier),
    /// Attempt to access a CSR that requires a higher privilege level.
    #[error(
        "cannot access CSR {specifier:#05X} from privilege level {actual_level}, \
             since it requires privilege level {required_level}"
    )]
    Privileged {
        /// The CSR for which access was requested.
        specifier: CsrSpecifier,
        /// The minimum required privilege level to access that CSR.
        required_level: RawPrivilegeLevel,
        /// The actual privilege level from which the access was performed.
        actual_level: PrivilegeLevel,
    },
    /// Attempt to access a float CSR with mstatus.FS = Off.
    #[error("floating-point state is disabled (mstatus.FS=Off)")]
    FsOff,
    /// Attempt to read a counter gated off by mcounteren/scounteren.
    #[error("counter CSR {0:#05X} disabled by counter-enable")]
    CounterDisabled(CsrSpecifier),
    /// Attempt to access satp from S-mode with mstatus.TVM set.
    #[error("satp access trapped by mstatus.TVM")]
    TrapVirtualMemory,
}

/// Errors that can occur when attempting to write to a CSR.
#[derive(Error, Debug)]
pub enum CsrWriteError {
    /// A non-write specific access error. See [`CsrAccessError`].
    #[error("{0}")]
    AccessError(#[from] CsrAccessError),
    /// Attempt to write to a read-only register.
    #[error("writing to read-only CSR is invalid")]
    WriteToReadOnly,
}

/// Result of executing a single instruction. [`Ok`] if execution went normal, [`Err`] if an
/// exception occurred.
pub type ExecutionResult<T = ()> = Result<T, Exception>;

/// The cause of a trap: either a synchronous exception or an asynchronous interrupt.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(Interrupt),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not aligned to a parcel (2-byte) boundary.
    ///
    /// The inner value is the faulting virtual address.
    InstructionAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    InstructionAccessFault(u64),
    /// Generic exception used to communicate one of many possible scenarios:
    ///
    /// - Attempt to decode a reserved instruction.
    /// - Attempt to access a non-existent CSR.
    /// - Attempt to access a CSR without the appropriate privilege level.
    /// - Attempt to write to a read-only CSR.
    /// - Attempt to use floating-point state while mstatus.FS=Off.
    ///
    /// The inner value is the raw instruction if that data was available.
    IllegalInstruction(Option<u32>),
    Breakpoint,
    /// The inner value is the virtual address of the portion of the access that caused the
    /// fault.
    LoadAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    LoadAccessFault(u64),
    /// The inner value is the virtual address of the portion of the access that caused the
    /// fault.
    StoreOrAmoAddressMisaligned(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoAccessFault(u64),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
    /// The inner value is the faulting virtual address.
    InstructionPageFault(u64),
    /// The inner value is the faulting virtual address.
    LoadPageFault(u64),
    /// The inner value is the faulting virtual address.
    StoreOrAmoPageFault(u64),
}

impl Exception {
    pub const INSTRUCTION_ADDRESS_MISALIGNED: u64 = 0;
    pub const INSTRUCTION_ACCESS_FAULT: u64 = 1;
    pub const ILLEGAL_INSTRUCTION: u64 = 2;
    pub const BREAKPOINT: u64 = 3;
    pub const LOAD_ADDRESS_MISALIGNED: u64 = 4;
    pub const LOAD_ACCESS_FAULT: u64 = 5;
    pub const STORE_OR_AMO_ADDRESS_MISALIGNED: u64 = 6;
    pub const STORE_OR_AMO_ACCESS_FAULT: u64 = 7;
    pub const ENVIRONMENT_CALL_FROM_U_MODE: u64 = 8;
    pub const ENVIRONMENT_CALL_FROM_S_MODE: u64 = 9;
    pub const ENVIRONMENT_CALL_FROM_M_MODE: u64 = 11;
    pub const INSTRUCTION_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_OR_AMO_PAGE_FAULT: u64 = 15;

    /// Returns the exception code (cause) for this exception.
    pub const fn code(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(_) => Self::INSTRUCTION_ADDRESS_MISALIGNED,
            Self::InstructionAccessFault(_) => Self::INSTRUCTION_ACCESS_FAULT,
            Self::IllegalInstruction(_) => Self::ILLEGAL_INSTRUCTION,
            Self::Breakpoint => Self::BREAKPOINT,
            Self::LoadAddressMisaligned(_) => Self::LOAD_ADDRESS_MISALIGNED,
            Self::LoadAccessFault(_) => Self::LOAD_ACCESS_FAULT,
            Self::StoreOrAmoAddressMisaligned(_) => Self::STORE_OR_AMO_ADDRESS_MISALIGNED,
            Self::StoreOrAmoAccessFault(_) => Self::STORE_OR_AMO_ACCESS_FAULT,
            Self::EnvironmentCallFromUMode => Self::ENVIRONMENT_CALL_FROM_U_MODE,
            Self::EnvironmentCallFromSMode => Self::ENVIRONMENT_CALL_FROM_S_MODE,
            Self::EnvironmentCallFromMMode => Self::ENVIRONMENT_CALL_FROM_M_MODE,
            Self::InstructionPageFault(_) => Self::INSTRUCTION_PAGE_FAULT,
            Self::LoadPageFault(_) => Self::LOAD_PAGE_FAULT,
            Self::StoreOrAmoPageFault(_) => Self::STORE_OR_AMO_PAGE_FAULT,
        }
    }

    /// The value written to mtval/stval when this exception is taken at `pc`.
    pub fn tval(&self, pc: u64) -> u64 {
        match *self {
            Self::IllegalInstruction(raw) => raw.unwrap_or(0) as u64,
            // The breakpoint's own address, as for other synchronous address exceptions.
            Self::Breakpoint => pc,
            Self::InstructionAddressMisaligned(vaddr)
            | Self::InstructionAccessFault(vaddr)
            | Self::LoadAddressMisaligned(vaddr)
            | Self::StoreOrAmoAddressMisaligned(vaddr)
            | Self::LoadAccessFault(vaddr)
            | Self::StoreOrAmoAccessFault(vaddr)
            | Self::InstructionPageFault(vaddr)
            | Self::LoadPageFault(vaddr)
            | Self::StoreOrAmoPageFault(vaddr) => vaddr,
            Self::EnvironmentCallFromUMode
            | Self::EnvironmentCallFromSMode
            | Self::EnvironmentCallFromMMode => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_map::MemoryMapBuilder;
    use crate::registers::Specifier;
    use crate::resources::ram::Ram;
    use std::rc::Rc;
    use std::sync::atomic::Ordering;

    fn test_core() -> Core<Rc<crate::address_map::MemoryMap>> {
        let mut builder = MemoryMapBuilder::new();
        builder
            .add_at(0x8000_0000, 1 << 20, Rc::new(Ram::new(1 << 20).unwrap()))
            .unwrap();
        let bus = Rc::new(builder.build());
        Core::new(
            bus,
            Decoder::new().unwrap(),
            Config {
                hart_id: 0,
                mtime_address: 0x0200_BFF8,
                reset_vector: 0x8000_0000,
            },
        )
    }

    #[test]
    fn test_csr_round_trip() {
        // Writing a CSR and reading it back returns the written value masked by the CSR's
        // WARL/read-only behaviour.
        let mut core = test_core();
        let m = PrivilegeLevel::Machine;
        let cases: &[(CsrSpecifier, u64, u64)] = &[
            (csr::MSCRATCH, 0xDEAD_BEEF_CAFE_F00D, 0xDEAD_BEEF_CAFE_F00D),
            (csr::SSCRATCH, u64::MAX, u64::MAX),
            // epc registers clear bit 0.
            (csr::MEPC, 0x8000_0003, 0x8000_0002),
            (csr::SEPC, 0x8000_0001, 0x8000_0000),
            // tvec keeps only the supported modes.
            (csr::MTVEC, 0x8000_0001, 0x8000_0001),
            (csr::STVEC, 0x9000_0002, 0x9000_0000),
            (csr::MEDELEG, u64::MAX, 0xB3FF),
            (csr::MIDELEG, u64::MAX, 0x222),
            (csr::MIE, u64::MAX, 0xAAA),
            (csr::MCOUNTEREN, u64::MAX, 0b111),
            (csr::SCOUNTEREN, u64::MAX, 0b111),
            (csr::MCYCLE, 1234, 1234),
            (csr::MINSTRET, 5678, 5678),
            (csr::MCAUSE, 42, 42),
            (csr::MTVAL, 0x1234_5678_9ABC_DEF0, 0x1234_5678_9ABC_DEF0),
            (csr::SATP, 8 << 60 | 1 << 44 | 0x80000, 8 << 60 | 1 << 44 | 0x80000),
        ];
        for &(specifier, written, expected) in cases {
            core.write_csr(specifier, m, written, u64::MAX).unwrap();
            assert_eq!(
                expected,
                core.read_csr(specifier, m).unwrap(),
                "CSR {specifier:#05X}"
            );
        }
        // Read-only CSRs reject writes.
        assert!(matches!(
            core.write_csr(csr::MHARTID, m, 1, u64::MAX),
            Err(CsrWriteError::WriteToReadOnly)
        ));
        // Unknown CSRs are rejected outright.
        assert!(core.read_csr(0x7B0, m).is_err());
    }

    #[test]
    fn test_counter_gating() {
        let mut core = test_core();
        assert!(core.read_csr(csr::CYCLE, PrivilegeLevel::Machine).is_ok());
        // With mcounteren.CY clear, S-mode reads of cycle are rejected.
        assert!(matches!(
            core.read_csr(csr::CYCLE, PrivilegeLevel::Supervisor),
            Err(CsrAccessError::CounterDisabled(_))
        ));
        core.write_csr(csr::MCOUNTEREN, PrivilegeLevel::Machine, 0b001, u64::MAX)
            .unwrap();
        assert!(core
            .read_csr(csr::CYCLE, PrivilegeLevel::Supervisor)
            .is_ok());
        // U-mode additionally needs scounteren.CY.
        assert!(core.read_csr(csr::CYCLE, PrivilegeLevel::User).is_err());
        core.write_csr(csr::SCOUNTEREN, PrivilegeLevel::Machine, 0b001, u64::MAX)
            .unwrap();
        assert!(core.read_csr(csr::CYCLE, PrivilegeLevel::User).is_ok());
    }

    #[test]
    fn test_interrupt_priority_and_gating() {
        let mut core = test_core();
        let wires = core.interrupt_wires();
        core.write_csr(csr::MIE, PrivilegeLevel::Machine, 0xAAA, u64::MAX)
            .unwrap();
        wires.store((1 << 7) | (1 << 9) | (1 << 5), Ordering::SeqCst);
        // In M-mode with mstatus.MIE clear, nothing is taken.
        assert_eq!(None, core.pending_interrupt());
        core.write_csr(csr::MSTATUS, PrivilegeLevel::Machine, 1 << 3, 1 << 3)
            .unwrap();
        // MTI outranks the supervisor interrupts.
        assert_eq!(Some(Interrupt::MachineTimer), core.pending_interrupt());
        // Delegating MTI doesn't exist; delegate SEI+STI to S and lower MTIP: the remaining
        // supervisor interrupts are not taken from M-mode even with MIE set.
        core.write_csr(csr::MIDELEG, PrivilegeLevel::Machine, 0x222, u64::MAX)
            .unwrap();
        wires.store((1 << 9) | (1 << 5), Ordering::SeqCst);
        assert_eq!(None, core.pending_interrupt());
        // From U-mode, delegated interrupts are always takeable; SEI beats STI.
        core.privilege_mode = PrivilegeLevel::User;
        assert_eq!(
            Some(Interrupt::SupervisorExternal),
            core.pending_interrupt()
        );
    }

    #[test]
    fn test_trap_sets_epc_to_faulting_pc() {
        let mut core = test_core();
        let pc = core.registers().pc();
        // An illegal instruction traps with mepc = the pc of the faulting instruction, and
        // mtval = the raw instruction bits.
        core.step_with_raw(0xFFFF_FFFF);
        let m = PrivilegeLevel::Machine;
        assert_eq!(
            Exception::ILLEGAL_INSTRUCTION,
            core.read_csr(csr::MCAUSE, m).unwrap()
        );
        assert_eq!(pc, core.read_csr(csr::MEPC, m).unwrap());
        assert_eq!(0xFFFF_FFFF, core.read_csr(csr::MTVAL, m).unwrap());
        assert_eq!(PrivilegeLevel::Machine, core.privilege_mode());
        // Same policy for EBREAK: epc is the breakpoint's own pc.
        let mut core = test_core();
        let pc = core.registers().pc();
        core.step_with_raw(0x0010_0073);
        assert_eq!(
            Exception::BREAKPOINT,
            core.read_csr(csr::MCAUSE, m).unwrap()
        );
        assert_eq!(pc, core.read_csr(csr::MEPC, m).unwrap());
        assert_eq!(pc, core.read_csr(csr::MTVAL, m).unwrap());
    }

    #[test]
    fn test_writes_to_x0_are_discarded() {
        let mut core = test_core();
        // addi x0, x0, 123
        core.step_with_raw(0x07B0_0013);
        assert_eq!(0, core.registers().x(Specifier::X0));
        // csrrs x5, mhartid, x0 reads without writing.
        core.step_with_raw(0xF140_22F3);
        assert_eq!(0, core.registers().x(Specifier::new(5u8).unwrap()));
    }

    #[test]
    fn test_misaligned_atomics_fault() {
        let mut core = test_core();
        core.registers_mut().set_x(Specifier::X2, 0x8000_0002);
        // lr.w x1, (x2) at a halfword-aligned address must raise a misaligned load fault.
        core.step_with_raw(0x1001_20AF);
        let m = PrivilegeLevel::Machine;
        assert_eq!(
            Exception::LOAD_ADDRESS_MISALIGNED,
            core.read_csr(csr::MCAUSE, m).unwrap()
        );
        assert_eq!(0x8000_0002, core.read_csr(csr::MTVAL, m).unwrap());
    }

    #[test]
    fn test_instret_not_counted_for_traps() {
        let mut core = test_core();
        let m = PrivilegeLevel::Machine;
        core.step_with_raw(0x0000_0013); // nop
        assert_eq!(1, core.read_csr(csr::MINSTRET, m).unwrap());
        core.step_with_raw(0x0000_0073); // ecall (does not retire)
        assert_eq!(1, core.read_csr(csr::MINSTRET, m).unwrap());
        assert_eq!(2, core.read_csr(csr::MCYCLE, m).unwrap());
    }
}

impl Interrupt {
    pub const SUPERVISOR_SOFTWARE: u64 = 1;
    pub const MACHINE_SOFTWARE: u64 = 3;
    pub const SUPERVISOR_TIMER: u64 = 5;
    pub const MACHINE_TIMER: u64 = 7;
    pub const SUPERVISOR_EXTERNAL: u64 = 9;
    pub const MACHINE_EXTERNAL: u64 = 11;

    /// Decreasing priority order for simultaneous pending interrupts.
    pub const PRIORITY_ORDER: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];

    /// Returns the exception code (cause) for this interrupt.
    pub const fn code(&self) -> u64 {
        match self {
            Self::SupervisorSoftware => Self::SUPERVISOR_SOFTWARE,
            Self::MachineSoftware => Self::MACHINE_SOFTWARE,
            Self::SupervisorTimer => Self::SUPERVISOR_TIMER,
            Self::MachineTimer => Self::MACHINE_TIMER,
            Self::SupervisorExternal => Self::SUPERVISOR_EXTERNAL,
            Self::MachineExternal => Self::MACHINE_EXTERNAL,
        }
    }
}
