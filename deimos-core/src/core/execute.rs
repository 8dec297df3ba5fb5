use log::trace;

use crate::bus::AccessWidth;
use crate::core::{Core, Exception, ExecutionResult};
use crate::instruction::{Args, Opcode};
use crate::registers::Specifier;
use crate::softfloat::{double, double_to_single, single, single_to_double, Round};
use crate::system_bus::{AccessType, SystemBus};
use crate::PrivilegeLevel;

use super::status::FsState;

/// Executes decoded instructions against a core.
///
/// Handlers mutate registers, CSRs, or memory, and report exceptions as values; the program
/// counter is staged: `core.next_pc` starts as the address of the next sequential instruction,
/// and control-transfer handlers overwrite it.
#[derive(Debug)]
pub(super) struct Executor<'c, B: SystemBus> {
    pub core: &'c mut Core<B>,
}

impl<'c, B: SystemBus> Executor<'c, B> {
    pub fn execute(&mut self, opcode: Opcode, args: Args) -> ExecutionResult {
        if touches_fpu(opcode) {
            if self.core.status.fs() == FsState::Off {
                return Err(Exception::IllegalInstruction(None));
            }
            self.execute_float(opcode, args)?;
            // Conservatively mark the floating-point state dirty on any retired float
            // instruction.
            self.core.status.set_fs(FsState::Dirty);
            return Ok(());
        }
        match opcode {
            Opcode::Lui => self.lui(args.rd, args.imm),
            Opcode::Auipc => self.auipc(args.rd, args.imm),
            Opcode::Jal => self.jal(args.rd, args.imm),
            Opcode::Jalr => self.jalr(args.rd, args.rs1, args.imm),
            Opcode::Beq => self.branch(args, |a, b| a == b),
            Opcode::Bne => self.branch(args, |a, b| a != b),
            Opcode::Blt => self.branch(args, |a, b| (a as i64) < (b as i64)),
            Opcode::Bge => self.branch(args, |a, b| (a as i64) >= (b as i64)),
            Opcode::Bltu => self.branch(args, |a, b| a < b),
            Opcode::Bgeu => self.branch(args, |a, b| a >= b),
            Opcode::Lb => self.load(args, AccessWidth::Byte, true),
            Opcode::Lh => self.load(args, AccessWidth::Halfword, true),
            Opcode::Lw => self.load(args, AccessWidth::Word, true),
            Opcode::Ld => self.load(args, AccessWidth::Doubleword, true),
            Opcode::Lbu => self.load(args, AccessWidth::Byte, false),
            Opcode::Lhu => self.load(args, AccessWidth::Halfword, false),
            Opcode::Lwu => self.load(args, AccessWidth::Word, false),
            Opcode::Sb => self.store(args, AccessWidth::Byte),
            Opcode::Sh => self.store(args, AccessWidth::Halfword),
            Opcode::Sw => self.store(args, AccessWidth::Word),
            Opcode::Sd => self.store(args, AccessWidth::Doubleword),
            Opcode::Addi => self.reg_imm_op(args, |s, imm| s.wrapping_add_signed(imm)),
            Opcode::Slti => self.reg_imm_op(args, |s, imm| ((s as i64) < imm) as u64),
            Opcode::Sltiu => self.reg_imm_op(args, |s, imm| (s < imm as u64) as u64),
            Opcode::Xori => self.reg_imm_op(args, |s, imm| s ^ imm as u64),
            Opcode::Ori => self.reg_imm_op(args, |s, imm| s | imm as u64),
            Opcode::Andi => self.reg_imm_op(args, |s, imm| s & imm as u64),
            Opcode::Slli => self.shift_imm_op(args, |s, shamt| s << shamt),
            Opcode::Srli => self.shift_imm_op(args, |s, shamt| s >> shamt),
            Opcode::Srai => self.shift_imm_op(args, |s, shamt| ((s as i64) >> shamt) as u64),
            Opcode::Add => self.reg_reg_op(args, |a, b| a.wrapping_add(b)),
            Opcode::Sub => self.reg_reg_op(args, |a, b| a.wrapping_sub(b)),
            Opcode::Sll => self.reg_reg_op(args, |a, b| a << (b & 0x3F)),
            Opcode::Slt => self.reg_reg_op(args, |a, b| ((a as i64) < (b as i64)) as u64),
            Opcode::Sltu => self.reg_reg_op(args, |a, b| (a < b) as u64),
            Opcode::Xor => self.reg_reg_op(args, |a, b| a ^ b),
            Opcode::Srl => self.reg_reg_op(args, |a, b| a >> (b & 0x3F)),
            Opcode::Sra => self.reg_reg_op(args, |a, b| ((a as i64) >> (b & 0x3F)) as u64),
            Opcode::Or => self.reg_reg_op(args, |a, b| a | b),
            Opcode::And => self.reg_reg_op(args, |a, b| a & b),
            Opcode::Fence => self.fence(args.pred, args.succ),
            Opcode::FenceI => self.fence_i(),
            Opcode::Ecall => self.ecall(),
            Opcode::Ebreak => self.ebreak(),
            Opcode::Addiw => self.reg_imm_op32(args, |s, imm| s.wrapping_add(imm as i32 as u32)),
            Opcode::Slliw => self.shift_imm_op32(args, |s, shamt| s << shamt),
            Opcode::Srliw => self.shift_imm_op32(args, |s, shamt| s >> shamt),
            Opcode::Sraiw => {
                self.shift_imm_op32(args, |s, shamt| ((s as i32) >> shamt) as u32)
            }
            Opcode::Addw => self.reg_reg_op32(args, |a, b| a.wrapping_add(b)),
            Opcode::Subw => self.reg_reg_op32(args, |a, b| a.wrapping_sub(b)),
            Opcode::Sllw => self.reg_reg_op32(args, |a, b| a << (b & 0x1F)),
            Opcode::Srlw => self.reg_reg_op32(args, |a, b| a >> (b & 0x1F)),
            Opcode::Sraw => self.reg_reg_op32(args, |a, b| ((a as i32) >> (b & 0x1F)) as u32),
            Opcode::Csrrw => self.csr_op(args, true, |_, src| src),
            Opcode::Csrrs => self.csr_op(args, false, |old, src| old | src),
            Opcode::Csrrc => self.csr_op(args, false, |old, src| old & !src),
            Opcode::Csrrwi => self.csri_op(args, true, |_, src| src),
            Opcode::Csrrsi => self.csri_op(args, false, |old, src| old | src),
            Opcode::Csrrci => self.csri_op(args, false, |old, src| old & !src),
            Opcode::Mul => self.reg_reg_op(args, |a, b| a.wrapping_mul(b)),
            Opcode::Mulh => self.reg_reg_op(args, |a, b| {
                ((a as i64 as i128 * b as i64 as i128) >> 64) as u64
            }),
            Opcode::Mulhsu => self.reg_reg_op(args, |a, b| {
                ((a as i64 as i128).wrapping_mul(b as i128) >> 64) as u64
            }),
            Opcode::Mulhu => {
                self.reg_reg_op(args, |a, b| ((a as u128 * b as u128) >> 64) as u64)
            }
            Opcode::Div => self.reg_reg_op(args, |a, b| div_signed(a as i64, b as i64) as u64),
            Opcode::Divu => self.reg_reg_op(args, |a, b| match b {
                0 => u64::MAX,
                b => a / b,
            }),
            Opcode::Rem => self.reg_reg_op(args, |a, b| rem_signed(a as i64, b as i64) as u64),
            Opcode::Remu => self.reg_reg_op(args, |a, b| match b {
                0 => a,
                b => a % b,
            }),
            Opcode::Mulw => self.reg_reg_op32(args, |a, b| a.wrapping_mul(b)),
            Opcode::Divw => {
                self.reg_reg_op32(args, |a, b| div_signed32(a as i32, b as i32) as u32)
            }
            Opcode::Divuw => self.reg_reg_op32(args, |a, b| match b {
                0 => u32::MAX,
                b => a / b,
            }),
            Opcode::Remw => {
                self.reg_reg_op32(args, |a, b| rem_signed32(a as i32, b as i32) as u32)
            }
            Opcode::Remuw => self.reg_reg_op32(args, |a, b| match b {
                0 => a,
                b => a % b,
            }),
            Opcode::LrW => self.lr(args, AccessWidth::Word),
            Opcode::LrD => self.lr(args, AccessWidth::Doubleword),
            Opcode::ScW => self.sc(args, AccessWidth::Word),
            Opcode::ScD => self.sc(args, AccessWidth::Doubleword),
            Opcode::AmoswapW => self.amo32(args, |_, src| src),
            Opcode::AmoaddW => self.amo32(args, |old, src| old.wrapping_add(src)),
            Opcode::AmoxorW => self.amo32(args, |old, src| old ^ src),
            Opcode::AmoandW => self.amo32(args, |old, src| old & src),
            Opcode::AmoorW => self.amo32(args, |old, src| old | src),
            Opcode::AmominW => self.amo32(args, |old, src| (old as i32).min(src as i32) as u32),
            Opcode::AmomaxW => self.amo32(args, |old, src| (old as i32).max(src as i32) as u32),
            Opcode::AmominuW => self.amo32(args, |old, src| old.min(src)),
            Opcode::AmomaxuW => self.amo32(args, |old, src| old.max(src)),
            Opcode::AmoswapD => self.amo64(args, |_, src| src),
            Opcode::AmoaddD => self.amo64(args, |old, src| old.wrapping_add(src)),
            Opcode::AmoxorD => self.amo64(args, |old, src| old ^ src),
            Opcode::AmoandD => self.amo64(args, |old, src| old & src),
            Opcode::AmoorD => self.amo64(args, |old, src| old | src),
            Opcode::AmominD => self.amo64(args, |old, src| (old as i64).min(src as i64) as u64),
            Opcode::AmomaxD => self.amo64(args, |old, src| (old as i64).max(src as i64) as u64),
            Opcode::AmominuD => self.amo64(args, |old, src| old.min(src)),
            Opcode::AmomaxuD => self.amo64(args, |old, src| old.max(src)),
            Opcode::Sret => self.sret(),
            Opcode::Mret => self.mret(),
            Opcode::Wfi => self.wfi(),
            Opcode::SfenceVma => self.sfence_vma(args.rs1, args.rs2),
            _ => unreachable!("float opcodes are dispatched through execute_float"),
        }
    }

    fn x(&self, specifier: Specifier) -> u64 {
        self.core.registers.x(specifier)
    }

    fn set_x(&mut self, specifier: Specifier, value: u64) {
        self.core.registers.set_x(specifier, value);
    }

    /// Executes a `lui` instruction.
    ///
    /// > LUI (load upper immediate) is used to build 32-bit constants and uses the U-type
    /// > format. LUI places the 32-bit U-immediate value into the destination register rd,
    /// > filling in the lowest 12 bits with zeros. The 32-bit result is sign-extended to 64
    /// > bits.
    fn lui(&mut self, dest: Specifier, immediate: i64) -> ExecutionResult {
        trace!("Executing lui {dest} {immediate}");
        self.set_x(dest, immediate as u64);
        Ok(())
    }

    /// Executes an `auipc` instruction.
    ///
    /// > AUIPC (add upper immediate to pc) is used to build pc-relative addresses and uses the
    /// > U-type format. AUIPC forms a 32-bit offset from the U-immediate, filling in the lowest
    /// > 12 bits with zeros, sign-extends the result to 64 bits, adds it to the address of the
    /// > AUIPC instruction, then places the result in register rd.
    fn auipc(&mut self, dest: Specifier, immediate: i64) -> ExecutionResult {
        trace!("Executing auipc {dest} {immediate}");
        let result = self.core.registers.pc().wrapping_add_signed(immediate);
        self.set_x(dest, result);
        Ok(())
    }

    /// Executes a `jal` instruction.
    ///
    /// > The jump and link (JAL) instruction [...] The offset is sign-extended and added to the
    /// > address of the jump instruction to form the jump target address. [...] JAL stores the
    /// > address of the instruction following the jump (pc+4) into register rd.
    fn jal(&mut self, dest: Specifier, offset: i64) -> ExecutionResult {
        trace!("Executing jal {dest} {offset}");
        let target = self.core.registers.pc().wrapping_add_signed(offset);
        let link = self.core.next_pc;
        self.set_x(dest, link);
        self.core.next_pc = target;
        Ok(())
    }

    /// Executes a `jalr` instruction.
    ///
    /// > The indirect jump instruction JALR (jump and link register) [...] The target address
    /// > is obtained by adding the sign-extended 12-bit I-immediate to the register rs1, then
    /// > setting the least-significant bit of the result to zero.
    fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i64) -> ExecutionResult {
        trace!("Executing jalr {dest} {base} {offset}");
        let target = self.x(base).wrapping_add_signed(offset) & !1;
        let link = self.core.next_pc;
        self.set_x(dest, link);
        self.core.next_pc = target;
        Ok(())
    }

    /// Conditional branch with the given comparison.
    ///
    /// > Branch instructions compare two registers. [...] The 12-bit B-immediate encodes signed
    /// > offsets in multiples of 2 bytes. The offset is sign-extended and added to the address
    /// > of the branch instruction to give the target address.
    fn branch(&mut self, args: Args, condition: fn(u64, u64) -> bool) -> ExecutionResult {
        if condition(self.x(args.rs1), self.x(args.rs2)) {
            self.core.next_pc = self.core.registers.pc().wrapping_add_signed(args.imm);
        }
        Ok(())
    }

    fn load(&mut self, args: Args, width: AccessWidth, sign_extend: bool) -> ExecutionResult {
        let address = self.x(args.rs1).wrapping_add_signed(args.imm);
        let value = self
            .core
            .load(address, width)
            .map_err(|err| err.as_exception(AccessType::Read))?;
        let value = match sign_extend {
            true => sext(value, width),
            false => value,
        };
        self.set_x(args.rd, value);
        Ok(())
    }

    fn store(&mut self, args: Args, width: AccessWidth) -> ExecutionResult {
        let address = self.x(args.rs1).wrapping_add_signed(args.imm);
        let value = self.x(args.rs2);
        self.core
            .store(address, width, value)
            .map_err(|err| err.as_exception(AccessType::Write))
    }

    fn reg_imm_op(&mut self, args: Args, op: fn(u64, i64) -> u64) -> ExecutionResult {
        let result = op(self.x(args.rs1), args.imm);
        self.set_x(args.rd, result);
        Ok(())
    }

    fn reg_reg_op(&mut self, args: Args, op: fn(u64, u64) -> u64) -> ExecutionResult {
        let result = op(self.x(args.rs1), self.x(args.rs2));
        self.set_x(args.rd, result);
        Ok(())
    }

    fn shift_imm_op(&mut self, args: Args, op: fn(u64, u32) -> u64) -> ExecutionResult {
        let result = op(self.x(args.rs1), args.shamt as u32 & 0x3F);
        self.set_x(args.rd, result);
        Ok(())
    }

    /// `*W` operations compute on 32 bits and sign-extend the result to 64 bits.
    fn reg_imm_op32(&mut self, args: Args, op: fn(u32, i64) -> u32) -> ExecutionResult {
        let result = op(self.x(args.rs1) as u32, args.imm);
        self.set_x(args.rd, result as i32 as u64);
        Ok(())
    }

    fn reg_reg_op32(&mut self, args: Args, op: fn(u32, u32) -> u32) -> ExecutionResult {
        let result = op(self.x(args.rs1) as u32, self.x(args.rs2) as u32);
        self.set_x(args.rd, result as i32 as u64);
        Ok(())
    }

    fn shift_imm_op32(&mut self, args: Args, op: fn(u32, u32) -> u32) -> ExecutionResult {
        let result = op(self.x(args.rs1) as u32, args.shamt as u32 & 0x1F);
        self.set_x(args.rd, result as i32 as u64);
        Ok(())
    }

    /// Executes a `fence` instruction.
    ///
    /// This is a single-hart implementation with no caches: all memory operations already
    /// complete in program order, so FENCE retires as a no-op.
    fn fence(&mut self, pred: u8, succ: u8) -> ExecutionResult {
        trace!("Executing fence {pred:#06b} {succ:#06b}");
        Ok(())
    }

    /// Executes a `fence.i` instruction. There is no instruction cache to synchronize.
    fn fence_i(&mut self) -> ExecutionResult {
        trace!("Executing fence.i");
        Ok(())
    }

    /// Executes an `ecall` instruction.
    ///
    /// > The ECALL instruction is used to make a service request to the execution environment.
    /// > [...] ECALL generates a different exception for each originating privilege mode.
    fn ecall(&mut self) -> ExecutionResult {
        Err(match self.core.privilege_mode {
            PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
            PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
            PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
        })
    }

    /// Executes an `ebreak` instruction.
    fn ebreak(&mut self) -> ExecutionResult {
        Err(Exception::Breakpoint)
    }

    /// Executes an `sret` instruction.
    ///
    /// > When TSR=1, attempts to execute SRET while executing in S-mode will raise an
    /// > illegal-instruction exception.
    fn sret(&mut self) -> ExecutionResult {
        if self.core.privilege_mode < PrivilegeLevel::Supervisor
            || (self.core.privilege_mode == PrivilegeLevel::Supervisor
                && self.core.status.tsr())
        {
            return Err(Exception::IllegalInstruction(None));
        }
        trace!("Executing sret");
        let status = &mut self.core.status;
        let previous = status.spp();
        status.set_sie(status.spie());
        status.set_spie(true);
        status.set_spp(crate::RawPrivilegeLevel::User);
        if previous != PrivilegeLevel::Machine {
            status.set_mprv(false);
        }
        self.core.privilege_mode = previous;
        self.core.next_pc = self.core.trap.read_sepc();
        self.core.clear_reservation();
        Ok(())
    }

    /// Executes an `mret` instruction.
    ///
    /// > MRET [...] An xRET instruction can be executed in privilege mode x or higher [...]
    /// > xIE is set to xPIE; the privilege mode is changed to y; xPIE is set to 1; and xPP is
    /// > set to the least-privileged supported mode.
    fn mret(&mut self) -> ExecutionResult {
        if self.core.privilege_mode < PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction(None));
        }
        trace!("Executing mret");
        let status = &mut self.core.status;
        let previous = status.mpp();
        status.set_mie(status.mpie());
        status.set_mpie(true);
        status.set_mpp(crate::RawPrivilegeLevel::User);
        if previous != PrivilegeLevel::Machine {
            status.set_mprv(false);
        }
        self.core.privilege_mode = previous;
        self.core.next_pc = self.core.trap.read_mepc();
        self.core.clear_reservation();
        Ok(())
    }

    /// Executes a `wfi` instruction.
    ///
    /// The hart is parked until an enabled interrupt is pending, regardless of global
    /// interrupt-enable bits. With `mstatus.TW` set, WFI from a less-privileged mode traps
    /// (the bounded time limit is zero).
    fn wfi(&mut self) -> ExecutionResult {
        if self.core.status.tw() && self.core.privilege_mode < PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction(None));
        }
        trace!("Executing wfi");
        self.core.waiting_for_interrupt = true;
        Ok(())
    }

    /// Executes an `sfence.vma` instruction.
    ///
    /// > SFENCE.VMA [...] rs1=x0 and rs2=x0 orders all reads and writes made to any level of
    /// > the page tables for all address spaces. [...] When TVM=1, attempts to [...] execute an
    /// > SFENCE.VMA instruction while executing in S-mode will raise an illegal-instruction
    /// > exception.
    fn sfence_vma(&mut self, rs1: Specifier, rs2: Specifier) -> ExecutionResult {
        match self.core.privilege_mode {
            PrivilegeLevel::User => return Err(Exception::IllegalInstruction(None)),
            PrivilegeLevel::Supervisor if self.core.status.tvm() => {
                return Err(Exception::IllegalInstruction(None))
            }
            _ => {}
        }
        let vaddr = (rs1 != Specifier::X0).then(|| self.x(rs1));
        let asid = (rs2 != Specifier::X0).then(|| self.x(rs2) as u16);
        trace!("Executing sfence.vma vaddr={vaddr:?} asid={asid:?}");
        self.core.mmu.fence_vma(vaddr, asid);
        Ok(())
    }

    /// Common logic for the register CSR instructions.
    ///
    /// > The CSRRW (Atomic Read/Write CSR) instruction atomically swaps values in the CSRs and
    /// > integer registers. [...] If rd=x0, then the instruction shall not read the CSR and
    /// > shall not cause any of the side effects that might occur on a CSR read. [...] For both
    /// > CSRRS and CSRRC, if rs1=x0, then the instruction will not write to the CSR at all.
    fn csr_op(
        &mut self,
        args: Args,
        always_writes: bool,
        op: fn(u64, u64) -> u64,
    ) -> ExecutionResult {
        let source = self.x(args.rs1);
        self.csr_common(args, always_writes, args.rs1 != Specifier::X0, source, op)
    }

    /// Common logic for the immediate CSR instructions; the 5-bit immediate replaces rs1.
    fn csri_op(
        &mut self,
        args: Args,
        always_writes: bool,
        op: fn(u64, u64) -> u64,
    ) -> ExecutionResult {
        let source = args.imm as u64;
        self.csr_common(args, always_writes, source != 0, source, op)
    }

    fn csr_common(
        &mut self,
        args: Args,
        always_writes: bool,
        source_nonzero: bool,
        source: u64,
        op: fn(u64, u64) -> u64,
    ) -> ExecutionResult {
        let privilege = self.core.privilege_mode;
        let writes = always_writes || source_nonzero;
        let reads = !(always_writes && args.rd == Specifier::X0);
        let old = if reads || writes {
            match self.core.read_csr(args.csr, privilege) {
                Ok(value) => value,
                Err(_) if !reads => 0,
                Err(err) => {
                    trace!("CSR read failed: {err}");
                    return Err(Exception::IllegalInstruction(None));
                }
            }
        } else {
            0
        };
        if writes {
            let value = op(old, source);
            self.core
                .write_csr(args.csr, privilege, value, u64::MAX)
                .map_err(|err| {
                    trace!("CSR write failed: {err}");
                    Exception::IllegalInstruction(None)
                })?;
        }
        if reads {
            self.set_x(args.rd, old);
        }
        Ok(())
    }

    /// Executes an `lr.w`/`lr.d` instruction.
    ///
    /// > LR.W loads a word from the address in rs1, places the sign-extended value in rd, and
    /// > registers a reservation set — a set of bytes that subsumes the bytes in the addressed
    /// > word.
    fn lr(&mut self, args: Args, width: AccessWidth) -> ExecutionResult {
        let address = self.x(args.rs1);
        let value = self
            .core
            .load_reserved(address, width)
            .map_err(|err| err.as_exception(AccessType::Read))?;
        self.set_x(args.rd, sext(value, width));
        Ok(())
    }

    /// Executes an `sc.w`/`sc.d` instruction.
    ///
    /// > SC.W conditionally writes a word in rs2 to the address in rs1: the SC.W succeeds only
    /// > if the reservation is still valid and the reservation set contains the bytes being
    /// > written. If the SC.W succeeds [...] rd is set to zero. Otherwise [...] rd is set to a
    /// > nonzero value.
    fn sc(&mut self, args: Args, width: AccessWidth) -> ExecutionResult {
        let address = self.x(args.rs1);
        let value = self.x(args.rs2);
        let success = self
            .core
            .store_conditional(address, width, value)
            .map_err(|err| err.as_exception(AccessType::Write))?;
        self.set_x(args.rd, !success as u64);
        Ok(())
    }

    fn amo32(&mut self, args: Args, op: fn(u32, u32) -> u32) -> ExecutionResult {
        let address = self.x(args.rs1);
        let source = self.x(args.rs2) as u32;
        let old = self
            .core
            .amo(address, AccessWidth::Word, |old| {
                op(old as u32, source) as u64
            })
            .map_err(|err| err.as_exception(AccessType::Write))?;
        self.set_x(args.rd, old as u32 as i32 as u64);
        Ok(())
    }

    fn amo64(&mut self, args: Args, op: fn(u64, u64) -> u64) -> ExecutionResult {
        let address = self.x(args.rs1);
        let source = self.x(args.rs2);
        let old = self
            .core
            .amo(address, AccessWidth::Doubleword, |old| op(old, source))
            .map_err(|err| err.as_exception(AccessType::Write))?;
        self.set_x(args.rd, old);
        Ok(())
    }

    //
    // Floating-point operations (F and D).
    //

    fn execute_float(&mut self, opcode: Opcode, args: Args) -> ExecutionResult {
        match opcode {
            Opcode::Flw => {
                let address = self.x(args.rs1).wrapping_add_signed(args.imm);
                let value = self
                    .core
                    .load(address, AccessWidth::Word)
                    .map_err(|err| err.as_exception(AccessType::Read))?;
                self.core.fpu.write_single(args.rd, value as u32);
                Ok(())
            }
            Opcode::Fld => {
                let address = self.x(args.rs1).wrapping_add_signed(args.imm);
                let value = self
                    .core
                    .load(address, AccessWidth::Doubleword)
                    .map_err(|err| err.as_exception(AccessType::Read))?;
                self.core.fpu.write(args.rd, value);
                Ok(())
            }
            Opcode::Fsw => {
                let address = self.x(args.rs1).wrapping_add_signed(args.imm);
                // Stores move the raw register bits, NaN box and all.
                let value = self.core.fpu.read(args.rs2) as u32;
                self.core
                    .store(address, AccessWidth::Word, value as u64)
                    .map_err(|err| err.as_exception(AccessType::Write))
            }
            Opcode::Fsd => {
                let address = self.x(args.rs1).wrapping_add_signed(args.imm);
                let value = self.core.fpu.read(args.rs2);
                self.core
                    .store(address, AccessWidth::Doubleword, value)
                    .map_err(|err| err.as_exception(AccessType::Write))
            }
            Opcode::FaddS => self.float_op_s(args, single::add),
            Opcode::FsubS => self.float_op_s(args, single::sub),
            Opcode::FmulS => self.float_op_s(args, single::mul),
            Opcode::FdivS => self.float_op_s(args, single::div),
            Opcode::FaddD => self.float_op_d(args, double::add),
            Opcode::FsubD => self.float_op_d(args, double::sub),
            Opcode::FmulD => self.float_op_d(args, double::mul),
            Opcode::FdivD => self.float_op_d(args, double::div),
            Opcode::FsqrtS => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = single::sqrt(self.core.fpu.read_single(args.rs1), rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write_single(args.rd, result);
                Ok(())
            }
            Opcode::FsqrtD => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = double::sqrt(self.core.fpu.read(args.rs1), rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write(args.rd, result);
                Ok(())
            }
            Opcode::FmaddS => self.fma_s(args, false, false),
            Opcode::FmsubS => self.fma_s(args, false, true),
            Opcode::FnmsubS => self.fma_s(args, true, false),
            Opcode::FnmaddS => self.fma_s(args, true, true),
            Opcode::FmaddD => self.fma_d(args, false, false),
            Opcode::FmsubD => self.fma_d(args, false, true),
            Opcode::FnmsubD => self.fma_d(args, true, false),
            Opcode::FnmaddD => self.fma_d(args, true, true),
            Opcode::FsgnjS => self.sgnj_s(args, |a, b| (a & !SIGN32) | (b & SIGN32)),
            Opcode::FsgnjnS => self.sgnj_s(args, |a, b| (a & !SIGN32) | (!b & SIGN32)),
            Opcode::FsgnjxS => self.sgnj_s(args, |a, b| a ^ (b & SIGN32)),
            Opcode::FsgnjD => self.sgnj_d(args, |a, b| (a & !SIGN64) | (b & SIGN64)),
            Opcode::FsgnjnD => self.sgnj_d(args, |a, b| (a & !SIGN64) | (!b & SIGN64)),
            Opcode::FsgnjxD => self.sgnj_d(args, |a, b| a ^ (b & SIGN64)),
            Opcode::FminS => self.float_nofl_s(args, single::min),
            Opcode::FmaxS => self.float_nofl_s(args, single::max),
            Opcode::FminD => self.float_nofl_d(args, double::min),
            Opcode::FmaxD => self.float_nofl_d(args, double::max),
            Opcode::FeqS => self.compare_s(args, single::eq_quiet),
            Opcode::FltS => self.compare_s(args, single::lt),
            Opcode::FleS => self.compare_s(args, single::le),
            Opcode::FeqD => self.compare_d(args, double::eq_quiet),
            Opcode::FltD => self.compare_d(args, double::lt),
            Opcode::FleD => self.compare_d(args, double::le),
            Opcode::FclassS => {
                let mask = single::classify(self.core.fpu.read_single(args.rs1));
                self.set_x(args.rd, mask as u64);
                Ok(())
            }
            Opcode::FclassD => {
                let mask = double::classify(self.core.fpu.read(args.rs1));
                self.set_x(args.rd, mask as u64);
                Ok(())
            }
            Opcode::FcvtWS => self.float_to_int_s(args, true, 32),
            Opcode::FcvtWuS => self.float_to_int_s(args, false, 32),
            Opcode::FcvtLS => self.float_to_int_s(args, true, 64),
            Opcode::FcvtLuS => self.float_to_int_s(args, false, 64),
            Opcode::FcvtWD => self.float_to_int_d(args, true, 32),
            Opcode::FcvtWuD => self.float_to_int_d(args, false, 32),
            Opcode::FcvtLD => self.float_to_int_d(args, true, 64),
            Opcode::FcvtLuD => self.float_to_int_d(args, false, 64),
            Opcode::FcvtSW => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = single::from_i32(self.x(args.rs1) as i32, rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write_single(args.rd, result);
                Ok(())
            }
            Opcode::FcvtSWu => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = single::from_u32(self.x(args.rs1) as u32, rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write_single(args.rd, result);
                Ok(())
            }
            Opcode::FcvtSL => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = single::from_i64(self.x(args.rs1) as i64, rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write_single(args.rd, result);
                Ok(())
            }
            Opcode::FcvtSLu => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = single::from_u64(self.x(args.rs1), rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write_single(args.rd, result);
                Ok(())
            }
            Opcode::FcvtDW => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = double::from_i32(self.x(args.rs1) as i32, rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write(args.rd, result);
                Ok(())
            }
            Opcode::FcvtDWu => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = double::from_u32(self.x(args.rs1) as u32, rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write(args.rd, result);
                Ok(())
            }
            Opcode::FcvtDL => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = double::from_i64(self.x(args.rs1) as i64, rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write(args.rd, result);
                Ok(())
            }
            Opcode::FcvtDLu => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = double::from_u64(self.x(args.rs1), rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write(args.rd, result);
                Ok(())
            }
            Opcode::FcvtSD => {
                let rm = self.rounding(args.rm)?;
                let (result, flags) = double_to_single(self.core.fpu.read(args.rs1), rm);
                self.core.fpu.accrue(flags);
                self.core.fpu.write_single(args.rd, result);
                Ok(())
            }
            Opcode::FcvtDS => {
                // Widening is exact; the rm field is ignored (but must still be legal).
                self.rounding(args.rm)?;
                let (result, flags) = single_to_double(self.core.fpu.read_single(args.rs1));
                self.core.fpu.accrue(flags);
                self.core.fpu.write(args.rd, result);
                Ok(())
            }
            Opcode::FmvXW => {
                // Bit-pattern move; the value is sign-extended, not NaN-boxed.
                let value = self.core.fpu.read(args.rs1) as u32;
                self.set_x(args.rd, value as i32 as u64);
                Ok(())
            }
            Opcode::FmvWX => {
                let value = self.x(args.rs1) as u32;
                self.core.fpu.write_single(args.rd, value);
                Ok(())
            }
            Opcode::FmvXD => {
                let value = self.core.fpu.read(args.rs1);
                self.set_x(args.rd, value);
                Ok(())
            }
            Opcode::FmvDX => {
                let value = self.x(args.rs1);
                self.core.fpu.write(args.rd, value);
                Ok(())
            }
            _ => unreachable!("integer opcodes are dispatched through execute"),
        }
    }

    fn rounding(&self, rm: u8) -> Result<Round, Exception> {
        self.core
            .fpu
            .resolve_rounding(rm)
            .ok_or(Exception::IllegalInstruction(None))
    }

    fn float_op_s(&mut self, args: Args, op: fn(u32, u32, Round) -> (u32, u8)) -> ExecutionResult {
        let rm = self.rounding(args.rm)?;
        let a = self.core.fpu.read_single(args.rs1);
        let b = self.core.fpu.read_single(args.rs2);
        let (result, flags) = op(a, b, rm);
        self.core.fpu.accrue(flags);
        self.core.fpu.write_single(args.rd, result);
        Ok(())
    }

    fn float_op_d(&mut self, args: Args, op: fn(u64, u64, Round) -> (u64, u8)) -> ExecutionResult {
        let rm = self.rounding(args.rm)?;
        let a = self.core.fpu.read(args.rs1);
        let b = self.core.fpu.read(args.rs2);
        let (result, flags) = op(a, b, rm);
        self.core.fpu.accrue(flags);
        self.core.fpu.write(args.rd, result);
        Ok(())
    }

    fn float_nofl_s(&mut self, args: Args, op: fn(u32, u32) -> (u32, u8)) -> ExecutionResult {
        let a = self.core.fpu.read_single(args.rs1);
        let b = self.core.fpu.read_single(args.rs2);
        let (result, flags) = op(a, b);
        self.core.fpu.accrue(flags);
        self.core.fpu.write_single(args.rd, result);
        Ok(())
    }

    fn float_nofl_d(&mut self, args: Args, op: fn(u64, u64) -> (u64, u8)) -> ExecutionResult {
        let a = self.core.fpu.read(args.rs1);
        let b = self.core.fpu.read(args.rs2);
        let (result, flags) = op(a, b);
        self.core.fpu.accrue(flags);
        self.core.fpu.write(args.rd, result);
        Ok(())
    }

    fn compare_s(&mut self, args: Args, op: fn(u32, u32) -> (bool, u8)) -> ExecutionResult {
        let a = self.core.fpu.read_single(args.rs1);
        let b = self.core.fpu.read_single(args.rs2);
        let (result, flags) = op(a, b);
        self.core.fpu.accrue(flags);
        self.set_x(args.rd, result as u64);
        Ok(())
    }

    fn compare_d(&mut self, args: Args, op: fn(u64, u64) -> (bool, u8)) -> ExecutionResult {
        let a = self.core.fpu.read(args.rs1);
        let b = self.core.fpu.read(args.rs2);
        let (result, flags) = op(a, b);
        self.core.fpu.accrue(flags);
        self.set_x(args.rd, result as u64);
        Ok(())
    }

    fn sgnj_s(&mut self, args: Args, op: fn(u32, u32) -> u32) -> ExecutionResult {
        let a = self.core.fpu.read_single(args.rs1);
        let b = self.core.fpu.read_single(args.rs2);
        self.core.fpu.write_single(args.rd, op(a, b));
        Ok(())
    }

    fn sgnj_d(&mut self, args: Args, op: fn(u64, u64) -> u64) -> ExecutionResult {
        let a = self.core.fpu.read(args.rs1);
        let b = self.core.fpu.read(args.rs2);
        self.core.fpu.write(args.rd, op(a, b));
        Ok(())
    }

    /// The four fused multiply-add forms differ only in which signs they negate:
    /// FMADD computes `rs1*rs2 + rs3`, FMSUB `rs1*rs2 - rs3`, FNMSUB `-(rs1*rs2) + rs3`, and
    /// FNMADD `-(rs1*rs2) - rs3`.
    fn fma_s(&mut self, args: Args, negate_product: bool, negate_addend: bool) -> ExecutionResult {
        let rm = self.rounding(args.rm)?;
        let mut a = self.core.fpu.read_single(args.rs1);
        let b = self.core.fpu.read_single(args.rs2);
        let mut c = self.core.fpu.read_single(args.rs3);
        if negate_product {
            a ^= SIGN32;
        }
        if negate_addend {
            c ^= SIGN32;
        }
        let (result, flags) = single::fma(a, b, c, rm);
        self.core.fpu.accrue(flags);
        self.core.fpu.write_single(args.rd, result);
        Ok(())
    }

    fn fma_d(&mut self, args: Args, negate_product: bool, negate_addend: bool) -> ExecutionResult {
        let rm = self.rounding(args.rm)?;
        let mut a = self.core.fpu.read(args.rs1);
        let b = self.core.fpu.read(args.rs2);
        let mut c = self.core.fpu.read(args.rs3);
        if negate_product {
            a ^= SIGN64;
        }
        if negate_addend {
            c ^= SIGN64;
        }
        let (result, flags) = double::fma(a, b, c, rm);
        self.core.fpu.accrue(flags);
        self.core.fpu.write(args.rd, result);
        Ok(())
    }

    fn float_to_int_s(&mut self, args: Args, signed: bool, width: u32) -> ExecutionResult {
        let rm = self.rounding(args.rm)?;
        let value = self.core.fpu.read_single(args.rs1);
        let (result, flags) = single::to_int(value, rm, signed, width);
        self.core.fpu.accrue(flags);
        self.set_x(args.rd, result);
        Ok(())
    }

    fn float_to_int_d(&mut self, args: Args, signed: bool, width: u32) -> ExecutionResult {
        let rm = self.rounding(args.rm)?;
        let value = self.core.fpu.read(args.rs1);
        let (result, flags) = double::to_int(value, rm, signed, width);
        self.core.fpu.accrue(flags);
        self.set_x(args.rd, result);
        Ok(())
    }
}

const SIGN32: u32 = 1 << 31;
const SIGN64: u64 = 1 << 63;

/// Sign-extend the low `width` bytes of `value` to 64 bits.
fn sext(value: u64, width: AccessWidth) -> u64 {
    let shift = 64 - 8 * width.size() as u32;
    (((value << shift) as i64) >> shift) as u64
}

/// > Division by zero: the quotient of division by zero has all bits set. [...] Signed division
/// > overflow: the quotient [...] is equal to the dividend.
fn div_signed(a: i64, b: i64) -> i64 {
    match (a, b) {
        (_, 0) => -1,
        (i64::MIN, -1) => i64::MIN,
        (a, b) => a / b,
    }
}

/// > The remainder of division by zero equals the dividend. [...] Signed remainder overflow:
/// > the remainder is zero.
fn rem_signed(a: i64, b: i64) -> i64 {
    match (a, b) {
        (a, 0) => a,
        (i64::MIN, -1) => 0,
        (a, b) => a % b,
    }
}

fn div_signed32(a: i32, b: i32) -> i32 {
    match (a, b) {
        (_, 0) => -1,
        (i32::MIN, -1) => i32::MIN,
        (a, b) => a / b,
    }
}

fn rem_signed32(a: i32, b: i32) -> i32 {
    match (a, b) {
        (a, 0) => a,
        (i32::MIN, -1) => 0,
        (a, b) => a % b,
    }
}

/// Whether an operation reads or writes floating-point state (and so requires `mstatus.FS` to
/// be enabled).
fn touches_fpu(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        Flw | Fsw
            | Fld
            | Fsd
            | FmaddS
            | FmsubS
            | FnmsubS
            | FnmaddS
            | FaddS
            | FsubS
            | FmulS
            | FdivS
            | FsqrtS
            | FsgnjS
            | FsgnjnS
            | FsgnjxS
            | FminS
            | FmaxS
            | FcvtWS
            | FcvtWuS
            | FcvtLS
            | FcvtLuS
            | FmvXW
            | FeqS
            | FltS
            | FleS
            | FclassS
            | FcvtSW
            | FcvtSWu
            | FcvtSL
            | FcvtSLu
            | FmvWX
            | FmaddD
            | FmsubD
            | FnmsubD
            | FnmaddD
            | FaddD
            | FsubD
            | FmulD
            | FdivD
            | FsqrtD
            | FsgnjD
            | FsgnjnD
            | FsgnjxD
            | FminD
            | FmaxD
            | FcvtSD
            | FcvtDS
            | FeqD
            | FltD
            | FleD
            | FclassD
            | FcvtWD
            | FcvtWuD
            | FcvtLD
            | FcvtLuD
            | FcvtDW
            | FcvtDWu
            | FcvtDL
            | FcvtDLu
            | FmvXD
            | FmvDX
    )
}
