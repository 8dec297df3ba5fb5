//! Instruction operations and decoded operands.
//!
//! The decoder maps an instruction word to a *declaration* from the instruction table plus a set
//! of extracted operands ([`Args`]). Compressed encodings declare the same operations as their
//! canonical 32-bit forms with remapped operand bindings, so execution never needs to know an
//! instruction was compressed (apart from the PC increment).

use crate::registers::Specifier;
use std::fmt;

macro_rules! opcodes {
    ($($name:literal => $variant:ident,)*) => {
        /// Every operation the hart can execute, one per instruction in the table.
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            /// Resolve a table instruction name to its operation.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// The canonical assembly mnemonic.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

opcodes! {
    // RV64I
    "lui" => Lui,
    "auipc" => Auipc,
    "jal" => Jal,
    "jalr" => Jalr,
    "beq" => Beq,
    "bne" => Bne,
    "blt" => Blt,
    "bge" => Bge,
    "bltu" => Bltu,
    "bgeu" => Bgeu,
    "lb" => Lb,
    "lh" => Lh,
    "lw" => Lw,
    "ld" => Ld,
    "lbu" => Lbu,
    "lhu" => Lhu,
    "lwu" => Lwu,
    "sb" => Sb,
    "sh" => Sh,
    "sw" => Sw,
    "sd" => Sd,
    "addi" => Addi,
    "slti" => Slti,
    "sltiu" => Sltiu,
    "xori" => Xori,
    "ori" => Ori,
    "andi" => Andi,
    "slli" => Slli,
    "srli" => Srli,
    "srai" => Srai,
    "add" => Add,
    "sub" => Sub,
    "sll" => Sll,
    "slt" => Slt,
    "sltu" => Sltu,
    "xor" => Xor,
    "srl" => Srl,
    "sra" => Sra,
    "or" => Or,
    "and" => And,
    "fence" => Fence,
    "fence.i" => FenceI,
    "ecall" => Ecall,
    "ebreak" => Ebreak,
    "addiw" => Addiw,
    "slliw" => Slliw,
    "srliw" => Srliw,
    "sraiw" => Sraiw,
    "addw" => Addw,
    "subw" => Subw,
    "sllw" => Sllw,
    "srlw" => Srlw,
    "sraw" => Sraw,
    // Zicsr
    "csrrw" => Csrrw,
    "csrrs" => Csrrs,
    "csrrc" => Csrrc,
    "csrrwi" => Csrrwi,
    "csrrsi" => Csrrsi,
    "csrrci" => Csrrci,
    // M
    "mul" => Mul,
    "mulh" => Mulh,
    "mulhsu" => Mulhsu,
    "mulhu" => Mulhu,
    "div" => Div,
    "divu" => Divu,
    "rem" => Rem,
    "remu" => Remu,
    "mulw" => Mulw,
    "divw" => Divw,
    "divuw" => Divuw,
    "remw" => Remw,
    "remuw" => Remuw,
    // A
    "lr.w" => LrW,
    "sc.w" => ScW,
    "amoswap.w" => AmoswapW,
    "amoadd.w" => AmoaddW,
    "amoxor.w" => AmoxorW,
    "amoand.w" => AmoandW,
    "amoor.w" => AmoorW,
    "amomin.w" => AmominW,
    "amomax.w" => AmomaxW,
    "amominu.w" => AmominuW,
    "amomaxu.w" => AmomaxuW,
    "lr.d" => LrD,
    "sc.d" => ScD,
    "amoswap.d" => AmoswapD,
    "amoadd.d" => AmoaddD,
    "amoxor.d" => AmoxorD,
    "amoand.d" => AmoandD,
    "amoor.d" => AmoorD,
    "amomin.d" => AmominD,
    "amomax.d" => AmomaxD,
    "amominu.d" => AmominuD,
    "amomaxu.d" => AmomaxuD,
    // F
    "flw" => Flw,
    "fsw" => Fsw,
    "fmadd.s" => FmaddS,
    "fmsub.s" => FmsubS,
    "fnmsub.s" => FnmsubS,
    "fnmadd.s" => FnmaddS,
    "fadd.s" => FaddS,
    "fsub.s" => FsubS,
    "fmul.s" => FmulS,
    "fdiv.s" => FdivS,
    "fsqrt.s" => FsqrtS,
    "fsgnj.s" => FsgnjS,
    "fsgnjn.s" => FsgnjnS,
    "fsgnjx.s" => FsgnjxS,
    "fmin.s" => FminS,
    "fmax.s" => FmaxS,
    "fcvt.w.s" => FcvtWS,
    "fcvt.wu.s" => FcvtWuS,
    "fcvt.l.s" => FcvtLS,
    "fcvt.lu.s" => FcvtLuS,
    "fmv.x.w" => FmvXW,
    "feq.s" => FeqS,
    "flt.s" => FltS,
    "fle.s" => FleS,
    "fclass.s" => FclassS,
    "fcvt.s.w" => FcvtSW,
    "fcvt.s.wu" => FcvtSWu,
    "fcvt.s.l" => FcvtSL,
    "fcvt.s.lu" => FcvtSLu,
    "fmv.w.x" => FmvWX,
    // D
    "fld" => Fld,
    "fsd" => Fsd,
    "fmadd.d" => FmaddD,
    "fmsub.d" => FmsubD,
    "fnmsub.d" => FnmsubD,
    "fnmadd.d" => FnmaddD,
    "fadd.d" => FaddD,
    "fsub.d" => FsubD,
    "fmul.d" => FmulD,
    "fdiv.d" => FdivD,
    "fsqrt.d" => FsqrtD,
    "fsgnj.d" => FsgnjD,
    "fsgnjn.d" => FsgnjnD,
    "fsgnjx.d" => FsgnjxD,
    "fmin.d" => FminD,
    "fmax.d" => FmaxD,
    "fcvt.s.d" => FcvtSD,
    "fcvt.d.s" => FcvtDS,
    "feq.d" => FeqD,
    "flt.d" => FltD,
    "fle.d" => FleD,
    "fclass.d" => FclassD,
    "fcvt.w.d" => FcvtWD,
    "fcvt.wu.d" => FcvtWuD,
    "fcvt.l.d" => FcvtLD,
    "fcvt.lu.d" => FcvtLuD,
    "fcvt.d.w" => FcvtDW,
    "fcvt.d.wu" => FcvtDWu,
    "fcvt.d.l" => FcvtDL,
    "fcvt.d.lu" => FcvtDLu,
    "fmv.x.d" => FmvXD,
    "fmv.d.x" => FmvDX,
    // Privileged
    "sret" => Sret,
    "mret" => Mret,
    "wfi" => Wfi,
    "sfence.vma" => SfenceVma,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The named operand slots an argument binding can target.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArgSlot {
    Rd,
    Rs1,
    Rs2,
    Rs3,
    Imm,
    Shamt,
    Csr,
    Rm,
    Aq,
    Rl,
    Pred,
    Succ,
}

impl ArgSlot {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rd" => Self::Rd,
            "rs1" => Self::Rs1,
            "rs2" => Self::Rs2,
            "rs3" => Self::Rs3,
            "imm" => Self::Imm,
            "shamt" => Self::Shamt,
            "csr" => Self::Csr,
            "rm" => Self::Rm,
            "aq" => Self::Aq,
            "rl" => Self::Rl,
            "pred" => Self::Pred,
            "succ" => Self::Succ,
            _ => return None,
        })
    }
}

/// Operands extracted from a single instruction word.
///
/// Register slots hold `x`/`f` register indices depending on the operation; immediate values are
/// already sign-extended to 64 bits where the table marks them signed.
#[derive(Debug, Copy, Clone)]
pub struct Args {
    pub rd: Specifier,
    pub rs1: Specifier,
    pub rs2: Specifier,
    pub rs3: Specifier,
    pub imm: i64,
    pub shamt: u8,
    pub csr: u16,
    pub rm: u8,
    pub aq: bool,
    pub rl: bool,
    pub pred: u8,
    pub succ: u8,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            rd: Specifier::X0,
            rs1: Specifier::X0,
            rs2: Specifier::X0,
            rs3: Specifier::X0,
            imm: 0,
            shamt: 0,
            csr: 0,
            rm: 0,
            aq: false,
            rl: false,
            pred: 0,
            succ: 0,
        }
    }
}

impl Args {
    /// Assign an extracted value to a slot. Values are truncated to the slot's natural width.
    pub fn set(&mut self, slot: ArgSlot, value: i64) {
        match slot {
            ArgSlot::Rd => self.rd = Specifier::from_u5(value as u8 & 0x1F),
            ArgSlot::Rs1 => self.rs1 = Specifier::from_u5(value as u8 & 0x1F),
            ArgSlot::Rs2 => self.rs2 = Specifier::from_u5(value as u8 & 0x1F),
            ArgSlot::Rs3 => self.rs3 = Specifier::from_u5(value as u8 & 0x1F),
            ArgSlot::Imm => self.imm = value,
            ArgSlot::Shamt => self.shamt = value as u8 & 0x3F,
            ArgSlot::Csr => self.csr = value as u16 & 0xFFF,
            ArgSlot::Rm => self.rm = value as u8 & 0x7,
            ArgSlot::Aq => self.aq = value != 0,
            ArgSlot::Rl => self.rl = value != 0,
            ArgSlot::Pred => self.pred = value as u8 & 0xF,
            ArgSlot::Succ => self.succ = value as u8 & 0xF,
        }
    }
}
