//! Parser for the textual instruction table.
//!
//! The table is a line-oriented format consumed once at startup:
//!
//! - `field NAME BITS[|POST]` declares a named bit-slice extractor. `BITS` is a sequence of
//!   `[s]MSB[:LSB][@DSTLSB]` tokens; `s` marks sign-extension at the final width; multiple
//!   tokens OR their results. `POST` names a post-processing step (currently `add_8`, used for
//!   the compressed three-bit register fields).
//! - `inst NAME [DISPLAY] | BITPATTERN | ARGS` declares a real instruction. `BITPATTERN` has one
//!   character per instruction bit (32 or 16): `0`/`1` literal, `*` don't-care, `.` argument bit
//!   (must be consumed by some argument in `ARGS`). `ARGS` is whitespace-separated `name`,
//!   `name=field`, or `name=integer`.
//! - `illegal | BITPATTERN` and `nop | BITPATTERN` declare sinks.
//! - Lines beginning with `#` are comments.

use crate::instruction::{ArgSlot, Opcode};
use thiserror::Error;

/// Post-processing applied to an extracted field value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PostProcess {
    /// Add 8 to the value. Compressed register fields encode `x8..x15` in three bits.
    Add8,
}

/// One `MSB[:LSB][@DSTLSB]` slice of a field.
#[derive(Debug, Copy, Clone)]
pub struct BitToken {
    pub msb: u8,
    pub lsb: u8,
    pub dst_lsb: u8,
    pub sign: bool,
}

impl BitToken {
    fn len(&self) -> u8 {
        self.msb - self.lsb + 1
    }

    /// Bits of the instruction word this token consumes.
    fn source_mask(&self) -> u32 {
        (((1u64 << self.len()) - 1) as u32) << self.lsb
    }

    fn extract(&self, word: u32) -> u32 {
        ((word >> self.lsb) & ((1u64 << self.len()) - 1) as u32) << self.dst_lsb
    }
}

/// A named bit-slice extractor.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub tokens: Vec<BitToken>,
    pub post: Option<PostProcess>,
    /// Width of the assembled value before sign extension.
    pub width: u8,
    /// Whether the assembled value is sign-extended from `width` bits.
    pub signed: bool,
}

impl FieldDef {
    /// Assemble this field's value from an instruction word.
    pub fn extract(&self, word: u32) -> i64 {
        let mut value: u32 = 0;
        for token in &self.tokens {
            value |= token.extract(word);
        }
        let mut value = if self.signed {
            let shift = 64 - self.width as u32;
            ((value as i64) << shift) >> shift
        } else {
            value as i64
        };
        match self.post {
            Some(PostProcess::Add8) => value += 8,
            None => {}
        }
        value
    }

    /// Bits of the instruction word consumed by this field.
    pub fn source_mask(&self) -> u32 {
        self.tokens
            .iter()
            .fold(0, |mask, token| mask | token.source_mask())
    }
}

/// Where an argument's value comes from.
#[derive(Debug, Copy, Clone)]
pub enum ArgSource {
    /// Index into the table's field list.
    Field(usize),
    /// A constant baked into the declaration (e.g. `rs1=2` for the stack-pointer-relative
    /// compressed loads).
    Constant(i64),
}

#[derive(Debug, Copy, Clone)]
pub struct ArgBinding {
    pub slot: ArgSlot,
    pub source: ArgSource,
}

/// What a matched declaration decodes to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeclKind {
    /// A real instruction executing `Opcode`.
    Instruction(Opcode),
    /// An architectural no-op (hint space given an explicit sink).
    Nop,
    /// An encoding that must raise illegal-instruction even though a more general pattern would
    /// match it (e.g. the all-zero halfword).
    Illegal,
}

/// A single instruction declaration: the unit the decoder tree dispatches to.
#[derive(Debug, Clone)]
pub struct InstDecl {
    pub kind: DeclKind,
    /// Display mnemonic; differs from the operation name for compressed encodings.
    pub display: String,
    /// Instruction size in bytes: 2 (compressed) or 4.
    pub size: u8,
    pub pattern: u32,
    pub mask: u32,
    pub args: Vec<ArgBinding>,
}

/// Everything parsed from one table.
#[derive(Debug, Default)]
pub struct Table {
    pub fields: Vec<FieldDef>,
    pub decls: Vec<InstDecl>,
}

impl Table {
    pub fn parse(text: &str) -> Result<Self, TableError> {
        let mut table = Table::default();
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let result = if let Some(rest) = line.strip_prefix("field ") {
                table.parse_field(rest)
            } else if let Some(rest) = line.strip_prefix("inst ") {
                table.parse_inst(rest)
            } else if let Some(rest) = line.strip_prefix("illegal") {
                table.parse_sink(DeclKind::Illegal, "illegal", rest)
            } else if let Some(rest) = line.strip_prefix("nop") {
                table.parse_sink(DeclKind::Nop, "nop", rest)
            } else {
                Err(TableErrorKind::UnknownDirective)
            };
            result.map_err(|kind| TableError { line: line_no, kind })?;
        }
        Ok(table)
    }

    fn parse_field(&mut self, rest: &str) -> Result<(), TableErrorKind> {
        let (spec, post) = match rest.split_once('|') {
            Some((spec, post)) => (spec, Some(post.trim())),
            None => (rest, None),
        };
        let post = match post {
            None => None,
            Some("add_8") => Some(PostProcess::Add8),
            Some(other) => return Err(TableErrorKind::UnknownPostProcess(other.into())),
        };
        let mut parts = spec.split_whitespace();
        let name = parts.next().ok_or(TableErrorKind::MissingFieldName)?;
        if self.field_index(name).is_some() {
            return Err(TableErrorKind::DuplicateField(name.into()));
        }
        let mut tokens = Vec::new();
        let mut width = 0u8;
        let mut signed = false;
        for token in parts {
            let (sign, token) = match token.strip_prefix('s') {
                Some(token) => (true, token),
                None => (false, token),
            };
            signed |= sign;
            let (bits, dst_lsb) = match token.split_once('@') {
                Some((bits, dst)) => (bits, parse_u8(dst)?),
                None => (token, 0),
            };
            let (msb, lsb) = match bits.split_once(':') {
                Some((msb, lsb)) => (parse_u8(msb)?, parse_u8(lsb)?),
                None => {
                    let bit = parse_u8(bits)?;
                    (bit, bit)
                }
            };
            if msb < lsb || msb > 31 {
                return Err(TableErrorKind::InvalidBitToken(token.into()));
            }
            let token = BitToken {
                msb,
                lsb,
                dst_lsb,
                sign,
            };
            width = width.max(dst_lsb + token.len());
            tokens.push(token);
        }
        if tokens.is_empty() || width > 63 {
            return Err(TableErrorKind::MissingFieldName);
        }
        self.fields.push(FieldDef {
            name: name.into(),
            tokens,
            post,
            width,
            signed,
        });
        Ok(())
    }

    fn parse_inst(&mut self, rest: &str) -> Result<(), TableErrorKind> {
        let mut segments = rest.split('|');
        let head = segments.next().ok_or(TableErrorKind::MalformedDeclaration)?;
        let bitpattern = segments
            .next()
            .ok_or(TableErrorKind::MalformedDeclaration)?;
        let args = segments.next().unwrap_or("");
        if segments.next().is_some() {
            return Err(TableErrorKind::MalformedDeclaration);
        }

        let mut head = head.split_whitespace();
        let name = head.next().ok_or(TableErrorKind::MalformedDeclaration)?;
        let display = head.next().unwrap_or(name);
        if head.next().is_some() {
            return Err(TableErrorKind::MalformedDeclaration);
        }
        let opcode =
            Opcode::from_name(name).ok_or_else(|| TableErrorKind::UnknownInstruction(name.into()))?;

        let (size, pattern, mask, arg_bits) = parse_bitpattern(bitpattern)?;
        let args = self.parse_args(args)?;

        // Every `.` bit must be consumed by some argument's field.
        let mut consumed = 0u32;
        for binding in &args {
            if let ArgSource::Field(index) = binding.source {
                consumed |= self.fields[index].source_mask();
            }
        }
        if arg_bits & !consumed != 0 {
            return Err(TableErrorKind::UnconsumedArgumentBits {
                name: name.into(),
                bits: arg_bits & !consumed,
            });
        }

        self.decls.push(InstDecl {
            kind: DeclKind::Instruction(opcode),
            display: display.into(),
            size,
            pattern,
            mask,
            args,
        });
        Ok(())
    }

    fn parse_sink(
        &mut self,
        kind: DeclKind,
        display: &str,
        rest: &str,
    ) -> Result<(), TableErrorKind> {
        let rest = rest.trim();
        let bitpattern = rest
            .strip_prefix('|')
            .ok_or(TableErrorKind::MalformedDeclaration)?;
        let (size, pattern, mask, arg_bits) = parse_bitpattern(bitpattern)?;
        if arg_bits != 0 {
            return Err(TableErrorKind::UnconsumedArgumentBits {
                name: display.into(),
                bits: arg_bits,
            });
        }
        self.decls.push(InstDecl {
            kind,
            display: display.into(),
            size,
            pattern,
            mask,
            args: Vec::new(),
        });
        Ok(())
    }

    fn parse_args(&self, args: &str) -> Result<Vec<ArgBinding>, TableErrorKind> {
        let mut bindings = Vec::new();
        for arg in args.split_whitespace() {
            let (name, source) = match arg.split_once('=') {
                None => (arg, ArgSource::Field(self.lookup_field(arg)?)),
                Some((name, value)) => {
                    let source = match value.parse::<i64>() {
                        Ok(constant) => ArgSource::Constant(constant),
                        Err(_) => ArgSource::Field(self.lookup_field(value)?),
                    };
                    (name, source)
                }
            };
            let slot =
                ArgSlot::from_name(name).ok_or_else(|| TableErrorKind::UnknownArgument(name.into()))?;
            bindings.push(ArgBinding { slot, source });
        }
        Ok(bindings)
    }

    fn lookup_field(&self, name: &str) -> Result<usize, TableErrorKind> {
        self.field_index(name)
            .ok_or_else(|| TableErrorKind::UnknownField(name.into()))
    }

    fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

/// Parse a `BITPATTERN` segment; returns (size in bytes, pattern, mask, argument bits).
fn parse_bitpattern(text: &str) -> Result<(u8, u32, u32, u32), TableErrorKind> {
    let text = text.trim();
    let bits = text.len();
    let size = match bits {
        32 => 4,
        16 => 2,
        _ => return Err(TableErrorKind::BadPatternLength(bits)),
    };
    let mut pattern = 0u32;
    let mut mask = 0u32;
    let mut arg_bits = 0u32;
    for (index, char) in text.chars().enumerate() {
        // The leftmost character is the most significant bit.
        let bit = 1u32 << (bits - 1 - index);
        match char {
            '0' => mask |= bit,
            '1' => {
                mask |= bit;
                pattern |= bit;
            }
            '*' => {}
            '.' => arg_bits |= bit,
            other => return Err(TableErrorKind::BadPatternChar(other)),
        }
    }
    Ok((size, pattern, mask, arg_bits))
}

fn parse_u8(text: &str) -> Result<u8, TableErrorKind> {
    text.parse::<u8>()
        .map_err(|_| TableErrorKind::InvalidBitToken(text.into()))
}

/// A malformed instruction table. Fatal at startup; never reachable from guest behaviour.
#[derive(Error, Debug)]
#[error("instruction table line {line}: {kind}")]
pub struct TableError {
    pub line: usize,
    pub kind: TableErrorKind,
}

#[derive(Error, Debug)]
pub enum TableErrorKind {
    #[error("unknown directive")]
    UnknownDirective,
    #[error("missing or invalid field definition")]
    MissingFieldName,
    #[error("duplicate field {0:?}")]
    DuplicateField(String),
    #[error("invalid bit token {0:?}")]
    InvalidBitToken(String),
    #[error("unknown post-process {0:?}")]
    UnknownPostProcess(String),
    #[error("malformed declaration")]
    MalformedDeclaration,
    #[error("unknown instruction {0:?}")]
    UnknownInstruction(String),
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("unknown argument {0:?}")]
    UnknownArgument(String),
    #[error("bit pattern must have 16 or 32 characters, has {0}")]
    BadPatternLength(usize),
    #[error("bad bit pattern character {0:?}")]
    BadPatternChar(char),
    #[error("argument bits {bits:#010x} of {name:?} not consumed by any argument")]
    UnconsumedArgumentBits { name: String, bits: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_extraction() {
        let table = Table::parse("field imm s31:20\nfield rd 11:7\n").unwrap();
        let imm = &table.fields[0];
        // addi x1, x0, -1
        assert_eq!(-1, imm.extract(0xFFF0_0093));
        assert_eq!(2047, imm.extract(0x7FF0_0093));
        let rd = &table.fields[1];
        assert_eq!(1, rd.extract(0xFFF0_0093));
    }

    #[test]
    fn test_multi_token_field() {
        // Store immediate: imm[11:5] at 31:25, imm[4:0] at 11:7.
        let table = Table::parse("field simm s31:25@5 11:7\n").unwrap();
        // sd x2, -8(x1) => imm = -8 = 0xFF8
        let word: u32 = 0b1111111_00010_00001_011_11000_0100011;
        assert_eq!(-8, table.fields[0].extract(word));
    }

    #[test]
    fn test_add_8_post_process() {
        let table = Table::parse("field rdp 9:7|add_8\n").unwrap();
        assert_eq!(10, table.fields[0].extract(0b10 << 7));
    }

    #[test]
    fn test_inst_parsing() {
        let text = "\
# comment
field imm s31:20
field rd 11:7
field rs1 19:15
inst addi | .................000.....0010011 | rd rs1 imm
illegal | 0000000000000000
";
        let table = Table::parse(text).unwrap();
        assert_eq!(2, table.decls.len());
        let addi = &table.decls[0];
        assert_eq!(4, addi.size);
        assert_eq!(0b0010011, addi.pattern);
        // Fixed bits: funct3 (14:12) and opcode (6:0).
        assert_eq!(0x0000_707F, addi.mask);
        let illegal = &table.decls[1];
        assert_eq!(2, illegal.size);
        assert_eq!(0xFFFF, illegal.mask);
        assert_eq!(0x0000, illegal.pattern);
        assert_eq!(DeclKind::Illegal, illegal.kind);
    }

    #[test]
    fn test_bad_patterns_rejected() {
        // 31 characters instead of 32.
        let text = "inst ecall | 000000000000000000000000111001 | \n";
        assert!(matches!(
            Table::parse(text).unwrap_err().kind,
            TableErrorKind::BadPatternLength(30)
        ));
        let text = "inst ecall | 0000000000!000000000000001110011 | \n";
        assert!(matches!(
            Table::parse(text).unwrap_err().kind,
            TableErrorKind::BadPatternChar('!')
        ));
    }

    #[test]
    fn test_unconsumed_argument_bits_rejected() {
        let text = "\
field rd 11:7
inst addi | .................000.....0010011 | rd
";
        assert!(matches!(
            Table::parse(text).unwrap_err().kind,
            TableErrorKind::UnconsumedArgumentBits { .. }
        ));
    }

    #[test]
    fn test_constant_bindings() {
        let text = "\
field rd 11:7
field imm s31:20
inst jalr | .................000.....1100111 | rd rs1=rd imm=0
";
        let table = Table::parse(text).unwrap();
        let args = &table.decls[0].args;
        assert_eq!(3, args.len());
        assert!(matches!(args[1].source, ArgSource::Field(0)));
        assert!(matches!(args[2].source, ArgSource::Constant(0)));
    }
}
