//! Decoder tree: static dispatch DAG built from the declarative instruction table.
//!
//! Construction happens once at startup from the embedded table text; the resulting tree is
//! immutable and shared read access is trivial. There is one tree for 32-bit words and one for
//! 16-bit (compressed) parcels.

pub mod table;

use crate::instruction::Args;
use log::trace;
use std::collections::HashMap;
use table::{ArgSource, InstDecl, Table, TableError};
use thiserror::Error;

/// The embedded instruction table for `rv64imafdc_zifencei` plus the privileged instructions.
pub const RV64_TABLE: &str = include_str!("rv64.tbl");

/// A node of the decoder tree.
#[derive(Debug)]
enum Node {
    /// A single declaration remains; `query` resolves to it (after a final pattern check at the
    /// tree boundary for don't-care-free correctness).
    Leaf(u16),
    /// Dispatch on a fixed bit window common to all declarations below this node.
    Switch { mask: u32, cases: HashMap<u32, Node> },
    /// No window partitions the declarations (conflicting don't-cares); try children in order,
    /// most specific (largest mask popcount) first.
    Branch(Vec<BranchArm>),
}

#[derive(Debug)]
struct BranchArm {
    pattern: u32,
    mask: u32,
    node: Node,
}

impl Node {
    fn query(&self, word: u32) -> Option<u16> {
        match self {
            Node::Leaf(index) => Some(*index),
            Node::Switch { mask, cases } => cases.get(&(word & mask))?.query(word),
            Node::Branch(arms) => arms
                .iter()
                .find(|arm| word & arm.mask == arm.pattern)
                .and_then(|arm| arm.node.query(word)),
        }
    }
}

/// Builds the dispatch tree over one size class of declarations.
fn build(decls: &[InstDecl], indices: &[u16], word_bits: u32) -> Node {
    debug_assert!(!indices.is_empty());
    if indices.len() == 1 {
        return Node::Leaf(indices[0]);
    }

    // Find the largest fixed bit window (contiguous run of bits set in every declaration's mask)
    // that splits the set into at least two non-empty groups.
    let common = indices
        .iter()
        .fold(u32::MAX, |acc, &i| acc & decls[i as usize].mask)
        & (u32::MAX >> (32 - word_bits));
    let mut best_window: Option<u32> = None;
    let mut bit = 0;
    while bit < word_bits {
        if common & (1 << bit) == 0 {
            bit += 1;
            continue;
        }
        let start = bit;
        while bit < word_bits && common & (1 << bit) != 0 {
            bit += 1;
        }
        let window = ((1u64 << bit) - (1u64 << start)) as u32;
        let partitions = {
            let first = decls[indices[0] as usize].pattern & window;
            indices
                .iter()
                .any(|&i| decls[i as usize].pattern & window != first)
        };
        if partitions && best_window.map_or(true, |best| window.count_ones() > best.count_ones()) {
            best_window = Some(window);
        }
    }

    if let Some(mask) = best_window {
        let mut groups: HashMap<u32, Vec<u16>> = HashMap::new();
        for &index in indices {
            groups
                .entry(decls[index as usize].pattern & mask)
                .or_default()
                .push(index);
        }
        let cases = groups
            .into_iter()
            .map(|(key, group)| (key, build(decls, &group, word_bits)))
            .collect();
        return Node::Switch { mask, cases };
    }

    // Conflicting don't-cares: order children most specific first so that e.g. `c.addi16sp`
    // shadows `c.lui` and the all-zero `illegal` sink shadows `c.addi4spn`.
    let mut arms: Vec<u16> = indices.to_vec();
    arms.sort_by(|&a, &b| {
        let (a, b) = (&decls[a as usize], &decls[b as usize]);
        b.mask
            .count_ones()
            .cmp(&a.mask.count_ones())
            .then(a.pattern.cmp(&b.pattern))
    });
    Node::Branch(
        arms.into_iter()
            .map(|index| BranchArm {
                pattern: decls[index as usize].pattern,
                mask: decls[index as usize].mask,
                node: Node::Leaf(index),
            })
            .collect(),
    )
}

/// Validate that no two distinct declarations of the same size class overlap, except when one is
/// strictly more specific than the other (its mask is a strict superset); the tree orders those
/// specifics first.
fn validate(decls: &[InstDecl], indices: &[u16]) -> Result<(), DecoderError> {
    for (position, &a) in indices.iter().enumerate() {
        for &b in &indices[position + 1..] {
            let (left, right) = (&decls[a as usize], &decls[b as usize]);
            let shared = left.mask & right.mask;
            if left.pattern & shared != right.pattern & shared {
                continue;
            }
            let left_subsumes = left.mask & right.mask == right.mask;
            let right_subsumes = left.mask & right.mask == left.mask;
            if left.mask == right.mask || (!left_subsumes && !right_subsumes) {
                return Err(DecoderError::AmbiguousDeclarations {
                    first: left.display.clone(),
                    second: right.display.clone(),
                });
            }
        }
    }
    Ok(())
}

/// An immutable decoder for both instruction sizes, plus the parsed table it was built from.
#[derive(Debug)]
pub struct Decoder {
    table: Table,
    root32: Node,
    root16: Node,
}

impl Decoder {
    /// Build the decoder from the embedded RV64 table.
    pub fn new() -> Result<Self, DecoderError> {
        Self::from_table_text(RV64_TABLE)
    }

    /// Build a decoder from arbitrary table text.
    pub fn from_table_text(text: &str) -> Result<Self, DecoderError> {
        let table = Table::parse(text)?;
        let split = |size: u8| -> Vec<u16> {
            table
                .decls
                .iter()
                .enumerate()
                .filter(|(_, decl)| decl.size == size)
                .map(|(index, _)| index as u16)
                .collect()
        };
        let decls32 = split(4);
        let decls16 = split(2);
        if decls32.is_empty() || decls16.is_empty() {
            return Err(DecoderError::EmptyTable);
        }
        validate(&table.decls, &decls32)?;
        validate(&table.decls, &decls16)?;
        let root32 = build(&table.decls, &decls32, 32);
        let root16 = build(&table.decls, &decls16, 16);
        trace!(
            declarations = table.decls.len();
            "Built decoder tree"
        );
        Ok(Self {
            table,
            root32,
            root16,
        })
    }

    /// Look up the declaration matching a 32-bit instruction word.
    pub fn query32(&self, word: u32) -> Option<&InstDecl> {
        let index = self.root32.query(word)?;
        let decl = &self.table.decls[index as usize];
        (word & decl.mask == decl.pattern).then_some(decl)
    }

    /// Look up the declaration matching a 16-bit instruction parcel.
    pub fn query16(&self, parcel: u16) -> Option<&InstDecl> {
        let index = self.root16.query(parcel as u32)?;
        let decl = &self.table.decls[index as usize];
        (parcel as u32 & decl.mask == decl.pattern).then_some(decl)
    }

    /// Decode an instruction word (compressed parcels are identified by `word[1:0] != 0b11`) to
    /// its declaration and extracted operands. `None` means illegal instruction.
    pub fn decode(&self, word: u32) -> Option<(&InstDecl, Args)> {
        let decl = if word & 0b11 == 0b11 {
            self.query32(word)?
        } else {
            self.query16(word as u16)?
        };
        let mut args = Args::default();
        for binding in &decl.args {
            let value = match binding.source {
                ArgSource::Field(index) => self.table.fields[index].extract(word),
                ArgSource::Constant(constant) => constant,
            };
            args.set(binding.slot, value);
        }
        Some((decl, args))
    }
}

/// Errors raised while constructing the decoder. Fatal at platform build time.
#[derive(Error, Debug)]
pub enum DecoderError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("no declarations for one of the instruction sizes")]
    EmptyTable,
    #[error("declarations {first:?} and {second:?} match overlapping encodings")]
    AmbiguousDeclarations { first: String, second: String },
}

#[cfg(test)]
mod tests {
    use super::table::DeclKind;
    use super::*;
    use crate::instruction::Opcode;
    use crate::registers::Specifier;

    fn decoder() -> Decoder {
        Decoder::new().expect("embedded table must build")
    }

    fn opcode(decl: &InstDecl) -> Opcode {
        match decl.kind {
            DeclKind::Instruction(opcode) => opcode,
            _ => panic!("expected real instruction, got {:?}", decl.kind),
        }
    }

    #[test]
    fn test_decode_addi() {
        let decoder = decoder();
        // addi x5, x6, -2048
        let (decl, args) = decoder.decode(0x8003_0293).unwrap();
        assert_eq!(Opcode::Addi, opcode(decl));
        assert_eq!(4, decl.size);
        assert_eq!(Specifier::new(5u8).unwrap(), args.rd);
        assert_eq!(Specifier::new(6u8).unwrap(), args.rs1);
        assert_eq!(-2048, args.imm);
    }

    #[test]
    fn test_decode_compressed_addi() {
        let decoder = decoder();
        // c.addi x8, 1 => 000 0 01000 00001 01
        let word = 0b000_0_01000_00001_01;
        let (decl, args) = decoder.decode(word).unwrap();
        assert_eq!(Opcode::Addi, opcode(decl));
        assert_eq!(2, decl.size);
        assert_eq!("c.addi", decl.display);
        assert_eq!(Specifier::new(8u8).unwrap(), args.rd);
        assert_eq!(Specifier::new(8u8).unwrap(), args.rs1);
        assert_eq!(1, args.imm);
    }

    #[test]
    fn test_decode_branch_offset() {
        let decoder = decoder();
        // beq x1, x2, -16 => imm[12|10:5]=1111111 rs2=00010 rs1=00001 000 imm[4:1|11]=10001 1100011
        let word = 0b1111111_00010_00001_000_1000_1_1100011;
        let (decl, args) = decoder.decode(word).unwrap();
        assert_eq!(Opcode::Beq, opcode(decl));
        assert_eq!(-16, args.imm);
    }

    #[test]
    fn test_all_zero_words_are_illegal() {
        let decoder = decoder();
        // The all-zero halfword must hit the illegal sink even though the c.addi4spn pattern
        // would otherwise absorb it.
        let decl = decoder.query16(0).unwrap();
        assert_eq!(DeclKind::Illegal, decl.kind);
        assert!(decoder.query32(0x0000_0000).is_none());
    }

    #[test]
    fn test_compressed_specific_before_general() {
        let decoder = decoder();
        // c.addi16sp x2, 16 => 011 0 00010 10000 01 (nzimm[4] at bit 6)
        let word = 0b011_0_00010_10000_01;
        let (decl, args) = decoder.decode(word).unwrap();
        assert_eq!(Opcode::Addi, opcode(decl));
        assert_eq!("c.addi16sp", decl.display);
        assert_eq!(Specifier::X2, args.rd);
        assert_eq!(Specifier::X2, args.rs1);
        assert_eq!(16, args.imm);
        // Same funct3/op but rd != x2 decodes as c.lui.
        let word = 0b011_0_00101_00100_01;
        let (decl, args) = decoder.decode(word).unwrap();
        assert_eq!(Opcode::Lui, opcode(decl));
        assert_eq!(0x4000, args.imm);
    }

    #[test]
    fn test_compressed_jr_vs_mv() {
        let decoder = decoder();
        // c.jr x1 => 100 0 00001 00000 10
        let (decl, args) = decoder.decode(0b100_0_00001_00000_10).unwrap();
        assert_eq!(Opcode::Jalr, opcode(decl));
        assert_eq!(Specifier::X0, args.rd);
        assert_eq!(Specifier::X1, args.rs1);
        // c.mv x1, x2 => 100 0 00001 00010 10
        let (decl, args) = decoder.decode(0b100_0_00001_00010_10).unwrap();
        assert_eq!(Opcode::Add, opcode(decl));
        assert_eq!(Specifier::X1, args.rd);
        assert_eq!(Specifier::X0, args.rs1);
        assert_eq!(Specifier::X2, args.rs2);
        // c.ebreak => 100 1 00000 00000 10
        let (decl, _) = decoder.decode(0b100_1_00000_00000_10).unwrap();
        assert_eq!(Opcode::Ebreak, opcode(decl));
    }

    #[test]
    fn test_decode_atomics() {
        let decoder = decoder();
        // lr.d x1, (x2) with aq => 00010 1 0 00000 00010 011 00001 0101111
        let word = 0b00010_1_0_00000_00010_011_00001_0101111;
        let (decl, args) = decoder.decode(word).unwrap();
        assert_eq!(Opcode::LrD, opcode(decl));
        assert!(args.aq);
        assert!(!args.rl);
    }

    #[test]
    fn test_decode_float_rounding_mode() {
        let decoder = decoder();
        // fadd.s f1, f2, f3, rtz => 0000000 00011 00010 001 00001 1010011
        let word = 0b0000000_00011_00010_001_00001_1010011;
        let (decl, args) = decoder.decode(word).unwrap();
        assert_eq!(Opcode::FaddS, opcode(decl));
        assert_eq!(1, args.rm);
        assert_eq!(Specifier::new(3u8).unwrap(), args.rs2);
    }

    #[test]
    fn test_query_satisfies_pattern_mask_invariant() {
        let decoder = decoder();
        // Deterministic xorshift sampling; every successful query must satisfy
        // (word & mask) == pattern.
        let mut state = 0x243F_6A88_85A3_08D3u64;
        for _ in 0..200_000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let word = state as u32;
            if word & 0b11 == 0b11 {
                if let Some(decl) = decoder.query32(word) {
                    assert_eq!(word & decl.mask, decl.pattern, "word {word:#010x}");
                }
            } else if let Some(decl) = decoder.query16(word as u16) {
                assert_eq!(word as u32 & decl.mask, decl.pattern, "word {word:#06x}");
            }
        }
    }

    #[test]
    fn test_known_encodings_roundtrip() {
        let decoder = decoder();
        for (word, name) in [
            (0x0000_0073u32, "ecall"),
            (0x0010_0073, "ebreak"),
            (0x1020_0073, "sret"),
            (0x3020_0073, "mret"),
            (0x1050_0073, "wfi"),
            (0x0000_100F, "fence.i"),
            (0x1200_0073, "sfence.vma"),
            (0x02C5_B533, "mulhu"),
            (0x02C5_C53B, "divw"),
        ] {
            let (decl, _) = decoder
                .decode(word)
                .unwrap_or_else(|| panic!("{name} failed to decode"));
            assert_eq!(name, decl.display, "word {word:#010x}");
        }
    }
}
