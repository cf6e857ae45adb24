//! CIL instruction decoding.
//!
//! Decodes raw method code into [`Instruction`]s with branch displacements already resolved
//! to absolute code offsets, which is the form every later stage (label assignment,
//! verification, idempotence detection) works from.
//!
//! # Example: Decoding a Stream of Instructions
//!
//! ```rust
//! use dotweave::{Parser, il::decoder::decode_stream};
//!
//! let code = [0x00, 0x2B, 0x00, 0x2A]; // nop, br.s +0, ret
//! let instructions = decode_stream(&mut Parser::new(&code))?;
//! assert_eq!(instructions.len(), 3);
//! assert_eq!(instructions[1].operand.targets(), &[3]);
//! # Ok::<(), dotweave::Error>(())
//! ```

use crate::{
    il::{
        instruction::{Instruction, Operand},
        opcodes::{OpCode, OperandKind, FE_PREFIX},
    },
    metadata::token::Token,
    utils::parser::Parser,
    Result,
};

/// Decodes a linear stream of CIL instructions until the parser runs out of data.
///
/// # Errors
///
/// Returns an error if:
/// - The bytecode stream contains invalid or reserved opcodes
/// - Instruction operands are truncated
/// - A branch displacement points before the start of the code
pub fn decode_stream(parser: &mut Parser) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();

    while parser.has_more_data() {
        instructions.push(decode_instruction(parser)?);
    }

    Ok(instructions)
}

/// Decodes a single CIL instruction from the current parser position.
///
/// The instruction's `offset` is the parser position it was decoded from. Branch and
/// `switch` operands are returned as absolute offsets, computed from the end of the
/// instruction as ECMA-335 prescribes.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] for unknown opcodes or negative targets, and
/// [`crate::Error::OutOfBounds`] for truncated operands.
pub fn decode_instruction(parser: &mut Parser) -> Result<Instruction> {
    let offset = u32::try_from(parser.pos())
        .map_err(|_| malformed_error!("Code offset exceeds u32 range"))?;
    let first_byte = parser.read_le::<u8>()?;

    let opcode = match first_byte {
        FE_PREFIX => OpCode::from_bytes(FE_PREFIX, parser.read_le::<u8>()?),
        _ => OpCode::from_bytes(0, first_byte),
    };
    let Some(info) = opcode.info() else {
        return Err(malformed_error!(
            "Invalid opcode {:04X} at IL_{:04x}",
            opcode.0,
            offset
        ));
    };

    let operand = match info.operand {
        OperandKind::None => Operand::None,
        OperandKind::ShortInt => Operand::Int8(parser.read_le::<i8>()?),
        OperandKind::ShortVar => Operand::UInt8(parser.read_le::<u8>()?),
        OperandKind::Var => Operand::UInt16(parser.read_le::<u16>()?),
        OperandKind::Int32 => Operand::Int32(parser.read_le::<i32>()?),
        OperandKind::Int64 => Operand::Int64(parser.read_le::<i64>()?),
        OperandKind::Float32 => Operand::Float32(parser.read_le::<u32>()?),
        OperandKind::Float64 => Operand::Float64(parser.read_le::<u64>()?),
        OperandKind::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandKind::ShortBranch => {
            let displacement = i64::from(parser.read_le::<i8>()?);
            Operand::Target(branch_target(parser.pos(), displacement)?)
        }
        OperandKind::Branch => {
            let displacement = i64::from(parser.read_le::<i32>()?);
            Operand::Target(branch_target(parser.pos(), displacement)?)
        }
        OperandKind::Switch => {
            let case_count = parser.read_le::<u32>()? as usize;
            if case_count > parser.remaining() / 4 {
                return Err(malformed_error!(
                    "Switch at IL_{:04x} declares {} cases",
                    offset,
                    case_count
                ));
            }

            let mut displacements = Vec::with_capacity(case_count);
            for _ in 0..case_count {
                displacements.push(i64::from(parser.read_le::<i32>()?));
            }

            // Displacements are relative to the end of the whole jump table
            let end = parser.pos();
            let mut targets = Vec::with_capacity(case_count);
            for displacement in displacements {
                targets.push(branch_target(end, displacement)?);
            }
            Operand::Switch(targets)
        }
    };

    Ok(Instruction {
        offset,
        opcode,
        operand,
    })
}

fn branch_target(next: usize, displacement: i64) -> Result<u32> {
    let target = next as i64 + displacement;
    u32::try_from(target).map_err(|_| malformed_error!("Branch target {} out of range", target))
}
