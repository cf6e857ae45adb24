//! Decoded CIL instructions.
//!
//! An [`Instruction`] is generic over the representation of its branch targets. The decoder
//! produces `Instruction<u32>` with absolute code offsets; the rewriter's code arena uses
//! [`crate::il::code::LabelId`] so targets survive any size change of the surrounding code.

use std::fmt;

use crate::{
    il::opcodes::{FlowType, OpCode, OpCodeInfo, OperandKind, StackEffect},
    metadata::token::Token,
};

/// Inline operand of an instruction.
///
/// Floating point immediates are kept as raw bits so instructions can be compared for
/// byte-exact equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand<T> {
    /// No operand
    None,
    /// Signed 8-bit immediate (`ldc.i4.s`)
    Int8(i8),
    /// Unsigned 8-bit index or alignment
    UInt8(u8),
    /// Unsigned 16-bit local or argument index
    UInt16(u16),
    /// Signed 32-bit immediate
    Int32(i32),
    /// Signed 64-bit immediate
    Int64(i64),
    /// Bits of a 32-bit float
    Float32(u32),
    /// Bits of a 64-bit float
    Float64(u64),
    /// Metadata token
    Token(Token),
    /// Branch target
    Target(T),
    /// `switch` jump table
    Switch(Vec<T>),
}

impl<T> Operand<T> {
    /// Translate the branch targets of this operand, leaving every other kind untouched.
    ///
    /// # Errors
    /// Propagates the first error returned by `map`.
    pub fn map_targets<U, E>(
        self,
        mut map: impl FnMut(T) -> Result<U, E>,
    ) -> Result<Operand<U>, E> {
        Ok(match self {
            Operand::None => Operand::None,
            Operand::Int8(value) => Operand::Int8(value),
            Operand::UInt8(value) => Operand::UInt8(value),
            Operand::UInt16(value) => Operand::UInt16(value),
            Operand::Int32(value) => Operand::Int32(value),
            Operand::Int64(value) => Operand::Int64(value),
            Operand::Float32(value) => Operand::Float32(value),
            Operand::Float64(value) => Operand::Float64(value),
            Operand::Token(token) => Operand::Token(token),
            Operand::Target(target) => Operand::Target(map(target)?),
            Operand::Switch(targets) => {
                let mut mapped = Vec::with_capacity(targets.len());
                for target in targets {
                    mapped.push(map(target)?);
                }
                Operand::Switch(mapped)
            }
        })
    }

    /// Branch targets referenced by this operand.
    #[must_use]
    pub fn targets(&self) -> &[T] {
        match self {
            Operand::Target(target) => std::slice::from_ref(target),
            Operand::Switch(targets) => targets,
            _ => &[],
        }
    }
}

/// One CIL instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction<T = u32> {
    /// Offset of the instruction within the code it was decoded from
    pub offset: u32,
    /// Opcode
    pub opcode: OpCode,
    /// Inline operand
    pub operand: Operand<T>,
}

impl<T> Instruction<T> {
    /// Create an instruction that is not backed by any decoded offset.
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand<T>) -> Self {
        Instruction {
            offset: 0,
            opcode,
            operand,
        }
    }

    /// Static opcode description.
    ///
    /// Instructions are only ever built from valid opcodes, so an unknown entry is reported
    /// as a `nop` shaped description instead of failing.
    #[must_use]
    pub fn info(&self) -> OpCodeInfo {
        self.opcode.info().unwrap_or(OpCodeInfo {
            name: "???",
            operand: OperandKind::None,
            flow: FlowType::Sequential,
            pops: StackEffect::Fixed(0),
            pushes: StackEffect::Fixed(0),
        })
    }

    /// Encoded size in bytes, using the opcode's own operand width.
    #[must_use]
    pub fn size(&self) -> usize {
        let operand = match &self.operand {
            Operand::Switch(targets) => 4 + 4 * targets.len(),
            _ => self.info().operand.size(),
        };
        self.opcode.size() + operand
    }

    /// Local variable slot read by `ldloc*`, if any.
    #[must_use]
    pub fn loaded_local(&self) -> Option<u16> {
        match (self.opcode.0, &self.operand) {
            (0x06..=0x09, _) => Some(self.opcode.0 - 0x06),
            (0x11, Operand::UInt8(index)) => Some(u16::from(*index)),
            (0xFE0C, Operand::UInt16(index)) => Some(*index),
            _ => None,
        }
    }

    /// Local variable slot written by `stloc*`, if any.
    #[must_use]
    pub fn stored_local(&self) -> Option<u16> {
        match (self.opcode.0, &self.operand) {
            (0x0A..=0x0D, _) => Some(self.opcode.0 - 0x0A),
            (0x13, Operand::UInt8(index)) => Some(u16::from(*index)),
            (0xFE0E, Operand::UInt16(index)) => Some(*index),
            _ => None,
        }
    }

    /// The `int32` pushed by an `ldc.i4*` instruction.
    #[must_use]
    pub fn int32_constant(&self) -> Option<i32> {
        match (self.opcode.0, &self.operand) {
            (0x15..=0x1E, _) => Some(i32::from(self.opcode.0) - 0x16),
            (0x1F, Operand::Int8(value)) => Some(i32::from(*value)),
            (0x20, Operand::Int32(value)) => Some(*value),
            _ => None,
        }
    }

    /// Token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }
}

impl Instruction<u32> {
    /// Offset of the following instruction.
    #[must_use]
    pub fn next_offset(&self) -> u32 {
        self.offset.saturating_add(self.size() as u32)
    }
}

impl<T: fmt::Debug> fmt::Display for Instruction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Int8(value) => write!(f, " {value}"),
            Operand::UInt8(value) => write!(f, " {value}"),
            Operand::UInt16(value) => write!(f, " {value}"),
            Operand::Int32(value) => write!(f, " {value}"),
            Operand::Int64(value) => write!(f, " {value}"),
            Operand::Float32(bits) => write!(f, " {}", f32::from_bits(*bits)),
            Operand::Float64(bits) => write!(f, " {}", f64::from_bits(*bits)),
            Operand::Token(token) => write!(f, " {token}"),
            Operand::Target(target) => write!(f, " {target:?}"),
            Operand::Switch(targets) => write!(f, " {targets:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        let ret: Instruction = Instruction::new(OpCode::RET, Operand::None);
        assert_eq!(ret.size(), 1);

        let stloc: Instruction = Instruction::new(OpCode::STLOC, Operand::UInt16(300));
        assert_eq!(stloc.size(), 4);

        let switch: Instruction = Instruction::new(OpCode::SWITCH, Operand::Switch(vec![1, 2, 3]));
        assert_eq!(switch.size(), 1 + 4 + 12);

        let br_s: Instruction = Instruction::new(OpCode::BR_S, Operand::Target(0));
        assert_eq!(br_s.size(), 2);
    }

    #[test]
    fn local_accessors() {
        let load: Instruction = Instruction::new(OpCode(0x08), Operand::None);
        assert_eq!(load.loaded_local(), Some(2));
        assert_eq!(load.stored_local(), None);

        let store: Instruction = Instruction::new(OpCode::STLOC_S, Operand::UInt8(7));
        assert_eq!(store.stored_local(), Some(7));
    }

    #[test]
    fn constants() {
        let m1: Instruction = Instruction::new(OpCode::LDC_I4_M1, Operand::None);
        assert_eq!(m1.int32_constant(), Some(-1));
        let eight: Instruction = Instruction::new(OpCode(0x1E), Operand::None);
        assert_eq!(eight.int32_constant(), Some(8));
        let wide: Instruction = Instruction::new(OpCode::LDC_I4, Operand::Int32(0x0600_0001));
        assert_eq!(wide.int32_constant(), Some(0x0600_0001));
    }

    #[test]
    fn map_targets() {
        let operand: Operand<u32> = Operand::Switch(vec![4, 8]);
        let mapped = operand
            .map_targets(|target| Ok::<_, ()>(target * 10))
            .unwrap();
        assert_eq!(mapped.targets(), &[40, 80]);
    }
}
