//! The CIL opcode table (ECMA-335 Partition III).
//!
//! Every opcode is described by an [`OpCodeInfo`]: mnemonic, inline operand kind, control
//! flow category and evaluation stack behaviour. Two-byte opcodes carry the `0xFE` prefix in
//! the high byte of [`OpCode`].

use std::fmt;

/// Inline operand encoding of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// Unsigned 8-bit local or argument index (`ldloc.s`, `unaligned.`, `no.`)
    ShortVar,
    /// Unsigned 16-bit local or argument index (`ldloc`, `starg`)
    Var,
    /// Signed 8-bit immediate (`ldc.i4.s`)
    ShortInt,
    /// Signed 32-bit immediate
    Int32,
    /// Signed 64-bit immediate
    Int64,
    /// 32-bit float immediate
    Float32,
    /// 64-bit float immediate
    Float64,
    /// Metadata token
    Token,
    /// Signed 8-bit branch displacement
    ShortBranch,
    /// Signed 32-bit branch displacement
    Branch,
    /// Jump table: count followed by that many 32-bit displacements
    Switch,
}

impl OperandKind {
    /// Encoded size in bytes; the switch table size depends on its case count.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::ShortVar | OperandKind::ShortInt | OperandKind::ShortBranch => 1,
            OperandKind::Var => 2,
            OperandKind::Int32
            | OperandKind::Float32
            | OperandKind::Token
            | OperandKind::Branch
            | OperandKind::Switch => 4,
            OperandKind::Int64 | OperandKind::Float64 => 8,
        }
    }
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Branches or falls through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls a method and continues
    Call,
    /// Returns from the method
    Return,
    /// Multi-way branch with fall-through
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally or fault handler
    EndFinally,
    /// Ends a filter block
    EndFilter,
    /// Exits a protected region
    Leave,
    /// Transfers control to another method (`jmp`)
    Jump,
    /// Prefix that modifies the following instruction
    Meta,
}

impl FlowType {
    /// Returns `true` if control can reach the next instruction in sequence.
    #[must_use]
    pub fn falls_through(self) -> bool {
        matches!(
            self,
            FlowType::Sequential
                | FlowType::ConditionalBranch
                | FlowType::Call
                | FlowType::Switch
                | FlowType::Meta
        )
    }
}

/// Evaluation stack effect of one side (pops or pushes) of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEffect {
    /// A fixed number of slots
    Fixed(u8),
    /// Determined by the callee signature (`call`, `callvirt`, `newobj`, `calli`) or by the
    /// method's return type (`ret`)
    Signature,
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCodeInfo {
    /// Mnemonic as written in ILAsm
    pub name: &'static str,
    /// Inline operand
    pub operand: OperandKind,
    /// Control flow category
    pub flow: FlowType,
    /// Slots popped
    pub pops: StackEffect,
    /// Slots pushed
    pub pushes: StackEffect,
}

/// A one- or two-byte CIL opcode; two-byte opcodes are stored as `0xFE00 | second_byte`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpCode(pub u16);

/// Prefix byte introducing two-byte opcodes
pub const FE_PREFIX: u8 = 0xFE;

#[allow(missing_docs)]
impl OpCode {
    pub const NOP: OpCode = OpCode(0x00);
    pub const LDARG_0: OpCode = OpCode(0x02);
    pub const LDLOC_0: OpCode = OpCode(0x06);
    pub const STLOC_0: OpCode = OpCode(0x0A);
    pub const LDARG_S: OpCode = OpCode(0x0E);
    pub const LDLOC_S: OpCode = OpCode(0x11);
    pub const STLOC_S: OpCode = OpCode(0x13);
    pub const LDNULL: OpCode = OpCode(0x14);
    pub const LDC_I4_M1: OpCode = OpCode(0x15);
    pub const LDC_I4_0: OpCode = OpCode(0x16);
    pub const LDC_I4_S: OpCode = OpCode(0x1F);
    pub const LDC_I4: OpCode = OpCode(0x20);
    pub const DUP: OpCode = OpCode(0x25);
    pub const POP: OpCode = OpCode(0x26);
    pub const JMP: OpCode = OpCode(0x27);
    pub const CALL: OpCode = OpCode(0x28);
    pub const CALLI: OpCode = OpCode(0x29);
    pub const RET: OpCode = OpCode(0x2A);
    pub const BR_S: OpCode = OpCode(0x2B);
    pub const BLT_UN_S: OpCode = OpCode(0x37);
    pub const BR: OpCode = OpCode(0x38);
    pub const BRFALSE: OpCode = OpCode(0x39);
    pub const BRTRUE: OpCode = OpCode(0x3A);
    pub const BEQ: OpCode = OpCode(0x3B);
    pub const BGT: OpCode = OpCode(0x3D);
    pub const BLE: OpCode = OpCode(0x3E);
    pub const BLT: OpCode = OpCode(0x3F);
    pub const BLT_UN: OpCode = OpCode(0x44);
    pub const SWITCH: OpCode = OpCode(0x45);
    pub const ADD: OpCode = OpCode(0x58);
    pub const SUB: OpCode = OpCode(0x59);
    pub const MUL: OpCode = OpCode(0x5A);
    pub const CALLVIRT: OpCode = OpCode(0x6F);
    pub const NEWOBJ: OpCode = OpCode(0x73);
    pub const THROW: OpCode = OpCode(0x7A);
    pub const ENDFINALLY: OpCode = OpCode(0xDC);
    pub const LEAVE: OpCode = OpCode(0xDD);
    pub const LEAVE_S: OpCode = OpCode(0xDE);
    pub const CEQ: OpCode = OpCode(0xFE01);
    pub const CGT: OpCode = OpCode(0xFE02);
    pub const CLT: OpCode = OpCode(0xFE04);
    pub const LDARG: OpCode = OpCode(0xFE09);
    pub const LDLOC: OpCode = OpCode(0xFE0C);
    pub const STLOC: OpCode = OpCode(0xFE0E);
    pub const LOCALLOC: OpCode = OpCode(0xFE0F);
    pub const ENDFILTER: OpCode = OpCode(0xFE11);
    pub const TAIL: OpCode = OpCode(0xFE14);
    pub const RETHROW: OpCode = OpCode(0xFE1A);
}

impl OpCode {
    /// Build from the raw prefix and opcode bytes (`prefix` is 0 for one-byte opcodes).
    #[must_use]
    pub fn from_bytes(prefix: u8, opcode: u8) -> Self {
        OpCode((u16::from(prefix) << 8) | u16::from(opcode))
    }

    /// Returns `true` for `0xFE`-prefixed opcodes.
    #[must_use]
    pub fn is_two_byte(self) -> bool {
        self.0 >> 8 == u16::from(FE_PREFIX)
    }

    /// Encoded size of the opcode itself.
    #[must_use]
    pub fn size(self) -> usize {
        if self.is_two_byte() {
            2
        } else {
            1
        }
    }

    /// Append the opcode bytes.
    pub fn write(self, out: &mut Vec<u8>) {
        if self.is_two_byte() {
            out.push(FE_PREFIX);
        }
        #[allow(clippy::cast_possible_truncation)]
        out.push(self.0 as u8);
    }

    /// Static description, `None` for reserved or unknown encodings.
    #[must_use]
    pub fn info(self) -> Option<OpCodeInfo> {
        lookup(self)
    }

    /// Returns `true` for branch instructions with a single label operand (including `leave`).
    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(self.0, 0x2B..=0x44 | 0xDD | 0xDE)
    }

    /// Returns `true` for the 8-bit displacement variant of a branch.
    #[must_use]
    pub fn is_short_branch(self) -> bool {
        matches!(self.0, 0x2B..=0x37 | 0xDE)
    }

    /// Long-form equivalent of a short branch; other opcodes are returned unchanged.
    #[must_use]
    pub fn long_form(self) -> OpCode {
        match self.0 {
            0x2B..=0x37 => OpCode(self.0 + 0x0D),
            0xDE => OpCode::LEAVE,
            _ => self,
        }
    }

    /// Short-form equivalent of a long branch; other opcodes are returned unchanged.
    #[must_use]
    pub fn short_form(self) -> OpCode {
        match self.0 {
            0x38..=0x44 => OpCode(self.0 - 0x0D),
            0xDD => OpCode::LEAVE_S,
            _ => self,
        }
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match lookup(*self) {
            Some(info) => write!(f, "{}", info.name),
            None => write!(f, "OpCode(0x{:04x})", self.0),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

macro_rules! op {
    ($name:literal, $operand:ident, $flow:ident, $pops:tt, $pushes:tt) => {
        Some(OpCodeInfo {
            name: $name,
            operand: OperandKind::$operand,
            flow: FlowType::$flow,
            pops: op!(@effect $pops),
            pushes: op!(@effect $pushes),
        })
    };
    (@effect sig) => {
        StackEffect::Signature
    };
    (@effect $n:literal) => {
        StackEffect::Fixed($n)
    };
}

/// Look up the static description of an opcode.
#[must_use]
#[allow(clippy::too_many_lines, clippy::match_same_arms)]
pub fn lookup(code: OpCode) -> Option<OpCodeInfo> {
    match code.0 {
        0x00 => op!("nop", None, Sequential, 0, 0),
        0x01 => op!("break", None, Sequential, 0, 0),
        0x02 => op!("ldarg.0", None, Sequential, 0, 1),
        0x03 => op!("ldarg.1", None, Sequential, 0, 1),
        0x04 => op!("ldarg.2", None, Sequential, 0, 1),
        0x05 => op!("ldarg.3", None, Sequential, 0, 1),
        0x06 => op!("ldloc.0", None, Sequential, 0, 1),
        0x07 => op!("ldloc.1", None, Sequential, 0, 1),
        0x08 => op!("ldloc.2", None, Sequential, 0, 1),
        0x09 => op!("ldloc.3", None, Sequential, 0, 1),
        0x0A => op!("stloc.0", None, Sequential, 1, 0),
        0x0B => op!("stloc.1", None, Sequential, 1, 0),
        0x0C => op!("stloc.2", None, Sequential, 1, 0),
        0x0D => op!("stloc.3", None, Sequential, 1, 0),
        0x0E => op!("ldarg.s", ShortVar, Sequential, 0, 1),
        0x0F => op!("ldarga.s", ShortVar, Sequential, 0, 1),
        0x10 => op!("starg.s", ShortVar, Sequential, 1, 0),
        0x11 => op!("ldloc.s", ShortVar, Sequential, 0, 1),
        0x12 => op!("ldloca.s", ShortVar, Sequential, 0, 1),
        0x13 => op!("stloc.s", ShortVar, Sequential, 1, 0),
        0x14 => op!("ldnull", None, Sequential, 0, 1),
        0x15 => op!("ldc.i4.m1", None, Sequential, 0, 1),
        0x16 => op!("ldc.i4.0", None, Sequential, 0, 1),
        0x17 => op!("ldc.i4.1", None, Sequential, 0, 1),
        0x18 => op!("ldc.i4.2", None, Sequential, 0, 1),
        0x19 => op!("ldc.i4.3", None, Sequential, 0, 1),
        0x1A => op!("ldc.i4.4", None, Sequential, 0, 1),
        0x1B => op!("ldc.i4.5", None, Sequential, 0, 1),
        0x1C => op!("ldc.i4.6", None, Sequential, 0, 1),
        0x1D => op!("ldc.i4.7", None, Sequential, 0, 1),
        0x1E => op!("ldc.i4.8", None, Sequential, 0, 1),
        0x1F => op!("ldc.i4.s", ShortInt, Sequential, 0, 1),
        0x20 => op!("ldc.i4", Int32, Sequential, 0, 1),
        0x21 => op!("ldc.i8", Int64, Sequential, 0, 1),
        0x22 => op!("ldc.r4", Float32, Sequential, 0, 1),
        0x23 => op!("ldc.r8", Float64, Sequential, 0, 1),
        0x25 => op!("dup", None, Sequential, 1, 2),
        0x26 => op!("pop", None, Sequential, 1, 0),
        0x27 => op!("jmp", Token, Jump, 0, 0),
        0x28 => op!("call", Token, Call, sig, sig),
        0x29 => op!("calli", Token, Call, sig, sig),
        0x2A => op!("ret", None, Return, sig, 0),
        0x2B => op!("br.s", ShortBranch, UnconditionalBranch, 0, 0),
        0x2C => op!("brfalse.s", ShortBranch, ConditionalBranch, 1, 0),
        0x2D => op!("brtrue.s", ShortBranch, ConditionalBranch, 1, 0),
        0x2E => op!("beq.s", ShortBranch, ConditionalBranch, 2, 0),
        0x2F => op!("bge.s", ShortBranch, ConditionalBranch, 2, 0),
        0x30 => op!("bgt.s", ShortBranch, ConditionalBranch, 2, 0),
        0x31 => op!("ble.s", ShortBranch, ConditionalBranch, 2, 0),
        0x32 => op!("blt.s", ShortBranch, ConditionalBranch, 2, 0),
        0x33 => op!("bne.un.s", ShortBranch, ConditionalBranch, 2, 0),
        0x34 => op!("bge.un.s", ShortBranch, ConditionalBranch, 2, 0),
        0x35 => op!("bgt.un.s", ShortBranch, ConditionalBranch, 2, 0),
        0x36 => op!("ble.un.s", ShortBranch, ConditionalBranch, 2, 0),
        0x37 => op!("blt.un.s", ShortBranch, ConditionalBranch, 2, 0),
        0x38 => op!("br", Branch, UnconditionalBranch, 0, 0),
        0x39 => op!("brfalse", Branch, ConditionalBranch, 1, 0),
        0x3A => op!("brtrue", Branch, ConditionalBranch, 1, 0),
        0x3B => op!("beq", Branch, ConditionalBranch, 2, 0),
        0x3C => op!("bge", Branch, ConditionalBranch, 2, 0),
        0x3D => op!("bgt", Branch, ConditionalBranch, 2, 0),
        0x3E => op!("ble", Branch, ConditionalBranch, 2, 0),
        0x3F => op!("blt", Branch, ConditionalBranch, 2, 0),
        0x40 => op!("bne.un", Branch, ConditionalBranch, 2, 0),
        0x41 => op!("bge.un", Branch, ConditionalBranch, 2, 0),
        0x42 => op!("bgt.un", Branch, ConditionalBranch, 2, 0),
        0x43 => op!("ble.un", Branch, ConditionalBranch, 2, 0),
        0x44 => op!("blt.un", Branch, ConditionalBranch, 2, 0),
        0x45 => op!("switch", Switch, Switch, 1, 0),
        0x46 => op!("ldind.i1", None, Sequential, 1, 1),
        0x47 => op!("ldind.u1", None, Sequential, 1, 1),
        0x48 => op!("ldind.i2", None, Sequential, 1, 1),
        0x49 => op!("ldind.u2", None, Sequential, 1, 1),
        0x4A => op!("ldind.i4", None, Sequential, 1, 1),
        0x4B => op!("ldind.u4", None, Sequential, 1, 1),
        0x4C => op!("ldind.i8", None, Sequential, 1, 1),
        0x4D => op!("ldind.i", None, Sequential, 1, 1),
        0x4E => op!("ldind.r4", None, Sequential, 1, 1),
        0x4F => op!("ldind.r8", None, Sequential, 1, 1),
        0x50 => op!("ldind.ref", None, Sequential, 1, 1),
        0x51 => op!("stind.ref", None, Sequential, 2, 0),
        0x52 => op!("stind.i1", None, Sequential, 2, 0),
        0x53 => op!("stind.i2", None, Sequential, 2, 0),
        0x54 => op!("stind.i4", None, Sequential, 2, 0),
        0x55 => op!("stind.i8", None, Sequential, 2, 0),
        0x56 => op!("stind.r4", None, Sequential, 2, 0),
        0x57 => op!("stind.r8", None, Sequential, 2, 0),
        0x58 => op!("add", None, Sequential, 2, 1),
        0x59 => op!("sub", None, Sequential, 2, 1),
        0x5A => op!("mul", None, Sequential, 2, 1),
        0x5B => op!("div", None, Sequential, 2, 1),
        0x5C => op!("div.un", None, Sequential, 2, 1),
        0x5D => op!("rem", None, Sequential, 2, 1),
        0x5E => op!("rem.un", None, Sequential, 2, 1),
        0x5F => op!("and", None, Sequential, 2, 1),
        0x60 => op!("or", None, Sequential, 2, 1),
        0x61 => op!("xor", None, Sequential, 2, 1),
        0x62 => op!("shl", None, Sequential, 2, 1),
        0x63 => op!("shr", None, Sequential, 2, 1),
        0x64 => op!("shr.un", None, Sequential, 2, 1),
        0x65 => op!("neg", None, Sequential, 1, 1),
        0x66 => op!("not", None, Sequential, 1, 1),
        0x67 => op!("conv.i1", None, Sequential, 1, 1),
        0x68 => op!("conv.i2", None, Sequential, 1, 1),
        0x69 => op!("conv.i4", None, Sequential, 1, 1),
        0x6A => op!("conv.i8", None, Sequential, 1, 1),
        0x6B => op!("conv.r4", None, Sequential, 1, 1),
        0x6C => op!("conv.r8", None, Sequential, 1, 1),
        0x6D => op!("conv.u4", None, Sequential, 1, 1),
        0x6E => op!("conv.u8", None, Sequential, 1, 1),
        0x6F => op!("callvirt", Token, Call, sig, sig),
        0x70 => op!("cpobj", Token, Sequential, 2, 0),
        0x71 => op!("ldobj", Token, Sequential, 1, 1),
        0x72 => op!("ldstr", Token, Sequential, 0, 1),
        0x73 => op!("newobj", Token, Call, sig, 1),
        0x74 => op!("castclass", Token, Sequential, 1, 1),
        0x75 => op!("isinst", Token, Sequential, 1, 1),
        0x76 => op!("conv.r.un", None, Sequential, 1, 1),
        0x79 => op!("unbox", Token, Sequential, 1, 1),
        0x7A => op!("throw", None, Throw, 1, 0),
        0x7B => op!("ldfld", Token, Sequential, 1, 1),
        0x7C => op!("ldflda", Token, Sequential, 1, 1),
        0x7D => op!("stfld", Token, Sequential, 2, 0),
        0x7E => op!("ldsfld", Token, Sequential, 0, 1),
        0x7F => op!("ldsflda", Token, Sequential, 0, 1),
        0x80 => op!("stsfld", Token, Sequential, 1, 0),
        0x81 => op!("stobj", Token, Sequential, 2, 0),
        0x82 => op!("conv.ovf.i1.un", None, Sequential, 1, 1),
        0x83 => op!("conv.ovf.i2.un", None, Sequential, 1, 1),
        0x84 => op!("conv.ovf.i4.un", None, Sequential, 1, 1),
        0x85 => op!("conv.ovf.i8.un", None, Sequential, 1, 1),
        0x86 => op!("conv.ovf.u1.un", None, Sequential, 1, 1),
        0x87 => op!("conv.ovf.u2.un", None, Sequential, 1, 1),
        0x88 => op!("conv.ovf.u4.un", None, Sequential, 1, 1),
        0x89 => op!("conv.ovf.u8.un", None, Sequential, 1, 1),
        0x8A => op!("conv.ovf.i.un", None, Sequential, 1, 1),
        0x8B => op!("conv.ovf.u.un", None, Sequential, 1, 1),
        0x8C => op!("box", Token, Sequential, 1, 1),
        0x8D => op!("newarr", Token, Sequential, 1, 1),
        0x8E => op!("ldlen", None, Sequential, 1, 1),
        0x8F => op!("ldelema", Token, Sequential, 2, 1),
        0x90 => op!("ldelem.i1", None, Sequential, 2, 1),
        0x91 => op!("ldelem.u1", None, Sequential, 2, 1),
        0x92 => op!("ldelem.i2", None, Sequential, 2, 1),
        0x93 => op!("ldelem.u2", None, Sequential, 2, 1),
        0x94 => op!("ldelem.i4", None, Sequential, 2, 1),
        0x95 => op!("ldelem.u4", None, Sequential, 2, 1),
        0x96 => op!("ldelem.i8", None, Sequential, 2, 1),
        0x97 => op!("ldelem.i", None, Sequential, 2, 1),
        0x98 => op!("ldelem.r4", None, Sequential, 2, 1),
        0x99 => op!("ldelem.r8", None, Sequential, 2, 1),
        0x9A => op!("ldelem.ref", None, Sequential, 2, 1),
        0x9B => op!("stelem.i", None, Sequential, 3, 0),
        0x9C => op!("stelem.i1", None, Sequential, 3, 0),
        0x9D => op!("stelem.i2", None, Sequential, 3, 0),
        0x9E => op!("stelem.i4", None, Sequential, 3, 0),
        0x9F => op!("stelem.i8", None, Sequential, 3, 0),
        0xA0 => op!("stelem.r4", None, Sequential, 3, 0),
        0xA1 => op!("stelem.r8", None, Sequential, 3, 0),
        0xA2 => op!("stelem.ref", None, Sequential, 3, 0),
        0xA3 => op!("ldelem", Token, Sequential, 2, 1),
        0xA4 => op!("stelem", Token, Sequential, 3, 0),
        0xA5 => op!("unbox.any", Token, Sequential, 1, 1),
        0xB3 => op!("conv.ovf.i1", None, Sequential, 1, 1),
        0xB4 => op!("conv.ovf.u1", None, Sequential, 1, 1),
        0xB5 => op!("conv.ovf.i2", None, Sequential, 1, 1),
        0xB6 => op!("conv.ovf.u2", None, Sequential, 1, 1),
        0xB7 => op!("conv.ovf.i4", None, Sequential, 1, 1),
        0xB8 => op!("conv.ovf.u4", None, Sequential, 1, 1),
        0xB9 => op!("conv.ovf.i8", None, Sequential, 1, 1),
        0xBA => op!("conv.ovf.u8", None, Sequential, 1, 1),
        0xC2 => op!("refanyval", Token, Sequential, 1, 1),
        0xC3 => op!("ckfinite", None, Sequential, 1, 1),
        0xC6 => op!("mkrefany", Token, Sequential, 1, 1),
        0xD0 => op!("ldtoken", Token, Sequential, 0, 1),
        0xD1 => op!("conv.u2", None, Sequential, 1, 1),
        0xD2 => op!("conv.u1", None, Sequential, 1, 1),
        0xD3 => op!("conv.i", None, Sequential, 1, 1),
        0xD4 => op!("conv.ovf.i", None, Sequential, 1, 1),
        0xD5 => op!("conv.ovf.u", None, Sequential, 1, 1),
        0xD6 => op!("add.ovf", None, Sequential, 2, 1),
        0xD7 => op!("add.ovf.un", None, Sequential, 2, 1),
        0xD8 => op!("mul.ovf", None, Sequential, 2, 1),
        0xD9 => op!("mul.ovf.un", None, Sequential, 2, 1),
        0xDA => op!("sub.ovf", None, Sequential, 2, 1),
        0xDB => op!("sub.ovf.un", None, Sequential, 2, 1),
        0xDC => op!("endfinally", None, EndFinally, 0, 0),
        0xDD => op!("leave", Branch, Leave, 0, 0),
        0xDE => op!("leave.s", ShortBranch, Leave, 0, 0),
        0xDF => op!("stind.i", None, Sequential, 2, 0),
        0xE0 => op!("conv.u", None, Sequential, 1, 1),
        0xFE00 => op!("arglist", None, Sequential, 0, 1),
        0xFE01 => op!("ceq", None, Sequential, 2, 1),
        0xFE02 => op!("cgt", None, Sequential, 2, 1),
        0xFE03 => op!("cgt.un", None, Sequential, 2, 1),
        0xFE04 => op!("clt", None, Sequential, 2, 1),
        0xFE05 => op!("clt.un", None, Sequential, 2, 1),
        0xFE06 => op!("ldftn", Token, Sequential, 0, 1),
        0xFE07 => op!("ldvirtftn", Token, Sequential, 1, 1),
        0xFE09 => op!("ldarg", Var, Sequential, 0, 1),
        0xFE0A => op!("ldarga", Var, Sequential, 0, 1),
        0xFE0B => op!("starg", Var, Sequential, 1, 0),
        0xFE0C => op!("ldloc", Var, Sequential, 0, 1),
        0xFE0D => op!("ldloca", Var, Sequential, 0, 1),
        0xFE0E => op!("stloc", Var, Sequential, 1, 0),
        0xFE0F => op!("localloc", None, Sequential, 1, 1),
        0xFE11 => op!("endfilter", None, EndFilter, 1, 0),
        0xFE12 => op!("unaligned.", ShortVar, Meta, 0, 0),
        0xFE13 => op!("volatile.", None, Meta, 0, 0),
        0xFE14 => op!("tail.", None, Meta, 0, 0),
        0xFE15 => op!("initobj", Token, Sequential, 1, 0),
        0xFE16 => op!("constrained.", Token, Meta, 0, 0),
        0xFE17 => op!("cpblk", None, Sequential, 3, 0),
        0xFE18 => op!("initblk", None, Sequential, 3, 0),
        0xFE19 => op!("no.", ShortVar, Meta, 0, 0),
        0xFE1A => op!("rethrow", None, Throw, 0, 0),
        0xFE1C => op!("sizeof", Token, Sequential, 0, 1),
        0xFE1D => op!("refanytype", None, Sequential, 1, 1),
        0xFE1E => op!("readonly.", None, Meta, 0, 0),
        _ => None,
    }
}
