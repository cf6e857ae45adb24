//! Fixed-point layout and byte encoding of a [`CodeBuffer`].
//!
//! Layout starts optimistic: every branch is assumed to fit the 8-bit short form. Each pass
//! computes offsets, then promotes the branches whose displacement does not fit to the
//! 32-bit form. Promotion only ever grows code, so the process is monotonic and reaches a
//! fixed point after at most one pass per branch; the pass budget bounds it anyway so a
//! pathological body cannot stall a compiler thread.

use crate::{
    il::{
        code::{CodeBuffer, LabelId, LabelTarget, NodeId},
        instruction::{Instruction, Operand},
    },
    utils::io::push_le,
    Error, Result,
};

const UNPLACED: u32 = u32::MAX;

/// Final offsets and branch forms of every placed node.
#[derive(Debug, Clone)]
pub struct Layout {
    offsets: Vec<u32>,
    long: Vec<bool>,
    code_size: u32,
    passes: usize,
}

impl Layout {
    /// Offset of a node, `None` if the node is not part of the order.
    #[must_use]
    pub fn offset_of(&self, node: NodeId) -> Option<u32> {
        self.offsets
            .get(node.0 as usize)
            .copied()
            .filter(|offset| *offset != UNPLACED)
    }

    /// Offset a label resolves to.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unbound labels or labels bound to unplaced nodes.
    pub fn resolve(&self, code: &CodeBuffer, label: LabelId) -> Result<u32> {
        match code.label_target(label) {
            LabelTarget::Node(node) => self
                .offset_of(node)
                .ok_or_else(|| malformed_error!("Label {} bound to unplaced node", label.0)),
            LabelTarget::End => Ok(self.code_size),
            LabelTarget::Unbound => Err(malformed_error!("Label {} is unbound", label.0)),
        }
    }

    /// Total code size in bytes.
    #[must_use]
    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    /// Number of passes needed to converge.
    #[must_use]
    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Returns `true` if the branch at `node` uses the 32-bit form.
    #[must_use]
    pub fn is_long(&self, node: NodeId) -> bool {
        self.long.get(node.0 as usize).copied().unwrap_or(false)
    }
}

fn node_size(instruction: &Instruction<LabelId>, long: bool) -> usize {
    if instruction.opcode.is_branch() {
        1 + if long { 4 } else { 1 }
    } else {
        instruction.size()
    }
}

fn assign_offsets(code: &CodeBuffer, layout: &mut Layout) -> Result<()> {
    layout.offsets.iter_mut().for_each(|offset| *offset = UNPLACED);

    let mut position = 0usize;
    for id in code.order() {
        let node = code.node(*id)?;
        layout.offsets[id.0 as usize] = u32::try_from(position)
            .map_err(|_| malformed_error!("Code size exceeds u32 range"))?;
        position += node_size(&node.instruction, layout.long[id.0 as usize]);
    }

    layout.code_size =
        u32::try_from(position).map_err(|_| malformed_error!("Code size exceeds u32 range"))?;
    Ok(())
}

/// Compute a converged layout.
///
/// # Errors
/// Returns [`Error::NonConvergentLayout`] if offsets are still changing after `max_passes`
/// passes, or [`crate::Error::Malformed`] if a label cannot be resolved.
pub fn layout(code: &CodeBuffer, max_passes: usize) -> Result<Layout> {
    let mut layout = Layout {
        offsets: vec![UNPLACED; code.node_count()],
        long: vec![false; code.node_count()],
        code_size: 0,
        passes: 0,
    };

    for pass in 1..=max_passes {
        assign_offsets(code, &mut layout)?;

        let mut promoted = 0usize;
        for id in code.order() {
            let node = code.node(*id)?;
            if !node.instruction.opcode.is_branch() || layout.long[id.0 as usize] {
                continue;
            }

            let Operand::Target(label) = node.instruction.operand else {
                return Err(malformed_error!(
                    "Branch {} without a label operand",
                    node.instruction.opcode
                ));
            };

            let start = i64::from(layout.offsets[id.0 as usize]);
            let displacement = i64::from(layout.resolve(code, label)?) - (start + 2);
            if i8::try_from(displacement).is_err() {
                layout.long[id.0 as usize] = true;
                promoted += 1;
            }
        }

        if promoted == 0 {
            layout.passes = pass;
            tracing::trace!(pass, size = layout.code_size, "layout converged");
            return Ok(layout);
        }

        tracing::trace!(pass, promoted, "promoted branches to long form");
    }

    Err(Error::NonConvergentLayout(max_passes))
}

/// Encode the ordered instructions using a converged layout.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if a label cannot be resolved or a displacement does
/// not fit the chosen form.
pub fn encode(code: &CodeBuffer, layout: &Layout) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(layout.code_size as usize);

    for id in code.order() {
        let node = code.node(*id)?;
        let instruction = &node.instruction;
        let start = out.len();
        let size = node_size(instruction, layout.is_long(*id));
        let end = i64::from(layout.offsets[id.0 as usize]) + size as i64;

        if instruction.opcode.is_branch() {
            let Operand::Target(label) = instruction.operand else {
                return Err(malformed_error!(
                    "Branch {} without a label operand",
                    instruction.opcode
                ));
            };
            let displacement = i64::from(layout.resolve(code, label)?) - end;

            if layout.is_long(*id) {
                instruction.opcode.long_form().write(&mut out);
                let displacement = i32::try_from(displacement)
                    .map_err(|_| malformed_error!("Branch displacement {} too large", displacement))?;
                push_le(&mut out, displacement);
            } else {
                instruction.opcode.short_form().write(&mut out);
                let displacement = i8::try_from(displacement).map_err(|_| {
                    malformed_error!("Short branch displacement {} out of range", displacement)
                })?;
                push_le(&mut out, displacement);
            }
        } else {
            instruction.opcode.write(&mut out);
            write_operand(&mut out, code, layout, &instruction.operand, end)?;
        }

        debug_assert_eq!(out.len() - start, size);
    }

    Ok(out)
}

fn write_operand(
    out: &mut Vec<u8>,
    code: &CodeBuffer,
    layout: &Layout,
    operand: &Operand<LabelId>,
    end: i64,
) -> Result<()> {
    match operand {
        Operand::None => {}
        Operand::Int8(value) => push_le(out, *value),
        Operand::UInt8(value) => push_le(out, *value),
        Operand::UInt16(value) => push_le(out, *value),
        Operand::Int32(value) => push_le(out, *value),
        Operand::Int64(value) => push_le(out, *value),
        Operand::Float32(bits) => push_le(out, *bits),
        Operand::Float64(bits) => push_le(out, *bits),
        Operand::Token(token) => push_le(out, token.value()),
        Operand::Target(label) => {
            // Non-branch opcodes never carry a label; treat it as a 32-bit displacement
            let displacement = i64::from(layout.resolve(code, *label)?) - end;
            push_le(out, i32::try_from(displacement).map_err(|_| Error::OutOfBounds)?);
        }
        Operand::Switch(labels) => {
            push_le(out, labels.len() as u32);
            for label in labels {
                let displacement = i64::from(layout.resolve(code, *label)?) - end;
                push_le(
                    out,
                    i32::try_from(displacement)
                        .map_err(|_| malformed_error!("Switch displacement {} too large", displacement))?,
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        il::{decoder::decode_stream, opcodes::OpCode},
        Parser,
    };

    fn buffer(code: &[u8]) -> CodeBuffer {
        let instructions = decode_stream(&mut Parser::new(code)).unwrap();
        CodeBuffer::from_instructions(instructions, code.len() as u32).unwrap()
    }

    #[test]
    fn reencodes_unchanged_code() {
        // ldarg.0; brfalse.s +2; ldc.i4.1; ret; ldc.i4.0; ret
        let original = [0x02, 0x2C, 0x02, 0x17, 0x2A, 0x16, 0x2A];
        let code = buffer(&original);
        let layout = layout(&code, 8).unwrap();

        assert_eq!(layout.passes(), 1);
        assert_eq!(encode(&code, &layout).unwrap(), original);
    }

    #[test]
    fn long_branches_shrink_when_possible() {
        // br +0 (long form); ret
        let code = buffer(&[0x38, 0x00, 0x00, 0x00, 0x00, 0x2A]);
        let layout = layout(&code, 8).unwrap();
        assert_eq!(encode(&code, &layout).unwrap(), vec![0x2B, 0x00, 0x2A]);
    }

    #[test]
    fn growth_promotes_branches() {
        // br.s +0; ret, then 200 nops inserted between the branch and its target
        let mut code = buffer(&[0x2B, 0x00, 0x2A]);
        let mut order = vec![code.order()[0]];
        for _ in 0..200 {
            order.push(code.push_node(Instruction::new(OpCode::NOP, Operand::None)));
        }
        order.push(code.order()[1]);
        code.set_order(order);

        let layout = layout(&code, 8).unwrap();
        assert_eq!(layout.passes(), 2);
        assert_eq!(layout.code_size(), 5 + 200 + 1);

        let bytes = encode(&code, &layout).unwrap();
        assert_eq!(&bytes[..5], &[0x38, 200, 0, 0, 0]);
        assert_eq!(bytes[205], 0x2A);
    }

    #[test]
    fn pass_budget_is_enforced() {
        let mut code = buffer(&[0x2B, 0x00, 0x2A]);
        let mut order = vec![code.order()[0]];
        for _ in 0..200 {
            order.push(code.push_node(Instruction::new(OpCode::NOP, Operand::None)));
        }
        order.push(code.order()[1]);
        code.set_order(order);

        assert!(matches!(
            layout(&code, 1),
            Err(Error::NonConvergentLayout(1))
        ));
    }

    #[test]
    fn switch_targets_follow_the_table() {
        // switch (1) +1; nop; ret
        let original = [0x45, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2A];
        let code = buffer(&original);
        let layout = layout(&code, 4).unwrap();
        assert_eq!(encode(&code, &layout).unwrap(), original);
    }
}
