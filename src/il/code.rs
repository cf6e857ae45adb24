//! Arena representation of method code used while rewriting.
//!
//! Instructions live in an append-only arena and are addressed by [`NodeId`]. Their order is
//! a separate vector, and every branch target or exception-range boundary is a [`LabelId`]
//! bound to a node. Inserting, replacing or growing instructions therefore never invalidates
//! a target: offsets only exist again once the encoder lays the code out.

use std::collections::HashMap;

use crate::{il::instruction::Instruction, Result};

/// Index of an instruction node in a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Index of a label in a [`CodeBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

/// What a label points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTarget {
    /// Not bound yet
    Unbound,
    /// Start of the given node
    Node(NodeId),
    /// One past the last instruction
    End,
}

/// An instruction in the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// The instruction; branches always carry their long-form opcode here
    pub instruction: Instruction<LabelId>,
    /// Offset in the original code, `None` for synthesized instructions
    pub origin: Option<u32>,
}

/// Instructions, their order and their labels.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    nodes: Vec<Node>,
    order: Vec<NodeId>,
    labels: Vec<LabelTarget>,
    offset_labels: HashMap<u32, LabelId>,
    offset_nodes: HashMap<u32, NodeId>,
    original_size: u32,
}

impl CodeBuffer {
    /// Build the arena from decoded instructions.
    ///
    /// Every branch target becomes a label; short branches are normalised to their long form.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a branch target is not an instruction boundary.
    pub fn from_instructions(instructions: Vec<Instruction>, code_size: u32) -> Result<Self> {
        let mut code = CodeBuffer {
            nodes: Vec::with_capacity(instructions.len()),
            order: Vec::with_capacity(instructions.len()),
            original_size: code_size,
            ..CodeBuffer::default()
        };

        for (index, instruction) in instructions.iter().enumerate() {
            let id = NodeId(index as u32);
            code.offset_nodes.insert(instruction.offset, id);
            code.order.push(id);
        }

        for instruction in instructions {
            let origin = instruction.offset;
            let operand = instruction.operand.map_targets(|target| {
                if !code.offset_nodes.contains_key(&target) {
                    return Err(malformed_error!(
                        "Branch at IL_{:04x} targets IL_{:04x}, which is not an instruction",
                        origin,
                        target
                    ));
                }
                code.label_at(target)
            })?;

            code.nodes.push(Node {
                instruction: Instruction {
                    offset: origin,
                    opcode: instruction.opcode.long_form(),
                    operand,
                },
                origin: Some(origin),
            });
        }

        Ok(code)
    }

    /// Label for an offset of the original code, created on first use.
    ///
    /// The end of the original code is a valid boundary (exception ranges may end there).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `offset` is not an instruction boundary.
    pub fn label_at(&mut self, offset: u32) -> Result<LabelId> {
        if let Some(label) = self.offset_labels.get(&offset) {
            return Ok(*label);
        }

        let target = if let Some(node) = self.offset_nodes.get(&offset) {
            LabelTarget::Node(*node)
        } else if offset == self.original_size {
            LabelTarget::End
        } else {
            return Err(malformed_error!(
                "IL_{:04x} is not an instruction boundary",
                offset
            ));
        };

        let label = self.push_label(target);
        self.offset_labels.insert(offset, label);
        Ok(label)
    }

    /// Create a label that is bound later with [`CodeBuffer::bind`].
    pub fn new_label(&mut self) -> LabelId {
        self.push_label(LabelTarget::Unbound)
    }

    fn push_label(&mut self, target: LabelTarget) -> LabelId {
        let label = LabelId(self.labels.len() as u32);
        self.labels.push(target);
        label
    }

    /// Bind a label to the start of a node.
    pub fn bind(&mut self, label: LabelId, node: NodeId) {
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = LabelTarget::Node(node);
        }
    }

    /// Rebind every label that points at the end of the original code to `node`.
    ///
    /// Used once code is appended after the original instructions, so that ranges ending at
    /// the old end keep ending there.
    pub fn rebind_end(&mut self, node: NodeId) {
        for label in &mut self.labels {
            if *label == LabelTarget::End {
                *label = LabelTarget::Node(node);
            }
        }
    }

    /// Add a node to the arena without placing it in the order.
    pub fn push_node(&mut self, instruction: Instruction<LabelId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            instruction: Instruction {
                opcode: instruction.opcode.long_form(),
                ..instruction
            },
            origin: None,
        });
        id
    }

    /// Replace the instruction order.
    pub fn set_order(&mut self, order: Vec<NodeId>) {
        self.order = order;
    }

    /// Instruction order.
    #[must_use]
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Number of nodes in the arena, placed or not.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node by id.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for an id that was never allocated.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0 as usize)
            .ok_or_else(|| malformed_error!("Unknown node {}", id.0))
    }

    /// Mutable node by id.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for an id that was never allocated.
    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or_else(|| malformed_error!("Unknown node {}", id.0))
    }

    /// Current binding of a label.
    #[must_use]
    pub fn label_target(&self, label: LabelId) -> LabelTarget {
        self.labels
            .get(label.0 as usize)
            .copied()
            .unwrap_or(LabelTarget::Unbound)
    }

    /// Node that was decoded from `offset` of the original code.
    #[must_use]
    pub fn node_at_offset(&self, offset: u32) -> Option<NodeId> {
        self.offset_nodes.get(&offset).copied()
    }

    /// Size of the code this buffer was decoded from.
    #[must_use]
    pub fn original_size(&self) -> u32 {
        self.original_size
    }
}
