//! Injection of entry and exit helper calls into method bodies.
//!
//! The rewriter turns
//!
//! ```text
//! <original body with N `ret` instructions>
//! ```
//!
//! into
//!
//! ```text
//!         ldc.i4   <method token>
//!         call     Enter                 // int64 Enter(int32)
//!         stloc    corr
//!   .try {
//!     .try {
//!         <original body, every `ret` replaced by `stloc ret; leave END`>
//!     } catch [System.Object] {          // EXCEPTION policy only
//!         stloc    exc
//!         rethrow
//!     }
//!   } finally {
//!         ldloc    ret                   // non-void methods only
//!         ldloc    exc
//!         ldloc    corr
//!         call     Exit                  // void Exit([T,] object, int64)
//!         endfinally
//!   }
//! END:    ldloc    ret                   // non-void methods only
//!         ret
//! ```
//!
//! so the exit helper observes every way out of the method exactly once. With only the
//! `ENTRY` policy, just the three prologue instructions are inserted.
//!
//! Work happens on a [`CodeBuffer`], whose labels keep every original branch and exception
//! range attached to its instruction while code is inserted around it; the encoder then finds
//! a branch layout that fits.
//!
//! A body whose first two instructions already are `ldc.i4 <method token>; call <Enter>` is
//! reported as [`RewriteOutcome::AlreadyInstrumented`], which makes rewriting idempotent.

use std::collections::BTreeMap;

use crate::{
    il::{
        body::{MethodBody, MethodBodyWriter},
        code::{CodeBuffer, LabelId, NodeId},
        decoder::decode_stream,
        encoder,
        exceptions::{ExceptionHandler, ExceptionHandlerFlags},
        instruction::{Instruction, Operand},
        opcodes::OpCode,
    },
    integration::rule::InstrumentationPolicy,
    metadata::{
        signature::{LocalSignature, MethodSignature, TypeSig},
        token::Token,
    },
    utils::parser::Parser,
    Error, Result,
};

/// Supplies the metadata tokens referenced by injected code.
///
/// Implemented by the per-module metadata emitter; tokens are created on first request and
/// cached afterwards.
pub trait HelperTokenSource {
    /// `MemberRef` of `static int64 Enter(int32)`.
    ///
    /// # Errors
    /// Returns an error if the reference cannot be emitted.
    fn enter(&self) -> Result<Token>;

    /// `MemberRef` of the exit helper for the given return type (`None` for `void`).
    ///
    /// # Errors
    /// Returns an error if the reference cannot be emitted.
    fn exit(&self, ret: Option<&TypeSig>) -> Result<Token>;

    /// `TypeRef` of `System.Object`, the type caught by the synthesized handler.
    ///
    /// # Errors
    /// Returns an error if the reference cannot be emitted.
    fn exception_type(&self) -> Result<Token>;

    /// `StandAloneSig` for an extended local variable signature blob.
    ///
    /// # Errors
    /// Returns an error if the signature cannot be emitted.
    fn local_signature(&self, blob: &[u8]) -> Result<Token>;
}

/// Everything the rewriter needs to know about one method.
#[derive(Debug, Clone, Copy)]
pub struct RewriteRequest<'a> {
    /// `MethodDef` token of the method, passed to the entry helper
    pub method_token: Token,
    /// Complete original body (header, code, extra sections)
    pub body: &'a [u8],
    /// Decoded method signature
    pub signature: &'a MethodSignature,
    /// Original local variable signature blob, empty when the method has no locals
    pub locals: &'a [u8],
    /// Whether the method is an instance constructor
    pub is_constructor: bool,
    /// What to inject
    pub policy: InstrumentationPolicy,
}

/// A rewritten method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenMethod {
    /// Complete new body (fat header, code, exception section)
    pub body: Vec<u8>,
    /// Offset of every original instruction in the new code
    pub offset_map: BTreeMap<u32, u32>,
    /// `StandAloneSig` token of the extended locals
    pub locals_token: Token,
    /// Declared evaluation stack depth
    pub max_stack: u16,
    /// Layout passes needed to converge
    pub layout_passes: usize,
}

/// Result of a successful rewrite request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    /// The body was instrumented
    Rewritten(RewrittenMethod),
    /// The body already carries this engine's instrumentation; use it unchanged
    AlreadyInstrumented,
}

/// Rewrites method bodies according to an [`InstrumentationPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct Rewriter {
    max_layout_passes: usize,
}

impl Default for Rewriter {
    fn default() -> Self {
        Rewriter::new(32)
    }
}

impl Rewriter {
    /// Create a rewriter with the given relayout pass budget.
    #[must_use]
    pub fn new(max_layout_passes: usize) -> Self {
        Rewriter {
            max_layout_passes: max_layout_passes.max(1),
        }
    }

    /// Rewrite a method body.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedMethodShape`] if the method uses a construct the rewriter
    ///   declines (filters, `jmp`, `tail.`, `localloc`, constructor or by-ref/generic return
    ///   under `EXIT`, empty body)
    /// - [`Error::NonConvergentLayout`] if branch relayout exceeds the pass budget
    /// - [`Error::Malformed`] / [`Error::OutOfBounds`] if the original body cannot be decoded
    /// - Any error of the [`HelperTokenSource`]
    pub fn rewrite(
        &self,
        request: &RewriteRequest,
        tokens: &dyn HelperTokenSource,
    ) -> Result<RewriteOutcome> {
        let header = MethodBody::from(request.body)?;
        let code = header.code(request.body)?;
        if code.is_empty() {
            return Err(Error::UnsupportedMethodShape("empty body".to_string()));
        }

        let instructions = decode_stream(&mut Parser::new(code))?;
        let enter = tokens.enter()?;
        if is_instrumented(&instructions, request.method_token, enter) {
            tracing::debug!(method = %request.method_token, "body already instrumented");
            return Ok(RewriteOutcome::AlreadyInstrumented);
        }

        check_shape(request, &header, &instructions)?;

        let mut context = RewriteContext::new(request, &header, instructions, code.len())?;
        context.insert_entry(request.method_token, enter);
        if request.policy.contains(InstrumentationPolicy::EXIT) {
            let exit = tokens.exit(context.ret_slot.map(|_| &context.ret_type))?;
            let exception_type = if request.policy.contains(InstrumentationPolicy::EXCEPTION) {
                Some(tokens.exception_type()?)
            } else {
                None
            };
            context.wrap_exit(exit, exception_type)?;
        }

        let locals_token = tokens.local_signature(&context.locals.encode()?)?;
        let rewritten = context.finish(self.max_layout_passes, locals_token)?;

        tracing::debug!(
            method = %request.method_token,
            size = rewritten.body.len(),
            passes = rewritten.layout_passes,
            "rewrote method body"
        );
        Ok(RewriteOutcome::Rewritten(rewritten))
    }
}

/// Returns `true` if the code starts with this engine's entry sequence for `method`.
#[must_use]
pub fn is_instrumented(instructions: &[Instruction], method: Token, enter: Token) -> bool {
    match instructions {
        [load, call, ..] => {
            load.int32_constant() == Some(method.value() as i32)
                && call.opcode == OpCode::CALL
                && call.token() == Some(enter)
        }
        _ => false,
    }
}

fn decline(reason: impl Into<String>) -> Error {
    Error::UnsupportedMethodShape(reason.into())
}

fn check_shape(
    request: &RewriteRequest,
    header: &MethodBody,
    instructions: &[Instruction],
) -> Result<()> {
    if header.exception_handlers.iter().any(ExceptionHandler::is_filter) {
        return Err(decline("exception filter"));
    }

    for instruction in instructions {
        match instruction.opcode {
            OpCode::JMP => return Err(decline("jmp")),
            OpCode::TAIL => return Err(decline("tail. prefixed call")),
            OpCode::LOCALLOC => return Err(decline("localloc")),
            _ => {}
        }
    }

    if request.policy.contains(InstrumentationPolicy::EXIT) {
        if request.is_constructor {
            return Err(decline("instance constructor"));
        }

        let ret = request.signature.ret.unmodified();
        if matches!(ret, TypeSig::ByRef(_) | TypeSig::TypedByRef) {
            return Err(decline("by-ref return"));
        }
        if ret.contains_generic_parameter() {
            return Err(decline("generic return"));
        }
    }

    if header.local_signature().is_some() == request.locals.is_empty() {
        return Err(malformed_error!(
            "Local signature token {:#x} does not match the supplied locals",
            header.local_var_sig_token
        ));
    }

    Ok(())
}

struct ClauseLabels {
    flags: ExceptionHandlerFlags,
    class_or_filter: u32,
    try_start: LabelId,
    try_end: LabelId,
    handler_start: LabelId,
    handler_end: LabelId,
}

/// State of one rewrite invocation.
struct RewriteContext {
    code: CodeBuffer,
    locals: LocalSignature,
    ret_type: TypeSig,
    ret_slot: Option<u16>,
    exc_slot: Option<u16>,
    corr_slot: u16,
    clauses: Vec<ClauseLabels>,
    entry_nodes: Vec<NodeId>,
    tail_nodes: Vec<NodeId>,
    max_stack: u16,
}

impl RewriteContext {
    fn new(
        request: &RewriteRequest,
        header: &MethodBody,
        instructions: Vec<Instruction>,
        code_size: usize,
    ) -> Result<Self> {
        let code_size = u32::try_from(code_size)
            .map_err(|_| malformed_error!("Code size {} exceeds u32", code_size))?;
        let mut code = CodeBuffer::from_instructions(instructions, code_size)?;

        let mut clauses = Vec::with_capacity(header.exception_handlers.len() + 2);
        for clause in &header.exception_handlers {
            clauses.push(ClauseLabels {
                flags: clause.flags,
                class_or_filter: clause.class_or_filter,
                try_start: code.label_at(clause.try_offset)?,
                try_end: code.label_at(clause.try_end())?,
                handler_start: code.label_at(clause.handler_offset)?,
                handler_end: code.label_at(clause.handler_end())?,
            });
        }

        let exit = request.policy.contains(InstrumentationPolicy::EXIT);
        let ret_type = request.signature.ret.unmodified().clone();
        let mut locals = LocalSignature::parse(request.locals)?;
        let ret_slot = if exit && !ret_type.is_void() {
            Some(locals.push(&ret_type)?)
        } else {
            None
        };
        let exc_slot = if exit {
            Some(locals.push(&TypeSig::Object)?)
        } else {
            None
        };
        let corr_slot = locals.push(&TypeSig::I8)?;

        // ldloc ret, ldloc exc, ldloc corr before the exit call
        let needed = if exit {
            2 + u16::from(ret_slot.is_some())
        } else {
            1
        };

        Ok(RewriteContext {
            code,
            locals,
            ret_type,
            ret_slot,
            exc_slot,
            corr_slot,
            clauses,
            entry_nodes: Vec::new(),
            tail_nodes: Vec::new(),
            max_stack: header.max_stack.max(needed),
        })
    }

    fn push(&mut self, opcode: OpCode, operand: Operand<LabelId>) -> NodeId {
        self.code.push_node(Instruction::new(opcode, operand))
    }

    fn insert_entry(&mut self, method: Token, enter: Token) {
        let load = self.push(OpCode::LDC_I4, Operand::Int32(method.value() as i32));
        let call = self.push(OpCode::CALL, Operand::Token(enter));
        let store = self.code.push_node(store_local(self.corr_slot));
        self.entry_nodes = vec![load, call, store];
    }

    fn wrap_exit(&mut self, exit: Token, exception_type: Option<Token>) -> Result<()> {
        let exc_slot = self
            .exc_slot
            .ok_or_else(|| malformed_error!("Exit wrapping without an exception local"))?;
        let body: Vec<NodeId> = self.code.order().to_vec();
        let first = *body
            .first()
            .ok_or_else(|| Error::UnsupportedMethodShape("empty body".to_string()))?;

        let end = self.code.new_label();
        let mut order = Vec::with_capacity(body.len() + 16);
        for id in body {
            order.push(id);
            if self.code.node(id)?.instruction.opcode != OpCode::RET {
                continue;
            }

            // The node keeps its identity so branches to the old `ret` still land here
            let node = self.code.node_mut(id)?;
            if let Some(slot) = self.ret_slot {
                node.instruction = Instruction {
                    offset: node.instruction.offset,
                    ..store_local(slot)
                };
                order.push(self.push(OpCode::LEAVE, Operand::Target(end)));
            } else {
                node.instruction.opcode = OpCode::LEAVE;
                node.instruction.operand = Operand::Target(end);
            }
        }

        let try_start = self.code.new_label();
        self.code.bind(try_start, first);

        let mut tail = Vec::new();
        let catch = if let Some(class) = exception_type {
            let catch_start = self.code.push_node(store_local(exc_slot));
            tail.push(catch_start);
            tail.push(self.push(OpCode::RETHROW, Operand::None));
            Some((catch_start, class))
        } else {
            None
        };

        let mut finally = Vec::new();
        if let Some(slot) = self.ret_slot {
            finally.push(self.code.push_node(load_local(slot)));
        }
        finally.push(self.code.push_node(load_local(exc_slot)));
        finally.push(self.code.push_node(load_local(self.corr_slot)));
        finally.push(self.push(OpCode::CALL, Operand::Token(exit)));
        finally.push(self.push(OpCode::ENDFINALLY, Operand::None));
        let finally_start = finally[0];
        tail.extend(finally);

        let epilogue_start = match self.ret_slot {
            Some(slot) => self.code.push_node(load_local(slot)),
            None => self.push(OpCode::RET, Operand::None),
        };
        tail.push(epilogue_start);
        if self.ret_slot.is_some() {
            tail.push(self.push(OpCode::RET, Operand::None));
        }
        self.code.bind(end, epilogue_start);

        // Existing ranges that ended with the original code now end before the handlers
        self.code.rebind_end(tail[0]);

        let finally_label = self.code.new_label();
        self.code.bind(finally_label, finally_start);
        let epilogue_label = self.code.new_label();
        self.code.bind(epilogue_label, epilogue_start);

        if let Some((catch_start, class)) = catch {
            let catch_label = self.code.new_label();
            self.code.bind(catch_label, catch_start);
            self.clauses.push(ClauseLabels {
                flags: ExceptionHandlerFlags::EXCEPTION,
                class_or_filter: class.value(),
                try_start,
                try_end: catch_label,
                handler_start: catch_label,
                handler_end: finally_label,
            });
        }
        self.clauses.push(ClauseLabels {
            flags: ExceptionHandlerFlags::FINALLY,
            class_or_filter: 0,
            try_start,
            try_end: finally_label,
            handler_start: finally_label,
            handler_end: epilogue_label,
        });

        order.extend(tail.iter().copied());
        self.tail_nodes = tail;
        self.code.set_order(order);
        Ok(())
    }

    fn finish(mut self, max_passes: usize, locals_token: Token) -> Result<RewrittenMethod> {
        let mut order = self.entry_nodes.clone();
        order.extend_from_slice(self.code.order());
        self.code.set_order(order);

        let layout = encoder::layout(&self.code, max_passes)?;
        let bytes = encoder::encode(&self.code, &layout)?;

        let mut offset_map = BTreeMap::new();
        for id in self.code.order() {
            let node = self.code.node(*id)?;
            if let (Some(origin), Some(offset)) = (node.origin, layout.offset_of(*id)) {
                offset_map.insert(origin, offset);
            }
        }

        let mut clauses = Vec::with_capacity(self.clauses.len());
        for labels in &self.clauses {
            let try_offset = layout.resolve(&self.code, labels.try_start)?;
            let try_end = layout.resolve(&self.code, labels.try_end)?;
            let handler_offset = layout.resolve(&self.code, labels.handler_start)?;
            let handler_end = layout.resolve(&self.code, labels.handler_end)?;
            clauses.push(ExceptionHandler {
                flags: labels.flags,
                try_offset,
                try_length: try_end.saturating_sub(try_offset),
                handler_offset,
                handler_length: handler_end.saturating_sub(handler_offset),
                class_or_filter: labels.class_or_filter,
            });
        }

        let body = MethodBodyWriter::new(&bytes)
            .max_stack(self.max_stack)
            .local_signature(Some(locals_token))
            .init_locals(true)
            .force_fat()
            .exception_handlers(&clauses)
            .build()?;

        tracing::trace!(
            appended = self.tail_nodes.len(),
            clauses = clauses.len(),
            "encoded rewritten body"
        );

        Ok(RewrittenMethod {
            body,
            offset_map,
            locals_token,
            max_stack: self.max_stack,
            layout_passes: layout.passes(),
        })
    }
}

fn store_local(slot: u16) -> Instruction<LabelId> {
    match slot {
        0..=3 => Instruction::new(OpCode(OpCode::STLOC_0.0 + slot), Operand::None),
        4..=255 => Instruction::new(OpCode::STLOC_S, Operand::UInt8(slot as u8)),
        _ => Instruction::new(OpCode::STLOC, Operand::UInt16(slot)),
    }
}

fn load_local(slot: u16) -> Instruction<LabelId> {
    match slot {
        0..=3 => Instruction::new(OpCode(OpCode::LDLOC_0.0 + slot), Operand::None),
        4..=255 => Instruction::new(OpCode::LDLOC_S, Operand::UInt8(slot as u8)),
        _ => Instruction::new(OpCode::LDLOC, Operand::UInt16(slot)),
    }
}
