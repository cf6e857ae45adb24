//! Structural verification of method bodies.
//!
//! Runs after every rewrite, on the encoded bytes, so it checks what the runtime will
//! actually see. Three layers of checks are performed:
//!
//! - every branch and `switch` target is an instruction boundary
//! - every exception range starts and ends on an instruction boundary, ranges nest properly,
//!   and inner clauses precede the clauses enclosing them
//! - optionally, an evaluation stack simulation that follows branches, exception handler
//!   entries and `leave` semantics, and requires a consistent depth wherever control merges
//!
//! The stack simulation needs the arity of every call site, which only the module metadata
//! knows; it runs when a [`CallSiteResolver`] is supplied.

use std::collections::{BTreeMap, HashMap};

use crate::{
    il::{
        body::MethodBody,
        decoder::decode_stream,
        exceptions::ExceptionHandler,
        instruction::Instruction,
        opcodes::{FlowType, OpCode, StackEffect},
    },
    metadata::{signature::MethodSignature, token::Token},
    utils::parser::Parser,
    Error, Result,
};

/// Resolves the signature behind a call-site token (`MethodDef`, `MemberRef`, `MethodSpec`
/// or, for `calli`, `StandAloneSig`).
pub trait CallSiteResolver {
    /// Signature of the called method.
    ///
    /// # Errors
    /// Returns an error if the token cannot be resolved.
    fn signature(&self, token: Token) -> Result<MethodSignature>;
}

/// Inputs of [`verify`] that are not part of the body itself.
#[derive(Clone, Copy, Default)]
pub struct VerifyOptions<'a> {
    /// Whether the method returns a value (`ret` pops one slot)
    pub returns_value: bool,
    /// Call-site resolver enabling the stack simulation
    pub resolver: Option<&'a dyn CallSiteResolver>,
}

/// Result of the stack simulation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackReport {
    /// Evaluation stack depth before each reachable instruction, keyed by offset
    pub depths: BTreeMap<u32, u16>,
    /// Highest depth reached
    pub max_depth: u16,
}

fn reject(offset: u32, message: impl Into<String>) -> Error {
    Error::VerifierRejection {
        offset,
        message: message.into(),
    }
}

/// Verify a complete encoded method body.
///
/// Returns the stack report when the simulation ran.
///
/// # Errors
/// Returns [`Error::VerifierRejection`] describing the first violated check.
pub fn verify(body: &[u8], options: &VerifyOptions) -> Result<Option<StackReport>> {
    let header = MethodBody::from(body).map_err(|error| reject(0, error.to_string()))?;
    let code = header
        .code(body)
        .map_err(|error| reject(0, error.to_string()))?;
    let instructions =
        decode_stream(&mut Parser::new(code)).map_err(|error| reject(0, error.to_string()))?;

    let code_size = code.len() as u32;
    check_structure(&instructions, code_size, &header.exception_handlers)?;

    let Some(resolver) = options.resolver else {
        return Ok(None);
    };

    let report = simulate_stack(
        &instructions,
        &header.exception_handlers,
        options.returns_value,
        resolver,
    )?;
    if report.max_depth > header.max_stack {
        return Err(reject(
            0,
            format!(
                "Stack depth {} exceeds declared max_stack {}",
                report.max_depth, header.max_stack
            ),
        ));
    }

    Ok(Some(report))
}

/// Check branch targets and exception ranges against instruction boundaries.
///
/// # Errors
/// Returns [`Error::VerifierRejection`] describing the first violation.
pub fn check_structure(
    instructions: &[Instruction],
    code_size: u32,
    handlers: &[ExceptionHandler],
) -> Result<()> {
    let Some(last) = instructions.last() else {
        return Err(reject(0, "Empty code"));
    };
    if last.info().flow.falls_through() {
        return Err(reject(last.offset, "Control falls off the end of the code"));
    }

    let mut boundaries: Vec<u32> = instructions.iter().map(|i| i.offset).collect();
    boundaries.push(code_size);
    let is_boundary = |offset: u32| boundaries.binary_search(&offset).is_ok();

    for instruction in instructions {
        for target in instruction.operand.targets() {
            if *target >= code_size || !is_boundary(*target) {
                return Err(reject(
                    instruction.offset,
                    format!("Branch target IL_{target:04x} is not an instruction boundary"),
                ));
            }
        }
    }

    let mut blocks = Vec::with_capacity(handlers.len() * 2);
    for (index, clause) in handlers.iter().enumerate() {
        let handler_start = clause.filter_offset().unwrap_or(clause.handler_offset);
        let edges = [
            clause.try_offset,
            clause.try_end(),
            handler_start,
            clause.handler_offset,
            clause.handler_end(),
        ];
        if let Some(edge) = edges.iter().find(|edge| !is_boundary(**edge)) {
            return Err(reject(
                *edge,
                format!("Exception clause {index} edge is not an instruction boundary"),
            ));
        }
        if clause.try_length == 0 || clause.handler_length == 0 {
            return Err(reject(clause.try_offset, format!("Exception clause {index} is empty")));
        }

        let protected = (clause.try_offset, clause.try_end());
        let handler = (handler_start, clause.handler_end());
        if overlaps(protected, handler) {
            return Err(reject(
                clause.handler_offset,
                format!("Exception clause {index} handler overlaps its protected range"),
            ));
        }
        blocks.push((index, protected));
        blocks.push((index, handler));
    }

    for (position, (first_clause, first)) in blocks.iter().enumerate() {
        for (second_clause, second) in &blocks[position + 1..] {
            if !overlaps(*first, *second) || contains(*first, *second) || contains(*second, *first)
            {
                // Inner clauses must come first in the table
                if first_clause < second_clause && strictly_contains(*first, *second) {
                    return Err(reject(
                        second.0,
                        format!(
                            "Exception clause {first_clause} encloses clause {second_clause} but is listed first"
                        ),
                    ));
                }
                continue;
            }

            return Err(reject(
                second.0,
                format!(
                    "Exception ranges of clauses {first_clause} and {second_clause} are not properly nested"
                ),
            ));
        }
    }

    Ok(())
}

fn overlaps(a: (u32, u32), b: (u32, u32)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn contains(outer: (u32, u32), inner: (u32, u32)) -> bool {
    outer.0 <= inner.0 && inner.1 <= outer.1
}

fn strictly_contains(outer: (u32, u32), inner: (u32, u32)) -> bool {
    contains(outer, inner) && outer != inner
}

fn stack_effect(
    instruction: &Instruction,
    returns_value: bool,
    resolver: &dyn CallSiteResolver,
) -> Result<(u16, u16)> {
    let info = instruction.info();
    if let (StackEffect::Fixed(pops), StackEffect::Fixed(pushes)) = (info.pops, info.pushes) {
        return Ok((u16::from(pops), u16::from(pushes)));
    }

    if instruction.opcode == OpCode::RET {
        return Ok((u16::from(returns_value), 0));
    }

    let token = instruction
        .token()
        .ok_or_else(|| reject(instruction.offset, "Call without a token operand"))?;
    let signature = resolver.signature(token).map_err(|error| {
        reject(
            instruction.offset,
            format!("Cannot resolve call site {token}: {error}"),
        )
    })?;
    let returns = u16::from(!signature.ret.is_void());
    let arity = signature.arity() as u16;

    Ok(match instruction.opcode {
        OpCode::NEWOBJ => (arity, 1),
        OpCode::CALLI => (signature.stack_pops() as u16 + 1, returns),
        _ => (signature.stack_pops() as u16, returns),
    })
}

struct Walk<'a> {
    instructions: &'a [Instruction],
    depths: Vec<Option<u16>>,
    worklist: Vec<usize>,
}

impl Walk<'_> {
    fn enter(&mut self, index: usize, depth: u16, from: u32) -> Result<()> {
        match self.depths[index] {
            Some(existing) if existing != depth => Err(reject(
                from,
                format!(
                    "Inconsistent stack depth at IL_{:04x}: {} vs {}",
                    self.instructions[index].offset, existing, depth
                ),
            )),
            Some(_) => Ok(()),
            None => {
                self.depths[index] = Some(depth);
                self.worklist.push(index);
                Ok(())
            }
        }
    }
}

/// Simulate evaluation stack depths over all reachable instructions.
///
/// # Errors
/// Returns [`Error::VerifierRejection`] on underflow, inconsistent merge depths, a non-empty
/// stack at a protected region entry or at `ret`, or an unresolvable call site.
pub fn simulate_stack(
    instructions: &[Instruction],
    handlers: &[ExceptionHandler],
    returns_value: bool,
    resolver: &dyn CallSiteResolver,
) -> Result<StackReport> {
    let index_of: HashMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| (instruction.offset, index))
        .collect();
    let lookup = |offset: u32, from: u32| {
        index_of
            .get(&offset)
            .copied()
            .ok_or_else(|| reject(from, format!("IL_{offset:04x} is not an instruction")))
    };

    let mut walk = Walk {
        instructions,
        depths: vec![None; instructions.len()],
        worklist: Vec::new(),
    };

    if !instructions.is_empty() {
        walk.enter(0, 0, 0)?;
    }
    for clause in handlers {
        let depth = u16::from(!clause.is_finally_like());
        walk.enter(
            lookup(clause.handler_offset, clause.handler_offset)?,
            depth,
            clause.handler_offset,
        )?;
        if let Some(filter) = clause.filter_offset() {
            walk.enter(lookup(filter, filter)?, 1, filter)?;
        }
    }

    let mut max_depth = 0u16;
    while let Some(index) = walk.worklist.pop() {
        let instruction = &instructions[index];
        let offset = instruction.offset;
        let depth = walk.depths[index].unwrap_or(0);

        if depth != 0 && handlers.iter().any(|clause| clause.try_offset == offset) {
            return Err(reject(offset, "Protected region entered with a non-empty stack"));
        }

        let (pops, pushes) = stack_effect(instruction, returns_value, resolver)?;
        if depth < pops {
            return Err(reject(
                offset,
                format!("Stack underflow: {} needs {pops}, has {depth}", instruction.opcode),
            ));
        }
        let after = depth - pops + pushes;
        max_depth = max_depth.max(after).max(depth);

        let flow = instruction.info().flow;
        if flow == FlowType::Return && after != 0 {
            return Err(reject(offset, format!("ret with {after} extra stack slots")));
        }

        let next = instruction.next_offset();
        match flow {
            FlowType::Sequential | FlowType::Call | FlowType::Meta => {
                walk.enter(lookup(next, offset)?, after, offset)?;
            }
            FlowType::ConditionalBranch | FlowType::Switch => {
                walk.enter(lookup(next, offset)?, after, offset)?;
                for target in instruction.operand.targets() {
                    walk.enter(lookup(*target, offset)?, after, offset)?;
                }
            }
            FlowType::UnconditionalBranch => {
                for target in instruction.operand.targets() {
                    walk.enter(lookup(*target, offset)?, after, offset)?;
                }
            }
            FlowType::Leave => {
                for target in instruction.operand.targets() {
                    walk.enter(lookup(*target, offset)?, 0, offset)?;
                }
            }
            FlowType::Return
            | FlowType::Throw
            | FlowType::EndFinally
            | FlowType::EndFilter
            | FlowType::Jump => {}
        }
    }

    let depths = instructions
        .iter()
        .zip(walk.depths)
        .filter_map(|(instruction, depth)| depth.map(|depth| (instruction.offset, depth)))
        .collect();

    Ok(StackReport { depths, max_depth })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        il::{body::MethodBodyWriter, exceptions::ExceptionHandler},
        metadata::signature::TypeSig,
    };

    struct Calls;

    impl CallSiteResolver for Calls {
        fn signature(&self, token: Token) -> Result<MethodSignature> {
            match token.value() {
                // static int64 Enter(int32)
                0x0A00_0001 => Ok(MethodSignature::static_method(TypeSig::I8, vec![TypeSig::I4])),
                // static void Exit(int32, object, int64)
                0x0A00_0002 => Ok(MethodSignature::static_method(
                    TypeSig::Void,
                    vec![TypeSig::I4, TypeSig::Object, TypeSig::I8],
                )),
                _ => Err(Error::TokenNotFound(token)),
            }
        }
    }

    fn decode(code: &[u8]) -> Vec<Instruction> {
        decode_stream(&mut Parser::new(code)).unwrap()
    }

    #[test]
    fn accepts_simple_body() {
        // ldarg.0 ldarg.1 add ret
        let body = MethodBodyWriter::new(&[0x02, 0x03, 0x58, 0x2A])
            .max_stack(2)
            .build()
            .unwrap();
        let options = VerifyOptions {
            returns_value: true,
            resolver: Some(&Calls),
        };

        let report = verify(&body, &options).unwrap().unwrap();
        assert_eq!(report.max_depth, 2);
        assert_eq!(report.depths.get(&3), Some(&1));
    }

    #[test]
    fn rejects_branch_into_operand() {
        // br.s +1 lands inside ldc.i4.s
        let code = [0x2B, 0x01, 0x1F, 0x05, 0x2A];
        let error = check_structure(&decode(&code), 5, &[]).unwrap_err();
        assert!(matches!(error, Error::VerifierRejection { offset: 0, .. }));
    }

    #[test]
    fn rejects_falling_off_the_end() {
        let code = [0x00, 0x00];
        assert!(check_structure(&decode(&code), 2, &[]).is_err());
    }

    #[test]
    fn rejects_misordered_clauses() {
        // Inner try/finally nested in the protected range of an outer try/finally
        let code = [
            0x00, // 0: nop
            0xDE, 0x03, // 1: leave.s IL_0006
            0xDC, // 3: endfinally
            0xDE, 0x01, // 4: leave.s IL_0007
            0xDC, // 6: endfinally
            0x2A, // 7: ret
        ];
        let instructions = decode(&code);
        let inner = ExceptionHandler::finally(0, 3, 3, 1);
        let outer = ExceptionHandler::finally(0, 6, 6, 1);

        assert!(check_structure(&instructions, 8, &[inner, outer]).is_ok());
        let error = check_structure(&instructions, 8, &[outer, inner]).unwrap_err();
        assert!(error.to_string().contains("listed first"));
    }

    #[test]
    fn rejects_overlapping_clauses() {
        let code = [0x00, 0x00, 0x00, 0x00, 0xDC, 0x2A];
        let first = ExceptionHandler::finally(0, 2, 4, 1);
        let second = ExceptionHandler::finally(1, 2, 4, 1);
        let error = check_structure(&decode(&code), 6, &[first, second]).unwrap_err();
        assert!(error.to_string().contains("not properly nested"));
    }

    #[test]
    fn stack_merge_mismatch() {
        // ldc.i4.1; brtrue.s +1; ldc.i4.0; nop; ret -> depth 0 or 1 at the nop
        let code = [0x17, 0x2D, 0x01, 0x16, 0x00, 0x2A];
        let error = simulate_stack(&decode(&code), &[], false, &Calls).unwrap_err();
        assert!(error.to_string().contains("Inconsistent stack depth"));
    }

    #[test]
    fn stack_follows_calls_and_leave() {
        // ldc.i4 1; call Enter; pop;
        // try { ldc.i4.5; pop; leave.s END } finally { endfinally }
        // END: ret
        let mut code = vec![0x20, 0x01, 0x00, 0x00, 0x00];
        code.extend_from_slice(&[0x28, 0x01, 0x00, 0x00, 0x0A]);
        code.extend_from_slice(&[0x26, 0x1B, 0x26, 0xDE, 0x01, 0xDC, 0x2A]);
        let finally = ExceptionHandler::finally(11, 4, 15, 1);

        let instructions = decode(&code);
        check_structure(&instructions, code.len() as u32, &[finally]).unwrap();
        let report = simulate_stack(&instructions, &[finally], false, &Calls).unwrap();
        assert_eq!(report.depths.get(&16), Some(&0));
        assert_eq!(report.depths.get(&15), Some(&0));
        assert_eq!(report.max_depth, 1);
    }

    #[test]
    fn rejects_unresolvable_call() {
        let code = [0x28, 0x09, 0x00, 0x00, 0x0A, 0x2A];
        let error = simulate_stack(&decode(&code), &[], false, &Calls).unwrap_err();
        assert!(matches!(error, Error::VerifierRejection { .. }));
    }
}
