//! A small CIL interpreter for checking that rewritten bodies behave like the originals.
//!
//! Covers the integer subset used by the test programs, calls through a [`CallHost`],
//! `switch`, and exception handling with catch and finally clauses. Exceptions are dispatched
//! in a single pass (inner clauses first), which is indistinguishable from the runtime's two
//! passes for the programs under test.

use std::collections::HashMap;

use dotweave::{
    il::{
        decoder::decode_stream, ExceptionHandler, Instruction, MethodBody, OpCode, Operand,
    },
    Parser, Token,
};

/// A value on the evaluation stack or in a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Null,
    Object(u32),
}

impl Value {
    fn int(self) -> i64 {
        match self {
            Value::Int(value) => value,
            Value::Null => 0,
            Value::Object(id) => i64::from(id),
        }
    }

    fn truthy(self) -> bool {
        match self {
            Value::Int(value) => value != 0,
            Value::Null => false,
            Value::Object(_) => true,
        }
    }
}

/// Outcome of a call made by interpreted code.
pub enum CallResult {
    Return(Option<Value>),
    Throw(Value),
}

/// Implements every method the interpreted code calls.
pub trait CallHost {
    /// Number of arguments the method behind `token` pops.
    fn arity(&self, token: Token) -> usize;

    /// Invoke the method.
    fn call(&mut self, token: Token, args: Vec<Value>) -> CallResult;
}

/// How a method invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Returned(Option<Value>),
    Threw(Value),
}

enum Flow {
    Return(Option<Value>),
    EndFinally,
}

struct Frame<'a> {
    code: &'a [Instruction],
    index: HashMap<u32, usize>,
    handlers: &'a [ExceptionHandler],
    args: Vec<Value>,
    locals: HashMap<u16, Value>,
    caught: Vec<Value>,
    steps: usize,
}

const STEP_LIMIT: usize = 100_000;

/// Run a complete method body with the given arguments.
pub fn run(body: &[u8], args: &[Value], host: &mut dyn CallHost) -> Completion {
    let header = MethodBody::from(body).unwrap();
    let code = header.code(body).unwrap();
    let instructions = decode_stream(&mut Parser::new(code)).unwrap();

    let mut frame = Frame {
        index: instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| (instruction.offset, index))
            .collect(),
        code: &instructions,
        handlers: &header.exception_handlers,
        args: args.to_vec(),
        locals: HashMap::new(),
        caught: Vec::new(),
        steps: 0,
    };

    match execute(&mut frame, 0, host) {
        Ok(Flow::Return(value)) => Completion::Returned(value),
        Ok(Flow::EndFinally) => panic!("endfinally outside of a finally block"),
        Err(exception) => Completion::Threw(exception),
    }
}

fn execute(frame: &mut Frame, start: u32, host: &mut dyn CallHost) -> Result<Flow, Value> {
    let mut stack: Vec<Value> = Vec::new();
    let mut pc = start;

    loop {
        frame.steps += 1;
        assert!(frame.steps < STEP_LIMIT, "step limit exceeded");

        let position = *frame
            .index
            .get(&pc)
            .unwrap_or_else(|| panic!("no instruction at IL_{pc:04x}"));
        let instruction = &frame.code[position];
        let next = instruction.next_offset();

        match step(frame, instruction, &mut stack, host) {
            Ok(Step::Next) => pc = next,
            Ok(Step::Jump(target)) => pc = target,
            Ok(Step::Leave(target)) => {
                stack.clear();
                run_finally_blocks(frame, pc, target, host)?;
                pc = target;
            }
            Ok(Step::Return(value)) => return Ok(Flow::Return(value)),
            Ok(Step::EndFinally) => return Ok(Flow::EndFinally),
            Err(exception) => {
                stack.clear();
                pc = dispatch(frame, pc, exception, &mut stack, host)?;
            }
        }
    }
}

/// Run the finally blocks a `leave` from `from` to `to` exits, innermost first.
fn run_finally_blocks(
    frame: &mut Frame,
    from: u32,
    to: u32,
    host: &mut dyn CallHost,
) -> Result<(), Value> {
    let handlers: Vec<ExceptionHandler> = frame.handlers.to_vec();
    for clause in handlers {
        if clause.is_finally_like() && clause.try_contains(from) && !clause.try_contains(to) {
            match execute(frame, clause.handler_offset, host)? {
                Flow::EndFinally => {}
                Flow::Return(_) => panic!("ret inside a finally block"),
            }
        }
    }
    Ok(())
}

/// Find the handler for an exception raised at `pc`; returns where execution resumes.
fn dispatch(
    frame: &mut Frame,
    pc: u32,
    exception: Value,
    stack: &mut Vec<Value>,
    host: &mut dyn CallHost,
) -> Result<u32, Value> {
    let handlers: Vec<ExceptionHandler> = frame.handlers.to_vec();
    for clause in handlers {
        if !clause.try_contains(pc) {
            continue;
        }
        if clause.is_finally_like() {
            match execute(frame, clause.handler_offset, host)? {
                Flow::EndFinally => continue,
                Flow::Return(_) => panic!("ret inside a finally block"),
            }
        }
        if clause.is_filter() {
            panic!("filters are not supported by the interpreter");
        }

        // Typed catches catch everything; the test programs only throw objects
        frame.caught.push(exception);
        stack.push(exception);
        return Ok(clause.handler_offset);
    }
    Err(exception)
}

enum Step {
    Next,
    Jump(u32),
    Leave(u32),
    Return(Option<Value>),
    EndFinally,
}

fn target(instruction: &Instruction) -> u32 {
    match instruction.operand {
        Operand::Target(target) => target,
        _ => panic!("{instruction} has no branch target"),
    }
}

fn step(
    frame: &mut Frame,
    instruction: &Instruction,
    stack: &mut Vec<Value>,
    host: &mut dyn CallHost,
) -> Result<Step, Value> {
    fn pop(stack: &mut Vec<Value>) -> Value {
        stack.pop().expect("stack underflow")
    }

    if let Some(value) = instruction.int32_constant() {
        stack.push(Value::Int(i64::from(value)));
        return Ok(Step::Next);
    }
    if let Some(slot) = instruction.loaded_local() {
        stack.push(*frame.locals.get(&slot).unwrap_or(&Value::Null));
        return Ok(Step::Next);
    }
    if let Some(slot) = instruction.stored_local() {
        let value = pop(stack);
        frame.locals.insert(slot, value);
        return Ok(Step::Next);
    }

    let opcode = instruction.opcode.long_form();
    match opcode.0 {
        0x00 => {}
        0x02..=0x05 => stack.push(frame.args[usize::from(opcode.0 - 0x02)]),
        0x0E => match instruction.operand {
            Operand::UInt8(index) => stack.push(frame.args[usize::from(index)]),
            _ => unreachable!(),
        },
        0x14 => stack.push(Value::Null),
        0x21 => match instruction.operand {
            Operand::Int64(value) => stack.push(Value::Int(value)),
            _ => unreachable!(),
        },
        0x25 => {
            let value = pop(stack);
            stack.push(value);
            stack.push(value);
        }
        0x26 => {
            pop(stack);
        }
        0x28 => {
            let token = instruction.token().unwrap();
            let count = host.arity(token);
            let args = stack.split_off(stack.len() - count);
            match host.call(token, args) {
                CallResult::Return(Some(value)) => stack.push(value),
                CallResult::Return(None) => {}
                CallResult::Throw(exception) => return Err(exception),
            }
        }
        0x2A => return Ok(Step::Return(stack.pop())),
        0x38 => return Ok(Step::Jump(target(instruction))),
        0x39 | 0x3A => {
            let value = pop(stack).truthy();
            if value == (opcode == OpCode::BRTRUE) {
                return Ok(Step::Jump(target(instruction)));
            }
        }
        0x3B..=0x44 => {
            let right = pop(stack).int();
            let left = pop(stack).int();
            let taken = match opcode.0 {
                0x3B => left == right,
                0x3C | 0x41 => left >= right,
                0x3D | 0x42 => left > right,
                0x3E | 0x43 => left <= right,
                0x3F | 0x44 => left < right,
                0x40 => left != right,
                _ => unreachable!(),
            };
            if taken {
                return Ok(Step::Jump(target(instruction)));
            }
        }
        0x45 => {
            let selector = pop(stack).int();
            if let Operand::Switch(targets) = &instruction.operand {
                if let Some(target) = usize::try_from(selector).ok().and_then(|i| targets.get(i)) {
                    return Ok(Step::Jump(*target));
                }
            }
        }
        0x58..=0x5A => {
            let right = pop(stack).int();
            let left = pop(stack).int();
            stack.push(Value::Int(match opcode.0 {
                0x58 => left.wrapping_add(right),
                0x59 => left.wrapping_sub(right),
                _ => left.wrapping_mul(right),
            }));
        }
        0x7A => return Err(pop(stack)),
        0xDC => return Ok(Step::EndFinally),
        0xDD => {
            if frame.handlers.iter().any(|c| !c.is_finally_like() && c.handler_contains(instruction.offset)) {
                frame.caught.pop();
            }
            return Ok(Step::Leave(target(instruction)));
        }
        0xFE01 | 0xFE02 | 0xFE04 => {
            let right = pop(stack).int();
            let left = pop(stack).int();
            let result = match opcode.0 {
                0xFE01 => left == right,
                0xFE02 => left > right,
                _ => left < right,
            };
            stack.push(Value::Int(i64::from(result)));
        }
        0xFE1A => return Err(frame.caught.pop().expect("rethrow outside of a catch handler")),
        other => panic!("opcode {other:#x} not supported by the interpreter"),
    }

    Ok(Step::Next)
}
