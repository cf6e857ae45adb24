//! CIL method body processing.
//!
//! Everything needed to take a method body apart, inject instrumentation and put it back
//! together again:
//!
//! - [`body`] - Method header and exception section parsing and writing
//! - [`exceptions`] - Exception handling clauses
//! - [`opcodes`] - The instruction set table
//! - [`instruction`] - Decoded instructions and operands
//! - [`decoder`] - Linear decoding of a code stream
//! - [`code`] - Label based arena used while rewriting
//! - [`encoder`] - Fixed-point branch layout and encoding
//! - [`rewriter`] - Entry/exit helper injection
//! - [`verify`] - Structural and stack-depth verification of rewritten bodies

pub mod body;
pub mod code;
pub mod decoder;
pub mod encoder;
pub mod exceptions;
pub mod instruction;
pub mod opcodes;
pub mod rewriter;
pub mod verify;

pub use body::{MethodBody, MethodBodyWriter};
pub use exceptions::{ExceptionHandler, ExceptionHandlerFlags};
pub use instruction::{Instruction, Operand};
pub use opcodes::OpCode;
pub use rewriter::{
    HelperTokenSource, RewriteOutcome, RewriteRequest, RewrittenMethod, Rewriter,
};
pub use verify::{CallSiteResolver, StackReport, VerifyOptions};
