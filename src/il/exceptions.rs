//! Exception handler clauses of CIL method bodies.
//!
//! This module provides the clause representation and the flag set shared by the body
//! parser, the rewriter (which relocates existing clauses and appends synthesized ones) and
//! the verifier.

use bitflags::bitflags;

use crate::metadata::token::Token;

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause.
        ///
        /// The class token field contains the metadata token of the exception type
        /// that this handler catches.
        const EXCEPTION = 0x0000;

        /// An exception filter and handler clause.
        ///
        /// Filters run user code during the first pass of exception dispatch. The rewriter
        /// declines methods that contain one.
        const FILTER = 0x0001;

        /// A finally clause.
        const FINALLY = 0x0002;

        /// A fault clause (finally that executes only on exception).
        const FAULT = 0x0004;
    }
}

/// Exception handler defining a protected region and its handler.
///
/// # Layout in IL
///
/// ```text
/// try {
///     // try_offset -> try_offset + try_length
/// }
/// catch (ExceptionType) {
///     // handler_offset -> handler_offset + handler_length
/// }
/// ```
///
/// The last field of a clause is shared: for typed clauses it is the caught type's token,
/// for filter clauses the offset of the filter block, otherwise zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Flags describing the type of exception handler (catch, filter, finally, fault).
    pub flags: ExceptionHandlerFlags,
    /// Offset in bytes of try block from start of method body.
    pub try_offset: u32,
    /// Length in bytes of the try block.
    pub try_length: u32,
    /// Location of the handler for this try block.
    pub handler_offset: u32,
    /// Size of the handler code in bytes.
    pub handler_length: u32,
    /// Class token for typed clauses, filter offset for filter clauses.
    pub class_or_filter: u32,
}

impl ExceptionHandler {
    /// Build a `finally` clause.
    #[must_use]
    pub fn finally(try_offset: u32, try_length: u32, handler_offset: u32, handler_length: u32) -> Self {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            class_or_filter: 0,
        }
    }

    /// Build a typed `catch` clause.
    #[must_use]
    pub fn catch(
        try_offset: u32,
        try_length: u32,
        handler_offset: u32,
        handler_length: u32,
        class: Token,
    ) -> Self {
        ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset,
            try_length,
            handler_offset,
            handler_length,
            class_or_filter: class.value(),
        }
    }

    /// Returns `true` for filter clauses.
    #[must_use]
    pub fn is_filter(&self) -> bool {
        self.flags.contains(ExceptionHandlerFlags::FILTER)
    }

    /// Returns `true` for `finally` and `fault` clauses, whose handlers end in `endfinally`.
    #[must_use]
    pub fn is_finally_like(&self) -> bool {
        self.flags
            .intersects(ExceptionHandlerFlags::FINALLY | ExceptionHandlerFlags::FAULT)
    }

    /// Caught type for typed clauses.
    #[must_use]
    pub fn class_token(&self) -> Option<Token> {
        if self.flags == ExceptionHandlerFlags::EXCEPTION {
            Some(Token::new(self.class_or_filter))
        } else {
            None
        }
    }

    /// Start of the filter block for filter clauses.
    #[must_use]
    pub fn filter_offset(&self) -> Option<u32> {
        self.is_filter().then_some(self.class_or_filter)
    }

    /// End offset (exclusive) of the protected region.
    #[must_use]
    pub fn try_end(&self) -> u32 {
        self.try_offset.saturating_add(self.try_length)
    }

    /// End offset (exclusive) of the handler.
    #[must_use]
    pub fn handler_end(&self) -> u32 {
        self.handler_offset.saturating_add(self.handler_length)
    }

    /// Returns `true` if `offset` lies inside the protected region.
    #[must_use]
    pub fn try_contains(&self, offset: u32) -> bool {
        offset >= self.try_offset && offset < self.try_end()
    }

    /// Returns `true` if `offset` lies inside the handler (or the filter block).
    #[must_use]
    pub fn handler_contains(&self, offset: u32) -> bool {
        let in_handler = offset >= self.handler_offset && offset < self.handler_end();
        let in_filter = self
            .filter_offset()
            .is_some_and(|start| offset >= start && offset < self.handler_offset);
        in_handler || in_filter
    }

    /// Returns `true` if the clause fits the 12-byte small section encoding.
    #[must_use]
    pub fn fits_small_format(&self) -> bool {
        self.try_offset <= 0xFFFF
            && self.try_length <= 0xFF
            && self.handler_offset <= 0xFFFF
            && self.handler_length <= 0xFF
    }
}
