//! Parsing and encoding of CIL method bodies.
//!
//! A method body is a tiny or fat header, the IL code, and for fat headers optional extra
//! data sections holding exception-handler tables (ECMA-335 II.25.4). The runtime hands the
//! profiler the complete body and expects a complete body back, so this module provides both
//! directions.
//!
//! # Examples
//!
//! ```rust
//! use dotweave::il::{MethodBody, MethodBodyWriter};
//!
//! // Tiny header, 4 bytes of code: ldarg.0 ldarg.1 add ret
//! let data = [0x12, 0x02, 0x03, 0x58, 0x2A];
//! let body = MethodBody::from(&data)?;
//! assert!(!body.is_fat);
//! assert_eq!(body.code(&data)?, &[0x02, 0x03, 0x58, 0x2A]);
//!
//! let fat = MethodBodyWriter::new(body.code(&data)?)
//!     .max_stack(2)
//!     .force_fat()
//!     .build()?;
//! assert_eq!(fat.len(), 12 + 4);
//! # Ok::<(), dotweave::Error>(())
//! ```

use bitflags::bitflags;

use crate::{
    il::exceptions::{ExceptionHandler, ExceptionHandlerFlags},
    metadata::token::Token,
    utils::io::{push_le, read_le, read_le_at},
    Error::OutOfBounds,
    Result,
};

bitflags! {
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    /// Flags that a method body can have
    pub struct MethodBodyFlags: u16 {
        /// Tiny method header format
        const TINY_FORMAT = 0x2;
        /// Fat method header format
        const FAT_FORMAT = 0x3;
        /// Flag of the fat method header, showing that there are more data sections appended to the header
        const MORE_SECTS = 0x8;
        /// Flag to indicate that this method should call the default constructor on all local variables
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    #[derive(PartialEq, Eq, Clone, Copy, Debug)]
    /// Flags that a method body section can have
    pub struct SectionFlags: u8 {
        /// Indicates that this section contains exception handling data
        const EHTABLE = 0x1;
        /// Reserved, shall be 0
        const OPT_ILTABLE = 0x2;
        /// Indicates that the data section format is fat
        const FAT_FORMAT = 0x40;
        /// Indicates that the data section is followed by another one
        const MORE_SECTS = 0x80;
    }
}

const FAT_HEADER_DWORDS: u16 = 3;
const TINY_MAX_CODE: usize = 0x3F;
const TINY_MAX_STACK: u16 = 8;
const SMALL_CLAUSE_SIZE: usize = 12;
const FAT_CLAUSE_SIZE: usize = 24;

/// Describes one method that has been compiled to CIL bytecode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Size of the method (length of all instructions, not counting the header) in bytes
    pub size_code: usize,
    /// Size of the method header in bytes
    pub size_header: usize,
    /// `MetaData` token for a signature describing the layout of the local variables for the method. 0 == no local variables
    pub local_var_sig_token: u32,
    /// Maximum number of items on the operand stack
    pub max_stack: u16,
    /// Flag, indicating the type of the method header
    pub is_fat: bool,
    /// Flag, indicating to call default constructor on all local variables
    pub is_init_local: bool,
    /// A list of exception handlers this method has
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Create a `MethodBody` object from a sequence of bytes.
    ///
    /// # Arguments
    /// * `data` - The complete body, starting at the header
    ///
    /// # Errors
    /// Returns an error if the data is empty, out of bounds, or malformed.
    pub fn from(data: &[u8]) -> Result<MethodBody> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_00000011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(OutOfBounds);
                }

                Ok(MethodBody {
                    size_code,
                    size_header: 1,
                    local_var_sig_token: 0,
                    max_stack: TINY_MAX_STACK,
                    is_fat: false,
                    is_init_local: false,
                    exception_handlers: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < 12 {
                    return Err(OutOfBounds);
                }

                let first_duo = read_le::<u16>(data)?;

                let size_header = ((first_duo >> 12) * 4) as usize;
                if size_header < 12 {
                    return Err(malformed_error!("Fat header size {} is too small", size_header));
                }

                let size_code = read_le::<u32>(&data[4..])? as usize;
                if data.len() < size_code + size_header {
                    return Err(OutOfBounds);
                }

                let local_var_sig_token = read_le::<u32>(&data[8..])?;
                let flags_header =
                    MethodBodyFlags::from_bits_truncate(first_duo & 0b_0000111111111111_u16);
                let max_stack = read_le::<u16>(&data[2..])?;

                let mut exception_handlers = Vec::new();
                if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    let cursor = (size_header + size_code + 3) & !3;
                    exception_handlers = parse_sections(data, cursor)?;
                }

                Ok(MethodBody {
                    size_code,
                    size_header,
                    local_var_sig_token,
                    max_stack,
                    is_fat: true,
                    is_init_local: flags_header.contains(MethodBodyFlags::INIT_LOCALS),
                    exception_handlers,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    /// Get the size of header and code, excluding extra sections
    #[must_use]
    pub fn size(&self) -> usize {
        self.size_code + self.size_header
    }

    /// Slice the IL code out of the complete body bytes this header was parsed from.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the header claims.
    pub fn code<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.size_header..self.size()).ok_or(OutOfBounds)
    }

    /// Returns `true` if the method has exception handlers.
    #[must_use]
    pub fn has_exception_handlers(&self) -> bool {
        !self.exception_handlers.is_empty()
    }

    /// Local variable signature token, `None` when the method has no locals.
    #[must_use]
    pub fn local_signature(&self) -> Option<Token> {
        (self.local_var_sig_token != 0).then(|| Token::new(self.local_var_sig_token))
    }
}

/// Parse the chain of extra data sections that follows the code (II.25.4.5).
fn parse_sections(data: &[u8], mut cursor: usize) -> Result<Vec<ExceptionHandler>> {
    let mut exception_handlers = Vec::new();

    loop {
        if data.len() < cursor + 4 {
            return Err(OutOfBounds);
        }

        let section_flags = SectionFlags::from_bits_truncate(read_le::<u8>(&data[cursor..])?);
        let is_fat = section_flags.contains(SectionFlags::FAT_FORMAT);
        let section_size = if is_fat {
            (read_le::<u32>(&data[cursor..])? >> 8) as usize
        } else {
            usize::from(read_le::<u8>(&data[cursor + 1..])?)
        };

        if section_size < 4 || data.len() < cursor + section_size {
            return Err(malformed_error!(
                "Invalid method data section size {} at {}",
                section_size,
                cursor
            ));
        }

        if section_flags.contains(SectionFlags::EHTABLE) {
            let mut clause_cursor = cursor + 4;
            if is_fat {
                for _ in 0..(section_size - 4) / FAT_CLAUSE_SIZE {
                    #[allow(clippy::cast_possible_truncation)]
                    let flags = ExceptionHandlerFlags::from_bits_truncate(
                        read_le_at::<u32>(data, &mut clause_cursor)? as u16,
                    );
                    exception_handlers.push(ExceptionHandler {
                        flags,
                        try_offset: read_le_at::<u32>(data, &mut clause_cursor)?,
                        try_length: read_le_at::<u32>(data, &mut clause_cursor)?,
                        handler_offset: read_le_at::<u32>(data, &mut clause_cursor)?,
                        handler_length: read_le_at::<u32>(data, &mut clause_cursor)?,
                        class_or_filter: read_le_at::<u32>(data, &mut clause_cursor)?,
                    });
                }
            } else {
                for _ in 0..(section_size - 4) / SMALL_CLAUSE_SIZE {
                    exception_handlers.push(ExceptionHandler {
                        flags: ExceptionHandlerFlags::from_bits_truncate(read_le_at::<u16>(
                            data,
                            &mut clause_cursor,
                        )?),
                        try_offset: u32::from(read_le_at::<u16>(data, &mut clause_cursor)?),
                        try_length: u32::from(read_le_at::<u8>(data, &mut clause_cursor)?),
                        handler_offset: u32::from(read_le_at::<u16>(data, &mut clause_cursor)?),
                        handler_length: u32::from(read_le_at::<u8>(data, &mut clause_cursor)?),
                        class_or_filter: read_le_at::<u32>(data, &mut clause_cursor)?,
                    });
                }
            }
        }

        if !section_flags.contains(SectionFlags::MORE_SECTS) {
            break;
        }
        cursor = (cursor + section_size + 3) & !3;
    }

    Ok(exception_handlers)
}

/// Builder producing complete method body bytes (header, code, exception sections).
///
/// Chooses the tiny header whenever the body qualifies, unless [`MethodBodyWriter::force_fat`]
/// was requested. Exception clauses are written in the small section format when every clause
/// and the section size fit, otherwise in the fat format.
pub struct MethodBodyWriter<'a> {
    code: &'a [u8],
    max_stack: u16,
    local_sig: Option<Token>,
    init_locals: bool,
    force_fat: bool,
    clauses: &'a [ExceptionHandler],
}

impl<'a> MethodBodyWriter<'a> {
    /// Start a body around the given IL code.
    #[must_use]
    pub fn new(code: &'a [u8]) -> Self {
        MethodBodyWriter {
            code,
            max_stack: TINY_MAX_STACK,
            local_sig: None,
            init_locals: false,
            force_fat: false,
            clauses: &[],
        }
    }

    /// Maximum evaluation stack depth.
    #[must_use]
    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    /// `StandAloneSig` token describing the locals.
    #[must_use]
    pub fn local_signature(mut self, token: Option<Token>) -> Self {
        self.local_sig = token.filter(|token| !token.is_null());
        self
    }

    /// Zero-initialize locals on entry.
    #[must_use]
    pub fn init_locals(mut self, init_locals: bool) -> Self {
        self.init_locals = init_locals;
        self
    }

    /// Always emit a fat header.
    #[must_use]
    pub fn force_fat(mut self) -> Self {
        self.force_fat = true;
        self
    }

    /// Exception clauses, innermost first.
    #[must_use]
    pub fn exception_handlers(mut self, clauses: &'a [ExceptionHandler]) -> Self {
        self.clauses = clauses;
        self
    }

    /// Encode the body.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the code or the clause table exceeds the
    /// format's limits.
    pub fn build(self) -> Result<Vec<u8>> {
        let tiny = !self.force_fat
            && self.code.len() <= TINY_MAX_CODE
            && self.max_stack <= TINY_MAX_STACK
            && self.local_sig.is_none()
            && !self.init_locals
            && self.clauses.is_empty();

        let mut out = Vec::with_capacity(12 + self.code.len() + 4 + self.clauses.len() * 24);
        if tiny {
            #[allow(clippy::cast_possible_truncation)]
            out.push(((self.code.len() as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
            out.extend_from_slice(self.code);
            return Ok(out);
        }

        let code_size = u32::try_from(self.code.len())
            .map_err(|_| malformed_error!("Code size {} exceeds u32", self.code.len()))?;

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        if !self.clauses.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }

        push_le(&mut out, flags.bits() | (FAT_HEADER_DWORDS << 12));
        push_le(&mut out, self.max_stack);
        push_le(&mut out, code_size);
        push_le(&mut out, self.local_sig.map_or(0, |token| token.value()));
        out.extend_from_slice(self.code);

        if !self.clauses.is_empty() {
            while out.len() % 4 != 0 {
                out.push(0);
            }
            encode_eh_section(&mut out, self.clauses)?;
        }

        Ok(out)
    }
}

fn encode_eh_section(out: &mut Vec<u8>, clauses: &[ExceptionHandler]) -> Result<()> {
    let small_size = 4 + clauses.len() * SMALL_CLAUSE_SIZE;
    let small = small_size <= 0xFF && clauses.iter().all(ExceptionHandler::fits_small_format);

    if small {
        out.push(SectionFlags::EHTABLE.bits());
        #[allow(clippy::cast_possible_truncation)]
        out.push(small_size as u8);
        push_le(out, 0_u16);
        for clause in clauses {
            #[allow(clippy::cast_possible_truncation)]
            {
                push_le(out, clause.flags.bits());
                push_le(out, clause.try_offset as u16);
                push_le(out, clause.try_length as u8);
                push_le(out, clause.handler_offset as u16);
                push_le(out, clause.handler_length as u8);
            }
            push_le(out, clause.class_or_filter);
        }
        return Ok(());
    }

    let fat_size = 4 + clauses.len() * FAT_CLAUSE_SIZE;
    if fat_size > 0x00FF_FFFF {
        return Err(malformed_error!("Too many exception clauses - {}", clauses.len()));
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = u32::from((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits())
        | ((fat_size as u32) << 8);
    push_le(out, header);
    for clause in clauses {
        push_le(out, u32::from(clause.flags.bits()));
        push_le(out, clause.try_offset);
        push_le(out, clause.try_length);
        push_le(out, clause.handler_offset);
        push_le(out, clause.handler_length);
        push_le(out, clause.class_or_filter);
    }

    Ok(())
}
