//! Method and local-variable signature blobs (ECMA-335 II.23.2).
//!
//! The engine needs signatures for three things: deciding whether a method matches a rule
//! (parameter and return type names), building the extended local-variable signature of a
//! rewritten method, and building the `MemberRef` signatures of the injected helper calls.
//! Blobs are decoded into [`TypeSig`] trees and re-encoded byte-exactly.
//!
//! # Examples
//!
//! ```rust
//! use dotweave::metadata::signature::{MethodSignature, TypeSig};
//!
//! // int32 Add(int32, int32)
//! let sig = MethodSignature::parse(&[0x00, 0x02, 0x08, 0x08, 0x08])?;
//! assert_eq!(sig.params.len(), 2);
//! assert_eq!(sig.ret, TypeSig::I4);
//! assert_eq!(sig.encode()?, vec![0x00, 0x02, 0x08, 0x08, 0x08]);
//! # Ok::<(), dotweave::Error>(())
//! ```

use crate::{
    metadata::token::Token,
    utils::{io::write_compressed_uint, parser::Parser},
    Result,
};

/// Element type constants used in signature blobs
#[allow(missing_docs)]
pub mod element {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const PTR: u8 = 0x0F;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1B;
    pub const OBJECT: u8 = 0x1C;
    pub const SZARRAY: u8 = 0x1D;
    pub const MVAR: u8 = 0x1E;
    pub const CMOD_REQD: u8 = 0x1F;
    pub const CMOD_OPT: u8 = 0x20;
    pub const SENTINEL: u8 = 0x41;
    pub const PINNED: u8 = 0x45;
}

/// Calling convention byte of a method signature
#[allow(missing_docs)]
pub mod callconv {
    pub const DEFAULT: u8 = 0x00;
    pub const VARARG: u8 = 0x05;
    pub const GENERIC: u8 = 0x10;
    pub const HAS_THIS: u8 = 0x20;
    pub const EXPLICIT_THIS: u8 = 0x40;
    pub const LOCAL_SIG: u8 = 0x07;
    pub const KIND_MASK: u8 = 0x0F;
}

/// Resolves the display name of a type token for signature pretty-printing.
///
/// Implemented by the runtime's metadata import interface. Names are namespace-qualified,
/// e.g. `System.Collections.Generic.List`1`.
pub trait TypeNameResolver {
    /// Full name of a `TypeDef`, `TypeRef` or `TypeSpec` token.
    ///
    /// # Errors
    /// Returns an error if the token cannot be resolved.
    fn type_name(&self, token: Token) -> Result<String>;
}

/// A decoded type from a signature blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    Object,
    I,
    U,
    TypedByRef,
    /// Reference type defined by a `TypeDefOrRef` token
    Class(Token),
    /// Value type defined by a `TypeDefOrRef` token
    ValueType(Token),
    /// Generic parameter of the enclosing type
    Var(u32),
    /// Generic parameter of the method
    MVar(u32),
    Ptr(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    SzArray(Box<TypeSig>),
    /// General array: element, rank, sizes and raw lower bounds
    Array {
        element: Box<TypeSig>,
        rank: u32,
        sizes: Vec<u32>,
        lower_bounds: Vec<u32>,
    },
    GenericInst {
        value_type: bool,
        generic: Token,
        args: Vec<TypeSig>,
    },
    FnPtr(Box<MethodSignature>),
    /// Custom modifier wrapping the modified type
    Modified {
        required: bool,
        modifier: Token,
        inner: Box<TypeSig>,
    },
    /// `pinned` constraint, only valid in local signatures
    Pinned(Box<TypeSig>),
    /// Vararg sentinel marker inside a parameter list
    Sentinel,
}

impl TypeSig {
    /// Decode one type from the parser position.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] on unknown element types, or
    /// [`crate::Error::OutOfBounds`] on a truncated blob.
    pub fn parse(parser: &mut Parser) -> Result<TypeSig> {
        Self::parse_depth(parser, 0)
    }

    fn parse_depth(parser: &mut Parser, depth: usize) -> Result<TypeSig> {
        const MAX_DEPTH: usize = 64;
        if depth > MAX_DEPTH {
            return Err(malformed_error!("Signature nesting exceeds {}", MAX_DEPTH));
        }

        let next = |parser: &mut Parser| Self::parse_depth(parser, depth + 1).map(Box::new);
        let lead = parser.read_le::<u8>()?;
        Ok(match lead {
            element::VOID => TypeSig::Void,
            element::BOOLEAN => TypeSig::Boolean,
            element::CHAR => TypeSig::Char,
            element::I1 => TypeSig::I1,
            element::U1 => TypeSig::U1,
            element::I2 => TypeSig::I2,
            element::U2 => TypeSig::U2,
            element::I4 => TypeSig::I4,
            element::U4 => TypeSig::U4,
            element::I8 => TypeSig::I8,
            element::U8 => TypeSig::U8,
            element::R4 => TypeSig::R4,
            element::R8 => TypeSig::R8,
            element::STRING => TypeSig::String,
            element::OBJECT => TypeSig::Object,
            element::I => TypeSig::I,
            element::U => TypeSig::U,
            element::TYPEDBYREF => TypeSig::TypedByRef,
            element::CLASS => TypeSig::Class(parser.read_compressed_token()?),
            element::VALUETYPE => TypeSig::ValueType(parser.read_compressed_token()?),
            element::VAR => TypeSig::Var(parser.read_compressed_uint()?),
            element::MVAR => TypeSig::MVar(parser.read_compressed_uint()?),
            element::PTR => TypeSig::Ptr(next(parser)?),
            element::BYREF => TypeSig::ByRef(next(parser)?),
            element::SZARRAY => TypeSig::SzArray(next(parser)?),
            element::PINNED => TypeSig::Pinned(next(parser)?),
            element::ARRAY => {
                let element = next(parser)?;
                let rank = parser.read_compressed_uint()?;
                let num_sizes = parser.read_compressed_uint()?;
                let mut sizes = Vec::new();
                for _ in 0..num_sizes {
                    sizes.push(parser.read_compressed_uint()?);
                }
                let num_bounds = parser.read_compressed_uint()?;
                let mut lower_bounds = Vec::new();
                for _ in 0..num_bounds {
                    lower_bounds.push(parser.read_compressed_uint()?);
                }
                TypeSig::Array {
                    element,
                    rank,
                    sizes,
                    lower_bounds,
                }
            }
            element::GENERICINST => {
                let value_type = match parser.read_le::<u8>()? {
                    element::CLASS => false,
                    element::VALUETYPE => true,
                    other => {
                        return Err(malformed_error!(
                            "Invalid generic instantiation kind - {:#x}",
                            other
                        ))
                    }
                };
                let generic = parser.read_compressed_token()?;
                let count = parser.read_compressed_uint()?;
                let mut args = Vec::new();
                for _ in 0..count {
                    args.push(Self::parse_depth(parser, depth + 1)?);
                }
                TypeSig::GenericInst {
                    value_type,
                    generic,
                    args,
                }
            }
            element::FNPTR => {
                TypeSig::FnPtr(Box::new(MethodSignature::parse_from(parser, depth + 1)?))
            }
            element::CMOD_REQD | element::CMOD_OPT => TypeSig::Modified {
                required: lead == element::CMOD_REQD,
                modifier: parser.read_compressed_token()?,
                inner: next(parser)?,
            },
            element::SENTINEL => TypeSig::Sentinel,
            other => return Err(malformed_error!("Unknown element type - {:#x}", other)),
        })
    }

    /// Append the blob encoding of this type.
    ///
    /// # Errors
    /// Returns an error if a nested value cannot be compressed.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let simple = match self {
            TypeSig::Void => Some(element::VOID),
            TypeSig::Boolean => Some(element::BOOLEAN),
            TypeSig::Char => Some(element::CHAR),
            TypeSig::I1 => Some(element::I1),
            TypeSig::U1 => Some(element::U1),
            TypeSig::I2 => Some(element::I2),
            TypeSig::U2 => Some(element::U2),
            TypeSig::I4 => Some(element::I4),
            TypeSig::U4 => Some(element::U4),
            TypeSig::I8 => Some(element::I8),
            TypeSig::U8 => Some(element::U8),
            TypeSig::R4 => Some(element::R4),
            TypeSig::R8 => Some(element::R8),
            TypeSig::String => Some(element::STRING),
            TypeSig::Object => Some(element::OBJECT),
            TypeSig::I => Some(element::I),
            TypeSig::U => Some(element::U),
            TypeSig::TypedByRef => Some(element::TYPEDBYREF),
            TypeSig::Sentinel => Some(element::SENTINEL),
            _ => None,
        };
        if let Some(byte) = simple {
            out.push(byte);
            return Ok(());
        }

        match self {
            TypeSig::Class(token) => {
                out.push(element::CLASS);
                encode_type_def_or_ref(out, *token)?;
            }
            TypeSig::ValueType(token) => {
                out.push(element::VALUETYPE);
                encode_type_def_or_ref(out, *token)?;
            }
            TypeSig::Var(index) => {
                out.push(element::VAR);
                write_compressed_uint(out, *index)?;
            }
            TypeSig::MVar(index) => {
                out.push(element::MVAR);
                write_compressed_uint(out, *index)?;
            }
            TypeSig::Ptr(inner) => {
                out.push(element::PTR);
                inner.encode(out)?;
            }
            TypeSig::ByRef(inner) => {
                out.push(element::BYREF);
                inner.encode(out)?;
            }
            TypeSig::SzArray(inner) => {
                out.push(element::SZARRAY);
                inner.encode(out)?;
            }
            TypeSig::Pinned(inner) => {
                out.push(element::PINNED);
                inner.encode(out)?;
            }
            TypeSig::Array {
                element: inner,
                rank,
                sizes,
                lower_bounds,
            } => {
                out.push(element::ARRAY);
                inner.encode(out)?;
                write_compressed_uint(out, *rank)?;
                write_compressed_uint(out, sizes.len() as u32)?;
                for size in sizes {
                    write_compressed_uint(out, *size)?;
                }
                write_compressed_uint(out, lower_bounds.len() as u32)?;
                for bound in lower_bounds {
                    write_compressed_uint(out, *bound)?;
                }
            }
            TypeSig::GenericInst {
                value_type,
                generic,
                args,
            } => {
                out.push(element::GENERICINST);
                out.push(if *value_type {
                    element::VALUETYPE
                } else {
                    element::CLASS
                });
                encode_type_def_or_ref(out, *generic)?;
                write_compressed_uint(out, args.len() as u32)?;
                for arg in args {
                    arg.encode(out)?;
                }
            }
            TypeSig::FnPtr(signature) => {
                out.push(element::FNPTR);
                signature.encode_into(out)?;
            }
            TypeSig::Modified {
                required,
                modifier,
                inner,
            } => {
                out.push(if *required {
                    element::CMOD_REQD
                } else {
                    element::CMOD_OPT
                });
                encode_type_def_or_ref(out, *modifier)?;
                inner.encode(out)?;
            }
            _ => return Err(malformed_error!("Unencodable type {:?}", self)),
        }

        Ok(())
    }

    /// Strip custom modifiers and `pinned` wrappers.
    #[must_use]
    pub fn unmodified(&self) -> &TypeSig {
        match self {
            TypeSig::Modified { inner, .. } | TypeSig::Pinned(inner) => inner.unmodified(),
            other => other,
        }
    }

    /// Returns `true` for `void` (ignoring custom modifiers).
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self.unmodified(), TypeSig::Void)
    }

    /// Returns `true` for types whose values live on the managed heap.
    #[must_use]
    pub fn is_reference_type(&self) -> bool {
        match self.unmodified() {
            TypeSig::String | TypeSig::Object | TypeSig::Class(_) | TypeSig::SzArray(_) => true,
            TypeSig::Array { .. } => true,
            TypeSig::GenericInst { value_type, .. } => !value_type,
            _ => false,
        }
    }

    /// Returns `true` if the type, or any type nested inside it, is a generic parameter.
    #[must_use]
    pub fn contains_generic_parameter(&self) -> bool {
        match self {
            TypeSig::Var(_) | TypeSig::MVar(_) => true,
            TypeSig::Ptr(inner)
            | TypeSig::ByRef(inner)
            | TypeSig::SzArray(inner)
            | TypeSig::Pinned(inner) => inner.contains_generic_parameter(),
            TypeSig::Array { element, .. } => element.contains_generic_parameter(),
            TypeSig::Modified { inner, .. } => inner.contains_generic_parameter(),
            TypeSig::GenericInst { args, .. } => {
                args.iter().any(TypeSig::contains_generic_parameter)
            }
            TypeSig::FnPtr(signature) => {
                signature.ret.contains_generic_parameter()
                    || signature
                        .params
                        .iter()
                        .any(TypeSig::contains_generic_parameter)
            }
            _ => false,
        }
    }

    /// Human-readable, namespace-qualified type name.
    ///
    /// Primitive types use their `System.*` names, arrays append `[]`, by-refs `&`, and
    /// generic instantiations follow the reflection convention
    /// ``System.Collections.Generic.List`1[System.String]``.
    ///
    /// # Errors
    /// Propagates failures of the token resolver.
    pub fn display_name<R: TypeNameResolver + ?Sized>(&self, resolver: &R) -> Result<String> {
        let primitive = match self {
            TypeSig::Void => "System.Void",
            TypeSig::Boolean => "System.Boolean",
            TypeSig::Char => "System.Char",
            TypeSig::I1 => "System.SByte",
            TypeSig::U1 => "System.Byte",
            TypeSig::I2 => "System.Int16",
            TypeSig::U2 => "System.UInt16",
            TypeSig::I4 => "System.Int32",
            TypeSig::U4 => "System.UInt32",
            TypeSig::I8 => "System.Int64",
            TypeSig::U8 => "System.UInt64",
            TypeSig::R4 => "System.Single",
            TypeSig::R8 => "System.Double",
            TypeSig::String => "System.String",
            TypeSig::Object => "System.Object",
            TypeSig::I => "System.IntPtr",
            TypeSig::U => "System.UIntPtr",
            TypeSig::TypedByRef => "System.TypedReference",
            TypeSig::Sentinel => "...",
            _ => "",
        };
        if !primitive.is_empty() {
            return Ok(primitive.to_string());
        }

        Ok(match self {
            TypeSig::Class(token) | TypeSig::ValueType(token) => resolver.type_name(*token)?,
            TypeSig::Var(index) => format!("!{index}"),
            TypeSig::MVar(index) => format!("!!{index}"),
            TypeSig::Ptr(inner) => format!("{}*", inner.display_name(resolver)?),
            TypeSig::ByRef(inner) => format!("{}&", inner.display_name(resolver)?),
            TypeSig::SzArray(inner) => format!("{}[]", inner.display_name(resolver)?),
            TypeSig::Array { element, rank, .. } => {
                let commas = ",".repeat((*rank as usize).saturating_sub(1));
                format!("{}[{}]", element.display_name(resolver)?, commas)
            }
            TypeSig::GenericInst { generic, args, .. } => {
                let mut names = Vec::with_capacity(args.len());
                for arg in args {
                    names.push(arg.display_name(resolver)?);
                }
                format!("{}[{}]", resolver.type_name(*generic)?, names.join(","))
            }
            TypeSig::FnPtr(_) => "method*".to_string(),
            TypeSig::Modified { inner, .. } | TypeSig::Pinned(inner) => {
                inner.display_name(resolver)?
            }
            _ => String::new(),
        })
    }
}

fn encode_type_def_or_ref(out: &mut Vec<u8>, token: Token) -> Result<()> {
    let tag = match token.table() {
        Token::TYPE_DEF_TABLE => 0,
        Token::TYPE_REF_TABLE => 1,
        Token::TYPE_SPEC_TABLE => 2,
        other => {
            return Err(malformed_error!(
                "Token {} of table {:#x} is not TypeDefOrRef",
                token,
                other
            ))
        }
    };

    write_compressed_uint(out, (token.row() << 2) | tag)
}

/// A decoded `MethodDefSig` / `MethodRefSig` / `StandAloneMethodSig`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    /// Raw calling convention byte, including `HASTHIS`/`GENERIC` flags
    pub calling_convention: u8,
    /// Number of generic parameters (0 unless `GENERIC` is set)
    pub generic_params: u32,
    /// Return type
    pub ret: TypeSig,
    /// Parameter types, possibly containing a [`TypeSig::Sentinel`] for varargs call sites
    pub params: Vec<TypeSig>,
}

impl MethodSignature {
    /// Create a static, non-generic signature.
    #[must_use]
    pub fn static_method(ret: TypeSig, params: Vec<TypeSig>) -> Self {
        MethodSignature {
            calling_convention: callconv::DEFAULT,
            generic_params: 0,
            ret,
            params,
        }
    }

    /// Decode a method signature blob.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for invalid blobs.
    pub fn parse(blob: &[u8]) -> Result<MethodSignature> {
        let mut parser = Parser::new(blob);
        Self::parse_from(&mut parser, 0)
    }

    fn parse_from(parser: &mut Parser, depth: usize) -> Result<MethodSignature> {
        let calling_convention = parser.read_le::<u8>()?;
        if calling_convention & callconv::KIND_MASK == callconv::LOCAL_SIG {
            return Err(malformed_error!(
                "Expected a method signature, found a local signature"
            ));
        }

        let generic_params = if calling_convention & callconv::GENERIC != 0 {
            parser.read_compressed_uint()?
        } else {
            0
        };

        let count = parser.read_compressed_uint()?;
        let ret = TypeSig::parse_depth(parser, depth + 1)?;
        let mut params = Vec::with_capacity(count as usize);
        while params.iter().filter(|p| **p != TypeSig::Sentinel).count() < count as usize {
            params.push(TypeSig::parse_depth(parser, depth + 1)?);
        }

        Ok(MethodSignature {
            calling_convention,
            generic_params,
            ret,
            params,
        })
    }

    /// Encode into a fresh blob.
    ///
    /// # Errors
    /// Returns an error if a component cannot be compressed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        out.push(self.calling_convention);
        if self.calling_convention & callconv::GENERIC != 0 {
            write_compressed_uint(out, self.generic_params)?;
        }

        let count = self
            .params
            .iter()
            .filter(|param| **param != TypeSig::Sentinel)
            .count();
        write_compressed_uint(out, count as u32)?;
        self.ret.encode(out)?;
        for param in &self.params {
            param.encode(out)?;
        }

        Ok(())
    }

    /// Returns `true` when the method takes an implicit `this` argument.
    #[must_use]
    pub fn has_this(&self) -> bool {
        self.calling_convention & callconv::HAS_THIS != 0
            && self.calling_convention & callconv::EXPLICIT_THIS == 0
    }

    /// Number of declared parameters, excluding the vararg sentinel.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.params
            .iter()
            .filter(|param| **param != TypeSig::Sentinel)
            .count()
    }

    /// Number of evaluation-stack slots a call site pops (parameters plus `this`).
    #[must_use]
    pub fn stack_pops(&self) -> usize {
        self.arity() + usize::from(self.has_this())
    }
}

/// A `LocalVarSig` blob kept in raw form so existing locals are preserved byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalSignature {
    count: u32,
    types: Vec<u8>,
}

impl LocalSignature {
    /// Decode a local signature blob; an empty slice stands for "no locals".
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the blob is not a `LOCAL_SIG`.
    pub fn parse(blob: &[u8]) -> Result<LocalSignature> {
        if blob.is_empty() {
            return Ok(LocalSignature::default());
        }

        let mut parser = Parser::new(blob);
        let lead = parser.read_le::<u8>()?;
        if lead != callconv::LOCAL_SIG {
            return Err(malformed_error!("Invalid local signature lead byte - {:#x}", lead));
        }

        let count = parser.read_compressed_uint()?;
        let start = parser.pos();
        for _ in 0..count {
            // Validate every entry; the raw bytes are what gets preserved
            TypeSig::parse(&mut parser)?;
        }

        Ok(LocalSignature {
            count,
            types: blob[start..parser.pos()].to_vec(),
        })
    }

    /// Number of declared locals.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Append a local of the given type, returning its slot index.
    ///
    /// # Errors
    /// Returns an error if the type cannot be encoded or the slot limit is exceeded.
    pub fn push(&mut self, local: &TypeSig) -> Result<u16> {
        let index = u16::try_from(self.count)
            .ok()
            .filter(|index| *index < u16::MAX)
            .ok_or_else(|| malformed_error!("Too many locals - {}", self.count))?;

        local.encode(&mut self.types)?;
        self.count += 1;
        Ok(index)
    }

    /// Encode the full `LocalVarSig` blob.
    ///
    /// # Errors
    /// Returns an error if the local count cannot be compressed.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.types.len() + 4);
        out.push(callconv::LOCAL_SIG);
        write_compressed_uint(&mut out, self.count)?;
        out.extend_from_slice(&self.types);
        Ok(out)
    }
}
