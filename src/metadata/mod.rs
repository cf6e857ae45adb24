//! Module metadata as seen by the engine.
//!
//! The engine never parses PE files itself: the runtime already has every loaded module's
//! metadata open and exposes it through its import and emit interfaces. This module defines
//! those interfaces as traits, so a real FFI binding and an in-process fake look the same to
//! the rest of the crate.
//!
//! # Key Components
//!
//! - [`token`] - Metadata table row references
//! - [`signature`] - Method, type and local variable signature blobs
//! - [`emitter`] - Per-module cache of the tokens injected code refers to
//! - [`MetadataImport`] / [`MetadataEmit`] - The runtime's read and write interfaces

use crate::{
    il::verify::CallSiteResolver,
    integration::selector::TypeHierarchy,
    metadata::{
        signature::{MethodSignature, TypeNameResolver},
        token::Token,
    },
    Result,
};

/// Per-module helper token cache and emission
pub mod emitter;
/// Implementation of method, type and local signatures
pub mod signature;
/// Implementation of metadata tokens
pub mod token;

/// Properties of a `MethodDef` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodProps {
    /// The `MethodDef` token
    pub token: Token,
    /// `TypeDef` token of the declaring type
    pub type_token: Token,
    /// Method name, `.ctor` for instance constructors
    pub name: String,
    /// Raw `MethodDefSig` blob
    pub signature: Vec<u8>,
}

impl MethodProps {
    /// Returns `true` for instance constructors.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor"
    }
}

/// Read access to one module's metadata.
pub trait MetadataImport: TypeNameResolver + Send + Sync {
    /// Name, declaring type and signature of a method.
    ///
    /// # Errors
    /// Returns [`crate::Error::TokenNotFound`] if the token does not name a method of this
    /// module.
    fn method_props(&self, method: Token) -> Result<MethodProps>;

    /// Signature blob of the method a call-site token (`MethodDef`, `MemberRef` or
    /// `MethodSpec`) refers to. Vararg `MemberRef`s include their call-site arguments.
    ///
    /// # Errors
    /// Returns [`crate::Error::TokenNotFound`] if the token cannot be resolved.
    fn member_signature(&self, token: Token) -> Result<Vec<u8>>;

    /// Blob of a `StandAloneSig` row (local variables or an indirect call signature).
    ///
    /// # Errors
    /// Returns [`crate::Error::TokenNotFound`] if the token cannot be resolved.
    fn standalone_signature(&self, token: Token) -> Result<Vec<u8>>;

    /// `AssemblyRef` of the core library (the assembly defining `System.Object`).
    ///
    /// # Errors
    /// Returns an error if the module does not reference a core library.
    fn core_library(&self) -> Result<Token>;

    /// Type hierarchy used for "assignable to" parameter checks, if the runtime offers one.
    fn type_hierarchy(&self) -> Option<&dyn TypeHierarchy> {
        None
    }
}

/// Write access to one module's metadata.
///
/// Every method creates a new row; deduplication is the job of
/// [`emitter::ModuleTokenCache`]. A concurrent modification by the runtime is reported as
/// [`crate::Error::MetadataEmissionConflict`] and is safe to retry.
pub trait MetadataEmit: Send + Sync {
    /// Add an `AssemblyRef` row for the named assembly.
    ///
    /// # Errors
    /// Returns an error if the row cannot be written.
    fn define_assembly_ref(&self, name: &str) -> Result<Token>;

    /// Add a `TypeRef` row for a namespace-qualified type name resolved through `scope`.
    ///
    /// # Errors
    /// Returns an error if the row cannot be written.
    fn define_type_ref(&self, scope: Token, full_name: &str) -> Result<Token>;

    /// Add a `MemberRef` row.
    ///
    /// # Errors
    /// Returns an error if the row cannot be written.
    fn define_member_ref(&self, parent: Token, name: &str, signature: &[u8]) -> Result<Token>;

    /// Add a `StandAloneSig` row.
    ///
    /// # Errors
    /// Returns an error if the row cannot be written.
    fn define_standalone_sig(&self, blob: &[u8]) -> Result<Token>;
}

/// Combined import and emit access, as handed out by the runtime per module.
pub trait ModuleMetadata: MetadataImport + MetadataEmit {}

impl<T: MetadataImport + MetadataEmit + ?Sized> ModuleMetadata for T {}

/// Resolves call-site signatures for the stack verifier from module metadata.
pub struct CallSites<'a, M: MetadataImport + ?Sized> {
    metadata: &'a M,
}

impl<'a, M: MetadataImport + ?Sized> CallSites<'a, M> {
    /// Resolve through the given module's metadata.
    #[must_use]
    pub fn new(metadata: &'a M) -> Self {
        CallSites { metadata }
    }
}

impl<M: MetadataImport + ?Sized> CallSiteResolver for CallSites<'_, M> {
    fn signature(&self, token: Token) -> Result<MethodSignature> {
        let blob = if token.table() == Token::STANDALONE_SIG_TABLE {
            self.metadata.standalone_signature(token)?
        } else {
            self.metadata.member_signature(token)?
        };

        MethodSignature::parse(&blob)
    }
}
