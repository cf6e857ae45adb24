//! # dotweave Prelude
//!
//! The most commonly used types and traits of the engine, for glob imports.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotweave operations
pub use crate::Error;

/// The result type used throughout dotweave
pub use crate::Result;

/// Engine configuration
pub use crate::{EngineConfig, VerifyMode};

// ================================================================================================
// Attaching to the runtime
// ================================================================================================

/// Attach entry point and its handle
pub use crate::profiler::{attach, AttachHandle, EngineStats};

/// Runtime interfaces the engine consumes
pub use crate::profiler::{
    AssemblyId, FunctionId, FunctionInfo, HResult, ModuleId, ModuleInfo, ProfilerCallback,
    ProfilerInfo, RuntimeHost, RuntimeInfo,
};

// ================================================================================================
// Rules
// ================================================================================================

/// Instrumentation rules and their registry
pub use crate::integration::{
    rule::{AssemblyVersion, NamePattern, ParamPattern, VersionRange},
    HelperRef, InstrumentationPolicy, InstrumentationRule, IntegrationRegistry, RuleSource,
    StaticRuleSource, TypeHierarchy,
};

// ================================================================================================
// Metadata
// ================================================================================================

/// Metadata token type for referencing table entries
pub use crate::metadata::token::Token;

/// Signatures
pub use crate::metadata::signature::{LocalSignature, MethodSignature, TypeSig};

/// Runtime metadata interfaces
pub use crate::metadata::{MetadataEmit, MetadataImport, MethodProps, ModuleMetadata};

// ================================================================================================
// Method bodies
// ================================================================================================

/// Method body parsing and writing
pub use crate::il::{ExceptionHandler, ExceptionHandlerFlags, MethodBody, MethodBodyWriter};

/// The rewriter
pub use crate::il::{HelperTokenSource, RewriteOutcome, RewriteRequest, RewrittenMethod, Rewriter};

/// Verification
pub use crate::il::{CallSiteResolver, VerifyOptions};
