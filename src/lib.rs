// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]

//! # dotweave
//!
//! [![Crates.io](https://img.shields.io/crates/v/dotweave.svg)](https://crates.io/crates/dotweave)
//! [![Documentation](https://docs.rs/dotweave/badge.svg)](https://docs.rs/dotweave)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/dotweave/blob/main/LICENSE-APACHE)
//!
//! The native half of an automatic instrumentation agent for ECMA-335 runtimes. `dotweave`
//! attaches to the runtime's profiling interface, watches methods being compiled, and rewrites
//! the CIL bodies of selected methods so that they call managed tracing helpers on entry and
//! on every way out, without any change to application source.
//!
//! # Architecture
//!
//! ```text
//!  runtime ──► profiler::dispatcher ──► integration::selector ──► integration::registry
//!                      │
//!                      ├──► il::rewriter ──► il::{decoder, code, encoder, body, verify}
//!                      │          │
//!                      │          └──► metadata::emitter ──► MetadataEmit (runtime)
//!                      │
//!                      └──► ProfilerInfo::set_il_function_body (runtime)
//! ```
//!
//! - [`profiler`] - Attach/detach, the callback dispatcher and its shared state
//! - [`integration`] - Instrumentation rules, the rule registry and method selection
//! - [`il`] - Method body decoding, rewriting, re-encoding and verification
//! - [`metadata`] - Tokens, signatures and the runtime's metadata interfaces
//! - [`config`] - Engine configuration and environment loading
//!
//! The runtime itself is consumed through traits ([`profiler::RuntimeHost`],
//! [`profiler::ProfilerInfo`], [`metadata::ModuleMetadata`]), so the engine can sit behind a
//! real FFI layer or be driven by in-process fakes.
//!
//! # Rewriting a method body
//!
//! ```rust
//! use dotweave::prelude::*;
//!
//! struct Tokens;
//!
//! impl HelperTokenSource for Tokens {
//!     fn enter(&self) -> dotweave::Result<Token> { Ok(Token::new(0x0A00_0001)) }
//!     fn exit(&self, _ret: Option<&TypeSig>) -> dotweave::Result<Token> { Ok(Token::new(0x0A00_0002)) }
//!     fn exception_type(&self) -> dotweave::Result<Token> { Ok(Token::new(0x0100_0001)) }
//!     fn local_signature(&self, _blob: &[u8]) -> dotweave::Result<Token> { Ok(Token::new(0x1100_0001)) }
//! }
//!
//! // static int Add(int a, int b) => a + b;
//! let body = MethodBodyWriter::new(&[0x02, 0x03, 0x58, 0x2A]).build()?;
//! let signature = MethodSignature::static_method(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]);
//!
//! let request = RewriteRequest {
//!     method_token: Token::new(0x0600_0001),
//!     body: &body,
//!     signature: &signature,
//!     locals: &[],
//!     is_constructor: false,
//!     policy: InstrumentationPolicy::all(),
//! };
//!
//! match Rewriter::default().rewrite(&request, &Tokens)? {
//!     RewriteOutcome::Rewritten(method) => assert!(method.body.len() > body.len()),
//!     RewriteOutcome::AlreadyInstrumented => unreachable!(),
//! }
//! # Ok::<(), dotweave::Error>(())
//! ```
//!
//! # Failure model
//!
//! Only attach can fail visibly. Once attached, every per-method problem (an unsupported
//! method shape, a metadata conflict, a verifier rejection) is logged through `tracing`,
//! counted, and the method runs uninstrumented.
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use dotweave::prelude::*;
///
/// let config = EngineConfig::strict();
/// assert_eq!(config.max_layout_passes, 32);
/// ```
pub mod prelude;

/// Engine configuration and environment loading
pub mod config;

/// CIL method body decoding, rewriting, encoding and verification
pub mod il;

/// Instrumentation rules, registry and method selection
pub mod integration;

/// Metadata tokens, signatures and the runtime's metadata interfaces
pub mod metadata;

/// The profiling-callback state machine
pub mod profiler;

/// Byte-level reading and writing helpers
pub mod utils;

/// `dotweave` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always
/// [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `dotweave` Error type
///
/// Attach-time variants are fatal, everything else is contained per method. See
/// [`Error::is_fatal`] and [`Error::is_decline`].
pub use error::Error;

/// Engine configuration, see [`config::EngineConfig`].
pub use config::{EngineConfig, VerifyMode};

/// Metadata token type.
pub use metadata::token::Token;

/// Bounds-checked little-endian reader used by the IL and signature decoders.
pub use utils::parser::Parser;
