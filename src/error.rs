use thiserror::Error;

use crate::{metadata::token::Token, profiler::HResult};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into two groups with very different consequences for the hosting process.
///
/// # Attach-time errors
///
/// These are fatal to the engine: the profiler stays detached and no method is instrumented.
/// - [`Error::RuntimeUnavailable`] - The hosting runtime could not be reached
/// - [`Error::IncompatibleVersion`] - The runtime version is not supported
/// - [`Error::Disabled`] - The operator switched the engine off
///
/// # Per-method errors
///
/// These are contained by the callback dispatcher. The affected method is compiled from its
/// original bytecode and simply produces no telemetry.
/// - [`Error::UnsupportedMethodShape`] - The rewriter declined the method
/// - [`Error::NonConvergentLayout`] - Branch relayout did not reach a fixed point
/// - [`Error::MetadataEmissionConflict`] - Transient metadata write conflict (retried first)
/// - [`Error::VerifierRejection`] - Rewritten body failed the structural verifier
/// - [`Error::Malformed`] / [`Error::OutOfBounds`] - The input bytecode could not be decoded
///
/// # Examples
///
/// ```rust
/// use dotweave::Error;
///
/// assert!(Error::Disabled.is_fatal());
///
/// let declined = Error::UnsupportedMethodShape("filter clause".into());
/// assert!(!declined.is_fatal());
/// assert!(declined.is_decline());
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Attach-time errors
    /// The managed runtime's profiling subsystem could not be reached.
    ///
    /// Raised when the host cannot report a loaded runtime or refuses to register the
    /// profiling callback.
    #[error("Runtime unavailable - {0}")]
    RuntimeUnavailable(String),

    /// The runtime reported a version this engine cannot instrument.
    ///
    /// # Fields
    ///
    /// * `found` - The version string reported by the runtime
    /// * `expected` - The minimum version or the configured version hint
    #[error("Incompatible runtime version {found}, expected {expected}")]
    IncompatibleVersion {
        /// Version string reported by the runtime
        found: String,
        /// Version requirement that was not met
        expected: String,
    },

    /// The engine was disabled through configuration.
    #[error("Profiler is disabled by configuration")]
    Disabled,

    // Per-method errors
    /// The method uses a construct the rewriter does not handle.
    ///
    /// The rewriter declines such methods and the original bytecode is handed back to the
    /// runtime unchanged.
    #[error("Unsupported method shape - {0}")]
    UnsupportedMethodShape(String),

    /// Branch relayout did not stabilize within the configured number of passes.
    #[error("Branch layout did not converge after {0} passes")]
    NonConvergentLayout(usize),

    /// The runtime reported a conflicting concurrent metadata modification.
    ///
    /// The metadata emitter retries the emission under the module lock before giving up.
    #[error("Metadata emission conflict while emitting {0}")]
    MetadataEmissionConflict(String),

    /// A rewritten method body failed verification.
    ///
    /// # Fields
    ///
    /// * `offset` - IL offset at which the violation was detected
    /// * `message` - Description of the violated rule
    #[error("Verifier rejected rewritten body at IL_{offset:04x}: {message}")]
    VerifierRejection {
        /// Offset of the offending instruction
        offset: u32,
        /// Description of the failed check
        message: String,
    },

    /// The bytecode or a signature blob is damaged and could not be parsed.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while reading or writing a buffer.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    // Configuration and registry errors
    /// An instrumentation rule failed validation when the registry was built.
    #[error("Invalid instrumentation rule '{integration}' - {reason}")]
    InvalidRule {
        /// Integration name of the offending rule
        integration: String,
        /// Why the rule was rejected
        reason: String,
    },

    /// A configuration value could not be interpreted.
    #[error("Invalid configuration value for {key}: '{value}'")]
    InvalidConfig {
        /// Environment key
        key: String,
        /// Rejected value
        value: String,
    },

    // Runtime interaction errors
    /// A callback referenced a module that was never reported as loaded.
    #[error("Unknown module {0:#x}")]
    UnknownModule(u64),

    /// A metadata token could not be resolved by the runtime.
    #[error("Failed to resolve token {0}")]
    TokenNotFound(Token),

    /// A runtime call returned a failure `HRESULT`.
    #[error("Runtime call failed with {0}")]
    Runtime(HResult),

    /// Failed to lock target.
    ///
    /// This error occurs when a mutex guarding per-module state was poisoned by a panicking
    /// thread.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Returns `true` for errors that disable the whole engine rather than a single method.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::RuntimeUnavailable(_) | Error::IncompatibleVersion { .. } | Error::Disabled
        )
    }

    /// Returns `true` for errors raised because the rewriter chose not to touch a method.
    #[must_use]
    pub fn is_decline(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedMethodShape(_) | Error::NonConvergentLayout(_)
        )
    }
}
