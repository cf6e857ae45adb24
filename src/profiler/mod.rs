//! Profiling-callback state machine.
//!
//! - [`runtime`] - The runtime's hosting and information interfaces
//! - [`callback`] - The event surface the runtime calls
//! - [`state`] - Process-wide state, claims and counters
//! - [`dispatcher`] - The callback implementation driving selection and rewriting
//! - [`attach`] - Registration with the runtime and teardown
//!
//! # Lifecycle
//!
//! ```text
//! attach() ─► module_load_finished ─► jit_compilation_started* ─► assembly_unload_started
//!    │                                                                  │
//!    └────────────── AttachHandle::detach / drop / shutdown ◄───────────┘
//! ```
//!
//! After teardown every callback returns immediately.

pub mod attach;
pub mod callback;
pub mod dispatcher;
pub mod runtime;
pub mod state;

pub use attach::{attach, AttachHandle, MINIMUM_RUNTIME_MAJOR};
pub use callback::ProfilerCallback;
pub use dispatcher::Dispatcher;
pub use runtime::{
    AssemblyId, EventMask, FunctionId, FunctionInfo, HResult, ModuleId, ModuleInfo, ProfilerInfo,
    RuntimeHost, RuntimeInfo,
};
pub use state::{CallbackEvent, EngineStats, MethodOutcome};
