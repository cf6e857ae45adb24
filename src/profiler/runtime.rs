//! The runtime's profiling API as consumed by the engine.
//!
//! A real deployment implements these traits over the runtime's COM-style interfaces; tests
//! implement them with in-process fakes.

use std::{fmt, sync::Arc};

use bitflags::bitflags;

use crate::{
    integration::rule::AssemblyVersion,
    metadata::{token::Token, ModuleMetadata},
    profiler::callback::ProfilerCallback,
    Result,
};

/// Status code returned across the runtime boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    /// Success
    pub const S_OK: HResult = HResult(0);
    /// Unspecified failure
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);

    /// Returns `true` for success codes.
    #[must_use]
    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }

    /// Convert a failure code into an error.
    ///
    /// # Errors
    /// Returns [`crate::Error::Runtime`] for failure codes.
    pub fn ok(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(crate::Error::Runtime(self))
        }
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HRESULT {:#010x}", self.0 as u32)
    }
}

macro_rules! runtime_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

runtime_id!(
    /// Opaque runtime handle of a method being compiled
    FunctionId
);
runtime_id!(
    /// Opaque runtime handle of a loaded module
    ModuleId
);
runtime_id!(
    /// Opaque runtime handle of a loaded assembly
    AssemblyId
);

/// Version information reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// Dotted version string, e.g. `8.0.4`
    pub version: String,
}

impl RuntimeInfo {
    /// Major version, `None` if the version string does not start with a number.
    #[must_use]
    pub fn major(&self) -> Option<u32> {
        self.version.split('.').next()?.trim().parse().ok()
    }

    /// Returns `true` if the version starts with the components of `hint`.
    ///
    /// `8` matches `8.0.4`, `8.0` matches `8.0.4` but not `8.1.0`.
    #[must_use]
    pub fn matches_hint(&self, hint: &str) -> bool {
        let mut actual = self.version.split('.');
        hint.split('.')
            .filter(|part| !part.is_empty())
            .all(|part| actual.next() == Some(part))
    }
}

bitflags! {
    /// Profiling events the engine subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        /// Module load and unload notifications
        const MODULE_LOADS = 0x0000_0004;
        /// Assembly load and unload notifications
        const ASSEMBLY_LOADS = 0x0000_0008;
        /// JIT compilation notifications
        const JIT_COMPILATION = 0x0000_0020;
    }
}

/// Owner of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Module defining the method
    pub module: ModuleId,
    /// `MethodDef` token
    pub token: Token,
}

/// Identity of a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module name or path
    pub name: String,
    /// Owning assembly
    pub assembly: AssemblyId,
    /// Simple name of the owning assembly
    pub assembly_name: String,
    /// Version of the owning assembly
    pub assembly_version: AssemblyVersion,
}

/// The hosting side of the profiling API.
pub trait RuntimeHost: Send + Sync {
    /// Version of the loaded runtime.
    ///
    /// # Errors
    /// Returns an error if no runtime is loaded.
    fn runtime_info(&self) -> Result<RuntimeInfo>;

    /// Make `callback` the active profiling observer for the given events.
    ///
    /// # Errors
    /// Returns an error if the runtime refuses the registration.
    fn register_callback(&self, callback: Arc<dyn ProfilerCallback>, events: EventMask)
        -> Result<()>;

    /// Remove the active profiling observer.
    ///
    /// # Errors
    /// Returns an error if the runtime refuses.
    fn unregister_callback(&self) -> Result<()>;

    /// Query interface for module and function information.
    ///
    /// # Errors
    /// Returns an error if the interface is unavailable.
    fn profiler_info(&self) -> Result<Arc<dyn ProfilerInfo>>;
}

/// The runtime's information and code-replacement interface.
pub trait ProfilerInfo: Send + Sync {
    /// Module and token of a function.
    ///
    /// # Errors
    /// Returns an error if the function is unknown.
    fn function_info(&self, function: FunctionId) -> Result<FunctionInfo>;

    /// Name and assembly of a module.
    ///
    /// # Errors
    /// Returns an error if the module is unknown.
    fn module_info(&self, module: ModuleId) -> Result<ModuleInfo>;

    /// Metadata import and emit interfaces of a module.
    ///
    /// # Errors
    /// Returns an error if the module's metadata cannot be opened for writing.
    fn module_metadata(&self, module: ModuleId) -> Result<Arc<dyn ModuleMetadata>>;

    /// Current body of a method, header included.
    ///
    /// # Errors
    /// Returns an error if the method has no IL body.
    fn il_function_body(&self, module: ModuleId, method: Token) -> Result<Vec<u8>>;

    /// Replace the body of a method before it is compiled.
    ///
    /// # Errors
    /// Returns an error if the runtime rejects the body.
    fn set_il_function_body(&self, module: ModuleId, method: Token, body: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hresult_codes() {
        assert!(HResult::S_OK.is_ok());
        assert!(!HResult::E_FAIL.is_ok());
        assert!(HResult::E_FAIL.ok().is_err());
        assert_eq!(HResult::E_FAIL.to_string(), "HRESULT 0x80004005");
    }

    #[test]
    fn runtime_versions() {
        let info = RuntimeInfo {
            version: "8.0.4".to_string(),
        };
        assert_eq!(info.major(), Some(8));
        assert!(info.matches_hint("8"));
        assert!(info.matches_hint("8.0"));
        assert!(!info.matches_hint("8.1"));
        assert!(!info.matches_hint("80"));

        let odd = RuntimeInfo {
            version: "v4.0.30319".to_string(),
        };
        assert_eq!(odd.major(), None);
    }

    #[test]
    fn ids_display_as_hex() {
        assert_eq!(ModuleId(255).to_string(), "0xff");
        assert_eq!(
            (EventMask::MODULE_LOADS | EventMask::JIT_COMPILATION).bits(),
            0x24
        );
    }
}
