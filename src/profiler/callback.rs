//! The profiling event surface the runtime calls into.

use crate::profiler::runtime::{AssemblyId, FunctionId, HResult, ModuleId};

/// Receiver of profiling events.
///
/// Every method has a default that ignores the event, so observers implement only what they
/// subscribed to. Methods are invoked concurrently from arbitrary runtime threads.
pub trait ProfilerCallback: Send + Sync {
    /// A module finished loading; `status` is the load result.
    fn module_load_finished(&self, _module: ModuleId, _status: HResult) -> HResult {
        HResult::S_OK
    }

    /// A module is about to be unloaded.
    fn module_unload_started(&self, _module: ModuleId) -> HResult {
        HResult::S_OK
    }

    /// A method is about to be compiled.
    fn jit_compilation_started(&self, _function: FunctionId, _is_safe_to_block: bool) -> HResult {
        HResult::S_OK
    }

    /// An assembly is about to be unloaded.
    fn assembly_unload_started(&self, _assembly: AssemblyId) -> HResult {
        HResult::S_OK
    }

    /// The runtime is shutting down.
    fn shutdown(&self) -> HResult {
        HResult::S_OK
    }
}
