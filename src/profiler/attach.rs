//! Attaching to and detaching from the runtime.

use std::sync::Arc;

use crate::{
    config::EngineConfig,
    integration::registry::IntegrationRegistry,
    profiler::{
        dispatcher::Dispatcher,
        runtime::{EventMask, RuntimeHost, RuntimeInfo},
        state::{CallbackState, EngineStats},
    },
    Error, Result,
};

/// Oldest runtime major version the engine instruments.
pub const MINIMUM_RUNTIME_MAJOR: u32 = 4;

/// Events the dispatcher subscribes to.
pub const EVENTS: EventMask = EventMask::MODULE_LOADS
    .union(EventMask::ASSEMBLY_LOADS)
    .union(EventMask::JIT_COMPILATION);

fn unavailable(error: Error) -> Error {
    match error {
        Error::RuntimeUnavailable(_) => error,
        other => Error::RuntimeUnavailable(other.to_string()),
    }
}

fn negotiate(runtime: &RuntimeInfo, hint: Option<&str>) -> Result<()> {
    let major = runtime.major().ok_or_else(|| Error::IncompatibleVersion {
        found: runtime.version.clone(),
        expected: format!(">= {MINIMUM_RUNTIME_MAJOR}"),
    })?;
    if major < MINIMUM_RUNTIME_MAJOR {
        return Err(Error::IncompatibleVersion {
            found: runtime.version.clone(),
            expected: format!(">= {MINIMUM_RUNTIME_MAJOR}"),
        });
    }

    if let Some(hint) = hint {
        if !runtime.matches_hint(hint) {
            return Err(Error::IncompatibleVersion {
                found: runtime.version.clone(),
                expected: hint.to_string(),
            });
        }
    }
    Ok(())
}

/// Register the instrumentation engine with the runtime.
///
/// While the returned handle is alive, the engine is the runtime's profiling observer.
///
/// # Errors
///
/// - [`Error::Disabled`] if the configuration turns the engine off
/// - [`Error::RuntimeUnavailable`] if the host reports no runtime or refuses the callback
/// - [`Error::IncompatibleVersion`] if the runtime is older than
///   [`MINIMUM_RUNTIME_MAJOR`] or does not match the configured version hint
pub fn attach(
    host: Arc<dyn RuntimeHost>,
    config: &EngineConfig,
    registry: IntegrationRegistry,
) -> Result<AttachHandle> {
    if !config.enabled {
        tracing::info!("instrumentation disabled by configuration");
        return Err(Error::Disabled);
    }

    let runtime = host.runtime_info().map_err(unavailable)?;
    if let Err(error) = negotiate(&runtime, config.runtime_version_hint.as_deref()) {
        tracing::warn!(version = %runtime.version, %error, "refusing to attach");
        return Err(error);
    }

    let info = host.profiler_info().map_err(unavailable)?;
    let state = Arc::new(CallbackState::new(config.emit_retry_limit));
    let rules = registry.len();
    let dispatcher = Arc::new(Dispatcher::new(state.clone(), info, registry, config));

    host.register_callback(dispatcher, EVENTS)
        .map_err(unavailable)?;

    tracing::info!(
        version = %runtime.version,
        rules,
        verify = %config.verify,
        "attached to runtime"
    );
    Ok(AttachHandle {
        host,
        state,
        detached: false,
    })
}

/// A live attachment; detaches when dropped.
pub struct AttachHandle {
    host: Arc<dyn RuntimeHost>,
    state: Arc<CallbackState>,
    detached: bool,
}

impl AttachHandle {
    /// Stop instrumenting and unregister from the runtime.
    ///
    /// # Errors
    /// Returns the runtime's error if it refuses to unregister; the engine's state is torn
    /// down regardless.
    pub fn detach(mut self) -> Result<()> {
        self.tear_down()
    }

    /// Counters and live-state snapshot.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.state.stats()
    }

    /// Returns `true` once the engine stopped instrumenting, through detach or runtime
    /// shutdown.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.state.is_torn_down()
    }

    fn tear_down(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;

        self.state.tear_down();
        self.host.unregister_callback()?;
        tracing::info!("detached from runtime");
        Ok(())
    }
}

impl Drop for AttachHandle {
    fn drop(&mut self) {
        if let Err(error) = self.tear_down() {
            tracing::warn!(%error, "failed to unregister profiling callback");
        }
    }
}
