//! The profiling callback that drives instrumentation.
//!
//! [`Dispatcher`] is registered with the runtime by [`crate::profiler::attach`]. Its
//! compilation callback runs on the runtime's compiler threads and keeps the common case
//! cheap: most methods are dismissed after a module lookup or a method name check, before any
//! signature is decoded.
//!
//! Every callback fails open. Errors are logged and counted, the method keeps its original
//! body, and the runtime always receives [`HResult::S_OK`].

use std::sync::Arc;

use crate::{
    config::{EngineConfig, VerifyMode},
    il::{
        body::MethodBody,
        rewriter::{RewriteOutcome, RewriteRequest, RewrittenMethod, Rewriter},
        verify::{verify, VerifyOptions},
    },
    integration::{
        registry::IntegrationRegistry,
        selector::{select, AssemblyIdentity, MethodDescriptor, MethodIdentity, SelectionContext},
    },
    metadata::{token::Token, CallSites, ModuleMetadata},
    profiler::{
        callback::ProfilerCallback,
        runtime::{AssemblyId, FunctionId, HResult, ModuleId, ProfilerInfo},
        state::{CallbackEvent, CallbackState, MethodOutcome, ModuleRecord},
    },
    Result,
};

/// Routes profiling events into the selector, rewriter and emitter.
pub struct Dispatcher {
    state: Arc<CallbackState>,
    info: Arc<dyn ProfilerInfo>,
    registry: IntegrationRegistry,
    rewriter: Rewriter,
    verify: VerifyMode,
}

impl Dispatcher {
    /// Create a dispatcher over shared state.
    #[must_use]
    pub fn new(
        state: Arc<CallbackState>,
        info: Arc<dyn ProfilerInfo>,
        registry: IntegrationRegistry,
        config: &EngineConfig,
    ) -> Self {
        Dispatcher {
            state,
            info,
            registry,
            rewriter: Rewriter::new(config.max_layout_passes),
            verify: config.verify,
        }
    }

    /// The state shared with the attach handle.
    #[must_use]
    pub fn state(&self) -> &Arc<CallbackState> {
        &self.state
    }

    fn load_module(&self, module: ModuleId) -> Result<()> {
        let info = self.info.module_info(module)?;
        let identity = AssemblyIdentity::new(&info.assembly_name, info.assembly_version);
        let candidates = self.registry.candidates_for(&identity);

        let metadata = if candidates.is_empty() {
            None
        } else {
            Some(self.info.module_metadata(module)?)
        };

        tracing::debug!(
            %module,
            assembly = %identity,
            candidates = candidates.len(),
            "module loaded"
        );

        let tokens = self.state.token_cache(module);
        let record = ModuleRecord::new(
            module,
            info.assembly,
            identity,
            candidates,
            metadata,
            tokens,
        );
        if self.state.insert_module(record).is_none() {
            tracing::debug!(%module, "engine torn down, module not recorded");
        }
        Ok(())
    }

    /// Handle one compilation request; `None` means the method was dismissed by the fast path.
    fn compile(&self, function: FunctionId) -> Result<Option<MethodOutcome>> {
        let function = self.info.function_info(function)?;
        let Some(record) = self.state.module(function.module) else {
            return Ok(None);
        };
        if !record.has_candidates() {
            return Ok(None);
        }
        let Some(metadata) = record.metadata.as_deref() else {
            return Ok(None);
        };

        let props = metadata.method_props(function.token)?;
        if !self
            .registry
            .might_match_method(&record.candidates, &props.name)
        {
            return Ok(None);
        }

        let descriptor = MethodDescriptor::resolve(metadata, &props, record.identity.clone())?;
        let identity = MethodIdentity {
            module: function.module,
            type_token: props.type_token,
            method_token: props.token,
            signature: props.signature.clone(),
        };
        let context = SelectionContext {
            identity: &identity,
            descriptor: &descriptor,
            hierarchy: metadata.type_hierarchy(),
        };

        let Some(selected) = select(&record.candidates, &context) else {
            tracing::trace!(method = %descriptor, "no rule matched");
            return Ok(Some(MethodOutcome::PassedThrough));
        };
        let rule = &selected.rule;

        if !self.state.claim(&record, props.token, &rule.integration) {
            tracing::trace!(method = %descriptor, "method already claimed");
            return Ok(Some(MethodOutcome::PassedThrough));
        }

        let body = self.info.il_function_body(function.module, props.token)?;
        let header = MethodBody::from(&body)?;
        let locals = match header.local_signature() {
            Some(token) => metadata.standalone_signature(token)?,
            None => Vec::new(),
        };

        let request = RewriteRequest {
            method_token: props.token,
            body: &body,
            signature: &descriptor.signature,
            locals: &locals,
            is_constructor: props.is_constructor(),
            policy: rule.policy,
        };
        let tokens = record.tokens.helper_tokens(&rule.helper, metadata);

        let rewritten = match self.rewriter.rewrite(&request, &tokens) {
            Ok(RewriteOutcome::Rewritten(rewritten)) => rewritten,
            Ok(RewriteOutcome::AlreadyInstrumented) => {
                return Ok(Some(MethodOutcome::PassedThrough));
            }
            Err(error) if error.is_decline() => {
                tracing::info!(
                    method = %descriptor,
                    integration = %rule.integration,
                    %error,
                    "declined to instrument method"
                );
                return Ok(Some(MethodOutcome::Declined));
            }
            Err(error) => return Err(error),
        };

        self.check(
            &rewritten,
            props.token,
            !descriptor.signature.ret.is_void(),
            metadata,
        )?;

        let installed = record.tokens.exclusive(|| {
            if self.state.is_torn_down() {
                return Ok(false);
            }
            self.info
                .set_il_function_body(function.module, props.token, &rewritten.body)?;
            Ok(true)
        })?;
        if !installed {
            tracing::debug!(method = %descriptor, "engine torn down, rewritten body dropped");
            return Ok(None);
        }

        tracing::info!(
            method = %descriptor,
            integration = %rule.integration,
            size = rewritten.body.len(),
            "instrumented method"
        );
        Ok(Some(MethodOutcome::Instrumented))
    }

    fn check(
        &self,
        rewritten: &RewrittenMethod,
        method: Token,
        returns_value: bool,
        metadata: &dyn ModuleMetadata,
    ) -> Result<()> {
        let call_sites = CallSites::new(metadata);
        let options = match self.verify {
            VerifyMode::Off => return Ok(()),
            VerifyMode::Structural => VerifyOptions {
                returns_value,
                resolver: None,
            },
            VerifyMode::Full => VerifyOptions {
                returns_value,
                resolver: Some(&call_sites),
            },
        };

        if let Err(error) = verify(&rewritten.body, &options) {
            tracing::error!(%method, %error, "rewritten body failed verification");
            debug_assert!(
                false,
                "rewritten body of {method} failed verification: {error}"
            );
            return Err(error);
        }
        Ok(())
    }
}

impl ProfilerCallback for Dispatcher {
    fn module_load_finished(&self, module: ModuleId, status: HResult) -> HResult {
        if self.state.is_torn_down() {
            return HResult::S_OK;
        }
        self.state.counters().record_event(CallbackEvent::ModuleLoad);

        if !status.is_ok() {
            tracing::debug!(%module, %status, "module failed to load");
            return HResult::S_OK;
        }
        if let Err(error) = self.load_module(module) {
            tracing::warn!(%module, %error, "failed to record module");
        }
        HResult::S_OK
    }

    fn module_unload_started(&self, module: ModuleId) -> HResult {
        if self.state.is_torn_down() {
            return HResult::S_OK;
        }
        self.state
            .counters()
            .record_event(CallbackEvent::ModuleUnload);

        if self.state.remove_module(module).is_some() {
            tracing::debug!(%module, "module unloaded");
        }
        HResult::S_OK
    }

    fn jit_compilation_started(&self, function: FunctionId, _is_safe_to_block: bool) -> HResult {
        if self.state.is_torn_down() {
            return HResult::S_OK;
        }
        self.state
            .counters()
            .record_event(CallbackEvent::JitCompilation);

        match self.compile(function) {
            Ok(Some(outcome)) => self.state.counters().record_outcome(outcome),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%function, %error, "instrumentation failed, keeping original body");
                self.state
                    .counters()
                    .record_outcome(MethodOutcome::Failed);
            }
        }
        HResult::S_OK
    }

    fn assembly_unload_started(&self, assembly: AssemblyId) -> HResult {
        if self.state.is_torn_down() {
            return HResult::S_OK;
        }
        self.state
            .counters()
            .record_event(CallbackEvent::AssemblyUnload);

        let removed = self.state.remove_assembly(assembly);
        tracing::debug!(%assembly, modules = removed, "assembly unloaded");
        HResult::S_OK
    }

    fn shutdown(&self) -> HResult {
        if self.state.is_torn_down() {
            return HResult::S_OK;
        }
        self.state.counters().record_event(CallbackEvent::Shutdown);

        if self.state.tear_down() {
            tracing::info!("runtime shutdown, instrumentation stopped");
        }
        HResult::S_OK
    }
}
