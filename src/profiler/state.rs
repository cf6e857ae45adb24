//! Process-wide state shared by all callbacks.
//!
//! [`CallbackState`] exists from attach until detach. Everything in it is reachable from any
//! compiler thread without a global lock: the torn-down flag and counters are atomics, module
//! records live in a [`DashMap`] and each module's claimed methods in a [`SkipMap`].

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    integration::{registry::Candidates, selector::AssemblyIdentity},
    metadata::{
        emitter::{MetadataEmitter, ModuleTokenCache},
        token::Token,
        ModuleMetadata,
    },
    profiler::runtime::{AssemblyId, ModuleId},
};

/// Profiling events counted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum CallbackEvent {
    /// `module_load_finished`
    ModuleLoad,
    /// `module_unload_started`
    ModuleUnload,
    /// `jit_compilation_started`
    JitCompilation,
    /// `assembly_unload_started`
    AssemblyUnload,
    /// `shutdown`
    Shutdown,
}

/// What happened to a method that reached the rewriter stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum MethodOutcome {
    /// A rewritten body was installed
    Instrumented,
    /// The rewriter declined the method's shape
    Declined,
    /// No rule matched, the method was claimed already, or the body was instrumented before
    PassedThrough,
    /// An internal error; the original body was kept
    Failed,
}

/// Lock-free event and outcome counters.
#[derive(Debug)]
pub struct EventCounters {
    events: [AtomicU64; CallbackEvent::COUNT],
    outcomes: [AtomicU64; MethodOutcome::COUNT],
}

impl Default for EventCounters {
    fn default() -> Self {
        EventCounters {
            events: std::array::from_fn(|_| AtomicU64::new(0)),
            outcomes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl EventCounters {
    /// Count an event.
    pub fn record_event(&self, event: CallbackEvent) {
        self.events[event as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Count a method outcome.
    pub fn record_outcome(&self, outcome: MethodOutcome) {
        self.outcomes[outcome as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Current count of an event.
    #[must_use]
    pub fn event(&self, event: CallbackEvent) -> u64 {
        self.events[event as usize].load(Ordering::Relaxed)
    }

    /// Current count of an outcome.
    #[must_use]
    pub fn outcome(&self, outcome: MethodOutcome) -> u64 {
        self.outcomes[outcome as usize].load(Ordering::Relaxed)
    }
}

/// Snapshot of the engine's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineStats {
    events: [u64; CallbackEvent::COUNT],
    outcomes: [u64; MethodOutcome::COUNT],
    /// Modules with a live record
    pub modules: usize,
    /// Methods claimed for rewriting across all live modules
    pub claimed_methods: usize,
}

impl EngineStats {
    /// Count of an event at snapshot time.
    #[must_use]
    pub fn event(&self, event: CallbackEvent) -> u64 {
        self.events[event as usize]
    }

    /// Count of an outcome at snapshot time.
    #[must_use]
    pub fn outcome(&self, outcome: MethodOutcome) -> u64 {
        self.outcomes[outcome as usize]
    }

    /// Methods that received a rewritten body.
    #[must_use]
    pub fn instrumented(&self) -> u64 {
        self.outcome(MethodOutcome::Instrumented)
    }

    /// Methods the rewriter declined.
    #[must_use]
    pub fn declined(&self) -> u64 {
        self.outcome(MethodOutcome::Declined)
    }

    /// Methods passed through unmodified.
    #[must_use]
    pub fn passed_through(&self) -> u64 {
        self.outcome(MethodOutcome::PassedThrough)
    }

    /// Methods that hit an internal error.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.outcome(MethodOutcome::Failed)
    }
}

/// A method claimed for rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedMethod {
    /// Unique claim ticket
    pub ticket: u64,
    /// Integration whose rule selected the method
    pub integration: String,
}

/// Everything known about one loaded module.
pub struct ModuleRecord {
    /// Runtime handle
    pub module: ModuleId,
    /// Owning assembly handle
    pub assembly: AssemblyId,
    /// Owning assembly name and version
    pub identity: AssemblyIdentity,
    /// Rules that may apply to methods of this module
    pub candidates: Candidates,
    /// Import and emit interfaces, only opened for modules with candidates
    pub metadata: Option<Arc<dyn ModuleMetadata>>,
    /// Helper tokens of this module
    pub tokens: Arc<ModuleTokenCache>,
    claims: SkipMap<Token, ClaimedMethod>,
}

impl ModuleRecord {
    /// Create a record with no claimed methods.
    #[must_use]
    pub fn new(
        module: ModuleId,
        assembly: AssemblyId,
        identity: AssemblyIdentity,
        candidates: Candidates,
        metadata: Option<Arc<dyn ModuleMetadata>>,
        tokens: Arc<ModuleTokenCache>,
    ) -> Self {
        ModuleRecord {
            module,
            assembly,
            identity,
            candidates,
            metadata,
            tokens,
            claims: SkipMap::new(),
        }
    }

    /// Returns `true` if some rule may apply to this module.
    #[must_use]
    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    /// Whether `method` has been claimed.
    #[must_use]
    pub fn is_claimed(&self, method: Token) -> bool {
        self.claims.contains_key(&method)
    }

    /// Number of claimed methods.
    #[must_use]
    pub fn claimed(&self) -> usize {
        self.claims.len()
    }

    /// Claim for this module, if it is recorded.
    #[must_use]
    pub fn claim_of(&self, method: Token) -> Option<ClaimedMethod> {
        self.claims.get(&method).map(|entry| entry.value().clone())
    }
}

/// State shared by every callback of one attachment.
pub struct CallbackState {
    torn_down: AtomicBool,
    modules: DashMap<ModuleId, Arc<ModuleRecord>>,
    emitter: MetadataEmitter,
    counters: EventCounters,
    next_ticket: AtomicU64,
}

impl CallbackState {
    /// Fresh state; metadata conflicts are retried up to `emit_retry_limit` times.
    #[must_use]
    pub fn new(emit_retry_limit: usize) -> Self {
        CallbackState {
            torn_down: AtomicBool::new(false),
            modules: DashMap::new(),
            emitter: MetadataEmitter::new(emit_retry_limit),
            counters: EventCounters::default(),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Returns `true` once the attachment has been torn down.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Set the torn-down flag and release all module state.
    ///
    /// After the flag is set, every live module's exclusive section is entered once, so a body
    /// install that was already in progress completes before this returns and none starts
    /// afterwards. Must not be called from inside [`ModuleTokenCache::exclusive`].
    ///
    /// Returns `true` for the call that actually tore the state down.
    pub fn tear_down(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut caches = self.emitter.caches();
        caches.extend(self.modules.iter().map(|entry| entry.value().tokens.clone()));
        for cache in caches {
            if let Err(error) = cache.exclusive(|| Ok(())) {
                tracing::warn!(module = %cache.module(), %error, "module lock poisoned during teardown");
            }
        }

        self.modules.clear();
        self.emitter.clear();
        true
    }

    /// Event counters.
    #[must_use]
    pub fn counters(&self) -> &EventCounters {
        &self.counters
    }

    /// Token cache of a module, created on first use.
    pub fn token_cache(&self, module: ModuleId) -> Arc<ModuleTokenCache> {
        self.emitter.module(module)
    }

    /// Record a loaded module, replacing an older record with the same id.
    ///
    /// Returns `None` once torn down; the record and its token cache are then dropped.
    pub fn insert_module(&self, record: ModuleRecord) -> Option<Arc<ModuleRecord>> {
        let module = record.module;
        if self.is_torn_down() {
            self.emitter.evict(module);
            return None;
        }

        let record = Arc::new(record);
        self.modules.insert(module, record.clone());

        // A teardown racing this insert may have cleared the maps before it landed
        if self.is_torn_down() {
            self.remove_module(module);
            return None;
        }
        Some(record)
    }

    /// Record of a loaded module.
    #[must_use]
    pub fn module(&self, module: ModuleId) -> Option<Arc<ModuleRecord>> {
        self.modules.get(&module).map(|entry| entry.value().clone())
    }

    /// Forget a module and its token cache.
    pub fn remove_module(&self, module: ModuleId) -> Option<Arc<ModuleRecord>> {
        self.emitter.evict(module);
        self.modules.remove(&module).map(|(_, record)| record)
    }

    /// Forget every module of an assembly, returning how many were removed.
    pub fn remove_assembly(&self, assembly: AssemblyId) -> usize {
        let modules: Vec<ModuleId> = self
            .modules
            .iter()
            .filter(|entry| entry.value().assembly == assembly)
            .map(|entry| *entry.key())
            .collect();

        for module in &modules {
            self.remove_module(*module);
        }
        modules.len()
    }

    /// Atomically claim `method` of `record` for rewriting.
    ///
    /// Returns `true` for exactly one caller per method, however many threads race.
    pub fn claim(&self, record: &ModuleRecord, method: Token, integration: &str) -> bool {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let entry = record.claims.get_or_insert(
            method,
            ClaimedMethod {
                ticket,
                integration: integration.to_string(),
            },
        );
        entry.value().ticket == ticket
    }

    /// Snapshot of counters and live state.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            modules: self.modules.len(),
            claimed_methods: self
                .modules
                .iter()
                .map(|entry| entry.value().claimed())
                .sum(),
            ..EngineStats::default()
        };
        for event in CallbackEvent::iter() {
            stats.events[event as usize] = self.counters.event(event);
        }
        for outcome in MethodOutcome::iter() {
            stats.outcomes[outcome as usize] = self.counters.outcome(outcome);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::rule::AssemblyVersion;

    fn record(state: &CallbackState, module: u64, assembly: u64) -> ModuleRecord {
        ModuleRecord::new(
            ModuleId(module),
            AssemblyId(assembly),
            AssemblyIdentity::new("Lib", AssemblyVersion::new(1, 0, 0, 0)),
            Arc::from(Vec::new()),
            None,
            state.token_cache(ModuleId(module)),
        )
    }

    #[test]
    fn claims_are_exclusive() {
        let state = CallbackState::new(0);
        let module = state.insert_module(record(&state, 1, 10)).unwrap();
        let method = Token::new(0x0600_0001);

        assert!(state.claim(&module, method, "A"));
        assert!(!state.claim(&module, method, "A"));
        assert!(module.is_claimed(method));
        assert_eq!(module.claim_of(method).unwrap().integration, "A");
        assert!(state.claim(&module, Token::new(0x0600_0002), "A"));
        assert_eq!(state.stats().claimed_methods, 2);
    }

    #[test]
    fn assembly_unload_removes_its_modules() {
        let state = CallbackState::new(0);
        state.insert_module(record(&state, 1, 10));
        state.insert_module(record(&state, 2, 10));
        state.insert_module(record(&state, 3, 11));

        assert_eq!(state.remove_assembly(AssemblyId(10)), 2);
        assert!(state.module(ModuleId(1)).is_none());
        assert!(state.module(ModuleId(3)).is_some());
        assert_eq!(state.stats().modules, 1);
    }

    #[test]
    fn tear_down_happens_once() {
        let state = CallbackState::new(0);
        state.insert_module(record(&state, 1, 10));
        assert!(!state.is_torn_down());
        assert!(state.tear_down());
        assert!(!state.tear_down());
        assert!(state.is_torn_down());
        assert!(state.module(ModuleId(1)).is_none());
    }

    #[test]
    fn modules_are_not_recorded_after_tear_down() {
        let state = CallbackState::new(0);
        state.tear_down();

        let late = record(&state, 1, 10);
        assert!(state.insert_module(late).is_none());
        assert!(state.module(ModuleId(1)).is_none());
        assert_eq!(state.stats().modules, 0);
        assert!(state.emitter.get(ModuleId(1)).is_none());
    }

    #[test]
    fn tear_down_waits_for_installs_in_progress() {
        use std::{sync::mpsc, thread, time::Duration};

        let state = CallbackState::new(0);
        let module = state.insert_module(record(&state, 1, 10)).unwrap();
        let installed = Arc::new(AtomicBool::new(false));
        let (entered, wait) = mpsc::channel();

        let installer = {
            let installed = installed.clone();
            thread::spawn(move || {
                module.tokens.exclusive(|| {
                    entered.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    installed.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
        };

        wait.recv().unwrap();
        assert!(state.tear_down());
        assert!(installed.load(Ordering::SeqCst));
        installer.join().unwrap().unwrap();
    }

    #[test]
    fn counters_snapshot() {
        let state = CallbackState::new(0);
        state.counters().record_event(CallbackEvent::JitCompilation);
        state.counters().record_event(CallbackEvent::JitCompilation);
        state.counters().record_outcome(MethodOutcome::Declined);

        let stats = state.stats();
        assert_eq!(stats.event(CallbackEvent::JitCompilation), 2);
        assert_eq!(stats.event(CallbackEvent::ModuleLoad), 0);
        assert_eq!(stats.declined(), 1);
        assert_eq!(stats.instrumented(), 0);
    }
}
