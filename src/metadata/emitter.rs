//! Lazily emitted metadata for injected helper calls.
//!
//! Injected code references rows that usually do not exist in the instrumented module: an
//! `AssemblyRef` for the helper assembly, a `TypeRef` for the helper type, `MemberRef`s for its
//! entry and exit methods, `System.Object` for the synthesized catch clause and a
//! `StandAloneSig` for every extended local signature. [`ModuleTokenCache`] creates each of
//! them once per module and hands out the cached token afterwards.
//!
//! # Concurrency
//!
//! Lookups go through a [`DashMap`] and never block. A miss takes the module's writer lock,
//! checks the cache again and only then calls the runtime, so two compiler threads racing for
//! the same helper still produce exactly one row. The writer lock also serializes
//! `set_il_function_body` for the module through [`ModuleTokenCache::exclusive`]; caches of
//! different modules share nothing.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::{
    il::rewriter::HelperTokenSource,
    integration::rule::HelperRef,
    metadata::{
        signature::{MethodSignature, TypeSig},
        token::Token,
        MetadataEmit, ModuleMetadata,
    },
    profiler::runtime::ModuleId,
    Error, Result,
};

/// Identity of an emitted metadata row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HelperKey {
    /// `AssemblyRef` by simple name
    AssemblyRef(String),
    /// `TypeRef` by resolution scope and full name
    TypeRef {
        /// Resolution scope, usually an `AssemblyRef`
        scope: Token,
        /// Namespace-qualified type name
        name: String,
    },
    /// `MemberRef` by parent, name and signature blob
    MemberRef {
        /// Declaring type
        parent: Token,
        /// Member name
        name: String,
        /// Signature blob
        signature: Vec<u8>,
    },
    /// `StandAloneSig` holding a local variable signature
    LocalSignature(Vec<u8>),
}

impl HelperKey {
    fn define<E: MetadataEmit + ?Sized>(&self, emit: &E) -> Result<Token> {
        match self {
            HelperKey::AssemblyRef(name) => emit.define_assembly_ref(name),
            HelperKey::TypeRef { scope, name } => emit.define_type_ref(*scope, name),
            HelperKey::MemberRef {
                parent,
                name,
                signature,
            } => emit.define_member_ref(*parent, name, signature),
            HelperKey::LocalSignature(blob) => emit.define_standalone_sig(blob),
        }
    }
}

/// One successful emission, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmissionRecord {
    /// What was emitted
    pub key: HelperKey,
    /// Token the runtime assigned
    pub token: Token,
    /// Number of attempts, 1 unless conflicts were retried
    pub attempts: usize,
}

/// Helper tokens of one module.
pub struct ModuleTokenCache {
    module: ModuleId,
    tokens: DashMap<HelperKey, Token>,
    writer: Mutex<()>,
    log: boxcar::Vec<EmissionRecord>,
    retry_limit: usize,
}

impl ModuleTokenCache {
    /// Create an empty cache; conflicts are retried up to `retry_limit` times.
    #[must_use]
    pub fn new(module: ModuleId, retry_limit: usize) -> Self {
        ModuleTokenCache {
            module,
            tokens: DashMap::new(),
            writer: Mutex::new(()),
            log: boxcar::Vec::new(),
            retry_limit,
        }
    }

    /// The module this cache belongs to.
    #[must_use]
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Cached token for `key`, without emitting.
    #[must_use]
    pub fn get(&self, key: &HelperKey) -> Option<Token> {
        self.tokens.get(key).map(|entry| *entry.value())
    }

    /// Cached token for `key`, emitting the row on first request.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the writer lock is poisoned, the last
    /// [`Error::MetadataEmissionConflict`] once the retry limit is exhausted, or any other
    /// emission error unchanged.
    pub fn get_or_emit<E: MetadataEmit + ?Sized>(&self, key: HelperKey, emit: &E) -> Result<Token> {
        if let Some(token) = self.get(&key) {
            return Ok(token);
        }

        let _guard = lock!(self.writer)?;
        if let Some(token) = self.get(&key) {
            return Ok(token);
        }

        let mut attempts = 0;
        let token = loop {
            attempts += 1;
            match key.define(emit) {
                Ok(token) => break token,
                Err(Error::MetadataEmissionConflict(what)) if attempts <= self.retry_limit => {
                    tracing::debug!(module = %self.module, attempts, %what, "retrying metadata emission");
                }
                Err(error) => return Err(error),
            }
        };

        tracing::trace!(module = %self.module, %token, ?key, "emitted helper metadata");
        self.tokens.insert(key.clone(), token);
        self.log.push(EmissionRecord {
            key,
            token,
            attempts,
        });
        Ok(token)
    }

    /// Run `f` inside the module's exclusive section.
    ///
    /// `f` must not call back into [`ModuleTokenCache::get_or_emit`] of the same module.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the lock is poisoned, otherwise the result of `f`.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _guard = lock!(self.writer)?;
        f()
    }

    /// Every emission in the order it happened.
    pub fn emissions(&self) -> impl Iterator<Item = &EmissionRecord> + '_ {
        self.log.iter().map(|(_, record)| record)
    }

    /// Number of rows emitted so far.
    #[must_use]
    pub fn emission_count(&self) -> usize {
        self.log.count()
    }

    /// Token source for one helper, used by the rewriter.
    pub fn helper_tokens<'a>(
        &'a self,
        helper: &'a HelperRef,
        metadata: &'a dyn ModuleMetadata,
    ) -> HelperTokens<'a> {
        HelperTokens {
            cache: self,
            helper,
            metadata,
        }
    }
}

/// [`HelperTokenSource`] backed by a module's token cache.
pub struct HelperTokens<'a> {
    cache: &'a ModuleTokenCache,
    helper: &'a HelperRef,
    metadata: &'a dyn ModuleMetadata,
}

impl HelperTokens<'_> {
    fn helper_type(&self) -> Result<Token> {
        let scope = self.cache.get_or_emit(
            HelperKey::AssemblyRef(self.helper.assembly.clone()),
            self.metadata,
        )?;
        self.cache.get_or_emit(
            HelperKey::TypeRef {
                scope,
                name: self.helper.type_name.clone(),
            },
            self.metadata,
        )
    }

    fn member(&self, name: &str, signature: &MethodSignature) -> Result<Token> {
        let parent = self.helper_type()?;
        self.cache.get_or_emit(
            HelperKey::MemberRef {
                parent,
                name: name.to_string(),
                signature: signature.encode()?,
            },
            self.metadata,
        )
    }
}

impl HelperTokenSource for HelperTokens<'_> {
    fn enter(&self) -> Result<Token> {
        let signature = MethodSignature::static_method(TypeSig::I8, vec![TypeSig::I4]);
        self.member(&self.helper.enter_method, &signature)
    }

    fn exit(&self, ret: Option<&TypeSig>) -> Result<Token> {
        let mut params = Vec::with_capacity(3);
        if let Some(ret) = ret {
            params.push(ret.clone());
        }
        params.push(TypeSig::Object);
        params.push(TypeSig::I8);

        let signature = MethodSignature::static_method(TypeSig::Void, params);
        self.member(&self.helper.exit_method, &signature)
    }

    fn exception_type(&self) -> Result<Token> {
        let scope = self.metadata.core_library()?;
        self.cache.get_or_emit(
            HelperKey::TypeRef {
                scope,
                name: "System.Object".to_string(),
            },
            self.metadata,
        )
    }

    fn local_signature(&self, blob: &[u8]) -> Result<Token> {
        self.cache
            .get_or_emit(HelperKey::LocalSignature(blob.to_vec()), self.metadata)
    }
}

/// Token caches of all loaded modules.
pub struct MetadataEmitter {
    caches: DashMap<ModuleId, Arc<ModuleTokenCache>>,
    retry_limit: usize,
}

impl MetadataEmitter {
    /// Create an emitter whose caches retry conflicts up to `retry_limit` times.
    #[must_use]
    pub fn new(retry_limit: usize) -> Self {
        MetadataEmitter {
            caches: DashMap::new(),
            retry_limit,
        }
    }

    /// Cache of `module`, created on first use.
    pub fn module(&self, module: ModuleId) -> Arc<ModuleTokenCache> {
        self.caches
            .entry(module)
            .or_insert_with(|| Arc::new(ModuleTokenCache::new(module, self.retry_limit)))
            .value()
            .clone()
    }

    /// Cache of `module` if one exists.
    #[must_use]
    pub fn get(&self, module: ModuleId) -> Option<Arc<ModuleTokenCache>> {
        self.caches.get(&module).map(|entry| entry.value().clone())
    }

    /// Every live cache.
    #[must_use]
    pub fn caches(&self) -> Vec<Arc<ModuleTokenCache>> {
        self.caches.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Drop the cache of an unloaded module.
    pub fn evict(&self, module: ModuleId) -> Option<Arc<ModuleTokenCache>> {
        self.caches.remove(&module).map(|(_, cache)| cache)
    }

    /// Number of modules with a cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Returns `true` if no module has a cache.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Drop every cache.
    pub fn clear(&self) {
        self.caches.clear();
    }
}
