//! The read-only table of instrumentation rules.
//!
//! Built once at attach time and shared by every compiler thread afterwards. Two indexes keep
//! the per-method cost low: rules by target assembly name, consulted once per module load,
//! and literal method names, consulted for every compiled method before any signature is
//! decoded.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    integration::{
        rule::InstrumentationRule,
        selector::{AssemblyIdentity, CompiledRule},
    },
    Error, Result,
};

/// Supplies the rules the registry is built from.
///
/// Parsing rule files is left to the embedder; see [`crate::EngineConfig`] for where the
/// operator points the engine at them.
pub trait RuleSource {
    /// Load all rules.
    ///
    /// # Errors
    /// Returns an error if the rules cannot be read.
    fn load(&self) -> Result<Vec<InstrumentationRule>>;
}

/// A fixed, in-memory rule list.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleSource {
    rules: Vec<InstrumentationRule>,
}

impl StaticRuleSource {
    /// Wrap a list of rules.
    #[must_use]
    pub fn new(rules: Vec<InstrumentationRule>) -> Self {
        StaticRuleSource { rules }
    }
}

impl RuleSource for StaticRuleSource {
    fn load(&self) -> Result<Vec<InstrumentationRule>> {
        Ok(self.rules.clone())
    }
}

/// Rule candidates for one assembly.
pub type Candidates = Arc<[Arc<CompiledRule>]>;

/// Immutable rule table with lookup indexes.
#[derive(Debug, Clone)]
pub struct IntegrationRegistry {
    rules: Arc<[Arc<CompiledRule>]>,
    by_assembly: Arc<HashMap<String, Candidates>>,
    method_names: Arc<HashSet<String>>,
    wildcard_methods: bool,
}

impl Default for IntegrationRegistry {
    fn default() -> Self {
        IntegrationRegistry {
            rules: Arc::from(Vec::new()),
            by_assembly: Arc::new(HashMap::new()),
            method_names: Arc::new(HashSet::new()),
            wildcard_methods: false,
        }
    }
}

impl IntegrationRegistry {
    /// Build the registry, dropping rules of disabled integrations.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRule`] for a rule with an empty integration, assembly or
    /// helper name.
    pub fn new(rules: Vec<InstrumentationRule>, disabled: &[String]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        let mut by_assembly: HashMap<String, Vec<Arc<CompiledRule>>> = HashMap::new();
        let mut method_names = HashSet::new();
        let mut wildcard_methods = false;

        for rule in rules {
            validate(&rule)?;
            if disabled
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&rule.integration))
            {
                tracing::info!(integration = %rule.integration, "integration disabled");
                continue;
            }

            if rule.method_pattern.is_literal() {
                method_names.insert(rule.method_pattern.as_str().to_string());
            } else {
                wildcard_methods = true;
            }

            let rule = Arc::new(CompiledRule::compile(rule));
            by_assembly
                .entry(rule.rule.assembly.clone())
                .or_default()
                .push(rule.clone());
            compiled.push(rule);
        }

        tracing::debug!(
            rules = compiled.len(),
            assemblies = by_assembly.len(),
            "built integration registry"
        );

        Ok(IntegrationRegistry {
            rules: Arc::from(compiled),
            by_assembly: Arc::new(
                by_assembly
                    .into_iter()
                    .map(|(name, rules)| (name, Arc::from(rules)))
                    .collect(),
            ),
            method_names: Arc::new(method_names),
            wildcard_methods,
        })
    }

    /// Build the registry from a [`RuleSource`].
    ///
    /// # Errors
    /// Returns the source's error, or [`Error::InvalidRule`] for an invalid rule.
    pub fn from_source(source: &dyn RuleSource, disabled: &[String]) -> Result<Self> {
        Self::new(source.load()?, disabled)
    }

    /// All active rules in registration order.
    #[must_use]
    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    /// Number of active rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if no rule is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules targeting the given assembly whose version range contains its version.
    #[must_use]
    pub fn candidates_for(&self, assembly: &AssemblyIdentity) -> Candidates {
        match self.by_assembly.get(&assembly.name) {
            Some(rules) if rules.iter().all(|r| r.rule.versions.contains(&assembly.version)) => {
                rules.clone()
            }
            Some(rules) => rules
                .iter()
                .filter(|r| r.rule.versions.contains(&assembly.version))
                .cloned()
                .collect(),
            None => Arc::from(Vec::new()),
        }
    }

    /// Cheap prefilter: `false` means no candidate can match a method with this name.
    #[must_use]
    pub fn might_match_method(&self, candidates: &[Arc<CompiledRule>], name: &str) -> bool {
        if candidates.is_empty() {
            return false;
        }
        if self.method_names.contains(name) {
            return true;
        }
        self.wildcard_methods
            && candidates
                .iter()
                .any(|candidate| candidate.rule.method_pattern.matches(name))
    }
}

fn validate(rule: &InstrumentationRule) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidRule {
        integration: rule.integration.clone(),
        reason: reason.to_string(),
    };

    if rule.integration.trim().is_empty() {
        return Err(invalid("empty integration name"));
    }
    if rule.assembly.trim().is_empty() {
        return Err(invalid("empty assembly name"));
    }
    if rule.helper.assembly.is_empty() || rule.helper.type_name.is_empty() {
        return Err(invalid("missing helper"));
    }
    Ok(())
}
