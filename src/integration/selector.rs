//! Matching methods against instrumentation rules.
//!
//! Each rule is compiled into a list of [`RuleMatcher`]s, cheapest first. A method is
//! described once per compilation request ([`MethodDescriptor`]) and the candidate rules of
//! its assembly are tried in registry order; the first rule whose matchers all accept wins.

use std::{fmt, sync::Arc};

use crate::{
    integration::rule::{
        AssemblyVersion, InstrumentationRule, NamePattern, ParamPattern, VersionRange,
    },
    metadata::{
        signature::{MethodSignature, TypeSig},
        token::Token,
        MetadataImport, MethodProps,
    },
    profiler::runtime::ModuleId,
    Result,
};

/// Key of a method within the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    /// Owning module
    pub module: ModuleId,
    /// Declaring `TypeDef`
    pub type_token: Token,
    /// The `MethodDef`
    pub method_token: Token,
    /// Raw signature blob
    pub signature: Vec<u8>,
}

/// Name and version of an assembly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssemblyIdentity {
    /// Simple name
    pub name: String,
    /// Four-part version
    pub version: AssemblyVersion,
}

impl AssemblyIdentity {
    /// Create an identity.
    #[must_use]
    pub fn new(name: &str, version: AssemblyVersion) -> Self {
        AssemblyIdentity {
            name: name.to_string(),
            version,
        }
    }
}

impl fmt::Display for AssemblyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Version={}", self.name, self.version)
    }
}

/// A resolved type name from a method signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Namespace-qualified name
    pub name: String,
    /// Whether values of the type are object references
    pub is_reference: bool,
}

/// Human-readable view of a method, used for rule matching and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Namespace-qualified declaring type name
    pub type_name: String,
    /// Method name
    pub method_name: String,
    /// Decoded signature
    pub signature: MethodSignature,
    /// Return type
    pub return_type: TypeDescriptor,
    /// Parameter types, without `this`
    pub parameters: Vec<TypeDescriptor>,
    /// Owning assembly
    pub assembly: AssemblyIdentity,
}

impl MethodDescriptor {
    /// Describe a method from its metadata.
    ///
    /// # Errors
    /// Returns an error if the signature cannot be decoded or a type token cannot be
    /// resolved.
    pub fn resolve<M: MetadataImport + ?Sized>(
        metadata: &M,
        props: &MethodProps,
        assembly: AssemblyIdentity,
    ) -> Result<Self> {
        let signature = MethodSignature::parse(&props.signature)?;
        let describe = |sig: &TypeSig| -> Result<TypeDescriptor> {
            Ok(TypeDescriptor {
                name: sig.display_name(metadata)?,
                is_reference: sig.is_reference_type(),
            })
        };

        let return_type = describe(&signature.ret)?;
        let mut parameters = Vec::with_capacity(signature.params.len());
        for param in &signature.params {
            parameters.push(describe(param)?);
        }

        Ok(MethodDescriptor {
            type_name: metadata.type_name(props.type_token)?,
            method_name: props.name.clone(),
            signature,
            return_type,
            parameters,
            assembly,
        })
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();
        write!(
            f,
            "{} {}::{}({})",
            self.return_type.name,
            self.type_name,
            self.method_name,
            params.join(", ")
        )
    }
}

/// Answers assignability questions between named types.
pub trait TypeHierarchy: Send + Sync {
    /// Returns `true` if a value of type `from` can be assigned to a location of type `to`,
    /// through inheritance or interface implementation.
    fn is_assignable(&self, from: &str, to: &str) -> bool;
}

/// Everything a matcher may look at.
#[derive(Clone, Copy)]
pub struct SelectionContext<'a> {
    /// The method's identity
    pub identity: &'a MethodIdentity,
    /// The method's resolved description
    pub descriptor: &'a MethodDescriptor,
    /// Optional assignability oracle
    pub hierarchy: Option<&'a dyn TypeHierarchy>,
}

impl SelectionContext<'_> {
    fn accepts(&self, pattern: &ParamPattern, actual: &TypeDescriptor) -> bool {
        match pattern {
            ParamPattern::Any => true,
            ParamPattern::Exact(name) => *name == actual.name,
            ParamPattern::AssignableTo(name) => {
                *name == actual.name
                    || (name == "System.Object" && actual.is_reference)
                    || self
                        .hierarchy
                        .is_some_and(|hierarchy| hierarchy.is_assignable(&actual.name, name))
            }
        }
    }
}

/// One composable condition of a rule.
pub trait RuleMatcher: Send + Sync {
    /// Returns `true` if the method satisfies the condition.
    fn matches(&self, context: &SelectionContext) -> bool;

    /// Description for logs.
    fn description(&self) -> String;
}

/// Exact token pins.
pub struct TokenMatcher {
    type_token: Option<Token>,
    method_token: Option<Token>,
}

impl RuleMatcher for TokenMatcher {
    fn matches(&self, context: &SelectionContext) -> bool {
        self.type_token
            .is_none_or(|token| token == context.identity.type_token)
            && self
                .method_token
                .is_none_or(|token| token == context.identity.method_token)
    }

    fn description(&self) -> String {
        format!("tokens {:?}/{:?}", self.type_token, self.method_token)
    }
}

/// Assembly name and version range.
pub struct AssemblyMatcher {
    name: String,
    versions: VersionRange,
}

impl RuleMatcher for AssemblyMatcher {
    fn matches(&self, context: &SelectionContext) -> bool {
        let assembly = &context.descriptor.assembly;
        assembly.name == self.name && self.versions.contains(&assembly.version)
    }

    fn description(&self) -> String {
        format!(
            "assembly {} [{}, {}]",
            self.name, self.versions.min, self.versions.max
        )
    }
}

/// Declaring type name pattern.
pub struct TypeNameMatcher(NamePattern);

impl RuleMatcher for TypeNameMatcher {
    fn matches(&self, context: &SelectionContext) -> bool {
        self.0.matches(&context.descriptor.type_name)
    }

    fn description(&self) -> String {
        format!("type {}", self.0)
    }
}

/// Method name pattern.
pub struct MethodNameMatcher(NamePattern);

impl RuleMatcher for MethodNameMatcher {
    fn matches(&self, context: &SelectionContext) -> bool {
        self.0.matches(&context.descriptor.method_name)
    }

    fn description(&self) -> String {
        format!("method {}", self.0)
    }
}

/// Return type and parameter constraints.
pub struct SignatureMatcher {
    return_type: ParamPattern,
    parameters: Option<Vec<ParamPattern>>,
}

impl RuleMatcher for SignatureMatcher {
    fn matches(&self, context: &SelectionContext) -> bool {
        let descriptor = context.descriptor;
        if !context.accepts(&self.return_type, &descriptor.return_type) {
            return false;
        }

        match &self.parameters {
            None => true,
            Some(patterns) => {
                patterns.len() == descriptor.parameters.len()
                    && patterns
                        .iter()
                        .zip(&descriptor.parameters)
                        .all(|(pattern, actual)| context.accepts(pattern, actual))
            }
        }
    }

    fn description(&self) -> String {
        match &self.parameters {
            Some(parameters) => {
                let parameters: Vec<String> =
                    parameters.iter().map(ToString::to_string).collect();
                format!("signature {} ({})", self.return_type, parameters.join(", "))
            }
            None => format!("signature {} (..)", self.return_type),
        }
    }
}

/// A rule together with its matchers.
pub struct CompiledRule {
    /// The rule
    pub rule: Arc<InstrumentationRule>,
    matchers: Vec<Box<dyn RuleMatcher>>,
}

impl CompiledRule {
    /// Compile a rule into matchers, cheapest checks first.
    #[must_use]
    pub fn compile(rule: InstrumentationRule) -> Self {
        let mut matchers: Vec<Box<dyn RuleMatcher>> = Vec::with_capacity(5);
        if rule.type_token.is_some() || rule.method_token.is_some() {
            matchers.push(Box::new(TokenMatcher {
                type_token: rule.type_token,
                method_token: rule.method_token,
            }));
        }
        matchers.push(Box::new(MethodNameMatcher(rule.method_pattern.clone())));
        matchers.push(Box::new(TypeNameMatcher(rule.type_pattern.clone())));
        matchers.push(Box::new(AssemblyMatcher {
            name: rule.assembly.clone(),
            versions: rule.versions,
        }));
        if rule.return_type != ParamPattern::Any || rule.parameters.is_some() {
            matchers.push(Box::new(SignatureMatcher {
                return_type: rule.return_type.clone(),
                parameters: rule.parameters.clone(),
            }));
        }

        CompiledRule {
            rule: Arc::new(rule),
            matchers,
        }
    }

    /// Returns `true` if every matcher accepts the method.
    #[must_use]
    pub fn matches(&self, context: &SelectionContext) -> bool {
        for matcher in &self.matchers {
            if !matcher.matches(context) {
                tracing::trace!(
                    integration = %self.rule.integration,
                    rejected_by = %matcher.description(),
                    "rule did not match"
                );
                return false;
            }
        }
        true
    }

    /// Descriptions of all matchers.
    #[must_use]
    pub fn describe(&self) -> Vec<String> {
        self.matchers.iter().map(|m| m.description()).collect()
    }
}

impl fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRule")
            .field("rule", &self.rule)
            .field("matchers", &self.describe())
            .finish()
    }
}

/// First candidate rule matching the method, if any.
pub fn select<'r>(
    candidates: &'r [Arc<CompiledRule>],
    context: &SelectionContext,
) -> Option<&'r Arc<CompiledRule>> {
    candidates.iter().find(|candidate| candidate.matches(context))
}
