//! Instrumentation rules: what to instrument and with which helper.
//!
//! A rule names a target (assembly and version range, type and method name patterns,
//! optional signature constraints and token pins), the managed helper whose `Enter`/`Exit`
//! methods get called, and an [`InstrumentationPolicy`] choosing which calls are injected.
//! Rules are immutable once built and are validated by [`RuleBuilder::build`].
//!
//! # Examples
//!
//! ```rust
//! use dotweave::integration::rule::{HelperRef, InstrumentationPolicy, InstrumentationRule};
//!
//! let rule = InstrumentationRule::builder("GraphQL")
//!     .assembly("GraphQL", "2.3.0", "2.*.*")
//!     .type_name("GraphQL.Execution.ExecutionStrategy")
//!     .method("ExecuteAsync")
//!     .helper(HelperRef::new(
//!         "OpenTelemetry.AutoInstrumentation",
//!         "OpenTelemetry.AutoInstrumentation.GraphQL.ExecuteAsyncIntegration",
//!     ))
//!     .policy(InstrumentationPolicy::all())
//!     .build()?;
//!
//! assert!(rule.type_pattern.matches("GraphQL.Execution.ExecutionStrategy"));
//! # Ok::<(), dotweave::Error>(())
//! ```

use std::{fmt, str::FromStr};

use bitflags::bitflags;

use crate::{metadata::token::Token, Error, Result};

bitflags! {
    /// Which helper calls a rule injects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstrumentationPolicy: u8 {
        /// Call the entry helper before the original body
        const ENTRY = 0x1;
        /// Call the exit helper on every way out of the method
        const EXIT = 0x2;
        /// Hand a thrown exception to the exit helper
        const EXCEPTION = 0x4;
    }
}

/// A four-part assembly version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct AssemblyVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build number
    pub build: u16,
    /// Revision number
    pub revision: u16,
}

impl AssemblyVersion {
    /// Create a version from its four components.
    #[must_use]
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        AssemblyVersion {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Parse a version bound, where `*` or a missing component stands for `wildcard`.
    fn parse_bound(text: &str, wildcard: u16) -> Result<Self> {
        let invalid = || Error::InvalidConfig {
            key: "version".to_string(),
            value: text.to_string(),
        };

        let mut parts = [wildcard; 4];
        let mut count = 0;
        for (index, part) in text.trim().split('.').enumerate() {
            if index >= 4 {
                return Err(invalid());
            }
            parts[index] = match part {
                "*" => wildcard,
                digits => digits.parse::<u16>().map_err(|_| invalid())?,
            };
            count += 1;
        }
        if count == 0 || text.trim().is_empty() {
            return Err(invalid());
        }

        Ok(AssemblyVersion::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl FromStr for AssemblyVersion {
    type Err = Error;

    /// Parse `major[.minor[.build[.revision]]]`; missing components are zero.
    fn from_str(text: &str) -> Result<Self> {
        Self::parse_bound(text, 0)
    }
}

impl fmt::Display for AssemblyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Inclusive range of assembly versions.
///
/// `*` components widen the bound: `"2.*.*"` as a maximum accepts every `2.x.y.z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    /// Lowest accepted version
    pub min: AssemblyVersion,
    /// Highest accepted version
    pub max: AssemblyVersion,
}

impl VersionRange {
    /// Every version.
    #[must_use]
    pub fn any() -> Self {
        VersionRange {
            min: AssemblyVersion::default(),
            max: AssemblyVersion::new(u16::MAX, u16::MAX, u16::MAX, u16::MAX),
        }
    }

    /// Parse a range from its textual bounds.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for unparsable bounds.
    pub fn parse(min: &str, max: &str) -> Result<Self> {
        Ok(VersionRange {
            min: AssemblyVersion::parse_bound(min, 0)?,
            max: AssemblyVersion::parse_bound(max, u16::MAX)?,
        })
    }

    /// Returns `true` if `version` lies within the range.
    #[must_use]
    pub fn contains(&self, version: &AssemblyVersion) -> bool {
        self.min <= *version && *version <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// `**`: zero or more whole segments
    Any,
    /// Literal text with `*` wildcards confined to the segment
    Glob(String),
}

/// Dotted name pattern.
///
/// `*` matches any run of characters within one dot-separated segment; a segment consisting
/// of `**` matches any number of segments, including none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    source: String,
    segments: Vec<Segment>,
}

impl NamePattern {
    /// Compile a pattern.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty pattern.
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.trim().is_empty() {
            return Err(Error::InvalidConfig {
                key: "pattern".to_string(),
                value: pattern.to_string(),
            });
        }

        let segments = pattern
            .split('.')
            .map(|segment| match segment {
                "**" => Segment::Any,
                other => Segment::Glob(other.to_string()),
            })
            .collect();

        Ok(NamePattern {
            source: pattern.to_string(),
            segments,
        })
    }

    /// Returns `true` if the pattern contains no wildcard.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        !self.source.contains('*')
    }

    /// The pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a dotted name.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        if self.is_literal() {
            return self.source == name;
        }

        let parts: Vec<&str> = name.split('.').collect();
        match_segments(&self.segments, &parts)
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::Any, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((Segment::Glob(glob), rest)) => match parts.split_first() {
            Some((part, remaining)) => glob_matches(glob, part) && match_segments(rest, remaining),
            None => false,
        },
    }
}

/// `*`-only glob match within a single segment.
fn glob_matches(glob: &str, text: &str) -> bool {
    let mut pieces = glob.split('*');
    let Some(first) = pieces.next() else {
        return text.is_empty();
    };
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };

    let pieces: Vec<&str> = pieces.collect();
    let Some((last, middle)) = pieces.split_last() else {
        // No `*` at all
        return remaining.is_empty();
    };

    for piece in middle {
        match remaining.find(piece) {
            Some(index) => remaining = &remaining[index + piece.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

/// Constraint on one parameter or on the return type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamPattern {
    /// Any type
    Any,
    /// Exactly this type name
    Exact(String),
    /// Any type assignable to this type name
    AssignableTo(String),
}

impl ParamPattern {
    /// Parse the textual form used by rule sources: `_` for any type, a `+` prefix for
    /// "assignable to", otherwise an exact type name.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "_" | "" => ParamPattern::Any,
            other => match other.strip_prefix('+') {
                Some(base) => ParamPattern::AssignableTo(base.to_string()),
                None => ParamPattern::Exact(other.to_string()),
            },
        }
    }
}

impl fmt::Display for ParamPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamPattern::Any => f.write_str("_"),
            ParamPattern::Exact(name) => f.write_str(name),
            ParamPattern::AssignableTo(name) => write!(f, "+{name}"),
        }
    }
}

/// The managed helper type whose static methods are called by injected code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HelperRef {
    /// Simple name of the helper's assembly
    pub assembly: String,
    /// Namespace-qualified name of the helper type
    pub type_name: String,
    /// Entry method name, `static int64 (int32)`
    pub enter_method: String,
    /// Exit method name, `static void ([T,] object, int64)`
    pub exit_method: String,
}

impl HelperRef {
    /// Helper using the conventional `OnMethodBegin` / `OnMethodEnd` method names.
    #[must_use]
    pub fn new(assembly: &str, type_name: &str) -> Self {
        HelperRef {
            assembly: assembly.to_string(),
            type_name: type_name.to_string(),
            enter_method: "OnMethodBegin".to_string(),
            exit_method: "OnMethodEnd".to_string(),
        }
    }

    /// Override the entry and exit method names.
    #[must_use]
    pub fn with_methods(mut self, enter: &str, exit: &str) -> Self {
        self.enter_method = enter.to_string();
        self.exit_method = exit.to_string();
        self
    }
}

/// One validated instrumentation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationRule {
    /// Integration name, used by operators to disable rules
    pub integration: String,
    /// Target assembly simple name
    pub assembly: String,
    /// Accepted target assembly versions
    pub versions: VersionRange,
    /// Namespace-qualified type name pattern
    pub type_pattern: NamePattern,
    /// Method name pattern
    pub method_pattern: NamePattern,
    /// Return type constraint
    pub return_type: ParamPattern,
    /// Parameter constraints; when present the arity must match
    pub parameters: Option<Vec<ParamPattern>>,
    /// Exact `TypeDef` pin
    pub type_token: Option<Token>,
    /// Exact `MethodDef` pin
    pub method_token: Option<Token>,
    /// Helper to call
    pub helper: HelperRef,
    /// Calls to inject
    pub policy: InstrumentationPolicy,
}

impl InstrumentationRule {
    /// Start building a rule for the named integration.
    #[must_use]
    pub fn builder(integration: &str) -> RuleBuilder {
        RuleBuilder {
            integration: integration.to_string(),
            assembly: None,
            type_pattern: None,
            method_pattern: None,
            return_type: ParamPattern::Any,
            parameters: None,
            type_token: None,
            method_token: None,
            helper: None,
            policy: InstrumentationPolicy::all(),
        }
    }
}

impl fmt::Display for InstrumentationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: [{}] {}::{}",
            self.integration, self.assembly, self.type_pattern, self.method_pattern
        )
    }
}

/// Builder for [`InstrumentationRule`]; patterns and versions are checked by `build`.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    integration: String,
    assembly: Option<(String, String, String)>,
    type_pattern: Option<String>,
    method_pattern: Option<String>,
    return_type: ParamPattern,
    parameters: Option<Vec<ParamPattern>>,
    type_token: Option<Token>,
    method_token: Option<Token>,
    helper: Option<HelperRef>,
    policy: InstrumentationPolicy,
}

impl RuleBuilder {
    /// Target assembly and inclusive version bounds.
    #[must_use]
    pub fn assembly(mut self, name: &str, min_version: &str, max_version: &str) -> Self {
        self.assembly = Some((
            name.to_string(),
            min_version.to_string(),
            max_version.to_string(),
        ));
        self
    }

    /// Type name pattern.
    #[must_use]
    pub fn type_name(mut self, pattern: &str) -> Self {
        self.type_pattern = Some(pattern.to_string());
        self
    }

    /// Method name pattern.
    #[must_use]
    pub fn method(mut self, pattern: &str) -> Self {
        self.method_pattern = Some(pattern.to_string());
        self
    }

    /// Return type constraint.
    #[must_use]
    pub fn returns(mut self, pattern: ParamPattern) -> Self {
        self.return_type = pattern;
        self
    }

    /// Parameter constraints.
    #[must_use]
    pub fn parameters(mut self, parameters: Vec<ParamPattern>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Pin the rule to one `TypeDef`.
    #[must_use]
    pub fn pin_type(mut self, token: Token) -> Self {
        self.type_token = Some(token);
        self
    }

    /// Pin the rule to one `MethodDef`.
    #[must_use]
    pub fn pin_method(mut self, token: Token) -> Self {
        self.method_token = Some(token);
        self
    }

    /// Helper to call.
    #[must_use]
    pub fn helper(mut self, helper: HelperRef) -> Self {
        self.helper = Some(helper);
        self
    }

    /// Calls to inject.
    #[must_use]
    pub fn policy(mut self, policy: InstrumentationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate and build the rule.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRule`] for a missing or empty name, pattern or helper, for
    /// unparsable versions, and for policies without `ENTRY`, or with `EXCEPTION` but no
    /// `EXIT`.
    pub fn build(self) -> Result<InstrumentationRule> {
        let integration = self.integration;
        let invalid = |reason: &str| Error::InvalidRule {
            integration: integration.clone(),
            reason: reason.to_string(),
        };

        if integration.trim().is_empty() {
            return Err(invalid("empty integration name"));
        }

        let (assembly, min, max) = self.assembly.ok_or_else(|| invalid("missing assembly"))?;
        if assembly.trim().is_empty() {
            return Err(invalid("empty assembly name"));
        }
        let versions = VersionRange::parse(&min, &max)
            .map_err(|_| invalid(&format!("invalid version range {min}..{max}")))?;
        if versions.min > versions.max {
            return Err(invalid("minimum version exceeds maximum"));
        }

        let type_pattern = self
            .type_pattern
            .as_deref()
            .map(NamePattern::parse)
            .transpose()
            .map_err(|_| invalid("empty type pattern"))?
            .ok_or_else(|| invalid("missing type pattern"))?;
        let method_pattern = self
            .method_pattern
            .as_deref()
            .map(NamePattern::parse)
            .transpose()
            .map_err(|_| invalid("empty method pattern"))?
            .ok_or_else(|| invalid("missing method pattern"))?;

        let helper = self.helper.ok_or_else(|| invalid("missing helper"))?;
        if helper.assembly.is_empty()
            || helper.type_name.is_empty()
            || helper.enter_method.is_empty()
            || helper.exit_method.is_empty()
        {
            return Err(invalid("incomplete helper reference"));
        }

        if !self.policy.contains(InstrumentationPolicy::ENTRY) {
            return Err(invalid("policy without ENTRY"));
        }
        if self.policy.contains(InstrumentationPolicy::EXCEPTION)
            && !self.policy.contains(InstrumentationPolicy::EXIT)
        {
            return Err(invalid("EXCEPTION requires EXIT"));
        }

        Ok(InstrumentationRule {
            integration,
            assembly,
            versions,
            type_pattern,
            method_pattern,
            return_type: self.return_type,
            parameters: self.parameters,
            type_token: self.type_token,
            method_token: self.method_token,
            helper,
            policy: self.policy,
        })
    }
}
