//! Which methods get instrumented, and how.
//!
//! - [`rule`] - Instrumentation rules, name patterns and version ranges
//! - [`selector`] - Method descriptions and composable rule matchers
//! - [`registry`] - The immutable rule table built at attach time

pub mod registry;
pub mod rule;
pub mod selector;

pub use registry::{IntegrationRegistry, RuleSource, StaticRuleSource};
pub use rule::{HelperRef, InstrumentationPolicy, InstrumentationRule};
pub use selector::{AssemblyIdentity, MethodDescriptor, MethodIdentity, TypeHierarchy};
