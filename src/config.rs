//! Engine configuration
//!
//! Operators configure the engine through environment variables read by
//! [`EngineConfig::from_env`]; embedders and tests can build an [`EngineConfig`] directly or
//! start from one of the presets.

use std::{path::PathBuf, str::FromStr};

use crate::{Error, Result};

/// Environment variable enabling the engine (`1`/`true`)
pub const ENV_ENABLED: &str = "DOTWEAVE_PROFILER_ENABLED";
/// Environment variable naming the rule file handed to the rule source
pub const ENV_INTEGRATIONS_FILE: &str = "DOTWEAVE_INTEGRATIONS_FILE";
/// Environment variable with comma-separated integration names to disable
pub const ENV_DISABLED_INTEGRATIONS: &str = "DOTWEAVE_DISABLED_INTEGRATIONS";
/// Environment variable with the expected runtime version prefix
pub const ENV_RUNTIME_VERSION: &str = "DOTWEAVE_RUNTIME_VERSION";
/// Environment variable bounding branch relayout passes
pub const ENV_MAX_LAYOUT_PASSES: &str = "DOTWEAVE_MAX_LAYOUT_PASSES";
/// Environment variable selecting the verification mode
pub const ENV_VERIFY: &str = "DOTWEAVE_VERIFY";

/// How rewritten bodies are checked before they are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum VerifyMode {
    /// No verification
    Off,
    /// Branch targets and exception ranges only
    #[default]
    Structural,
    /// Structural checks plus a stack-depth simulation resolving every call site
    Full,
}

impl FromStr for VerifyMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" => Ok(VerifyMode::Off),
            "structural" => Ok(VerifyMode::Structural),
            "full" => Ok(VerifyMode::Full),
            _ => Err(Error::InvalidConfig {
                key: ENV_VERIFY.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Configuration of one engine attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Master switch; a disabled engine refuses to attach
    pub enabled: bool,

    /// Location of the rule file, interpreted by the embedder's rule source
    pub integrations_file: Option<PathBuf>,

    /// Integration names whose rules are dropped from the registry (case-insensitive)
    pub disabled_integrations: Vec<String>,

    /// Expected runtime version prefix, e.g. `8` or `8.0`
    pub runtime_version_hint: Option<String>,

    /// Maximum number of branch relayout passes per method (default: 32)
    pub max_layout_passes: usize,

    /// How often a conflicting metadata emission is retried (default: 3)
    pub emit_retry_limit: usize,

    /// Verification of rewritten bodies
    pub verify: VerifyMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            integrations_file: None,
            disabled_integrations: Vec::new(),
            runtime_version_hint: None,
            max_layout_passes: 32,
            emit_retry_limit: 3,
            verify: VerifyMode::Structural,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration that refuses to attach
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Creates the configuration used in production
    ///
    /// Structural verification only: call-site resolution costs a metadata lookup per call
    /// instruction on the compiler thread.
    #[must_use]
    pub fn production() -> Self {
        Self::default()
    }

    /// Creates a configuration that verifies everything it installs
    ///
    /// Intended for test suites and staging environments.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            verify: VerifyMode::Full,
            ..Self::default()
        }
    }

    /// Read the configuration from the process environment
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for values that cannot be interpreted.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary key lookup
    ///
    /// Unset keys keep their [`EngineConfig::production`] value, except
    /// [`ENV_ENABLED`], which defaults to disabled.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for values that cannot be interpreted.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::production();
        let value = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        config.enabled = match value(ENV_ENABLED) {
            Some(enabled) => parse_bool(ENV_ENABLED, &enabled)?,
            None => false,
        };

        config.integrations_file = value(ENV_INTEGRATIONS_FILE).map(PathBuf::from);

        if let Some(disabled) = value(ENV_DISABLED_INTEGRATIONS) {
            config.disabled_integrations = disabled
                .split([',', ';'])
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.runtime_version_hint = value(ENV_RUNTIME_VERSION).map(|hint| hint.trim().to_string());

        if let Some(passes) = value(ENV_MAX_LAYOUT_PASSES) {
            config.max_layout_passes = passes
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|passes| *passes > 0)
                .ok_or_else(|| Error::InvalidConfig {
                    key: ENV_MAX_LAYOUT_PASSES.to_string(),
                    value: passes.clone(),
                })?;
        }

        if let Some(verify) = value(ENV_VERIFY) {
            config.verify = verify.parse()?;
        }

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
