//! Instrumentation configuration.
//!
//! [`InstrumentationConfig::default`] reads the environment:
//!
//! | variable | effect |
//! |---|---|
//! | `OTEL_SDK_DISABLED` | `true` disables every instrumenter |
//! | `OTEL_INSTRUMENTATION_<NAME>_ENABLED` | `false` disables the instrumenter named `<name>` |
//!
//! `<NAME>` is the instrumentation name upper-cased, with every character
//! that is not ASCII alphanumeric replaced by `_`: the instrumenter
//! `"http-client"` is controlled by `OTEL_INSTRUMENTATION_HTTP_CLIENT_ENABLED`.
//!
//! Values are case-insensitive `true` or `false`; anything else is logged
//! and ignored. Settings made through [`InstrumentationConfig::builder`]
//! take precedence over the environment.
use crate::otel_warn;
use std::collections::HashMap;
use std::env;

pub(crate) const OTEL_SDK_DISABLED: &str = "OTEL_SDK_DISABLED";
const INSTRUMENTATION_PREFIX: &str = "OTEL_INSTRUMENTATION_";
const ENABLED_SUFFIX: &str = "_ENABLED";

/// Enablement of instrumenters, by instrumentation name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstrumentationConfig {
    disabled_globally: bool,
    overrides: HashMap<String, bool>,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        let mut config = InstrumentationConfig {
            disabled_globally: false,
            overrides: HashMap::new(),
        };

        if let Some(disabled) = bool_from_env(OTEL_SDK_DISABLED) {
            config.disabled_globally = disabled;
        }

        for (name, value) in env::vars() {
            let Some(instrumentation) = name
                .strip_prefix(INSTRUMENTATION_PREFIX)
                .and_then(|rest| rest.strip_suffix(ENABLED_SUFFIX))
            else {
                continue;
            };
            if instrumentation.is_empty() {
                continue;
            }
            match parse_bool(&value) {
                Some(enabled) => {
                    config.overrides.insert(instrumentation.to_string(), enabled);
                }
                None => {
                    otel_warn!(
                        name: "InstrumentationConfig.InvalidValue",
                        message = "expected `true` or `false`, the value is ignored",
                        variable = name.as_str(),
                        value = value.as_str(),
                    );
                }
            }
        }

        config
    }
}

impl InstrumentationConfig {
    /// Create a builder seeded from the environment.
    pub fn builder() -> InstrumentationConfigBuilder {
        InstrumentationConfigBuilder {
            config: InstrumentationConfig::default(),
        }
    }

    /// A configuration enabling everything, ignoring the environment.
    pub fn enabled() -> Self {
        InstrumentationConfig {
            disabled_globally: false,
            overrides: HashMap::new(),
        }
    }

    /// Whether the instrumenter with the given instrumentation name may
    /// start observations.
    pub fn is_enabled(&self, instrumentation_name: &str) -> bool {
        if self.disabled_globally {
            return false;
        }
        self.overrides
            .get(&env_name(instrumentation_name))
            .copied()
            .unwrap_or(true)
    }
}

/// Builder for [`InstrumentationConfig`].
#[derive(Clone, Debug)]
pub struct InstrumentationConfigBuilder {
    config: InstrumentationConfig,
}

impl InstrumentationConfigBuilder {
    /// Disable, or re-enable, every instrumenter.
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.config.disabled_globally = disabled;
        self
    }

    /// Enable or disable one instrumentation by name.
    pub fn with_instrumentation_enabled(mut self, instrumentation_name: &str, enabled: bool) -> Self {
        self.config
            .overrides
            .insert(env_name(instrumentation_name), enabled);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> InstrumentationConfig {
        self.config
    }
}

/// The `<NAME>` fragment of the per-instrumentation variables.
pub(crate) fn env_name(instrumentation_name: &str) -> String {
    instrumentation_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn bool_from_env(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    let parsed = parse_bool(&value);
    if parsed.is_none() {
        otel_warn!(
            name: "InstrumentationConfig.InvalidValue",
            message = "expected `true` or `false`, the value is ignored",
            variable = name,
            value = value.as_str(),
        );
    }
    parsed
}

/// Reads a comma separated list from the environment, trimming entries and
/// skipping empty ones. `None` when the variable is unset.
pub fn list_from_env(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    })
}
