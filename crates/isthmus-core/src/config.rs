//! Per-scope bridge configuration.
//!
//! A scope copies its configuration when it is opened and never changes it
//! afterwards; these are the only tunables the bridge has.

use serde::Deserialize;
use thiserror::Error;

/// Policy applied before a value is allowed to cross the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatePolicy {
    /// Allow callables to cross (as wrappers).
    /// Default: false
    pub allow_callable_passing: bool,

    /// Allow arrays, mappings and opaque objects to cross.
    /// Default: true
    pub allow_composite_objects: bool,

    /// Deepest composite nesting the gate lets through.
    /// Default: 16
    pub max_depth: usize,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            allow_callable_passing: false,
            allow_composite_objects: true,
            max_depth: 16,
        }
    }
}

impl GatePolicy {
    /// Only primitives cross; no callables, no composites.
    pub fn primitives_only() -> Self {
        Self {
            allow_callable_passing: false,
            allow_composite_objects: false,
            ..Default::default()
        }
    }

    /// Everything the converter can handle crosses.
    pub fn permissive() -> Self {
        Self {
            allow_callable_passing: true,
            allow_composite_objects: true,
            ..Default::default()
        }
    }

    pub fn allow_callable_passing(mut self, enabled: bool) -> Self {
        self.allow_callable_passing = enabled;
        self
    }

    pub fn allow_composite_objects(mut self, enabled: bool) -> Self {
        self.allow_composite_objects = enabled;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }
}

/// Configuration fixed for the lifetime of one owning scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Safety gate policy.
    pub gate: GatePolicy,

    /// Depth at which the converter aborts composite recursion.
    /// Default: 32
    pub max_conversion_depth: usize,

    /// Deepest nesting of reentrant foreign calls through the call proxy.
    /// Default: 100
    pub max_call_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            gate: GatePolicy::default(),
            max_conversion_depth: 32,
            max_call_depth: 100,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document, e.g.
    /// `{"gate": {"allow_callable_passing": true}, "max_call_depth": 64}`.
    /// Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every conversion or call fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.max_depth == 0 {
            return Err(ConfigError::InvalidLimit("gate.max_depth"));
        }
        if self.max_conversion_depth == 0 {
            return Err(ConfigError::InvalidLimit("max_conversion_depth"));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::InvalidLimit("max_call_depth"));
        }
        Ok(())
    }

    pub fn gate(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    pub fn max_conversion_depth(mut self, depth: usize) -> Self {
        self.max_conversion_depth = depth;
        self
    }

    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}

/// Errors raised while loading a [`BridgeConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid bridge config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0} must be greater than zero")]
    InvalidLimit(&'static str),
}
