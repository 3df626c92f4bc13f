//! Session configuration.

use serde::{Deserialize, Serialize};
use tessera_core::{CoreError, Result};
use tessera_providers::ProviderOptions;

/// A provider to construct at load, with its execution priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSpec {
    /// Higher priorities are consulted first during kernel resolution.
    #[serde(default)]
    pub priority: i32,
    /// Options handed to the provider factory.
    pub options: ProviderOptions,
}

/// Options for configuring a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Providers constructed through the session's factories during load.
    pub providers: Vec<ProviderSpec>,
    /// Keep run arenas for reuse by later runs.
    pub enable_arena_pool: bool,
    /// Arena sets kept across all signatures.
    pub max_pooled_arenas: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            enable_arena_pool: true,
            max_pooled_arenas: 4,
        }
    }
}

impl SessionOptions {
    /// Create new session options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse options from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::invalid_option(e.to_string()))
    }

    /// Add a provider to construct at load.
    pub fn with_provider(mut self, options: impl Into<ProviderOptions>, priority: i32) -> Self {
        self.providers.push(ProviderSpec {
            priority,
            options: options.into(),
        });
        self
    }

    /// Enable or disable arena pooling
    pub fn with_arena_pool(mut self, enable: bool) -> Self {
        self.enable_arena_pool = enable;
        self
    }

    /// Set how many arena sets the pool keeps in total
    pub fn with_max_pooled_arenas(mut self, max: usize) -> Self {
        self.max_pooled_arenas = max;
        self
    }

    /// Validate every provider options record.
    pub fn validate(&self) -> Result<()> {
        for spec in &self.providers {
            spec.options.validate()?;
        }
        Ok(())
    }
}
