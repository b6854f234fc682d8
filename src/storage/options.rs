use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{Result, StrataError};

/// Configuration options supplied when creating or opening a [`super::Graph`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphOptions {
    /// Bytes reserved by a fresh arena.
    pub initial_capacity_bytes: usize,
    /// Step by which the arena grows.
    pub growth_chunk_bytes: usize,
    /// Hard limit on arena size.
    pub max_capacity_bytes: usize,
    /// Entries kept in the delegate lookup memo.
    pub delegate_cache_capacity: usize,
    /// Run both verifiers after every applied payload.
    pub verify_on_apply: bool,
    /// Free-form revision string written into the root record.
    pub revision_info: String,
    /// Seed for uid generation; random when absent.
    pub uid_seed: Option<u64>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            initial_capacity_bytes: 1 << 20,
            growth_chunk_bytes: 1 << 20,
            max_capacity_bytes: 1 << 31,
            delegate_cache_capacity: 256,
            verify_on_apply: false,
            revision_info: String::new(),
            uid_seed: None,
        }
    }
}

impl GraphOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial arena size.
    pub fn initial_capacity_bytes(mut self, bytes: usize) -> Self {
        self.initial_capacity_bytes = bytes;
        self
    }

    /// Sets the arena growth step.
    pub fn growth_chunk_bytes(mut self, bytes: usize) -> Self {
        self.growth_chunk_bytes = bytes;
        self
    }

    /// Sets the arena size limit.
    pub fn max_capacity_bytes(mut self, bytes: usize) -> Self {
        self.max_capacity_bytes = bytes;
        self
    }

    /// Sets the delegate memo size.
    pub fn delegate_cache_capacity(mut self, entries: usize) -> Self {
        self.delegate_cache_capacity = entries;
        self
    }

    /// Enables or disables verification after each applied payload.
    pub fn verify_on_apply(mut self, enabled: bool) -> Self {
        self.verify_on_apply = enabled;
        self
    }

    /// Sets the revision string stored in the root record.
    pub fn revision_info(mut self, info: impl Into<String>) -> Self {
        self.revision_info = info.into();
        self
    }

    /// Makes uid generation deterministic.
    pub fn uid_seed(mut self, seed: u64) -> Self {
        self.uid_seed = Some(seed);
        self
    }

    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: GraphOptions = toml::from_str(text).map_err(|err| StrataError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Rejects option combinations the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.growth_chunk_bytes == 0 {
            return Err(StrataError::Config("growth_chunk_bytes must be positive".into()));
        }
        if self.initial_capacity_bytes > self.max_capacity_bytes {
            return Err(StrataError::Config(
                "initial_capacity_bytes exceeds max_capacity_bytes".into(),
            ));
        }
        if self.delegate_cache_capacity == 0 {
            return Err(StrataError::Config("delegate_cache_capacity must be positive".into()));
        }
        Ok(())
    }
}
