// SPDX-License-Identifier: MIT

//! Application configuration
//!
//! Loaded once at startup from an optional YAML file, then adjusted by
//! `CHARTFLOW_*` environment variables:
//!
//! ```yaml
//! default_policy:
//!   max_attempts: 3
//!   backoff_seconds: 0.5
//!   backoff: exponential
//! nodes:
//!   render_chart:
//!     max_attempts: 1
//! checkpoint_dir: ./checkpoints
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::error::ChartflowError;
use crate::engine::node::RetryPolicy;

pub const ENV_MAX_ATTEMPTS: &str = "CHARTFLOW_MAX_ATTEMPTS";
pub const ENV_BACKOFF_SECONDS: &str = "CHARTFLOW_BACKOFF_SECONDS";
pub const ENV_CHECKPOINT_DIR: &str = "CHARTFLOW_CHECKPOINT_DIR";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Policy for nodes without an entry in `nodes`
    pub default_policy: RetryPolicy,
    /// Per-node policy overrides, keyed by node name
    pub nodes: HashMap<String, RetryPolicy>,
    /// Where checkpoints are written; in-memory only when unset
    pub checkpoint_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ChartflowError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Read the optional config file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self, ChartflowError> {
        let mut config = match path {
            Some(path) => {
                log::info!("Loading configuration from {}", path.display());
                Self::from_yaml(&fs::read_to_string(path)?)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CHARTFLOW_*` overrides read through `lookup`.
    ///
    /// Attempt and backoff overrides change the default policy and every
    /// per-node policy.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ChartflowError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS) {
            let attempts: u32 = raw.trim().parse().map_err(|_| {
                ChartflowError::config(format!("{} must be an integer, got '{}'", ENV_MAX_ATTEMPTS, raw))
            })?;
            log::debug!("{} overrides max_attempts to {}", ENV_MAX_ATTEMPTS, attempts);
            for policy in self.policies_mut() {
                policy.max_attempts = attempts;
            }
        }
        if let Some(raw) = lookup(ENV_BACKOFF_SECONDS) {
            let seconds: f64 = raw.trim().parse().map_err(|_| {
                ChartflowError::config(format!("{} must be a number, got '{}'", ENV_BACKOFF_SECONDS, raw))
            })?;
            log::debug!("{} overrides backoff_seconds to {}", ENV_BACKOFF_SECONDS, seconds);
            for policy in self.policies_mut() {
                policy.backoff_seconds = seconds;
            }
        }
        if let Some(dir) = lookup(ENV_CHECKPOINT_DIR) {
            self.checkpoint_dir = (!dir.trim().is_empty()).then(|| PathBuf::from(dir));
        }
        Ok(())
    }

    fn policies_mut(&mut self) -> impl Iterator<Item = &mut RetryPolicy> + '_ {
        std::iter::once(&mut self.default_policy).chain(self.nodes.values_mut())
    }

    pub fn validate(&self) -> Result<(), ChartflowError> {
        self.default_policy
            .validate()
            .map_err(|e| ChartflowError::config(format!("default_policy: {}", e)))?;
        for (name, policy) in &self.nodes {
            policy
                .validate()
                .map_err(|e| ChartflowError::config(format!("nodes.{}: {}", name, e)))?;
        }
        Ok(())
    }

    /// Effective policy for a node
    pub fn policy_for(&self, node_name: &str) -> RetryPolicy {
        self.nodes
            .get(node_name)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }
}
