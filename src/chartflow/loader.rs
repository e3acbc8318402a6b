// SPDX-License-Identifier: MIT

//! State loader - reads stored state payloads and snapshots from disk
//!
//! JSON is the storage format; YAML is accepted for hand-written fixtures
//! (`.yaml` / `.yml`).

use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::engine::error::ChartflowError;
use crate::engine::snapshot::Snapshot;
use crate::engine::state::StatePayload;

/// Loads state payloads and snapshots from files
pub struct StateLoader;

impl StateLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load a state payload of any schema version
    pub fn load_payload<P: AsRef<Path>>(&self, path: P) -> Result<StatePayload, ChartflowError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        log::debug!("Loaded {} bytes from {}", content.len(), path.display());
        if is_yaml(path) {
            Self::parse_yaml(&content)
        } else {
            Self::parse_json(&content)
        }
    }

    /// Load a snapshot written by `chartflow snapshot`
    pub fn load_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<Snapshot, ChartflowError> {
        let content = fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        Ok(snapshot)
    }

    /// Parse a state payload from a JSON string
    pub fn parse_json(content: &str) -> Result<StatePayload, ChartflowError> {
        Ok(StatePayload::from_json_str(content)?)
    }

    /// Parse a state payload from a YAML string
    pub fn parse_yaml(content: &str) -> Result<StatePayload, ChartflowError> {
        let value: Value = serde_yaml::from_str(content)?;
        Ok(StatePayload::from_value(value)?)
    }
}

impl Default for StateLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}
