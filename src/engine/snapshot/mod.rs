// SPDX-License-Identifier: MIT

//! Snapshot and checksum service
//!
//! A snapshot stamps a state with a SHA-256 digest of its canonical JSON
//! (every field except `checksum` itself) so an operator can later prove a
//! recorded state was not altered.

mod canonical;

pub use canonical::to_canonical_json;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::engine::error::MalformedStateError;
use crate::engine::state::WorkflowState;

/// An immutable, checksummed copy of a workflow state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The state, with `checksum` set to the snapshot's digest
    pub state: WorkflowState,
    pub checksum: String,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn into_state(self) -> WorkflowState {
        self.state
    }
}

/// Canonical serialization of the state's substantive fields
pub fn canonical_state_json(state: &WorkflowState) -> Result<String, MalformedStateError> {
    let mut value = serde_json::to_value(state)?;
    if let Value::Object(fields) = &mut value {
        fields.remove("checksum");
    }
    Ok(to_canonical_json(&value))
}

/// Lowercase hex SHA-256 of `bytes`
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Checksum of a state as it is right now
pub fn compute_checksum(state: &WorkflowState) -> Result<String, MalformedStateError> {
    let canonical = canonical_state_json(state)?;
    Ok(digest_hex(canonical.as_bytes()))
}

/// Compute the digest of `state` and return it stamped and timestamped
pub fn create_state_snapshot(mut state: WorkflowState) -> Result<Snapshot, MalformedStateError> {
    let checksum = compute_checksum(&state)?;
    state.checksum = Some(checksum.clone());
    log::debug!(
        "Snapshot of session {} taken (checksum {})",
        state.session_id,
        checksum
    );
    Ok(Snapshot {
        state,
        checksum,
        taken_at: Utc::now(),
    })
}

/// Recompute the digest over the snapshot's current fields and compare
pub fn verify_state_snapshot(snapshot: &Snapshot) -> bool {
    if snapshot.state.checksum.as_deref() != Some(snapshot.checksum.as_str()) {
        return false;
    }
    match compute_checksum(&snapshot.state) {
        Ok(actual) => actual == snapshot.checksum,
        Err(e) => {
            log::warn!(
                "Could not recompute checksum for session {}: {}",
                snapshot.session_id(),
                e
            );
            false
        }
    }
}
