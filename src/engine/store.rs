// SPDX-License-Identifier: MIT

//! Checkpoint persistence
//!
//! A checkpoint is the latest snapshot of a session plus the session's full
//! audit trail. The state is kept as raw JSON so that checkpoints written by
//! an older build can still be read and migrated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::engine::audit::{AuditTrail, NodeExecutionRecord};
use crate::engine::error::{MalformedStateError, StoreError, WorkflowError};
use crate::engine::migration::MigrationRegistry;
use crate::engine::snapshot::{compute_checksum, Snapshot};
use crate::engine::state::{StatePayload, WorkflowState, CURRENT_SCHEMA_VERSION};

/// Durable record of a session's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub schema_version: u32,
    pub state: Value,
    pub checksum: String,
    pub audit: Vec<NodeExecutionRecord>,
    /// Leading pipeline nodes whose output is reflected in `state`
    #[serde(default)]
    pub nodes_completed: usize,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint from a snapshot and the session-level audit trail
    pub fn from_snapshot(snapshot: &Snapshot, audit: &AuditTrail) -> Result<Self, MalformedStateError> {
        Ok(Self {
            session_id: snapshot.state.session_id.clone(),
            schema_version: snapshot.state.schema_version,
            state: serde_json::to_value(&snapshot.state)?,
            checksum: snapshot.checksum.clone(),
            audit: audit.records().to_vec(),
            nodes_completed: 0,
            saved_at: Utc::now(),
        })
    }

    pub fn with_nodes_completed(mut self, nodes_completed: usize) -> Self {
        self.nodes_completed = nodes_completed;
        self
    }

    /// Rebuild a typed state that is safe to resume from.
    ///
    /// A checkpoint at the current version must still match its checksum.
    /// An older one is migrated; its checksum was computed over the old
    /// layout and cannot be rechecked.
    pub fn restore(&self, registry: &MigrationRegistry) -> Result<WorkflowState, WorkflowError> {
        let payload = StatePayload::from_value(self.state.clone())?;
        if payload.session_id() != Some(self.session_id.as_str()) {
            return Err(self.inconsistent(format!(
                "state belongs to session {:?}",
                payload.session_id()
            )));
        }
        if payload.schema_version() != self.schema_version {
            return Err(self.inconsistent(format!(
                "header says schema version {} but state declares {}",
                self.schema_version,
                payload.schema_version()
            )));
        }

        if payload.schema_version() != CURRENT_SCHEMA_VERSION {
            log::warn!(
                "Checkpoint for session {} is at schema version {}; migrating without checksum verification",
                self.session_id,
                payload.schema_version()
            );
            return registry.upgrade(payload);
        }

        let state = WorkflowState::from_payload(&payload)?;
        let actual = compute_checksum(&state)?;
        if actual != self.checksum || state.checksum.as_deref() != Some(self.checksum.as_str()) {
            log::error!(
                "Checkpoint for session {} does not match its checksum",
                self.session_id
            );
            return Err(WorkflowError::ChecksumMismatch {
                session_id: self.session_id.clone(),
            });
        }
        Ok(state)
    }

    fn inconsistent(&self, reason: String) -> WorkflowError {
        WorkflowError::InconsistentCheckpoint {
            session_id: self.session_id.clone(),
            reason,
        }
    }

    /// Session-level audit trail carried by the checkpoint
    pub fn audit_trail(&self) -> AuditTrail {
        AuditTrail::from(self.audit.clone())
    }
}

/// Persistence seam for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint, replacing any earlier one for the same session
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Latest checkpoint for a session
    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Ids of every session with a checkpoint, sorted
    async fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Process-local store, shared between clones
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(checkpoint.session_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(session_id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let checkpoints = self.checkpoints.read().await;
        let mut ids: Vec<String> = checkpoints.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON file per session: `<dir>/<session_id>.json`
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let usable = !session_id.is_empty()
            && !session_id.starts_with('.')
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !usable {
            return Err(StoreError::InvalidSessionId(session_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let path = self.path_for(&checkpoint.session_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let content = serde_json::to_string_pretty(checkpoint)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        log::debug!(
            "Saved checkpoint for session {} to {}",
            checkpoint.session_id,
            path.display()
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let path = self.path_for(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::snapshot::create_state_snapshot;
    use crate::engine::state::Role;
    use serde_json::json;

    fn checkpoint(session_id: &str) -> Checkpoint {
        let mut state = WorkflowState::new(session_id).with_user_message("churn by plan");
        state.push_message(Role::Assistant, "Looking at the subscriptions table");
        let snapshot = create_state_snapshot(state).unwrap();
        Checkpoint::from_snapshot(&snapshot, &AuditTrail::new()).unwrap()
    }

    #[test]
    fn test_restore_current_checkpoint() {
        let cp = checkpoint("abc");
        let state = cp.restore(&MigrationRegistry::with_defaults()).unwrap();
        assert_eq!(state.session_id, "abc");
        assert_eq!(state.checksum.as_deref(), Some(cp.checksum.as_str()));
    }

    #[test]
    fn test_restore_rejects_tampered_state() {
        let mut cp = checkpoint("abc");
        cp.state["data_context"]["row_limit"] = json!(10);
        let err = cp.restore(&MigrationRegistry::with_defaults()).unwrap_err();
        assert!(matches!(err, WorkflowError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_restore_rejects_foreign_state() {
        let mut cp = checkpoint("abc");
        cp.session_id = "xyz".to_string();
        let err = cp.restore(&MigrationRegistry::with_defaults()).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InconsistentCheckpoint { ref session_id, .. } if session_id == "xyz"
        ));
    }

    #[test]
    fn test_restore_rejects_version_header_mismatch() {
        let mut cp = checkpoint("abc");
        cp.schema_version = 2;
        let err = cp.restore(&MigrationRegistry::with_defaults()).unwrap_err();
        assert!(matches!(err, WorkflowError::InconsistentCheckpoint { .. }));
        assert!(err.to_string().contains("schema version 2"));
    }

    #[test]
    fn test_checkpoint_without_progress_field_reads_as_zero() {
        let cp = checkpoint("abc").with_nodes_completed(2);
        let mut raw = serde_json::to_value(&cp).unwrap();
        assert_eq!(raw["nodes_completed"], json!(2));
        raw.as_object_mut().unwrap().remove("nodes_completed");
        let read: Checkpoint = serde_json::from_value(raw).unwrap();
        assert_eq!(read.nodes_completed, 0);
    }

    #[test]
    fn test_restore_migrates_old_checkpoint() {
        let mut cp = checkpoint("abc");
        cp.schema_version = 1;
        cp.state = json!({
            "schema_version": 1,
            "session_id": "abc",
            "conversation": {"messages": []},
            "query_context": {"question": "churn by plan"},
            "charts": [],
            "audit_log": [],
            "checksum": "whatever"
        });
        let state = cp.restore(&MigrationRegistry::with_defaults()).unwrap();
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(state.data_context.query.as_deref(), Some("churn by plan"));
        assert!(state.checksum.is_none());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        let shared = store.clone();
        store.save(&checkpoint("b")).await.unwrap();
        store.save(&checkpoint("a")).await.unwrap();

        assert_eq!(shared.list().await.unwrap(), vec!["a", "b"]);
        assert!(shared.load("a").await.unwrap().is_some());
        assert!(shared.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let cp = checkpoint("session-1");

        assert!(store.list().await.unwrap().is_empty());
        store.save(&cp).await.unwrap();

        assert_eq!(store.load("session-1").await.unwrap(), Some(cp));
        assert_eq!(store.list().await.unwrap(), vec!["session-1"]);
        assert!(store.load("session-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        for id in ["../escape", "a/b", "", ".hidden"] {
            let err = store.load(id).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidSessionId(_)), "{}", id);
        }
    }

    #[tokio::test]
    async fn test_file_store_refuses_to_save_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        for id in ["../escape", "nested/dir", ".hidden"] {
            let mut cp = checkpoint("abc");
            cp.session_id = id.to_string();
            let err = store.save(&cp).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidSessionId(_)), "{}", id);
        }
        assert!(!dir.path().join("escape.json").exists());
        assert!(store.list().await.unwrap().is_empty());
    }
}
