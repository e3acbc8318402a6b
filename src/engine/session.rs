// SPDX-License-Identifier: MIT

//! Sequential runner for one chat-to-chart session

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::engine::audit::{AuditTrail, ExecutionStatus};
use crate::engine::error::WorkflowError;
use crate::engine::migration::MigrationRegistry;
use crate::engine::node::NodeExecutor;
use crate::engine::snapshot::{create_state_snapshot, Snapshot};
use crate::engine::state::{validate_with_checksum, WorkflowState};
use crate::engine::store::{Checkpoint, CheckpointStore};

/// Cooperative cancellation shared between a session and its caller.
///
/// The session only looks at the flag between nodes; a node that is
/// already running finishes first.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of a session run
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub status: SessionStatus,
    /// Last good snapshot; on failure this is the state before the failing node
    pub checkpoint: Snapshot,
    /// Every record written during the run, failed invocations included
    pub audit: AuditTrail,
    pub error: Option<WorkflowError>,
    /// Nodes whose output is reflected in `checkpoint`
    pub nodes_completed: usize,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn state(&self) -> &WorkflowState {
        &self.checkpoint.state
    }
}

/// An ordered list of nodes run strictly one after the other
pub struct Session {
    nodes: Vec<NodeExecutor>,
    store: Option<Arc<dyn CheckpointStore>>,
    cancellation: CancellationFlag,
}

#[derive(Default)]
pub struct SessionBuilder {
    nodes: Vec<NodeExecutor>,
    store: Option<Arc<dyn CheckpointStore>>,
    cancellation: Option<CancellationFlag>,
}

impl SessionBuilder {
    pub fn node(mut self, executor: NodeExecutor) -> Self {
        self.nodes.push(executor);
        self
    }

    pub fn nodes(mut self, executors: impl IntoIterator<Item = NodeExecutor>) -> Self {
        self.nodes.extend(executors);
        self
    }

    /// Save a checkpoint after every snapshot and after a failure
    pub fn store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);
        self
    }

    pub fn build(self) -> Session {
        Session {
            nodes: self.nodes,
            store: self.store,
            cancellation: self.cancellation.unwrap_or_default(),
        }
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    /// Run every node against `initial`.
    ///
    /// Fails outright only when the initial state cannot be accepted; node
    /// failures end the run and are reported in the `SessionReport`.
    pub async fn run(&self, initial: WorkflowState) -> Result<SessionReport, WorkflowError> {
        let checked = validate_with_checksum(&initial);
        if !checked.is_valid() {
            return Err(WorkflowError::InvalidState {
                violations: checked.into_violations(),
            });
        }
        let snapshot = create_state_snapshot(initial)?;
        Ok(self.run_from(snapshot, 0, AuditTrail::new()).await)
    }

    /// Continue a session from a stored checkpoint.
    ///
    /// Skips the first `checkpoint.nodes_completed` nodes, but never past a
    /// node whose success is missing from the restored state's audit.
    pub async fn resume(
        &self,
        checkpoint: &Checkpoint,
        registry: &MigrationRegistry,
    ) -> Result<SessionReport, WorkflowError> {
        let state = checkpoint.restore(registry)?;
        let done = self
            .completed_prefix(&state.audit)
            .min(checkpoint.nodes_completed);
        log::info!(
            "Resuming session {} after {} completed node(s)",
            state.session_id,
            done
        );
        let snapshot = create_state_snapshot(state)?;
        Ok(self.run_from(snapshot, done, checkpoint.audit_trail()).await)
    }

    /// Number of leading nodes backed by a `success` record.
    ///
    /// The k-th node named N needs at least k success records for N.
    fn completed_prefix(&self, audit: &AuditTrail) -> usize {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        self.nodes
            .iter()
            .take_while(|&n| {
                let occurrence = seen.entry(n.name()).or_insert(0);
                *occurrence += 1;
                let successes = audit
                    .for_node(n.name())
                    .filter(|r| r.status == ExecutionStatus::Success)
                    .count();
                successes >= *occurrence
            })
            .count()
    }

    async fn run_from(&self, mut current: Snapshot, start: usize, mut audit: AuditTrail) -> SessionReport {
        let session_id = current.state.session_id.clone();
        log::info!(
            "Session {} running {} of {} node(s)",
            session_id,
            self.nodes.len().saturating_sub(start),
            self.nodes.len()
        );

        let mut completed = start;
        let mut failure = self.persist(&current, &audit, completed).await.err();
        for executor in self.nodes.iter().skip(start) {
            if failure.is_some() {
                break;
            }
            if self.cancellation.is_cancelled() {
                log::warn!(
                    "Session {} cancelled before node '{}'",
                    session_id,
                    executor.name()
                );
                return self
                    .finish(session_id, SessionStatus::Cancelled, current, audit, None, completed)
                    .await;
            }

            match executor.execute(&current.state, &mut audit).await {
                Ok(next) => {
                    current = next;
                    completed += 1;
                    if let Err(e) = self.persist(&current, &audit, completed).await {
                        failure = Some(e);
                        break;
                    }
                }
                Err(e) => {
                    log::error!(
                        "Session {} stopped at node '{}': {}",
                        session_id,
                        executor.name(),
                        e
                    );
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            Some(e) => {
                self.finish(session_id, SessionStatus::Failed, current, audit, Some(e), completed)
                    .await
            }
            None => {
                log::info!("Session {} completed", session_id);
                SessionReport {
                    session_id,
                    status: SessionStatus::Completed,
                    checkpoint: current,
                    audit,
                    error: None,
                    nodes_completed: completed,
                }
            }
        }
    }

    /// Build the report for a run that did not complete, saving the final
    /// audit trail alongside the last good snapshot
    async fn finish(
        &self,
        session_id: String,
        status: SessionStatus,
        checkpoint: Snapshot,
        audit: AuditTrail,
        mut error: Option<WorkflowError>,
        nodes_completed: usize,
    ) -> SessionReport {
        if !matches!(error, Some(WorkflowError::Store(_))) {
            if let Err(e) = self.persist(&checkpoint, &audit, nodes_completed).await {
                log::error!("Could not save checkpoint for session {}: {}", session_id, e);
                error.get_or_insert(e);
            }
        }
        SessionReport {
            session_id,
            status,
            checkpoint,
            audit,
            error,
            nodes_completed,
        }
    }

    async fn persist(
        &self,
        snapshot: &Snapshot,
        audit: &AuditTrail,
        nodes_completed: usize,
    ) -> Result<(), WorkflowError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let checkpoint = Checkpoint::from_snapshot(snapshot, audit)?.with_nodes_completed(nodes_completed);
        store.save(&checkpoint).await?;
        Ok(())
    }
}
