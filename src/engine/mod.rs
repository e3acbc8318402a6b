// SPDX-License-Identifier: MIT

//! Workflow-state engine: versioned state, snapshots, migrations and the
//! node execution wrapper

pub mod audit;
pub mod error;
pub mod migration;
pub mod node;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod store;

pub use audit::{AuditTrail, ExecutionStatus, NodeExecutionRecord};
pub use error::{
    ChartflowError, MalformedStateError, MigrationRegistrationError, RetryPolicyError, StoreError,
    UnsupportedMigrationError, WorkflowError,
};
pub use migration::{migrate_state, upgrade_to_current, MigrationRegistry};
pub use node::{ErrorKind, FnNode, Node, NodeError, NodeExecutor, RetryPolicy};
pub use session::{CancellationFlag, Session, SessionReport, SessionStatus};
pub use snapshot::{create_state_snapshot, verify_state_snapshot, Snapshot};
pub use state::{validate_state, validate_state_version, StatePayload, WorkflowState};
pub use store::{Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
