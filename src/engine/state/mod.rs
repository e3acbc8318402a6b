// SPDX-License-Identifier: MIT

//! Workflow state for a chat-to-chart session
//!
//! This module provides:
//! - `WorkflowState` - the current, typed state schema
//! - `StatePayload` - a raw JSON state of any schema version
//! - `VersionedState` - one record type per historic schema version
//! - validators selected by the payload's declared `schema_version`

mod payload;
mod schema;
mod validator;
mod versions;

pub use payload::StatePayload;
pub use schema::{
    ChartArtifact, ChartArtifacts, ChatMessage, ConversationContext, DataContext, Role,
    WorkflowState,
};
pub use validator::{
    validate_declared_version, validate_payload, validate_state, validate_state_version,
    validate_with_checksum, FieldViolation, ValidationResult, ViolationKind,
};
pub use versions::{ConversationV1, DataContextV2, QueryContextV1, StateV1, StateV2, VersionedState};

/// Schema version produced by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Oldest schema version that still has a validator and an upgrade path.
pub const OLDEST_SUPPORTED_VERSION: u32 = 1;

/// Row limit applied to generated queries when a state does not carry one.
pub const DEFAULT_ROW_LIMIT: u32 = 1000;
