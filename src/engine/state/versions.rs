// SPDX-License-Identifier: MIT

//! Record types for historic schema versions
//!
//! Stored payloads are decoded into the record type of their declared
//! version; the migration chain in `engine::migration` upgrades them to the
//! current `WorkflowState`.

use serde::{Deserialize, Serialize};

use super::payload::StatePayload;
use super::schema::{ChartArtifact, ChatMessage, WorkflowState};
use super::validator::validate_declared_version;
use crate::engine::audit::{AuditTrail, NodeExecutionRecord};
use crate::engine::error::{MalformedStateError, WorkflowError};

/// Version 1: flat charts list, query context and audit log at the top level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateV1 {
    pub schema_version: u32,
    pub session_id: String,
    pub conversation: ConversationV1,
    pub query_context: QueryContextV1,
    pub charts: Vec<ChartArtifact>,
    pub audit_log: Vec<NodeExecutionRecord>,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationV1 {
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryContextV1 {
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub datasource: Option<String>,
}

/// Version 2: sub-states grouped under `data_context`, `artifacts`, `audit`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateV2 {
    pub schema_version: u32,
    pub session_id: String,
    pub conversation: ConversationV1,
    pub data_context: DataContextV2,
    pub artifacts: ArtifactsV2,
    pub audit: AuditTrail,
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataContextV2 {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub generated_sql: Option<String>,
    #[serde(default)]
    pub datasource_id: Option<String>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsV2 {
    pub charts: Vec<ChartArtifact>,
}

/// A state decoded with the record type of its declared version
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedState {
    V1(StateV1),
    V2(StateV2),
    V3(WorkflowState),
}

impl VersionedState {
    /// Validate against the declared version's validator and decode
    pub fn parse(payload: &StatePayload) -> Result<Self, WorkflowError> {
        let result = validate_declared_version(payload);
        if !result.is_valid() {
            return Err(WorkflowError::InvalidState {
                violations: result.into_violations(),
            });
        }
        let value = payload.to_value();
        let decoded = match payload.schema_version() {
            1 => Self::V1(serde_json::from_value(value).map_err(MalformedStateError::from)?),
            2 => Self::V2(serde_json::from_value(value).map_err(MalformedStateError::from)?),
            _ => Self::V3(serde_json::from_value(value).map_err(MalformedStateError::from)?),
        };
        Ok(decoded)
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            Self::V1(_) => 1,
            Self::V2(_) => 2,
            Self::V3(_) => 3,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::V1(s) => &s.session_id,
            Self::V2(s) => &s.session_id,
            Self::V3(s) => &s.session_id,
        }
    }

    /// True when the state is already at the current schema version
    pub fn is_current(&self) -> bool {
        matches!(self, Self::V3(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v1_payload() -> StatePayload {
        StatePayload::from_value(json!({
            "schema_version": 1,
            "session_id": "abc",
            "conversation": {"messages": [{"role": "user", "content": "revenue by region"}]},
            "query_context": {"question": "revenue by region", "datasource": "sales"},
            "charts": [],
            "audit_log": []
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_v1() {
        let parsed = VersionedState::parse(&v1_payload()).unwrap();
        assert_eq!(parsed.schema_version(), 1);
        assert_eq!(parsed.session_id(), "abc");
        assert!(!parsed.is_current());
        match parsed {
            VersionedState::V1(state) => {
                assert_eq!(state.query_context.datasource.as_deref(), Some("sales"));
                assert_eq!(state.query_context.sql, None);
            }
            other => panic!("expected v1, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_v2_uses_v2_validator() {
        // A v1-shaped body declared as v2 is rejected by the v2 validator.
        let mut fields = v1_payload().into_fields();
        fields.insert("schema_version".to_string(), json!(2));
        let payload = StatePayload::from_fields(fields).unwrap();
        let err = VersionedState::parse(&payload).unwrap_err();
        let paths: Vec<&str> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"data_context"));
        assert!(paths.contains(&"artifacts"));
    }

    #[test]
    fn test_parse_current() {
        let state = WorkflowState::new("abc");
        let parsed = VersionedState::parse(&state.to_payload().unwrap()).unwrap();
        assert!(parsed.is_current());
        assert_eq!(parsed, VersionedState::V3(state));
    }

    #[test]
    fn test_parse_unknown_version() {
        let payload = StatePayload::from_value(json!({"schema_version": 9, "session_id": "abc"}))
            .unwrap();
        let err = VersionedState::parse(&payload).unwrap_err();
        assert_eq!(err.violations()[0].path, "schema_version");
    }
}
