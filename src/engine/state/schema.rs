// SPDX-License-Identifier: MIT

//! Current workflow state schema

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::StatePayload;
use super::validator::validate_payload;
use super::{CURRENT_SCHEMA_VERSION, DEFAULT_ROW_LIMIT};
use crate::engine::audit::AuditTrail;
use crate::engine::error::{MalformedStateError, WorkflowError};

/// State of one chat-to-chart session at the current schema version.
///
/// Nodes never modify a state they were handed: they clone it, change the
/// clone and return it. `checksum` is filled in by the snapshot service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowState {
    pub schema_version: u32,
    pub session_id: String,
    pub conversation: ConversationContext,
    pub data_context: DataContext,
    pub artifacts: ChartArtifacts,
    pub audit: AuditTrail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Chat history and what the user is trying to get out of it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConversationContext {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub user_intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Query side of the session: the question, the SQL drafted for it and the
/// shape of its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DataContext {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub generated_sql: Option<String>,
    #[serde(default)]
    pub datasource_id: Option<String>,
    pub columns: Vec<String>,
    pub row_limit: u32,
}

impl Default for DataContext {
    fn default() -> Self {
        Self {
            query: None,
            generated_sql: None,
            datasource_id: None,
            columns: Vec::new(),
            row_limit: DEFAULT_ROW_LIMIT,
        }
    }
}

/// Charts generated so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChartArtifacts {
    pub charts: Vec<ChartArtifact>,
    #[serde(default)]
    pub selected_chart_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChartArtifact {
    pub chart_id: String,
    pub chart_type: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Renderer-specific chart specification (always a JSON object)
    pub spec: serde_json::Value,
}

impl WorkflowState {
    /// Create an empty state for the given session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            session_id: session_id.into(),
            conversation: ConversationContext::default(),
            data_context: DataContext::default(),
            artifacts: ChartArtifacts::default(),
            audit: AuditTrail::default(),
            checksum: None,
        }
    }

    /// Create an empty state with a fresh random session id
    pub fn new_session() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    /// Append a chat message
    pub fn push_message(&mut self, role: Role, content: impl Into<String>) {
        self.conversation.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
    }

    /// Builder-style variant of `push_message` for user turns
    pub fn with_user_message(mut self, content: impl Into<String>) -> Self {
        self.push_message(Role::User, content);
        self
    }

    /// Content of the most recent user message
    pub fn last_user_message(&self) -> Option<&str> {
        self.conversation
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Add a chart and make it the selected one
    pub fn add_chart(&mut self, chart: ChartArtifact) {
        self.artifacts.selected_chart_id = Some(chart.chart_id.clone());
        self.artifacts.charts.push(chart);
    }

    /// The selected chart, if any
    pub fn selected_chart(&self) -> Option<&ChartArtifact> {
        let id = self.artifacts.selected_chart_id.as_deref()?;
        self.artifacts.charts.iter().find(|c| c.chart_id == id)
    }

    /// True once the snapshot service has stamped a checksum
    pub fn is_snapshotted(&self) -> bool {
        self.checksum.is_some()
    }

    /// Serialize into a raw payload
    pub fn to_payload(&self) -> Result<StatePayload, MalformedStateError> {
        StatePayload::from_value(serde_json::to_value(self)?)
    }

    /// Validate a raw payload against the current schema and decode it
    pub fn from_payload(payload: &StatePayload) -> Result<Self, WorkflowError> {
        let result = validate_payload(payload);
        if !result.is_valid() {
            return Err(WorkflowError::InvalidState {
                violations: result.into_violations(),
            });
        }
        let state = serde_json::from_value(payload.to_value()).map_err(MalformedStateError::from)?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_state_defaults() {
        let state = WorkflowState::new("abc");
        assert_eq!(state.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(state.data_context.row_limit, DEFAULT_ROW_LIMIT);
        assert!(state.audit.is_empty());
        assert!(!state.is_snapshotted());
    }

    #[test]
    fn test_new_session_ids_are_unique() {
        assert_ne!(
            WorkflowState::new_session().session_id,
            WorkflowState::new_session().session_id
        );
    }

    #[test]
    fn test_checksum_omitted_until_set() {
        let state = WorkflowState::new("abc");
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("checksum").is_none());
    }

    #[test]
    fn test_payload_round_trip() {
        let state = WorkflowState::new("abc").with_user_message("sales by month");
        let payload = state.to_payload().unwrap();
        assert_eq!(payload.session_id(), Some("abc"));
        assert_eq!(WorkflowState::from_payload(&payload).unwrap(), state);
    }

    #[test]
    fn test_from_payload_reports_violations() {
        let payload = StatePayload::from_value(json!({
            "schema_version": 3,
            "session_id": "",
        }))
        .unwrap();
        let err = WorkflowState::from_payload(&payload).unwrap_err();
        let paths: Vec<&str> = err.violations().iter().map(|v| v.path.as_str()).collect();
        assert!(paths.contains(&"session_id"));
        assert!(paths.contains(&"conversation"));
        assert!(paths.contains(&"audit"));
    }

    #[test]
    fn test_add_chart_selects_it() {
        let mut state = WorkflowState::new("abc");
        state.add_chart(ChartArtifact {
            chart_id: "chart-1".to_string(),
            chart_type: "bar".to_string(),
            title: None,
            spec: json!({"mark": "bar"}),
        });
        assert_eq!(state.selected_chart().unwrap().chart_type, "bar");
    }

    #[test]
    fn test_last_user_message_skips_assistant_turns() {
        let mut state = WorkflowState::new("abc").with_user_message("first");
        state.push_message(Role::Assistant, "answer");
        assert_eq!(state.last_user_message(), Some("first"));
    }
}
