// SPDX-License-Identifier: MIT

//! Append-only audit trail of node executions

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Log target for structured node-execution events
pub const AUDIT_LOG_TARGET: &str = "chartflow::audit";

/// Outcome of one node attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Retried,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retried => "retried",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit entry per node attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeExecutionRecord {
    pub node_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    /// Present only when `status` is not `success`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// 1-based
    pub attempt_number: u32,
}

impl NodeExecutionRecord {
    pub fn success(node_name: impl Into<String>, attempt_number: u32, started_at: DateTime<Utc>) -> Self {
        Self::completed(node_name, attempt_number, started_at, ExecutionStatus::Success, None)
    }

    pub fn retried(
        node_name: impl Into<String>,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        error_detail: impl Into<String>,
    ) -> Self {
        Self::completed(
            node_name,
            attempt_number,
            started_at,
            ExecutionStatus::Retried,
            Some(error_detail.into()),
        )
    }

    pub fn failed(
        node_name: impl Into<String>,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        error_detail: impl Into<String>,
    ) -> Self {
        Self::completed(
            node_name,
            attempt_number,
            started_at,
            ExecutionStatus::Failed,
            Some(error_detail.into()),
        )
    }

    fn completed(
        node_name: impl Into<String>,
        attempt_number: u32,
        started_at: DateTime<Utc>,
        status: ExecutionStatus,
        error_detail: Option<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            started_at,
            completed_at: Utc::now(),
            status,
            error_detail,
            attempt_number,
        }
    }

    /// Emit the record as a structured log event
    pub fn emit(&self) {
        let detail = self.error_detail.as_deref().unwrap_or("");
        match self.status {
            ExecutionStatus::Success => log::info!(
                target: AUDIT_LOG_TARGET,
                "node_name={} attempt_number={} status=success",
                self.node_name,
                self.attempt_number
            ),
            ExecutionStatus::Retried => log::warn!(
                target: AUDIT_LOG_TARGET,
                "node_name={} attempt_number={} status=retried error_detail={:?}",
                self.node_name,
                self.attempt_number,
                detail
            ),
            ExecutionStatus::Failed => log::error!(
                target: AUDIT_LOG_TARGET,
                "node_name={} attempt_number={} status=failed error_detail={:?}",
                self.node_name,
                self.attempt_number,
                detail
            ),
        }
    }
}

/// Ordered, append-only list of execution records.
///
/// Used both as the `audit` sub-state of a `WorkflowState` and as the
/// per-session log handed to the persistence layer. There is no way to
/// remove or rewrite an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditTrail {
    records: Vec<NodeExecutionRecord>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: NodeExecutionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[NodeExecutionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records with the given status
    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Records written for one node, in order
    pub fn for_node<'a>(&'a self, node_name: &'a str) -> impl Iterator<Item = &'a NodeExecutionRecord> + 'a {
        self.records.iter().filter(move |r| r.node_name == node_name)
    }

    pub fn last(&self) -> Option<&NodeExecutionRecord> {
        self.records.last()
    }

    pub fn into_records(self) -> Vec<NodeExecutionRecord> {
        self.records
    }
}

impl From<Vec<NodeExecutionRecord>> for AuditTrail {
    fn from(records: Vec<NodeExecutionRecord>) -> Self {
        Self { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_constructors() {
        let now = Utc::now();
        let ok = NodeExecutionRecord::success("render_chart", 1, now);
        assert_eq!(ok.status, ExecutionStatus::Success);
        assert!(ok.error_detail.is_none());
        assert!(ok.completed_at >= ok.started_at);

        let retry = NodeExecutionRecord::retried("render_chart", 1, now, "timeout");
        assert_eq!(retry.error_detail.as_deref(), Some("timeout"));

        let failed = NodeExecutionRecord::failed("render_chart", 2, now, "timeout");
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.attempt_number, 2);
    }

    #[test]
    fn test_success_record_serializes_without_detail() {
        let record = NodeExecutionRecord::success("render_chart", 1, Utc::now());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "success");
        assert!(value.get("error_detail").is_none());
    }

    #[test]
    fn test_trail_counts_and_filters() {
        let now = Utc::now();
        let mut trail = AuditTrail::new();
        trail.append(NodeExecutionRecord::retried("a", 1, now, "timeout"));
        trail.append(NodeExecutionRecord::success("a", 2, now));
        trail.append(NodeExecutionRecord::failed("b", 1, now, "bad input"));

        assert_eq!(trail.len(), 3);
        assert_eq!(trail.count(ExecutionStatus::Retried), 1);
        assert_eq!(trail.count(ExecutionStatus::Failed), 1);
        assert_eq!(trail.for_node("a").count(), 2);
        assert_eq!(trail.last().unwrap().node_name, "b");
    }

    #[test]
    fn test_trail_serializes_as_records_object() {
        let trail = AuditTrail::from(vec![NodeExecutionRecord::success("a", 1, Utc::now())]);
        let value = serde_json::to_value(&trail).unwrap();
        assert_eq!(value["records"].as_array().unwrap().len(), 1);
    }
}
