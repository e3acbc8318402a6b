// SPDX-License-Identifier: MIT

//! Built-in chat-to-chart nodes
//!
//! Rule-based stand-ins for the model-backed steps of the pipeline:
//! classify what the user wants, draft a query for it, pick a chart.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::config::AppConfig;
use crate::engine::node::{ErrorKind, Node, NodeError, NodeExecutor};
use crate::engine::state::{ChartArtifact, Role, WorkflowState};

pub const CLASSIFY_INTENT: &str = "classify_intent";
pub const GENERATE_SQL: &str = "generate_sql";
pub const RENDER_CHART: &str = "render_chart";

/// Keyword table: first match wins
const INTENT_KEYWORDS: &[(&str, &[&str])] = &[
    ("trend", &["over time", "per day", "per week", "per month", "by month", "by week", "trend"]),
    ("share", &["share", "breakdown", "percentage", "proportion"]),
    ("distribution", &["distribution", "histogram", "spread"]),
    ("comparison", &["compare", " vs ", "versus", " by ", "top "]),
];

/// Tags the session with what the user is asking for
pub struct IntentNode;

#[async_trait]
impl Node for IntentNode {
    fn name(&self) -> &str {
        CLASSIFY_INTENT
    }

    async fn run(&self, state: &WorkflowState) -> Result<WorkflowState, NodeError> {
        let question = state
            .last_user_message()
            .ok_or_else(|| NodeError::invalid_request("conversation has no user message"))?;
        let intent = classify(question);
        log::debug!("Session {} intent: {}", state.session_id, intent);

        let mut next = state.clone();
        next.data_context.query = Some(question.to_string());
        next.conversation.user_intent = Some(intent.to_string());
        Ok(next)
    }
}

fn classify(question: &str) -> &'static str {
    let lowered = format!(" {} ", question.to_lowercase());
    INTENT_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
        .map(|(intent, _)| *intent)
        .unwrap_or("lookup")
}

/// Drafts SQL for the classified question against one table
pub struct SqlDraftNode {
    datasource_id: String,
    table: String,
}

impl SqlDraftNode {
    pub fn new(datasource_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            datasource_id: datasource_id.into(),
            table: table.into(),
        }
    }
}

#[async_trait]
impl Node for SqlDraftNode {
    fn name(&self) -> &str {
        GENERATE_SQL
    }

    async fn run(&self, state: &WorkflowState) -> Result<WorkflowState, NodeError> {
        if state.data_context.query.is_none() {
            return Err(NodeError::invalid_request("no query to draft SQL for"));
        }
        let intent = state.conversation.user_intent.as_deref().unwrap_or("lookup");
        let (select, group, columns): (&str, &str, [&str; 2]) = match intent {
            "trend" => (
                "date_trunc('week', created_at) AS period, count(*) AS value",
                " GROUP BY 1 ORDER BY 1",
                ["period", "value"],
            ),
            "distribution" => ("amount AS bucket, count(*) AS value", " GROUP BY 1", ["bucket", "value"]),
            "share" | "comparison" => (
                "category, sum(amount) AS value",
                " GROUP BY 1 ORDER BY 2 DESC",
                ["category", "value"],
            ),
            _ => ("id AS label, amount AS value", "", ["label", "value"]),
        };
        let sql = format!(
            "SELECT {} FROM {}{} LIMIT {}",
            select, self.table, group, state.data_context.row_limit
        );

        let mut next = state.clone();
        next.data_context.datasource_id = Some(self.datasource_id.clone());
        next.data_context.generated_sql = Some(sql);
        next.data_context.columns = columns.iter().map(|c| c.to_string()).collect();
        next.push_message(Role::Assistant, "Drafted a query for your question.");
        Ok(next)
    }
}

/// Picks a chart type for the intent and adds it as the selected chart
pub struct ChartNode;

#[async_trait]
impl Node for ChartNode {
    fn name(&self) -> &str {
        RENDER_CHART
    }

    async fn run(&self, state: &WorkflowState) -> Result<WorkflowState, NodeError> {
        let data = &state.data_context;
        let sql = data
            .generated_sql
            .as_deref()
            .ok_or_else(|| NodeError::invalid_request("no SQL to chart"))?;
        let [x, y] = match data.columns.as_slice() {
            [x, y, ..] => [x.as_str(), y.as_str()],
            _ => {
                return Err(NodeError::invalid_model_output(
                    "query result needs at least two columns",
                ))
            }
        };
        let chart_type = match state.conversation.user_intent.as_deref() {
            Some("trend") => "line",
            Some("share") => "pie",
            Some("distribution") => "histogram",
            Some("comparison") => "bar",
            _ => "table",
        };

        let mut next = state.clone();
        let chart_id = next_chart_id(&next);
        next.add_chart(ChartArtifact {
            chart_id: chart_id.clone(),
            chart_type: chart_type.to_string(),
            title: data.query.clone(),
            spec: json!({
                "mark": chart_type,
                "data": {"sql": sql, "datasource": data.datasource_id},
                "encoding": {"x": {"field": x}, "y": {"field": y}}
            }),
        });
        next.push_message(Role::Assistant, format!("Here is a {} chart ({}).", chart_type, chart_id));
        Ok(next)
    }
}

/// First `chart-N` id not already taken in the session
fn next_chart_id(state: &WorkflowState) -> String {
    (1..)
        .map(|n| format!("chart-{}", n))
        .find(|id| !state.artifacts.charts.iter().any(|c| &c.chart_id == id))
        .unwrap_or_default()
}

/// Wraps a node and fails its first `failures` calls with `kind`.
///
/// Used by `chartflow demo --flaky` to show retries in the audit trail.
pub struct FlakyNode {
    inner: Arc<dyn Node>,
    kind: ErrorKind,
    remaining: AtomicU32,
}

impl FlakyNode {
    pub fn new(inner: Arc<dyn Node>, kind: ErrorKind, failures: u32) -> Self {
        Self {
            inner,
            kind,
            remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Node for FlakyNode {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, state: &WorkflowState) -> Result<WorkflowState, NodeError> {
        let left = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if left.is_ok() {
            return Err(NodeError::new(self.kind, "simulated upstream failure"));
        }
        self.inner.run(state).await
    }
}

/// The three built-in nodes with their configured retry policies
pub fn default_pipeline(config: &AppConfig, datasource_id: &str, table: &str) -> Vec<NodeExecutor> {
    let nodes: Vec<Arc<dyn Node>> = vec![
        Arc::new(IntentNode),
        Arc::new(SqlDraftNode::new(datasource_id, table)),
        Arc::new(ChartNode),
    ];
    nodes
        .into_iter()
        .map(|node| {
            let policy = config.policy_for(node.name());
            NodeExecutor::new(node, policy)
        })
        .collect()
}

/// `default_pipeline` whose intent node fails its first `failures` calls
/// with a timeout.
///
/// Every call builds fresh nodes, so the failure budget is never shared
/// between sessions.
pub fn flaky_pipeline(
    config: &AppConfig,
    datasource_id: &str,
    table: &str,
    failures: u32,
) -> Vec<NodeExecutor> {
    let mut pipeline = default_pipeline(config, datasource_id, table);
    if failures > 0 {
        if let Some(first) = pipeline.first_mut() {
            let node = Arc::new(FlakyNode::new(Arc::new(IntentNode), ErrorKind::Timeout, failures));
            *first = NodeExecutor::new(node, first.policy().clone());
        }
    }
    pipeline
}
