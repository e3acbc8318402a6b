// SPDX-License-Identifier: MIT

//! Validate, run, retry, audit and snapshot one node invocation

use chrono::Utc;
use std::sync::Arc;

use super::{Node, RetryPolicy};
use crate::engine::audit::{AuditTrail, NodeExecutionRecord};
use crate::engine::error::WorkflowError;
use crate::engine::snapshot::{create_state_snapshot, Snapshot};
use crate::engine::state::{validate_state, validate_with_checksum, FieldViolation, WorkflowState};

/// A node paired with the retry policy it runs under
#[derive(Clone)]
pub struct NodeExecutor {
    node: Arc<dyn Node>,
    policy: RetryPolicy,
}

impl NodeExecutor {
    pub fn new(node: Arc<dyn Node>, policy: RetryPolicy) -> Self {
        Self { node, policy }
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the node against `input`, appending every attempt to `audit`
    pub async fn execute(
        &self,
        input: &WorkflowState,
        audit: &mut AuditTrail,
    ) -> Result<Snapshot, WorkflowError> {
        execute_node(self.node.as_ref(), &self.policy, input, audit).await
    }
}

impl std::fmt::Debug for NodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeExecutor")
            .field("node", &self.node.name())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Execute `node` under `policy`.
///
/// 1. The input must validate (and match its checksum, if it has one);
///    otherwise the node never runs and nothing is recorded.
/// 2. Failures of a retryable kind are retried until the policy's attempts
///    run out, each one leaving a `retried` record.
/// 3. A successful output must keep the session id and schema version and
///    validate; a bad output is recorded as `failed` and not retried.
/// 4. The output's audit becomes the input's records followed by this
///    invocation's records, and the result is snapshotted.
///
/// Every record is appended to `audit` as well, including those of a failed
/// invocation.
pub async fn execute_node(
    node: &dyn Node,
    policy: &RetryPolicy,
    input: &WorkflowState,
    audit: &mut AuditTrail,
) -> Result<Snapshot, WorkflowError> {
    let name = node.name().to_string();

    let checked = validate_with_checksum(input);
    if !checked.is_valid() {
        log::error!(
            "Refusing to run node '{}' on session {}: input state is invalid",
            name,
            input.session_id
        );
        return Err(WorkflowError::InvalidInputState {
            node: name,
            violations: checked.into_violations(),
        });
    }

    let max_attempts = policy.attempts();
    let mut trail = input.audit.clone();
    let mut attempt = 1u32;

    loop {
        let started_at = Utc::now();
        log::debug!(
            "Running node '{}' for session {} (attempt {}/{})",
            name,
            input.session_id,
            attempt,
            max_attempts
        );

        let error = match node.run(input).await {
            Ok(mut output) => {
                let mut violations = identity_violations(input, &output);
                output.audit = trail.clone();
                output.checksum = None;
                violations.extend(validate_state(&output).into_violations());

                if !violations.is_empty() {
                    let detail = format!(
                        "invalid output state: {}",
                        violations
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join("; ")
                    );
                    record(
                        audit,
                        None,
                        NodeExecutionRecord::failed(&name, attempt, started_at, detail),
                    );
                    return Err(WorkflowError::InvalidOutputState {
                        node: name,
                        violations,
                    });
                }

                record(
                    audit,
                    Some(&mut output.audit),
                    NodeExecutionRecord::success(&name, attempt, started_at),
                );
                return Ok(create_state_snapshot(output)?);
            }
            Err(error) => error,
        };

        if attempt < max_attempts && policy.is_retryable(error.kind) {
            record(
                audit,
                Some(&mut trail),
                NodeExecutionRecord::retried(&name, attempt, started_at, error.to_string()),
            );
            let delay = policy.delay_for(attempt);
            log::info!(
                "Retrying node '{}' in {:.3}s (attempt {}/{})",
                name,
                delay.as_secs_f64(),
                attempt + 1,
                max_attempts
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            continue;
        }

        record(
            audit,
            None,
            NodeExecutionRecord::failed(&name, attempt, started_at, error.to_string()),
        );
        return Err(WorkflowError::NodeFailed {
            node: name,
            attempts: attempt,
            source: error,
        });
    }
}

fn record(sink: &mut AuditTrail, state_trail: Option<&mut AuditTrail>, entry: NodeExecutionRecord) {
    entry.emit();
    if let Some(trail) = state_trail {
        trail.append(entry.clone());
    }
    sink.append(entry);
}

fn identity_violations(input: &WorkflowState, output: &WorkflowState) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    if output.session_id != input.session_id {
        violations.push(FieldViolation::invalid(
            "session_id",
            format!(
                "changed from '{}' to '{}'",
                input.session_id, output.session_id
            ),
        ));
    }
    if output.schema_version != input.schema_version {
        violations.push(FieldViolation::invalid(
            "schema_version",
            format!(
                "changed from {} to {}",
                input.schema_version, output.schema_version
            ),
        ));
    }
    violations
}
