// SPDX-License-Identifier: MIT

//! Workflow nodes and their execution wrapper
//!
//! A node is a pure transformation from one `WorkflowState` to the next.
//! Validation, retries, audit records and snapshots are not the node's
//! business; `NodeExecutor` composes them around it.

mod executor;
mod policy;

pub use executor::{execute_node, NodeExecutor};
pub use policy::{BackoffStrategy, RetryPolicy};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::engine::state::WorkflowState;

/// A single step of a chat-to-chart session.
///
/// Implementations receive a borrowed state and must return a new one; the
/// input is never modified in place.
#[async_trait]
pub trait Node: Send + Sync {
    /// Name written to audit records and logs
    fn name(&self) -> &str;

    /// Produce the next state
    async fn run(&self, state: &WorkflowState) -> Result<WorkflowState, NodeError>;
}

/// Classification of a node failure, matched against a retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An upstream call did not answer in time
    Timeout,
    /// The model provider or warehouse is unreachable
    UpstreamUnavailable,
    /// The upstream refused the call for now
    RateLimited,
    /// The request built from the state was rejected
    InvalidRequest,
    /// The model answered with something the node cannot use
    InvalidModelOutput,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::RateLimited => "rate_limited",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidModelOutput => "invalid_model_output",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a node body
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn invalid_model_output(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidModelOutput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

type NodeFuture = Pin<Box<dyn Future<Output = Result<WorkflowState, NodeError>> + Send>>;

/// A node built from an async closure.
///
/// The closure receives an owned clone of the input state, so it is free to
/// modify and return it.
pub struct FnNode {
    name: String,
    func: Arc<dyn Fn(WorkflowState) -> NodeFuture + Send + Sync>,
}

impl FnNode {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkflowState, NodeError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(move |state| Box::pin(func(state))),
        }
    }
}

#[async_trait]
impl Node for FnNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, state: &WorkflowState) -> Result<WorkflowState, NodeError> {
        (self.func)(state.clone()).await
    }
}

impl fmt::Debug for FnNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnNode").field("name", &self.name).finish()
    }
}
