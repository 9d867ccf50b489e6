//! Human-in-the-loop approval. A gate presents generated content to a
//! pluggable handler and blocks the requesting worker until a terminal
//! state is reached or the timeout elapses. Only the handler interface is
//! part of the engine; console and auto handlers ship as defaults.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub workflow_id: String,
    pub stage: String,
    pub content: String,
}

impl ApprovalRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        stage: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            stage: stage.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub comment: Option<String>,
}

impl ApprovalResponse {
    pub fn approved() -> Self {
        Self {
            approved: true,
            comment: None,
        }
    }

    pub fn rejected(comment: impl Into<String>) -> Self {
        Self {
            approved: false,
            comment: Some(comment.into()),
        }
    }
}

pub trait ApprovalHandler: Send + Sync {
    fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
    ) -> BoxFuture<'_, EngineResult<ApprovalResponse>>;

    fn is_interactive(&self) -> bool;

    fn description(&self) -> &str;
}

/// Per-stage state machine: `Pending` to exactly one of `Approved`,
/// `Rejected`, `TimedOut` or `Cancelled`.
pub struct ApprovalGate {
    handler: Arc<dyn ApprovalHandler>,
    timeout: Duration,
    states: DashMap<Uuid, ApprovalState>,
}

impl ApprovalGate {
    pub fn new(handler: Arc<dyn ApprovalHandler>, timeout: Duration) -> Self {
        Self {
            handler,
            timeout,
            states: DashMap::new(),
        }
    }

    /// Blocks until the handler answers or the timeout elapses. A timeout
    /// raises; a rejection is returned so the caller can fail the stage
    /// with its own error.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> EngineResult<ApprovalResponse> {
        let id = request.id;
        let stage = request.stage.clone();
        self.states.insert(id, ApprovalState::Pending);
        tracing::info!(
            stage = %stage,
            handler = self.handler.description(),
            "awaiting approval"
        );

        match tokio::time::timeout(self.timeout, self.handler.request_approval(request, self.timeout))
            .await
        {
            Err(_) => {
                self.states.insert(id, ApprovalState::TimedOut);
                Err(EngineError::timeout(format!(
                    "approval for stage '{}' timed out after {}s",
                    stage,
                    self.timeout.as_secs()
                ))
                .with_context(stage))
            },
            Ok(Err(e)) => {
                self.states.insert(id, ApprovalState::Cancelled);
                Err(e)
            },
            Ok(Ok(response)) => {
                let state = if response.approved {
                    ApprovalState::Approved
                } else {
                    ApprovalState::Rejected
                };
                self.states.insert(id, state);
                Ok(response)
            },
        }
    }

    pub fn state(&self, id: Uuid) -> Option<ApprovalState> {
        self.states.get(&id).map(|entry| *entry.value())
    }
}

/// Non-interactive handler that waves every stage through. The default for
/// unattended runs.
pub struct AutoApprovalHandler;

impl ApprovalHandler for AutoApprovalHandler {
    fn request_approval(
        &self,
        request: ApprovalRequest,
        _timeout: Duration,
    ) -> BoxFuture<'_, EngineResult<ApprovalResponse>> {
        Box::pin(async move {
            tracing::debug!(stage = %request.stage, "auto-approving stage");
            Ok(ApprovalResponse::approved())
        })
    }

    fn is_interactive(&self) -> bool {
        false
    }

    fn description(&self) -> &str {
        "auto-approve"
    }
}

/// Prompts on the terminal and reads one line from stdin.
pub struct ConsoleApprovalHandler;

impl ApprovalHandler for ConsoleApprovalHandler {
    fn request_approval(
        &self,
        request: ApprovalRequest,
        _timeout: Duration,
    ) -> BoxFuture<'_, EngineResult<ApprovalResponse>> {
        Box::pin(async move {
            let answer = tokio::task::spawn_blocking(move || {
                println!();
                println!("=== Approval required: {} / {} ===", request.workflow_id, request.stage);
                println!("{}", request.content);
                println!("Approve? [y/N] ");

                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|_| line)
            })
            .await
            .map_err(|e| EngineError::internal("approval prompt task failed").with_source(e))??;

            let trimmed = answer.trim();
            if trimmed.eq_ignore_ascii_case("y") || trimmed.eq_ignore_ascii_case("yes") {
                Ok(ApprovalResponse::approved())
            } else {
                Ok(ApprovalResponse::rejected(format!(
                    "operator answered '{trimmed}'"
                )))
            }
        })
    }

    fn is_interactive(&self) -> bool {
        true
    }

    fn description(&self) -> &str {
        "console"
    }
}
