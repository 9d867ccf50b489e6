//! Batch execution. Batches run sequentially; tasks within a batch run
//! concurrently under a bounded worker pool with per-task and per-batch
//! deadlines. Every completed output is persisted before the next batch
//! starts, which is what makes a crashed run resumable: on start the
//! executor preloads persisted outputs and short-circuits any task whose
//! output already exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{StreamExt, stream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::agent::TaskAgent;
use crate::analyzer::Batch;
use crate::approval::{ApprovalGate, ApprovalRequest};
use crate::config::ExecutorConfig;
use crate::error::{EngineError, EngineResult};
use crate::memory::MemoryStore;
use crate::task::{ExecutionInput, ExecutionResult, Plan, TaskDefinition, TaskResult};
use crate::template::{self, PREV_OUTPUT, USER_REQUEST};

/// Mints the sub-agent for one task. The executor creates one agent per
/// task dispatch; agents are never shared across tasks.
pub trait AgentFactory: Send + Sync {
    fn create(&self, task: &TaskDefinition) -> Arc<dyn TaskAgent>;
}

pub struct ParallelTaskExecutor {
    memory: Arc<MemoryStore>,
    agents: Arc<dyn AgentFactory>,
    max_parallelism: usize,
    task_timeout: Duration,
    approval: Option<Arc<ApprovalGate>>,
}

impl ParallelTaskExecutor {
    pub fn new(
        memory: Arc<MemoryStore>,
        agents: Arc<dyn AgentFactory>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            memory,
            agents,
            max_parallelism: config.max_parallelism.max(1),
            task_timeout: config.task_timeout,
            approval: None,
        }
    }

    /// Pause between batches until the handler approves the content the
    /// previous batch produced.
    pub fn with_approval_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// Execute the analyzer's batch list for one workflow run. The returned
    /// results mirror the authored plan order regardless of completion
    /// order.
    pub async fn execute(
        &self,
        plan: &Plan,
        user_request: &str,
        batches: &[Batch],
    ) -> EngineResult<Vec<TaskResult>> {
        // Resume path: anything already persisted is treated as completed.
        let outputs: Arc<DashMap<String, String>> = Arc::new(
            self.memory
                .load_task_outputs(&plan.workflow_id)
                .await?
                .into_iter()
                .collect(),
        );
        if !outputs.is_empty() {
            tracing::info!(
                workflow = %plan.workflow_id,
                resumed = outputs.len(),
                "resuming with persisted task outputs"
            );
        }

        let results: DashMap<String, TaskResult> = DashMap::new();

        for (batch_index, batch) in batches.iter().enumerate() {
            tracing::debug!(
                workflow = %plan.workflow_id,
                batch = batch_index,
                tasks = batch.len(),
                "starting batch"
            );

            if batch.len() == 1 {
                // Single-task batches run inline.
                let task = &batch[0];
                let outcome = match timeout(
                    self.task_timeout,
                    self.run_task(plan, user_request, task, &outputs),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(self.task_timeout_error(&task.task_name)),
                };
                let task_result = self.settle_unit(&task.task_name, outcome)?;
                results.insert(task.task_name.clone(), task_result);
            } else {
                let batch_deadline = self.task_timeout * batch.len() as u32;
                let collected = timeout(batch_deadline, self.run_batch(plan, user_request, batch, &outputs))
                    .await
                    .map_err(|_| {
                        EngineError::timeout(format!(
                            "batch {} timed out after {}s; in-flight tasks cancelled",
                            batch_index,
                            batch_deadline.as_secs()
                        ))
                        .with_context(plan.workflow_id.clone())
                    })?;

                // All units have settled; surface the first failure in
                // authored batch order.
                let mut by_name: HashMap<String, EngineResult<TaskResult>> =
                    collected.into_iter().collect();
                for task in batch {
                    let Some(outcome) = by_name.remove(&task.task_name) else {
                        return Err(EngineError::internal(format!(
                            "task '{}' produced no result",
                            task.task_name
                        )));
                    };
                    let task_result = self.settle_unit(&task.task_name, outcome)?;
                    results.insert(task.task_name.clone(), task_result);
                }
            }

            if let Some(gate) = &self.approval {
                if batch_index + 1 < batches.len() {
                    self.gate_next_batch(gate, plan, batch_index, batch, &results)
                        .await?;
                }
            }
        }

        Ok(plan
            .tasks
            .iter()
            .filter_map(|task| results.remove(&task.task_name).map(|(_, result)| result))
            .collect())
    }

    /// Run every task of one batch concurrently, bounded by the worker-pool
    /// width, and collect all outcomes. Dropping the returned future (batch
    /// timeout) cancels the still-running units cooperatively.
    async fn run_batch(
        &self,
        plan: &Plan,
        user_request: &str,
        batch: &Batch,
        outputs: &Arc<DashMap<String, String>>,
    ) -> Vec<(String, EngineResult<TaskResult>)> {
        let (tx, mut rx) = mpsc::channel(batch.len());

        stream::iter(batch)
            .for_each_concurrent(Some(self.max_parallelism), |task| {
                let tx = tx.clone();
                async move {
                    let outcome = match timeout(
                        self.task_timeout,
                        self.run_task(plan, user_request, task, outputs),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(self.task_timeout_error(&task.task_name)),
                    };
                    // The receiver outlives every sender; a send can only
                    // fail if the whole batch future was dropped.
                    let _ = tx.send((task.task_name.clone(), outcome)).await;
                }
            })
            .await;
        drop(tx);

        let mut collected = Vec::with_capacity(batch.len());
        while let Some(item) = rx.recv().await {
            collected.push(item);
        }
        collected
    }

    /// Execute one task: short-circuit on a persisted output, otherwise
    /// render the prompt from the accumulated outputs, dispatch the
    /// sub-agent, and persist the result before the batch barrier releases.
    async fn run_task(
        &self,
        plan: &Plan,
        user_request: &str,
        task: &TaskDefinition,
        outputs: &Arc<DashMap<String, String>>,
    ) -> EngineResult<TaskResult> {
        if let Some(existing) = outputs.get(&task.task_name) {
            tracing::debug!(task = %task.task_name, "output already persisted, skipping");
            return Ok(TaskResult {
                task_name: task.task_name.clone(),
                result: ExecutionResult::ok(existing.value().clone())
                    .with_metadata(serde_json::json!({ "cached": true })),
                cached: true,
            });
        }

        let mut variables: HashMap<String, String> = outputs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        variables.insert(USER_REQUEST.to_owned(), user_request.to_owned());
        let prev_output = plan
            .predecessor_of(&task.task_name)
            .and_then(|prev| outputs.get(&prev.task_name).map(|o| o.value().clone()))
            .unwrap_or_default();
        variables.insert(PREV_OUTPUT.to_owned(), prev_output);

        let prompt = template::render(&task.prompt_template, &variables);

        let agent = self.agents.create(task);
        tracing::info!(task = %task.task_name, agent = %agent.name(), "executing task");
        let result = agent.execute(ExecutionInput::new(prompt)).await?;

        if result.success {
            // Single writer per key: only this unit ever touches this task's
            // entry.
            self.memory
                .save_task_output(&plan.workflow_id, &task.task_name, &result.output)
                .await?;
            outputs.insert(task.task_name.clone(), result.output.clone());
        }

        Ok(TaskResult {
            task_name: task.task_name.clone(),
            result,
            cached: false,
        })
    }

    /// Convert a settled unit outcome into a task result, turning in-band
    /// task failures into the terminal workflow error.
    fn settle_unit(
        &self,
        task_name: &str,
        outcome: EngineResult<TaskResult>,
    ) -> EngineResult<TaskResult> {
        let task_result = outcome.map_err(|e| {
            tracing::error!(task = task_name, error = %e, "task failed");
            e
        })?;
        if !task_result.result.success {
            return Err(EngineError::internal(format!(
                "task '{}' failed: {}",
                task_name, task_result.result.output
            ))
            .with_context(task_name.to_owned()));
        }
        Ok(task_result)
    }

    async fn gate_next_batch(
        &self,
        gate: &ApprovalGate,
        plan: &Plan,
        batch_index: usize,
        batch: &Batch,
        results: &DashMap<String, TaskResult>,
    ) -> EngineResult<()> {
        let content = batch
            .iter()
            .filter_map(|task| {
                results
                    .get(&task.task_name)
                    .map(|r| format!("## {}\n{}", task.task_name, r.result.output))
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let stage = format!("batch-{batch_index}");
        let response = gate
            .request_approval(ApprovalRequest::new(&plan.workflow_id, &stage, content))
            .await?;

        if !response.approved {
            let reason = response
                .comment
                .unwrap_or_else(|| "no reason given".to_owned());
            return Err(EngineError::internal(format!(
                "stage '{stage}' rejected by approval handler: {reason}"
            ))
            .with_context(plan.workflow_id.clone()));
        }
        Ok(())
    }

    fn task_timeout_error(&self, task_name: &str) -> EngineError {
        EngineError::timeout(format!(
            "task '{}' timed out after {}s",
            task_name,
            self.task_timeout.as_secs()
        ))
        .with_context(task_name.to_owned())
    }
}
