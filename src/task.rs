//! Plan and execution value types shared across the engine.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// One named unit of work inside a plan. Immutable after plan construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_name: String,
    pub task_description: String,
    pub prompt_template: String,
}

impl TaskDefinition {
    pub fn new(
        task_name: impl Into<String>,
        task_description: impl Into<String>,
        prompt_template: impl Into<String>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            task_description: task_description.into(),
            prompt_template: prompt_template.into(),
        }
    }
}

/// An ordered sequence of task definitions for one workflow. The order is
/// semantically significant: it defines the `prev_output` predecessor for
/// each task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub workflow_id: String,
    pub tasks: Vec<TaskDefinition>,
}

impl Plan {
    pub fn new(workflow_id: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            tasks,
        }
    }

    /// Task names must be unique within the plan and non-empty.
    pub fn validate(&self) -> EngineResult<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(EngineError::invalid_input("workflow id must not be blank"));
        }
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.task_name.trim().is_empty() {
                return Err(EngineError::invalid_input("task name must not be blank")
                    .with_context(self.workflow_id.clone()));
            }
            if !seen.insert(task.task_name.as_str()) {
                return Err(EngineError::invalid_input(format!(
                    "duplicate task name '{}'",
                    task.task_name
                ))
                .with_context(self.workflow_id.clone()));
            }
        }
        Ok(())
    }

    /// Authored-order predecessor of the named task, if any.
    pub fn predecessor_of(&self, task_name: &str) -> Option<&TaskDefinition> {
        let index = self
            .tasks
            .iter()
            .position(|task| task.task_name == task_name)?;
        if index == 0 {
            None
        } else {
            self.tasks.get(index - 1)
        }
    }
}

/// Prompt/argument handed to a tool or sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInput {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExecutionInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of a tool or sub-agent invocation. Expected failures are carried
/// in-band (`success == false`), never as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Per-task outcome returned by the executor, in authored plan order.
/// `cached` marks outputs restored from storage instead of executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_name: String,
    pub result: ExecutionResult,
    pub cached: bool,
}
