//! Workflow orchestration glue: validates and persists the plan, analyzes
//! dependencies into batches, and drives the parallel executor with a
//! sub-agent minted per task.

use std::sync::Arc;

use crate::agent::{SubAgent, TaskAgent};
use crate::analyzer::DependencyAnalyzer;
use crate::approval::ApprovalGate;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::executor::{AgentFactory, ParallelTaskExecutor};
use crate::llm::LlmClient;
use crate::memory::MemoryStore;
use crate::task::{Plan, TaskDefinition, TaskResult};
use crate::tool::ToolRegistry;

pub struct Orchestrator {
    memory: Arc<MemoryStore>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    analyzer: DependencyAnalyzer,
    config: Config,
    approval: Option<Arc<ApprovalGate>>,
}

impl Orchestrator {
    pub fn new(
        memory: Arc<MemoryStore>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        config: Config,
    ) -> Self {
        Self {
            memory,
            llm,
            tools,
            analyzer: DependencyAnalyzer::new(),
            config,
            approval: None,
        }
    }

    pub fn with_approval_gate(mut self, gate: Arc<ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// Run a plan end to end. The plan is persisted only once analysis has
    /// accepted it, so a rejected plan leaves no trace.
    pub async fn run_workflow(
        &self,
        plan: &Plan,
        user_request: &str,
    ) -> EngineResult<Vec<TaskResult>> {
        plan.validate()?;
        let batches = self.analyzer.analyze(&plan.tasks)?;
        self.memory.save_plan(&plan.workflow_id, &plan.tasks).await?;

        tracing::info!(
            workflow = %plan.workflow_id,
            tasks = plan.tasks.len(),
            batches = batches.len(),
            "executing workflow"
        );

        let factory: Arc<dyn AgentFactory> = Arc::new(SubAgentFactory {
            llm: Arc::clone(&self.llm),
            tools: Arc::clone(&self.tools),
            memory: Arc::clone(&self.memory),
            context_window: self.config.memory.max_entries,
        });

        let mut executor =
            ParallelTaskExecutor::new(Arc::clone(&self.memory), factory, &self.config.executor);
        if let Some(gate) = &self.approval {
            executor = executor.with_approval_gate(Arc::clone(gate));
        }

        executor.execute(plan, user_request, &batches).await
    }

    /// Re-run a workflow from its persisted plan. Tasks whose outputs
    /// survived the previous run are not executed again.
    pub async fn resume_workflow(
        &self,
        workflow_id: &str,
        user_request: &str,
    ) -> EngineResult<Vec<TaskResult>> {
        let tasks = self
            .memory
            .load_plan(workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!("no persisted plan for workflow '{workflow_id}'"))
            })?;
        let plan = Plan::new(workflow_id, tasks);
        self.run_workflow(&plan, user_request).await
    }
}

struct SubAgentFactory {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    memory: Arc<MemoryStore>,
    context_window: u32,
}

impl AgentFactory for SubAgentFactory {
    fn create(&self, task: &TaskDefinition) -> Arc<dyn TaskAgent> {
        let system_prompt = if task.task_description.is_empty() {
            format!("You are the sub-agent responsible for task '{}'.", task.task_name)
        } else {
            format!(
                "You are the sub-agent responsible for task '{}': {}",
                task.task_name, task.task_description
            )
        };

        Arc::new(
            SubAgent::new(
                task.task_name.clone(),
                Arc::clone(&self.llm),
                Arc::clone(&self.tools),
                Arc::clone(&self.memory),
            )
            .with_system_prompt(system_prompt)
            .with_context_window(self.context_window),
        )
    }
}
