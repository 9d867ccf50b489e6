//! Per-task sub-agents. A sub-agent renders nothing itself; it receives a
//! fully rendered prompt, carries its own durable memory window, calls the
//! LLM, dispatches tool-call directives through the registry (bounded), and
//! reports its outcome in-band.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::EngineResult;
use crate::llm::{LlmClient, LlmRequest, Message, ToolSpec};
use crate::memory::MemoryStore;
use crate::task::{ExecutionInput, ExecutionResult};
use crate::tool::ToolRegistry;

const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 5;
const DEFAULT_CONTEXT_WINDOW: u32 = 20;

/// What the executor dispatches tasks to. `Err` is reserved for
/// infrastructure failures (storage); task-level failures are in-band.
pub trait TaskAgent: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, input: ExecutionInput) -> BoxFuture<'_, EngineResult<ExecutionResult>>;
}

pub struct SubAgent {
    agent_name: String,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    memory: Arc<MemoryStore>,
    system_prompt: Option<String>,
    context_window: u32,
    max_tool_iterations: u32,
}

impl SubAgent {
    pub fn new(
        agent_name: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        memory: Arc<MemoryStore>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            llm,
            tools,
            memory,
            system_prompt: None,
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn with_max_tool_iterations(mut self, max_tool_iterations: u32) -> Self {
        self.max_tool_iterations = max_tool_iterations;
        self
    }

    async fn run_inner(&self, input: ExecutionInput) -> EngineResult<ExecutionResult> {
        let mut history = self.conversation_context().await?;

        let tool_specs: Vec<ToolSpec> = self
            .tools
            .list_names()
            .into_iter()
            .filter_map(|name| {
                self.tools.get(&name).map(|tool| ToolSpec {
                    name,
                    description: tool.description().to_owned(),
                })
            })
            .collect();

        let mut prompt = input.content.clone();
        let final_text = loop {
            let request = LlmRequest {
                system_prompt: self.system_prompt.clone(),
                history: history.clone(),
                prompt: prompt.clone(),
                tool_specs: tool_specs.clone(),
            };

            let response = match self.llm.generate(request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(agent = %self.agent_name, error = %e, "LLM call failed");
                    return Ok(ExecutionResult::failure(format!("LLM call failed: {e}")));
                },
            };

            let Some(call) = response.tool_call else {
                break response.text;
            };

            let iterations = history
                .iter()
                .filter(|m| m.role == crate::llm::Role::Tool)
                .count() as u32;
            if iterations >= self.max_tool_iterations {
                return Ok(ExecutionResult::failure(format!(
                    "Tool iteration limit ({}) reached without a final response",
                    self.max_tool_iterations
                )));
            }

            let Some(tool) = self.tools.get(&call.name) else {
                return Ok(ExecutionResult::failure(format!(
                    "Tool '{}' not found",
                    call.name
                )));
            };

            let arguments = match &call.arguments {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            tracing::debug!(agent = %self.agent_name, tool = %call.name, "dispatching tool call");
            let tool_result = tool.run(ExecutionInput::new(arguments)).await;

            history.push(Message::assistant(format!(
                "[tool call] {} {}",
                call.name, call.arguments
            )));
            history.push(Message::tool(format!(
                "[{}] success={} {}",
                call.name, tool_result.success, tool_result.output
            )));
            prompt = format!(
                "Tool '{}' returned (success={}):\n{}\nContinue the task using this result.",
                call.name, tool_result.success, tool_result.output
            );
        };

        self.memory
            .add_memory(&self.agent_name, &format!("user: {}", input.content))
            .await?;
        self.memory
            .add_memory(&self.agent_name, &format!("assistant: {final_text}"))
            .await?;

        Ok(ExecutionResult::ok(final_text))
    }

    /// Last N memory entries for this agent, mapped back to chat roles.
    async fn conversation_context(&self) -> EngineResult<Vec<Message>> {
        let entries = self
            .memory
            .load_memory(&self.agent_name, self.context_window)
            .await?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                if let Some(content) = entry.content.strip_prefix("user: ") {
                    Message::user(content)
                } else if let Some(content) = entry.content.strip_prefix("assistant: ") {
                    Message::assistant(content)
                } else {
                    Message::assistant(entry.content)
                }
            })
            .collect())
    }
}

impl TaskAgent for SubAgent {
    fn name(&self) -> &str {
        &self.agent_name
    }

    fn execute(&self, input: ExecutionInput) -> BoxFuture<'_, EngineResult<ExecutionResult>> {
        Box::pin(self.run_inner(input))
    }
}
