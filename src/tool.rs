//! Tool capability and registry.
//!
//! Tools are stateless, thread-safe singletons registered at startup. They
//! never raise for expected failures: a failed run comes back as
//! `ExecutionResult { success: false, .. }`.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::task::{ExecutionInput, ExecutionResult};

pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Free text consumed by LLM prompts for tool selection.
    fn description(&self) -> &str;

    fn run(&self, input: ExecutionInput) -> BoxFuture<'_, ExecutionResult>;
}

/// Name → tool mapping. Lookups are lock-free; registering a tool under an
/// existing name replaces the prior tool.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
