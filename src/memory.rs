//! Durable storage for agent conversational memory, task outputs and
//! serialized plans, backed by SQLite through a bounded connection pool.
//!
//! Three relations:
//! - `agent_memory(id, agent_name, created_at, content)`: append-only log,
//!   insertion-ordered by the monotonic `id`;
//! - `task_outputs(workflow_id, task_name, output)`: one row per pair,
//!   upserted, which is what makes workflow runs crash-resumable;
//! - `workflow_plans(workflow_id, plan_json)`: upserted plan snapshots.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use crate::task::TaskDefinition;

const MAX_AGENT_NAME_LEN: usize = 255;

/// Databases whose schema has already been initialized by this process.
/// Probed lock-free, then re-checked under the mutex before running DDL.
static SCHEMA_READY: LazyLock<DashSet<String>> = LazyLock::new(DashSet::new);
static SCHEMA_INIT: Mutex<()> = Mutex::const_new(());

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agent_memory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_name VARCHAR(255) NOT NULL,
        created_at TIMESTAMP NOT NULL,
        content TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_agent_memory_agent_name
        ON agent_memory(agent_name)",
    "CREATE TABLE IF NOT EXISTS task_outputs (
        workflow_id VARCHAR(255) NOT NULL,
        task_name VARCHAR(255) NOT NULL,
        output TEXT NOT NULL,
        PRIMARY KEY (workflow_id, task_name)
    )",
    "CREATE TABLE IF NOT EXISTS workflow_plans (
        workflow_id VARCHAR(255) PRIMARY KEY,
        plan_json TEXT NOT NULL
    )",
];

/// One row of the `agent_memory` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub id: i64,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
    pub content: String,
}

/// Thread-safe store; every operation acquires and releases its own pooled
/// connection. The store owns the pool.
pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    pub async fn connect(config: &DatabaseConfig) -> EngineResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| {
                EngineError::configuration(format!("invalid database url '{}'", config.url))
                    .with_source(e)
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool, &config.url).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool, url: &str) -> EngineResult<()> {
        if SCHEMA_READY.contains(url) {
            return Ok(());
        }
        let _guard = SCHEMA_INIT.lock().await;
        if SCHEMA_READY.contains(url) {
            return Ok(());
        }
        for statement in SCHEMA.iter().copied() {
            sqlx::query(statement).execute(pool).await?;
        }
        SCHEMA_READY.insert(url.to_owned());
        Ok(())
    }

    /// Append one entry to an agent's memory log.
    pub async fn add_memory(&self, agent_name: &str, content: &str) -> EngineResult<()> {
        validate_agent_name(agent_name)?;
        sqlx::query("INSERT INTO agent_memory (agent_name, created_at, content) VALUES (?, ?, ?)")
            .bind(agent_name)
            .bind(Utc::now())
            .bind(content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Up to `limit` entries for one agent, oldest first.
    pub async fn load_memory(
        &self,
        agent_name: &str,
        limit: u32,
    ) -> EngineResult<Vec<MemoryEntry>> {
        validate_agent_name(agent_name)?;
        let rows = sqlx::query(
            "SELECT id, agent_name, created_at, content
             FROM agent_memory
             WHERE agent_name = ?
             ORDER BY id ASC
             LIMIT ?",
        )
        .bind(agent_name)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Memory windows for many agents in a single query: a windowed
    /// row-number partitioned by agent name, ordered by id ascending,
    /// filtered to `limit` rows per agent. Every requested name is present
    /// in the returned map, with an empty list when nothing is stored.
    pub async fn load_memory_bulk(
        &self,
        agent_names: &[String],
        limit: u32,
    ) -> EngineResult<HashMap<String, Vec<MemoryEntry>>> {
        let mut result: HashMap<String, Vec<MemoryEntry>> = HashMap::new();
        if agent_names.is_empty() {
            return Ok(result);
        }
        for name in agent_names {
            validate_agent_name(name)?;
            result.entry(name.clone()).or_default();
        }

        let placeholders = vec!["?"; agent_names.len()].join(", ");
        let sql = format!(
            "SELECT id, agent_name, created_at, content FROM (
                SELECT id, agent_name, created_at, content,
                       ROW_NUMBER() OVER (PARTITION BY agent_name ORDER BY id ASC) AS row_num
                FROM agent_memory
                WHERE agent_name IN ({placeholders})
            ) AS ranked
            WHERE row_num <= ?
            ORDER BY id ASC"
        );

        let mut query = sqlx::query(&sql);
        for name in agent_names {
            query = query.bind(name);
        }
        query = query.bind(i64::from(limit));

        for row in query.fetch_all(&self.pool).await?.iter() {
            let entry = row_to_entry(row)?;
            result
                .entry(entry.agent_name.clone())
                .or_default()
                .push(entry);
        }
        Ok(result)
    }

    /// Upsert one task output; exactly one row per (workflow, task), last
    /// write wins.
    pub async fn save_task_output(
        &self,
        workflow_id: &str,
        task_name: &str,
        output: &str,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO task_outputs (workflow_id, task_name, output) VALUES (?, ?, ?)
             ON CONFLICT(workflow_id, task_name) DO UPDATE SET output = excluded.output",
        )
        .bind(workflow_id)
        .bind(task_name)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All persisted outputs for one workflow; empty map when none exist.
    pub async fn load_task_outputs(
        &self,
        workflow_id: &str,
    ) -> EngineResult<HashMap<String, String>> {
        let rows = sqlx::query("SELECT task_name, output FROM task_outputs WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("task_name"), row.get("output")))
            .collect())
    }

    /// Upsert the serialized plan for one workflow.
    pub async fn save_plan(
        &self,
        workflow_id: &str,
        tasks: &[TaskDefinition],
    ) -> EngineResult<()> {
        let plan_json = serde_json::to_string(tasks)?;
        sqlx::query(
            "INSERT INTO workflow_plans (workflow_id, plan_json) VALUES (?, ?)
             ON CONFLICT(workflow_id) DO UPDATE SET plan_json = excluded.plan_json",
        )
        .bind(workflow_id)
        .bind(plan_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_plan(&self, workflow_id: &str) -> EngineResult<Option<Vec<TaskDefinition>>> {
        let row = sqlx::query("SELECT plan_json FROM workflow_plans WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let plan_json: String = row.get("plan_json");
                Ok(Some(serde_json::from_str(&plan_json)?))
            },
            None => Ok(None),
        }
    }

    /// Dispose the connection pool. Safe to call exactly once; a second call
    /// is a no-op.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn validate_agent_name(agent_name: &str) -> EngineResult<()> {
    if agent_name.trim().is_empty() {
        return Err(EngineError::invalid_input("agent name must not be blank"));
    }
    if agent_name.chars().count() > MAX_AGENT_NAME_LEN {
        return Err(EngineError::invalid_input(format!(
            "agent name exceeds {MAX_AGENT_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> EngineResult<MemoryEntry> {
    Ok(MemoryEntry {
        id: row.get("id"),
        agent_name: row.get("agent_name"),
        created_at: row.get("created_at"),
        content: row.get("content"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    async fn open_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("maestro.db").display()),
            max_connections: 5,
            ..DatabaseConfig::default()
        };
        let store = MemoryStore::connect(&config).await.expect("connect");
        (store, dir)
    }

    #[tokio::test]
    async fn test_memory_is_insertion_ordered() {
        let (store, _dir) = open_store().await;
        store.add_memory("researcher", "first").await.unwrap();
        store.add_memory("researcher", "second").await.unwrap();
        store.add_memory("researcher", "third").await.unwrap();

        let entries = store.load_memory("researcher", 10).await.unwrap();
        let contents: Vec<_> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_memory_limit_truncates() {
        let (store, _dir) = open_store().await;
        for i in 0..5 {
            store
                .add_memory("writer", &format!("entry-{i}"))
                .await
                .unwrap();
        }
        let entries = store.load_memory("writer", 2).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "entry-0");
        assert_eq!(entries[1].content, "entry-1");
    }

    #[tokio::test]
    async fn test_memory_zero_limit_is_empty() {
        let (store, _dir) = open_store().await;
        store.add_memory("a", "x").await.unwrap();
        assert!(store.load_memory("a", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_load_matches_single_loads() {
        let (store, _dir) = open_store().await;
        for agent in ["alpha", "beta"] {
            for i in 0..4 {
                store
                    .add_memory(agent, &format!("{agent}-{i}"))
                    .await
                    .unwrap();
            }
        }

        let names = vec!["alpha".to_owned(), "beta".to_owned(), "ghost".to_owned()];
        let bulk = store.load_memory_bulk(&names, 3).await.unwrap();
        assert_eq!(bulk.len(), 3);
        for name in &names {
            let single = store.load_memory(name, 3).await.unwrap();
            assert_eq!(bulk[name], single, "mismatch for {name}");
        }
        assert!(bulk["ghost"].is_empty());
    }

    #[tokio::test]
    async fn test_bulk_load_empty_input() {
        let (store, _dir) = open_store().await;
        assert!(store.load_memory_bulk(&[], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_load_rejects_blank_names() {
        let (store, _dir) = open_store().await;
        let err = store
            .load_memory_bulk(&["ok".to_owned(), "   ".to_owned()], 5)
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidInput);
    }

    #[tokio::test]
    async fn test_add_memory_rejects_oversized_name() {
        let (store, _dir) = open_store().await;
        let long_name = "x".repeat(256);
        let err = store.add_memory(&long_name, "content").await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidInput);
    }

    #[tokio::test]
    async fn test_task_output_upsert_last_write_wins() {
        let (store, _dir) = open_store().await;
        store.save_task_output("wf", "draft", "v1").await.unwrap();
        store.save_task_output("wf", "draft", "v2").await.unwrap();

        let outputs = store.load_task_outputs("wf").await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["draft"], "v2");
    }

    #[tokio::test]
    async fn test_task_outputs_are_scoped_by_workflow() {
        let (store, _dir) = open_store().await;
        store.save_task_output("wf1", "a", "one").await.unwrap();
        store.save_task_output("wf2", "a", "two").await.unwrap();

        assert_eq!(store.load_task_outputs("wf1").await.unwrap()["a"], "one");
        assert_eq!(store.load_task_outputs("wf2").await.unwrap()["a"], "two");
        assert!(store.load_task_outputs("wf3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_round_trip_and_upsert() {
        let (store, _dir) = open_store().await;
        let v1 = vec![TaskDefinition::new("a", "first", "{{user_request}}")];
        let v2 = vec![
            TaskDefinition::new("a", "first", "{{user_request}}"),
            TaskDefinition::new("b", "second", "{{a}}"),
        ];

        store.save_plan("wf", &v1).await.unwrap();
        store.save_plan("wf", &v2).await.unwrap();

        let loaded = store.load_plan("wf").await.unwrap().unwrap();
        assert_eq!(loaded, v2);
        assert!(store.load_plan("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_empty_plan() {
        let (store, _dir) = open_store().await;
        store.save_plan("wf", &[]).await.unwrap();
        assert_eq!(store.load_plan("wf").await.unwrap().unwrap(), vec![]);
    }

    #[tokio::test]
    async fn test_concurrent_memory_writers() {
        let (store, _dir) = open_store().await;
        let store = std::sync::Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.add_memory("shared", &format!("m-{i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = store.load_memory("shared", 100).await.unwrap();
        assert_eq!(entries.len(), 8);
        assert!(entries.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (store, _dir) = open_store().await;
        store.close().await;
        store.close().await;
    }
}
