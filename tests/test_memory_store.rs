//! Durable-store contract tests: upsert semantics, read-your-writes across
//! tasks, bulk/single equivalence and plan round-trips.

use std::sync::Arc;

use maestro_rs::config::DatabaseConfig;
use maestro_rs::memory::MemoryStore;
use maestro_rs::task::TaskDefinition;

async fn open_store() -> (Arc<MemoryStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("store.db").display()),
        max_connections: 8,
        ..DatabaseConfig::default()
    };
    (Arc::new(MemoryStore::connect(&config).await.unwrap()), dir)
}

#[tokio::test]
async fn test_load_after_save_returns_exact_pairs() {
    let (store, _dir) = open_store().await;

    store.save_task_output("wf", "research", "r-out").await.unwrap();
    store.save_task_output("wf", "draft", "d-out-1").await.unwrap();
    store.save_task_output("wf", "draft", "d-out-2").await.unwrap();

    let outputs = store.load_task_outputs("wf").await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs["research"], "r-out");
    assert_eq!(outputs["draft"], "d-out-2");
}

#[tokio::test]
async fn test_save_plan_load_plan_round_trip() -> anyhow::Result<()> {
    let (store, _dir) = open_store().await;
    let tasks = vec![
        TaskDefinition::new("alpha", "first step", "Outline: {{user_request}}"),
        TaskDefinition::new("beta", "second step", "Expand: {{alpha}}"),
        TaskDefinition::new("gamma", "", "Polish: {{prev_output}}"),
    ];

    store.save_plan("wf-rt", &tasks).await?;
    let loaded = store.load_plan("wf-rt").await?;
    assert_eq!(loaded, Some(tasks));
    Ok(())
}

#[tokio::test]
async fn test_bulk_load_equals_individual_loads() {
    let (store, _dir) = open_store().await;

    for (agent, count) in [("one", 1usize), ("five", 5), ("nine", 9)] {
        for i in 0..count {
            store.add_memory(agent, &format!("{agent}#{i}")).await.unwrap();
        }
    }

    for limit in [0u32, 1, 3, 100] {
        let names: Vec<String> = ["one", "five", "nine", "absent"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let bulk = store.load_memory_bulk(&names, limit).await.unwrap();
        assert_eq!(bulk.len(), names.len());
        for name in &names {
            let single = store.load_memory(name, limit).await.unwrap();
            assert_eq!(bulk[name], single, "limit={limit} name={name}");
        }
    }
}

#[tokio::test]
async fn test_writes_visible_across_concurrent_readers() {
    let (store, _dir) = open_store().await;

    store.add_memory("publisher", "the update").await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.load_memory("publisher", 10).await
        }));
    }
    for handle in handles {
        let entries = handle.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "the update");
    }
}

#[tokio::test]
async fn test_two_stores_share_one_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("shared.db").display()),
        ..DatabaseConfig::default()
    };

    let writer = MemoryStore::connect(&config).await.unwrap();
    let reader = MemoryStore::connect(&config).await.unwrap();

    writer.save_task_output("wf", "t", "value").await.unwrap();
    let outputs = reader.load_task_outputs("wf").await.unwrap();
    assert_eq!(outputs["t"], "value");

    writer.close().await;
    reader.close().await;
}

#[tokio::test]
async fn test_unknown_workflow_reads_are_empty_not_errors() {
    let (store, _dir) = open_store().await;
    assert!(store.load_task_outputs("ghost").await.unwrap().is_empty());
    assert!(store.load_plan("ghost").await.unwrap().is_none());
    assert!(store.load_memory("ghost-agent", 10).await.unwrap().is_empty());
}
