//! Nectar 演示入口：单条自然语言问题跑通完整流水线
//!
//! 用法：`nectar "top 10 customers by revenue"`；无 API Key 时自动退化为 Mock LLM。

use std::sync::Arc;

use tokio::sync::mpsc;

use nectar::cache::CacheService;
use nectar::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use nectar::config::load_config;
use nectar::core::{Coordinator, PipelineEvent, TurnOutcome, TurnRequest};
use nectar::exec::MockQueryExecutor;
use nectar::llm::{create_llm_from_config, HashEmbedder};
use nectar::schema::{ColumnSchema, SchemaContext, StaticSchemaProvider, TableSchema};
use nectar::validation::{Dialect, Validator};

fn demo_schema() -> SchemaContext {
    SchemaContext::new(vec![
        TableSchema::new(
            "orders",
            vec![
                ColumnSchema::new("id", "bigint"),
                ColumnSchema::new("customer_id", "bigint"),
                ColumnSchema::new("total_amount", "decimal"),
                ColumnSchema::new("created_at", "datetime"),
            ],
        ),
        TableSchema::new(
            "customers",
            vec![
                ColumnSchema::new("id", "bigint"),
                ColumnSchema::new("name", "varchar"),
                ColumnSchema::new("region", "varchar"),
            ],
        ),
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nectar::observability::init();

    let question = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "show the latest orders".to_string());

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });

    let llm = create_llm_from_config(&cfg);
    let schema = Arc::new(StaticSchemaProvider::new().with_datasource("demo", demo_schema()));
    let executor = Arc::new(
        MockQueryExecutor::new().with_result(
            "demo",
            vec!["id", "customer_id", "total_amount"],
            vec![
                vec![1.into(), 42.into(), 99.5.into()],
                vec![2.into(), 7.into(), 12.0.into()],
            ],
        ),
    );
    // 离线演示用确定性嵌入；配好 OPENAI_API_KEY 后可换 create_embedder_from_config
    let cache = Arc::new(CacheService::new(
        cfg.cache.to_cache_config(),
        Some(Arc::new(HashEmbedder::default())),
    ));
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(MemoryCheckpointStore::new(cfg.checkpoint.keep_versions));

    let coordinator = Coordinator::new(
        cfg.to_coordinator_config(),
        llm,
        schema,
        executor,
        cache,
        checkpoints,
        Validator::new(cfg.validation.to_validator_config()),
    );
    coordinator.probe_checkpoint_store().await?;

    // 过程事件打印
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<PipelineEvent>();
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            println!("  [event] {}", serde_json::to_string(&ev).unwrap_or_default());
        }
    });

    let thread_id = format!("cli-{}", uuid::Uuid::new_v4());
    let outcome = coordinator
        .run_turn(
            TurnRequest::new(&thread_id, "demo", Dialect::MySql, &question)
                .with_events(&event_tx),
        )
        .await?;
    drop(event_tx);
    let _ = printer.await;

    match outcome {
        TurnOutcome::Completed(turn) => {
            println!("\nQuery: {}", turn.query);
            println!("Response: {}", turn.response);
            if let Some(tier) = turn.from_cache {
                println!("(served from {} cache)", tier);
            }
        }
        TurnOutcome::Paused { questions } => {
            println!("\nClarification needed:");
            for q in questions {
                println!("  - {}", q);
            }
        }
        TurnOutcome::Terminated { reason, error_history } => {
            println!("\nTerminated: {}", reason);
            for e in error_history {
                println!("  [{}] {}", e.stage, e.message);
            }
        }
    }

    Ok(())
}
