use hsds_aligner_core::auth_state::AuthStateManager;
use hsds_aligner_core::config::Config;
use hsds_aligner_core::content_store::ContentStore;
use hsds_aligner_core::hsds::{HsdsAligner, ValidationConfig, ValidationProvider};
use hsds_aligner_core::prompts::PromptLoader;
use hsds_aligner_core::providers::build_provider;
use hsds_aligner_core::queue::{RedisQueue, QUEUE_LLM, QUEUE_RECONCILER, QUEUE_RECORDER};
use hsds_aligner_core::schema::SchemaConverter;
use hsds_aligner_core::worker::{WorkerConfig as LoopConfig, WorkerLoop};

use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::load()?;
    hsds_aligner_core::observability::init_tracing(&config.logging);

    info!(provider = ?config.llm.provider, workers = config.worker.pool_size, "starting");

    let content_store = match &config.content_store.path {
        Some(path) => Some(Arc::new(ContentStore::open(path)?)),
        None => {
            info!("content_store.path unset, dedup disabled");
            None
        }
    };

    let client = redis::Client::open(config.redis.url.as_str())?;
    let redis_conn = ConnectionManager::new(client).await?;

    let llm_queue = Arc::new(RedisQueue::new(redis_conn.clone(), QUEUE_LLM));
    let reconciler_queue = Arc::new(RedisQueue::new(redis_conn.clone(), QUEUE_RECONCILER));
    let recorder_queue = Arc::new(RedisQueue::new(redis_conn.clone(), QUEUE_RECORDER));
    let auth_state = AuthStateManager::new(redis_conn.clone());

    let prompts = Arc::new(PromptLoader::new(
        config.hsds.aligner_prompt_path.clone(),
        config.hsds.validation_prompt_path.clone(),
    ));
    let schema_path = config
        .hsds
        .schema_path
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("resources/hsds_schema.csv"));
    let schema = Arc::new(SchemaConverter::new(schema_path));
    // Convert the schema once up front so a malformed or missing schema file
    // is a fatal startup error rather than a per-job failure discovered only
    // once a worker reaches its first alignment attempt.
    schema.convert_to_llm_schema("top_level")?;

    let validation_config = ValidationConfig {
        min_confidence: config.hsds.min_confidence,
        retry_threshold: config.hsds.retry_threshold,
        max_retries: config.hsds.max_retries,
    };

    tokio::spawn(install_shutdown_handler());

    let mut handles = Vec::new();

    for worker_id in 0..config.worker.pool_size {
        let llm_config = config.llm.clone();
        let content_store = content_store.clone();
        let llm_queue = llm_queue.clone();
        let reconciler_queue = reconciler_queue.clone();
        let recorder_queue = recorder_queue.clone();
        let auth_state = auth_state.clone();
        let prompts = prompts.clone();
        let schema = schema.clone();
        let validation_config = validation_config.clone();

        let handle = tokio::spawn(async move {
            let provider = match build_provider(&llm_config) {
                Ok(provider) => provider,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to construct provider, worker exiting");
                    return;
                }
            };

            let judge = ValidationProvider::new(provider.as_ref(), validation_config.clone(), &prompts);
            let aligner = HsdsAligner::new(provider.as_ref(), &judge, &prompts, &schema, validation_config);

            let loop_config = LoopConfig::default();
            let worker_loop = WorkerLoop {
                queue: &llm_queue,
                reconciler: &reconciler_queue,
                recorder: &recorder_queue,
                provider: provider.as_ref(),
                aligner: &aligner,
                content_store: content_store.as_deref(),
                auth_state: &auth_state,
                config: loop_config,
            };

            info!(worker_id, "worker started");
            worker_loop.run_until(should_shutdown).await;
            info!(worker_id, "worker stopped");
        });

        handles.push(handle);
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task panicked");
        }
    }

    Ok(())
}

fn should_shutdown() -> bool {
    SHUTDOWN.load(std::sync::atomic::Ordering::Relaxed)
}

static SHUTDOWN: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

async fn install_shutdown_handler() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    info!("shutdown signal received, draining workers");
    SHUTDOWN.store(true, std::sync::atomic::Ordering::Relaxed);
}
