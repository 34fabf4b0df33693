use std::sync::Arc;

use crate::config::Config;
use crate::messaging::{self, Consumer, Producer};
use crate::metrics::Metrics;
use crate::shutdown::{self, Shutdown};
use crate::worker::{DispatchPool, ProcessPool, SpawnSpec};

// ── Error type ─────────────────────────────────────────────────────────────────

/// Top-level application error, surfaced only during startup. Each variant
/// wraps the underlying cause so `main.rs` can log it without depending on
/// every sub-module type.
#[derive(Debug)]
pub enum AppError {
    Config(crate::config::ConfigError),
    Broker(crate::messaging::BrokerError),
    Consumer(crate::messaging::ConsumerError),
    Producer(crate::messaging::ProducerError),
    Pool(crate::worker::PoolError),
    Dispatch(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Broker(e) => write!(f, "broker error: {e}"),
            Self::Consumer(e) => write!(f, "consumer error: {e}"),
            Self::Producer(e) => write!(f, "producer error: {e}"),
            Self::Pool(e) => write!(f, "worker pool error: {e}"),
            Self::Dispatch(e) => write!(f, "dispatch pool error: {e}"),
        }
    }
}

// ── Entry point ────────────────────────────────────────────────────────────────

/// Full application lifecycle.
///
/// # Startup sequence
/// 1. Load and validate configuration.
/// 2. Build the broker connection pool (with dial retry).
/// 3. Producer: own channel, declares results + retry topology.
/// 4. Consumer: own channel, declares input topology, prefetch = workers.
/// 5. Subprocess pool: eager spawn, blocks until every child is READY.
/// 6. Dispatch pool, then start consuming.
///
/// # Teardown (on SIGINT/SIGTERM)
/// Close the consumer channel first — the broker stops delivering and the
/// job channel closes — then trigger shutdown, drain the dispatch routines,
/// shut the subprocess fleet down, close the producer channel, and close the
/// broker pool.
///
/// Any startup failure returns an [`AppError`]; nothing persists outside the
/// broker, whose declarations are idempotent across restarts.
pub async fn run() -> Result<(), AppError> {
    // ── 1. Configuration ──────────────────────────────────────────────────────
    let cfg = Config::load().map_err(AppError::Config)?;
    cfg.log_summary();

    let metrics = Arc::new(Metrics::new());

    // The coordinator stays here; the dispatch pool holds a subscription so
    // it can break its loop on demand.
    let shutdown = Shutdown::new();

    // ── 2. Broker ─────────────────────────────────────────────────────────────
    // Two extra connections so the consumer and producer channels never
    // compete with anything else in the pool.
    let pool_size = cfg.workers_count + 2;
    tracing::info!("🔌 connecting to RabbitMQ (pool_size={pool_size})...");
    let rabbit_pool = messaging::build_pool(&cfg.rabbitmq_url, pool_size)
        .await
        .map_err(AppError::Broker)?;

    // ── 3. Producer ───────────────────────────────────────────────────────────
    let producer = Producer::new(&rabbit_pool, cfg.whisper_model.clone())
        .await
        .map_err(AppError::Producer)?;

    // ── 4. Consumer ───────────────────────────────────────────────────────────
    let consumer = Consumer::new(&rabbit_pool, cfg.workers_count as u16)
        .await
        .map_err(AppError::Consumer)?;

    // ── 5. Subprocess fleet ───────────────────────────────────────────────────
    let spec = SpawnSpec {
        program: cfg.worker_program.clone(),
        script: cfg.worker_script.clone(),
        env: cfg.worker_env(),
    };
    tracing::info!(
        workers = cfg.workers_count,
        "spawning worker subprocesses..."
    );
    let process_pool = ProcessPool::new(spec, cfg.workers_count, cfg.process_idle_timeout)
        .await
        .map_err(AppError::Pool)?;

    // ── 6. Dispatch pool + consume ────────────────────────────────────────────
    let dispatch = DispatchPool::new(
        Arc::clone(&process_pool),
        producer.clone(),
        cfg.workers_count,
        Arc::clone(&metrics),
    );

    let jobs_rx = consumer.start().await.map_err(AppError::Consumer)?;

    tracing::info!(
        workers = cfg.workers_count,
        "✅ whispool ready — waiting for transcription jobs"
    );

    // The dispatch pool runs in a background task so this task can wait for
    // an OS signal concurrently.
    let dispatch_task = tokio::spawn(dispatch.run(jobs_rx, shutdown.subscribe()));

    // ── 7. Signal + graceful shutdown ─────────────────────────────────────────
    shutdown::wait_for_os_signal().await;
    tracing::info!("🛑 signal received — initiating graceful shutdown...");

    // Stop new deliveries before anything else: cancel the consume stream,
    // which also closes the job channel once the loop drops its sender.
    consumer.close().await;
    shutdown.trigger();

    // Returns once every dispatch routine has drained its in-flight job.
    dispatch_task
        .await
        .map_err(|e| AppError::Dispatch(e.to_string()))?;

    process_pool.shutdown().await;

    // Outbound side last: every result for a drained job is already on the
    // wire, so the producer channel and the broker session can go.
    producer.close().await;
    rabbit_pool.close();

    metrics.log_summary();
    tracing::info!("✅ shutdown complete — goodbye");
    Ok(())
}
