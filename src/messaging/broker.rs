use std::time::Duration;

use deadpool_lapin::Manager;
use lapin::ConnectionProperties;

/// Re-exported so sibling modules import the pool type from here.
pub type Pool = deadpool_lapin::Pool;

/// Dial attempts before giving up on the broker at startup.
const MAX_CONNECT_ATTEMPTS: u32 = 10;
/// Pause between dial attempts.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum BrokerError {
    /// No connection after every dial attempt.
    Connection(String),
    /// The connection pool itself could not be built.
    Pool(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "RabbitMQ connection failed: {msg}"),
            Self::Pool(msg) => write!(f, "connection pool build failed: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

// ── Pool constructor ───────────────────────────────────────────────────────────

/// Build a [`deadpool_lapin`] connection pool and verify connectivity.
///
/// Dials up to [`MAX_CONNECT_ATTEMPTS`] times, [`CONNECT_RETRY_INTERVAL`]
/// apart, and returns on the first successful checkout. `max_connections`
/// should be at least `workers_count + 2` so the consumer and producer hold
/// dedicated channels without starving anything else.
pub async fn build_pool(url: &str, max_connections: usize) -> Result<Pool, BrokerError> {
    let manager = Manager::new(url, ConnectionProperties::default());

    let pool = Pool::builder(manager)
        .max_size(max_connections)
        .build()
        .map_err(|e| BrokerError::Pool(e.to_string()))?;

    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        match pool.get().await {
            Ok(_) => {
                tracing::info!("📡 RabbitMQ connected");
                return Ok(pool);
            }
            Err(e) if attempt < MAX_CONNECT_ATTEMPTS => {
                tracing::warn!(
                    attempt,
                    max = MAX_CONNECT_ATTEMPTS,
                    error = %e,
                    "⚠️  RabbitMQ not ready, retrying in {}s...",
                    CONNECT_RETRY_INTERVAL.as_secs()
                );
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(BrokerError::Connection(format!(
                    "failed after {MAX_CONNECT_ATTEMPTS} attempts: {e}"
                )));
            }
        }
    }

    unreachable!()
}
