use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::model::{WorkerRequest, WorkerResponse};
use crate::shutdown::{Shutdown, ShutdownSignal};

use super::process::{ExchangeError, SpawnSpec, WorkerProcess};

/// How often the idle reaper sweeps the fleet.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum PoolError {
    /// A slot could not be spawned during pool construction.
    Spawn { worker: usize, message: String },
    /// The request/response round trip failed.
    Exchange(ExchangeError),
    /// Every slot is busy or un-respawnable. Routed through retry upstream.
    Exhausted,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { worker, message } => {
                write!(f, "failed to spawn worker {worker}: {message}")
            }
            Self::Exchange(e) => write!(f, "{e}"),
            Self::Exhausted => write!(f, "no available workers"),
        }
    }
}

impl std::error::Error for PoolError {}

// ── ProcessPool ────────────────────────────────────────────────────────────────

/// Fixed fleet of worker subprocesses.
///
/// The slot vector sits behind a single pool-level mutex; each slot carries
/// its own exchange mutex. Lock order is strictly pool → slot. The pool never
/// grows: a dead slot is respawned in place on the next acquisition.
#[derive(Debug)]
pub struct ProcessPool {
    slots: Mutex<Vec<Arc<WorkerProcess>>>,
    spec: SpawnSpec,
    idle_timeout: Duration,
    reaper: Mutex<Option<Reaper>>,
}

#[derive(Debug)]
struct Reaper {
    stop: Shutdown,
    task: JoinHandle<()>,
}

impl ProcessPool {
    /// Spawn `workers_count` slots eagerly and start the idle reaper.
    ///
    /// If any initial spawn fails, every already-spawned slot is torn down
    /// and construction fails — the supervisor aborts startup.
    pub async fn new(
        spec: SpawnSpec,
        workers_count: usize,
        idle_timeout: Duration,
    ) -> Result<Arc<Self>, PoolError> {
        let mut slots = Vec::with_capacity(workers_count);

        for id in 0..workers_count {
            match WorkerProcess::spawn(id, &spec).await {
                Ok(slot) => slots.push(Arc::new(slot)),
                Err(e) => {
                    for slot in &slots {
                        slot.kill().await;
                    }
                    return Err(PoolError::Spawn {
                        worker: id,
                        message: e.to_string(),
                    });
                }
            }
        }

        let pool = Arc::new(Self {
            slots: Mutex::new(slots),
            spec,
            idle_timeout,
            reaper: Mutex::new(None),
        });

        let stop = Shutdown::new();
        let task = tokio::spawn(reaper_loop(Arc::clone(&pool), stop.subscribe()));
        *pool.reaper.lock().await = Some(Reaper { stop, task });

        tracing::info!(workers = workers_count, "🧰 worker fleet ready");
        Ok(pool)
    }

    /// Acquire one slot: first live idle slot wins; otherwise the first dead
    /// slot is respawned in place. Fails immediately with
    /// [`PoolError::Exhausted`] when neither exists — no queueing here, the
    /// job channel upstream already bounds concurrency.
    pub async fn acquire(&self) -> Result<Arc<WorkerProcess>, PoolError> {
        let mut slots = self.slots.lock().await;

        for slot in slots.iter() {
            if slot.is_alive() && !slot.is_busy() {
                slot.set_busy(true);
                return Ok(Arc::clone(slot));
            }
        }

        for i in 0..slots.len() {
            if !slots[i].is_alive() {
                let id = slots[i].id();
                tracing::info!(worker = id, "🔄 respawning worker");
                match WorkerProcess::spawn(id, &self.spec).await {
                    Ok(slot) => {
                        slot.set_busy(true);
                        let slot = Arc::new(slot);
                        slots[i] = Arc::clone(&slot);
                        return Ok(slot);
                    }
                    Err(e) => {
                        tracing::warn!(worker = id, error = %e, "respawn failed");
                        continue;
                    }
                }
            }
        }

        Err(PoolError::Exhausted)
    }

    /// Return a slot to the fleet: stamp `last_used`, clear `busy`.
    pub fn release(&self, slot: &WorkerProcess) {
        slot.touch();
        slot.set_busy(false);
    }

    /// Acquire → exchange → release. The slot stays held for the full round
    /// trip; transport errors surface to the caller after release.
    pub async fn execute(&self, request: &WorkerRequest) -> Result<WorkerResponse, PoolError> {
        let slot = self.acquire().await?;
        let result = slot.exchange(request).await;
        self.release(&slot);
        result.map_err(PoolError::Exchange)
    }

    /// Kill every slot that has been idle past the timeout. The next
    /// acquisition respawns it.
    pub async fn reap_idle(&self) {
        let slots = self.slots.lock().await;
        for slot in slots.iter() {
            if slot.is_alive() && !slot.is_busy() && slot.idle_for() > self.idle_timeout {
                tracing::info!(worker = slot.id(), "💤 killing idle worker");
                slot.kill().await;
            }
        }
    }

    /// Stop the reaper, then tear every child down: close stdin, kill, wait.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.stop.trigger();
            let _ = reaper.task.await;
        }

        let slots = self.slots.lock().await;
        for slot in slots.iter() {
            slot.kill().await;
        }

        tracing::info!("worker fleet stopped");
    }
}

// ── Reaper task ────────────────────────────────────────────────────────────────

async fn reaper_loop(pool: Arc<ProcessPool>, mut stop: ShutdownSignal) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    // interval fires immediately once; consume that tick so the first sweep
    // happens a full interval after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.wait() => break,
            _ = ticker.tick() => pool.reap_idle().await,
        }
    }
}
