use std::sync::Arc;

use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::messaging::{Job, Producer};
use crate::metrics::Metrics;
use crate::model::{JobRequest, WorkerRequest};
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::validator;

use super::pool::ProcessPool;

// ── DispatchPool ───────────────────────────────────────────────────────────────

/// Fan-out of dispatch routines over the inbound job stream.
///
/// ```text
/// jobs_rx (mpsc from Consumer)
///     │  dispatch loop — backpressure point
///     ▼
/// internal channel (bounded, workers × 2)
///     │  Arc<Mutex<Receiver>> shared by N routines
///     ▼
/// routine-0..N ─► validate ─► ProcessPool::execute ─► publish ─► ack/nack
/// ```
///
/// When the internal channel fills, the dispatch loop stops pulling from
/// `jobs_rx`; with consumer prefetch equal to the worker count, the broker
/// then withholds further deliveries. Nothing in the pipeline is unbounded.
pub struct DispatchPool {
    pool: Arc<ProcessPool>,
    producer: Producer,
    policy: RetryPolicy,
    workers_count: usize,
    metrics: Arc<Metrics>,
}

impl DispatchPool {
    pub fn new(
        pool: Arc<ProcessPool>,
        producer: Producer,
        workers_count: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            producer,
            policy: RetryPolicy::default(),
            workers_count,
            metrics,
        }
    }

    /// Process jobs until `jobs_rx` closes or shutdown fires, then drain.
    ///
    /// Returns only after every routine has finished its in-flight job.
    pub async fn run(self, mut jobs_rx: mpsc::Receiver<Job>, mut shutdown_signal: ShutdownSignal) {
        let (internal_tx, internal_rx) = mpsc::channel::<Job>(self.workers_count * 2);
        let shared_rx: Arc<Mutex<mpsc::Receiver<Job>>> = Arc::new(Mutex::new(internal_rx));

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.workers_count);

        for worker_id in 0..self.workers_count {
            let rx = Arc::clone(&shared_rx);
            let pool = Arc::clone(&self.pool);
            let producer = self.producer.clone();
            let policy = self.policy;
            let metrics = Arc::clone(&self.metrics);

            handles.push(tokio::spawn(async move {
                tracing::debug!(worker = worker_id, "dispatch routine started");
                loop {
                    // Hold the receiver lock only across recv(); processing
                    // happens with the lock released so the other routines
                    // can keep pulling.
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };

                    match job {
                        None => {
                            tracing::debug!(worker = worker_id, "dispatch routine stopping");
                            break;
                        }
                        Some(job) => {
                            process_job(worker_id, job, &pool, &producer, policy, &metrics).await;
                        }
                    }
                }
            }));
        }

        tracing::info!(workers = self.workers_count, "👷 dispatch routines ready");

        // Dispatch loop. `biased` keeps a busy stream from starving the
        // shutdown branch.
        loop {
            tokio::select! {
                biased;

                _ = shutdown_signal.wait() => {
                    tracing::info!("🛑 shutdown — draining in-flight jobs...");
                    break;
                }

                job = jobs_rx.recv() => {
                    match job {
                        None => break,
                        Some(job) => {
                            self.metrics.job_received();
                            if internal_tx.send(job).await.is_err() {
                                tracing::error!("internal job channel closed unexpectedly");
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Dropping the sender lets each routine finish its current job and
        // observe the closed channel.
        drop(internal_tx);

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dispatch routine panicked during shutdown");
            }
        }

        tracing::info!("all dispatch routines stopped");
    }
}

// ── Per-job processing ─────────────────────────────────────────────────────────

/// Deterministic pre-checks. An `Err` here never goes through retry: the same
/// input will fail the same way on every attempt.
fn validate_request(path: &str) -> Result<(), String> {
    if !validator::file_exists(path) {
        return Err(format!("Audio file not found: {path}"));
    }
    if !validator::has_supported_extension(path) {
        return Err("Unsupported audio format".to_string());
    }
    Ok(())
}

async fn process_job(
    worker_id: usize,
    job: Job,
    pool: &ProcessPool,
    producer: &Producer,
    policy: RetryPolicy,
    metrics: &Metrics,
) {
    let Job { request, delivery } = job;

    let attachment_id = request.attachment_id;
    let import_batch_id = request.import_batch_id;
    let retry_count = request.retry_count;

    let _in_flight = metrics.track_in_flight();

    if retry_count > 0 {
        tracing::info!(
            worker = worker_id,
            attachment_id,
            "▶️  job #{attachment_id} [retry {retry_count}/{}]",
            policy.max_retries
        );
    } else {
        tracing::info!(worker = worker_id, attachment_id, "▶️  job #{attachment_id}");
    }

    if let Err(message) = validate_request(&request.audio_file_path) {
        metrics.job_failed();
        tracing::warn!(
            worker = worker_id,
            attachment_id,
            "validation error (no retry): {message}"
        );
        publish_error_and_ack(
            worker_id,
            &delivery,
            attachment_id,
            import_batch_id,
            producer,
            message,
        )
        .await;
        return;
    }

    let worker_request = WorkerRequest {
        audio_file_path: request.audio_file_path.clone(),
        language: request.language.clone(),
    };

    match pool.execute(&worker_request).await {
        // Transport-level failure: I/O, parse, spawn, or an exhausted fleet.
        Err(e) => {
            tracing::warn!(worker = worker_id, attachment_id, "worker exchange failed: {e}");
            handle_failure(
                worker_id,
                &delivery,
                &request,
                producer,
                policy,
                metrics,
                e.to_string(),
            )
            .await;
        }

        // The worker answered, but with a failure.
        Ok(response) if !response.success => {
            let message = if response.error_message.is_empty() {
                "worker reported failure".to_string()
            } else {
                response.error_message
            };
            tracing::warn!(worker = worker_id, attachment_id, "worker error: {message}");
            handle_failure(
                worker_id,
                &delivery,
                &request,
                producer,
                policy,
                metrics,
                message,
            )
            .await;
        }

        Ok(response) => {
            match producer
                .publish_success(
                    attachment_id,
                    import_batch_id,
                    response.texto,
                    response.duration,
                )
                .await
            {
                Ok(()) => {
                    metrics.job_succeeded();
                    tracing::info!(
                        worker = worker_id,
                        attachment_id,
                        "✅ #{attachment_id} done ({:.1}s)",
                        response.duration
                    );
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                }
                Err(e) => {
                    tracing::error!(
                        worker = worker_id,
                        attachment_id,
                        error = %e,
                        "❌ result publish failed, nacking with requeue"
                    );
                    nack_requeue(&delivery).await;
                }
            }
        }
    }
}

/// Route a transient failure: retry while budget remains, else terminal error.
/// Publish failures nack with requeue and publish nothing else.
async fn handle_failure(
    worker_id: usize,
    delivery: &Delivery,
    request: &JobRequest,
    producer: &Producer,
    policy: RetryPolicy,
    metrics: &Metrics,
    error_message: String,
) {
    let attachment_id = request.attachment_id;

    if policy.should_retry(request.retry_count) {
        metrics.job_retried();
        tracing::info!(
            worker = worker_id,
            attachment_id,
            "🔄 #{attachment_id} retry {}/{}",
            request.retry_count + 1,
            policy.max_retries
        );

        match producer.publish_retry(request).await {
            Ok(()) => {
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            Err(e) => {
                tracing::error!(
                    worker = worker_id,
                    attachment_id,
                    error = %e,
                    "❌ retry publish failed, nacking with requeue"
                );
                nack_requeue(delivery).await;
            }
        }
    } else {
        metrics.job_failed();
        tracing::error!(
            worker = worker_id,
            attachment_id,
            "❌ #{attachment_id} failed (max retries): {error_message}"
        );
        publish_error_and_ack(
            worker_id,
            delivery,
            attachment_id,
            request.import_batch_id,
            producer,
            error_message,
        )
        .await;
    }
}

/// Publish a terminal error result, then ack. On publish failure, nack with
/// requeue — the broker keeps the only durable record of the job.
async fn publish_error_and_ack(
    worker_id: usize,
    delivery: &Delivery,
    attachment_id: i64,
    import_batch_id: Option<i64>,
    producer: &Producer,
    error_message: String,
) {
    match producer
        .publish_error(attachment_id, import_batch_id, error_message)
        .await
    {
        Ok(()) => {
            let _ = delivery.ack(BasicAckOptions::default()).await;
        }
        Err(e) => {
            tracing::error!(
                worker = worker_id,
                attachment_id,
                error = %e,
                "❌ error publish failed, nacking with requeue"
            );
            nack_requeue(delivery).await;
        }
    }
}

async fn nack_requeue(delivery: &Delivery) {
    let _ = delivery
        .nack(BasicNackOptions {
            multiple: false,
            requeue: true,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_is_reported_with_its_path() {
        let err = validate_request("/nonexistent/audio.mp3").unwrap_err();
        assert_eq!(err, "Audio file not found: /nonexistent/audio.mp3");
    }

    #[test]
    fn empty_path_counts_as_missing_file() {
        let err = validate_request("").unwrap_err();
        assert_eq!(err, "Audio file not found: ");
    }

    #[test]
    fn existing_file_with_unknown_extension_is_rejected_deterministically() {
        let path = std::env::temp_dir().join("whispool_dispatch_probe.xyz");
        fs::write(&path, b"data").unwrap();

        let err = validate_request(path.to_str().unwrap()).unwrap_err();
        assert_eq!(err, "Unsupported audio format");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn existing_file_with_mixed_case_extension_passes() {
        let path = std::env::temp_dir().join("whispool_dispatch_probe.MP3");
        fs::write(&path, b"ID3").unwrap();

        assert!(validate_request(path.to_str().unwrap()).is_ok());

        let _ = fs::remove_file(&path);
    }
}
