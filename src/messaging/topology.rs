//! Broker topology: every named resource, declared idempotently at startup.
//!
//! Three direct, durable exchanges with one durable queue each. The retry
//! queue is the delay ring: messages published to it sit until the per-queue
//! TTL expires, then the broker dead-letters them back to the input exchange
//! with headers intact — a delayed re-delivery with no in-process timers.

use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};

// ── Input ──────────────────────────────────────────────────────────────────────

/// Exchange from which the orchestrator reads transcription requests.
pub const INPUT_EXCHANGE: &str = "whisper_exchange";
/// Durable queue bound to [`INPUT_EXCHANGE`] for incoming jobs.
pub const INPUT_QUEUE: &str = "whisper_transcriptions";
/// Routing key for transcription requests.
pub const INPUT_ROUTING_KEY: &str = "transcription.request";

// ── Results ────────────────────────────────────────────────────────────────────

/// Exchange to which results (success and terminal error) are published.
pub const RESULTS_EXCHANGE: &str = "whisper_results_exchange";
/// Durable queue collecting results.
pub const RESULTS_QUEUE: &str = "whisper_results";
/// Routing key for result messages.
pub const RESULTS_ROUTING_KEY: &str = "transcription.result";

// ── Retry (delay ring) ─────────────────────────────────────────────────────────

/// Exchange for retry messages.
pub const RETRY_EXCHANGE: &str = "whisper_retry_exchange";
/// Durable queue with TTL + DLX that re-injects expired messages into the
/// input queue.
pub const RETRY_QUEUE: &str = "whisper_retry_queue";
/// Routing key for retry messages.
pub const RETRY_ROUTING_KEY: &str = "transcription.retry";

/// `x-message-ttl` on the retry queue, in milliseconds. The floor on the
/// delay between a retry publish and the job's re-delivery.
pub const RETRY_TTL_MS: i32 = 5_000;

// ── Declarations ───────────────────────────────────────────────────────────────

/// Declare the input side: exchange, queue, binding. Idempotent.
pub async fn declare_input(channel: &Channel) -> Result<(), lapin::Error> {
    declare_direct_exchange(channel, INPUT_EXCHANGE).await?;
    declare_durable_queue(channel, INPUT_QUEUE, FieldTable::default()).await?;
    bind(channel, INPUT_QUEUE, INPUT_EXCHANGE, INPUT_ROUTING_KEY).await
}

/// Declare the output side: results plus the retry delay ring. Idempotent.
pub async fn declare_output(channel: &Channel) -> Result<(), lapin::Error> {
    // Results
    declare_direct_exchange(channel, RESULTS_EXCHANGE).await?;
    declare_durable_queue(channel, RESULTS_QUEUE, FieldTable::default()).await?;
    bind(channel, RESULTS_QUEUE, RESULTS_EXCHANGE, RESULTS_ROUTING_KEY).await?;

    // Retry ring: TTL + dead-letter routing back to the input exchange. The
    // broker preserves headers on dead-lettering, so `x-retry-count` survives
    // the round trip.
    declare_direct_exchange(channel, RETRY_EXCHANGE).await?;
    declare_durable_queue(channel, RETRY_QUEUE, retry_queue_args()).await?;
    bind(channel, RETRY_QUEUE, RETRY_EXCHANGE, RETRY_ROUTING_KEY).await
}

/// Arguments for the retry queue declaration.
///
/// `x-message-ttl` must be an int32; the DLX points at the input exchange and
/// routing key so expired messages re-enter as fresh requests.
fn retry_queue_args() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-message-ttl".into(), AMQPValue::LongInt(RETRY_TTL_MS));
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(INPUT_EXCHANGE.as_bytes().to_vec().into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(INPUT_ROUTING_KEY.as_bytes().to_vec().into()),
    );
    args
}

async fn declare_direct_exchange(channel: &Channel, name: &str) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
}

async fn declare_durable_queue(
    channel: &Channel,
    name: &str,
    args: FieldTable,
) -> Result<(), lapin::Error> {
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .map(|_| ())
}

async fn bind(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
) -> Result<(), lapin::Error> {
    channel
        .queue_bind(
            queue,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_queue_args_form_the_delay_ring() {
        let args = retry_queue_args();
        let inner = args.inner();

        assert_eq!(
            inner.get("x-message-ttl"),
            Some(&AMQPValue::LongInt(5_000))
        );
        assert_eq!(
            inner.get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString(
                INPUT_EXCHANGE.as_bytes().to_vec().into()
            ))
        );
        assert_eq!(
            inner.get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString(
                INPUT_ROUTING_KEY.as_bytes().to_vec().into()
            ))
        );
    }
}
