use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable},
    Channel, Consumer as LapinConsumer,
};
use tokio::sync::mpsc;

use crate::model::JobRequest;

use super::broker::Pool;
use super::topology::{self, INPUT_QUEUE};

// ── Public types ───────────────────────────────────────────────────────────────

/// A decoded transcription job bound to its broker delivery.
///
/// The dispatch routine that processes the job owns the ack/nack decision;
/// the delivery stays unacked until a terminal outcome (or requeue) is chosen.
pub struct Job {
    pub request: JobRequest,
    /// Raw AMQP delivery — acked or nacked by the dispatch layer.
    pub delivery: Delivery,
}

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConsumerError {
    Connection(String),
    Channel(String),
    Topology(String),
    Qos(String),
    Start(String),
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(m) => write!(f, "consumer connection error: {m}"),
            Self::Channel(m) => write!(f, "consumer channel error: {m}"),
            Self::Topology(m) => write!(f, "topology declaration failed: {m}"),
            Self::Qos(m) => write!(f, "QoS setup failed: {m}"),
            Self::Start(m) => write!(f, "failed to start consuming: {m}"),
        }
    }
}

impl std::error::Error for ConsumerError {}

// ── Consumer ───────────────────────────────────────────────────────────────────

/// Owner of the inbound stream.
///
/// Holds a dedicated AMQP channel (publishing goes through a separate channel
/// in `producer`; the two are never shared). Call [`start`](Self::start) to
/// begin consumption and obtain the bounded job channel the dispatch pool
/// reads from; [`close`](Self::close) cancels the stream at shutdown.
pub struct Consumer {
    /// The channel's internal `Arc` keeps the parent connection alive.
    channel: Channel,
    prefetch_count: u16,
}

impl Consumer {
    /// Open a channel, declare the input topology, and apply QoS.
    ///
    /// `prefetch_count` equals the worker count: the broker never has more
    /// unacked deliveries outstanding than there are subprocess slots.
    pub async fn new(pool: &Pool, prefetch_count: u16) -> Result<Self, ConsumerError> {
        let conn = pool
            .get()
            .await
            .map_err(|e| ConsumerError::Connection(e.to_string()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| ConsumerError::Channel(e.to_string()))?;

        topology::declare_input(&channel)
            .await
            .map_err(|e| ConsumerError::Topology(e.to_string()))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| ConsumerError::Qos(e.to_string()))?;

        tracing::info!(queue = INPUT_QUEUE, prefetch = prefetch_count, "consumer ready");

        Ok(Self {
            channel,
            prefetch_count,
        })
    }

    /// Start consuming and return the receiving end of the job channel.
    ///
    /// The spawned loop decodes each delivery, nacks undecodable bodies
    /// without requeue, overlays `retry_count` from the `x-retry-count`
    /// header, and forwards [`Job`]s downstream. Channel capacity is
    /// `prefetch × 2`; the channel closes when the broker stream ends or the
    /// receiver is dropped.
    ///
    /// The `Consumer` itself stays alive so the supervisor can
    /// [`close`](Self::close) it on shutdown.
    pub async fn start(&self) -> Result<mpsc::Receiver<Job>, ConsumerError> {
        let capacity = (self.prefetch_count as usize) * 2;
        let (tx, rx) = mpsc::channel::<Job>(capacity);

        let stream = self
            .channel
            .basic_consume(
                INPUT_QUEUE,
                "whispool-orchestrator",
                BasicConsumeOptions {
                    no_ack: false, // manual ack only
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::Start(e.to_string()))?;

        // The lapin consumer keeps the channel (and connection) alive for the
        // lifetime of this task.
        tokio::spawn(consume_loop(stream, tx));

        tracing::info!(queue = INPUT_QUEUE, "▶️  consuming");

        Ok(rx)
    }

    /// Close the AMQP channel, cancelling the consume stream.
    ///
    /// This is the first step of shutdown: the broker stops delivering
    /// immediately, the stream ends, and the consume loop drops its sender —
    /// which closes the job channel upstream of the dispatch pool. Unacked
    /// in-flight deliveries return to the queue per AMQP semantics.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close(200, "shutting down").await {
            tracing::warn!(error = %e, "consumer channel close failed");
        }
    }
}

// ── Background task ────────────────────────────────────────────────────────────

async fn consume_loop(mut stream: LapinConsumer, tx: mpsc::Sender<Job>) {
    while let Some(result) = stream.next().await {
        let delivery = match result {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(error = %e, "consumer stream error");
                break;
            }
        };

        let header_count = header_retry_count(delivery.properties.headers().as_ref());
        let request = match decode_request(&delivery.data, header_count) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "⚠️  undecodable message — nacking without requeue");
                let _ = delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await;
                continue;
            }
        };

        if tx.send(Job { request, delivery }).await.is_err() {
            // Receiver dropped — the orchestrator is shutting down.
            break;
        }
    }
}

// ── Decode helpers ─────────────────────────────────────────────────────────────

/// Deserialize a delivery body and overlay the header retry count, which wins
/// over the body value when both are present.
fn decode_request(body: &[u8], header_count: Option<i32>) -> Result<JobRequest, String> {
    let mut request: JobRequest =
        serde_json::from_slice(body).map_err(|e| format!("JSON parse error: {e}"))?;

    if let Some(count) = header_count {
        request.retry_count = count;
    }

    Ok(request)
}

/// Read `x-retry-count` from the headers, accepting the 32-bit and 64-bit
/// integer encodings publishers are known to emit.
fn header_retry_count(headers: Option<&FieldTable>) -> Option<i32> {
    headers?
        .inner()
        .get("x-retry-count")
        .and_then(|v| match v {
            AMQPValue::LongInt(n) => Some(*n),
            AMQPValue::LongLongInt(n) => Some(*n as i32),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_defaults_retry_count_when_body_and_header_are_silent() {
        let request =
            decode_request(br#"{"attachment_id":1,"audio_file_path":"/a/ok.mp3"}"#, None).unwrap();
        assert_eq!(request.retry_count, 0);
    }

    #[test]
    fn header_wins_over_body_retry_count() {
        let request = decode_request(
            br#"{"attachment_id":1,"audio_file_path":"/a/ok.mp3","retry_count":0}"#,
            Some(2),
        )
        .unwrap();
        assert_eq!(request.retry_count, 2);
    }

    #[test]
    fn body_retry_count_stands_without_a_header() {
        let request = decode_request(
            br#"{"attachment_id":1,"audio_file_path":"/a/ok.mp3","retry_count":1}"#,
            None,
        )
        .unwrap();
        assert_eq!(request.retry_count, 1);
    }

    #[test]
    fn decode_rejects_malformed_bodies() {
        assert!(decode_request(b"not json", None).is_err());
        assert!(decode_request(br#"{"audio_file_path":"/a/ok.mp3"}"#, None).is_err());
    }

    #[test]
    fn header_accepts_both_integer_widths() {
        let mut headers = FieldTable::default();
        headers.insert("x-retry-count".into(), AMQPValue::LongInt(1));
        assert_eq!(header_retry_count(Some(&headers)), Some(1));

        let mut headers = FieldTable::default();
        headers.insert("x-retry-count".into(), AMQPValue::LongLongInt(2));
        assert_eq!(header_retry_count(Some(&headers)), Some(2));
    }

    #[test]
    fn header_ignores_non_integer_encodings() {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-retry-count".into(),
            AMQPValue::LongString("2".as_bytes().to_vec().into()),
        );
        assert_eq!(header_retry_count(Some(&headers)), None);
        assert_eq!(header_retry_count(None), None);
    }
}
