use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};

use crate::model::{JobRequest, JobResult};

use super::broker::Pool;
use super::topology::{
    self, RESULTS_EXCHANGE, RESULTS_ROUTING_KEY, RETRY_EXCHANGE, RETRY_ROUTING_KEY,
};

// ── Error ──────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ProducerError {
    Connection(String),
    Channel(String),
    Topology(String),
    Serialize(String),
    Publish(String),
}

impl std::fmt::Display for ProducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(m) => write!(f, "producer connection error: {m}"),
            Self::Channel(m) => write!(f, "producer channel error: {m}"),
            Self::Topology(m) => write!(f, "topology declaration failed: {m}"),
            Self::Serialize(m) => write!(f, "serialization failed: {m}"),
            Self::Publish(m) => write!(f, "publish failed: {m}"),
        }
    }
}

impl std::error::Error for ProducerError {}

// ── Producer ───────────────────────────────────────────────────────────────────

/// Owner of the outbound channel: results and retries.
///
/// Cloning is cheap (the channel is `Arc`-backed) — every dispatch routine
/// holds its own clone and publishes concurrently; lapin serialises writes on
/// the wire. The channel is distinct from the consumer's.
#[derive(Clone)]
pub struct Producer {
    channel: Channel,
    /// Model identifier embedded in every result, success or error.
    model_name: String,
}

impl Producer {
    /// Open a channel and declare the output topology (results + delay ring).
    pub async fn new(pool: &Pool, model_name: String) -> Result<Self, ProducerError> {
        let conn = pool
            .get()
            .await
            .map_err(|e| ProducerError::Connection(e.to_string()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| ProducerError::Channel(e.to_string()))?;

        topology::declare_output(&channel)
            .await
            .map_err(|e| ProducerError::Topology(e.to_string()))?;

        tracing::info!("producer ready");

        Ok(Self {
            channel,
            model_name,
        })
    }

    // ── Publish API ───────────────────────────────────────────────────────────

    /// Publish a success result.
    pub async fn publish_success(
        &self,
        attachment_id: i64,
        import_batch_id: Option<i64>,
        texto: String,
        duration: f64,
    ) -> Result<(), ProducerError> {
        let result = JobResult::ok(
            attachment_id,
            import_batch_id,
            texto,
            duration,
            self.model_name.clone(),
        );
        self.publish_result(&result).await
    }

    /// Publish a terminal error result.
    pub async fn publish_error(
        &self,
        attachment_id: i64,
        import_batch_id: Option<i64>,
        error_message: String,
    ) -> Result<(), ProducerError> {
        let result = JobResult::failed(
            attachment_id,
            import_batch_id,
            self.model_name.clone(),
            error_message,
        );
        self.publish_result(&result).await
    }

    /// Publish the job to the retry exchange with `retry_count` incremented.
    ///
    /// The new count is carried both in the body and in the `x-retry-count`
    /// header (int32). The delay ring holds the message for its TTL, then the
    /// broker re-delivers it to the input queue with headers intact.
    pub async fn publish_retry(&self, request: &JobRequest) -> Result<(), ProducerError> {
        let mut retried = request.clone();
        retried.retry_count += 1;

        let body = serde_json::to_vec(&retried)
            .map_err(|e| ProducerError::Serialize(e.to_string()))?;

        let mut headers = FieldTable::default();
        headers.insert(
            "x-retry-count".into(),
            AMQPValue::LongInt(retried.retry_count),
        );

        let props = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2) // persistent
            .with_headers(headers);

        self.channel
            .basic_publish(
                RETRY_EXCHANGE,
                RETRY_ROUTING_KEY,
                BasicPublishOptions::default(),
                &body,
                props,
            )
            .await
            .map_err(|e| ProducerError::Publish(e.to_string()))?;

        Ok(())
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Close the outbound channel. Called by the supervisor once the dispatch
    /// routines have drained; clones share the channel, so one close suffices.
    pub async fn close(&self) {
        if let Err(e) = self.channel.close(200, "shutting down").await {
            tracing::warn!(error = %e, "producer channel close failed");
        }
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    async fn publish_result(&self, result: &JobResult) -> Result<(), ProducerError> {
        let body =
            serde_json::to_vec(result).map_err(|e| ProducerError::Serialize(e.to_string()))?;

        let props = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        self.channel
            .basic_publish(
                RESULTS_EXCHANGE,
                RESULTS_ROUTING_KEY,
                BasicPublishOptions::default(),
                &body,
                props,
            )
            .await
            .map_err(|e| ProducerError::Publish(e.to_string()))?;

        Ok(())
    }
}
