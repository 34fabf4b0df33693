use serde::{Deserialize, Serialize};

// ── Broker-facing types ────────────────────────────────────────────────────────

/// Incoming transcription job.
///
/// Published to: `whisper_exchange` (direct)
/// Routing key:  `transcription.request`
/// Queue:        `whisper_transcriptions`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobRequest {
    /// Opaque job identifier, echoed unchanged in the result.
    pub attachment_id: i64,

    /// Absolute path to the audio file, readable by the worker process.
    pub audio_file_path: String,

    /// ISO 639-1 language code (e.g. "es"). Absent → the worker auto-detects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Optional batch grouping identifier, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_batch_id: Option<i64>,

    /// Number of attempts already made. Defaults to 0 on first delivery.
    /// The AMQP header `x-retry-count` overrides this value when present.
    #[serde(default)]
    pub retry_count: i32,
}

/// Result published back to the broker — exactly one per accepted job.
///
/// Published to: `whisper_results_exchange` (direct)
/// Routing key:  `transcription.result`
/// Queue:        `whisper_results`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Same value received in the request.
    pub attachment_id: i64,

    /// Transcribed text. Empty string on failure.
    pub texto: String,

    /// Audio duration in seconds. `0.0` on failure.
    pub duration: f64,

    /// Model identifier the orchestrator was configured with.
    pub model: String,

    /// `true` when transcription succeeded.
    pub success: bool,

    /// Same value received in the request; `null` when the request carried
    /// none. Always present in the result.
    pub import_batch_id: Option<i64>,

    /// Human-readable failure description. Only present when `success` is `false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobResult {
    pub fn ok(
        attachment_id: i64,
        import_batch_id: Option<i64>,
        texto: String,
        duration: f64,
        model: String,
    ) -> Self {
        Self {
            attachment_id,
            texto,
            duration,
            model,
            success: true,
            import_batch_id,
            error_message: None,
        }
    }

    pub fn failed(
        attachment_id: i64,
        import_batch_id: Option<i64>,
        model: String,
        error_message: String,
    ) -> Self {
        Self {
            attachment_id,
            texto: String::new(),
            duration: 0.0,
            model,
            success: false,
            import_batch_id,
            error_message: Some(error_message),
        }
    }
}

// ── Subprocess wire protocol ───────────────────────────────────────────────────
// One newline-delimited UTF-8 JSON object each way per exchange. The child
// also emits a single `READY` line on stdout before its first request.

/// Request written to a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub audio_file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Response read from a worker's stdout.
///
/// All fields except `success` are optional on the wire; the worker sends
/// `texto`/`duration`/`model` on success and `error_message` on failure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerResponse {
    pub success: bool,
    #[serde(default)]
    pub texto: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub error_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_retry_count_to_zero() {
        let req: JobRequest =
            serde_json::from_str(r#"{"attachment_id":7,"audio_file_path":"/a/x.mp3"}"#).unwrap();
        assert_eq!(req.retry_count, 0);
        assert!(req.language.is_none());
        assert!(req.import_batch_id.is_none());
    }

    #[test]
    fn request_echo_fields_survive_a_retry_round_trip() {
        let req: JobRequest = serde_json::from_str(
            r#"{"attachment_id":9,"audio_file_path":"/a/y.opus","language":"es","import_batch_id":3,"retry_count":1}"#,
        )
        .unwrap();
        let body = serde_json::to_string(&req).unwrap();
        let back: JobRequest = serde_json::from_str(&body).unwrap();
        assert_eq!(back.attachment_id, 9);
        assert_eq!(back.language.as_deref(), Some("es"));
        assert_eq!(back.import_batch_id, Some(3));
        assert_eq!(back.retry_count, 1);
    }

    #[test]
    fn success_result_omits_error_message_but_keeps_batch_id_null() {
        let result = JobResult::ok(1, None, "hola".into(), 1.5, "base".into());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["texto"], "hola");
        assert_eq!(json["success"], true);
        assert!(json.get("error_message").is_none());
        // The key is always present, null when the request carried no batch.
        assert_eq!(
            json.get("import_batch_id"),
            Some(&serde_json::Value::Null)
        );
    }

    #[test]
    fn failed_result_zeroes_payload_and_carries_message() {
        let result = JobResult::failed(2, Some(4), "base".into(), "boom".into());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["texto"], "");
        assert_eq!(json["duration"], 0.0);
        assert_eq!(json["model"], "base");
        assert_eq!(json["success"], false);
        assert_eq!(json["error_message"], "boom");
        assert_eq!(json["import_batch_id"], 4);
    }

    #[test]
    fn worker_request_omits_absent_language() {
        let req = WorkerRequest {
            audio_file_path: "/a/x.mp3".into(),
            language: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("language"));
    }

    #[test]
    fn worker_failure_response_tolerates_missing_fields() {
        let resp: WorkerResponse =
            serde_json::from_str(r#"{"success":false,"error_message":"boom"}"#).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error_message, "boom");
        assert_eq!(resp.texto, "");
        assert_eq!(resp.duration, 0.0);
    }
}
