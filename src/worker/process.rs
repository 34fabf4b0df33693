use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::model::{WorkerRequest, WorkerResponse};

/// How long a child may take to emit its `READY` line. Model loading
/// dominates child startup, so this is generous.
pub const READY_TIMEOUT: Duration = Duration::from_secs(300);

// ── Spawn spec ─────────────────────────────────────────────────────────────────

/// Everything needed to start one worker child.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Interpreter or binary.
    pub program: PathBuf,
    /// Script handed to the program as its only argument.
    pub script: PathBuf,
    /// Extra environment forwarded to the child.
    pub env: Vec<(String, String)>,
}

// ── Errors ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SpawnError {
    /// Process could not be started or its pipes could not be wired.
    Io(String),
    /// The child started but never produced a valid `READY` line.
    Handshake(String),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(m) => write!(f, "worker spawn failed: {m}"),
            Self::Handshake(m) => write!(f, "worker handshake failed: {m}"),
        }
    }
}

impl std::error::Error for SpawnError {}

#[derive(Debug)]
pub enum ExchangeError {
    Serialize(String),
    /// Write/read error or EOF on the child's pipes. The slot is dead.
    Io(String),
    /// The child answered with a non-JSON line. The attempt fails but the
    /// stream boundary is intact, so the slot stays usable.
    Parse(String),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialize(m) => write!(f, "failed to encode worker request: {m}"),
            Self::Io(m) => write!(f, "worker I/O error: {m}"),
            Self::Parse(m) => write!(f, "unparseable worker response: {m}"),
        }
    }
}

impl std::error::Error for ExchangeError {}

// ── WorkerProcess ──────────────────────────────────────────────────────────────

/// One slot in the subprocess fleet: a supervised child plus its pipes.
///
/// The `io` mutex serialises the request/response exchange — exactly one
/// in-flight request per child, ever. The `busy`/`alive` flags are read by
/// the pool under its own lock; lock order is strictly pool → slot.
#[derive(Debug)]
pub struct WorkerProcess {
    id: usize,
    busy: AtomicBool,
    alive: AtomicBool,
    last_used: StdMutex<Instant>,
    io: Mutex<ProcessIo>,
}

#[derive(Debug)]
struct ProcessIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    /// Spawn a child, wire its pipes, and wait for the `READY` handshake.
    ///
    /// Any first line other than `READY`, an EOF, or a [`READY_TIMEOUT`]
    /// expiry kills the child and fails the spawn. The stderr stream is
    /// drained to the log, tagged with the slot id, for the child's lifetime.
    pub async fn spawn(id: usize, spec: &SpawnSpec) -> Result<Self, SpawnError> {
        let mut child = Command::new(&spec.program)
            .arg(&spec.script)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::Io(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Io("stdin pipe missing".into()))?;
        let mut stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| SpawnError::Io("stdout pipe missing".into()))?,
        );
        let stderr = BufReader::new(
            child
                .stderr
                .take()
                .ok_or_else(|| SpawnError::Io("stderr pipe missing".into()))?,
        );

        tokio::spawn(drain_stderr(id, stderr));

        let mut first_line = String::new();
        let handshake =
            tokio::time::timeout(READY_TIMEOUT, stdout.read_line(&mut first_line)).await;

        let failure = match handshake {
            Err(_) => Some(format!(
                "no READY within {}s",
                READY_TIMEOUT.as_secs()
            )),
            Ok(Err(e)) => Some(format!("failed to read ready line: {e}")),
            Ok(Ok(0)) => Some("stream closed before READY".to_string()),
            Ok(Ok(_)) if first_line.trim() == "READY" => None,
            Ok(Ok(_)) => Some(format!("unexpected ready line: {:?}", first_line.trim())),
        };

        if let Some(message) = failure {
            let _ = child.start_kill();
            return Err(SpawnError::Handshake(message));
        }

        tracing::debug!(worker = id, "worker process ready");

        Ok(Self {
            id,
            busy: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            last_used: StdMutex::new(Instant::now()),
            io: Mutex::new(ProcessIo {
                child,
                stdin,
                stdout,
            }),
        })
    }

    /// One request/response round trip on the child's pipes.
    ///
    /// A write or read error (including EOF) marks the slot dead and surfaces
    /// as [`ExchangeError::Io`]; the pool respawns the slot on its next
    /// acquisition. A malformed response line fails only this attempt.
    pub async fn exchange(
        &self,
        request: &WorkerRequest,
    ) -> Result<WorkerResponse, ExchangeError> {
        let mut io = self.io.lock().await;

        let mut line = serde_json::to_vec(request)
            .map_err(|e| ExchangeError::Serialize(e.to_string()))?;
        line.push(b'\n');

        if let Err(e) = io.stdin.write_all(&line).await {
            self.mark_dead();
            return Err(ExchangeError::Io(format!("write failed: {e}")));
        }
        if let Err(e) = io.stdin.flush().await {
            self.mark_dead();
            return Err(ExchangeError::Io(format!("flush failed: {e}")));
        }

        let mut response_line = String::new();
        match io.stdout.read_line(&mut response_line).await {
            Err(e) => {
                self.mark_dead();
                Err(ExchangeError::Io(format!("read failed: {e}")))
            }
            Ok(0) => {
                self.mark_dead();
                Err(ExchangeError::Io("stream closed mid-exchange".into()))
            }
            Ok(_) => serde_json::from_str(&response_line).map_err(|e| {
                ExchangeError::Parse(format!("{e}, raw: {}", response_line.trim_end()))
            }),
        }
    }

    /// Close stdin, kill the child, and collect its exit status.
    /// Safe to call on an already-dead slot.
    pub async fn kill(&self) {
        let mut io = self.io.lock().await;
        let _ = io.stdin.shutdown().await;
        let _ = io.child.start_kill();
        let _ = io.child.wait().await;
        self.alive.store(false, Ordering::Relaxed);
    }

    // ── Flags ─────────────────────────────────────────────────────────────────

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    /// Stamp `last_used` — called by the pool on release.
    pub fn touch(&self) {
        *self.last_used.lock().unwrap() = Instant::now();
    }

    /// Time since this slot last finished an exchange.
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().unwrap().elapsed()
    }
}

// ── Stderr tee ─────────────────────────────────────────────────────────────────

/// Forward each stderr line to the log. Runs until the child closes the
/// stream; the content is opaque and never parsed.
async fn drain_stderr(id: usize, reader: BufReader<ChildStderr>) {
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(worker = id, "[worker stderr] {}", line.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    /// Write a stub worker shell script to a temp file and return its spec.
    fn stub_spec(name: &str, body: &str) -> SpawnSpec {
        let path = std::env::temp_dir().join(format!(
            "whispool_stub_{name}_{}.sh",
            std::process::id()
        ));
        std::fs::write(&path, body).unwrap();
        SpawnSpec {
            program: PathBuf::from("/bin/sh"),
            script: path,
            env: vec![],
        }
    }

    fn request_for(path: &str) -> WorkerRequest {
        WorkerRequest {
            audio_file_path: path.into(),
            language: None,
        }
    }

    const RESPONDER: &str = r#"echo READY
while IFS= read -r line; do
  echo '{"success":true,"texto":"hola","duration":1.5,"model":"base"}'
done
"#;

    #[tokio::test]
    async fn spawn_then_exchange_round_trip() {
        let spec = stub_spec("roundtrip", RESPONDER);
        let proc = WorkerProcess::spawn(0, &spec).await.unwrap();

        let resp = proc.exchange(&request_for("/a/ok.mp3")).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.texto, "hola");
        assert_eq!(resp.duration, 1.5);
        assert!(proc.is_alive());

        proc.kill().await;
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn worker_reported_failure_is_a_normal_response() {
        let spec = stub_spec(
            "failure",
            r#"echo READY
while IFS= read -r line; do
  echo '{"success":false,"error_message":"boom"}'
done
"#,
        );
        let proc = WorkerProcess::spawn(0, &spec).await.unwrap();

        let resp = proc.exchange(&request_for("/a/ok.mp3")).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.error_message, "boom");
        // A worker-level failure is not a transport failure.
        assert!(proc.is_alive());

        proc.kill().await;
    }

    #[tokio::test]
    async fn wrong_handshake_line_fails_the_spawn() {
        let spec = stub_spec("badhandshake", "echo NOPE\n");
        let err = WorkerProcess::spawn(0, &spec).await.unwrap_err();
        assert!(matches!(err, SpawnError::Handshake(_)));
    }

    #[tokio::test]
    async fn eof_before_handshake_fails_the_spawn() {
        let spec = stub_spec("earlyexit", "exit 0\n");
        let err = WorkerProcess::spawn(0, &spec).await.unwrap_err();
        assert!(matches!(err, SpawnError::Handshake(_)));
    }

    #[tokio::test]
    async fn missing_program_fails_the_spawn() {
        let spec = SpawnSpec {
            program: PathBuf::from("/nonexistent/interpreter"),
            script: PathBuf::from("/nonexistent/worker.py"),
            env: vec![],
        };
        let err = WorkerProcess::spawn(0, &spec).await.unwrap_err();
        assert!(matches!(err, SpawnError::Io(_)));
    }

    #[tokio::test]
    async fn child_death_mid_exchange_marks_the_slot_dead() {
        // The child exits right after READY, so the exchange hits a closed pipe.
        let spec = stub_spec("deadchild", "echo READY\n");
        let proc = WorkerProcess::spawn(0, &spec).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = proc.exchange(&request_for("/a/ok.mp3")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Io(_)));
        assert!(!proc.is_alive());
    }

    #[tokio::test]
    async fn malformed_response_fails_the_attempt_but_not_the_slot() {
        let spec = stub_spec(
            "garbage",
            r#"echo READY
IFS= read -r line
echo not-json-at-all
while IFS= read -r line; do
  echo '{"success":true,"texto":"ok","duration":0.5,"model":"base"}'
done
"#,
        );
        let proc = WorkerProcess::spawn(0, &spec).await.unwrap();

        let err = proc.exchange(&request_for("/a/ok.mp3")).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Parse(_)));
        assert!(proc.is_alive());

        // Next exchange on the same slot succeeds.
        let resp = proc.exchange(&request_for("/a/ok.mp3")).await.unwrap();
        assert!(resp.success);

        proc.kill().await;
    }

    #[tokio::test]
    async fn worker_env_reaches_the_child() {
        let spec_path = std::env::temp_dir().join(format!(
            "whispool_stub_env_{}.sh",
            std::process::id()
        ));
        std::fs::write(
            &spec_path,
            r#"echo READY
IFS= read -r line
echo "{\"success\":true,\"texto\":\"$WHISPER_MODEL\",\"duration\":0,\"model\":\"$WHISPER_MODEL\"}"
"#,
        )
        .unwrap();
        assert!(Path::new(&spec_path).exists());

        let spec = SpawnSpec {
            program: PathBuf::from("/bin/sh"),
            script: spec_path,
            env: vec![("WHISPER_MODEL".into(), "small".into())],
        };
        let proc = WorkerProcess::spawn(3, &spec).await.unwrap();
        let resp = proc.exchange(&request_for("/a/ok.mp3")).await.unwrap();
        assert_eq!(resp.model, "small");
        proc.kill().await;
    }
}
