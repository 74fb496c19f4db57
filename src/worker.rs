use crate::names::PackageSpec;
use libherokubuildpack::log::log_warning;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound on a single protocol frame. A frame larger than this is a
/// protocol violation, not a big payload.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Workers idle longer than this are torn down by the pool's eviction pass.
pub(crate) const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Hard cap on pooled workers; the oldest idle worker is evicted to make
/// room, which keeps memory bounded when many specs are exercised.
pub(crate) const MAX_POOLED_WORKERS: usize = 4;

/// The agent program run inside every worker interpreter. It speaks the
/// framed protocol on stdin/stdout and executes submitted code with the
/// bubble's import path active from startup. User code's stdout/stderr are
/// captured so they can never corrupt the protocol stream.
const WORKER_AGENT: &str = r#"
import contextlib
import io
import json
import struct
import sys
import traceback

def read_frame(stream):
    header = stream.read(8)
    if len(header) < 8:
        return None
    (length,) = struct.unpack('>Q', header)
    payload = stream.read(length)
    if len(payload) < length:
        return None
    return json.loads(payload.decode('utf-8'))

def write_frame(stream, message):
    payload = json.dumps(message).encode('utf-8')
    stream.write(struct.pack('>Q', len(payload)))
    stream.write(payload)
    stream.flush()

stdin = sys.stdin.buffer
stdout = sys.stdout.buffer

setup = read_frame(stdin)
try:
    sys.path[:0] = setup.get('sys_path') or []
    write_frame(stdout, {'status': 'READY', 'package_spec': setup.get('package_spec')})
except Exception as error:
    write_frame(stdout, {'status': 'FATAL', 'error': str(error)})
    sys.exit(1)

namespace = {'__name__': '__main__'}
while True:
    message = read_frame(stdin)
    if message is None or message.get('type') == 'shutdown':
        break
    task_id = message.get('task_id')
    out = io.StringIO()
    err = io.StringIO()
    try:
        with contextlib.redirect_stdout(out), contextlib.redirect_stderr(err):
            exec(message.get('code', ''), namespace)
        write_frame(stdout, {
            'status': 'COMPLETED', 'task_id': task_id,
            'stdout': out.getvalue(), 'stderr': err.getvalue(),
        })
    except BaseException:
        write_frame(stdout, {
            'status': 'ERROR', 'task_id': task_id, 'error': traceback.format_exc(),
            'stdout': out.getvalue(), 'stderr': err.getvalue(),
        })
"#;

/// Write one length-prefixed JSON frame: 8-byte big-endian length, then the
/// UTF-8 JSON payload.
pub(crate) fn write_frame(writer: &mut impl Write, message: &Value) -> Result<(), FrameError> {
    let payload = serde_json::to_vec(message).map_err(FrameError::Encode)?;
    let length = payload.len() as u64;
    if length > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(length));
    }
    writer.write_all(&length.to_be_bytes()).map_err(FrameError::Io)?;
    writer.write_all(&payload).map_err(FrameError::Io)?;
    writer.flush().map_err(FrameError::Io)
}

/// Read one length-prefixed JSON frame.
pub(crate) fn read_frame(reader: &mut impl Read) -> Result<Value, FrameError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).map_err(|io_error| {
        if io_error.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::Eof
        } else {
            FrameError::Io(io_error)
        }
    })?;
    let length = u64::from_be_bytes(header);
    if length > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(length));
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).map_err(FrameError::Io)?;
    serde_json::from_slice(&payload).map_err(FrameError::Decode)
}

/// Errors in the framed wire protocol itself.
#[derive(Debug)]
pub enum FrameError {
    Decode(serde_json::Error),
    Encode(serde_json::Error),
    Eof,
    Io(io::Error),
    TooLarge(u64),
}

/// The captured output of one `execute` round-trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A long-lived child interpreter with one bubble activated at startup,
/// executing code on behalf of the parent over the framed protocol.
#[derive(Debug)]
pub struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    spec: PackageSpec,
    next_task_id: u64,
}

impl Worker {
    /// Spawn a worker for `spec` whose interpreter starts with `sys_path`
    /// prepended to its import path. Blocks until the agent reports READY.
    pub(crate) fn spawn(
        python_executable: &Path,
        spec: &PackageSpec,
        sys_path: &[PathBuf],
    ) -> Result<Self, WorkerError> {
        let mut child = Command::new(python_executable)
            .args(["-I", "-c", WORKER_AGENT])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|io_error| WorkerError::Startup {
                spec: spec.clone(),
                detail: format!("could not spawn interpreter: {io_error}"),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Startup {
            spec: spec.clone(),
            detail: "worker stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Startup {
            spec: spec.clone(),
            detail: "worker stdout unavailable".to_string(),
        })?;

        let mut worker = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            spec: spec.clone(),
            next_task_id: 0,
        };

        let paths: Vec<String> = sys_path
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        let setup = json!({ "package_spec": spec.to_string(), "sys_path": paths });
        worker.send(&setup)?;
        let reply = worker.receive()?;
        match reply.get("status").and_then(Value::as_str) {
            Some("READY") => Ok(worker),
            Some("FATAL") => Err(WorkerError::Startup {
                spec: spec.clone(),
                detail: reply
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("worker reported FATAL")
                    .to_string(),
            }),
            other => Err(WorkerError::Startup {
                spec: spec.clone(),
                detail: format!("unexpected setup reply status: {other:?}"),
            }),
        }
    }

    pub(crate) fn spec(&self) -> &PackageSpec {
        &self.spec
    }

    /// Run `code` in the worker and return its captured output.
    pub fn execute(&mut self, code: &str) -> Result<ExecutionOutput, WorkerError> {
        self.execute_with(code, None, None)
    }

    /// Run `code`, passing through optional shared-memory block descriptors
    /// for the agent to map (input read-only, output read-write).
    pub fn execute_with(
        &mut self,
        code: &str,
        shm_in: Option<Value>,
        shm_out: Option<Value>,
    ) -> Result<ExecutionOutput, WorkerError> {
        self.next_task_id += 1;
        let task_id = self.next_task_id;
        let mut message = json!({ "type": "execute", "task_id": task_id, "code": code });
        if let Some(shm_in) = shm_in {
            message["shm_in"] = shm_in;
        }
        if let Some(shm_out) = shm_out {
            message["shm_out"] = shm_out;
        }
        self.send(&message)?;

        let reply = self.receive()?;
        let field = |name: &str| {
            reply
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match reply.get("status").and_then(Value::as_str) {
            Some("COMPLETED") => Ok(ExecutionOutput {
                stdout: field("stdout"),
                stderr: field("stderr"),
            }),
            Some("ERROR") => Err(WorkerError::Execution {
                spec: self.spec.clone(),
                error: field("error"),
                stdout: field("stdout"),
                stderr: field("stderr"),
            }),
            other => Err(WorkerError::Protocol(format!(
                "unexpected execute reply status: {other:?}"
            ))),
        }
    }

    /// The installed version of `name` as seen by the worker's interpreter.
    pub fn get_version(&mut self, name: &str) -> Result<String, WorkerError> {
        let code = format!(
            "import importlib.metadata; print(importlib.metadata.version({name:?}))"
        );
        let output = self.execute(&code)?;
        Ok(output.stdout.trim().to_string())
    }

    /// Ask the agent to exit and reap the child. Kills it if it lingers.
    pub(crate) fn shutdown(mut self) {
        if self.send(&json!({ "type": "shutdown" })).is_err() {
            self.child.kill().ok();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() >= deadline => {
                    self.child.kill().ok();
                    self.child.wait().ok();
                    return;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => {
                    self.child.kill().ok();
                    return;
                }
            }
        }
    }

    fn send(&mut self, message: &Value) -> Result<(), WorkerError> {
        write_frame(&mut self.stdin, message).map_err(WorkerError::Frame)
    }

    fn receive(&mut self) -> Result<Value, WorkerError> {
        read_frame(&mut self.stdout).map_err(WorkerError::Frame)
    }
}

/// Errors from the worker fallback.
#[derive(Debug)]
pub enum WorkerError {
    /// The worker process could not be started or never became READY.
    /// There is no further fallback behind this one.
    Startup { spec: PackageSpec, detail: String },
    Execution {
        spec: PackageSpec,
        error: String,
        stdout: String,
        stderr: String,
    },
    Frame(FrameError),
    Protocol(String),
}

/// A pool of workers keyed by `name==version`, reused across activations.
/// This is the daemon-lite optimization: correctness never depends on it,
/// a cold spawn is always a valid substitute for a pooled worker.
#[derive(Debug)]
pub struct WorkerPool {
    python_executable: PathBuf,
    idle_timeout: Duration,
    workers: Mutex<HashMap<String, PooledWorker>>,
}

#[derive(Debug)]
struct PooledWorker {
    worker: Worker,
    last_used: Instant,
}

impl WorkerPool {
    pub fn new(python_executable: &Path) -> Self {
        Self {
            python_executable: python_executable.to_path_buf(),
            idle_timeout: WORKER_IDLE_TIMEOUT,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Take the pooled worker for `spec`, spawning one if needed. The caller
    /// returns it with [`WorkerPool::checkin`] when done.
    pub fn checkout(
        &self,
        spec: &PackageSpec,
        sys_path: &[PathBuf],
    ) -> Result<Worker, WorkerError> {
        self.evict_idle();
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pooled) = workers.remove(&spec.to_string()) {
            return Ok(pooled.worker);
        }
        drop(workers);
        Worker::spawn(&self.python_executable, spec, sys_path)
    }

    pub fn checkin(&self, worker: Worker) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if workers.len() >= MAX_POOLED_WORKERS {
            // Tear down the longest-idle worker to stay within the cap.
            if let Some(oldest) = workers
                .iter()
                .min_by_key(|(_, pooled)| pooled.last_used)
                .map(|(key, _)| key.clone())
            {
                if let Some(evicted) = workers.remove(&oldest) {
                    evicted.worker.shutdown();
                }
            }
        }
        workers.insert(
            worker.spec().to_string(),
            PooledWorker {
                worker,
                last_used: Instant::now(),
            },
        );
    }

    /// Tear down workers that have been idle past the timeout.
    pub fn evict_idle(&self) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let expired: Vec<String> = workers
            .iter()
            .filter(|(_, pooled)| pooled.last_used.elapsed() > self.idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            if let Some(pooled) = workers.remove(&key) {
                log_warning(
                    "Evicting idle worker",
                    format!("Worker for {key} idled past {:?}.", self.idle_timeout),
                );
                pooled.worker.shutdown();
            }
        }
    }

    pub fn shutdown_all(&self) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, pooled) in workers.drain() {
            pooled.worker.shutdown();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
