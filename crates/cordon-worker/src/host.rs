use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde_json::{Map, Value};

use cordon_proto::{read_message, write_message, RemoteExceptionPayload, Request, Response, Status};

use crate::error::{RemoteInvocationError, WorkerError};

pub const ENV_WORKERD_BIN: &str = "CORDON_WORKERD_BIN";
pub const WORKERD_BIN_NAME: &str = "cordon-workerd";

const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// The manager-facing worker seam. Process-backed in production
/// ([`WorkerProcess`]); tests substitute in-process fakes.
pub trait Worker: Send + Sync {
    fn invoke(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, WorkerError>;

    /// Idempotent. Attempts a graceful shutdown round-trip, then always
    /// releases the channel and the process.
    fn stop(&self);

    /// True once any teardown path has run; a dead worker never recovers.
    fn is_dead(&self) -> bool;

    fn is_stopped(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// `None` waits forever (a configured timeout of zero or less maps to
    /// `None`, never to "fail immediately").
    pub rpc_timeout: Option<Duration>,
    pub stop_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            rpc_timeout: Some(Duration::from_secs(30)),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

struct Channel {
    child: Child,
    stdin: ChildStdin,
    responses: mpsc::Receiver<std::io::Result<Response>>,
    reader: Option<JoinHandle<()>>,
}

/// One session service instance running in its own OS process, driven over
/// a framed JSON channel on the child's stdin/stdout. Calls are strictly
/// serialized by the channel mutex: one in flight per worker at a time.
pub struct WorkerProcess {
    channel: Mutex<Option<Channel>>,
    dead: AtomicBool,
    stopped: AtomicBool,
    options: WorkerOptions,
}

impl WorkerProcess {
    pub fn spawn(
        program: &Path,
        storage_home: &Path,
        options: WorkerOptions,
    ) -> Result<Self, WorkerError> {
        let mut child = Command::new(program)
            .arg("--storage-home")
            .arg(storage_home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            WorkerError::Spawn(std::io::Error::other("worker stdin not captured"))
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            WorkerError::Spawn(std::io::Error::other("worker stdout not captured"))
        })?;

        let (tx, rx) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("cordon-worker-reader".to_string())
            .spawn(move || loop {
                match read_message::<Response>(&mut stdout) {
                    Ok(Some(response)) => {
                        if tx.send(Ok(response)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        break;
                    }
                }
            });
        let reader = match reader {
            Ok(handle) => handle,
            Err(err) => {
                let _ = child.kill();
                reap_child(child, KILL_REAP_TIMEOUT);
                return Err(WorkerError::Spawn(err));
            }
        };

        Ok(WorkerProcess {
            channel: Mutex::new(Some(Channel {
                child,
                stdin,
                responses: rx,
                reader: Some(reader),
            })),
            dead: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            options,
        })
    }

    // Single teardown funnel: close both channel endpoints, terminate the
    // process, join with a bounded wait. Safe to reach from any path.
    fn teardown(&self, slot: &mut Option<Channel>) {
        self.dead.store(true, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        let Some(channel) = slot.take() else { return };
        let Channel { mut child, stdin, responses, reader } = channel;
        drop(stdin);
        drop(responses);
        let _ = child.kill();
        reap_child(child, KILL_REAP_TIMEOUT);
        if let Some(handle) = reader {
            let _ = handle.join();
        }
    }
}

impl Worker for WorkerProcess {
    fn invoke(
        &self,
        command: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, WorkerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(WorkerError::Stopped);
        }

        let mut slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        if self.dead.load(Ordering::SeqCst) || slot.is_none() {
            return Err(WorkerError::Unavailable);
        }

        let request = Request::new(command, args, kwargs);
        let wrote = match slot.as_mut() {
            None => return Err(WorkerError::Unavailable),
            Some(channel) => write_message(&mut channel.stdin, &request),
        };
        if let Err(err) = wrote {
            tracing::debug!(command, error = %err, "worker request write failed");
            self.teardown(&mut slot);
            return Err(WorkerError::Unavailable);
        }

        // Err(Some(t)) means the configured timeout `t` elapsed; Err(None)
        // means the channel disconnected.
        let received = match slot.as_mut() {
            None => return Err(WorkerError::Unavailable),
            Some(channel) => match self.options.rpc_timeout {
                Some(timeout) => {
                    channel.responses.recv_timeout(timeout).map_err(|err| match err {
                        RecvTimeoutError::Timeout => Some(timeout),
                        RecvTimeoutError::Disconnected => None,
                    })
                }
                None => channel.responses.recv().map_err(|_| None),
            },
        };

        let response = match received {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::debug!(command, error = %err, "worker channel broke");
                self.teardown(&mut slot);
                return Err(WorkerError::Unavailable);
            }
            Err(Some(timeout)) => {
                tracing::warn!(command, ?timeout, "worker RPC timed out; destroying worker");
                self.teardown(&mut slot);
                return Err(WorkerError::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
            Err(None) => {
                self.teardown(&mut slot);
                return Err(WorkerError::Unavailable);
            }
        };
        drop(slot);

        match response.status() {
            Status::Ok => Ok(response.into_payload()),
            Status::Error => {
                let payload = RemoteExceptionPayload::from_raw(response.payload());
                Err(WorkerError::Remote(RemoteInvocationError::new(command, payload)))
            }
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut slot = self.channel.lock().unwrap_or_else(|e| e.into_inner());
        if !self.dead.load(Ordering::SeqCst) {
            if let Some(channel) = slot.as_mut() {
                if write_message(&mut channel.stdin, &Request::shutdown()).is_ok() {
                    let _ = channel.responses.recv_timeout(self.options.stop_timeout);
                }
            }
        }
        self.teardown(&mut slot);
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reap_child(mut child: Child, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return,
        }
    }
    // Hand a stubborn child to a detached waiter so it cannot linger as a
    // zombie while the owner moves on.
    let _ = std::thread::Builder::new()
        .name("cordon-worker-wait".to_string())
        .spawn(move || {
            let _ = child.wait();
        });
}

/// Spawns one worker rooted at a session's storage home.
pub trait WorkerFactory: Send + Sync {
    fn spawn_worker(&self, storage_home: &Path) -> Result<Arc<dyn Worker>, WorkerError>;
}

/// Default factory: runs the `cordon-workerd` guest binary.
pub struct ProcessWorkerFactory {
    program: PathBuf,
    options: WorkerOptions,
}

impl ProcessWorkerFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ProcessWorkerFactory {
            program: program.into(),
            options: WorkerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(ProcessWorkerFactory::new(locate_workerd()?))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn spawn_worker(&self, storage_home: &Path) -> Result<Arc<dyn Worker>, WorkerError> {
        let worker = WorkerProcess::spawn(&self.program, storage_home, self.options)?;
        Ok(Arc::new(worker))
    }
}

/// Resolve the worker guest binary: the `CORDON_WORKERD_BIN` override first,
/// then siblings of the current executable (including the parent of a
/// `deps/` test binary).
pub fn locate_workerd() -> anyhow::Result<PathBuf> {
    if let Some(raw) = std::env::var_os(ENV_WORKERD_BIN) {
        let path = PathBuf::from(raw);
        if path.is_file() {
            return Ok(path);
        }
        anyhow::bail!(
            "{ENV_WORKERD_BIN} points at {} which does not exist",
            path.display()
        );
    }

    let mut checked: Vec<PathBuf> = Vec::new();
    let exe = std::env::current_exe().context("resolve current executable")?;
    if let Some(exe_dir) = exe.parent() {
        for base in [Some(exe_dir), exe_dir.parent()] {
            let Some(base) = base else { continue };
            let candidate = base.join(WORKERD_BIN_NAME);
            checked.push(candidate.clone());
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    let checked = checked
        .into_iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");
    anyhow::bail!(
        "could not locate the {WORKERD_BIN_NAME} binary\n\nlooked for:\n{checked}\n\nfix:\n  - build the workspace so {WORKERD_BIN_NAME} sits next to this executable, or\n  - set {ENV_WORKERD_BIN} to its path"
    );
}
