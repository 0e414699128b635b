use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bifrost_context::ContextStore;
use bifrost_storage::{BlobStore, ModuleCache, TextIndex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::protocol::{WorkItem, WorkResult};
use crate::runtime::WorkflowRuntime;
use crate::worker::{run_worker_loop, WorkflowLookup};

/// A single worker, however it is actually implemented (in-process task
/// or a real OS child process). The pool manager only needs to send
/// work, detect liveness, and terminate — it should not need to know
/// which transport backs a given worker.
#[async_trait]
pub trait SpawnedWorker: Send + Sync {
    fn work_sender(&self) -> mpsc::Sender<WorkItem>;

    /// `false` once the underlying task/process has exited, whether
    /// cleanly or by crashing — the monitor loop's crash-detection signal
    /// (§4.10 pass 2).
    fn is_alive(&self) -> bool;

    /// The OS process id backing this worker, if the transport has one.
    /// `InProcessWorker` has no real process and returns `None`.
    fn pid(&self) -> Option<u32>;

    /// SIGTERM-then-wait-then-SIGKILL for an OS process; `abort()` after
    /// the same grace period for an in-process task, since a cooperative
    /// task has no signal to catch.
    async fn terminate(&mut self, graceful_shutdown: Duration);
}

/// Spawns a worker and hands back a handle to it. `spawn` must not block
/// on the worker reaching readiness (§4.10: "the child is considered
/// alive once its OS handle reports alive").
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, result_tx: mpsc::Sender<WorkResult>) -> Box<dyn SpawnedWorker>;
}

/// Worker implemented as a `tokio::task` running [`run_worker_loop`]
/// directly against shared, in-process store handles. Used by tests and
/// by single-process deployments that accept losing OS-level crash
/// isolation in exchange for zero IPC overhead.
pub struct InProcessSpawner<C, B, T, M, R> {
    context_store: Arc<C>,
    lookup: Arc<dyn WorkflowLookup>,
    blobs: Arc<B>,
    text_index: Arc<T>,
    module_cache: Arc<M>,
    runtime: Arc<R>,
}

impl<C, B, T, M, R> InProcessSpawner<C, B, T, M, R>
where
    C: ContextStore + 'static,
    B: BlobStore + 'static,
    T: TextIndex + 'static,
    M: ModuleCache + 'static,
    R: WorkflowRuntime + 'static,
{
    pub fn new(
        context_store: Arc<C>,
        lookup: Arc<dyn WorkflowLookup>,
        blobs: Arc<B>,
        text_index: Arc<T>,
        module_cache: Arc<M>,
        runtime: Arc<R>,
    ) -> Self {
        Self {
            context_store,
            lookup,
            blobs,
            text_index,
            module_cache,
            runtime,
        }
    }
}

impl<C, B, T, M, R> WorkerSpawner for InProcessSpawner<C, B, T, M, R>
where
    C: ContextStore + 'static,
    B: BlobStore + 'static,
    T: TextIndex + 'static,
    M: ModuleCache + 'static,
    R: WorkflowRuntime + 'static,
{
    fn spawn(&self, result_tx: mpsc::Sender<WorkResult>) -> Box<dyn SpawnedWorker> {
        let (work_tx, work_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_worker_loop(
            work_rx,
            result_tx,
            self.context_store.clone(),
            self.lookup.clone(),
            self.blobs.clone(),
            self.text_index.clone(),
            self.module_cache.clone(),
            self.runtime.clone(),
        ));
        Box::new(InProcessWorker { work_tx, handle: Some(handle) })
    }
}

struct InProcessWorker {
    work_tx: mpsc::Sender<WorkItem>,
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl SpawnedWorker for InProcessWorker {
    fn work_sender(&self) -> mpsc::Sender<WorkItem> {
        self.work_tx.clone()
    }

    fn is_alive(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self, graceful_shutdown: Duration) {
        tokio::time::sleep(graceful_shutdown).await;
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Worker implemented as a real OS child process: the current executable
/// re-exec'd with a hidden worker subcommand, communicating over stdio as
/// newline-delimited JSON. This gives genuine crash isolation (a segfault
/// or OOM kill in the child cannot take down the pool manager), matching
/// the production deployment shape (wired from `bifrost-server`'s worker
/// entrypoint).
pub struct OsProcessSpawner {
    worker_exe: std::path::PathBuf,
    worker_args: Vec<String>,
}

impl OsProcessSpawner {
    pub fn new(worker_exe: std::path::PathBuf, worker_args: Vec<String>) -> Self {
        Self { worker_exe, worker_args }
    }
}

impl WorkerSpawner for OsProcessSpawner {
    fn spawn(&self, result_tx: mpsc::Sender<WorkResult>) -> Box<dyn SpawnedWorker> {
        let (work_tx, mut work_rx) = mpsc::channel::<WorkItem>(1);

        let mut child = Command::new(&self.worker_exe)
            .args(&self.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn worker process");

        let pid = child.id().map(|p| p as i32);
        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        // Shared so `is_alive` (needs only `&self`, per the `SpawnedWorker`
        // trait) and `terminate` (needs `&mut self`) can both reach the
        // same `Child` without aliasing it unsafely.
        let child = Arc::new(Mutex::new(child));

        tokio::spawn(async move {
            while let Some(item) = work_rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&item) else { continue };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<WorkResult>(&line) {
                        Ok(result) => {
                            if result_tx.send(result).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "malformed worker result line"),
                    },
                    _ => break,
                }
            }
        });

        Box::new(OsProcessWorker { pid, child, work_tx })
    }
}

struct OsProcessWorker {
    pid: Option<i32>,
    child: Arc<Mutex<tokio::process::Child>>,
    work_tx: mpsc::Sender<WorkItem>,
}

#[async_trait]
impl SpawnedWorker for OsProcessWorker {
    fn work_sender(&self) -> mpsc::Sender<WorkItem> {
        self.work_tx.clone()
    }

    fn is_alive(&self) -> bool {
        // `try_wait` returns `Ok(None)` while the child is still running;
        // it never blocks, so holding the lock here is instantaneous.
        let mut child = self.child.lock().unwrap();
        matches!(child.try_wait(), Ok(None))
    }

    fn pid(&self) -> Option<u32> {
        self.pid.map(|p| p as u32)
    }

    async fn terminate(&mut self, graceful_shutdown: Duration) {
        let Some(pid) = self.pid else { return };
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);

        let child = self.child.clone();
        let reaped = tokio::time::timeout(graceful_shutdown, tokio::task::spawn_blocking(move || {
            poll_until_exited(&child)
        }))
        .await;

        if reaped.is_err() {
            let mut child = self.child.lock().unwrap();
            let _ = child.start_kill();
            drop(child);
            let child = self.child.clone();
            let _ = tokio::task::spawn_blocking(move || poll_until_exited(&child)).await;
        }
    }
}

/// Polls `try_wait` (non-blocking) until the child exits, without holding
/// the lock across the sleep.
fn poll_until_exited(child: &Mutex<tokio::process::Child>) {
    loop {
        match child.lock().unwrap().try_wait() {
            Ok(Some(_)) | Err(_) => return,
            Ok(None) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}
