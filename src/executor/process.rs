//! `ProcessPoolExecutor`: the "bare processes" worker-pool variant named in
//! spec §3. Each worker block is one OS child process; the façade writes
//! the task envelope to its stdin and reads one JSON result line from its
//! stdout.

use super::{Executor, Launcher, LoadView, Provider};
use crate::message::{ResultEnvelope, TaskEnvelope};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Identity wrap: the shipped launcher just execs the configured command
/// as-is. A container or cluster-scheduler launcher would implement
/// [`Launcher`] instead.
pub struct DirectLauncher;

impl Launcher for DirectLauncher {
    fn wrap_command(&self, command: &[String]) -> Vec<String> {
        command.to_vec()
    }
}

/// Adjusts the executor's worker-block count. A "block" here is one
/// concurrent worker slot on this host, realized as a semaphore permit.
pub struct LocalProvider {
    semaphore: Arc<Semaphore>,
    allocated: AtomicUsize,
}

impl LocalProvider {
    pub fn new(semaphore: Arc<Semaphore>, initial_blocks: usize) -> Self {
        Self {
            semaphore,
            allocated: AtomicUsize::new(initial_blocks),
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn scale_out(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.semaphore.add_permits(n);
        self.allocated.fetch_add(n, Ordering::SeqCst);
    }

    async fn scale_in(&self, n: usize) {
        // Acquire-and-forget permanently removes `n` permits from
        // circulation once any in-flight workers release them.
        for _ in 0..n {
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                permit.forget();
                self.allocated.fetch_sub(1, Ordering::SeqCst);
            } else {
                break;
            }
        }
    }

    fn status(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }
}

pub struct ProcessPoolExecutor {
    worker_command: Vec<String>,
    launcher: Arc<dyn Launcher>,
    semaphore: Arc<Semaphore>,
    results_tx: Mutex<Option<mpsc::UnboundedSender<ResultEnvelope>>>,
    results_rx: Mutex<mpsc::UnboundedReceiver<ResultEnvelope>>,
    outstanding: AtomicUsize,
    last_submit: Mutex<Instant>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessPoolExecutor {
    pub fn new(worker_command: Vec<String>, launcher: Arc<dyn Launcher>, initial_blocks: usize) -> Arc<Self> {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            worker_command,
            launcher,
            semaphore: Arc::new(Semaphore::new(initial_blocks.max(1))),
            results_tx: Mutex::new(Some(results_tx)),
            results_rx: Mutex::new(results_rx),
            outstanding: AtomicUsize::new(0),
            last_submit: Mutex::new(Instant::now()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_one(
        command: Vec<String>,
        semaphore: Arc<Semaphore>,
        task_id: Uuid,
        task_buffer: Vec<u8>,
        routing_key: String,
        results_tx: mpsc::UnboundedSender<ResultEnvelope>,
    ) {
        let _permit = semaphore.acquire_owned().await;
        let result = Self::execute(command, task_id, task_buffer, routing_key.clone())
            .await
            .unwrap_or_else(|reason| ResultEnvelope::worker_failed(task_id, routing_key, reason));
        let _ = results_tx.send(result);
    }

    async fn execute(
        command: Vec<String>,
        task_id: Uuid,
        task_buffer: Vec<u8>,
        routing_key: String,
    ) -> Result<ResultEnvelope, String> {
        let Some((program, args)) = command.split_first() else {
            return Err("empty worker command".to_string());
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| format!("spawn failed: {e}"))?;

        let envelope = TaskEnvelope {
            task_id,
            task_buffer,
            routing_key: routing_key.clone(),
        };
        let line = serde_json::to_vec(&envelope).map_err(|e| format!("encode task: {e}"))?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| "worker has no stdin".to_string())?;
            stdin.write_all(&line).await.map_err(|e| format!("write stdin: {e}"))?;
            stdin.write_all(b"\n").await.map_err(|e| format!("write stdin: {e}"))?;
        }
        // Close stdin so a well-behaved worker sees EOF after one task.
        child.stdin = None;

        let stdout = child.stdout.take().ok_or_else(|| "worker has no stdout".to_string())?;
        let mut reader = BufReader::new(stdout);
        let mut out_line = String::new();
        reader
            .read_line(&mut out_line)
            .await
            .map_err(|e| format!("read stdout: {e}"))?;

        let status = child.wait().await.map_err(|e| format!("wait failed: {e}"))?;
        if !status.success() {
            return Err(format!("worker exited with {status}"));
        }
        if out_line.trim().is_empty() {
            return Err("worker produced no output".to_string());
        }

        let data = out_line.trim_end().as_bytes().to_vec();
        Ok(ResultEnvelope::success(task_id, data, routing_key))
    }
}

#[async_trait]
impl Executor for ProcessPoolExecutor {
    async fn submit(&self, task_id: Uuid, task_buffer: Vec<u8>, routing_key: String) {
        // Cloned from the struct's own sender, which `shutdown` drops after
        // every spawned worker has been joined; `submit` is never called
        // again past that point, but bail out rather than panic if it is.
        let Some(results_tx) = self.results_tx.lock().await.clone() else {
            return;
        };

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        *self.last_submit.lock().await = Instant::now();

        let command = self.launcher.wrap_command(&self.worker_command);
        let semaphore = self.semaphore.clone();

        // `outstanding` is decremented centrally in `next_result`, once the
        // result has actually been handed to the caller.
        let handle = tokio::spawn(Self::run_one(
            command,
            semaphore,
            task_id,
            task_buffer,
            routing_key,
            results_tx,
        ));
        self.handles.lock().await.push(handle);
    }

    async fn next_result(&self) -> Option<ResultEnvelope> {
        let result = self.results_rx.lock().await.recv().await;
        if result.is_some() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        result
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn load_view(&self) -> LoadView {
        LoadView {
            outstanding: self.outstanding(),
            idle_for: Instant::now().saturating_duration_since(
                // try_lock avoids blocking the strategy tick on the submit path
                self.last_submit
                    .try_lock()
                    .map(|g| *g)
                    .unwrap_or_else(|_| Instant::now()),
            ),
        }
    }

    async fn shutdown(&self, drain: bool) {
        {
            let mut handles = self.handles.lock().await;
            if drain {
                for handle in handles.drain(..) {
                    let _ = handle.await;
                }
            } else {
                for handle in handles.drain(..) {
                    handle.abort();
                }
            }
        }
        // Drop the last sender so `next_result` observes channel closure
        // once every spawned worker's own clone has also been dropped,
        // rather than blocking on `recv()` forever (§4.3 "`next_result`
        // returns `None` only once the façade has been shut down").
        *self.results_tx.lock().await = None;
    }
}
