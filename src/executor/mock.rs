//! Identity executor used by tests and by scenario 3 of the testable
//! properties (§8): "the mock executor is an identity function."

use super::{Executor, LoadView};
use crate::message::ResultEnvelope;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub struct MockExecutor {
    tx: Mutex<Option<mpsc::UnboundedSender<ResultEnvelope>>>,
    rx: Mutex<mpsc::UnboundedReceiver<ResultEnvelope>>,
    outstanding: AtomicUsize,
    last_submit: Mutex<Instant>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            outstanding: AtomicUsize::new(0),
            last_submit: Mutex::new(Instant::now()),
        }
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn submit(&self, task_id: Uuid, task_buffer: Vec<u8>, routing_key: String) {
        let Some(tx) = self.tx.lock().await.clone() else {
            return;
        };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        *self.last_submit.lock().await = Instant::now();
        let result = ResultEnvelope::success(task_id, task_buffer, routing_key);
        // Identity function: echo the buffer straight back as the result.
        let _ = tx.send(result);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    async fn next_result(&self) -> Option<ResultEnvelope> {
        self.rx.lock().await.recv().await
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn load_view(&self) -> LoadView {
        LoadView {
            outstanding: self.outstanding(),
            idle_for: std::time::Duration::from_secs(0),
        }
    }

    /// Drops the sender so `next_result` observes closure, matching the
    /// `Executor` contract even though this identity executor has no
    /// in-flight work to join.
    async fn shutdown(&self, _drain: bool) {
        *self.tx.lock().await = None;
    }
}
