//! Interchange Core (C5, spec §4.5): the state machine that wires C1–C4
//! together and owns shutdown, reconnection policy, and result
//! persistence.

use crate::broker::{AmqpBrokerClient, ConnectionState};
use crate::config::EndpointConfig;
use crate::executor::{Executor, LoadView, Provider};
use crate::message::ResultEnvelope;
use crate::spool::ResultSpool;
use crate::strategy::{run_strategy_loop, ScalingStrategy};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Spec §4.5's states, minus `Registering`: the registration handshake
/// (C6) runs to completion in `main` before an `Interchange` is even
/// constructed, so a `register` CLI invocation can exercise it without
/// standing up a broker client or worker pool. This core's own state
/// machine starts from `Connecting` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Connecting,
    Running,
    Reconnecting,
    Draining,
    Stopped,
}

/// Everything C5 needs, already resolved by `main`: a live registration, a
/// broker client, a spool rooted at the endpoint directory, and the
/// executor/provider/strategy trio. Held together here rather than built
/// incrementally so that ownership between the three concurrent flows is
/// unambiguous: each flow gets only the handles it touches.
pub struct Interchange {
    broker: Arc<AmqpBrokerClient>,
    spool: ResultSpool,
    executor: Arc<dyn Executor>,
    provider: Arc<dyn Provider>,
    strategy: Arc<dyn ScalingStrategy>,
    config: EndpointConfig,
    state_tx: watch::Sender<State>,
}

impl Interchange {
    pub fn new(
        broker: Arc<AmqpBrokerClient>,
        spool: ResultSpool,
        executor: Arc<dyn Executor>,
        provider: Arc<dyn Provider>,
        strategy: Arc<dyn ScalingStrategy>,
        config: EndpointConfig,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(State::Starting);
        Self {
            broker,
            spool,
            executor,
            provider,
            strategy,
            config,
            state_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: State) {
        tracing::info!(?state, "interchange state transition");
        let _ = self.state_tx.send(state);
    }

    /// Runs until `cancel` fires (graceful drain, spec §5 "Cancellation") or
    /// the broker client gives up connecting because `cancel` fired first.
    /// Returns once the `Stopped` state is reached.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.set_state(State::Connecting);
        if !self.broker.start(&cancel).await {
            self.set_state(State::Stopped);
            return;
        }
        self.set_state(State::Running);

        let (egress_tx, egress_rx) = mpsc::unbounded_channel::<ResultEnvelope>();

        self.replay_pending(&egress_tx);

        let ingress = tokio::spawn(Self::ingress_flow(self.clone(), cancel.clone()));
        let results = tokio::spawn(Self::results_flow(self.clone(), egress_tx.clone()));
        let egress = tokio::spawn(Self::egress_flow(self.clone(), egress_rx, cancel.clone()));
        let connection_watch = tokio::spawn(Self::forward_connection_state(self.clone(), cancel.clone()));

        let (scale_shutdown_tx, scale_shutdown_rx) = watch::channel(false);
        let load_source: Arc<dyn Fn() -> LoadView + Send + Sync> = {
            let executor = self.executor.clone();
            Arc::new(move || executor.load_view())
        };
        let scaling = tokio::spawn(run_strategy_loop(
            self.strategy.clone(),
            self.provider.clone(),
            load_source,
            self.config.tick_interval(),
            scale_shutdown_rx,
        ));

        cancel.cancelled().await;
        connection_watch.abort();
        self.set_state(State::Draining);
        let _ = scale_shutdown_tx.send(true);

        let drain = async {
            let _ = ingress.await;
            self.executor.shutdown(true).await;
            let _ = results.await;
            let _ = egress.await;
        };
        if tokio::time::timeout(self.config.drain_deadline(), drain)
            .await
            .is_err()
        {
            tracing::warn!("drain deadline elapsed with spool entries still outstanding");
        }
        let _ = scaling.await;

        self.set_state(State::Stopped);
    }

    /// Forwards the broker client's own `Connected`/`Reconnecting` view
    /// (spec §4.1) into this core's `Running <-> Reconnecting` transition,
    /// so a broker bounce is visible to anything watching `subscribe_state`
    /// without the broker module reaching back into `Interchange` itself.
    /// Runs until `cancel` fires; the caller aborts it before `Draining` so
    /// a late reconnect can't flip the state back after shutdown begins.
    async fn forward_connection_state(self: Arc<Self>, cancel: CancellationToken) {
        let mut broker_state = self.broker.subscribe_state();
        loop {
            tokio::select! {
                changed = broker_state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    match *broker_state.borrow() {
                        ConnectionState::Connected => self.set_state(State::Running),
                        ConnectionState::Reconnecting => self.set_state(State::Reconnecting),
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Spec §4.5 "Spool-replay": schedule every entry found at startup
    /// through the shared egress pipeline, read off disk rather than
    /// resubmitted to the executor (I1 already holds for them).
    fn replay_pending(&self, egress_tx: &mpsc::UnboundedSender<ResultEnvelope>) {
        let Ok(pending) = self.spool.iter_pending() else {
            return;
        };
        for (task_id, _path) in pending {
            match self.spool.read(task_id).and_then(|bytes| {
                ResultEnvelope::from_bytes(&bytes).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })
            }) {
                Ok(envelope) => {
                    tracing::info!(%task_id, "replaying spool entry from previous run");
                    let _ = egress_tx.send(envelope);
                }
                Err(e) => {
                    tracing::error!(%task_id, error = %e, "unreadable spool entry, leaving in place");
                }
            }
        }
    }

    /// Consume a task, hand it to the executor, ack only once the executor
    /// has accepted it (spec §4.5: "ack is deferred... so a crash between
    /// consume and submit causes the broker to redeliver").
    async fn ingress_flow(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let Some(delivered) = self.broker.consume_next(&cancel).await else {
                return;
            };
            let envelope = delivered.envelope;
            self.executor
                .submit(envelope.task_id, envelope.task_buffer, envelope.routing_key)
                .await;
            if let Err(e) = self.broker.ack(delivered.delivery_tag).await {
                tracing::warn!(error = %e, "ack failed, delivery will be redelivered");
            }
        }
    }

    /// Pull fresh results off the executor, persist to the spool (the fixed
    /// "put, then publish, then delete" order of §4.5), then hand to the
    /// shared publish pipeline.
    async fn results_flow(self: Arc<Self>, egress_tx: mpsc::UnboundedSender<ResultEnvelope>) {
        loop {
            let Some(result) = self.executor.next_result().await else {
                return;
            };
            match result
                .to_bytes()
                .map_err(std::io::Error::other)
                .and_then(|bytes| self.spool.put(result.task_id, &bytes))
            {
                Ok(()) => {
                    if egress_tx.send(result).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Spool I/O failure is fatal per spec §7: the invariants
                    // depend on durable persistence.
                    tracing::error!(error = %e, "spool write failed, aborting");
                    return;
                }
            }
        }
    }

    /// The single publish pipeline shared by fresh results and spool replay
    /// (spec §4.5: "a result is never published twice concurrently").
    async fn egress_flow(
        self: Arc<Self>,
        mut egress_rx: mpsc::UnboundedReceiver<ResultEnvelope>,
        cancel: CancellationToken,
    ) {
        while let Some(result) = egress_rx.recv().await {
            let task_id = result.task_id;
            if !self.spool.contains(task_id) {
                // Already published and cleared by a prior pass over the
                // same entry; nothing left to do (dedup, spec §4.5).
                continue;
            }
            let Ok(bytes) = result.to_bytes() else {
                tracing::error!(%task_id, "failed to re-encode result for publish");
                continue;
            };
            if !self.broker.publish(&bytes, &result.routing_key, &cancel).await {
                // Only returns false if `cancel` fired; the entry stays on
                // disk for the next run (I2).
                return;
            }
            if let Err(e) = self.spool.delete(task_id) {
                tracing::error!(%task_id, error = %e, "failed to delete spool entry after publish");
            }
        }
    }
}
