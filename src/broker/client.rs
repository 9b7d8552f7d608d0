use super::{BrokerParams, ConnectionState, DeliveredTask, QueueCoordinates};
use crate::error::BrokerError;
use crate::message::TaskEnvelope;
use futures_lite::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions,
    },
    types::FieldTable,
    BasicProperties, Connection, ConnectionProperties,
};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const BASE_BACKOFF: Duration = Duration::from_millis(1000);

struct Connected {
    _connection: Connection,
    consume_channel: lapin::Channel,
    publish_channel: lapin::Channel,
}

/// `lapin`-backed implementation of the C1 contract. Reconnection is
/// entirely internal: every public method retries against a fresh
/// connection before returning, so callers experience backpressure
/// (§4.1 "During reconnection ... outgoing publishes block") rather than
/// errors, while [`AmqpBrokerClient::subscribe_state`] lets the core drive
/// its own `Running <-> Reconnecting` transition.
///
/// The consumer stream is held behind its own mutex, separate from the
/// channels used by `publish`/`ack`/`nack`: `consume_next` awaits
/// `Consumer::next()` for as long as the task queue is empty, and that
/// await must never hold a lock egress also needs in order to publish a
/// ready result (§4.5/§5, "ingress is independent and proceeds in
/// parallel").
pub struct AmqpBrokerClient {
    params: BrokerParams,
    task_q: QueueCoordinates,
    result_q: QueueCoordinates,
    prefetch: u16,
    connected: Mutex<Option<Connected>>,
    consumer: Mutex<Option<lapin::Consumer>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl AmqpBrokerClient {
    pub fn new(params: BrokerParams, task_q: QueueCoordinates, result_q: QueueCoordinates, prefetch: u16) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Reconnecting);
        Self {
            params,
            task_q,
            result_q,
            prefetch,
            connected: Mutex::new(None),
            consumer: Mutex::new(None),
            state_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Establishes the consumer + confirming publisher channels (spec
    /// §4.1 `start`). Retries with exponential backoff (base 1s, cap 30s,
    /// up to 20% jitter) until it succeeds or `cancel` fires.
    pub async fn start(&self, cancel: &CancellationToken) -> bool {
        self.connect_with_backoff(cancel).await
    }

    async fn connect_once(&self) -> Result<(Connected, lapin::Consumer), BrokerError> {
        // Broker-recommended heartbeat interval (§4.1); lapin negotiates the
        // actual value with the server and keeps the connection alive on
        // our behalf, surfacing a missed heartbeat as a connection error.
        let props = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio)
            .with_heartbeat(self.params.heartbeat_secs);
        let connection = Connection::connect(&self.params.url, props)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let consume_channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        consume_channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let consumer = consume_channel
            .basic_consume(
                &self.task_q.queue,
                "endpoint-interchange",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok((
            Connected {
                _connection: connection,
                consume_channel,
                publish_channel,
            },
            consumer,
        ))
    }

    async fn connect_with_backoff(&self, cancel: &CancellationToken) -> bool {
        let mut backoff = BASE_BACKOFF;
        loop {
            match self.connect_once().await {
                Ok((connected, consumer)) => {
                    *self.connected.lock().await = Some(connected);
                    *self.consumer.lock().await = Some(consumer);
                    let _ = self.state_tx.send(ConnectionState::Connected);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker connect failed, retrying");
                    let _ = self.state_tx.send(ConnectionState::Reconnecting);
                    let jitter_ms = rand::thread_rng().gen_range(0..=(backoff.as_millis() as u64 / 5).max(1));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)) => {}
                        _ = cancel.cancelled() => return false,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> bool {
        *self.connected.lock().await = None;
        *self.consumer.lock().await = None;
        let _ = self.state_tx.send(ConnectionState::Reconnecting);
        self.connect_with_backoff(cancel).await
    }

    /// Blocks until the next task is delivered, reconnecting internally on
    /// any I/O error. Returns `None` only if `cancel` fires first.
    ///
    /// Holds only `self.consumer` while awaiting `Consumer::next()`, which
    /// can block indefinitely on an empty queue; `self.connected` (used by
    /// `publish`/`ack`/`nack`) is a separate lock, so egress is never
    /// starved by an idle ingress.
    pub async fn consume_next(&self, cancel: &CancellationToken) -> Option<DeliveredTask> {
        loop {
            let delivery = {
                let mut guard = self.consumer.lock().await;
                let Some(consumer) = guard.as_mut() else {
                    drop(guard);
                    if !self.reconnect(cancel).await {
                        return None;
                    }
                    continue;
                };
                tokio::select! {
                    next = consumer.next() => next,
                    _ = cancel.cancelled() => return None,
                }
            };

            match delivery {
                Some(Ok(delivery)) => match TaskEnvelope::from_bytes(&delivery.data) {
                    Ok(envelope) => {
                        return Some(DeliveredTask {
                            delivery_tag: delivery.delivery_tag,
                            envelope,
                        })
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "malformed task envelope, nacking without requeue");
                        let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                        continue;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "consumer stream error, reconnecting");
                    if !self.reconnect(cancel).await {
                        return None;
                    }
                }
                None => {
                    tracing::warn!("consumer stream ended, reconnecting");
                    if !self.reconnect(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Publishes to the result exchange and blocks until the broker
    /// confirms; any failure (including a negative confirm) reconnects and
    /// retries rather than dropping the body (I3).
    pub async fn publish(&self, body: &[u8], routing_key: &str, cancel: &CancellationToken) -> bool {
        loop {
            let outcome = {
                let guard = self.connected.lock().await;
                let Some(connected) = guard.as_ref() else {
                    drop(guard);
                    if !self.reconnect(cancel).await {
                        return false;
                    }
                    continue;
                };
                connected
                    .publish_channel
                    .basic_publish(
                        &self.result_q.exchange,
                        routing_key,
                        BasicPublishOptions::default(),
                        body,
                        BasicProperties::default(),
                    )
                    .await
            };

            let confirmed = match outcome {
                Ok(pending) => match pending.await {
                    Ok(confirmation) => !confirmation.is_nack(),
                    Err(e) => {
                        tracing::warn!(error = %e, "publish confirmation failed");
                        false
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "publish failed");
                    false
                }
            };

            if confirmed {
                return true;
            }
            if !self.reconnect(cancel).await {
                return false;
            }
        }
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let guard = self.connected.lock().await;
        let Some(connected) = guard.as_ref() else {
            return Err(BrokerError::Connection("not connected".to_string()));
        };
        connected
            .consume_channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let guard = self.connected.lock().await;
        let Some(connected) = guard.as_ref() else {
            return Err(BrokerError::Connection("not connected".to_string()));
        };
        connected
            .consume_channel
            .basic_nack(delivery_tag, BasicNackOptions { requeue, ..Default::default() })
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}
