//! Broker client (C1, spec §4.1): AMQP 0-9-1 consumer + confirming
//! publisher, reconnecting with backoff entirely internally so that the
//! Interchange core only ever observes `Connected` / `Disconnected`.

mod client;

pub use client::AmqpBrokerClient;

use serde::{Deserialize, Serialize};

/// Connection parameters produced by the registration handshake (C6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerParams {
    pub url: String,
    pub heartbeat_secs: u16,
}

/// Coordinates for one side (task or result) of the broker exchange, as
/// returned by registration (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCoordinates {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// A task delivered from the broker, still requiring ack/nack.
#[derive(Debug, Clone)]
pub struct DeliveredTask {
    pub delivery_tag: u64,
    pub envelope: crate::message::TaskEnvelope,
}

/// Connection health as observed from outside the broker module, driving
/// the Interchange core's `Running <-> Reconnecting` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
}
