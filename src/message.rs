//! Wire/spool envelope for tasks and results (§3 of the interchange spec).
//!
//! The same bytes produced by [`ResultEnvelope::to_bytes`] are written to the
//! result spool and published to the broker unchanged, satisfying the
//! "on-the-wire body is the same bytes written to the spool" invariant.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task pulled off the broker's task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    #[serde(with = "base64_bytes")]
    pub task_buffer: Vec<u8>,
    pub routing_key: String,
}

impl TaskEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// The kind of outcome a result carries. `WorkerFailed` is the only kind the
/// façade ever manufactures itself; everything else is opaque worker output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Success,
    WorkerFailed,
}

/// A result bound for the broker's result queue, keyed by `routing_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: Uuid,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub routing_key: String,
    pub kind: ResultKind,
    pub completed_at: DateTime<Utc>,
}

impl ResultEnvelope {
    pub fn success(task_id: Uuid, data: Vec<u8>, routing_key: String) -> Self {
        Self {
            task_id,
            data,
            routing_key,
            kind: ResultKind::Success,
            completed_at: Utc::now(),
        }
    }

    /// Build the `WorkerFailed` encoding described in §4.3: a crashed worker
    /// never drops a submission silently, it surfaces as a result instead.
    pub fn worker_failed(task_id: Uuid, routing_key: String, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            data: format!("WorkerFailed: {}", reason.into()).into_bytes(),
            routing_key,
            kind: ResultKind::WorkerFailed,
            completed_at: Utc::now(),
        }
    }

    /// Serialize to the exact bytes that are written to the spool and
    /// published to the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use super::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
