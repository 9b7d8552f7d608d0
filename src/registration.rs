//! Registration handshake (C6, spec §4.6): one-shot exchange with the
//! control plane yielding broker credentials and queue coordinates.

use crate::broker::{BrokerParams, QueueCoordinates};
use crate::error::InterchangeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const RUNNING_VERSION: &str = env!("CARGO_PKG_VERSION");
const MAX_RETRIES: u32 = 5;

/// Immutable per-run coordinates obtained from the control plane at
/// startup (spec §3). Persisted to `endpoint.json` so a restart can be
/// diagnosed, though it is always reacquired rather than reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub endpoint_id: Uuid,
    pub broker: BrokerParams,
    pub task_queue: QueueCoordinates,
    pub result_queue: QueueCoordinates,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[allow(dead_code)]
    api: String,
    min_ep_version: String,
    #[allow(dead_code)]
    min_sdk_version: String,
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    metadata: serde_json::Value,
    version: &'a str,
}

pub struct RegistrationClient {
    http: reqwest::Client,
    control_plane_url: String,
}

impl RegistrationClient {
    pub fn new(control_plane_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            control_plane_url,
        }
    }

    /// `GET /version`. Called once up front as a fast compatibility check
    /// and once more during `register` (preserved intentionally — see
    /// SPEC_FULL.md §4.6 / DESIGN.md Open Questions).
    pub async fn check_version(&self) -> Result<(), InterchangeError> {
        let resp = self.get_version_with_retry().await?;
        if version_is_too_old(RUNNING_VERSION, &resp.min_ep_version) {
            return Err(InterchangeError::FatalVersionMismatch {
                running: RUNNING_VERSION.to_string(),
                required: resp.min_ep_version,
            });
        }
        Ok(())
    }

    async fn get_version_with_retry(&self) -> Result<VersionResponse, InterchangeError> {
        let url = format!("{}/version", self.control_plane_url);
        with_backoff(MAX_RETRIES, || async {
            self.http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<VersionResponse>()
                .await
        })
        .await
        .map_err(|e| InterchangeError::TransientControlPlaneExhausted(e.to_string()))
    }

    /// `POST /endpoints/{id}`. Runs the version check again (see above),
    /// then registers and returns the broker/queue coordinates.
    pub async fn register(
        &self,
        endpoint_id: Uuid,
        endpoint_name: &str,
    ) -> Result<RegistrationRecord, InterchangeError> {
        self.check_version().await?;

        let url = format!("{}/endpoints/{}", self.control_plane_url, endpoint_id);
        let body = RegisterRequest {
            name: endpoint_name,
            metadata: serde_json::json!({ "hostname": hostname() }),
            version: RUNNING_VERSION,
        };

        let record: RegistrationRecord = with_backoff(MAX_RETRIES, || async {
            self.http
                .post(&url)
                .json(&body)
                .send()
                .await?
                .error_for_status()?
                .json::<RegistrationRecord>()
                .await
        })
        .await
        .map_err(|e| InterchangeError::TransientControlPlaneExhausted(e.to_string()))?;

        Ok(record)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// Compares `min_ep_version` against the running version. A real
/// implementation would use full semver precedence; string-lexicographic
/// comparison is sufficient for the dotted `MAJOR.MINOR.PATCH` scheme this
/// control plane uses and keeps this crate's dependency footprint small.
fn version_is_too_old(running: &str, min_required: &str) -> bool {
    parse_version(running) < parse_version(min_required)
}

fn parse_version(v: &str) -> (u64, u64, u64) {
    let mut parts = v.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// Retries a transient control-plane call with the same bounded
/// exponential backoff shape as the broker client (base 1s, cap 30s).
async fn with_backoff<F, Fut, T>(max_retries: u32, mut op: F) -> Result<T, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, reqwest::Error>>,
{
    let mut backoff = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(e);
                }
                tracing::warn!(error = %e, attempt, "control-plane call failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
}
