//! Typed error kinds (§7) mapped onto the exit codes of §6.

use thiserror::Error;

/// Exit codes from spec §6.
pub mod exit_code {
    pub const CLEAN: i32 = 0;
    pub const UNHANDLED: i32 = 1;
    pub const CONFIG: i32 = 2;
    pub const REGISTRATION: i32 = 3;
    pub const LOCK_CONTENTION: i32 = 4;
}

/// Errors that can end an interchange run. Transient broker and
/// control-plane errors are recovered internally (§7 "Propagation") and
/// never constructed at this level except once their component's retry
/// budget is exhausted.
#[derive(Debug, Error)]
pub enum InterchangeError {
    #[error("control plane rejected the endpoint: {0}")]
    TransientControlPlaneExhausted(String),

    #[error("configuration error: {0}")]
    FatalConfig(String),

    #[error(
        "endpoint version too old: this build implements {running}, control plane requires {required}"
    )]
    FatalVersionMismatch { running: String, required: String },

    #[error("result spool I/O failure: {0}")]
    SpoolIo(#[from] std::io::Error),

    #[error("another interchange instance holds the lock (pid {0})")]
    LockHeld(u32),
}

impl InterchangeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            InterchangeError::TransientControlPlaneExhausted(_) => exit_code::REGISTRATION,
            InterchangeError::FatalVersionMismatch { .. } => exit_code::REGISTRATION,
            InterchangeError::FatalConfig(_) => exit_code::CONFIG,
            InterchangeError::SpoolIo(_) => exit_code::UNHANDLED,
            InterchangeError::LockHeld(_) => exit_code::LOCK_CONTENTION,
        }
    }
}

/// Broker-facing errors. These never escape the broker module except as the
/// `Running -> Reconnecting` transition observed by the core; they are not
/// part of [`InterchangeError`].
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("publish was not confirmed: {0}")]
    NotConfirmed(String),
}
