//! Durable message pump between a broker-backed task queue and a local
//! worker pool (see SPEC_FULL.md for the full component breakdown).

pub mod broker;
pub mod config;
pub mod error;
pub mod executor;
pub mod interchange;
pub mod lock;
pub mod message;
pub mod registration;
pub mod spool;
pub mod strategy;

pub use config::{EndpointConfig, EndpointPaths};
pub use error::InterchangeError;
pub use interchange::{Interchange, State};
pub use lock::EndpointLock;
pub use registration::{RegistrationClient, RegistrationRecord};
pub use spool::ResultSpool;
