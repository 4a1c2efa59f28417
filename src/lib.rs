//! wameter - network telemetry server
//!
//! Agents push interface reports; the server keeps a registry of agents,
//! persists every report, derives per-interface rates, evaluates alert
//! predicates and fans alerts out to notification sinks.

pub mod actors;
pub mod alerts;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod ingest;
pub mod lifecycle;
pub mod logging;
pub mod notify;
pub mod registry;
pub mod storage;
pub mod types;
pub mod util;

pub use error::{Error, ErrorKind, Result};
