//! Controller internals.
//!
//! - [`config`] - CLI and environment configuration.
//! - [`state`] - JSON seed file for the in-memory store.
//! - [`runner`] - per-policy evaluation loop with backoff.
//! - [`telemetry`] - logging and optional OpenTelemetry export.

pub mod config;
pub mod runner;
pub mod state;
pub mod telemetry;
