//! Host CPU telemetry agent.
//!
//! Samples CPU utilization into InfluxDB, raises debounced e-mail alerts on
//! sustained load, and periodically re-aggregates the recent window to feed
//! a snapshot file and a forecaster.

pub mod agent;
pub mod alert;
pub mod command;
pub mod config;
pub mod export;
pub mod forecast;
pub mod sampler;
pub mod snapshot;
pub mod store;
