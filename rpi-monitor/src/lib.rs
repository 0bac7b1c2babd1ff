//! rpi-monitor - Raspberry Pi host monitor for Home Assistant
//!
//! Publishes a periodic JSON snapshot of the host (hardware, OS, temperatures,
//! usage, pending updates) over MQTT, announces every entity through Home
//! Assistant MQTT discovery and runs whitelisted shell commands on request.

pub mod cli;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod notify;
pub mod reporting;
pub mod snapshot;
pub mod state;
pub mod timer;
pub mod topics;
pub mod transport;
pub mod updates;
