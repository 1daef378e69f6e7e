//! Prometheus exporter for KATCP device sensors.
//!
//! This crate keeps a connection to a single KATCP device, subscribes to all
//! of its sensors and exposes the latest value of each one as a Prometheus
//! gauge via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐  events  ┌───────────────┐     ┌───────────────┐     ┌───────────────┐
//! │  KATCP device │─────────>│    Watcher    │────>│     Store     │<────│  HTTP Server  │
//! │   (client)    │  (mpsc)  │  (projection) │     │  (snapshot)   │     │  (/metrics)   │
//! └───────────────┘          └───────────────┘     └───────────────┘     └───────────────┘
//! ```
//!
//! Values are projected onto floats: numbers as-is, booleans as 0/1, and
//! discrete values as their index in the order they were first seen. String
//! and address sensors are only exported with `workaround_strings`.
//!
//! # Usage
//!
//! ```bash
//! KATCP_HOST=device.local KATCP_PORT=7147 katcp-prometheus-bridge
//! ```
//!
//! # Configuration
//!
//! See [`config::BridgeConfig`] for configuration options.

pub mod client;
pub mod config;
pub mod event;
pub mod filter;
pub mod http;
pub mod mapping;
pub mod registry;
pub mod store;
pub mod watcher;

pub use client::{ClientError, Connection, KatcpClient};
pub use config::BridgeConfig;
pub use event::{ConnectionState, SensorEvent};
pub use filter::SensorFilter;
pub use http::HttpServer;
pub use store::{SensorStore, SharedStore};
pub use watcher::{SensorWatcher, WatcherStats};
