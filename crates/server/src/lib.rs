//! Indexation lag monitor
//!
//! Exposes the shared metrics registry over HTTP for Prometheus

pub mod server;

pub use server::{metrics_router, serve};
