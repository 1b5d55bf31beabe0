//! Core types and utilities for the indexation lag monitor
//!
//! This crate provides shared types used across all components:
//! - Aggregator, chain and event definitions
//! - Lag computation and chain-name normalisation
//! - Error types
//! - Layered configuration

pub mod types;
pub mod chains;
pub mod lag;
pub mod clock;
pub mod config;
pub mod errors;

pub use types::*;
pub use chains::*;
pub use lag::*;
pub use clock::*;
pub use config::*;
pub use errors::*;
