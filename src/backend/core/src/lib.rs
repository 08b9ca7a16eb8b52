//! meteo-core: recurring-job scheduler with live weather updates.
//!
//! Jobs are persisted in SQLite, cached in memory, and driven by cron
//! triggers. Each run's result lands in a bounded per-job history and
//! is fanned out to websocket subscribers.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod websocket;

pub use config::Config;
pub use error::{ErrorCode, MeteoError, Result};
