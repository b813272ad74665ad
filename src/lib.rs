//! Proxy Lab - proxy delay, speed and IP purity testing
//!
//! Each batch checks every proxy live, attaches cached speed and purity
//! results, and hands cache misses to per-configuration cron jobs that
//! refresh them in the background. The enriched batch is then grouped,
//! ordered by country latency and renamed.

pub mod app;
pub mod beautify;
pub mod cache;
pub mod config;
pub mod cron;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod proxy;
pub mod purity;
pub mod tester;

#[cfg(test)]
pub(crate) mod testing;

pub use app::Lab;
pub use config::{Conf, EnvConfig};
pub use error::{LabError, Result};
pub use orchestrator::{BatchReport, RefreshTrigger, TestOrchestrator};
pub use proxy::models::{Args, ProxyRecord};
