//! Download throughput tester.

use crate::config::Conf;
use crate::error::{LabError, Result};
use crate::proxy::checker::Dialer;
use crate::proxy::models::ProxyRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

const MB: f64 = 1024.0 * 1024.0;

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedResult {
    /// Human readable bytes per second, e.g. `2.1MB`
    pub speed: String,
    pub speed_mbps: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedTester;

impl SpeedTester {
    pub async fn run_test(
        &self,
        proxy: &ProxyRecord,
        conf: &Conf,
        dialer: &dyn Dialer,
    ) -> Result<SpeedResult> {
        let start = Instant::now();
        let received = dialer
            .download(
                proxy,
                &conf.speed_test_url,
                conf.download_limit(),
                conf.download_timeout(),
            )
            .await?;
        let elapsed = start.elapsed().as_secs_f64().max(0.001);
        if received == 0 {
            return Err(LabError::Speed(format!("{}: no data received", proxy.name())));
        }
        debug!(proxy = %proxy.name(), received, elapsed, "download finished");
        Ok(measure(received, elapsed))
    }
}

/// Throughput for `bytes` received over `secs` seconds.
pub fn measure(bytes: u64, secs: f64) -> SpeedResult {
    let per_sec = bytes as f64 / secs;
    SpeedResult {
        speed: human_bytes(per_sec),
        speed_mbps: (per_sec / MB) as i64 * 8,
        last_updated: Utc::now(),
    }
}

/// Formats a byte count with binary units: `512B`, `672KB`, `2.1MB`.
pub fn human_bytes(bytes: f64) -> String {
    if bytes < 1024.0 {
        return format!("{}B", bytes.max(0.0) as u64);
    }
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value.fract() == 0.0 {
        format!("{:.0}{}", value, UNITS[unit])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}
