//! Latency tester.

use crate::error::{LabError, Result};
use crate::proxy::checker::{CheckerConfig, Dialer};
use crate::proxy::models::ProxyRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayResult {
    /// Round-trip time in milliseconds
    pub delay: u16,
    pub last_updated: DateTime<Utc>,
}

/// Re-measures latency from cron runs, using the same check as batches.
#[derive(Debug, Clone, Default)]
pub struct DelayTester {
    config: CheckerConfig,
}

impl DelayTester {
    pub fn new(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub async fn run_test(&self, proxy: &ProxyRecord, dialer: &dyn Dialer) -> Result<DelayResult> {
        match dialer
            .url_test(proxy, &self.config.test_url, self.config.timeout)
            .await
        {
            Ok(delay) => Ok(DelayResult {
                delay,
                last_updated: Utc::now(),
            }),
            Err(failure) => {
                let message = failure.message().to_string();
                Err(failure
                    .into_error(proxy.name())
                    .unwrap_or_else(|| LabError::Node {
                        node: proxy.name().to_string(),
                        message: format!("unreachable: {message}"),
                    }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::checker::DelayFailure;
    use crate::testing::{named, ScriptedDialer};

    #[tokio::test]
    async fn test_delay_success_and_failures() {
        let dialer = ScriptedDialer::new()
            .with_delay("fast", Ok(42))
            .with_delay("tls", Err(DelayFailure::Tls("bad record".into())))
            .with_delay("gone", Err(DelayFailure::Unreachable("dns".into())));
        let tester = DelayTester::default();

        let result = tester.run_test(&named("fast", "s"), &dialer).await.unwrap();
        assert_eq!(result.delay, 42);

        let err = tester.run_test(&named("tls", "s"), &dialer).await.unwrap_err();
        assert!(matches!(err, LabError::Tls { node } if node == "tls"));

        // a cron rerun still reports unreachable nodes so the item is logged
        let err = tester.run_test(&named("gone", "s"), &dialer).await.unwrap_err();
        assert_eq!(err.to_string(), "gone: unreachable: dns");
    }
}
