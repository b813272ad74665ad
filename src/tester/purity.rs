//! Exit IP purity tester.

use crate::config::Conf;
use crate::error::Result;
use crate::proxy::checker::Dialer;
use crate::proxy::models::ProxyRecord;
use crate::purity::{exit_ip, merge, DetectorSet, PurityResult};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Timeout of each detector call. Detectors are queried directly, not
/// through the proxy under test.
const DETECTOR_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PurityTester {
    detectors: DetectorSet,
    client: Client,
    debug: bool,
}

impl PurityTester {
    pub fn new(detectors: DetectorSet, debug: bool) -> Result<Self> {
        let client = Client::builder().timeout(DETECTOR_TIMEOUT).build()?;
        Ok(Self {
            detectors,
            client,
            debug,
        })
    }

    pub fn detectors(&self) -> &DetectorSet {
        &self.detectors
    }

    pub async fn run_test(
        &self,
        proxy: &ProxyRecord,
        conf: &Conf,
        dialer: &dyn Dialer,
    ) -> Result<PurityResult> {
        let ip = exit_ip(dialer, proxy).await?;
        debug!(proxy = %proxy.name(), ip = %ip, "exit IP resolved");
        let evidence = self.detectors.detect_all(&self.client, &ip).await;
        let mut result = merge(conf, &evidence, self.debug)?;
        if result.ip.is_none() {
            result.ip = Some(ip);
        }
        Ok(result)
    }
}
