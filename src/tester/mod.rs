//! Testers run against cached proxies, plus their registry.
//!
//! The set of testers is closed: [`Tester`] dispatches on [`TesterType`].
//! Results are stored as [`TestResult`] and flattened into display
//! attributes named `<Tester>_<field>`.

pub mod delay;
pub mod purity;
pub mod speed;

pub use delay::{DelayResult, DelayTester};
pub use purity::PurityTester;
pub use speed::{human_bytes, SpeedResult, SpeedTester};

use crate::cache::TesterType;
use crate::config::{Conf, EnvConfig};
use crate::error::Result;
use crate::proxy::checker::{CheckerConfig, Dialer};
use crate::proxy::models::ProxyRecord;
use crate::purity::{DetectorSet, PurityResult};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Cached outcome of one tester for one proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TestResult {
    Delay(DelayResult),
    Speed(SpeedResult),
    Purity(PurityResult),
}

impl TestResult {
    pub fn tester_type(&self) -> TesterType {
        match self {
            TestResult::Delay(_) => TesterType::Delay,
            TestResult::Speed(_) => TesterType::Speed,
            TestResult::Purity(_) => TesterType::Purity,
        }
    }

    /// Fixed field list shown on a node. `debug` adds timestamps and the
    /// per-detector evidence.
    pub fn display_fields(&self, debug: bool) -> Vec<(&'static str, Value)> {
        let mut fields: Vec<(&'static str, Value)> = Vec::new();
        let last_updated = match self {
            TestResult::Delay(r) => {
                fields.push(("delay", r.delay.into()));
                r.last_updated
            }
            TestResult::Speed(r) => {
                fields.push(("speed", r.speed.clone().into()));
                fields.push(("speed_mbps", r.speed_mbps.into()));
                r.last_updated
            }
            TestResult::Purity(r) => {
                let optional = [
                    ("ip", r.ip.clone()),
                    ("country", r.country.clone()),
                    ("region", r.region.clone()),
                    ("city", r.city.clone()),
                    ("usage_type", r.usage_type.map(|u| u.to_string())),
                ];
                for (name, value) in optional {
                    if let Some(value) = value {
                        fields.push((name, value.into()));
                    }
                }
                if let Some(score) = r.risk_score {
                    fields.push(("risk_score", score.into()));
                }
                let factors = r.risk_factors;
                let flags = [
                    ("is_proxy", factors.is_proxy),
                    ("is_tor", factors.is_tor),
                    ("is_vpn", factors.is_vpn),
                    ("is_server", factors.is_server),
                    ("is_abuse", factors.is_abuse),
                    ("is_bot", factors.is_bot),
                ];
                for (name, flag) in flags {
                    if let Some(flag) = flag {
                        fields.push((name, flag.into()));
                    }
                }
                fields.push(("country_flag", r.country_flag.clone().into()));
                fields.push(("purity_icon", r.purity_icon.clone().into()));
                fields.push(("type_icon", r.type_icon.clone().into()));
                if debug && !r.evidence.is_empty() {
                    if let Ok(evidence) = serde_json::to_value(&r.evidence) {
                        fields.push(("evidence", evidence));
                    }
                }
                r.last_updated
            }
        };
        if debug {
            fields.push(("last_updated", last_updated.to_rfc3339().into()));
        }
        fields
    }

    /// Display fields with their `<Tester>_` prefix.
    pub fn display_attrs(&self, debug: bool) -> Vec<(String, Value)> {
        let prefix = self.tester_type();
        self.display_fields(debug)
            .into_iter()
            .map(|(field, value)| (format!("{prefix}_{field}"), value))
            .collect()
    }
}

#[derive(Clone)]
pub enum Tester {
    Delay(DelayTester),
    Speed(SpeedTester),
    Purity(PurityTester),
}

impl Tester {
    pub fn tester_type(&self) -> TesterType {
        match self {
            Tester::Delay(_) => TesterType::Delay,
            Tester::Speed(_) => TesterType::Speed,
            Tester::Purity(_) => TesterType::Purity,
        }
    }

    pub fn name(&self) -> &'static str {
        self.tester_type().as_str()
    }

    /// Cron expression driving this tester's refresh for `conf`.
    pub fn cron<'a>(&self, conf: &'a Conf) -> &'a str {
        match self {
            Tester::Delay(_) | Tester::Speed(_) => &conf.speed_cron,
            Tester::Purity(_) => &conf.purity_cron,
        }
    }

    /// Boxed so cron runs stay `Send` when spawned on the scheduler.
    pub fn run_test<'a>(
        &'a self,
        proxy: &'a ProxyRecord,
        conf: &'a Conf,
        dialer: &'a dyn Dialer,
    ) -> BoxFuture<'a, Result<TestResult>> {
        async move {
            Ok(match self {
                Tester::Delay(t) => TestResult::Delay(t.run_test(proxy, dialer).await?),
                Tester::Speed(t) => TestResult::Speed(t.run_test(proxy, conf, dialer).await?),
                Tester::Purity(t) => TestResult::Purity(t.run_test(proxy, conf, dialer).await?),
            })
        }
        .boxed()
    }
}

/// Enabled testers, in [`TesterType::ALL`] order.
#[derive(Clone, Default)]
pub struct TesterRegistry {
    testers: Vec<Tester>,
}

impl TesterRegistry {
    pub fn new(testers: Vec<Tester>) -> Self {
        Self { testers }
    }

    /// Builds every tester that passes the allow and deny lists.
    pub fn from_env(env: &EnvConfig) -> Result<Self> {
        let mut testers = Vec::new();
        for tester_type in TesterType::ALL {
            if !env.tester_enabled(tester_type.as_str()) {
                info!(tester = %tester_type, "tester disabled");
                continue;
            }
            let tester = match tester_type {
                TesterType::Delay => Tester::Delay(DelayTester::new(
                    CheckerConfig::new().with_test_url(env.delay_test_url.clone()),
                )),
                TesterType::Speed => Tester::Speed(SpeedTester),
                TesterType::Purity => {
                    let detectors = DetectorSet::from_env(env)?;
                    info!(detectors = ?detectors.names(), "purity detectors");
                    Tester::Purity(PurityTester::new(detectors, env.debug)?)
                }
            };
            testers.push(tester);
        }
        Ok(Self { testers })
    }

    pub fn get(&self, tester_type: TesterType) -> Option<&Tester> {
        self.testers.iter().find(|t| t.tester_type() == tester_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tester> {
        self.testers.iter()
    }

    pub fn len(&self) -> usize {
        self.testers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.testers.is_empty()
    }
}
