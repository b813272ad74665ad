//! Evidence records and the merged purity verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Hosting context of an exit IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageType {
    Residential,
    Datacenter,
    Other,
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UsageType::Residential => "Residential",
            UsageType::Datacenter => "Datacenter",
            UsageType::Other => "Other",
        };
        f.write_str(s)
    }
}

/// Boolean risk signals; `None` means no opinion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub is_proxy: Option<bool>,
    pub is_tor: Option<bool>,
    pub is_vpn: Option<bool>,
    pub is_server: Option<bool>,
    pub is_abuse: Option<bool>,
    pub is_bot: Option<bool>,
}

impl RiskFactors {
    pub fn all_absent(&self) -> bool {
        self.as_array().iter().all(Option::is_none)
    }

    /// Factors in a fixed order: proxy, Tor, VPN, server, abuse, bot.
    pub fn as_array(&self) -> [Option<bool>; 6] {
        [
            self.is_proxy,
            self.is_tor,
            self.is_vpn,
            self.is_server,
            self.is_abuse,
            self.is_bot,
        ]
    }

    pub fn from_array(values: [Option<bool>; 6]) -> Self {
        let [is_proxy, is_tor, is_vpn, is_server, is_abuse, is_bot] = values;
        Self {
            is_proxy,
            is_tor,
            is_vpn,
            is_server,
            is_abuse,
            is_bot,
        }
    }

    /// Heuristic 0..=100 score from the weighted factors.
    pub fn heuristic_score(&self) -> u8 {
        let weight = |flag: Option<bool>, w: u32| if flag == Some(true) { w } else { 0 };
        let score = weight(self.is_proxy, 30)
            + weight(self.is_vpn, 25)
            + weight(self.is_tor, 40)
            + weight(self.is_server, 15);
        score.min(100) as u8
    }
}

/// One detector's observation of an IP. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpInfo {
    pub detector: String,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub risk_score: Option<i64>,
    pub risk_factors: RiskFactors,
    pub usage_type: Option<UsageType>,
    /// Set when the lookup itself failed
    pub error: Option<String>,
}

impl IpInfo {
    pub fn new(detector: &str) -> Self {
        Self {
            detector: detector.to_string(),
            ..Default::default()
        }
    }

    pub fn failed(detector: &str, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(detector)
        }
    }

    pub fn is_usable(&self) -> bool {
        self.error.as_deref().map_or(true, str::is_empty)
    }
}

/// Merged verdict for one exit IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurityResult {
    pub ip: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    /// 0..=100, `None` when no detector offered a score or factors
    pub risk_score: Option<u8>,
    pub usage_type: Option<UsageType>,
    pub risk_factors: RiskFactors,
    pub country_flag: String,
    pub purity_icon: String,
    pub type_icon: String,
    pub last_updated: DateTime<Utc>,
    /// Per-detector evidence, kept only in debug mode
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence: BTreeMap<String, IpInfo>,
}

/// Empty strings from providers mean "unknown".
pub(crate) fn non_empty(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_score_clips() {
        let all = RiskFactors::from_array([Some(true); 6]);
        assert_eq!(all.heuristic_score(), 100);

        let vpn = RiskFactors {
            is_vpn: Some(true),
            is_proxy: Some(false),
            ..Default::default()
        };
        assert_eq!(vpn.heuristic_score(), 25);
        assert!(!vpn.all_absent());
        assert!(RiskFactors::default().all_absent());
    }

    #[test]
    fn test_usable() {
        assert!(IpInfo::new("a").is_usable());
        assert!(!IpInfo::failed("a", "boom").is_usable());
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("  "), None);
        assert_eq!(non_empty(" HK "), Some("HK".to_string()));
    }
}
