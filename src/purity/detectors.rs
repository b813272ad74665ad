//! IP-intelligence providers.
//!
//! Each detector maps one provider's response into an [`IpInfo`]. Unknown
//! attributes stay `None`; only transport or API failures are errors.

use crate::config::EnvConfig;
use crate::error::{LabError, Result};
use crate::purity::geo::MmdbDetector;
use crate::purity::types::{non_empty, IpInfo, RiskFactors, UsageType};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Detectors queried at once for one IP
pub const DETECTOR_CONCURRENCY: usize = 2;

#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(&self, client: &Client, ip: &str) -> Result<IpInfo>;
}

/// Round-robin over a comma-separated list of API keys.
#[derive(Debug)]
pub struct ApiKey {
    keys: Vec<String>,
    next: AtomicUsize,
}

impl ApiKey {
    pub fn new(list: &str) -> Self {
        Self {
            keys: list
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.keys.len();
        Some(&self.keys[index])
    }

    fn require(&self, detector: &str) -> Result<&str> {
        self.get().ok_or_else(|| LabError::Detector {
            detector: detector.to_string(),
            message: "no API key configured".to_string(),
        })
    }
}

fn detector_error(detector: &str, message: impl ToString) -> LabError {
    LabError::Detector {
        detector: detector.to_string(),
        message: message.to_string(),
    }
}

async fn fetch_json<T: DeserializeOwned>(
    detector: &str,
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| detector_error(detector, format!("request failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(detector_error(detector, format!("unexpected status {status}")));
    }
    response
        .json()
        .await
        .map_err(|e| detector_error(detector, format!("invalid response: {e}")))
}

/// ipinfo.io: identity only, its anonymity flags need a paid plan.
pub struct IpInfoDetector;

#[derive(Deserialize)]
struct IpInfoResponse {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    country: String,
}

#[async_trait]
impl Detector for IpInfoDetector {
    fn name(&self) -> &'static str {
        "IPInfo"
    }

    async fn detect(&self, client: &Client, ip: &str) -> Result<IpInfo> {
        let url = format!("https://ipinfo.io/{ip}/json");
        let resp: IpInfoResponse = fetch_json(self.name(), client.get(url)).await?;
        Ok(IpInfo {
            ip: non_empty(resp.ip),
            country: non_empty(resp.country),
            region: non_empty(resp.region),
            city: non_empty(resp.city),
            ..IpInfo::new(self.name())
        })
    }
}

/// ip-api.com: identity plus proxy and hosting flags.
pub struct IpApiDetector;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    country_code: String,
    #[serde(default)]
    region_name: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    proxy: bool,
    #[serde(default)]
    hosting: bool,
    #[serde(default)]
    query: String,
}

#[async_trait]
impl Detector for IpApiDetector {
    fn name(&self) -> &'static str {
        "IPApi"
    }

    async fn detect(&self, client: &Client, ip: &str) -> Result<IpInfo> {
        let url = format!(
            "http://ip-api.com/json/{ip}?fields=status,message,countryCode,regionName,city,proxy,hosting,query"
        );
        let resp: IpApiResponse = fetch_json(self.name(), client.get(url)).await?;
        if resp.status != "success" {
            return Err(detector_error(self.name(), format!("{}: {}", resp.status, resp.message)));
        }
        Ok(IpInfo {
            ip: non_empty(resp.query),
            country: non_empty(resp.country_code),
            region: non_empty(resp.region_name),
            city: non_empty(resp.city),
            risk_factors: RiskFactors {
                is_proxy: Some(resp.proxy),
                is_server: Some(resp.hosting),
                ..Default::default()
            },
            ..IpInfo::new(self.name())
        })
    }
}

/// IPQualityScore: explicit fraud score and connection type.
pub struct IpQualityDetector {
    key: ApiKey,
}

impl IpQualityDetector {
    pub fn new(key: ApiKey) -> Self {
        Self { key }
    }
}

#[derive(Deserialize)]
struct IpQualityResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    fraud_score: i64,
    #[serde(default)]
    country_code: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    proxy: bool,
    #[serde(default)]
    vpn: bool,
    #[serde(default)]
    tor: bool,
    #[serde(default)]
    active_vpn: bool,
    #[serde(default)]
    active_tor: bool,
    #[serde(default)]
    recent_abuse: bool,
    #[serde(default)]
    bot_status: bool,
    #[serde(default)]
    connection_type: String,
}

fn ipquality_usage(connection_type: &str) -> UsageType {
    match connection_type {
        "Residential" => UsageType::Residential,
        "Corporate" | "Business" | "Data Center" | "Datacenter" => UsageType::Datacenter,
        _ => UsageType::Other,
    }
}

#[async_trait]
impl Detector for IpQualityDetector {
    fn name(&self) -> &'static str {
        "IPQuality"
    }

    async fn detect(&self, client: &Client, ip: &str) -> Result<IpInfo> {
        let key = self.key.require(self.name())?;
        let url = format!("https://ipqualityscore.com/api/json/ip/{key}/{ip}");
        let resp: IpQualityResponse = fetch_json(self.name(), client.get(url)).await?;
        if !resp.success {
            return Err(detector_error(self.name(), resp.message));
        }
        Ok(IpInfo {
            ip: non_empty(ip),
            country: non_empty(resp.country_code),
            region: non_empty(resp.region),
            city: non_empty(resp.city),
            risk_score: Some(resp.fraud_score),
            risk_factors: RiskFactors {
                is_proxy: Some(resp.proxy),
                is_vpn: Some(resp.vpn || resp.active_vpn),
                is_tor: Some(resp.tor || resp.active_tor),
                is_bot: Some(resp.bot_status),
                is_abuse: Some(resp.recent_abuse),
                is_server: None,
            },
            usage_type: Some(ipquality_usage(&resp.connection_type)),
            ..IpInfo::new(self.name())
        })
    }
}

/// AbuseIPDB: abuse confidence score and usage classification.
pub struct AbuseIpDbDetector {
    key: ApiKey,
}

impl AbuseIpDbDetector {
    pub fn new(key: ApiKey) -> Self {
        Self { key }
    }
}

#[derive(Deserialize)]
struct AbuseIpDbResponse {
    data: AbuseIpDbData,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbuseIpDbData {
    #[serde(default)]
    ip_address: String,
    #[serde(default)]
    abuse_confidence_score: i64,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    usage_type: Option<String>,
    #[serde(default)]
    is_tor: bool,
}

/// Usage type plus the server and bot flags it implies.
fn abuseipdb_usage(usage: &str) -> (UsageType, Option<bool>, Option<bool>) {
    match usage {
        "Data Center/Web Hosting/Transit"
        | "Hosting"
        | "Content Delivery Network"
        | "Corporate"
        | "Business"
        | "Education"
        | "University"
        | "Government" => (UsageType::Datacenter, Some(true), None),
        "Fixed Line ISP" | "Consumer ISP" => (UsageType::Residential, None, None),
        "Search Engine Spider" | "Search Engine" => (UsageType::Other, None, Some(true)),
        _ => (UsageType::Other, None, None),
    }
}

#[async_trait]
impl Detector for AbuseIpDbDetector {
    fn name(&self) -> &'static str {
        "AbuseIPDB"
    }

    async fn detect(&self, client: &Client, ip: &str) -> Result<IpInfo> {
        let key = self.key.require(self.name())?;
        let request = client
            .get("https://api.abuseipdb.com/api/v2/check")
            .query(&[("ipAddress", ip), ("maxAgeInDays", "90"), ("verbose", "true")])
            .header("Key", key)
            .header("Accept", "application/json");
        let resp: AbuseIpDbResponse = fetch_json(self.name(), request).await?;
        let data = resp.data;
        let (usage, is_server, is_bot) = abuseipdb_usage(data.usage_type.as_deref().unwrap_or(""));
        Ok(IpInfo {
            ip: non_empty(data.ip_address),
            country: data.country_code.and_then(non_empty),
            risk_score: Some(data.abuse_confidence_score),
            risk_factors: RiskFactors {
                is_abuse: Some(data.abuse_confidence_score > 0),
                is_tor: Some(data.is_tor),
                is_server,
                is_bot,
                ..Default::default()
            },
            usage_type: Some(usage),
            ..IpInfo::new(self.name())
        })
    }
}

/// ipregistry.co: security flags and connection type.
pub struct IpRegistryDetector {
    key: ApiKey,
}

impl IpRegistryDetector {
    pub fn new(key: ApiKey) -> Self {
        Self { key }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpRegistryResponse {
    ip: String,
    company: IpRegistryType,
    connection: IpRegistryType,
    location: IpRegistryLocation,
    security: IpRegistrySecurity,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpRegistryType {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpRegistryLocation {
    country: IpRegistryCode,
    region: IpRegistryName,
    city: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpRegistryCode {
    code: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpRegistryName {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpRegistrySecurity {
    is_abuser: bool,
    is_attacker: bool,
    is_cloud_provider: bool,
    is_proxy: bool,
    is_tor: bool,
    is_tor_exit: bool,
    is_vpn: bool,
    is_anonymous: bool,
    is_threat: bool,
}

fn ipregistry_usage(resp: &IpRegistryResponse) -> UsageType {
    let sec = &resp.security;
    if sec.is_proxy || sec.is_vpn || sec.is_tor {
        return UsageType::Other;
    }
    if sec.is_cloud_provider {
        return UsageType::Datacenter;
    }
    match resp.connection.kind.as_str() {
        "isp" | "hosting" if resp.company.kind == "business" => UsageType::Datacenter,
        "isp" | "hosting" => UsageType::Residential,
        "business" => UsageType::Datacenter,
        _ => UsageType::Other,
    }
}

#[async_trait]
impl Detector for IpRegistryDetector {
    fn name(&self) -> &'static str {
        "IPRegistry"
    }

    async fn detect(&self, client: &Client, ip: &str) -> Result<IpInfo> {
        let key = self.key.require(self.name())?;
        let request = client
            .get(format!("https://api.ipregistry.co/{ip}"))
            .query(&[("key", key)]);
        let resp: IpRegistryResponse = fetch_json(self.name(), request).await?;
        let sec = &resp.security;
        let risk_factors = RiskFactors {
            is_proxy: Some(sec.is_proxy || sec.is_anonymous),
            is_tor: Some(sec.is_tor || sec.is_tor_exit),
            is_vpn: Some(sec.is_vpn),
            is_server: Some(sec.is_cloud_provider),
            is_abuse: Some(sec.is_abuser || sec.is_attacker || sec.is_threat),
            is_bot: Some(false),
        };
        let usage = ipregistry_usage(&resp);
        Ok(IpInfo {
            ip: non_empty(resp.ip),
            country: non_empty(resp.location.country.code),
            region: non_empty(resp.location.region.name),
            city: non_empty(resp.location.city),
            risk_factors,
            usage_type: Some(usage),
            ..IpInfo::new(self.name())
        })
    }
}

/// ipdata.co: threat flags and ASN type.
pub struct IpDataDetector {
    key: ApiKey,
}

impl IpDataDetector {
    pub fn new(key: ApiKey) -> Self {
        Self { key }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpDataResponse {
    ip: String,
    city: Option<String>,
    region: Option<String>,
    country_code: Option<String>,
    asn: IpDataAsn,
    threat: IpDataThreat,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpDataAsn {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IpDataThreat {
    is_tor: bool,
    is_proxy: bool,
    is_datacenter: bool,
    is_anonymous: bool,
    is_known_attacker: bool,
    is_known_abuser: bool,
    is_threat: bool,
}

fn ipdata_usage(is_datacenter: bool, asn_type: &str) -> UsageType {
    if is_datacenter {
        return UsageType::Datacenter;
    }
    match asn_type.to_lowercase().as_str() {
        "hosting" | "cdn" => UsageType::Datacenter,
        "isp" | "business" => UsageType::Residential,
        _ => UsageType::Other,
    }
}

#[async_trait]
impl Detector for IpDataDetector {
    fn name(&self) -> &'static str {
        "IPData"
    }

    async fn detect(&self, client: &Client, ip: &str) -> Result<IpInfo> {
        let key = self.key.require(self.name())?;
        let request = client
            .get(format!("https://api.ipdata.co/{ip}"))
            .query(&[("api-key", key)]);
        let resp: IpDataResponse = fetch_json(self.name(), request).await?;
        let threat = &resp.threat;
        Ok(IpInfo {
            ip: non_empty(resp.ip.clone()),
            country: resp.country_code.clone().and_then(non_empty),
            region: resp.region.clone().and_then(non_empty),
            city: resp.city.clone().and_then(non_empty),
            risk_factors: RiskFactors {
                is_tor: Some(threat.is_tor),
                is_proxy: Some(threat.is_proxy || threat.is_anonymous),
                is_server: Some(threat.is_datacenter),
                is_abuse: Some(
                    threat.is_known_attacker || threat.is_known_abuser || threat.is_threat,
                ),
                ..Default::default()
            },
            usage_type: Some(ipdata_usage(threat.is_datacenter, &resp.asn.kind)),
            ..IpInfo::new(self.name())
        })
    }
}

/// Ordered set of detectors consulted for every purity test.
#[derive(Clone, Default)]
pub struct DetectorSet {
    detectors: Vec<Arc<dyn Detector>>,
}

impl DetectorSet {
    pub fn new(detectors: Vec<Arc<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// Keyless detectors first, then one per configured API key, then the
    /// offline database when a path is set.
    pub fn from_env(env: &EnvConfig) -> Result<Self> {
        let mut detectors: Vec<Arc<dyn Detector>> =
            vec![Arc::new(IpInfoDetector), Arc::new(IpApiDetector)];
        if let Some(keys) = &env.ipquality_api_key {
            detectors.push(Arc::new(IpQualityDetector::new(ApiKey::new(keys))));
        }
        if let Some(keys) = &env.abuseipdb_api_key {
            detectors.push(Arc::new(AbuseIpDbDetector::new(ApiKey::new(keys))));
        }
        if let Some(keys) = &env.ipregistry_api_key {
            detectors.push(Arc::new(IpRegistryDetector::new(ApiKey::new(keys))));
        }
        if let Some(keys) = &env.ipdata_api_key {
            detectors.push(Arc::new(IpDataDetector::new(ApiKey::new(keys))));
        }
        if let Some(path) = &env.mmdb_path {
            detectors.push(Arc::new(MmdbDetector::from_path(path)?));
        }
        Ok(Self { detectors })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Queries every detector, two at a time, keeping detector order.
    /// Failed lookups come back as records with `error` set.
    pub async fn detect_all(&self, client: &Client, ip: &str) -> Vec<IpInfo> {
        let lookups: Vec<BoxFuture<'static, IpInfo>> = self
            .detectors
            .iter()
            .map(|detector| lookup(Arc::clone(detector), client.clone(), ip.to_string()).boxed())
            .collect();
        stream::iter(lookups)
            .buffered(DETECTOR_CONCURRENCY)
            .collect()
            .await
    }
}

async fn lookup(detector: Arc<dyn Detector>, client: Client, ip: String) -> IpInfo {
    match detector.detect(&client, &ip).await {
        Ok(mut info) => {
            info.detector = detector.name().to_string();
            info
        }
        Err(err) => {
            warn!(detector = detector.name(), ip = %ip, error = %err, "detector failed");
            IpInfo::failed(detector.name(), err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, Option<&'static str>);

    #[async_trait]
    impl Detector for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn detect(&self, _client: &Client, ip: &str) -> Result<IpInfo> {
            match self.1 {
                Some(country) => Ok(IpInfo {
                    ip: Some(ip.to_string()),
                    country: Some(country.to_string()),
                    ..IpInfo::default()
                }),
                None => Err(detector_error(self.0, "quota exceeded")),
            }
        }
    }

    #[test]
    fn test_api_key_rotation() {
        let key = ApiKey::new("a, b ,,c");
        assert_eq!(key.get(), Some("a"));
        assert_eq!(key.get(), Some("b"));
        assert_eq!(key.get(), Some("c"));
        assert_eq!(key.get(), Some("a"));
        assert_eq!(ApiKey::new("").get(), None);
        assert_eq!(ApiKey::new("solo").get(), Some("solo"));
    }

    #[test]
    fn test_usage_mappings() {
        assert_eq!(ipquality_usage("Residential"), UsageType::Residential);
        assert_eq!(ipquality_usage("Data Center"), UsageType::Datacenter);
        assert_eq!(ipquality_usage("Mobile"), UsageType::Other);

        assert_eq!(
            abuseipdb_usage("Data Center/Web Hosting/Transit"),
            (UsageType::Datacenter, Some(true), None)
        );
        assert_eq!(abuseipdb_usage("Consumer ISP").0, UsageType::Residential);
        assert_eq!(abuseipdb_usage("Search Engine Spider").2, Some(true));

        assert_eq!(ipdata_usage(true, "isp"), UsageType::Datacenter);
        assert_eq!(ipdata_usage(false, "ISP"), UsageType::Residential);
        assert_eq!(ipdata_usage(false, "edu"), UsageType::Other);
    }

    #[test]
    fn test_ipregistry_usage() {
        let mut resp = IpRegistryResponse::default();
        resp.connection.kind = "isp".into();
        assert_eq!(ipregistry_usage(&resp), UsageType::Residential);
        resp.company.kind = "business".into();
        assert_eq!(ipregistry_usage(&resp), UsageType::Datacenter);
        resp.security.is_vpn = true;
        assert_eq!(ipregistry_usage(&resp), UsageType::Other);
    }

    #[test]
    fn test_provider_payloads_decode() {
        let resp: IpApiResponse = serde_json::from_str(
            r#"{"status":"success","countryCode":"HK","regionName":"HK Region","city":"Hong Kong","proxy":false,"hosting":true,"query":"203.0.113.88"}"#,
        )
        .unwrap();
        assert!(resp.hosting);
        assert_eq!(resp.country_code, "HK");

        let resp: AbuseIpDbResponse = serde_json::from_str(
            r#"{"data":{"ipAddress":"203.0.113.88","abuseConfidenceScore":12,"countryCode":null,"usageType":"Fixed Line ISP","isTor":false}}"#,
        )
        .unwrap();
        assert_eq!(resp.data.abuse_confidence_score, 12);
        assert!(resp.data.country_code.is_none());
    }

    #[tokio::test]
    async fn test_detect_all_keeps_order_and_failures() {
        let set = DetectorSet::new(vec![
            Arc::new(Fixed("first", Some("JP"))),
            Arc::new(Fixed("broken", None)),
            Arc::new(Fixed("third", Some("US"))),
        ]);
        let client = Client::new();
        let results = set.detect_all(&client, "198.51.100.7").await;

        let names: Vec<_> = results.iter().map(|r| r.detector.as_str()).collect();
        assert_eq!(names, vec!["first", "broken", "third"]);
        assert!(results[1].error.is_some());
        assert_eq!(results[0].country.as_deref(), Some("JP"));
        assert_eq!(set.names(), vec!["first", "broken", "third"]);
    }
}
