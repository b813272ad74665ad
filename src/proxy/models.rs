//! Proxy data models

use crate::cache::ProxyKey;
use crate::config::Conf;
use crate::error::{LabError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Fallback used when a proxy carries no name or subscription
pub const UNKNOWN: &str = "unknown";

/// Attribute holding the subscription a proxy came from
pub const SUB_NAME_ATTR: &str = "_subName";

/// Attribute holding `"<display name>:<order>"` for a subscription
pub const SUB_DISPLAY_NAME_ATTR: &str = "_subDisplayName";

/// One raw proxy definition.
///
/// The attribute map is kept as submitted so it can be cached, re-dialed by
/// cron runs and returned to the caller with extra display attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyRecord(Map<String, Value>);

impl ProxyRecord {
    pub fn new(attrs: Map<String, Value>) -> Self {
        Self(attrs)
    }

    pub fn attrs(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn name(&self) -> &str {
        self.get_str("name").unwrap_or(UNKNOWN)
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.insert("name", name.into());
    }

    pub fn sub_name(&self) -> &str {
        self.get_str(SUB_NAME_ATTR).unwrap_or(UNKNOWN)
    }

    pub fn sub_display_name(&self) -> Option<&str> {
        self.get_str(SUB_DISPLAY_NAME_ATTR)
    }

    /// Protocol name, lower-cased (`http`, `socks5`, `vmess`, ...)
    pub fn proxy_type(&self) -> String {
        self.get_str("type").unwrap_or_default().to_lowercase()
    }

    pub fn server(&self) -> Option<&str> {
        self.get_str("server").filter(|s| !s.is_empty())
    }

    /// Port given either as a number or as a numeric string.
    pub fn port(&self) -> Option<u16> {
        match self.0.get("port")? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.get_str("username").filter(|s| !s.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.get_str("password").filter(|s| !s.is_empty())
    }

    /// Copies `sni` into `servername` when only the former is set.
    pub fn normalize_sni(&mut self) {
        if !self.0.get("servername").map_or(true, Value::is_null) {
            return;
        }
        let sni = self.get_str("sni").filter(|s| !s.is_empty()).map(str::to_string);
        if let Some(sni) = sni {
            self.insert("servername", sni);
        }
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.server(), self.port()) {
            (Some(server), Some(port)) => {
                write!(f, "{} ({}://{}:{})", self.name(), self.proxy_type(), server, port)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, rename = "_collection")]
    pub collection: Collection,
}

/// Caller context sent by the script form of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptContext {
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Deserialize)]
struct RawArgs {
    #[serde(default)]
    conf: Option<Conf>,
    #[serde(default)]
    proxies: Option<Vec<ProxyRecord>>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    context: Option<ScriptContext>,
    #[serde(default)]
    args: Option<Vec<Value>>,
}

/// One batch request: configuration, proxies and the requesting platform.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub conf: Conf,
    pub proxies: Vec<ProxyRecord>,
    /// `JSON` forces a background refresh of every tester
    pub platform: String,
    pub context: ScriptContext,
}

impl Args {
    /// Parses either `{conf, proxies, platform}` or the script form
    /// `{conf, args: [proxies, platform, context]}`.
    ///
    /// Malformed positional `args` entries are ignored. A missing `conf.id`
    /// falls back to the collection name; both empty is an error.
    pub fn from_json(input: &str) -> Result<Self> {
        let raw: RawArgs = serde_json::from_str(input)
            .map_err(|e| LabError::Config(format!("invalid request body: {e}")))?;

        let mut args = Args {
            conf: raw.conf.unwrap_or_default(),
            proxies: raw.proxies.unwrap_or_default(),
            platform: raw.platform.unwrap_or_default(),
            context: raw.context.unwrap_or_default(),
        };

        if let Some(positional) = raw.args {
            let mut positional = positional.into_iter();
            if let Some(v) = positional.next() {
                if let Ok(proxies) = serde_json::from_value(v) {
                    args.proxies = proxies;
                }
            }
            if let Some(Value::String(platform)) = positional.next() {
                args.platform = platform;
            }
            if let Some(v) = positional.next() {
                if let Ok(context) = serde_json::from_value(v) {
                    args.context = context;
                }
            }
        }

        if args.conf.id.is_empty() {
            args.conf.id = args.context.source.collection.name.clone();
            if args.conf.id.is_empty() {
                return Err(LabError::Config(
                    "conf.id and collection name are both empty".to_string(),
                ));
            }
        }
        args.conf.resolve_icons();
        for proxy in &mut args.proxies {
            proxy.normalize_sni();
        }
        Ok(args)
    }

    pub fn proxy_key(&self, proxy: &ProxyRecord) -> ProxyKey {
        ProxyKey::new(&self.conf.id, proxy.sub_name(), proxy.name())
    }

    pub fn forces_refresh(&self) -> bool {
        self.platform == "JSON"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> ProxyRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_record_accessors() {
        let proxy = record(json!({
            "name": "HK 01",
            "type": "SOCKS5",
            "server": "10.0.0.1",
            "port": "1080",
            "_subName": "alpha",
        }));
        assert_eq!(proxy.name(), "HK 01");
        assert_eq!(proxy.proxy_type(), "socks5");
        assert_eq!(proxy.port(), Some(1080));
        assert_eq!(proxy.sub_name(), "alpha");
        assert!(proxy.username().is_none());
        assert_eq!(proxy.to_string(), "HK 01 (socks5://10.0.0.1:1080)");
    }

    #[test]
    fn test_record_defaults() {
        let proxy = record(json!({"port": 70000}));
        assert_eq!(proxy.name(), UNKNOWN);
        assert_eq!(proxy.sub_name(), UNKNOWN);
        assert_eq!(proxy.port(), None);
    }

    #[test]
    fn test_sni_copied_to_servername() {
        let mut proxy = record(json!({"name": "a", "sni": "example.com"}));
        proxy.normalize_sni();
        assert_eq!(proxy.get_str("servername"), Some("example.com"));

        let mut proxy = record(json!({"name": "a", "sni": "x.com", "servername": "y.com"}));
        proxy.normalize_sni();
        assert_eq!(proxy.get_str("servername"), Some("y.com"));
    }

    #[test]
    fn test_args_direct_form() {
        let args = Args::from_json(
            r#"{"conf": {"id": "c1"}, "proxies": [{"name": "a", "_subName": "s"}], "platform": "JSON"}"#,
        )
        .unwrap();
        assert_eq!(args.conf.id, "c1");
        assert_eq!(args.proxies.len(), 1);
        assert!(args.forces_refresh());
        assert_eq!(args.proxy_key(&args.proxies[0]), ProxyKey::new("c1", "s", "a"));
        assert_eq!(args.conf.purity_icons().len(), 6);
    }

    #[test]
    fn test_args_script_form_with_collection_fallback() {
        let args = Args::from_json(
            r#"{
                "args": [
                    [{"name": "a"}, {"name": "b"}],
                    "ClashMeta",
                    {"source": {"_collection": {"name": "merged"}}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(args.conf.id, "merged");
        assert_eq!(args.proxies.len(), 2);
        assert_eq!(args.platform, "ClashMeta");
        assert!(!args.forces_refresh());
    }

    #[test]
    fn test_args_without_any_id_is_rejected() {
        let err = Args::from_json(r#"{"proxies": []}"#).unwrap_err();
        assert!(matches!(err, LabError::Config(_)));
    }
}
