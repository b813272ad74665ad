//! Process and per-request configuration.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Default number of concurrent delay checks per batch pool
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Lifetime of every cached proxy definition and test result
pub const RESULT_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Pause between two proxies inside one cron run
pub const CRON_ITEM_DELAY: Duration = Duration::from_secs(1);

/// Cron runs log progress every this many proxies
pub const CRON_PROGRESS_INTERVAL: usize = 5;

pub const DEFAULT_DELAY_TEST_URL: &str = "https://www.gstatic.com/generate_204";
pub const DEFAULT_SPEED_TEST_URL: &str = "https://github.com/comfyanonymous/ComfyUI/releases/download/v0.3.57/ComfyUI_windows_portable_nvidia.7z";
pub const DEFAULT_PURITY_CRON: &str = "0 2 */3 * *";
pub const DEFAULT_SPEED_CRON: &str = "0 3 * * *";
pub const DEFAULT_PURITY_ICONS: &str = "🖤🩵💙💛🧡❤️";
pub const DEFAULT_TYPE_ICONS: &str = "🪨🏠🕋⚰️";

/// Process-wide settings read from `LAB_*` environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub data_dir: PathBuf,
    pub debug: bool,
    pub log_level: String,
    /// URL every delay check requests through the proxy
    pub delay_test_url: String,
    /// Upper-cased tester names; empty means every tester
    pub enable_tester: Vec<String>,
    pub disable_tester: Vec<String>,
    pub output_nodes_json: bool,
    pub concurrency: usize,
    pub mmdb_path: Option<PathBuf>,
    pub ipquality_api_key: Option<String>,
    pub abuseipdb_api_key: Option<String>,
    pub ipregistry_api_key: Option<String>,
    pub ipdata_api_key: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            debug: false,
            log_level: "info".to_string(),
            delay_test_url: DEFAULT_DELAY_TEST_URL.to_string(),
            enable_tester: Vec::new(),
            disable_tester: Vec::new(),
            output_nodes_json: true,
            concurrency: DEFAULT_CONCURRENCY,
            mmdb_path: None,
            ipquality_api_key: None,
            abuseipdb_api_key: None,
            ipregistry_api_key: None,
            ipdata_api_key: None,
        }
    }
}

impl EnvConfig {
    /// Creates an `EnvConfig` from environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: env::var("LAB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            debug: env_bool("LAB_DEBUG", defaults.debug),
            log_level: env::var("LAB_LOG_LEVEL").unwrap_or(defaults.log_level),
            delay_test_url: env::var("LAB_DELAY_TEST_URL").unwrap_or(defaults.delay_test_url),
            enable_tester: split_names(&env::var("LAB_ENABLE_TESTER").unwrap_or_default()),
            disable_tester: split_names(&env::var("LAB_DISABLE_TESTER").unwrap_or_default()),
            output_nodes_json: env_bool("LAB_OUTPUT_NODES_JSON", defaults.output_nodes_json),
            concurrency: env::var("LAB_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            mmdb_path: non_empty_var("LAB_MMDB_PATH").map(PathBuf::from),
            ipquality_api_key: non_empty_var("LAB_IPQUALITY_API_KEY"),
            abuseipdb_api_key: non_empty_var("LAB_ABUSEIPDB_API_KEY"),
            ipregistry_api_key: non_empty_var("LAB_IPREGISTRY_API_KEY"),
            ipdata_api_key: non_empty_var("LAB_IPDATA_API_KEY"),
        }
    }

    /// Path of the SQLite database backing the result cache.
    pub fn database_url(&self) -> String {
        format!("sqlite://{}", self.data_dir.join("proxy-lab.db").display())
    }

    /// Whether the tester called `name` passes the allow and deny lists.
    pub fn tester_enabled(&self, name: &str) -> bool {
        let name = name.to_uppercase();
        if !self.enable_tester.is_empty() && !self.enable_tester.contains(&name) {
            return false;
        }
        !self.disable_tester.contains(&name)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Splits a comma-separated, case-insensitive list of names.
pub fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Per-configuration settings sent with every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    pub id: String,
    pub no_beautify_nodes: bool,
    pub purity_cron: String,
    pub speed_cron: String,
    pub speed_test_url: String,
    /// Seconds allowed for one speed download
    pub download_timeout: u64,
    /// Download size cap in MB, 0 for unlimited
    pub download_mb: u64,
    pub purity_icon: String,
    pub type_icon: String,
    /// Words copied into renamed nodes when the original name contains them
    pub keywords: Vec<String>,

    #[serde(skip)]
    pub(crate) purity_icons: Vec<String>,
    #[serde(skip)]
    pub(crate) type_icons: Vec<String>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            id: String::new(),
            no_beautify_nodes: false,
            purity_cron: DEFAULT_PURITY_CRON.to_string(),
            speed_cron: DEFAULT_SPEED_CRON.to_string(),
            speed_test_url: DEFAULT_SPEED_TEST_URL.to_string(),
            download_timeout: 8,
            download_mb: 20,
            purity_icon: DEFAULT_PURITY_ICONS.to_string(),
            type_icon: DEFAULT_TYPE_ICONS.to_string(),
            keywords: Vec::new(),
            purity_icons: split_emoji(DEFAULT_PURITY_ICONS),
            type_icons: split_emoji(DEFAULT_TYPE_ICONS),
        }
    }
}

impl Conf {
    /// Splits the icon strings into glyphs, keeping the defaults when a
    /// custom set has the wrong length.
    pub fn resolve_icons(&mut self) {
        self.purity_icons = resolve_icon_set(&self.purity_icon, DEFAULT_PURITY_ICONS, "purity");
        self.type_icons = resolve_icon_set(&self.type_icon, DEFAULT_TYPE_ICONS, "type");
    }

    /// Six purity glyphs: unknown, then risk buckets from clean to dirty.
    pub fn purity_icons(&self) -> &[String] {
        &self.purity_icons
    }

    /// Four usage-type glyphs: unknown, residential, datacenter, other.
    pub fn type_icons(&self) -> &[String] {
        &self.type_icons
    }

    /// Narrow equality used by cron upserts: only the fields a test depends on.
    pub fn same_test_target(&self, other: &Conf) -> bool {
        self.id == other.id && self.speed_test_url == other.speed_test_url
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout.max(1))
    }

    /// Download cap in bytes, `None` when unlimited.
    pub fn download_limit(&self) -> Option<u64> {
        (self.download_mb > 0).then(|| self.download_mb * 1024 * 1024)
    }
}

fn resolve_icon_set(custom: &str, default: &str, kind: &str) -> Vec<String> {
    let expected = split_emoji(default);
    let icons = split_emoji(custom);
    if icons.len() == expected.len() {
        icons
    } else {
        warn!(
            kind,
            expected = expected.len(),
            got = icons.len(),
            "icon set length mismatch, using defaults"
        );
        expected
    }
}

/// Splits a string of emoji into user-visible glyphs (extended grapheme
/// clusters).
pub fn split_emoji(s: &str) -> Vec<String> {
    s.graphemes(true).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_default_icons() {
        let purity = split_emoji(DEFAULT_PURITY_ICONS);
        assert_eq!(purity.len(), 6);
        assert_eq!(purity[5], "❤️");

        let types = split_emoji(DEFAULT_TYPE_ICONS);
        assert_eq!(types, vec!["🪨", "🏠", "🕋", "⚰️"]);
    }

    #[test]
    fn test_split_flags_and_zwj() {
        assert_eq!(split_emoji("🇭🇰🇯🇵"), vec!["🇭🇰", "🇯🇵"]);
        assert_eq!(split_emoji("👩‍💻a"), vec!["👩‍💻", "a"]);
    }

    #[test]
    fn test_split_tag_sequence_flag() {
        let england = "\u{1F3F4}\u{E0067}\u{E0062}\u{E0065}\u{E006E}\u{E0067}\u{E007F}";
        let icons = format!("{england}🩵💙💛🧡❤️");
        let glyphs = split_emoji(&icons);
        assert_eq!(glyphs.len(), 6);
        assert_eq!(glyphs[0], england);

        let mut conf = Conf {
            purity_icon: icons,
            ..Conf::default()
        };
        conf.resolve_icons();
        assert_eq!(conf.purity_icons()[0], england);
    }

    #[test]
    fn test_conf_defaults_from_empty_json() {
        let mut conf: Conf = serde_json::from_str("{}").unwrap();
        conf.resolve_icons();
        assert_eq!(conf.purity_cron, DEFAULT_PURITY_CRON);
        assert_eq!(conf.download_mb, 20);
        assert_eq!(conf.purity_icons().len(), 6);
        assert_eq!(conf.type_icons().len(), 4);
    }

    #[test]
    fn test_bad_icon_set_falls_back() {
        let mut conf: Conf = serde_json::from_str(r#"{"type_icon": "🏠"}"#).unwrap();
        conf.resolve_icons();
        assert_eq!(conf.type_icons()[1], "🏠");
        assert_eq!(conf.type_icons().len(), 4);
    }

    #[test]
    fn test_same_test_target() {
        let a = Conf {
            id: "sub".to_string(),
            ..Default::default()
        };
        let mut b = a.clone();
        b.download_mb = 99;
        assert!(a.same_test_target(&b));
        b.speed_test_url = "http://example.com/file".to_string();
        assert!(!a.same_test_target(&b));
    }

    #[test]
    fn test_tester_allow_and_deny_lists() {
        let mut cfg = EnvConfig::default();
        assert!(cfg.tester_enabled("Speed"));

        cfg.disable_tester = split_names("speed, ");
        assert!(!cfg.tester_enabled("Speed"));
        assert!(cfg.tester_enabled("Purity"));

        cfg.disable_tester.clear();
        cfg.enable_tester = split_names("PURITY");
        assert!(cfg.tester_enabled("purity"));
        assert!(!cfg.tester_enabled("Delay"));
    }

    #[test]
    fn test_download_limit() {
        let mut conf = Conf::default();
        assert_eq!(conf.download_limit(), Some(20 * 1024 * 1024));
        conf.download_mb = 0;
        assert_eq!(conf.download_limit(), None);
    }
}
