//! One proxy and its test state during a batch.

use crate::beautify::subscription::sub_name_and_num;
use crate::cache::TesterType;
use crate::proxy::models::ProxyRecord;
use crate::purity::PurityResult;
use crate::tester::{SpeedResult, TestResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Attribute keeping the name a node had before renaming
pub const OLD_NAME_ATTR: &str = "_lab_old_name";

/// Shown in place of a speed that was never measured
pub const NO_SPEED: &str = "-1KB";

static RATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\[(\d*\.?\d+)x\]|(\d*\.?\d+)x)").expect("valid regex"));

/// Traffic multiplier tag of a node name, e.g. `[0.5x]`.
///
/// A bracketed rate anywhere in the name wins over a bare one; otherwise
/// the first bare rate is used. A rate of 1 yields no tag.
pub fn rate_tag(name: &str) -> String {
    let mut bare = None;
    let mut bracketed = None;
    for caps in RATE_RE.captures_iter(name) {
        if let Some(m) = caps.get(1) {
            bracketed = Some(m.as_str());
            break;
        }
        if bare.is_none() {
            bare = caps.get(2).map(|m| m.as_str());
        }
    }
    match bracketed.or(bare).unwrap_or("") {
        "" | "1" | "1.0" => String::new(),
        rate => format!("[{rate}x]"),
    }
}

/// A proxy being tested. `subscription` names the owning
/// [`Subscription`](crate::beautify::Subscription).
#[derive(Debug, Clone)]
pub struct Node {
    pub record: ProxyRecord,
    /// Name as submitted
    pub name: String,
    pub subscription: String,
    pub sub_num: i64,
    pub delay: Option<u16>,
    pub speed: Option<SpeedResult>,
    pub purity: Option<PurityResult>,
}

impl Node {
    pub fn new(record: ProxyRecord) -> Self {
        let (subscription, sub_num) = sub_name_and_num(&record);
        Self {
            name: record.name().to_string(),
            record,
            subscription,
            sub_num,
            delay: None,
            speed: None,
            purity: None,
        }
    }

    /// Records a live delay measurement.
    pub fn set_delay(&mut self, delay: u16) {
        self.delay = Some(delay);
        self.record
            .insert(format!("{}_delay", TesterType::Delay), Value::from(delay));
    }

    /// Copies a cached result onto the node and its display attributes.
    /// Ordering keeps using the live delay of this batch.
    pub fn apply(&mut self, result: &TestResult, debug: bool) {
        for (key, value) in result.display_attrs(debug) {
            self.record.insert(key, value);
        }
        match result {
            TestResult::Delay(_) => {}
            TestResult::Speed(speed) => self.speed = Some(speed.clone()),
            TestResult::Purity(purity) => self.purity = Some(purity.clone()),
        }
    }

    /// Purity country code, when known.
    pub fn country(&self) -> Option<&str> {
        self.purity
            .as_ref()
            .and_then(|p| p.country.as_deref())
            .filter(|c| !c.is_empty())
    }

    /// Renames the node to
    /// `<flag><code>_<index><type><speed>[keywords]<rate><purity><sub>`.
    ///
    /// Nodes without a purity country keep their name.
    pub fn format(mut self, keywords: &[String], index: usize) -> ProxyRecord {
        let (Some(purity), Some(country)) = (self.purity.as_ref(), self.country()) else {
            return self.record;
        };

        let found: Vec<&str> = keywords
            .iter()
            .map(String::as_str)
            .filter(|k| !k.is_empty() && self.name.contains(k))
            .collect();
        let keywords = if found.is_empty() {
            String::new()
        } else {
            format!("[{}]", found.join("|"))
        };
        let speed = self.speed.as_ref().map_or(NO_SPEED, |s| s.speed.as_str());

        let name = format!(
            "{}{}_{}{}{}{}{}{}{}",
            purity.country_flag,
            country,
            index,
            purity.type_icon,
            speed,
            keywords,
            rate_tag(&self.name),
            purity.purity_icon,
            self.subscription,
        );
        self.record.insert(OLD_NAME_ATTR, self.name.clone());
        self.record.set_name(name);
        self.record
    }
}
