//! Subscriptions and their announcement lines.

use crate::beautify::node::Node;
use crate::proxy::models::{ProxyRecord, UNKNOWN};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Marks the synthetic summary node of a subscription
pub const INFO_NODE_ATTR: &str = "_lab_info_node";

/// Order of subscriptions without a `name:number` display name
pub const UNNUMBERED: i64 = i64::MAX;

static TRAFFIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"剩余流量[:：]\s*([\d.]+)\s*(GB|MB|TB)?").expect("valid regex"));
static RESET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:距离下次重置剩余|重置).*?[:：]?\s*(\d+)\s*[天日]?").expect("valid regex")
});
static EXPIRE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:套餐)?到期[:：]?\s*([0-9]{4}-[0-9]{2}-[0-9]{2}|长期有效)").expect("valid regex")
});
static NOTICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(更新订阅|遇到问题|联系|公告|维护|重启网络|建议|error|错误|尝试|官网|发布页)")
        .expect("valid regex")
});

/// Name and ordering number of the subscription a record belongs to.
///
/// `_subDisplayName` in the form `name:number` gives both; otherwise the
/// display name or `_subName` is used and the subscription sorts last.
pub fn sub_name_and_num(record: &ProxyRecord) -> (String, i64) {
    if let Some(display) = record.sub_display_name() {
        if let Some((name, num)) = display.split_once(':') {
            if let Ok(num) = num.trim().parse() {
                return (name.to_string(), num);
            }
        }
        return (display.to_string(), UNNUMBERED);
    }
    let name = record.sub_name();
    let name = if name.is_empty() { UNKNOWN } else { name };
    (name.to_string(), UNNUMBERED)
}

/// What a node name says about its subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoLine {
    /// Remaining traffic, e.g. `123.45GB`
    Traffic(String),
    /// Days until the traffic resets
    Reset(String),
    /// Expiry date or `长期有效`
    Expire(String),
    Notice,
}

impl InfoLine {
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(caps) = TRAFFIC_RE.captures(name) {
            let value = &caps[1];
            let unit = caps.get(2).map_or("", |m| m.as_str());
            return Some(InfoLine::Traffic(format!("{value}{unit}")));
        }
        if let Some(caps) = RESET_RE.captures(name) {
            return Some(InfoLine::Reset(caps[1].to_string()));
        }
        if let Some(caps) = EXPIRE_RE.captures(name) {
            return Some(InfoLine::Expire(caps[1].to_string()));
        }
        NOTICE_RE.is_match(name).then_some(InfoLine::Notice)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub traffic: Option<String>,
    pub reset_days: Option<String>,
    pub expire: Option<String>,
}

impl SubscriptionInfo {
    /// `<sub>: 📦<traffic> ⏳<N>D 🗓️<MM/DD>`
    pub fn summary(&self, sub_name: &str) -> String {
        let traffic = self
            .traffic
            .as_deref()
            .map_or("📦❔".to_string(), |t| format!("📦{}", t.replace(' ', "")));
        let reset = match self.reset_days.as_deref() {
            Some(days) if days != "长期" && days != "无限" => format!("⏳{days}D"),
            _ => "⏳∞".to_string(),
        };
        let expire = match self.expire.as_deref() {
            None | Some("长期有效") => "🗓️∞".to_string(),
            Some(date) => match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                Ok(d) => format!("🗓️{}", d.format("%m/%d")),
                Err(_) => format!("🗓️{date}"),
            },
        };
        format!("{sub_name}: {traffic} {reset} {expire}")
    }
}

/// Nodes sharing one subscription name.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub name: String,
    pub num: i64,
    pub nodes: Vec<Node>,
    pub info: SubscriptionInfo,
    /// Announcement nodes removed from `nodes`
    pub info_lines: Vec<Node>,
}

impl Subscription {
    pub fn new(name: impl Into<String>, num: i64) -> Self {
        Self {
            name: name.into(),
            num,
            nodes: Vec::new(),
            info: SubscriptionInfo::default(),
            info_lines: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Moves announcement nodes out of `nodes` and returns the summary node.
    ///
    /// The summary is a copy of the first remaining node (or of the first
    /// announcement when nothing else is left), renamed and flagged with
    /// [`INFO_NODE_ATTR`]. `None` only for an empty subscription.
    pub fn extract_info_node(&mut self) -> Option<ProxyRecord> {
        let mut info = SubscriptionInfo::default();
        let (lines, nodes): (Vec<Node>, Vec<Node>) =
            std::mem::take(&mut self.nodes).into_iter().partition(|node| {
                match InfoLine::parse(&node.name) {
                    Some(InfoLine::Traffic(t)) => info.traffic = Some(t),
                    Some(InfoLine::Reset(d)) => info.reset_days = Some(d),
                    Some(InfoLine::Expire(e)) => info.expire = Some(e),
                    Some(InfoLine::Notice) => {}
                    None => return false,
                }
                true
            });
        self.nodes = nodes;
        self.info_lines = lines;
        self.info = info;

        let template = self.nodes.first().or_else(|| self.info_lines.first())?;
        let mut record = template.record.clone();
        record.set_name(self.info.summary(&self.name));
        record.insert(INFO_NODE_ATTR, Value::Bool(true));
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::proxy;
    use serde_json::json;

    fn node(name: &str) -> Node {
        Node::new(proxy(json!({"name": name, "_subName": "alpha", "type": "ss"})))
    }

    #[test]
    fn test_sub_name_and_num() {
        let rec = proxy(json!({"_subDisplayName": "Alpha:3", "_subName": "a"}));
        assert_eq!(sub_name_and_num(&rec), ("Alpha".to_string(), 3));

        let rec = proxy(json!({"_subDisplayName": "Beta", "_subName": "b"}));
        assert_eq!(sub_name_and_num(&rec), ("Beta".to_string(), UNNUMBERED));

        let rec = proxy(json!({"_subDisplayName": "Gamma:x"}));
        assert_eq!(sub_name_and_num(&rec), ("Gamma:x".to_string(), UNNUMBERED));

        let rec = proxy(json!({"_subName": "delta"}));
        assert_eq!(sub_name_and_num(&rec), ("delta".to_string(), UNNUMBERED));

        assert_eq!(sub_name_and_num(&proxy(json!({}))).0, UNKNOWN);
    }

    #[test]
    fn test_info_line_parse() {
        assert_eq!(
            InfoLine::parse("剩余流量：123.45 GB"),
            Some(InfoLine::Traffic("123.45GB".into()))
        );
        assert_eq!(
            InfoLine::parse("距离下次重置剩余：11 天"),
            Some(InfoLine::Reset("11".into()))
        );
        assert_eq!(
            InfoLine::parse("套餐到期：2299-02-01"),
            Some(InfoLine::Expire("2299-02-01".into()))
        );
        assert_eq!(
            InfoLine::parse("套餐到期：长期有效"),
            Some(InfoLine::Expire("长期有效".into()))
        );
        assert_eq!(InfoLine::parse("官网 example.com"), Some(InfoLine::Notice));
        assert_eq!(InfoLine::parse("🇭🇰 香港 01"), None);
    }

    #[test]
    fn test_summary_defaults() {
        let info = SubscriptionInfo::default();
        assert_eq!(info.summary("alpha"), "alpha: 📦❔ ⏳∞ 🗓️∞");

        let info = SubscriptionInfo {
            traffic: Some("123.45GB".into()),
            reset_days: Some("11".into()),
            expire: Some("2299-02-01".into()),
        };
        assert_eq!(info.summary("alpha"), "alpha: 📦123.45GB ⏳11D 🗓️02/01");
    }

    #[test]
    fn test_extract_info_node() {
        let mut sub = Subscription::new("alpha", 1);
        for name in [
            "剩余流量：123.45 GB",
            "🇭🇰 香港 01",
            "套餐到期：长期有效",
            "更新订阅后重启",
            "🇯🇵 日本 02",
        ] {
            sub.add_node(node(name));
        }

        let info = sub.extract_info_node().unwrap();
        assert_eq!(info.name(), "alpha: 📦123.45GB ⏳∞ 🗓️∞");
        assert_eq!(info.get(INFO_NODE_ATTR), Some(&Value::Bool(true)));
        assert_eq!(info.proxy_type(), "ss");

        let names: Vec<_> = sub.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["🇭🇰 香港 01", "🇯🇵 日本 02"]);
        assert_eq!(sub.info_lines.len(), 3);
    }

    #[test]
    fn test_empty_subscription_has_no_info_node() {
        let mut sub = Subscription::new("empty", UNNUMBERED);
        assert!(sub.extract_info_node().is_none());
    }
}
