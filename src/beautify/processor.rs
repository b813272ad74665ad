//! Ordering and renaming of a tested batch.

use crate::beautify::node::Node;
use crate::beautify::subscription::Subscription;
use crate::config::Conf;
use crate::proxy::models::ProxyRecord;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Number of fastest nodes averaged to rank a country
const COUNTRY_SAMPLE: usize = 3;

/// Groups nodes by subscription in first-seen order, then sorts the groups
/// by `(number, name)`.
pub fn group_subscriptions(nodes: Vec<Node>) -> Vec<Subscription> {
    let mut subs: Vec<Subscription> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for node in nodes {
        let slot = *index.entry(node.subscription.clone()).or_insert_with(|| {
            subs.push(Subscription::new(node.subscription.clone(), node.sub_num));
            subs.len() - 1
        });
        subs[slot].add_node(node);
    }
    subs.sort_by(|a, b| a.num.cmp(&b.num).then_with(|| a.name.cmp(&b.name)));
    subs
}

/// Mean of the `COUNTRY_SAMPLE` lowest positive delays, infinite when the
/// country has none.
pub fn country_delay(delays: impl IntoIterator<Item = Option<u16>>) -> f64 {
    let mut delays: Vec<u16> = delays.into_iter().flatten().filter(|d| *d > 0).collect();
    if delays.is_empty() {
        return f64::INFINITY;
    }
    delays.sort_unstable();
    let best = &delays[..delays.len().min(COUNTRY_SAMPLE)];
    best.iter().map(|d| f64::from(*d)).sum::<f64>() / best.len() as f64
}

/// Produces the final list: one summary node per subscription, then the
/// tested nodes ordered by country, subscription and delay, renamed with a
/// per-country index.
///
/// With `no_beautify_nodes` the records come back unchanged in input order.
pub fn process(nodes: Vec<Node>, conf: &Conf) -> Vec<ProxyRecord> {
    if conf.no_beautify_nodes {
        return nodes.into_iter().map(|n| n.record).collect();
    }

    let mut info_nodes = Vec::new();
    // country -> subscription order -> nodes
    let mut countries: BTreeMap<String, BTreeMap<usize, Vec<Node>>> = BTreeMap::new();
    let mut dropped = 0usize;

    for (order, mut sub) in group_subscriptions(nodes).into_iter().enumerate() {
        if let Some(info) = sub.extract_info_node() {
            info_nodes.push(info);
        }
        for node in sub.nodes {
            match node.country().map(str::to_string) {
                Some(country) => countries
                    .entry(country)
                    .or_default()
                    .entry(order)
                    .or_default()
                    .push(node),
                None => dropped += 1,
            }
        }
    }
    if dropped > 0 {
        debug!(dropped, "nodes without purity country left out");
    }

    let mut ranked: Vec<(f64, String, BTreeMap<usize, Vec<Node>>)> = countries
        .into_iter()
        .map(|(country, subs)| {
            let avg = country_delay(subs.values().flatten().map(|n| n.delay));
            (avg, country, subs)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut output = info_nodes;
    for (avg, country, subs) in ranked {
        debug!(country = %country, avg_delay = avg, "country rank");
        let mut index = 0usize;
        for (_, mut group) in subs {
            group.sort_by(by_delay_then_name);
            for node in group {
                if node.delay.unwrap_or(0) == 0 {
                    continue;
                }
                index += 1;
                output.push(node.format(&conf.keywords, index));
            }
        }
    }
    output
}

fn by_delay_then_name(a: &Node, b: &Node) -> Ordering {
    a.delay
        .unwrap_or(u16::MAX)
        .cmp(&b.delay.unwrap_or(u16::MAX))
        .then_with(|| a.name.cmp(&b.name))
}
