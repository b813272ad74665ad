//! Fuses detector evidence into one purity verdict.

use crate::config::Conf;
use crate::error::{LabError, Result};
use crate::purity::types::{IpInfo, PurityResult, RiskFactors, UsageType};
use chrono::Utc;
use std::collections::BTreeMap;

/// Share of usable results that must report a factor for it to hold
const FACTOR_THRESHOLD: f64 = 0.3;

/// Glyph used when the country is unknown
pub const UNKNOWN_FLAG: &str = "❓";

/// Merges evidence from several detectors.
///
/// Only results without an error take part. Identity fields come from the
/// first detector that has them, the score is the truncated mean of explicit
/// or factor-derived scores, each factor holds when at least 30% of usable
/// results report it, and the usage type is a majority vote where the first
/// type to reach the maximum wins ties.
pub fn merge(conf: &Conf, results: &[IpInfo], debug: bool) -> Result<PurityResult> {
    let usable: Vec<&IpInfo> = results.iter().filter(|r| r.is_usable()).collect();
    if usable.is_empty() {
        return Err(LabError::NoUsableEvidence);
    }

    let first = |get: fn(&IpInfo) -> Option<&String>| usable.iter().find_map(|r| get(r)).cloned();
    let ip = first(|r| r.ip.as_ref());
    let country = first(|r| r.country.as_ref());
    let region = first(|r| r.region.as_ref());
    let city = first(|r| r.city.as_ref());

    let mut score_total = 0u32;
    let mut score_count = 0u32;
    let mut factor_counts = [0usize; 6];
    let mut usage_votes: Vec<(UsageType, usize)> = Vec::new();

    for result in &usable {
        if let Some(score) = result.risk_score {
            score_total += score.clamp(0, 100) as u32;
            score_count += 1;
        } else if !result.risk_factors.all_absent() {
            score_total += u32::from(result.risk_factors.heuristic_score());
            score_count += 1;
        }

        for (count, flag) in factor_counts
            .iter_mut()
            .zip(result.risk_factors.as_array())
        {
            if flag == Some(true) {
                *count += 1;
            }
        }

        if let Some(usage) = result.usage_type {
            match usage_votes.iter_mut().find(|(u, _)| *u == usage) {
                Some((_, votes)) => *votes += 1,
                None => usage_votes.push((usage, 1)),
            }
        }
    }

    let risk_score = (score_count > 0).then(|| (score_total / score_count) as u8);

    let threshold = usable.len() as f64 * FACTOR_THRESHOLD;
    let risk_factors = RiskFactors::from_array(factor_counts.map(|c| Some(c as f64 >= threshold)));

    let mut usage_type: Option<(UsageType, usize)> = None;
    for &(usage, votes) in &usage_votes {
        if usage_type.map_or(true, |(_, best)| votes > best) {
            usage_type = Some((usage, votes));
        }
    }
    let usage_type = usage_type.map(|(usage, _)| usage);

    let evidence = if debug {
        results
            .iter()
            .map(|r| (r.detector.clone(), r.clone()))
            .collect()
    } else {
        BTreeMap::new()
    };

    Ok(PurityResult {
        country_flag: country_flag(country.as_deref()),
        purity_icon: purity_icon(conf, risk_score),
        type_icon: type_icon(conf, usage_type),
        ip,
        country,
        region,
        city,
        risk_score,
        usage_type,
        risk_factors,
        last_updated: Utc::now(),
        evidence,
    })
}

/// Regional-indicator flag for a two-letter country code.
pub fn country_flag(code: Option<&str>) -> String {
    match code {
        Some(code) if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) => code
            .to_ascii_uppercase()
            .chars()
            .filter_map(|c| char::from_u32(0x1F1E6 + (c as u32 - 'A' as u32)))
            .collect(),
        _ => UNKNOWN_FLAG.to_string(),
    }
}

/// Purity glyph: unknown, then `<20`, `<40`, `<60`, `<80`, `>=80`.
pub fn purity_icon(conf: &Conf, risk_score: Option<u8>) -> String {
    let index = match risk_score {
        None => 0,
        Some(score) => (usize::from(score) / 20 + 1).min(5),
    };
    conf.purity_icons().get(index).cloned().unwrap_or_default()
}

pub fn type_icon(conf: &Conf, usage_type: Option<UsageType>) -> String {
    let index = match usage_type {
        None => 0,
        Some(UsageType::Residential) => 1,
        Some(UsageType::Datacenter) => 2,
        Some(UsageType::Other) => 3,
    };
    conf.type_icons().get(index).cloned().unwrap_or_default()
}
