//! Structured cache keys.
//!
//! Every key serializes as `<prefix><field>::<field>...`. The byte layout is
//! shared with data already on disk, so prefixes and the separator must not
//! change.

use crate::error::{LabError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const FIELD_SEPARATOR: &str = "::";
pub const PROXY_KEY_PREFIX: &str = "Proxie/";
pub const PROXY_RESULT_KEY_PREFIX: &str = "ProxieResult/";
pub const CRON_JOB_KEY_PREFIX: &str = "CronJob/";

/// Tester categories that produce cached results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TesterType {
    Delay,
    Speed,
    Purity,
}

impl TesterType {
    pub const ALL: [TesterType; 3] = [TesterType::Delay, TesterType::Speed, TesterType::Purity];

    pub fn as_str(&self) -> &'static str {
        match self {
            TesterType::Delay => "Delay",
            TesterType::Speed => "Speed",
            TesterType::Purity => "Purity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for TesterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key type with a fixed prefix and a fixed number of fields.
pub trait CacheKey: Sized {
    const PREFIX: &'static str;

    fn fields(&self) -> Vec<&str>;

    fn from_fields(fields: &[&str]) -> Result<Self>;

    fn to_key(&self) -> Vec<u8> {
        format!("{}{}", Self::PREFIX, self.fields().join(FIELD_SEPARATOR)).into_bytes()
    }

    fn from_key(key: &[u8]) -> Result<Self> {
        let key = std::str::from_utf8(key)
            .map_err(|_| LabError::InvalidKey(String::from_utf8_lossy(key).into_owned()))?;
        let rest = key
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| LabError::InvalidKey(key.to_string()))?;
        let fields: Vec<&str> = rest.split(FIELD_SEPARATOR).collect();
        Self::from_fields(&fields).map_err(|_| LabError::InvalidKey(key.to_string()))
    }
}

fn expect_arity(fields: &[&str], arity: usize) -> Result<()> {
    if fields.len() == arity {
        Ok(())
    } else {
        Err(LabError::InvalidKey(fields.join(FIELD_SEPARATOR)))
    }
}

/// Identity of one proxy within one configuration and subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyKey {
    pub conf_id: String,
    pub sub_name: String,
    pub proxy_name: String,
}

impl ProxyKey {
    pub fn new(conf_id: &str, sub_name: &str, proxy_name: &str) -> Self {
        Self {
            conf_id: conf_id.to_string(),
            sub_name: sub_name.to_string(),
            proxy_name: proxy_name.to_string(),
        }
    }

    /// Prefix covering every cached proxy of one configuration. The trailing
    /// separator keeps `conf` from matching `conf2`.
    pub fn conf_prefix(conf_id: &str) -> Vec<u8> {
        format!("{}{}{}", PROXY_KEY_PREFIX, conf_id, FIELD_SEPARATOR).into_bytes()
    }

    pub fn result_key(&self, tester: TesterType) -> ProxyResultKey {
        ProxyResultKey {
            proxy: self.clone(),
            tester,
        }
    }
}

impl CacheKey for ProxyKey {
    const PREFIX: &'static str = PROXY_KEY_PREFIX;

    fn fields(&self) -> Vec<&str> {
        vec![self.conf_id.as_str(), self.sub_name.as_str(), self.proxy_name.as_str()]
    }

    fn from_fields(fields: &[&str]) -> Result<Self> {
        expect_arity(fields, 3)?;
        Ok(Self::new(fields[0], fields[1], fields[2]))
    }
}

impl fmt::Display for ProxyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.conf_id, self.sub_name, self.proxy_name)
    }
}

/// Key of one tester's result for one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyResultKey {
    pub proxy: ProxyKey,
    pub tester: TesterType,
}

impl CacheKey for ProxyResultKey {
    const PREFIX: &'static str = PROXY_RESULT_KEY_PREFIX;

    fn fields(&self) -> Vec<&str> {
        vec![
            self.proxy.conf_id.as_str(),
            self.proxy.sub_name.as_str(),
            self.proxy.proxy_name.as_str(),
            self.tester.as_str(),
        ]
    }

    fn from_fields(fields: &[&str]) -> Result<Self> {
        expect_arity(fields, 4)?;
        let tester =
            TesterType::parse(fields[3]).ok_or_else(|| LabError::InvalidKey(fields[3].to_string()))?;
        Ok(Self {
            proxy: ProxyKey::new(fields[0], fields[1], fields[2]),
            tester,
        })
    }
}

/// Identity of one recurring job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CronJobKey {
    pub conf_id: String,
    pub tester: TesterType,
}

impl CronJobKey {
    pub fn new(conf_id: &str, tester: TesterType) -> Self {
        Self {
            conf_id: conf_id.to_string(),
            tester,
        }
    }

    /// Prefix of every proxy this job re-tests.
    pub fn proxy_prefix(&self) -> Vec<u8> {
        ProxyKey::conf_prefix(&self.conf_id)
    }
}

impl CacheKey for CronJobKey {
    const PREFIX: &'static str = CRON_JOB_KEY_PREFIX;

    fn fields(&self) -> Vec<&str> {
        vec![self.conf_id.as_str(), self.tester.as_str()]
    }

    fn from_fields(fields: &[&str]) -> Result<Self> {
        expect_arity(fields, 2)?;
        let tester =
            TesterType::parse(fields[1]).ok_or_else(|| LabError::InvalidKey(fields[1].to_string()))?;
        Ok(Self::new(fields[0], tester))
    }
}

impl fmt::Display for CronJobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.conf_id, self.tester)
    }
}
