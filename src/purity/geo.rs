//! Offline geolocation from a MaxMind City database.

use crate::error::{LabError, Result};
use crate::purity::detectors::Detector;
use crate::purity::types::{non_empty, IpInfo};
use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use reqwest::Client;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

const NAME: &str = "MMDB";

fn mmdb_error(message: impl ToString) -> LabError {
    LabError::Detector {
        detector: NAME.to_string(),
        message: message.to_string(),
    }
}

/// Identity-only detector backed by a local `.mmdb` file.
#[derive(Clone)]
pub struct MmdbDetector {
    reader: Arc<Reader<Vec<u8>>>,
}

impl MmdbDetector {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path)
            .map_err(|e| mmdb_error(format!("cannot open {}: {e}", path.display())))?;
        Ok(Self {
            reader: Arc::new(reader),
        })
    }

    pub fn lookup(&self, ip: &str) -> Result<IpInfo> {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| mmdb_error(format!("invalid IP address: {ip}")))?;
        let result = self.reader.lookup(addr).map_err(mmdb_error)?;
        let city: Option<geoip2::City> = result.decode().map_err(mmdb_error)?;

        let mut info = IpInfo::new(NAME);
        info.ip = Some(addr.to_string());
        let Some(city) = city else {
            return Ok(info);
        };

        info.country = city.country.iso_code.and_then(non_empty);
        info.city = city.city.names.english.and_then(non_empty);
        info.region = city
            .subdivisions
            .first()
            .and_then(|s| s.names.english)
            .and_then(non_empty);
        Ok(info)
    }
}

#[async_trait]
impl Detector for MmdbDetector {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn detect(&self, _client: &Client, ip: &str) -> Result<IpInfo> {
        self.lookup(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database() {
        let err = MmdbDetector::from_path("/nonexistent/GeoLite2-City.mmdb")
            .err()
            .unwrap();
        match err {
            LabError::Detector { detector, message } => {
                assert_eq!(detector, "MMDB");
                assert!(message.contains("GeoLite2-City.mmdb"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
