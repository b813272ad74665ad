//! IP purity: exit IP discovery, detector lookups and evidence merging.

pub mod detectors;
pub mod exit_ip;
pub mod geo;
pub mod merge;
pub mod types;

pub use detectors::{ApiKey, Detector, DetectorSet};
pub use exit_ip::exit_ip;
pub use geo::MmdbDetector;
pub use merge::{country_flag, merge, purity_icon, type_icon};
pub use types::{IpInfo, PurityResult, RiskFactors, UsageType};
