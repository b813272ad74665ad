//! Proxy definitions and delay probing
//!
//! This module provides:
//! - The raw proxy record and the batch request it arrives in
//! - The transport seam (`Dialer`) and its `reqwest` implementation
//! - Delay probing with failure classification

pub mod checker;
pub mod models;

pub use checker::{CheckerConfig, Dialer, DelayFailure, ProxyChecker, ReqwestDialer};
pub use models::{Args, ProxyRecord};
