//! Error types for proxy-lab.
//!
//! Batch operations never fail as a whole: they collect these errors per
//! item and keep going. Single-item operations (one cache read, one tester
//! run, one purity merge) return them directly.

use thiserror::Error;

/// Errors produced by the library.
#[derive(Debug, Error)]
pub enum LabError {
    /// The backing key-value store failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A stored value could not be decoded into the requested type.
    #[error("decode error for key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be serialized before being stored.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// A cache key did not match its expected prefix or arity.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// One or more entries failed during a prefix scan.
    #[error("scan of prefix {prefix} failed: {}", join_errors(.errors))]
    Scan { prefix: String, errors: Vec<LabError> },

    /// TLS handshake or record failure while checking a node.
    #[error("{node}: TLS error")]
    Tls { node: String },

    /// The remote side reset the connection or closed it early.
    #[error("{node}: connection reset")]
    ConnectionReset { node: String },

    /// Any other delay check failure, tagged with the node name.
    #[error("{node}: {message}")]
    Node { node: String, message: String },

    /// Building a transport for a cached proxy definition failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP client failure.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// A single IP-intelligence lookup failed.
    #[error("[{detector}] {message}")]
    Detector { detector: String, message: String },

    /// Every IP echo service failed to return a valid address.
    #[error("could not resolve exit IP: {0}")]
    ExitIp(String),

    /// No detector produced usable evidence for a purity merge.
    #[error("no usable evidence")]
    NoUsableEvidence,

    /// A tester panicked; the panic was caught at the task boundary.
    #[error("tester {tester} panicked on {proxy}: {message}")]
    TesterPanic {
        tester: String,
        proxy: String,
        message: String,
    },

    /// A speed test failed.
    #[error("speed test failed: {0}")]
    Speed(String),

    /// The cron scheduler rejected an operation.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Invalid request or process configuration.
    #[error("config error: {0}")]
    Config(String),
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, LabError>;

/// Renders a list of errors as one `; `-separated line.
pub fn join_errors(errors: &[LabError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_tagged_messages() {
        let err = LabError::Tls {
            node: "HK 01".to_string(),
        };
        assert_eq!(err.to_string(), "HK 01: TLS error");

        let err = LabError::ConnectionReset {
            node: "JP 02".to_string(),
        };
        assert_eq!(err.to_string(), "JP 02: connection reset");
    }

    #[test]
    fn test_scan_error_joins_children() {
        let err = LabError::Scan {
            prefix: "Proxie/".to_string(),
            errors: vec![
                LabError::InvalidKey("a".to_string()),
                LabError::InvalidKey("b".to_string()),
            ],
        };
        assert_eq!(
            err.to_string(),
            "scan of prefix Proxie/ failed: invalid key: a; invalid key: b"
        );
    }
}
