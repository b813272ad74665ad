//! Exit IP discovery through a proxy.

use crate::error::{LabError, Result};
use crate::proxy::checker::Dialer;
use crate::proxy::models::ProxyRecord;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Plain-text IP echo services, asked in this order.
pub const IP_ECHO_SERVICES: &[&str] = &[
    "https://api64.ipify.org",
    "https://checkip.amazonaws.com",
    "https://ifconfig.me/ip",
    "https://ident.me",
    "https://icanhazip.com",
    "https://api.ip.sb/ip",
    "https://ipinfo.io/ip",
    "https://ipapi.co/ip/",
];

const IN_FLIGHT: usize = 3;
const PER_SERVICE_TIMEOUT: Duration = Duration::from_secs(3);

/// Parses an echo body, accepting only a bare IPv4 or IPv6 address.
pub fn parse_ip(body: &str) -> Option<String> {
    body.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Resolves the public IP the proxy exits from.
///
/// Services are raced three at a time; the first valid answer wins and the
/// remaining requests are dropped.
pub async fn exit_ip(dialer: &dyn Dialer, proxy: &ProxyRecord) -> Result<String> {
    exit_ip_from(dialer, proxy, IP_ECHO_SERVICES).await
}

pub async fn exit_ip_from(
    dialer: &dyn Dialer,
    proxy: &ProxyRecord,
    services: &[&str],
) -> Result<String> {
    let requests: Vec<BoxFuture<'_, (String, Result<String>)>> = services
        .iter()
        .map(|url| {
            let url = url.to_string();
            async move {
                let outcome = dialer.get_text(proxy, &url, PER_SERVICE_TIMEOUT).await;
                (url, outcome)
            }
            .boxed()
        })
        .collect();
    let mut answers = stream::iter(requests).buffer_unordered(IN_FLIGHT);

    let mut failures = Vec::new();
    while let Some((url, outcome)) = answers.next().await {
        match outcome {
            Ok(body) => match parse_ip(&body) {
                Some(ip) => return Ok(ip),
                None => failures.push(format!("{url}: not an IP address")),
            },
            Err(err) => {
                debug!(proxy = %proxy.name(), url = %url, error = %err, "IP echo failed");
                failures.push(format!("{url}: {err}"));
            }
        }
    }
    Err(LabError::ExitIp(if failures.is_empty() {
        "no services configured".to_string()
    } else {
        failures.join("; ")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::checker::DelayFailure;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoDialer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn url_test(
            &self,
            _proxy: &ProxyRecord,
            _url: &str,
            _timeout: Duration,
        ) -> std::result::Result<u16, DelayFailure> {
            Ok(1)
        }

        async fn get_text(&self, _proxy: &ProxyRecord, url: &str, _timeout: Duration) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match url {
                "bad" => Err(LabError::Transport("refused".to_string())),
                "html" => Ok("<html>blocked</html>".to_string()),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok("198.51.100.9".to_string())
                }
                _ => Ok(" 203.0.113.5\n".to_string()),
            }
        }

        async fn download(
            &self,
            _proxy: &ProxyRecord,
            _url: &str,
            _limit: Option<u64>,
            _timeout: Duration,
        ) -> Result<u64> {
            Ok(0)
        }
    }

    fn dialer() -> EchoDialer {
        EchoDialer {
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip("1.2.3.4\n").as_deref(), Some("1.2.3.4"));
        assert_eq!(parse_ip("2001:db8::1").as_deref(), Some("2001:db8::1"));
        assert_eq!(parse_ip("error"), None);
        assert_eq!(parse_ip(""), None);
    }

    #[tokio::test]
    async fn test_first_valid_answer_wins() {
        let dialer = dialer();
        let proxy = ProxyRecord::default();
        let ip = exit_ip_from(&dialer, &proxy, &["bad", "html", "slow", "good"])
            .await
            .unwrap();
        assert_eq!(ip, "203.0.113.5");
    }

    #[tokio::test]
    async fn test_all_services_fail() {
        let dialer = dialer();
        let proxy = ProxyRecord::default();
        let err = exit_ip_from(&dialer, &proxy, &["bad", "html"]).await.unwrap_err();
        match err {
            LabError::ExitIp(message) => {
                assert!(message.contains("bad: transport error: refused"));
                assert!(message.contains("html: not an IP address"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 2);
    }
}
