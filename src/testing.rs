//! Scripted transport shared by unit tests.

use crate::error::{LabError, Result};
use crate::proxy::checker::{Dialer, DelayFailure};
use crate::proxy::models::ProxyRecord;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Answers by proxy name; unknown names get a 10ms delay.
#[derive(Default)]
pub struct ScriptedDialer {
    pub delays: HashMap<String, std::result::Result<u16, DelayFailure>>,
    pub exit_ip: Option<String>,
    pub download_bytes: u64,
    pub panic_on: Option<String>,
    pub url_tests: AtomicUsize,
    pub downloads: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
}

impl ScriptedDialer {
    pub fn new() -> Self {
        Self {
            exit_ip: Some("203.0.113.7".to_string()),
            download_bytes: 1024 * 1024,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, name: &str, delay: std::result::Result<u16, DelayFailure>) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, proxy: &ProxyRecord) {
        if self.panic_on.as_deref() == Some(proxy.name()) {
            panic!("scripted panic for {}", proxy.name());
        }
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(proxy.name().to_string());
        }
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn url_test(
        &self,
        proxy: &ProxyRecord,
        _url: &str,
        _timeout: Duration,
    ) -> std::result::Result<u16, DelayFailure> {
        self.url_tests.fetch_add(1, Ordering::SeqCst);
        self.record(proxy);
        self.delays.get(proxy.name()).cloned().unwrap_or(Ok(10))
    }

    async fn get_text(&self, proxy: &ProxyRecord, _url: &str, _timeout: Duration) -> Result<String> {
        self.exit_ip
            .clone()
            .ok_or_else(|| LabError::Transport(format!("{}: no route", proxy.name())))
    }

    async fn download(
        &self,
        proxy: &ProxyRecord,
        _url: &str,
        limit: Option<u64>,
        _timeout: Duration,
    ) -> Result<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.record(proxy);
        Ok(limit.map_or(self.download_bytes, |l| self.download_bytes.min(l)))
    }
}

/// Builds a proxy record from a JSON object literal.
pub fn proxy(value: Value) -> ProxyRecord {
    serde_json::from_value(value).unwrap()
}

pub fn named(name: &str, sub: &str) -> ProxyRecord {
    proxy(json!({
        "name": name,
        "type": "socks5",
        "server": "127.0.0.1",
        "port": 1080,
        "_subName": sub,
    }))
}
