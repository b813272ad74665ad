//! Batch entry point: check delay, look up cached results, schedule refreshes.

use crate::beautify::Node;
use crate::cache::{CronJobKey, KeyedCache, ProxyKey, TesterType};
use crate::config::{DEFAULT_CONCURRENCY, RESULT_TTL};
use crate::cron::{CronRegistry, RunSummary};
use crate::error::{join_errors, LabError, Result};
use crate::proxy::checker::ProxyChecker;
use crate::proxy::models::{Args, ProxyRecord};
use crate::tester::{DelayResult, TestResult, Tester};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Background refresh started by a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTrigger {
    pub tester: TesterType,
    /// Proxies to re-test; `None` re-tests every cached proxy
    pub filter: Option<HashSet<ProxyKey>>,
}

/// Outcome of one batch.
pub struct BatchReport {
    /// Nodes in input order, carrying live delays and cached results
    pub nodes: Vec<Node>,
    /// Per-node failures; the batch itself never fails
    pub errors: Vec<LabError>,
    pub refreshes: Vec<RefreshTrigger>,
    handles: Vec<JoinHandle<RunSummary>>,
}

impl BatchReport {
    /// Waits for the background refreshes this batch started.
    pub async fn join_refreshes(&mut self) -> Vec<RunSummary> {
        let mut summaries = Vec::new();
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!(error = %err, "refresh task failed"),
            }
        }
        summaries
    }
}

pub struct TestOrchestrator {
    cache: KeyedCache,
    cron: CronRegistry,
    checker: ProxyChecker,
    tester_concurrency: usize,
    result_ttl: Duration,
    debug: bool,
}

impl TestOrchestrator {
    pub fn new(cache: KeyedCache, cron: CronRegistry, checker: ProxyChecker) -> Self {
        Self {
            cache,
            cron,
            checker,
            tester_concurrency: DEFAULT_CONCURRENCY,
            result_ttl: RESULT_TTL,
            debug: false,
        }
    }

    pub fn with_tester_concurrency(mut self, concurrency: usize) -> Self {
        self.tester_concurrency = concurrency.max(1);
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn cron(&self) -> &CronRegistry {
        &self.cron
    }

    /// Runs one batch.
    ///
    /// Every proxy gets a live delay check; reachable ones are cached for
    /// cron reruns. Each enabled tester then contributes its cached result,
    /// and misses are handed to a background run limited to the missing
    /// proxies. A `JSON` platform refreshes everything instead.
    pub async fn run_batch(&self, args: &Args) -> BatchReport {
        let conf = &args.conf;
        let mut errors = Vec::new();

        // proxies dropped from the submission must not be re-tested by cron
        if let Err(err) = self.cache.delete_prefix(&ProxyKey::conf_prefix(&conf.id)).await {
            warn!(conf = %conf.id, error = %err, "failed to evict cached proxies");
            errors.push(err);
        }

        let mut nodes: Vec<Node> = args.proxies.iter().cloned().map(Node::new).collect();
        info!(conf = %conf.id, proxies = nodes.len(), "batch started");

        let delays: Vec<(usize, Result<Option<u16>>)> = {
            let nodes = &nodes;
            stream::iter(0..nodes.len())
                .map(|i| async move { (i, self.measure_delay(args, &nodes[i].record).await) })
                .buffer_unordered(self.checker.config().concurrency)
                .collect()
                .await
        };
        let mut reachable = 0usize;
        for (i, outcome) in delays {
            match outcome {
                Ok(Some(delay)) => {
                    nodes[i].set_delay(delay);
                    reachable += 1;
                }
                Ok(None) => {}
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            warn!(conf = %conf.id, failed = errors.len(), errors = %join_errors(&errors), "delay checks failed");
        }

        let testers: Vec<Tester> = self.cron.testers().iter().cloned().collect();
        let misses: Mutex<HashMap<TesterType, HashSet<ProxyKey>>> = Mutex::new(HashMap::new());
        let lookups: Vec<(usize, Result<Option<TestResult>>)> = {
            let nodes = &nodes;
            let misses = &misses;
            let pairs: Vec<(usize, &Tester)> = (0..nodes.len())
                .flat_map(|i| testers.iter().map(move |t| (i, t)))
                .collect();
            stream::iter(pairs)
                .map(|(i, tester)| async move {
                    (i, self.lookup(args, &nodes[i].record, tester, misses).await)
                })
                .buffer_unordered(self.tester_concurrency)
                .collect()
                .await
        };
        let mut hits = 0usize;
        for (i, outcome) in lookups {
            match outcome {
                Ok(Some(result)) => {
                    nodes[i].apply(&result, self.debug);
                    hits += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(proxy = %nodes[i].name, error = %err, "cached result lookup failed");
                    errors.push(err);
                }
            }
        }

        let mut misses = misses.into_inner();
        let mut refreshes = Vec::new();
        let mut handles = Vec::new();
        for tester in &testers {
            let tester_type = tester.tester_type();
            let key = CronJobKey::new(&conf.id, tester_type);
            let job = match self.cron.get_or_upsert(&key, tester.cron(conf), conf).await {
                Ok(job) => job,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };
            if args.forces_refresh() {
                handles.push(self.cron.spawn_run(job));
                refreshes.push(RefreshTrigger {
                    tester: tester_type,
                    filter: None,
                });
            } else if let Some(missed) = misses.remove(&tester_type).filter(|m| !m.is_empty()) {
                info!(job = %key, missed = missed.len(), "running tester for uncached proxies");
                handles.push(self.cron.spawn_filtered(job, missed.clone()));
                refreshes.push(RefreshTrigger {
                    tester: tester_type,
                    filter: Some(missed),
                });
            }
        }

        info!(
            conf = %conf.id,
            reachable,
            cached = hits,
            refreshes = refreshes.len(),
            errors = errors.len(),
            "batch finished"
        );
        BatchReport {
            nodes,
            errors,
            refreshes,
            handles,
        }
    }

    async fn measure_delay(&self, args: &Args, record: &ProxyRecord) -> Result<Option<u16>> {
        let Some(delay) = self.checker.check_proxy(record).await? else {
            return Ok(None);
        };
        let key = args.proxy_key(record);
        let ttl = Some(self.result_ttl);
        self.cache.set(&key, record, ttl).await?;
        let result = TestResult::Delay(DelayResult {
            delay,
            last_updated: Utc::now(),
        });
        self.cache
            .set(&key.result_key(TesterType::Delay), &result, ttl)
            .await?;
        Ok(Some(delay))
    }

    async fn lookup(
        &self,
        args: &Args,
        record: &ProxyRecord,
        tester: &Tester,
        misses: &Mutex<HashMap<TesterType, HashSet<ProxyKey>>>,
    ) -> Result<Option<TestResult>> {
        let conf = &args.conf;
        let tester_type = tester.tester_type();
        self.cron
            .get_or_upsert(
                &CronJobKey::new(&conf.id, tester_type),
                tester.cron(conf),
                conf,
            )
            .await?;

        let key = args.proxy_key(record);
        let cached = self.cache.get(&key.result_key(tester_type)).await?;
        if cached.is_none() {
            misses
                .lock()
                .await
                .entry(tester_type)
                .or_default()
                .insert(key);
        }
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::cron::CronOptions;
    use crate::proxy::checker::{CheckerConfig, DelayFailure};
    use crate::tester::{SpeedTester, TesterRegistry};
    use crate::testing::{named, ScriptedDialer};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    async fn orchestrator(
        dialer: ScriptedDialer,
        ttl: Duration,
    ) -> (TestOrchestrator, KeyedCache, Arc<ScriptedDialer>) {
        let cache = KeyedCache::new(Arc::new(MemoryStore::new()));
        let dialer = Arc::new(dialer);
        let testers = TesterRegistry::new(vec![Tester::Speed(SpeedTester)]);
        let options = CronOptions {
            item_delay: Duration::from_millis(1),
            result_ttl: ttl,
        };
        let cron = CronRegistry::new(cache.clone(), testers, dialer.clone(), options)
            .await
            .unwrap();
        let checker = ProxyChecker::with_config(CheckerConfig::new().with_concurrency(4), dialer.clone());
        let orchestrator = TestOrchestrator::new(cache.clone(), cron, checker)
            .with_tester_concurrency(4)
            .with_result_ttl(ttl);
        (orchestrator, cache, dialer)
    }

    fn args(platform: &str, names: &[&str]) -> Args {
        let mut args = Args::default();
        args.conf.id = "c".to_string();
        args.platform = platform.to_string();
        args.proxies = names.iter().map(|n| named(n, "sub")).collect();
        args
    }

    #[tokio::test]
    async fn test_delay_failures_are_classified() {
        let dialer = ScriptedDialer::new()
            .with_delay("tls", Err(DelayFailure::Tls("record overflow".into())))
            .with_delay("reset", Err(DelayFailure::ConnectionReset("eof".into())))
            .with_delay("dns", Err(DelayFailure::Unreachable("lookup failed".into())))
            .with_delay("ok", Ok(33));
        let (orch, cache, _) = orchestrator(dialer, RESULT_TTL).await;

        let report = orch.run_batch(&args("ClashMeta", &["tls", "reset", "dns", "ok"])).await;
        let mut messages: Vec<String> = report.errors.iter().map(ToString::to_string).collect();
        messages.sort();
        assert_eq!(messages, vec!["reset: connection reset", "tls: TLS error"]);

        let delays: Vec<_> = report.nodes.iter().map(|n| n.delay).collect();
        assert_eq!(delays, vec![None, None, None, Some(33)]);

        let stored: Option<ProxyRecord> = cache.get(&ProxyKey::new("c", "sub", "ok")).await.unwrap();
        assert!(stored.is_some());
        let stored: Option<ProxyRecord> = cache.get(&ProxyKey::new("c", "sub", "dns")).await.unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_misses_trigger_filtered_run_then_hit() {
        let (orch, _, dialer) = orchestrator(ScriptedDialer::new(), RESULT_TTL).await;
        let batch = args("ClashMeta", &["a", "b"]);

        let mut first = orch.run_batch(&batch).await;
        assert_eq!(first.refreshes.len(), 1);
        let filter = first.refreshes[0].filter.clone().unwrap();
        assert_eq!(filter.len(), 2);
        let summaries = first.join_refreshes().await;
        assert_eq!(summaries[0].succeeded, 2);
        assert_eq!(dialer.downloads.load(Ordering::SeqCst), 2);

        let second = orch.run_batch(&batch).await;
        assert!(second.refreshes.is_empty());
        assert!(second.nodes.iter().all(|n| n.speed.is_some()));
        assert!(second.nodes[0].record.get("Speed_speed").is_some());
        assert_eq!(orch.cron().job_count().await, 1);
    }

    #[tokio::test]
    async fn test_expired_results_are_refreshed() {
        let ttl = Duration::from_secs(1);
        let (orch, _, _) = orchestrator(ScriptedDialer::new(), ttl).await;
        let batch = args("ClashMeta", &["a"]);

        let mut first = orch.run_batch(&batch).await;
        first.join_refreshes().await;
        assert!(orch.run_batch(&batch).await.refreshes.is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let third = orch.run_batch(&batch).await;
        assert_eq!(third.refreshes.len(), 1);
    }

    #[tokio::test]
    async fn test_json_platform_forces_full_refresh() {
        let (orch, _, _) = orchestrator(ScriptedDialer::new(), RESULT_TTL).await;
        let mut first = orch.run_batch(&args("ClashMeta", &["a"])).await;
        first.join_refreshes().await;

        let forced = orch.run_batch(&args("JSON", &["a"])).await;
        assert_eq!(
            forced.refreshes,
            vec![RefreshTrigger {
                tester: TesterType::Speed,
                filter: None
            }]
        );
    }

    #[tokio::test]
    async fn test_resubmission_evicts_dropped_proxies() {
        let (orch, cache, _) = orchestrator(ScriptedDialer::new(), RESULT_TTL).await;
        let mut first = orch.run_batch(&args("ClashMeta", &["a", "b"])).await;
        first.join_refreshes().await;

        let mut second = orch.run_batch(&args("JSON", &["a"])).await;
        let summaries = second.join_refreshes().await;
        assert_eq!(summaries[0].total, 1);
        let gone: Option<ProxyRecord> = cache.get(&ProxyKey::new("c", "sub", "b")).await.unwrap();
        assert!(gone.is_none());
    }
}
