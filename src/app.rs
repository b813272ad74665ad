//! Wiring of the store, testers, cron registry and orchestrator.

use crate::beautify;
use crate::cache::{KeyedCache, KvStore, SqliteStore};
use crate::config::EnvConfig;
use crate::cron::{CronOptions, CronRegistry};
use crate::error::{LabError, Result};
use crate::orchestrator::{BatchReport, TestOrchestrator};
use crate::proxy::checker::{CheckerConfig, Dialer, ProxyChecker, ReqwestDialer};
use crate::proxy::models::{Args, ProxyRecord};
use crate::tester::TesterRegistry;
use std::sync::Arc;
use tracing::info;

/// A running lab: one cache, one cron registry, one orchestrator.
pub struct Lab {
    env: EnvConfig,
    orchestrator: TestOrchestrator,
    sqlite: Option<SqliteStore>,
}

impl Lab {
    /// Opens the SQLite cache under `data_dir`, restores persisted cron jobs
    /// and starts the scheduler.
    pub async fn new(env: EnvConfig) -> Result<Self> {
        std::fs::create_dir_all(&env.data_dir).map_err(|e| {
            LabError::Config(format!("cannot create {}: {e}", env.data_dir.display()))
        })?;
        let sqlite = SqliteStore::connect(&env.database_url()).await?;
        info!(database = %env.database_url(), "cache opened");

        let mut lab =
            Self::with_store(env, Arc::new(sqlite.clone()), Arc::new(ReqwestDialer::new())).await?;
        lab.sqlite = Some(sqlite);
        Ok(lab)
    }

    /// Builds a lab over any store and transport.
    pub async fn with_store(
        env: EnvConfig,
        store: Arc<dyn KvStore>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let cache = KeyedCache::new(store);
        let testers = TesterRegistry::from_env(&env)?;
        info!(testers = testers.len(), "testers registered");

        let cron =
            CronRegistry::new(cache.clone(), testers, dialer.clone(), CronOptions::default()).await?;
        cron.restore().await?;
        cron.start().await?;

        let checker = ProxyChecker::with_config(
            CheckerConfig::new()
                .with_concurrency(env.concurrency)
                .with_test_url(env.delay_test_url.clone()),
            dialer,
        );
        let orchestrator = TestOrchestrator::new(cache, cron, checker)
            .with_tester_concurrency(env.concurrency)
            .with_debug(env.debug);

        Ok(Self {
            env,
            orchestrator,
            sqlite: None,
        })
    }

    pub fn env(&self) -> &EnvConfig {
        &self.env
    }

    pub fn orchestrator(&self) -> &TestOrchestrator {
        &self.orchestrator
    }

    /// Runs one batch and returns the beautified list together with the
    /// batch report (errors and started refreshes).
    pub async fn run(&self, args: &Args) -> (Vec<ProxyRecord>, BatchReport) {
        let mut report = self.orchestrator.run_batch(args).await;
        let nodes = std::mem::take(&mut report.nodes);
        let records = beautify::process(nodes, &args.conf);
        info!(conf = %args.conf.id, output = records.len(), "nodes processed");
        (records, report)
    }

    /// Drains running cron jobs, stops the scheduler and closes the cache.
    pub async fn shutdown(&self) -> Result<()> {
        self.orchestrator.cron().shutdown().await?;
        if let Some(sqlite) = &self.sqlite {
            sqlite.close().await;
        }
        Ok(())
    }
}
