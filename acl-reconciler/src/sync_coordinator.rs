use std::{sync::Arc, time::Duration};

use acl_reconciler_apis::{Rule, RuleSyncData, RuleSyncInfo};
use chrono::Utc;
use futures::future::join_all;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
use tokio::time::Instant;

use crate::{
    engine::{Engine, EngineRegistry, SyncResult},
    errors::ControllerError,
    logic_cache::ResolutionCache,
    resolver::TargetResolver,
    rule_service::RuleSyncService,
    storage::StorageError,
    utils::metric_name,
};

const SYNC_COORDINATOR: &str = "sync_coordinator";

#[derive(Clone)]
struct EngineMetrics {
    rule_sync_duration: Histogram<f64>,
    full_sync_duration: Histogram<f64>,
    rule_sync_failures: Counter<u64>,
}

impl EngineMetrics {
    fn new() -> Self {
        let meter = global::meter(SYNC_COORDINATOR);
        EngineMetrics {
            rule_sync_duration: meter
                .f64_histogram(metric_name("rule_sync_duration_seconds"))
                .with_description("Duration of a single rule sync per engine")
                .with_unit("s")
                .build(),
            full_sync_duration: meter
                .f64_histogram(metric_name("full_sync_duration_seconds"))
                .with_description("Duration of a full sync pass per engine")
                .with_unit("s")
                .build(),
            rule_sync_failures: meter
                .u64_counter(metric_name("rule_sync_failures_total"))
                .with_description("The number of failed rule syncs per engine")
                .build(),
        }
    }
}

/// Runs every enabled engine over a batch of rules.
///
/// Engines run concurrently and share one resolution cache per batch. Within
/// an engine rules are synced one after another, each under its own
/// (rule, engine) lock, and a failing rule never stops the rest of the batch.
#[derive(Clone)]
pub(crate) struct SyncCoordinator {
    registry: Arc<EngineRegistry>,
    resolver: Arc<TargetResolver>,
    rule_service: Arc<RuleSyncService>,
    sync_interval: Duration,
    metrics: EngineMetrics,
}

impl SyncCoordinator {
    pub fn new(
        registry: Arc<EngineRegistry>,
        resolver: Arc<TargetResolver>,
        rule_service: Arc<RuleSyncService>,
        sync_interval: Duration,
    ) -> Self {
        SyncCoordinator {
            registry,
            resolver,
            rule_service,
            sync_interval,
            metrics: EngineMetrics::new(),
        }
    }

    /// Syncs `rules` with every engine and returns once all engines are done.
    pub async fn sync_rules(&self, rules: Vec<Rule>, force: bool) -> usize {
        let count = rules.len();
        let rules = Arc::new(rules);
        let cache = Arc::new(ResolutionCache::new(self.resolver.clone()));
        let tasks = self.registry.instantiate().into_iter().map(|engine| {
            let coordinator = self.clone();
            tokio::spawn(coordinator.engine_sync(engine, rules.clone(), cache.clone(), force))
        });
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("engine sync task failed: {}", e);
            }
        }
        count
    }

    async fn engine_sync(
        self,
        mut engine: Box<dyn Engine>,
        rules: Arc<Vec<Rule>>,
        cache: Arc<ResolutionCache>,
        force: bool,
    ) {
        let name = engine.name().to_string();
        let labels = [KeyValue::new("engine", name.clone())];
        let start = Instant::now();
        if let Err(e) = engine.before_sync(cache).await {
            error!("[engine {}] unable to prepare sync: {}", name, e);
        }
        for rule in rules.iter() {
            debug!("[engine {}] [rule {}] starting single rule sync", name, rule.rule_id);
            let rule_start = Instant::now();
            let result = self.sync_rule(engine.as_ref(), rule, force).await;
            self.metrics
                .rule_sync_duration
                .record(rule_start.elapsed().as_secs_f64(), &labels);
            if let Err(e) = result {
                self.metrics.rule_sync_failures.add(1, &labels);
                error!("[engine {}] error syncing rule {}: {}", name, rule, e);
            }
        }
        if let Err(e) = engine.after_sync().await {
            error!("[engine {}] unable to finish sync: {}", name, e);
        }
        self.metrics
            .full_sync_duration
            .record(start.elapsed().as_secs_f64(), &labels);
    }

    async fn sync_rule(
        &self,
        engine: &dyn Engine,
        rule: &Rule,
        force: bool,
    ) -> Result<(), ControllerError> {
        if !engine.allowed(rule).await? {
            debug!("[engine {}] [rule {}] not allowed in this worker", engine.name(), rule.rule_id);
            return Ok(());
        }
        let lock = match self
            .rule_service
            .sync_start(self.sync_interval, &rule.rule_id, engine.name(), force)
            .await
        {
            Ok(lock) => lock,
            Err(StorageError::SyncLocked { retry_in }) => {
                debug!(
                    "[engine {}] [rule {}] sync locked, next attempt in {:?}",
                    engine.name(),
                    rule.rule_id,
                    retry_in
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        debug!(
            "[engine {}] [rule {}] [sync {}] lock acquired, next sync in {:?}",
            engine.name(),
            rule.rule_id,
            lock.info.sync_id,
            lock.next
        );
        let mut data = RuleSyncData {
            start_time: Utc::now(),
            removed: rule.removed,
            ..Default::default()
        };
        let result = Self::run_engine(engine, rule, &lock.info).await;
        data.end_time = Utc::now();
        match &result {
            Ok(value) => {
                data.successful = true;
                if let Some(value) = value {
                    data.sync_result = value.to_string();
                }
            }
            Err(e) => data.error = e.to_string(),
        }
        if let Err(e) = self.rule_service.sync_end(&lock.info, data).await {
            error!(
                "[engine {}] [rule {}] unable to record sync end: {}",
                engine.name(),
                rule.rule_id,
                e
            );
        }
        result.map(|_| ())
    }

    async fn run_engine(
        engine: &dyn Engine,
        rule: &Rule,
        info: &RuleSyncInfo,
    ) -> Result<SyncResult, ControllerError> {
        let removal_synced = info
            .latest_sync()
            .is_some_and(|latest| latest.removed && latest.successful);
        if rule.removed && removal_synced {
            debug!(
                "[engine {}] [rule {}] removal already synced",
                engine.name(),
                rule.rule_id
            );
            return Ok(None);
        }
        engine.sync(rule).await
    }
}
