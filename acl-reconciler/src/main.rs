#[macro_use]
extern crate log;

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use acl_reconciler_apis::Rule;
use anyhow::{Context, bail};
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

use engine::EngineRegistry;
use kubernetes::KubeConnector;
use operator::{AclOperatorEngine, AclOperatorJobEngine, ENGINE_NAME, JOB_ENGINE_NAME};
use periodic_sync::PeriodicSync;
use prometheus_exporter::start_prometheus_metrics_server;
use resolver::TargetResolver;
use rule_service::RuleSyncService;
use storage::{MemoryRuleStore, MemorySyncStore, RuleStore, SyncStore};
use sync_coordinator::SyncCoordinator;
use tsuru_client::TsuruClient;

mod engine;
mod errors;
mod kubernetes;
mod lock_updater;
mod logic_cache;
mod operator;
mod periodic_sync;
mod prometheus_exporter;
mod resolver;
mod rule_service;
mod storage;
mod sync_coordinator;
mod target_modifications;
#[cfg(test)]
mod test_utils;
mod tsuru_client;
mod utils;

/// The K8s field manager name.
const MANAGER: &str = "acl-reconciler";

#[derive(Clone, Debug)]
struct Configuration {
    tsuru_host: String,
    tsuru_token: Option<String>,
    kubernetes_namespace: String,
    engines: Vec<String>,
    sync_interval: Duration,
    sync_disabled: bool,
    lock_expire: Duration,
    lock_ping_interval: Duration,
    http_timeout: Duration,
    tls_insecure: bool,
    rules_file: Option<PathBuf>,
    shutdown_timeout: Duration,
}

impl Configuration {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_var)
    }

    fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let seconds = |name: &str, default: u64| -> anyhow::Result<Duration> {
            match lookup(name) {
                Some(v) => Ok(Duration::from_secs(
                    v.parse()
                        .with_context(|| format!("{} must be a number of seconds", name))?,
                )),
                None => Ok(Duration::from_secs(default)),
            }
        };
        let flag = |name: &str| -> anyhow::Result<bool> {
            match lookup(name) {
                Some(v) => v
                    .parse()
                    .with_context(|| format!("{} must be true or false", name)),
                None => Ok(false),
            }
        };
        let tsuru_host = lookup("TSURU_HOST").context("TSURU_HOST is required")?;
        let engines = lookup("ENGINES")
            .map(|v| {
                v.split(',')
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| vec![ENGINE_NAME.to_string()]);
        Ok(Configuration {
            tsuru_host,
            tsuru_token: lookup("TSURU_TOKEN"),
            kubernetes_namespace: lookup("KUBERNETES_NAMESPACE")
                .unwrap_or_else(|| "tsuru".to_string()),
            engines,
            sync_interval: seconds("SYNC_INTERVAL", 60)?,
            sync_disabled: flag("SYNC_DISABLED")?,
            lock_expire: seconds("SYNC_LOCK_EXPIRE", 300)?,
            lock_ping_interval: seconds("SYNC_LOCK_PING_INTERVAL", 20)?,
            http_timeout: seconds("HTTP_TIMEOUT", 60)?,
            tls_insecure: flag("TLS_INSECURE")?,
            rules_file: lookup("RULES_FILE").map(PathBuf::from),
            shutdown_timeout: seconds("SHUTDOWN_TIMEOUT", 120)?,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn engine_registry(configuration: &Configuration) -> anyhow::Result<EngineRegistry> {
    let mut registry = EngineRegistry::default();
    for name in &configuration.engines {
        let namespace = configuration.kubernetes_namespace.clone();
        match name.as_str() {
            ENGINE_NAME => {
                registry.enable_engine(move || Box::new(AclOperatorEngine::new(&namespace)))
            }
            JOB_ENGINE_NAME => {
                registry.enable_engine(move || Box::new(AclOperatorJobEngine::new(&namespace)))
            }
            other => bail!("unknown engine {:?}", other),
        }
        debug!("engine {} enabled", name);
    }
    if registry.is_empty() {
        bail!("no engines enabled");
    }
    info!("{} engines enabled", registry.len());
    Ok(registry)
}

async fn load_rules(path: &Path, rule_service: &RuleSyncService) -> anyhow::Result<usize> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("unable to read rules file {}", path.display()))?;
    let mut rules: Vec<Rule> = serde_json::from_slice(&data)
        .with_context(|| format!("invalid rules file {}", path.display()))?;
    rule_service.save_rules(&mut rules, true).await?;
    Ok(rules.len())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr: SocketAddr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
    let prometheus_registry = Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(prometheus_registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider.clone());
    let metrics_server = start_prometheus_metrics_server(metrics_addr, prometheus_registry);

    let configuration = Configuration::from_env()?;
    let rule_store: Arc<dyn RuleStore> = Arc::new(MemoryRuleStore::default());
    let sync_store: Arc<dyn SyncStore> = Arc::new(MemorySyncStore::default());
    let previous = sync_store.set_lock_expire_time(configuration.lock_expire);
    debug!(
        "sync lock expiry set to {:?}, was {:?}",
        configuration.lock_expire, previous
    );
    let rule_service = Arc::new(RuleSyncService::new(
        rule_store,
        sync_store,
        configuration.lock_ping_interval,
    ));
    if let Some(path) = &configuration.rules_file {
        let count = load_rules(path, &rule_service).await?;
        info!("loaded {} rules from {}", count, path.display());
    }

    let directory = Arc::new(TsuruClient::new(
        &configuration.tsuru_host,
        configuration.tsuru_token.clone(),
        configuration.http_timeout,
        configuration.tls_insecure,
    )?);
    let connector = Arc::new(KubeConnector::new(configuration.http_timeout));
    let resolver = Arc::new(TargetResolver::new(directory, connector));
    let registry = Arc::new(engine_registry(&configuration)?);
    let coordinator = SyncCoordinator::new(
        registry,
        resolver,
        rule_service.clone(),
        configuration.sync_interval,
    );
    let periodic_sync = Arc::new(PeriodicSync::new(
        coordinator,
        rule_service.clone(),
        configuration.sync_interval,
        configuration.sync_disabled,
    ));
    let runner = {
        let periodic_sync = periodic_sync.clone();
        tokio::spawn(async move { periodic_sync.run().await })
    };

    info!("start sync loop ...");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            if let Err(e) = periodic_sync.shutdown(configuration.shutdown_timeout).await {
                warn!("{}", e);
            }
        }
        result = metrics_server => {
            if let Err(e) = result {
                error!("metrics server error: {}", e);
            }
        }
    };
    runner.abort();
    rule_service.stop().await;
    if let Err(e) = meter_provider.shutdown() {
        warn!("unable to shut down meter provider: {}", e);
    }
    Ok(())
}
