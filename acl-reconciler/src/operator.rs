//! Engines nudging the in-cluster ACL operator.
//!
//! The operator recomputes network policies for a workload whenever the
//! workload object changes. These engines only stamp an annotation on the
//! workload, rate limited per target, so the operator picks up rule changes.

use std::sync::Arc;

use acl_reconciler_apis::Rule;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use kube::ResourceExt;
use serde_json::json;

use crate::{
    engine::{Engine, SyncResult},
    errors::ControllerError,
    kubernetes::{TargetClient, TargetKind},
    logic_cache::ResolutionCache,
    target_modifications::TargetModifications,
};

pub(crate) const ENGINE_NAME: &str = "acl-operator";
pub(crate) const JOB_ENGINE_NAME: &str = "acl-operator-job";

pub(crate) const LAST_UPDATED_ANNOTATION: &str = "acl-api.tsuru.io/last-updated";

/// Rules created less than this before the last stamp still trigger a new one.
const GRACE_WINDOW: TimeDelta = TimeDelta::minutes(1);
/// Minimum time between two stamps on the same target.
const COOLDOWN_WINDOW: TimeDelta = TimeDelta::minutes(1);

/// Whether a target stamped at `last_updated` must be stamped again for a rule created at `created`.
pub(crate) fn needs_update(
    last_updated: Option<&str>,
    created: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let Some(last_updated) = last_updated.filter(|v| !v.is_empty()) else {
        return true;
    };
    let Ok(last_updated) = DateTime::parse_from_rfc3339(last_updated) else {
        return true;
    };
    let last_updated = last_updated.with_timezone(&Utc);
    created + GRACE_WINDOW > last_updated || now > last_updated + COOLDOWN_WINDOW
}

async fn stamp_target(
    engine: &str,
    client: &dyn TargetClient,
    kind: TargetKind,
    namespace: &str,
    name: &str,
    rule: &Rule,
) -> Result<SyncResult, ControllerError> {
    let Some(current) = client.get(kind, namespace, name).await? else {
        debug!("[{}] {:?} {}/{} not found", engine, kind, namespace, name);
        return Ok(None);
    };
    let now = Utc::now();
    let mut target = TargetModifications::new(current);
    let last_updated = target.annotations().get(LAST_UPDATED_ANNOTATION).cloned();
    if !needs_update(last_updated.as_deref(), rule.created, now) {
        return Ok(Some(json!(format!("triggered {} in the last minute", engine))));
    }
    target.annotations_mut().insert(
        LAST_UPDATED_ANNOTATION.to_string(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    if let Some(patch) = target.merge_patch()? {
        client.merge_patch(kind, namespace, name, &patch).await?;
    }
    Ok(Some(json!(format!("triggered {}", engine))))
}

fn resolution_cache<'a>(
    engine: &str,
    cache: &'a Option<Arc<ResolutionCache>>,
) -> Result<&'a ResolutionCache, ControllerError> {
    cache
        .as_deref()
        .ok_or_else(|| ControllerError::MissingResolutionCache(engine.to_string()))
}

/// Stamps the `App` object of the rule's source application.
pub(crate) struct AclOperatorEngine {
    namespace: String,
    cache: Option<Arc<ResolutionCache>>,
}

impl AclOperatorEngine {
    pub fn new(namespace: &str) -> Self {
        AclOperatorEngine {
            namespace: namespace.to_string(),
            cache: None,
        }
    }
}

#[async_trait]
impl Engine for AclOperatorEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    async fn before_sync(&mut self, cache: Arc<ResolutionCache>) -> Result<(), ControllerError> {
        self.cache = Some(cache);
        Ok(())
    }

    async fn after_sync(&mut self) -> Result<(), ControllerError> {
        self.cache = None;
        Ok(())
    }

    async fn sync(&self, rule: &Rule) -> Result<SyncResult, ControllerError> {
        let Some(app) = rule.source.tsuru_app() else {
            return Ok(None);
        };
        if app.app_name.is_empty() {
            debug!("[{}] ignoring pool wide rule {}", ENGINE_NAME, rule.rule_id);
            return Ok(None);
        }
        let cache = resolution_cache(ENGINE_NAME, &self.cache)?;
        let Some(target) = cache.get_or_resolve(&rule.source).await? else {
            debug!("[{}] {} is not running on kubernetes", ENGINE_NAME, rule.source);
            return Ok(None);
        };
        debug!("[{}] {} runs on cluster {}", ENGINE_NAME, rule.source, target.cluster);
        stamp_target(
            ENGINE_NAME,
            target.client.as_ref(),
            TargetKind::App,
            &self.namespace,
            &app.app_name,
            rule,
        )
        .await
    }
}

/// Stamps the `CronJob` backing the rule's source job, in the namespace of the job's pool.
pub(crate) struct AclOperatorJobEngine {
    namespace: String,
    cache: Option<Arc<ResolutionCache>>,
}

impl AclOperatorJobEngine {
    pub fn new(namespace: &str) -> Self {
        AclOperatorJobEngine {
            namespace: namespace.to_string(),
            cache: None,
        }
    }
}

#[async_trait]
impl Engine for AclOperatorJobEngine {
    fn name(&self) -> &str {
        JOB_ENGINE_NAME
    }

    async fn before_sync(&mut self, cache: Arc<ResolutionCache>) -> Result<(), ControllerError> {
        self.cache = Some(cache);
        Ok(())
    }

    async fn after_sync(&mut self) -> Result<(), ControllerError> {
        self.cache = None;
        Ok(())
    }

    async fn sync(&self, rule: &Rule) -> Result<SyncResult, ControllerError> {
        let Some(job) = rule.source.tsuru_job() else {
            return Ok(None);
        };
        let cache = resolution_cache(JOB_ENGINE_NAME, &self.cache)?;
        let Some(target) = cache.get_or_resolve(&rule.source).await? else {
            debug!("[{}] {} is not running on kubernetes", JOB_ENGINE_NAME, rule.source);
            return Ok(None);
        };
        let namespace = format!("{}-{}", self.namespace, target.pool);
        stamp_target(
            JOB_ENGINE_NAME,
            target.client.as_ref(),
            TargetKind::CronJob,
            &namespace,
            &job.job_name,
            rule,
        )
        .await
    }
}
