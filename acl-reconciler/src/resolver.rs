use std::sync::Arc;

use acl_reconciler_apis::{RuleType, TsuruAppRule, TsuruJobRule};

use crate::{
    errors::ControllerError,
    kubernetes::{ClusterConnector, TargetClient},
    tsuru_client::{CachedDirectory, Cluster, DirectoryError, EndpointDirectory, PoolInfo},
};

pub(crate) const KUBERNETES_PROVISIONER: &str = "kubernetes";

/// Where a rule endpoint runs.
pub(crate) struct ResolvedTarget {
    pub cluster: String,
    pub pool: String,
    pub client: Arc<dyn TargetClient>,
}

/// Maps endpoint descriptors to the cluster hosting them.
pub(crate) struct TargetResolver {
    directory: Arc<dyn EndpointDirectory>,
    connector: Arc<dyn ClusterConnector>,
}

impl TargetResolver {
    pub fn new(directory: Arc<dyn EndpointDirectory>, connector: Arc<dyn ClusterConnector>) -> Self {
        TargetResolver {
            directory,
            connector,
        }
    }

    /// A resolver for one sync pass, with its own directory memo.
    pub fn for_pass(&self) -> TargetResolver {
        TargetResolver {
            directory: Arc::new(CachedDirectory::new(self.directory.clone())),
            connector: self.connector.clone(),
        }
    }

    /// `None` when the endpoint is not something running on a kubernetes pool.
    pub async fn resolve(
        &self,
        descriptor: &RuleType,
    ) -> Result<Option<ResolvedTarget>, ControllerError> {
        let pool_name = match descriptor {
            RuleType::TsuruApp(app) => self.app_pool(app).await?,
            RuleType::TsuruJob(job) => self.job_pool(job).await?,
            RuleType::ExternalDns(_) | RuleType::ExternalIp(_) => return Ok(None),
        };
        let pool = self.directory.pool_info(&pool_name).await?;
        if pool.provisioner != KUBERNETES_PROVISIONER {
            debug!(
                "pool {} uses provisioner {:?}, ignoring {}",
                pool.name, pool.provisioner, descriptor
            );
            return Ok(None);
        }
        let clusters = self.directory.clusters().await?;
        let cluster = pool_cluster(&pool, &clusters).ok_or(DirectoryError::ClusterNotFound)?;
        let client = self.connector.connect(cluster).await?;
        Ok(Some(ResolvedTarget {
            cluster: cluster.name.clone(),
            pool: pool.name,
            client,
        }))
    }

    async fn app_pool(&self, app: &TsuruAppRule) -> Result<String, ControllerError> {
        if !app.app_name.is_empty() {
            return Ok(self.directory.app_info(&app.app_name).await?.pool);
        }
        if !app.pool_name.is_empty() {
            return Ok(app.pool_name.clone());
        }
        Err(ControllerError::EmptyRule)
    }

    async fn job_pool(&self, job: &TsuruJobRule) -> Result<String, ControllerError> {
        if job.job_name.is_empty() {
            return Err(ControllerError::EmptyRule);
        }
        Ok(self.directory.job_info(&job.job_name).await?.pool)
    }
}

/// The kubernetes cluster serving `pool`: one listing the pool, else the default one.
pub(crate) fn pool_cluster<'a>(pool: &PoolInfo, clusters: &'a [Cluster]) -> Option<&'a Cluster> {
    let kubernetes = || clusters.iter().filter(|c| c.provisioner == KUBERNETES_PROVISIONER);
    kubernetes()
        .find(|c| c.pools.iter().any(|p| p == &pool.name))
        .or_else(|| kubernetes().find(|c| c.default))
}
