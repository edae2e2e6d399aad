//! Access to the objects the reconciler touches in workload clusters.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use kube::{
    api::{ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config,
};
use serde_json::{json, Map, Value};

use crate::{
    errors::{ControllerError, ExtKubeApiError},
    tsuru_client::Cluster,
    MANAGER,
};

/// Kinds of objects the reconciliation engines annotate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TargetKind {
    /// `tsuru.io/v1 App`
    App,
    /// `batch/v1 CronJob`, the workload backing a tsuru job.
    CronJob,
}

impl TargetKind {
    pub fn gvk(&self) -> GroupVersionKind {
        match self {
            TargetKind::App => GroupVersionKind::gvk("tsuru.io", "v1", "App"),
            TargetKind::CronJob => GroupVersionKind::gvk("batch", "v1", "CronJob"),
        }
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&self.gvk())
    }
}

#[async_trait]
pub(crate) trait TargetClient: Send + Sync {
    /// Fetches the object, `None` if it does not exist.
    async fn get(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ControllerError>;

    /// Applies a JSON merge patch to the object.
    async fn merge_patch(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ControllerError>;
}

pub(crate) struct KubeTargetClient {
    client: Client,
}

impl KubeTargetClient {
    fn api(&self, kind: TargetKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl TargetClient for KubeTargetClient {
    async fn get(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ControllerError> {
        match self.api(kind, namespace).get(name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn merge_patch(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ControllerError> {
        let mut pp = PatchParams::default();
        pp.field_manager = Some(MANAGER.to_string());
        self.api(kind, namespace)
            .patch(name, &pp, &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

/// Builds clients for clusters listed by the endpoint directory.
#[async_trait]
pub(crate) trait ClusterConnector: Send + Sync {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn TargetClient>, ControllerError>;
}

pub(crate) struct KubeConnector {
    timeout: Duration,
}

impl KubeConnector {
    pub fn new(timeout: Duration) -> Self {
        KubeConnector { timeout }
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn TargetClient>, ControllerError> {
        let kubeconfig = kubeconfig_for(cluster)?;
        let mut config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        config.read_timeout = Some(self.timeout);
        let client = Client::try_from(config)?;
        debug!("connected to cluster {}", cluster.name);
        Ok(Arc::new(KubeTargetClient { client }))
    }
}

/// Client configuration for a cluster record.
///
/// An embedded kubeconfig wins. Otherwise the first address is used together
/// with the record's certificates and the credentials in its custom data,
/// where username and password take precedence over a token.
pub(crate) fn kubeconfig_for(cluster: &Cluster) -> Result<Kubeconfig, ControllerError> {
    let (cluster_entry, user_entry) = match &cluster.kube_config {
        Some(embedded) => (embedded.cluster.clone(), embedded.user.clone()),
        None => {
            let address = cluster
                .addresses
                .first()
                .ok_or_else(|| ControllerError::NoClusterAddress(cluster.name.clone()))?;
            let mut entry = Map::new();
            entry.insert("server".to_string(), json!(address));
            if let Some(ca) = cluster.cacert.as_ref().filter(|v| !v.is_empty()) {
                entry.insert("certificate-authority-data".to_string(), json!(ca));
            }
            let mut user = Map::new();
            if let Some(cert) = cluster.clientcert.as_ref().filter(|v| !v.is_empty()) {
                user.insert("client-certificate-data".to_string(), json!(cert));
            }
            if let Some(key) = cluster.clientkey.as_ref().filter(|v| !v.is_empty()) {
                user.insert("client-key-data".to_string(), json!(key));
            }
            let custom = |key: &str| cluster.custom_data.get(key).filter(|v| !v.is_empty());
            match (custom("username"), custom("password"), custom("token")) {
                (Some(username), Some(password), _) => {
                    user.insert("username".to_string(), json!(username));
                    user.insert("password".to_string(), json!(password));
                }
                (_, _, Some(token)) => {
                    user.insert("token".to_string(), json!(token));
                }
                _ => (),
            }
            (Value::Object(entry), Value::Object(user))
        }
    };
    let name = &cluster.name;
    let raw = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": name,
        "clusters": [{"name": name, "cluster": cluster_entry}],
        "users": [{"name": name, "user": user_entry}],
        "contexts": [{"name": name, "context": {"cluster": name, "user": name}}],
    });
    Ok(serde_json::from_value(raw)?)
}
