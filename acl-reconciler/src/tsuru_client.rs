//! Endpoint directory backed by the tsuru HTTP API.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use opentelemetry::{global, metrics::Histogram, KeyValue};
use reqwest::{header::ACCEPT, Url};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::{sync::Mutex, time::Instant};

use crate::utils::metric_name;

const TSURU_CLIENT: &str = "tsuru_client";
const USER_AGENT: &str = "acl-reconciler-http-client/1.0";

#[derive(thiserror::Error, Debug)]
pub(crate) enum DirectoryError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid status code {code}: {body:?}")]
    Status { code: u16, body: String },
    #[error("unable to unmarshal data {data:?}: {source}")]
    Decode {
        data: String,
        source: serde_json::Error,
    },
    #[error("empty data for app {0:?}")]
    EmptyApp(String),
    #[error("empty data for job {0:?}")]
    EmptyJob(String),
    #[error("pool {0:?} not found")]
    PoolNotFound(String),
    #[error("cluster not found")]
    ClusterNotFound,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct AppInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pool: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct JobInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pool: String,
}

#[derive(Deserialize, Debug)]
struct JobInfoResult {
    job: Option<JobInfo>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct PoolInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub provisioner: String,
}

/// Raw kubeconfig fragments embedded in a cluster record.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct ClusterKubeConfig {
    #[serde(default)]
    pub cluster: serde_json::Value,
    #[serde(default)]
    pub user: serde_json::Value,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub(crate) struct Cluster {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub provisioner: String,
    /// Base64 encoded PEM.
    #[serde(default)]
    pub cacert: Option<String>,
    #[serde(default)]
    pub clientcert: Option<String>,
    #[serde(default)]
    pub clientkey: Option<String>,
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default, rename = "kubeConfig")]
    pub kube_config: Option<ClusterKubeConfig>,
}

/// Read-only view of the platform inventory.
#[async_trait]
pub(crate) trait EndpointDirectory: Send + Sync {
    async fn app_info(&self, name: &str) -> Result<AppInfo, DirectoryError>;
    async fn job_info(&self, name: &str) -> Result<JobInfo, DirectoryError>;
    async fn pool_info(&self, name: &str) -> Result<PoolInfo, DirectoryError>;
    async fn clusters(&self) -> Result<Vec<Cluster>, DirectoryError>;
}

pub(crate) struct TsuruClient {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    request_duration: Histogram<f64>,
}

impl TsuruClient {
    pub fn new(
        url: &str,
        token: Option<String>,
        timeout: Duration,
        tls_insecure: bool,
    ) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(tls_insecure)
            .build()?;
        let request_duration = global::meter(TSURU_CLIENT)
            .f64_histogram(metric_name("external_request_duration_seconds"))
            .with_description("Duration of requests to the tsuru API")
            .with_unit("s")
            .build();
        Ok(TsuruClient {
            http,
            url: url.trim_end_matches('/').to_string(),
            token,
            request_duration,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DirectoryError> {
        let url = format!("{}/{}", self.url, path.trim_start_matches('/'));
        let host = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let mut request = self.http.get(&url).header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let start = Instant::now();
        let result = request.send().await;
        let code = match &result {
            Ok(response) => response.status().as_u16().to_string(),
            Err(_) => "error".to_string(),
        };
        self.request_duration.record(
            start.elapsed().as_secs_f64(),
            &[
                KeyValue::new("host", host),
                KeyValue::new("method", "GET"),
                KeyValue::new("code", code),
            ],
        );
        let response = result?;
        let status = response.status();
        if !(status.is_success() || status.is_redirection()) {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Status {
                code: status.as_u16(),
                body,
            });
        }
        let data = response.bytes().await?;
        serde_json::from_slice(&data).map_err(|source| DirectoryError::Decode {
            data: String::from_utf8_lossy(&data).into_owned(),
            source,
        })
    }
}

#[async_trait]
impl EndpointDirectory for TsuruClient {
    async fn app_info(&self, name: &str) -> Result<AppInfo, DirectoryError> {
        let app: AppInfo = self.get(&format!("apps/{}", name)).await?;
        if app.name.is_empty() || app.pool.is_empty() {
            return Err(DirectoryError::EmptyApp(name.to_string()));
        }
        Ok(app)
    }

    async fn job_info(&self, name: &str) -> Result<JobInfo, DirectoryError> {
        let result: JobInfoResult = self.get(&format!("jobs/{}", name)).await?;
        match result.job {
            Some(job) if !job.name.is_empty() && !job.pool.is_empty() => Ok(job),
            _ => Err(DirectoryError::EmptyJob(name.to_string())),
        }
    }

    async fn pool_info(&self, name: &str) -> Result<PoolInfo, DirectoryError> {
        let pool: PoolInfo = self.get(&format!("pools/{}", name)).await?;
        if pool.name.is_empty() {
            return Err(DirectoryError::PoolNotFound(name.to_string()));
        }
        Ok(pool)
    }

    async fn clusters(&self) -> Result<Vec<Cluster>, DirectoryError> {
        self.get("provisioner/clusters").await
    }
}

/// Lookup outcome kept by [`CachedDirectory`]; a miss holds the 404 body.
type Memo<T> = Mutex<HashMap<String, Result<T, String>>>;

/// Directory view for a single sync pass.
///
/// Every app, job and pool lookup and the cluster list are fetched at most
/// once, 404 answers included. Other failures are not remembered. A fresh
/// instance per pass picks up inventory changes.
pub(crate) struct CachedDirectory {
    inner: Arc<dyn EndpointDirectory>,
    apps: Memo<AppInfo>,
    jobs: Memo<JobInfo>,
    pools: Memo<PoolInfo>,
    clusters: Mutex<Option<Vec<Cluster>>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn EndpointDirectory>) -> Self {
        CachedDirectory {
            inner,
            apps: Default::default(),
            jobs: Default::default(),
            pools: Default::default(),
            clusters: Default::default(),
        }
    }
}

async fn memoized<T, F>(memo: &Memo<T>, name: &str, fetch: F) -> Result<T, DirectoryError>
where
    T: Clone,
    F: Future<Output = Result<T, DirectoryError>>,
{
    let mut entries = memo.lock().await;
    match entries.get(name) {
        Some(Ok(value)) => return Ok(value.clone()),
        Some(Err(body)) => {
            return Err(DirectoryError::Status {
                code: 404,
                body: body.clone(),
            });
        }
        None => (),
    }
    let result = fetch.await;
    match &result {
        Ok(value) => {
            entries.insert(name.to_string(), Ok(value.clone()));
        }
        Err(DirectoryError::Status { code: 404, body }) => {
            entries.insert(name.to_string(), Err(body.clone()));
        }
        Err(_) => (),
    }
    result
}

#[async_trait]
impl EndpointDirectory for CachedDirectory {
    async fn app_info(&self, name: &str) -> Result<AppInfo, DirectoryError> {
        memoized(&self.apps, name, self.inner.app_info(name)).await
    }

    async fn job_info(&self, name: &str) -> Result<JobInfo, DirectoryError> {
        memoized(&self.jobs, name, self.inner.job_info(name)).await
    }

    async fn pool_info(&self, name: &str) -> Result<PoolInfo, DirectoryError> {
        memoized(&self.pools, name, self.inner.pool_info(name)).await
    }

    async fn clusters(&self) -> Result<Vec<Cluster>, DirectoryError> {
        let mut cached = self.clusters.lock().await;
        if let Some(clusters) = cached.as_ref() {
            return Ok(clusters.clone());
        }
        let clusters = self.inner.clusters().await?;
        *cached = Some(clusters.clone());
        Ok(clusters)
    }
}
