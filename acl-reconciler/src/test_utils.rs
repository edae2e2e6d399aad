//! Fakes shared by the unit tests.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use acl_reconciler_apis::{ExternalDnsRule, ProtoPort, Rule, RuleType, TsuruAppRule, TsuruJobRule};
use async_trait::async_trait;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kube::{api::DynamicObject, ResourceExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::{
    engine::{Engine, SyncResult},
    errors::ControllerError,
    kubernetes::{ClusterConnector, TargetClient, TargetKind},
    resolver::KUBERNETES_PROVISIONER,
    tsuru_client::{AppInfo, Cluster, DirectoryError, EndpointDirectory, JobInfo, PoolInfo},
};

pub(crate) fn app(name: &str) -> RuleType {
    RuleType::TsuruApp(TsuruAppRule {
        app_name: name.to_string(),
        pool_name: String::new(),
    })
}

pub(crate) fn external_dns(name: &str) -> RuleType {
    RuleType::ExternalDns(ExternalDnsRule {
        name: name.to_string(),
        ports: vec![ProtoPort::new("TCP", 443)],
        sync_whole_network: false,
    })
}

pub(crate) fn app_rule(name: &str) -> Rule {
    Rule::new(app(name), external_dns("example.com"))
}

pub(crate) fn job_rule(name: &str) -> Rule {
    Rule::new(
        RuleType::TsuruJob(TsuruJobRule {
            job_name: name.to_string(),
        }),
        external_dns("example.com"),
    )
}

pub(crate) fn cluster(name: &str, default: bool, pools: &[&str]) -> Cluster {
    Cluster {
        name: name.to_string(),
        addresses: vec![format!("https://{}:6443", name)],
        provisioner: KUBERNETES_PROVISIONER.to_string(),
        pools: pools.iter().map(|p| p.to_string()).collect(),
        default,
        ..Default::default()
    }
}

fn not_found(what: &str) -> DirectoryError {
    DirectoryError::Status {
        code: 404,
        body: format!("{} not found", what),
    }
}

/// App whose lookups fail with a server error.
pub(crate) const UNAVAILABLE_APP: &str = "unavailable";

/// In-memory endpoint directory counting every lookup.
#[derive(Default)]
pub(crate) struct FakeDirectory {
    pub apps: HashMap<String, String>,
    pub jobs: HashMap<String, String>,
    pub pools: HashMap<String, String>,
    pub clusters: Mutex<Vec<Cluster>>,
    pub calls: AtomicUsize,
}

impl FakeDirectory {
    /// `app1` and `job1` on kubernetes pool `p1` served by cluster `c1`,
    /// `legacy-app` on pool `legacy` using another provisioner.
    pub fn standard() -> Self {
        FakeDirectory {
            apps: HashMap::from([
                ("app1".to_string(), "p1".to_string()),
                ("legacy-app".to_string(), "legacy".to_string()),
            ]),
            jobs: HashMap::from([("job1".to_string(), "p1".to_string())]),
            pools: HashMap::from([
                ("p1".to_string(), KUBERNETES_PROVISIONER.to_string()),
                ("legacy".to_string(), "docker".to_string()),
            ]),
            clusters: Mutex::new(vec![cluster("c1", true, &["p1"])]),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_clusters(&self, clusters: Vec<Cluster>) {
        *self.clusters.lock().unwrap() = clusters;
    }
}

#[async_trait]
impl EndpointDirectory for FakeDirectory {
    async fn app_info(&self, name: &str) -> Result<AppInfo, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if name == UNAVAILABLE_APP {
            return Err(DirectoryError::Status {
                code: 503,
                body: "unavailable".to_string(),
            });
        }
        let pool = self.apps.get(name).ok_or_else(|| not_found("app"))?;
        Ok(AppInfo {
            name: name.to_string(),
            pool: pool.clone(),
        })
    }

    async fn job_info(&self, name: &str) -> Result<JobInfo, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pool = self.jobs.get(name).ok_or_else(|| not_found("job"))?;
        Ok(JobInfo {
            name: name.to_string(),
            pool: pool.clone(),
        })
    }

    async fn pool_info(&self, name: &str) -> Result<PoolInfo, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let provisioner = self.pools.get(name).ok_or_else(|| not_found("pool"))?;
        Ok(PoolInfo {
            name: name.to_string(),
            provisioner: provisioner.clone(),
        })
    }

    async fn clusters(&self) -> Result<Vec<Cluster>, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.clusters.lock().unwrap().clone())
    }
}

type ObjectKey = (TargetKind, String, String);

/// In-memory target objects, patches are applied with `json_patch::merge`.
#[derive(Default)]
pub(crate) struct FakeTargets {
    objects: Mutex<HashMap<ObjectKey, DynamicObject>>,
    pub patches: AtomicUsize,
}

impl FakeTargets {
    pub fn insert(&self, kind: TargetKind, object: DynamicObject) {
        let key = (kind, object.namespace().unwrap_or_default(), object.name_any());
        self.objects.lock().unwrap().insert(key, object);
    }

    pub fn object(&self, kind: TargetKind, namespace: &str, name: &str) -> Option<DynamicObject> {
        let key = (kind, namespace.to_string(), name.to_string());
        self.objects.lock().unwrap().get(&key).cloned()
    }
}

#[async_trait]
impl TargetClient for FakeTargets {
    async fn get(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, ControllerError> {
        Ok(self.object(kind, namespace, name))
    }

    async fn merge_patch(
        &self,
        kind: TargetKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), ControllerError> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        let key = (kind, namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().unwrap();
        let object = objects.get_mut(&key).expect("patched object exists");
        let mut document = serde_json::to_value(&*object)?;
        json_patch::merge(&mut document, patch);
        *object = serde_json::from_value(document)?;
        Ok(())
    }
}

/// Hands out the same fake target client for every cluster.
pub(crate) struct FakeConnector {
    pub targets: Arc<FakeTargets>,
    pub connects: AtomicUsize,
}

impl FakeConnector {
    pub fn with_targets(targets: Arc<FakeTargets>) -> Self {
        FakeConnector {
            targets,
            connects: AtomicUsize::new(0),
        }
    }
}

impl Default for FakeConnector {
    fn default() -> Self {
        FakeConnector::with_targets(Arc::new(FakeTargets::default()))
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, _cluster: &Cluster) -> Result<Arc<dyn TargetClient>, ControllerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.targets.clone() as Arc<dyn TargetClient>)
    }
}

/// Engine recording the rules it synced. Clones share their records.
#[derive(Clone)]
pub(crate) struct RecordingEngine {
    name: String,
    fail_on: Option<String>,
    disallow: Option<String>,
    synced: Arc<Mutex<Vec<String>>>,
    pub before: Arc<AtomicUsize>,
    pub after: Arc<AtomicUsize>,
}

impl RecordingEngine {
    pub fn new(name: &str) -> Self {
        RecordingEngine {
            name: name.to_string(),
            fail_on: None,
            disallow: None,
            synced: Default::default(),
            before: Default::default(),
            after: Default::default(),
        }
    }

    pub fn failing_on(mut self, rule_id: &str) -> Self {
        self.fail_on = Some(rule_id.to_string());
        self
    }

    pub fn disallowing(mut self, rule_id: &str) -> Self {
        self.disallow = Some(rule_id.to_string());
        self
    }

    pub fn synced(&self) -> Vec<String> {
        self.synced.lock().unwrap().clone()
    }
}

#[async_trait]
impl Engine for RecordingEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn allowed(&self, rule: &Rule) -> Result<bool, ControllerError> {
        Ok(self.disallow.as_ref() != Some(&rule.rule_id))
    }

    async fn before_sync(
        &mut self,
        _cache: Arc<crate::logic_cache::ResolutionCache>,
    ) -> Result<(), ControllerError> {
        self.before.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn after_sync(&mut self) -> Result<(), ControllerError> {
        self.after.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync(&self, rule: &Rule) -> Result<SyncResult, ControllerError> {
        self.synced.lock().unwrap().push(rule.rule_id.clone());
        if self.fail_on.as_ref() == Some(&rule.rule_id) {
            return Err(DirectoryError::Status {
                code: 500,
                body: "boom".to_string(),
            }
            .into());
        }
        Ok(Some(json!(format!("synced {}", rule.rule_id))))
    }
}

/// Serves fixed responses keyed by request path, unknown paths get a 404.
/// Returns the base url and a request counter.
pub(crate) async fn serve_routes(
    routes: HashMap<String, (u16, String)>,
) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let routes = routes.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (code, body) = routes
                        .get(req.uri().path())
                        .cloned()
                        .unwrap_or((404, "not found".to_string()));
                    let mut response = Response::new(Full::new(Bytes::from(body)));
                    *response.status_mut() = StatusCode::from_u16(code).unwrap();
                    async move { Ok::<_, Infallible>(response) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (format!("http://{}", addr), hits)
}
