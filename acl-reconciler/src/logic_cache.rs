use std::{collections::HashMap, sync::Arc};

use acl_reconciler_apis::RuleType;
use tokio::sync::Mutex;

use crate::{
    errors::ControllerError,
    resolver::{ResolvedTarget, TargetResolver},
};

/// Per-batch memo of resolved endpoints, shared by every engine of one sync pass.
///
/// Successful resolutions are cached, absent results included. Errors are not,
/// though the pass directory still remembers endpoints that were not found.
pub(crate) struct ResolutionCache {
    resolver: TargetResolver,
    entries: Mutex<HashMap<String, Option<Arc<ResolvedTarget>>>>,
}

impl ResolutionCache {
    pub fn new(resolver: Arc<TargetResolver>) -> Self {
        ResolutionCache {
            resolver: resolver.for_pass(),
            entries: Default::default(),
        }
    }

    pub async fn get_or_resolve(
        &self,
        descriptor: &RuleType,
    ) -> Result<Option<Arc<ResolvedTarget>>, ControllerError> {
        let key = descriptor.cache_key()?;
        // Held across resolution so concurrent engines resolve each key once.
        let mut entries = self.entries.lock().await;
        if let Some(cached) = entries.get(&key) {
            return Ok(cached.clone());
        }
        let resolved = self.resolver.resolve(descriptor).await?.map(Arc::new);
        entries.insert(key, resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        app, cluster, job_rule, FakeConnector, FakeDirectory, UNAVAILABLE_APP,
    };
    use futures::future::join_all;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn resolves_each_descriptor_once() {
        let directory = Arc::new(FakeDirectory::standard());
        let connector = Arc::new(FakeConnector::default());
        let cache = ResolutionCache::new(Arc::new(TargetResolver::new(
            directory.clone(),
            connector.clone(),
        )));

        let first = cache.get_or_resolve(&app("app1")).await.unwrap().unwrap();
        let calls = directory.calls.load(Ordering::SeqCst);
        let second = cache.get_or_resolve(&app("app1")).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls, directory.calls.load(Ordering::SeqCst));
        assert_eq!(1, connector.connects.load(Ordering::SeqCst));

        assert!(cache.get_or_resolve(&app("legacy-app")).await.unwrap().is_none());
        let calls = directory.calls.load(Ordering::SeqCst);
        assert!(cache.get_or_resolve(&app("legacy-app")).await.unwrap().is_none());
        assert_eq!(calls, directory.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let directory = Arc::new(FakeDirectory::standard());
        let cache = ResolutionCache::new(Arc::new(TargetResolver::new(
            directory.clone(),
            Arc::new(FakeConnector::default()),
        )));
        assert!(cache.get_or_resolve(&app(UNAVAILABLE_APP)).await.is_err());
        let calls = directory.calls.load(Ordering::SeqCst);
        assert!(cache.get_or_resolve(&app(UNAVAILABLE_APP)).await.is_err());
        assert!(directory.calls.load(Ordering::SeqCst) > calls);
    }

    #[tokio::test]
    async fn missing_endpoint_is_looked_up_once_per_pass() {
        let directory = Arc::new(FakeDirectory::standard());
        let resolver = Arc::new(TargetResolver::new(
            directory.clone(),
            Arc::new(FakeConnector::default()),
        ));
        let cache = ResolutionCache::new(resolver.clone());
        assert!(cache.get_or_resolve(&app("missing")).await.is_err());
        assert!(cache.get_or_resolve(&app("missing")).await.is_err());
        assert_eq!(1, directory.calls.load(Ordering::SeqCst));

        let next_pass = ResolutionCache::new(resolver);
        assert!(next_pass.get_or_resolve(&app("missing")).await.is_err());
        assert_eq!(2, directory.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pool_lookups_are_shared_within_a_pass() {
        let mut directory = FakeDirectory::standard();
        directory.apps.insert("app2".to_string(), "p1".to_string());
        let directory = Arc::new(directory);
        let cache = ResolutionCache::new(Arc::new(TargetResolver::new(
            directory.clone(),
            Arc::new(FakeConnector::default()),
        )));
        cache.get_or_resolve(&app("app1")).await.unwrap().unwrap();
        cache.get_or_resolve(&app("app2")).await.unwrap().unwrap();
        // app1, app2, pool p1, clusters
        assert_eq!(4, directory.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn each_pass_sees_current_clusters() {
        let directory = Arc::new(FakeDirectory::standard());
        let resolver = Arc::new(TargetResolver::new(
            directory.clone(),
            Arc::new(FakeConnector::default()),
        ));
        let first = ResolutionCache::new(resolver.clone());
        let target = first.get_or_resolve(&app("app1")).await.unwrap().unwrap();
        assert_eq!("c1", target.cluster);

        directory.set_clusters(vec![cluster("c2", true, &["p1"])]);
        let job = job_rule("job1").source;
        assert_eq!("c1", first.get_or_resolve(&job).await.unwrap().unwrap().cluster);

        let second = ResolutionCache::new(resolver);
        assert_eq!("c2", second.get_or_resolve(&app("app1")).await.unwrap().unwrap().cluster);
        assert_eq!("c2", second.get_or_resolve(&job).await.unwrap().unwrap().cluster);
    }

    #[tokio::test]
    async fn concurrent_engines_resolve_once() {
        let directory = Arc::new(FakeDirectory::standard());
        let connector = Arc::new(FakeConnector::default());
        let cache = Arc::new(ResolutionCache::new(Arc::new(TargetResolver::new(
            directory.clone(),
            connector.clone(),
        ))));
        let tasks = (0..2).map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_resolve(&app("app1")).await })
        });
        let targets: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().unwrap())
            .collect();
        assert!(Arc::ptr_eq(&targets[0], &targets[1]));
        assert_eq!(1, connector.connects.load(Ordering::SeqCst));
        // app1, pool p1, clusters
        assert_eq!(3, directory.calls.load(Ordering::SeqCst));
    }
}
