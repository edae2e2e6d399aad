use std::sync::Arc;

use acl_reconciler_apis::Rule;
use async_trait::async_trait;

use crate::{errors::ControllerError, logic_cache::ResolutionCache};

/// JSON-serializable outcome of a single rule sync, recorded in the sync history.
pub(crate) type SyncResult = Option<serde_json::Value>;

/// A reconciliation strategy applied to every rule of a sync pass.
///
/// A fresh engine is built for every pass, so the batch hooks may keep state
/// on `self`.
#[async_trait]
pub(crate) trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Admission filter, rules that are not allowed are skipped before locking.
    async fn allowed(&self, _rule: &Rule) -> Result<bool, ControllerError> {
        Ok(true)
    }

    async fn before_sync(&mut self, _cache: Arc<ResolutionCache>) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn after_sync(&mut self) -> Result<(), ControllerError> {
        Ok(())
    }

    async fn sync(&self, rule: &Rule) -> Result<SyncResult, ControllerError>;
}

pub(crate) type EngineFactory = Box<dyn Fn() -> Box<dyn Engine> + Send + Sync>;

/// Engine factories enabled for this process.
#[derive(Default)]
pub(crate) struct EngineRegistry {
    factories: Vec<EngineFactory>,
}

impl EngineRegistry {
    pub fn enable_engine<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn Engine> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// One new instance of every enabled engine.
    pub fn instantiate(&self) -> Vec<Box<dyn Engine>> {
        self.factories.iter().map(|factory| factory()).collect()
    }
}
