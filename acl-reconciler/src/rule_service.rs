use std::{sync::Arc, time::Duration};

use acl_reconciler_apis::{Rule, RuleSyncData, RuleSyncInfo};

use crate::{
    errors::ControllerError,
    lock_updater::LockUpdater,
    storage::{FindOpts, RuleStore, StorageError, SyncFindOpts, SyncLock, SyncStore},
};

/// Facade over rule and sync storage used by the sync coordinator.
///
/// Locks handed out by [`RuleSyncService::sync_start`] are kept alive by the
/// lock updater until the matching [`RuleSyncService::sync_end`].
pub(crate) struct RuleSyncService {
    rules: Arc<dyn RuleStore>,
    syncs: Arc<dyn SyncStore>,
    lock_updater: LockUpdater,
}

impl RuleSyncService {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        syncs: Arc<dyn SyncStore>,
        ping_interval: Duration,
    ) -> Self {
        let lock_updater = LockUpdater::start(syncs.clone(), ping_interval);
        RuleSyncService {
            rules,
            syncs,
            lock_updater,
        }
    }

    /// Validates and stores a batch of rules.
    pub async fn save_rules(&self, rules: &mut [Rule], upsert: bool) -> Result<(), ControllerError> {
        for rule in rules.iter() {
            rule.validate()?;
        }
        self.rules.save(rules, upsert).await?;
        Ok(())
    }

    pub async fn find_all_rules(&self) -> Result<Vec<Rule>, StorageError> {
        self.rules.find_all(&FindOpts::default()).await
    }

    pub async fn find_syncs(&self, rule_ids: Vec<String>) -> Result<Vec<RuleSyncInfo>, StorageError> {
        let opts = SyncFindOpts {
            rule_ids: Some(rule_ids),
            ..Default::default()
        };
        self.syncs.find(&opts).await
    }

    pub async fn sync_start(
        &self,
        after: Duration,
        rule_id: &str,
        engine: &str,
        force: bool,
    ) -> Result<SyncLock, StorageError> {
        let lock = self.syncs.start_sync(after, rule_id, engine, force).await?;
        self.lock_updater.enqueue(&lock.info.sync_id);
        Ok(lock)
    }

    pub async fn sync_end(&self, info: &RuleSyncInfo, data: RuleSyncData) -> Result<(), StorageError> {
        self.lock_updater.dequeue(&info.sync_id);
        self.syncs.end_sync(info, data).await
    }

    pub async fn stop(&self) {
        self.lock_updater.stop().await;
    }
}
