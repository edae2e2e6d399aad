//! Persistence seams for rules and per-(rule, engine) sync records.
//!
//! The in-memory implementations hold every guarantee the reconciler relies on:
//! the check-and-set in [`SyncStore::start_sync`] happens under a single lock,
//! so concurrent callers racing on the same pair see exactly one winner.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use acl_reconciler_apis::{Rule, RuleSyncData, RuleSyncInfo, SYNC_HISTORY_LIMIT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Lock expiry used until [`SyncStore::set_lock_expire_time`] is called.
pub(crate) const DEFAULT_LOCK_EXPIRE: Duration = Duration::from_secs(5 * 60);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum StorageError {
    #[error("rule not found")]
    RuleNotFound,
    #[error("instance already exists")]
    InstanceAlreadyExists,
    /// Another worker holds the lock or the last sync is too recent.
    #[error("sync already locked, retry in {retry_in:?}")]
    SyncLocked { retry_in: Duration },
}

/// A granted sync lock.
#[derive(Debug, Clone)]
pub(crate) struct SyncLock {
    /// Suggested delay until the next attempt for this pair.
    pub next: Duration,
    pub info: RuleSyncInfo,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FindOpts {
    pub metadata: BTreeMap<String, String>,
    pub creator: Option<String>,
    pub source_tsuru_app: Option<String>,
    pub source_tsuru_job: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DeleteOpts {
    pub id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SyncFindOpts {
    pub rule_ids: Option<Vec<String>>,
    pub engines: Option<Vec<String>>,
    /// Zero means unlimited.
    pub limit: usize,
}

#[async_trait]
pub(crate) trait RuleStore: Send + Sync {
    /// Looks a rule up by id or by name.
    async fn find(&self, id: &str) -> Result<Rule, StorageError>;
    /// Stores the batch, assigning ids and creation times.
    async fn save(&self, rules: &mut [Rule], upsert: bool) -> Result<(), StorageError>;
    /// Lists rules matching all given filters, ordered by id.
    async fn find_all(&self, opts: &FindOpts) -> Result<Vec<Rule>, StorageError>;
    /// Soft delete: matching rules are flagged as removed.
    async fn delete(&self, opts: &DeleteOpts) -> Result<(), StorageError>;
}

#[async_trait]
pub(crate) trait SyncStore: Send + Sync {
    /// Sync records matching the filter, most recently started first.
    async fn find(&self, opts: &SyncFindOpts) -> Result<Vec<RuleSyncInfo>, StorageError>;
    /// Atomically acquires the (rule, engine) lock.
    ///
    /// Unless `force` is set the lock is only granted when the previous sync
    /// finished at least `after` ago, or when a running holder stopped pinging
    /// for longer than the lock expiry.
    async fn start_sync(
        &self,
        after: Duration,
        rule_id: &str,
        engine: &str,
        force: bool,
    ) -> Result<SyncLock, StorageError>;
    /// Refreshes the liveness timestamp of the given locks.
    async fn ping_syncs(&self, sync_ids: &[String]) -> Result<(), StorageError>;
    /// Releases the lock and appends `data` to the bounded history.
    async fn end_sync(&self, info: &RuleSyncInfo, data: RuleSyncData) -> Result<(), StorageError>;
    /// Replaces the lock expiry, returning the previous value.
    fn set_lock_expire_time(&self, expire: Duration) -> Duration;
}

fn metadata_matches(metadata: &BTreeMap<String, String>, filter: &BTreeMap<String, String>) -> bool {
    filter.iter().all(|(k, v)| metadata.get(k) == Some(v))
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[derive(Default)]
pub(crate) struct MemoryRuleStore {
    rules: RwLock<BTreeMap<String, Rule>>,
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn find(&self, id: &str) -> Result<Rule, StorageError> {
        let rules = self.rules.read().await;
        rules
            .get(id)
            .or_else(|| rules.values().find(|r| !r.rule_name.is_empty() && r.rule_name == id))
            .cloned()
            .ok_or(StorageError::RuleNotFound)
    }

    async fn save(&self, rules: &mut [Rule], upsert: bool) -> Result<(), StorageError> {
        let mut stored = self.rules.write().await;
        let now = Utc::now();
        for rule in rules.iter_mut() {
            if rule.rule_id.is_empty() {
                rule.rule_id = Uuid::new_v4().to_string();
            }
            rule.created = now;
        }
        let mut batch_ids = HashSet::new();
        for rule in rules.iter() {
            if !batch_ids.insert(rule.rule_id.as_str()) {
                return Err(StorageError::InstanceAlreadyExists);
            }
            if !upsert && stored.contains_key(&rule.rule_id) {
                return Err(StorageError::InstanceAlreadyExists);
            }
            let name_taken = !rule.rule_name.is_empty()
                && stored
                    .values()
                    .any(|r| r.rule_name == rule.rule_name && r.rule_id != rule.rule_id);
            if name_taken {
                return Err(StorageError::InstanceAlreadyExists);
            }
        }
        for rule in rules.iter() {
            stored.insert(rule.rule_id.clone(), rule.clone());
        }
        Ok(())
    }

    async fn find_all(&self, opts: &FindOpts) -> Result<Vec<Rule>, StorageError> {
        let rules = self.rules.read().await;
        Ok(rules
            .values()
            .filter(|r| metadata_matches(&r.metadata, &opts.metadata))
            .filter(|r| opts.creator.as_ref().is_none_or(|c| &r.creator == c))
            .filter(|r| {
                opts.source_tsuru_app
                    .as_ref()
                    .is_none_or(|app| r.source.tsuru_app().is_some_and(|a| &a.app_name == app))
            })
            .filter(|r| {
                opts.source_tsuru_job
                    .as_ref()
                    .is_none_or(|job| r.source.tsuru_job().is_some_and(|j| &j.job_name == job))
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, opts: &DeleteOpts) -> Result<(), StorageError> {
        let mut rules = self.rules.write().await;
        let mut modified = 0;
        for rule in rules.values_mut() {
            if opts.id.as_ref().is_some_and(|id| &rule.rule_id != id) {
                continue;
            }
            if !metadata_matches(&rule.metadata, &opts.metadata) || rule.removed {
                continue;
            }
            rule.removed = true;
            modified += 1;
        }
        if modified == 0 {
            return Err(StorageError::RuleNotFound);
        }
        Ok(())
    }
}

pub(crate) struct MemorySyncStore {
    records: Mutex<HashMap<(String, String), RuleSyncInfo>>,
    lock_expire_millis: AtomicU64,
}

impl MemorySyncStore {
    pub fn new(lock_expire: Duration) -> Self {
        MemorySyncStore {
            records: Default::default(),
            lock_expire_millis: AtomicU64::new(lock_expire.as_millis() as u64),
        }
    }

    fn lock_expire(&self) -> Duration {
        Duration::from_millis(self.lock_expire_millis.load(Ordering::SeqCst))
    }
}

impl Default for MemorySyncStore {
    fn default() -> Self {
        MemorySyncStore::new(DEFAULT_LOCK_EXPIRE)
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn find(&self, opts: &SyncFindOpts) -> Result<Vec<RuleSyncInfo>, StorageError> {
        let records = self.records.lock().await;
        let mut found: Vec<RuleSyncInfo> = records
            .values()
            .filter(|s| opts.rule_ids.as_ref().is_none_or(|ids| ids.contains(&s.rule_id)))
            .filter(|s| opts.engines.as_ref().is_none_or(|e| e.contains(&s.engine)))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if opts.limit > 0 {
            found.truncate(opts.limit);
        }
        Ok(found)
    }

    async fn start_sync(
        &self,
        after: Duration,
        rule_id: &str,
        engine: &str,
        force: bool,
    ) -> Result<SyncLock, StorageError> {
        let expire = self.lock_expire().max(after);
        let mut records = self.records.lock().await;
        let now = Utc::now();
        let key = (rule_id.to_string(), engine.to_string());
        if let Some(record) = records.get_mut(&key) {
            let idle = elapsed(now, record.ping_time);
            let eligible = force
                || (!record.running && idle >= after)
                || (record.running && idle >= expire);
            if !eligible {
                let retry_in = if record.running {
                    after
                } else {
                    after.saturating_sub(idle)
                };
                return Err(StorageError::SyncLocked { retry_in });
            }
            record.start_time = now;
            record.ping_time = now;
            record.running = true;
            return Ok(SyncLock {
                next: after,
                info: record.clone(),
            });
        }
        let info = RuleSyncInfo {
            sync_id: Uuid::new_v4().to_string(),
            rule_id: rule_id.to_string(),
            engine: engine.to_string(),
            start_time: now,
            end_time: DateTime::<Utc>::default(),
            ping_time: now,
            running: true,
            syncs: Vec::new(),
        };
        records.insert(key, info.clone());
        Ok(SyncLock { next: after, info })
    }

    async fn ping_syncs(&self, sync_ids: &[String]) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        for record in records.values_mut() {
            if sync_ids.contains(&record.sync_id) {
                record.ping_time = now;
            }
        }
        Ok(())
    }

    async fn end_sync(&self, info: &RuleSyncInfo, data: RuleSyncData) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        let key = (info.rule_id.clone(), info.engine.clone());
        let Some(record) = records.get_mut(&key) else {
            warn!("no sync record for rule {} in engine {}", info.rule_id, info.engine);
            return Ok(());
        };
        let now = Utc::now();
        record.running = false;
        record.ping_time = now;
        record.end_time = now;
        record.syncs.push(data);
        if record.syncs.len() > SYNC_HISTORY_LIMIT {
            let excess = record.syncs.len() - SYNC_HISTORY_LIMIT;
            record.syncs.drain(..excess);
        }
        Ok(())
    }

    fn set_lock_expire_time(&self, expire: Duration) -> Duration {
        let old = self
            .lock_expire_millis
            .swap(expire.as_millis() as u64, Ordering::SeqCst);
        Duration::from_millis(old)
    }
}
