use std::{collections::HashSet, sync::Arc, time::Duration};

use opentelemetry::{global, metrics::Counter};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{storage::SyncStore, utils::metric_name};

const LOCK_UPDATER: &str = "lock_updater";

enum Message {
    Enqueue(String),
    Dequeue(String),
    Stop,
}

/// Background task keeping the sync locks held by this process alive.
///
/// All bookkeeping lives inside the task, callers only send messages. The
/// set of held sync ids is pinged whenever it changes and on every interval
/// tick, as long as it is not empty.
pub(crate) struct LockUpdater {
    sender: mpsc::UnboundedSender<Message>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LockUpdater {
    pub fn start(store: Arc<dyn SyncStore>, interval: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let failures = global::meter(LOCK_UPDATER)
            .u64_counter(metric_name("lock_ping_failures_total"))
            .with_description("The number of failed attempts to refresh sync locks")
            .build();
        let join_handle = tokio::spawn(Self::run(store, interval, receiver, failures));
        LockUpdater {
            sender,
            join_handle: Mutex::new(Some(join_handle)),
        }
    }

    pub fn enqueue(&self, sync_id: &str) {
        self.send(Message::Enqueue(sync_id.to_string()));
    }

    pub fn dequeue(&self, sync_id: &str) {
        self.send(Message::Dequeue(sync_id.to_string()));
    }

    /// Stops the task and waits for it to exit. Calling it twice is a no-op.
    pub async fn stop(&self) {
        let join_handle = self.join_handle.lock().await.take();
        if let Some(join_handle) = join_handle {
            self.send(Message::Stop);
            if let Err(e) = join_handle.await {
                error!("lock updater task failed: {}", e);
            }
        }
    }

    fn send(&self, message: Message) {
        if self.sender.send(message).is_err() {
            warn!("lock updater is not running");
        }
    }

    async fn run(
        store: Arc<dyn SyncStore>,
        interval: Duration,
        mut receiver: mpsc::UnboundedReceiver<Message>,
        failures: Counter<u64>,
    ) {
        let mut sync_ids: HashSet<String> = HashSet::new();
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(Message::Enqueue(id)) => {
                        sync_ids.insert(id);
                    }
                    Some(Message::Dequeue(id)) => {
                        sync_ids.remove(&id);
                    }
                    Some(Message::Stop) | None => break,
                },
                _ = ticker.tick() => (),
            }
            if sync_ids.is_empty() {
                continue;
            }
            let ids: Vec<String> = sync_ids.iter().cloned().collect();
            if let Err(e) = store.ping_syncs(&ids).await {
                failures.add(1, &[]);
                error!("unable to update sync lock for {:?}: {}", ids, e);
            }
        }
        debug!("lock updater stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageError, SyncFindOpts, SyncLock};
    use acl_reconciler_apis::{RuleSyncData, RuleSyncInfo};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct PingRecorder {
        pings: StdMutex<Vec<Vec<String>>>,
    }

    impl PingRecorder {
        fn pings(&self) -> Vec<Vec<String>> {
            self.pings.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SyncStore for PingRecorder {
        async fn find(&self, _: &SyncFindOpts) -> Result<Vec<RuleSyncInfo>, StorageError> {
            Ok(vec![])
        }

        async fn start_sync(
            &self,
            _: Duration,
            _: &str,
            _: &str,
            _: bool,
        ) -> Result<SyncLock, StorageError> {
            Err(StorageError::SyncLocked {
                retry_in: Duration::ZERO,
            })
        }

        async fn ping_syncs(&self, sync_ids: &[String]) -> Result<(), StorageError> {
            let mut ids = sync_ids.to_vec();
            ids.sort();
            self.pings.lock().unwrap().push(ids);
            Ok(())
        }

        async fn end_sync(&self, _: &RuleSyncInfo, _: RuleSyncData) -> Result<(), StorageError> {
            Ok(())
        }

        fn set_lock_expire_time(&self, expire: Duration) -> Duration {
            expire
        }
    }

    const TICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn pings_on_enqueue_and_on_tick() {
        let store = Arc::new(PingRecorder::default());
        let updater = LockUpdater::start(store.clone(), TICK);
        updater.enqueue("s1");
        tokio::time::sleep(TICK / 5).await;
        assert_eq!(vec![vec!["s1".to_string()]], store.pings());

        updater.enqueue("s2");
        tokio::time::sleep(TICK * 3).await;
        let pings = store.pings();
        assert!(pings.len() >= 3, "{:?}", pings);
        assert_eq!(
            &vec!["s1".to_string(), "s2".to_string()],
            pings.last().unwrap()
        );
        updater.stop().await;
    }

    #[tokio::test]
    async fn no_pings_once_everything_is_dequeued() {
        let store = Arc::new(PingRecorder::default());
        let updater = LockUpdater::start(store.clone(), TICK);
        updater.enqueue("s1");
        updater.dequeue("s1");
        tokio::time::sleep(TICK / 5).await;
        let count = store.pings().len();
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(count, store.pings().len());
        updater.stop().await;
    }

    #[tokio::test]
    async fn restart_begins_with_empty_set() {
        let store = Arc::new(PingRecorder::default());
        let updater = LockUpdater::start(store.clone(), TICK);
        updater.enqueue("s1");
        updater.stop().await;
        updater.stop().await;
        let count = store.pings().len();

        let updater = LockUpdater::start(store.clone(), TICK);
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(count, store.pings().len());
        updater.stop().await;
    }
}
