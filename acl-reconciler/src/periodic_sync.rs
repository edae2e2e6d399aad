use std::{sync::Arc, time::Duration};

use tokio::sync::{oneshot, Mutex, Notify};

use crate::{errors::ControllerError, rule_service::RuleSyncService, sync_coordinator::SyncCoordinator};

/// Drives a full sync pass over every stored rule once per interval.
pub(crate) struct PeriodicSync {
    coordinator: SyncCoordinator,
    rule_service: Arc<RuleSyncService>,
    interval: Duration,
    disabled: bool,
    /// Pending shutdown request, taken by the loop or withdrawn on timeout.
    quit: Mutex<Option<oneshot::Sender<()>>>,
    quit_notify: Notify,
}

impl PeriodicSync {
    pub fn new(
        coordinator: SyncCoordinator,
        rule_service: Arc<RuleSyncService>,
        interval: Duration,
        disabled: bool,
    ) -> Self {
        PeriodicSync {
            coordinator,
            rule_service,
            interval,
            disabled,
            quit: Mutex::new(None),
            quit_notify: Notify::new(),
        }
    }

    /// Runs until [`PeriodicSync::shutdown`] is called. A pass in progress is
    /// always finished, only the following one is suppressed.
    pub async fn run(&self) {
        if self.disabled {
            info!("periodic sync is disabled");
            return;
        }
        info!("starting sync loop, interval {:?}", self.interval);
        loop {
            if let Err(e) = self.sync_all_rules().await {
                error!("error trying to run sync engines: {}", e);
            }
            let sleep = tokio::time::sleep(self.interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = self.quit_notify.notified() => {
                        // a withdrawn request leaves only its wakeup behind
                        if let Some(ack) = self.quit.lock().await.take() {
                            info!("stopping sync loop");
                            let _ = ack.send(());
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn sync_all_rules(&self) -> Result<(), ControllerError> {
        info!("starting sync engines");
        let mut rules = self.rule_service.find_all_rules().await?;
        // removals are propagated by on-demand syncs
        rules.retain(|r| !r.removed);
        let count = self.coordinator.sync_rules(rules, false).await;
        info!("finished sync engines, {} rules", count);
        Ok(())
    }

    /// Waits until the loop observed the request, or `timeout` passed. A
    /// request that timed out is withdrawn and never reaches the loop.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ControllerError> {
        let (ack_sender, ack_receiver) = oneshot::channel();
        *self.quit.lock().await = Some(ack_sender);
        self.quit_notify.notify_one();
        match tokio::time::timeout(timeout, ack_receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ControllerError::ShutdownTimeout(timeout)),
            Err(_) => match self.quit.lock().await.take() {
                Some(_) => Err(ControllerError::ShutdownTimeout(timeout)),
                // taken by the loop right at the deadline, it is stopping
                None => Ok(()),
            },
        }
    }
}
