use std::sync::Arc;

use agent_backbone_domain::{BackboneError, BackboneResult, LockLease};
use agent_backbone_store_core::BackboneStore;
use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::RunLedger;

/// Background renewal of a run lease.
///
/// The task renews every `lock.renew_interval_ms` until [`LeaseKeeper::stop`]
/// is called or a renewal reports the lease lost. Callers check
/// [`LeaseKeeper::is_lost`] between steps; dispatch re-validates the lease anyway.
pub struct LeaseKeeper {
    stop_tx: watch::Sender<bool>,
    lease_rx: watch::Receiver<Option<LockLease>>,
    handle: JoinHandle<BackboneResult<LockLease>>,
}

impl LeaseKeeper {
    pub fn spawn<S>(ledger: Arc<RunLedger<S>>, lease: LockLease) -> Self
    where
        S: BackboneStore + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let (lease_tx, lease_rx) = watch::channel(Some(lease.clone()));
        let period = ledger.config().lock.renew_interval();

        let handle = tokio::spawn(async move {
            let mut current = lease;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            return Ok(current);
                        }
                    }
                    _ = ticker.tick() => {
                        match ledger.renew(&current) {
                            Ok(renewed) => {
                                debug!(
                                    run_id = %renewed.run_id,
                                    fencing_token = renewed.fencing_token,
                                    "lease renewed"
                                );
                                current = renewed;
                                lease_tx.send_replace(Some(current.clone()));
                            }
                            Err(err @ BackboneError::LockLost { .. }) => {
                                warn!(
                                    run_id = %current.run_id,
                                    holder = %current.holder,
                                    "lease lost, keeper stopping"
                                );
                                lease_tx.send_replace(None);
                                ledger.forget_run(current.run_id);
                                return Err(err);
                            }
                            Err(err) => {
                                warn!(
                                    run_id = %current.run_id,
                                    error = %err,
                                    "lease renewal failed, will retry"
                                );
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop_tx,
            lease_rx,
            handle,
        }
    }

    /// The most recently renewed lease, or `None` once it was lost.
    #[must_use]
    pub fn current(&self) -> Option<LockLease> {
        self.lease_rx.borrow().clone()
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lease_rx.borrow().is_none()
    }

    /// Stop renewing and return the last lease held. The lease is not released.
    ///
    /// # Errors
    /// `LockLost` if renewal had already failed.
    pub async fn stop(self) -> BackboneResult<LockLease> {
        self.stop_tx.send_replace(true);
        self.handle
            .await
            .map_err(|err| BackboneError::Storage(anyhow!("lease keeper task failed: {err}")))?
    }
}
