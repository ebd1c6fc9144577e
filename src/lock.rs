//! Master lock keeper: a background actor that maintains a single boolean,
//! "does this node hold the cluster-wide lock?".
//!
//! Cadence is one attempt per minute against a five-minute validity window,
//! so a crashed master is replaced within at most one window plus one
//! cadence interval. Contention is not an error; a node that fails to claim
//! simply stays in slave mode for that cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repository::ScheduleRepository;

/// Interval between lock attempts (acquire or heartbeat).
pub(crate) const LOCK_CADENCE: Duration = Duration::from_secs(60);

/// The wake conditions of every registered runner. The keeper signals them
/// all when this node becomes master so runners in the long slave sleep
/// re-evaluate promptly.
#[derive(Default)]
pub(crate) struct WakeSet {
    notifiers: Mutex<Vec<Arc<Notify>>>,
}

impl WakeSet {
    pub(crate) fn add(&self, notify: Arc<Notify>) {
        self.notifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notify);
    }

    pub(crate) fn wake_all(&self) {
        let notifiers = self.notifiers.lock().unwrap_or_else(|e| e.into_inner());
        for notify in notifiers.iter() {
            notify.notify_one();
        }
    }
}

pub(crate) struct MasterLockKeeper {
    repository: Arc<dyn ScheduleRepository>,
    lock_name: String,
    node_name: String,
    has_lock: Arc<AtomicBool>,
    wakers: Arc<WakeSet>,
    shutdown: CancellationToken,
}

impl MasterLockKeeper {
    pub(crate) fn new(
        repository: Arc<dyn ScheduleRepository>,
        lock_name: String,
        node_name: String,
        has_lock: Arc<AtomicBool>,
        wakers: Arc<WakeSet>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repository,
            lock_name,
            node_name,
            has_lock,
            wakers,
            shutdown,
        }
    }

    /// Run until shutdown, then release the lock if held.
    pub(crate) async fn run(self) {
        info!(node = %self.node_name, lock = %self.lock_name, "master lock keeper starting");

        let mut interval = tokio::time::interval(LOCK_CADENCE);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        if self.has_lock.swap(false, Ordering::SeqCst) {
            if let Err(e) = self
                .repository
                .release_lock(&self.lock_name, &self.node_name)
                .await
            {
                warn!(node = %self.node_name, error = %e, "failed to release master lock");
            } else {
                info!(node = %self.node_name, "released master lock");
            }
        }
        info!(node = %self.node_name, "master lock keeper stopped");
    }

    async fn tick(&self) {
        let now = Utc::now();
        if self.has_lock.load(Ordering::SeqCst) {
            match self
                .repository
                .keep_lock(&self.lock_name, &self.node_name, now)
                .await
            {
                Ok(true) => debug!(node = %self.node_name, "master lock heartbeat"),
                Ok(false) => {
                    warn!(node = %self.node_name, "master lock lost");
                    self.has_lock.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    // Mastership is only claimed while the database confirms
                    // it; an unconfirmed heartbeat counts as a loss.
                    warn!(node = %self.node_name, error = %e, "master lock heartbeat failed");
                    self.has_lock.store(false, Ordering::SeqCst);
                }
            }
        } else {
            match self
                .repository
                .try_acquire_lock(&self.lock_name, &self.node_name, now)
                .await
            {
                Ok(true) => {
                    info!(node = %self.node_name, "acquired master lock");
                    self.has_lock.store(true, Ordering::SeqCst);
                    self.wakers.wake_all();
                }
                Ok(false) => debug!(node = %self.node_name, "master lock held elsewhere"),
                Err(e) => warn!(node = %self.node_name, error = %e, "master lock attempt failed"),
            }
        }
    }
}
