//! Per-client lease timers.
//!
//! Every confirmed client owns one lease. Any successful stateid-using
//! operation renews it implicitly; RENEW and SEQUENCE renew it explicitly.
//! When the lease runs out the expiry task fires once and the state manager
//! cascades: locks, opens, delegations, then the client record itself.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One client's lease clock and its watcher task.
pub struct LeaseTimer {
    duration: Duration,
    last_renew: Mutex<Instant>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseTimer {
    pub fn new(duration: Duration) -> Arc<LeaseTimer> {
        Arc::new(LeaseTimer {
            duration,
            last_renew: Mutex::new(Instant::now()),
            task: Mutex::new(None),
        })
    }

    /// Starts the expiry watcher. `on_expire` runs at most once, after the
    /// lease has genuinely lapsed; renewals observed while sleeping push the
    /// deadline forward.
    pub fn start<F, Fut>(self: &Arc<Self>, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let timer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let deadline = *timer.last_renew.lock().expect("lease clock poisoned")
                    + timer.duration;
                let now = Instant::now();
                if now >= deadline {
                    debug!("lease expired");
                    on_expire().await;
                    return;
                }
                tokio::time::sleep(deadline - now).await;
            }
        });
        let mut task = self.task.lock().expect("lease task slot poisoned");
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
    }

    /// Resets the lease clock.
    pub fn renew(&self) {
        *self.last_renew.lock().expect("lease clock poisoned") = Instant::now();
    }

    /// True once `last_renew + duration` has passed.
    pub fn is_expired(&self) -> bool {
        let last = *self.last_renew.lock().expect("lease clock poisoned");
        Instant::now() >= last + self.duration
    }

    /// Most recent renewal time.
    pub fn last_renew(&self) -> Instant {
        *self.last_renew.lock().expect("lease clock poisoned")
    }

    /// Cancels the watcher; used when the client is removed for another
    /// reason than expiry.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().expect("lease task slot poisoned").take() {
            task.abort();
        }
    }
}
