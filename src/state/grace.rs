//! Post-restart grace period.
//!
//! While the grace period is active only reclaim operations (CLAIM_PREVIOUS
//! opens, reclaim locks) are admitted; new state gets NFS4ERR_GRACE. The
//! period ends when its timer lapses or when every client from the recovery
//! snapshot has performed at least one reclaim, whichever comes first. With
//! no expected clients there is nothing to protect and grace is skipped
//! entirely.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

/// Callback invoked exactly once when the grace period ends.
pub type GraceEndFn = Box<dyn Fn() + Send + Sync>;

struct GraceInner {
    expected: HashSet<u64>,
    reclaimed: HashSet<u64>,
}

/// Tracks the reclaim window after a server restart.
pub struct GracePeriod {
    active: AtomicBool,
    ended_callback_fired: AtomicBool,
    inner: Mutex<GraceInner>,
    on_end: GraceEndFn,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl GracePeriod {
    /// Starts a grace period covering `expected` client ids. An empty list
    /// returns an already-ended period.
    pub fn start(
        expected: Vec<u64>,
        duration: Duration,
        on_end: GraceEndFn,
    ) -> Arc<GracePeriod> {
        let skip = expected.is_empty();
        let grace = Arc::new(GracePeriod {
            active: AtomicBool::new(!skip),
            ended_callback_fired: AtomicBool::new(skip),
            inner: Mutex::new(GraceInner {
                expected: expected.into_iter().collect(),
                reclaimed: HashSet::new(),
            }),
            on_end,
            timer: Mutex::new(None),
        });

        if skip {
            info!("no clients to recover; skipping grace period");
            return grace;
        }

        info!(
            clients = grace.inner.lock().expect("grace poisoned").expected.len(),
            secs = duration.as_secs(),
            "grace period started"
        );
        let weak = Arc::downgrade(&grace);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(grace) = weak.upgrade() {
                grace.end("timer expired");
            }
        });
        *grace.timer.lock().expect("grace timer poisoned") = Some(handle);
        grace
    }

    /// True while reclaim gating is in force.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Records a reclaim by `client_id`. When the last expected client has
    /// reclaimed, the period ends early on the caller's task.
    pub fn note_reclaim(&self, client_id: u64) {
        if !self.is_active() {
            return;
        }
        let all_reclaimed = {
            let mut inner = self.inner.lock().expect("grace poisoned");
            if inner.expected.contains(&client_id) {
                inner.reclaimed.insert(client_id);
            }
            inner.reclaimed.len() == inner.expected.len()
        };
        // End outside the tracking lock; the end callback may take other
        // locks of its own.
        if all_reclaimed {
            self.end("all expected clients reclaimed");
        }
    }

    /// Ends the period. Idempotent: the end callback fires exactly once even
    /// when the timer races the final reclaim.
    pub fn end(&self, reason: &str) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!(reason, "grace period ended");
        }
        if !self.ended_callback_fired.swap(true, Ordering::AcqRel) {
            (self.on_end)();
        }
        if let Some(timer) = self.timer.lock().expect("grace timer poisoned").take() {
            timer.abort();
        }
    }
}

impl Drop for GracePeriod {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().expect("grace timer poisoned").take() {
            timer.abort();
        }
    }
}
