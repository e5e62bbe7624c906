//! Pending-reply routing for server-initiated calls.
//!
//! When the backchannel sender writes a CB_COMPOUND it registers the call's
//! XID here, then waits. The transport's read loop, on seeing an RPC REPLY
//! arrive on a client connection, delivers the reply bytes to whichever
//! waiter registered that XID. Replies with no registered waiter are dropped
//! (late arrivals after a timeout are expected and harmless).

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

/// XID to waiter map for in-flight server-to-client calls.
#[derive(Default)]
pub struct PendingReplyRouter {
    waiters: Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>,
}

impl PendingReplyRouter {
    pub fn new() -> PendingReplyRouter {
        PendingReplyRouter::default()
    }

    /// Registers a waiter for `xid` and returns the receiving end.
    ///
    /// A second registration for the same XID replaces the first; the old
    /// waiter observes a closed channel.
    pub fn register(&self, xid: u32) -> oneshot::Receiver<Vec<u8>> {
        let (send, recv) = oneshot::channel();
        let mut waiters = self.waiters.lock().expect("reply router poisoned");
        if waiters.insert(xid, send).is_some() {
            debug!("replaced stale reply waiter for xid {xid}");
        }
        recv
    }

    /// Delivers reply bytes to the waiter for `xid`, if any.
    ///
    /// Returns true when a waiter consumed the reply. Exactly one delivery
    /// can succeed per registration.
    pub fn deliver(&self, xid: u32, reply: Vec<u8>) -> bool {
        let sender = {
            let mut waiters = self.waiters.lock().expect("reply router poisoned");
            waiters.remove(&xid)
        };
        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => {
                debug!("no waiter registered for reply xid {xid}");
                false
            }
        }
    }

    /// Removes the waiter for `xid` without delivering anything.
    pub fn cancel(&self, xid: u32) {
        let mut waiters = self.waiters.lock().expect("reply router poisoned");
        waiters.remove(&xid);
    }

    /// Number of in-flight registrations, for tests and diagnostics.
    pub fn pending(&self) -> usize {
        self.waiters.lock().expect("reply router poisoned").len()
    }
}
