//! Delegation engine: grant policy, conflict-driven recall, and revocation.
//!
//! The state manager stores delegation records; this engine wraps it with
//! everything that touches the network or a timer. The composition rule is
//! strict: conflicts are detected and marked under the store lock, but the
//! CB_RECALL itself is dispatched from a spawned task with no lock held.
//!
//! Revocation follows the protocol's floor: after a successful recall the
//! client gets a full lease period to return the delegation; after a failed
//! callback the timer shortens to five seconds and the callback path is
//! marked down.

pub mod directory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use moka::sync::Cache;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callback::CallbackClient;
use crate::config::StateConfig;
use crate::protocol::xdr::nfs4::{clientid4, stateid4, OPEN4_SHARE_ACCESS_WRITE};
use crate::session::backchannel::CallbackOp;
use crate::session::SessionTable;
use crate::state::error::Result;
use crate::state::error::NfsError;
use crate::state::records::{DelegationType, Fh, Other};
use crate::state::{DelegationDropHook, OpenArgs, OpenOutcome, RecallTicket, StateManager};
use directory::NotificationBuffers;

/// Short revocation timer used after a callback failure.
const FAILED_RECALL_REVOCATION: Duration = Duration::from_secs(5);

/// The delegation engine; construct with [`DelegationEngine::new`].
pub struct DelegationEngine {
    config: StateConfig,
    manager: Arc<StateManager>,
    sessions: Arc<SessionTable>,
    callback: Arc<CallbackClient>,
    /// Files recalled recently enough that new delegations are refused.
    recently_recalled: Cache<Fh, ()>,
    /// Armed revocation timers, keyed by delegation identity.
    revocations: Mutex<HashMap<Other, JoinHandle<()>>>,
    /// Pending directory-notification batches.
    pub(crate) notifications: NotificationBuffers,
    weak_self: Weak<DelegationEngine>,
}

impl DelegationEngine {
    pub fn new(
        config: StateConfig,
        manager: Arc<StateManager>,
        sessions: Arc<SessionTable>,
        callback: Arc<CallbackClient>,
    ) -> Arc<DelegationEngine> {
        let recall_ttl = config.recall_ttl();
        let engine = Arc::new_cyclic(|weak| DelegationEngine {
            config,
            manager: Arc::clone(&manager),
            sessions,
            callback,
            recently_recalled: Cache::builder().time_to_live(recall_ttl).build(),
            revocations: Mutex::new(HashMap::new()),
            notifications: NotificationBuffers::new(),
            weak_self: weak.clone(),
        });
        // FREE_STATEID and the expiry cascade remove delegation records
        // without a DELEGRETURN; the hook cancels the timers armed here.
        let hook: Weak<DelegationEngine> = Arc::downgrade(&engine);
        manager.set_delegation_drop_hook(hook);
        engine
    }

    pub fn manager(&self) -> &Arc<StateManager> {
        &self.manager
    }

    pub(crate) fn config(&self) -> &StateConfig {
        &self.config
    }

    pub(crate) fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub(crate) fn weak(&self) -> Weak<DelegationEngine> {
        self.weak_self.clone()
    }

    /// OPEN with delegation semantics: recall conflicting delegations held
    /// by other clients (returning DELAY), otherwise open and possibly grant.
    pub fn open_file(&self, args: &OpenArgs) -> Result<OpenOutcome> {
        let recalls = self.manager.claim_conflicting_delegations(
            &args.fh,
            args.client_id,
            args.share_access,
        );
        if !recalls.is_empty() {
            for ticket in recalls {
                self.dispatch_recall(ticket);
            }
            return Err(NfsError::delay("delegation recall in progress"));
        }

        let mut args = args.clone();
        args.grant_delegation = self.grant_policy(&args);
        self.manager.open_file(&args)
    }

    /// The grant policy. Returns the delegation type to grant, or `None`.
    fn grant_policy(&self, args: &OpenArgs) -> Option<DelegationType> {
        if !self.config.delegations_enabled {
            return None;
        }
        if !self.manager.cb_path_up(args.client_id) {
            return None;
        }
        if self.recently_recalled.contains_key(&args.fh) {
            debug!("delegation refused: file was recalled recently");
            return None;
        }
        if self.manager.other_clients_have_open(&args.fh, args.client_id) {
            return None;
        }
        if self.manager.file_has_delegation(&args.fh) {
            return None;
        }
        if self.manager.delegation_count() >= self.config.max_delegations {
            return None;
        }
        if args.share_access & OPEN4_SHARE_ACCESS_WRITE != 0 {
            Some(DelegationType::Write)
        } else {
            Some(DelegationType::Read)
        }
    }

    /// Recalls one specific delegation (directory conflicts, admin action).
    pub fn recall_delegation(&self, other: &Other, reason: &str) {
        if let Some(ticket) = self.manager.begin_recall(other) {
            info!(client_id = ticket.client_id, reason, "recalling delegation");
            self.dispatch_recall(ticket);
        }
    }

    /// Dispatches one recall on its own task; never called with any state
    /// lock held.
    fn dispatch_recall(&self, ticket: RecallTicket) {
        let Some(engine) = self.weak_self.upgrade() else { return };
        tokio::spawn(async move {
            let other = ticket.stateid.other;
            let client_id = ticket.client_id;
            let ok = engine.send_recall(&ticket).await;
            if ok {
                debug!(client_id, "recall delivered; arming lease-length revocation");
                engine.arm_revocation(other, engine.config.lease_duration());
            } else {
                warn!(client_id, "recall failed; arming short revocation");
                engine.manager.set_cb_path_up(client_id, false);
                engine.arm_revocation(other, FAILED_RECALL_REVOCATION);
            }
        });
    }

    async fn send_recall(&self, ticket: &RecallTicket) -> bool {
        if ticket.minor_version == 0 {
            self.callback
                .cb_recall(&ticket.callback, ticket.stateid, ticket.fh.clone(), false)
                .await
                .is_ok()
        } else {
            let op = CallbackOp::Recall {
                stateid: ticket.stateid,
                fh: ticket.fh.clone(),
                truncate: false,
            };
            match self.sessions.send_callback_to_client(ticket.client_id, op) {
                Some(done) => done.await.unwrap_or(false),
                None => false,
            }
        }
    }

    /// Arms (or re-arms) the revocation timer for one delegation.
    fn arm_revocation(&self, other: Other, after: Duration) {
        let Some(engine) = self.weak_self.upgrade() else { return };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // The map entry goes first, on every exit path; the delegation
            // may already have been returned or freed while we slept.
            engine.revocations.lock().expect("revocation table poisoned").remove(&other);
            if !engine.manager.delegation_outstanding(&other) {
                return;
            }
            if let Some(fh) = engine.manager.revoke_delegation(&other) {
                engine.recently_recalled.insert(fh, ());
            }
        });
        let mut revocations = self.revocations.lock().expect("revocation table poisoned");
        if let Some(old) = revocations.insert(other, handle) {
            old.abort();
        }
    }

    /// Number of armed revocation timers, for tests and diagnostics.
    pub fn revocation_timer_count(&self) -> usize {
        self.revocations.lock().expect("revocation table poisoned").len()
    }

    /// DELEGRETURN: stops the revocation timer and removes the record.
    pub fn delegreturn(&self, stateid: &stateid4) -> Result<()> {
        if let Some(timer) = self
            .revocations
            .lock()
            .expect("revocation table poisoned")
            .remove(&stateid.other)
        {
            timer.abort();
        }
        self.notifications.drop_buffer(&stateid.other);
        self.manager.delegreturn(stateid)
    }

    /// Marks a file as recently recalled; exposed for the directory path.
    pub(crate) fn note_recalled(&self, fh: Fh) {
        self.recently_recalled.insert(fh, ());
    }

    /// Grants a directory delegation, subject to the same callback-path and
    /// cap checks as file delegations.
    pub fn grant_directory_delegation(
        &self,
        client_id: clientid4,
        dir_fh: Fh,
        notify_mask: u32,
    ) -> Result<stateid4> {
        if !self.config.delegations_enabled {
            return Err(NfsError::new(
                crate::protocol::xdr::nfs4::nfsstat4::NFS4ERR_NOTSUPP,
                "delegations disabled",
            ));
        }
        if !self.manager.cb_path_up(client_id) {
            return Err(NfsError::delay("callback path not verified"));
        }
        if self.manager.delegation_count() >= self.config.max_delegations {
            return Err(NfsError::delay("delegation limit reached"));
        }
        self.manager
            .insert_delegation(client_id, dir_fh, DelegationType::DirectoryRead, notify_mask)
    }
}

impl DelegationDropHook for DelegationEngine {
    /// The state manager dropped a delegation record outside DELEGRETURN:
    /// cancel its revocation timer and discard any pending notifications.
    fn delegation_dropped(&self, other: &Other) {
        if let Some(timer) = self
            .revocations
            .lock()
            .expect("revocation table poisoned")
            .remove(other)
        {
            timer.abort();
        }
        self.notifications.drop_buffer(other);
    }
}

impl Drop for DelegationEngine {
    fn drop(&mut self) {
        let mut revocations = self.revocations.lock().expect("revocation table poisoned");
        for (_, handle) in revocations.drain() {
            handle.abort();
        }
    }
}
