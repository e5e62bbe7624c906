//! The NFSv4 state manager: the central store for clients, owners, opens,
//! byte-range lock metadata, and delegations.
//!
//! Every mutation and every cross-index read takes the single store lock.
//! That is deliberate: the indexes reference each other (client to owner to
//! open to lock to delegation), and finer-grained locking here has a history
//! of lock-order cycles. Methods under the lock are CPU-bound map and
//! integer work; no I/O ever happens while it is held. Callback dispatch,
//! timers, and network traffic all run on their own tasks and re-enter
//! through the public methods.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use rand::RngCore;
use tracing::{debug, info, warn};

pub mod error;
pub mod grace;
pub mod lease;
pub mod lock_manager;
mod lock_ops;
mod open_ops;
pub mod records;
pub mod recovery;
pub mod stateid;

pub use lock_ops::{LockExistingArgs, LockNewArgs, LockOutcome, LocktArgs, UnlockArgs};
pub use open_ops::{OpenArgs, OpenOutcome, StateidOutcome};

use crate::config::StateConfig;
use crate::protocol::xdr::nfs4::{
    clientid4, nfsstat4, stateid4, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_ACCESS_READ,
    OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_NONE,
};
use error::{NfsError, Result};
use grace::{GraceEndFn, GracePeriod};
use lease::LeaseTimer;
use lock_manager::{LockHolder, LockManager};
use records::{
    CallbackInfo, ClientRecord, DelegationState, DelegationType, Fh, LockOwnerState, LockState,
    OpenOwner, OpenState, Other, OwnerKey, StateView,
};
use recovery::{RecoverySnapshot, SnapshotClient};
use stateid::{StateidAllocator, StateidType};

/// Probes a client's callback path with CB_NULL after confirmation.
#[async_trait]
pub trait CallbackProbe: Send + Sync {
    async fn probe(&self, callback: &CallbackInfo) -> bool;
}

/// Observes delegation records dropped by paths other than DELEGRETURN
/// (FREE_STATEID, the lease-expiry and eviction cascades). The delegation
/// engine registers itself here so recall/revocation timers and pending
/// notification batches never outlive the record they belong to.
pub trait DelegationDropHook: Send + Sync {
    fn delegation_dropped(&self, other: &Other);
}

/// A recall the delegation engine must dispatch after a conflicting OPEN.
#[derive(Clone, Debug)]
pub struct RecallTicket {
    pub client_id: clientid4,
    pub stateid: stateid4,
    pub fh: Fh,
    pub callback: CallbackInfo,
    pub minor_version: u32,
}

pub(crate) struct StateStore {
    /// Confirmed clients, by client id.
    pub clients: HashMap<clientid4, ClientRecord>,
    pub confirmed_by_name: HashMap<Vec<u8>, clientid4>,
    /// Unconfirmed records, at most one per identity string. In the
    /// SETCLIENTID callback-refresh cases the unconfirmed record shares the
    /// confirmed record's client id, so the two must live in separate maps.
    pub unconfirmed: HashMap<Vec<u8>, ClientRecord>,
    pub open_owners: HashMap<OwnerKey, OpenOwner>,
    pub lock_owners: HashMap<OwnerKey, LockOwnerState>,
    pub opens: HashMap<Other, OpenState>,
    pub locks: HashMap<Other, LockState>,
    pub delegations: HashMap<Other, DelegationState>,
    pub delegations_by_file: HashMap<Fh, Vec<Other>>,
    next_client_serial: u32,
}

impl StateStore {
    fn new() -> StateStore {
        StateStore {
            clients: HashMap::new(),
            confirmed_by_name: HashMap::new(),
            unconfirmed: HashMap::new(),
            open_owners: HashMap::new(),
            lock_owners: HashMap::new(),
            opens: HashMap::new(),
            locks: HashMap::new(),
            delegations: HashMap::new(),
            delegations_by_file: HashMap::new(),
            next_client_serial: 1,
        }
    }
}

/// The state manager. Construct with [`StateManager::new`]; it hands out an
/// `Arc` because lease and grace timers hold weak references back into it.
pub struct StateManager {
    pub(crate) config: StateConfig,
    pub(crate) allocator: StateidAllocator,
    pub(crate) lock_manager: Arc<LockManager>,
    pub(crate) store: RwLock<StateStore>,
    grace: Arc<GracePeriod>,
    /// Identity string to previous-boot client id, from the recovery
    /// snapshot. Reclaims by a re-registered client are credited to its old
    /// id so the grace tracker can account for every expected client.
    recovered_ids: HashMap<Vec<u8>, clientid4>,
    cb_probe: RwLock<Option<Arc<dyn CallbackProbe>>>,
    /// Weak so the delegation engine (which holds this manager) can register
    /// itself without forming a reference cycle.
    deleg_drop_hook: RwLock<Option<Weak<dyn DelegationDropHook>>>,
    weak_self: Weak<StateManager>,
}

impl StateManager {
    /// Creates the manager and starts the grace period over the snapshot's
    /// clients (no grace when the snapshot is empty).
    pub fn new(
        config: StateConfig,
        lock_manager: Arc<LockManager>,
        snapshot: RecoverySnapshot,
        on_grace_end: GraceEndFn,
    ) -> Arc<StateManager> {
        let grace_duration = config.grace_duration();
        let expected_clients = snapshot.expected_client_ids();
        let recovered_ids = snapshot
            .clients
            .iter()
            .map(|c| (c.id_string.clone(), c.client_id))
            .collect();
        Arc::new_cyclic(|weak| StateManager {
            config,
            allocator: StateidAllocator::from_clock(),
            lock_manager,
            store: RwLock::new(StateStore::new()),
            grace: GracePeriod::start(expected_clients, grace_duration, on_grace_end),
            recovered_ids,
            cb_probe: RwLock::new(None),
            deleg_drop_hook: RwLock::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Credits a reclaim to the grace tracker, resolving the client back to
    /// its previous-boot id via the snapshot. Called with no store lock held.
    pub(crate) fn note_grace_reclaim(&self, client_id: clientid4) {
        let mapped = {
            let store = self.store.read().expect("state store poisoned");
            store
                .clients
                .get(&client_id)
                .and_then(|c| self.recovered_ids.get(&c.id_string))
                .copied()
                .unwrap_or(client_id)
        };
        self.grace.note_reclaim(mapped);
    }

    /// Registers the CB_NULL prober used after SETCLIENTID_CONFIRM.
    pub fn set_callback_probe(&self, probe: Arc<dyn CallbackProbe>) {
        *self.cb_probe.write().expect("probe slot poisoned") = Some(probe);
    }

    /// Registers the observer for delegations dropped outside DELEGRETURN.
    pub fn set_delegation_drop_hook(&self, hook: Weak<dyn DelegationDropHook>) {
        *self.deleg_drop_hook.write().expect("hook slot poisoned") = Some(hook);
    }

    /// Invokes the drop hook for each removed delegation. Never called with
    /// the store lock held; the hook takes its own leaf locks.
    fn notify_delegations_dropped(&self, others: &[Other]) {
        if others.is_empty() {
            return;
        }
        let hook = self
            .deleg_drop_hook
            .read()
            .expect("hook slot poisoned")
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(hook) = hook {
            for other in others {
                hook.delegation_dropped(other);
            }
        }
    }

    pub fn grace(&self) -> &GracePeriod {
        &self.grace
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    fn random_verifier() -> [u8; 8] {
        let mut verifier = [0_u8; 8];
        rand::thread_rng().fill_bytes(&mut verifier);
        verifier
    }

    fn compose_client_id(&self, serial: u32) -> clientid4 {
        ((self.allocator.epoch() as u64) << 32) | serial as u64
    }

    // ------------------------------------------------------------------
    // Client identity, v4.0 (SETCLIENTID / SETCLIENTID_CONFIRM / RENEW)
    // ------------------------------------------------------------------

    /// SETCLIENTID: records an unconfirmed client per the five-case table of
    /// RFC 7530 §16.33.4 and returns `(client_id, confirm_verifier)`.
    pub fn set_client_id(
        &self,
        id_string: Vec<u8>,
        verifier: [u8; 8],
        callback: CallbackInfo,
        client_addr: String,
    ) -> Result<(clientid4, [u8; 8])> {
        let mut store = self.store.write().expect("state store poisoned");

        let confirmed_id = store.confirmed_by_name.get(&id_string).copied();
        let confirmed_verifier_matches = confirmed_id
            .and_then(|id| store.clients.get(&id))
            .map(|c| c.verifier == verifier)
            .unwrap_or(false);

        // Cases 2 and 5: the confirmed record survives and the unconfirmed
        // record reuses its client id (callback refresh). Case 3: a reboot
        // (verifier mismatch) gets a brand-new client id while the old
        // confirmed record stays until CONFIRM. Cases 1 and 4: no confirmed
        // record, so a fresh id replaces any pending unconfirmed one.
        let client_id = match confirmed_id {
            Some(id) if confirmed_verifier_matches => id,
            _ => {
                let serial = store.next_client_serial;
                store.next_client_serial += 1;
                self.compose_client_id(serial)
            }
        };

        let confirm_verifier = Self::random_verifier();
        let record = ClientRecord {
            client_id,
            id_string: id_string.clone(),
            verifier,
            confirm_verifier,
            confirmed: false,
            callback,
            cb_path_up: false,
            created_at: Instant::now(),
            minor_version: 0,
            sequence_id: 0,
            cached_create_session: None,
            client_addr,
            lease: LeaseTimer::new(self.config.lease_duration()),
        };
        debug!(client_id, "SETCLIENTID recorded unconfirmed client");
        // Replaces any pending unconfirmed record for this identity.
        store.unconfirmed.insert(id_string, record);
        Ok((client_id, confirm_verifier))
    }

    /// SETCLIENTID_CONFIRM: promotes the unconfirmed record whose random
    /// confirm verifier matches, evicting any older confirmed record with
    /// the same identity, then starts the lease and probes the callback
    /// path asynchronously.
    pub fn confirm_client_id(&self, client_id: clientid4, confirm_verifier: [u8; 8]) -> Result<()> {
        let (callback, evicted, dropped_delegations) = {
            let mut store = self.store.write().expect("state store poisoned");

            let id_string = match store
                .unconfirmed
                .values()
                .find(|r| r.client_id == client_id)
            {
                Some(record) if record.confirm_verifier == confirm_verifier => {
                    record.id_string.clone()
                }
                Some(_) => return Err(NfsError::stale_clientid()),
                None => {
                    // Retransmitted confirm of an already-promoted record.
                    return match store.clients.get(&client_id) {
                        Some(record) if record.confirm_verifier == confirm_verifier => Ok(()),
                        _ => Err(NfsError::stale_clientid()),
                    };
                }
            };

            let mut record =
                store.unconfirmed.remove(&id_string).expect("found above");
            let callback = record.callback.clone();

            // Evict an older confirmed client with the same identity string.
            // A callback refresh (same client id) replaces the record but
            // must not cascade away the live state it is refreshing.
            let evicted = store
                .confirmed_by_name
                .get(&id_string)
                .copied()
                .filter(|old_id| *old_id != client_id);
            let dropped_delegations = match evicted {
                Some(old_id) => {
                    Self::remove_client_locked(&mut store, &self.lock_manager, old_id)
                }
                None => Vec::new(),
            };

            record.confirmed = true;
            if let Some(old) = store.clients.insert(client_id, record) {
                old.lease.stop();
            }
            store.confirmed_by_name.insert(id_string, client_id);
            (callback, evicted, dropped_delegations)
        };
        self.notify_delegations_dropped(&dropped_delegations);

        if let Some(old_id) = evicted {
            info!(old_id, client_id, "evicted superseded confirmed client");
        }
        info!(client_id, "client confirmed");
        self.start_lease(client_id);
        self.spawn_cb_probe(client_id, callback);
        Ok(())
    }

    fn start_lease(&self, client_id: clientid4) {
        let lease = {
            let store = self.store.read().expect("state store poisoned");
            match store.clients.get(&client_id) {
                Some(record) => Arc::clone(&record.lease),
                None => return,
            }
        };
        let weak = self.weak_self.clone();
        lease.start(move || async move {
            if let Some(manager) = weak.upgrade() {
                manager.expire_client(client_id);
            }
        });
    }

    fn spawn_cb_probe(&self, client_id: clientid4, callback: CallbackInfo) {
        let probe = self.cb_probe.read().expect("probe slot poisoned").clone();
        let Some(probe) = probe else { return };
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            let up = probe.probe(&callback).await;
            if let Some(manager) = weak.upgrade() {
                manager.set_cb_path_up(client_id, up);
            }
        });
    }

    /// Explicit RENEW (v4.0).
    pub fn renew(&self, client_id: clientid4) -> Result<()> {
        let store = self.store.read().expect("state store poisoned");
        let record = store
            .clients
            .get(&client_id)
            .filter(|c| c.confirmed)
            .ok_or_else(NfsError::stale_clientid)?;
        if record.lease.is_expired() {
            return Err(NfsError::expired());
        }
        record.lease.renew();
        Ok(())
    }

    /// Marks the callback path up or down; a down path blocks delegation
    /// grants until a later CB_NULL succeeds.
    pub fn set_cb_path_up(&self, client_id: clientid4, up: bool) {
        let mut store = self.store.write().expect("state store poisoned");
        if let Some(record) = store.clients.get_mut(&client_id) {
            if record.cb_path_up != up {
                info!(client_id, up, "callback path state changed");
            }
            record.cb_path_up = up;
        }
    }

    pub fn cb_path_up(&self, client_id: clientid4) -> bool {
        let store = self.store.read().expect("state store poisoned");
        store.clients.get(&client_id).map(|c| c.cb_path_up).unwrap_or(false)
    }

    pub fn client_exists(&self, client_id: clientid4) -> bool {
        let store = self.store.read().expect("state store poisoned");
        store.clients.contains_key(&client_id)
    }

    /// Last lease renewal instant, for diagnostics.
    pub fn client_last_renew(&self, client_id: clientid4) -> Option<Instant> {
        let store = self.store.read().expect("state store poisoned");
        store.clients.get(&client_id).map(|c| c.lease.last_renew())
    }

    /// Callback endpoint and minor version for dispatching recalls.
    pub fn client_callback(&self, client_id: clientid4) -> Option<(CallbackInfo, u32)> {
        let store = self.store.read().expect("state store poisoned");
        store.clients.get(&client_id).map(|c| (c.callback.clone(), c.minor_version))
    }

    // ------------------------------------------------------------------
    // Client identity, v4.1 (EXCHANGE_ID / CREATE_SESSION replay cache)
    // ------------------------------------------------------------------

    /// EXCHANGE_ID: associates a client id with the owner identity bytes.
    /// Returns `(client_id, next_expected_create_session_seq)`.
    pub fn exchange_id(
        &self,
        id_string: Vec<u8>,
        verifier: [u8; 8],
        client_addr: String,
    ) -> Result<(clientid4, u32)> {
        let mut store = self.store.write().expect("state store poisoned");

        if let Some(&existing) = store.confirmed_by_name.get(&id_string) {
            let record = store
                .clients
                .get(&existing)
                .ok_or_else(|| NfsError::serverfault("confirmed index points nowhere"))?;
            if record.verifier == verifier {
                return Ok((existing, record.sequence_id.wrapping_add(1)));
            }
            // Client rebooted: fall through and stage a fresh identity; the
            // old record is displaced when the new one confirms.
        }

        let serial = store.next_client_serial;
        store.next_client_serial += 1;
        let client_id = self.compose_client_id(serial);
        let record = ClientRecord {
            client_id,
            id_string: id_string.clone(),
            verifier,
            confirm_verifier: Self::random_verifier(),
            confirmed: false,
            callback: CallbackInfo::default(),
            cb_path_up: false,
            created_at: Instant::now(),
            minor_version: 1,
            sequence_id: 0,
            cached_create_session: None,
            client_addr,
            lease: LeaseTimer::new(self.config.lease_duration()),
        };
        store.unconfirmed.insert(id_string, record);
        debug!(client_id, "EXCHANGE_ID staged v4.1 client");
        Ok((client_id, 1))
    }

    /// CREATE_SESSION replay-cache check, run before building a session.
    pub fn create_session_check(
        &self,
        client_id: clientid4,
        seq: u32,
    ) -> Result<Option<Vec<u8>>> {
        let store = self.store.read().expect("state store poisoned");
        let record = store
            .clients
            .get(&client_id)
            .or_else(|| store.unconfirmed.values().find(|r| r.client_id == client_id))
            .ok_or_else(NfsError::stale_clientid)?;
        if seq == record.sequence_id {
            return match &record.cached_create_session {
                Some(bytes) => Ok(Some(bytes.clone())),
                None => Err(NfsError::seq_misordered()),
            };
        }
        if seq == record.sequence_id.wrapping_add(1) {
            return Ok(None);
        }
        Err(NfsError::seq_misordered())
    }

    /// Commits a successful CREATE_SESSION: advances the sequence, caches the
    /// encoded reply, and (first time) confirms the client.
    pub fn create_session_commit(
        &self,
        client_id: clientid4,
        seq: u32,
        encoded_reply: Vec<u8>,
        callback: CallbackInfo,
    ) -> Result<()> {
        let (newly_confirmed, dropped_delegations) = {
            let mut store = self.store.write().expect("state store poisoned");
            if let Some(record) = store.clients.get_mut(&client_id) {
                record.sequence_id = seq;
                record.cached_create_session = Some(encoded_reply);
                record.callback = callback;
                record.cb_path_up = true;
                (false, Vec::new())
            } else {
                // First CREATE_SESSION confirms the staged identity.
                let id_string = store
                    .unconfirmed
                    .values()
                    .find(|r| r.client_id == client_id)
                    .map(|r| r.id_string.clone())
                    .ok_or_else(NfsError::stale_clientid)?;
                let mut record =
                    store.unconfirmed.remove(&id_string).expect("found above");
                record.sequence_id = seq;
                record.cached_create_session = Some(encoded_reply);
                record.callback = callback;
                // v4.1 callback paths ride the session backchannel, which
                // exists from this point on.
                record.cb_path_up = true;
                record.confirmed = true;

                let evicted = store
                    .confirmed_by_name
                    .insert(id_string, client_id)
                    .filter(|old| *old != client_id);
                let dropped = match evicted {
                    Some(old_id) => {
                        info!(old_id, client_id, "evicted superseded confirmed client");
                        Self::remove_client_locked(&mut store, &self.lock_manager, old_id)
                    }
                    None => Vec::new(),
                };
                store.clients.insert(client_id, record);
                (true, dropped)
            }
        };
        self.notify_delegations_dropped(&dropped_delegations);
        if newly_confirmed {
            info!(client_id, "client confirmed via CREATE_SESSION");
            self.start_lease(client_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lease expiry cascade
    // ------------------------------------------------------------------

    /// Removes a client and everything it owns. Runs from the lease timer
    /// but also from administrative eviction.
    pub fn expire_client(&self, client_id: clientid4) {
        let dropped_delegations = {
            let mut store = self.store.write().expect("state store poisoned");
            if !store.clients.contains_key(&client_id) {
                return;
            }
            warn!(client_id, "expiring client state");
            Self::remove_client_locked(&mut store, &self.lock_manager, client_id)
        };
        self.notify_delegations_dropped(&dropped_delegations);
    }

    /// The cascade: locks, opens, owners, delegations, then the record.
    /// Returns the keys of the removed delegations; the caller passes them
    /// to [`Self::notify_delegations_dropped`] once the store lock is gone.
    fn remove_client_locked(
        store: &mut StateStore,
        lock_manager: &LockManager,
        client_id: clientid4,
    ) -> Vec<Other> {
        // Byte-range locks and lock-states.
        let lock_others: Vec<Other> = store
            .locks
            .iter()
            .filter(|(_, l)| l.owner.client_id == client_id)
            .map(|(other, _)| *other)
            .collect();
        for other in lock_others {
            store.locks.remove(&other);
        }
        store.lock_owners.retain(|key, _| key.client_id != client_id);
        lock_manager.release_client(client_id);

        // Opens and open-owners.
        let open_others: Vec<Other> = store
            .opens
            .iter()
            .filter(|(_, o)| o.owner.client_id == client_id)
            .map(|(other, _)| *other)
            .collect();
        for other in open_others {
            store.opens.remove(&other);
        }
        store.open_owners.retain(|key, _| key.client_id != client_id);

        // Delegations.
        let deleg_others: Vec<Other> = store
            .delegations
            .iter()
            .filter(|(_, d)| d.client_id == client_id)
            .map(|(other, _)| *other)
            .collect();
        for other in &deleg_others {
            if let Some(deleg) = store.delegations.remove(other) {
                Self::unindex_delegation(store, &deleg.fh, other);
            }
        }

        if let Some(record) = store.clients.remove(&client_id) {
            record.lease.stop();
            if store.confirmed_by_name.get(&record.id_string) == Some(&client_id) {
                store.confirmed_by_name.remove(&record.id_string);
            }
        }
        store.unconfirmed.retain(|_, r| r.client_id != client_id);
        deleg_others
    }

    fn unindex_delegation(store: &mut StateStore, fh: &[u8], other: &Other) {
        if let Some(list) = store.delegations_by_file.get_mut(fh) {
            list.retain(|o| o != other);
            if list.is_empty() {
                store.delegations_by_file.remove(fh);
            }
        }
    }

    /// Renews the owning client's lease if it is alive; the final step of
    /// every successful stateid validation.
    fn renew_owning_lease(store: &StateStore, client_id: clientid4) -> Result<()> {
        let record = store
            .clients
            .get(&client_id)
            .ok_or_else(NfsError::stale_clientid)?;
        if record.lease.is_expired() {
            return Err(NfsError::expired());
        }
        record.lease.renew();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stateid validation
    // ------------------------------------------------------------------

    /// Validates a stateid against the current store (RFC 7530 §9.1.4).
    ///
    /// Returns `None` for the two special stateids, which bypass state and
    /// lease checks entirely; callers fall back to anonymous permissions.
    /// On success the owning client's lease is implicitly renewed.
    pub fn validate_stateid(
        &self,
        stateid: &stateid4,
        current_fh: &[u8],
    ) -> Result<Option<StateView>> {
        // Specialness precedes type routing: an all-zero `other` would
        // otherwise be routed by its type byte and misreported as bad.
        if stateid.is_special() {
            return Ok(None);
        }
        let store = self.store.read().expect("state store poisoned");
        let view = Self::lookup_stateid(&self.allocator, &store, stateid, current_fh)?;
        Self::renew_owning_lease(&store, view.client_id)?;
        Ok(Some(view))
    }

    /// TEST_STATEID: per-stateid status codes, with no renewal side effect.
    pub fn test_stateids(&self, stateids: &[stateid4]) -> Vec<nfsstat4> {
        let store = self.store.read().expect("state store poisoned");
        stateids
            .iter()
            .map(|stateid| {
                if stateid.is_special() {
                    return nfsstat4::NFS4ERR_BAD_STATEID;
                }
                match Self::lookup_stateid(&self.allocator, &store, stateid, &[]) {
                    Ok(view) => match store.clients.get(&view.client_id) {
                        Some(c) if !c.lease.is_expired() => nfsstat4::NFS4_OK,
                        _ => nfsstat4::NFS4ERR_EXPIRED,
                    },
                    Err(e) => e.status,
                }
            })
            .collect()
    }

    /// Shared lookup and checks behind `validate_stateid`/`test_stateids`.
    fn lookup_stateid(
        allocator: &StateidAllocator,
        store: &StateStore,
        stateid: &stateid4,
        current_fh: &[u8],
    ) -> Result<StateView> {
        let not_found = |other: &Other| {
            if allocator.is_current_epoch(other) {
                NfsError::bad_stateid("no state with this id")
            } else {
                NfsError::stale_stateid()
            }
        };

        let (current_seqid, client_id, fh, share_access, share_deny, revoked) =
            match StateidType::from_byte(stateid.other[0]) {
                Some(StateidType::Open) => {
                    let open = store.opens.get(&stateid.other).ok_or_else(|| {
                        not_found(&stateid.other)
                    })?;
                    (
                        open.stateid.seqid,
                        open.owner.client_id,
                        open.fh.clone(),
                        open.share_access,
                        open.share_deny,
                        false,
                    )
                }
                Some(StateidType::Lock) => {
                    let lock = store.locks.get(&stateid.other).ok_or_else(|| {
                        not_found(&stateid.other)
                    })?;
                    let (access, deny) = store
                        .opens
                        .get(&lock.open_other)
                        .map(|o| (o.share_access, o.share_deny))
                        .unwrap_or((0, 0));
                    (
                        lock.stateid.seqid,
                        lock.owner.client_id,
                        lock.fh.clone(),
                        access,
                        deny,
                        false,
                    )
                }
                Some(StateidType::Delegation) => {
                    let deleg = store.delegations.get(&stateid.other).ok_or_else(|| {
                        not_found(&stateid.other)
                    })?;
                    let access = match deleg.deleg_type {
                        DelegationType::Write => OPEN4_SHARE_ACCESS_BOTH,
                        _ => OPEN4_SHARE_ACCESS_READ,
                    };
                    (
                        deleg.stateid.seqid,
                        deleg.client_id,
                        deleg.fh.clone(),
                        access,
                        OPEN4_SHARE_DENY_NONE,
                        deleg.revoked,
                    )
                }
                None => return Err(not_found(&stateid.other)),
            };

        if stateid.seqid < current_seqid {
            return Err(NfsError::old_stateid());
        }
        if stateid.seqid > current_seqid {
            return Err(NfsError::bad_stateid("stateid seqid from the future"));
        }
        if !current_fh.is_empty() && current_fh != fh.as_slice() {
            return Err(NfsError::bad_stateid("stateid bound to a different file"));
        }
        if revoked {
            return Err(NfsError::new(
                nfsstat4::NFS4ERR_DELEG_REVOKED,
                "delegation has been revoked",
            ));
        }

        Ok(StateView {
            stateid: *stateid,
            client_id,
            fh,
            share_access,
            share_deny,
        })
    }

    /// FREE_STATEID / administrative release of one piece of state.
    pub fn free_stateid(&self, stateid: &stateid4) -> Result<()> {
        if stateid.is_special() {
            return Err(NfsError::bad_stateid("cannot free a special stateid"));
        }
        // The hook for a freed delegation runs after the store lock is gone.
        let dropped_delegation = {
            let mut store = self.store.write().expect("state store poisoned");
            match StateidType::from_byte(stateid.other[0]) {
                Some(StateidType::Lock) => {
                    let lock = store
                        .locks
                        .remove(&stateid.other)
                        .ok_or_else(|| NfsError::bad_stateid("no lock state with this id"))?;
                    if let Some(open) = store.opens.get_mut(&lock.open_other) {
                        open.locks.retain(|o| o != &stateid.other);
                    }
                    let holder = LockHolder {
                        client_id: lock.owner.client_id,
                        owner: lock.owner.owner.clone(),
                    };
                    self.lock_manager.release_holder(&holder);
                    store.lock_owners.remove(&lock.owner);
                    None
                }
                Some(StateidType::Open) => {
                    let has_locks = store
                        .opens
                        .get(&stateid.other)
                        .ok_or_else(|| NfsError::bad_stateid("no open state with this id"))?
                        .locks
                        .iter()
                        .any(|other| store.locks.contains_key(other));
                    if has_locks {
                        return Err(NfsError::locks_held());
                    }
                    let open = store.opens.remove(&stateid.other).expect("checked above");
                    if let Some(owner) = store.open_owners.get_mut(&open.owner) {
                        owner.opens.retain(|o| o != &stateid.other);
                        if owner.opens.is_empty() {
                            store.open_owners.remove(&open.owner);
                        }
                    }
                    None
                }
                Some(StateidType::Delegation) => {
                    let deleg = store
                        .delegations
                        .remove(&stateid.other)
                        .ok_or_else(|| NfsError::bad_stateid("no delegation with this id"))?;
                    Self::unindex_delegation(&mut store, &deleg.fh, &stateid.other);
                    Some(stateid.other)
                }
                None => return Err(NfsError::bad_stateid("unknown state type byte")),
            }
        };
        if let Some(other) = dropped_delegation {
            self.notify_delegations_dropped(&[other]);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delegation records (policy lives in the delegation engine)
    // ------------------------------------------------------------------

    /// Inserts a freshly granted delegation and returns its stateid.
    pub fn insert_delegation(
        &self,
        client_id: clientid4,
        fh: Fh,
        deleg_type: DelegationType,
        notify_mask: u32,
    ) -> Result<stateid4> {
        let mut store = self.store.write().expect("state store poisoned");
        if !store.clients.contains_key(&client_id) {
            return Err(NfsError::stale_clientid());
        }
        let other = self.allocator.generate_other(StateidType::Delegation);
        let stateid = stateid4 { seqid: 1, other };
        store.delegations.insert(
            other,
            DelegationState {
                stateid,
                client_id,
                fh: fh.clone(),
                deleg_type,
                notify_mask,
                recall_sent: false,
                recall_time: None,
                revoked: false,
            },
        );
        store.delegations_by_file.entry(fh).or_default().push(other);
        Ok(stateid)
    }

    /// True if any client other than `client_id` currently has the file open.
    pub fn other_clients_have_open(&self, fh: &[u8], client_id: clientid4) -> bool {
        let store = self.store.read().expect("state store poisoned");
        store
            .opens
            .values()
            .any(|open| open.fh == fh && open.owner.client_id != client_id)
    }

    /// True if any unrevoked delegation exists on the file.
    pub fn file_has_delegation(&self, fh: &[u8]) -> bool {
        let store = self.store.read().expect("state store poisoned");
        store
            .delegations_by_file
            .get(fh)
            .map(|others| {
                others
                    .iter()
                    .filter_map(|o| store.delegations.get(o))
                    .any(|d| !d.revoked)
            })
            .unwrap_or(false)
    }

    /// Delegation count, used to enforce the configured cap.
    pub fn delegation_count(&self) -> usize {
        let store = self.store.read().expect("state store poisoned");
        store.delegations.values().filter(|d| !d.revoked).count()
    }

    /// Finds delegations that conflict with an OPEN by `client_id` and marks
    /// them recalled. A WRITE delegation conflicts with any access; a READ
    /// delegation only with WRITE access. Returns the recalls to dispatch;
    /// the caller does the dispatching with no store lock held.
    pub fn claim_conflicting_delegations(
        &self,
        fh: &[u8],
        client_id: clientid4,
        share_access: u32,
    ) -> Vec<RecallTicket> {
        let mut store = self.store.write().expect("state store poisoned");
        let Some(others) = store.delegations_by_file.get(fh).cloned() else {
            return Vec::new();
        };
        let mut tickets = Vec::new();
        for other in others {
            let Some(deleg) = store.delegations.get_mut(&other) else { continue };
            if deleg.revoked || deleg.client_id == client_id {
                continue;
            }
            let conflicts = match deleg.deleg_type {
                DelegationType::Write => true,
                DelegationType::Read | DelegationType::DirectoryRead => {
                    share_access & OPEN4_SHARE_ACCESS_WRITE != 0
                }
            };
            if !conflicts || deleg.recall_sent {
                continue;
            }
            deleg.recall_sent = true;
            deleg.recall_time = Some(Instant::now());
            let ticket_client = deleg.client_id;
            let stateid = deleg.stateid;
            let fh = deleg.fh.clone();
            if let Some((callback, minor_version)) =
                store.clients.get(&ticket_client).map(|c| (c.callback.clone(), c.minor_version))
            {
                tickets.push(RecallTicket {
                    client_id: ticket_client,
                    stateid,
                    fh,
                    callback,
                    minor_version,
                });
            }
        }
        tickets
    }

    /// Marks one specific delegation recalled and builds its recall ticket.
    /// Returns `None` when the delegation is gone, revoked, or already being
    /// recalled.
    pub fn begin_recall(&self, other: &Other) -> Option<RecallTicket> {
        let mut store = self.store.write().expect("state store poisoned");
        let deleg = store.delegations.get_mut(other)?;
        if deleg.revoked || deleg.recall_sent {
            return None;
        }
        deleg.recall_sent = true;
        deleg.recall_time = Some(Instant::now());
        let client_id = deleg.client_id;
        let stateid = deleg.stateid;
        let fh = deleg.fh.clone();
        let (callback, minor_version) = store
            .clients
            .get(&client_id)
            .map(|c| (c.callback.clone(), c.minor_version))?;
        Some(RecallTicket { client_id, stateid, fh, callback, minor_version })
    }

    /// Unrevoked directory delegations on one directory:
    /// `(other, client, notify_mask, stateid)`.
    pub fn directory_delegations_on(
        &self,
        fh: &[u8],
    ) -> Vec<(Other, clientid4, u32, stateid4)> {
        let store = self.store.read().expect("state store poisoned");
        store
            .delegations_by_file
            .get(fh)
            .into_iter()
            .flatten()
            .filter_map(|other| store.delegations.get(other).map(|d| (*other, d)))
            .filter(|(_, d)| !d.revoked && d.deleg_type == DelegationType::DirectoryRead)
            .map(|(other, d)| (other, d.client_id, d.notify_mask, d.stateid))
            .collect()
    }

    /// DELEGRETURN. Idempotent: returning a delegation that no longer exists
    /// succeeds as long as the stateid is from this boot.
    pub fn delegreturn(&self, stateid: &stateid4) -> Result<()> {
        if stateid.is_special() {
            return Err(NfsError::bad_stateid("cannot return a special stateid"));
        }
        let mut store = self.store.write().expect("state store poisoned");
        match store.delegations.remove(&stateid.other) {
            Some(deleg) => {
                Self::unindex_delegation(&mut store, &deleg.fh, &stateid.other);
                debug!(client_id = deleg.client_id, "delegation returned");
                let _ = Self::renew_owning_lease(&store, deleg.client_id);
                Ok(())
            }
            None if self.allocator.is_current_epoch(&stateid.other) => Ok(()),
            None => Err(NfsError::stale_stateid()),
        }
    }

    /// Marks a delegation revoked and removes it from the per-file index so
    /// it no longer blocks new grants or opens.
    pub fn revoke_delegation(&self, other: &Other) -> Option<Fh> {
        let mut store = self.store.write().expect("state store poisoned");
        let deleg = store.delegations.get_mut(other)?;
        deleg.revoked = true;
        let fh = deleg.fh.clone();
        let client_id = deleg.client_id;
        Self::unindex_delegation(&mut store, &fh, other);
        warn!(client_id, "delegation revoked");
        Some(fh)
    }

    /// True while the delegation exists un-returned (used by recall timers).
    pub fn delegation_outstanding(&self, other: &Other) -> bool {
        let store = self.store.read().expect("state store poisoned");
        store.delegations.get(other).map(|d| !d.revoked).unwrap_or(false)
    }

    /// Snapshot of one delegation's recall bookkeeping, for tests and the
    /// engine's timers.
    pub fn delegation_recall_state(&self, other: &Other) -> Option<(bool, bool)> {
        let store = self.store.read().expect("state store poisoned");
        store.delegations.get(other).map(|d| (d.recall_sent, d.revoked))
    }

    /// All delegations (unrevoked) held by one client on a file.
    pub fn client_delegation_on_file(&self, client_id: clientid4, fh: &[u8]) -> Option<stateid4> {
        let store = self.store.read().expect("state store poisoned");
        store
            .delegations_by_file
            .get(fh)?
            .iter()
            .filter_map(|o| store.delegations.get(o))
            .find(|d| d.client_id == client_id && !d.revoked)
            .map(|d| d.stateid)
    }

    // ------------------------------------------------------------------
    // Recovery snapshot
    // ------------------------------------------------------------------

    /// Builds the shutdown snapshot from the confirmed clients.
    pub fn snapshot(&self) -> RecoverySnapshot {
        let store = self.store.read().expect("state store poisoned");
        RecoverySnapshot {
            clients: store
                .clients
                .values()
                .filter(|c| c.confirmed)
                .map(|c| SnapshotClient {
                    client_id: c.client_id,
                    id_string: c.id_string.clone(),
                    verifier: c.verifier.to_vec(),
                    client_addr: c.client_addr.clone(),
                })
                .collect(),
        }
    }
}
