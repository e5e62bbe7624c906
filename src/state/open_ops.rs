//! OPEN / OPEN_CONFIRM / OPEN_DOWNGRADE / CLOSE against the central store,
//! including the per-open-owner seqid replay cache (RFC 7530 §9.1.7).
//!
//! Owner seqids advance only on success; failed operations leave the stream
//! where it was so the client can retry with the same seqid. A replayed
//! seqid returns the exact encoded bytes of the previous reply.

use tracing::debug;

use crate::protocol::xdr::encode;
use crate::protocol::xdr::nfs4::{
    clientid4, nfsace4, nfsstat4, open_claim_type4, open_delegation4, open_read_delegation4,
    open_write_delegation4, stateid4, OPEN4resok, OPEN4_RESULT_CONFIRM,
    OPEN4_RESULT_LOCKTYPE_POSIX, OPEN4_SHARE_ACCESS_WRITE,
};
use crate::state::error::{NfsError, Result};
use crate::state::records::{
    CachedReply, DelegationState, DelegationType, Fh, OpenOwner, OpenState, OwnerKey,
};
use crate::state::stateid::{next_seqid, StateidType};
use crate::state::StateManager;

/// Arguments of one OPEN as the dispatch shell hands them over.
#[derive(Clone, Debug)]
pub struct OpenArgs {
    pub client_id: clientid4,
    pub owner: Vec<u8>,
    pub seqid: u32,
    pub fh: Fh,
    pub share_access: u32,
    pub share_deny: u32,
    pub claim: open_claim_type4,
    /// Set by the delegation engine when its grant policy passed; the
    /// delegation is allocated atomically with the open so the cached reply
    /// carries it.
    pub grant_delegation: Option<DelegationType>,
}

/// Result of an OPEN: a fresh grant or a cache replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    Granted(OPEN4resok),
    /// The owner replayed its last seqid; these are the cached bytes of the
    /// previous reply, returned verbatim.
    Replay(CachedReply),
}

/// Result of the other seqid-validated open-family operations, which reply
/// with a bare stateid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateidOutcome {
    Granted(stateid4),
    Replay(CachedReply),
}

/// How an incoming owner seqid relates to the stream.
enum SeqDisposition {
    Next,
    Replay,
}

fn check_owner_seqid(last: u32, incoming: u32) -> Result<SeqDisposition> {
    if incoming == last {
        return Ok(SeqDisposition::Replay);
    }
    if incoming == next_seqid(last) {
        return Ok(SeqDisposition::Next);
    }
    Err(NfsError::bad_seqid(format!(
        "owner seqid {incoming} is neither replay of {last} nor its successor"
    )))
}

impl StateManager {
    /// OPEN. Grace gating, owner seqid validation, share accumulation, and
    /// new-state allocation. Delegation granting and recall dispatch are the
    /// delegation engine's composition around this method.
    pub fn open_file(&self, args: &OpenArgs) -> Result<OpenOutcome> {
        let grace_active = self.grace().is_active();
        match args.claim {
            open_claim_type4::CLAIM_NULL if grace_active => return Err(NfsError::grace()),
            open_claim_type4::CLAIM_PREVIOUS if !grace_active => {
                return Err(NfsError::no_grace())
            }
            _ => {}
        }
        if args.share_access == 0 {
            return Err(NfsError::inval("OPEN with empty share_access"));
        }

        let outcome = {
            let mut store = self.store.write().expect("state store poisoned");

            let client = store
                .clients
                .get(&args.client_id)
                .filter(|c| c.confirmed)
                .ok_or_else(NfsError::stale_clientid)?;
            if client.lease.is_expired() {
                return Err(NfsError::expired());
            }

            let key = OwnerKey { client_id: args.client_id, owner: args.owner.clone() };
            let existing_owner = store.open_owners.get(&key);
            if let Some(owner) = existing_owner {
                if let SeqDisposition::Replay = check_owner_seqid(owner.last_seqid, args.seqid)? {
                    return owner
                        .last_reply
                        .clone()
                        .map(OpenOutcome::Replay)
                        .ok_or_else(|| NfsError::bad_seqid("replay of an uncached operation"));
                }
            }

            // A conflicting delegation held by another client forces the
            // open to wait for the recall the engine is dispatching.
            let conflicting_delegation = store
                .delegations_by_file
                .get(&args.fh)
                .into_iter()
                .flatten()
                .filter_map(|other| store.delegations.get(other))
                .any(|d| {
                    !d.revoked
                        && d.client_id != args.client_id
                        && match d.deleg_type {
                            DelegationType::Write => true,
                            _ => args.share_access & OPEN4_SHARE_ACCESS_WRITE != 0,
                        }
                });
            if conflicting_delegation {
                return Err(NfsError::delay("file delegated to another client"));
            }

            // Share reservations: deny bits of other opens against our
            // access, and our deny bits against their access.
            let share_conflict = store.opens.values().any(|open| {
                open.fh == args.fh
                    && open.owner != key
                    && ((args.share_access & open.share_deny) != 0
                        || (args.share_deny & open.share_access) != 0)
            });
            if share_conflict {
                return Err(NfsError::share_denied());
            }

            let owner_confirmed =
                store.open_owners.get(&key).map(|o| o.confirmed).unwrap_or(false);

            // Same owner re-opening the same file accumulates share bits on
            // the existing state instead of allocating a new one.
            let existing_open = store
                .open_owners
                .get(&key)
                .into_iter()
                .flat_map(|o| o.opens.iter())
                .find(|other| {
                    store.opens.get(*other).map(|o| o.fh == args.fh).unwrap_or(false)
                })
                .copied();

            let stateid = match existing_open {
                Some(other) => {
                    let open = store
                        .opens
                        .get_mut(&other)
                        .ok_or_else(|| NfsError::serverfault("open index desynchronized"))?;
                    open.share_access |= args.share_access;
                    open.share_deny |= args.share_deny;
                    open.stateid.seqid = next_seqid(open.stateid.seqid);
                    open.stateid
                }
                None => {
                    let other = self.allocator.generate_other(StateidType::Open);
                    let stateid = stateid4 { seqid: 1, other };
                    store.opens.insert(
                        other,
                        OpenState {
                            stateid,
                            owner: key.clone(),
                            fh: args.fh.clone(),
                            share_access: args.share_access,
                            share_deny: args.share_deny,
                            confirmed: owner_confirmed,
                            locks: Vec::new(),
                        },
                    );
                    let owner = store.open_owners.entry(key.clone()).or_insert_with(|| {
                        OpenOwner {
                            key: key.clone(),
                            last_seqid: args.seqid,
                            confirmed: false,
                            opens: Vec::new(),
                            last_reply: None,
                        }
                    });
                    owner.opens.push(other);
                    stateid
                }
            };

            let mut rflags = OPEN4_RESULT_LOCKTYPE_POSIX;
            if !owner_confirmed {
                rflags |= OPEN4_RESULT_CONFIRM;
            }

            let delegation = match args.grant_delegation {
                Some(deleg_type) => {
                    let other = self.allocator.generate_other(StateidType::Delegation);
                    let deleg_stateid = stateid4 { seqid: 1, other };
                    store.delegations.insert(
                        other,
                        DelegationState {
                            stateid: deleg_stateid,
                            client_id: args.client_id,
                            fh: args.fh.clone(),
                            deleg_type,
                            notify_mask: 0,
                            recall_sent: false,
                            recall_time: None,
                            revoked: false,
                        },
                    );
                    store
                        .delegations_by_file
                        .entry(args.fh.clone())
                        .or_default()
                        .push(other);
                    let write = deleg_type == DelegationType::Write;
                    let permissions = nfsace4 {
                        acetype: 0,
                        flag: 0,
                        access_mask: if write { 0x001f_01ff } else { 0x0012_00a9 },
                        who: "EVERYONE@".to_string(),
                    };
                    if write {
                        open_delegation4::Write(open_write_delegation4 {
                            stateid: deleg_stateid,
                            recall: false,
                            space_limit: Default::default(),
                            permissions,
                        })
                    } else {
                        open_delegation4::Read(open_read_delegation4 {
                            stateid: deleg_stateid,
                            recall: false,
                            permissions,
                        })
                    }
                }
                None => open_delegation4::None,
            };

            let resok = OPEN4resok {
                stateid,
                cinfo: Default::default(),
                rflags,
                attrset: Vec::new(),
                delegation,
            };

            let encoded = encode(&resok)
                .map_err(|e| NfsError::serverfault(format!("OPEN reply encoding: {e}")))?;
            let owner = store
                .open_owners
                .get_mut(&key)
                .ok_or_else(|| NfsError::serverfault("owner vanished during OPEN"))?;
            owner.last_seqid = args.seqid;
            owner.last_reply = Some(CachedReply { status: nfsstat4::NFS4_OK, body: encoded });

            Self::renew_owning_lease(&store, args.client_id)?;
            debug!(client_id = args.client_id, stateid = %stateid, "open granted");
            OpenOutcome::Granted(resok)
        };

        // The reclaim note can end the grace period, whose end callback must
        // not run under the store lock.
        if grace_active && args.claim == open_claim_type4::CLAIM_PREVIOUS {
            self.note_grace_reclaim(args.client_id);
        }
        Ok(outcome)
    }

    /// OPEN_CONFIRM: promotes the owner and its open, bumps the stateid.
    pub fn confirm_open(
        &self,
        client_id: clientid4,
        owner: Vec<u8>,
        seqid: u32,
        stateid: &stateid4,
    ) -> Result<StateidOutcome> {
        let mut store = self.store.write().expect("state store poisoned");
        let key = OwnerKey { client_id, owner };

        let owner_rec = store
            .open_owners
            .get(&key)
            .ok_or_else(|| NfsError::bad_seqid("OPEN_CONFIRM from unknown owner"))?;
        if let SeqDisposition::Replay = check_owner_seqid(owner_rec.last_seqid, seqid)? {
            return owner_rec
                .last_reply
                .clone()
                .map(StateidOutcome::Replay)
                .ok_or_else(|| NfsError::bad_seqid("replay of an uncached operation"));
        }

        let open = store
            .opens
            .get_mut(&stateid.other)
            .ok_or_else(|| NfsError::bad_stateid("no open state with this id"))?;
        if open.owner != key {
            return Err(NfsError::bad_stateid("stateid belongs to a different owner"));
        }
        Self::check_state_seqid(stateid.seqid, open.stateid.seqid)?;
        open.confirmed = true;
        open.stateid.seqid = next_seqid(open.stateid.seqid);
        let new_stateid = open.stateid;

        let encoded = encode(&new_stateid)
            .map_err(|e| NfsError::serverfault(format!("OPEN_CONFIRM reply encoding: {e}")))?;
        let owner_rec = store
            .open_owners
            .get_mut(&key)
            .ok_or_else(|| NfsError::serverfault("owner vanished during OPEN_CONFIRM"))?;
        owner_rec.confirmed = true;
        owner_rec.last_seqid = seqid;
        owner_rec.last_reply = Some(CachedReply { status: nfsstat4::NFS4_OK, body: encoded });

        Self::renew_owning_lease(&store, client_id)?;
        Ok(StateidOutcome::Granted(new_stateid))
    }

    /// OPEN_DOWNGRADE: narrows the share bits; may never widen them.
    pub fn downgrade_open(
        &self,
        client_id: clientid4,
        owner: Vec<u8>,
        seqid: u32,
        stateid: &stateid4,
        share_access: u32,
        share_deny: u32,
    ) -> Result<StateidOutcome> {
        if share_access == 0 {
            return Err(NfsError::inval("OPEN_DOWNGRADE to empty share_access"));
        }
        let mut store = self.store.write().expect("state store poisoned");
        let key = OwnerKey { client_id, owner };

        let owner_rec = store
            .open_owners
            .get(&key)
            .ok_or_else(|| NfsError::bad_seqid("OPEN_DOWNGRADE from unknown owner"))?;
        if let SeqDisposition::Replay = check_owner_seqid(owner_rec.last_seqid, seqid)? {
            return owner_rec
                .last_reply
                .clone()
                .map(StateidOutcome::Replay)
                .ok_or_else(|| NfsError::bad_seqid("replay of an uncached operation"));
        }

        let open = store
            .opens
            .get_mut(&stateid.other)
            .ok_or_else(|| NfsError::bad_stateid("no open state with this id"))?;
        if open.owner != key {
            return Err(NfsError::bad_stateid("stateid belongs to a different owner"));
        }
        Self::check_state_seqid(stateid.seqid, open.stateid.seqid)?;

        // A downgrade may only subtract bits, never add them.
        if share_access & !open.share_access != 0 || share_deny & !open.share_deny != 0 {
            return Err(NfsError::inval("OPEN_DOWNGRADE attempts to widen the share"));
        }
        open.share_access = share_access;
        open.share_deny = share_deny;
        open.stateid.seqid = next_seqid(open.stateid.seqid);
        let new_stateid = open.stateid;

        let encoded = encode(&new_stateid)
            .map_err(|e| NfsError::serverfault(format!("OPEN_DOWNGRADE reply encoding: {e}")))?;
        let owner_rec = store
            .open_owners
            .get_mut(&key)
            .ok_or_else(|| NfsError::serverfault("owner vanished during OPEN_DOWNGRADE"))?;
        owner_rec.last_seqid = seqid;
        owner_rec.last_reply = Some(CachedReply { status: nfsstat4::NFS4_OK, body: encoded });

        Self::renew_owning_lease(&store, client_id)?;
        Ok(StateidOutcome::Granted(new_stateid))
    }

    /// CLOSE: removes the open-state; refuses while lock-states remain.
    /// Returns the all-zero stateid the reply carries.
    pub fn close_file(
        &self,
        client_id: clientid4,
        owner: Vec<u8>,
        seqid: u32,
        stateid: &stateid4,
    ) -> Result<StateidOutcome> {
        let mut store = self.store.write().expect("state store poisoned");
        let key = OwnerKey { client_id, owner };

        let owner_rec = store
            .open_owners
            .get(&key)
            .ok_or_else(|| NfsError::bad_seqid("CLOSE from unknown owner"))?;
        if let SeqDisposition::Replay = check_owner_seqid(owner_rec.last_seqid, seqid)? {
            return owner_rec
                .last_reply
                .clone()
                .map(StateidOutcome::Replay)
                .ok_or_else(|| NfsError::bad_seqid("replay of an uncached operation"));
        }

        let open = store
            .opens
            .get(&stateid.other)
            .ok_or_else(|| NfsError::bad_stateid("no open state with this id"))?;
        if open.owner != key {
            return Err(NfsError::bad_stateid("stateid belongs to a different owner"));
        }
        Self::check_state_seqid(stateid.seqid, open.stateid.seqid)?;
        let live_locks = open.locks.iter().any(|other| store.locks.contains_key(other));
        if live_locks {
            return Err(NfsError::locks_held());
        }

        Self::renew_owning_lease(&store, client_id)?;
        let open = store.opens.remove(&stateid.other).expect("present above");
        debug!(client_id, fh_len = open.fh.len(), "open closed");

        // The closed state's id must never validate again; the reply carries
        // the anonymous stateid.
        let closed = stateid4::anonymous();
        let encoded = encode(&closed)
            .map_err(|e| NfsError::serverfault(format!("CLOSE reply encoding: {e}")))?;
        let remove_owner = {
            let owner_rec = store
                .open_owners
                .get_mut(&key)
                .ok_or_else(|| NfsError::serverfault("owner vanished during CLOSE"))?;
            owner_rec.opens.retain(|o| o != &stateid.other);
            owner_rec.last_seqid = seqid;
            owner_rec.last_reply =
                Some(CachedReply { status: nfsstat4::NFS4_OK, body: encoded });
            owner_rec.opens.is_empty()
        };
        if remove_owner {
            store.open_owners.remove(&key);
        }

        Ok(StateidOutcome::Granted(closed))
    }

    /// Stateid seqid comparison shared by the seqid-mutating operations.
    pub(crate) fn check_state_seqid(incoming: u32, current: u32) -> Result<()> {
        if incoming < current {
            return Err(NfsError::old_stateid());
        }
        if incoming > current {
            return Err(NfsError::bad_stateid("stateid seqid from the future"));
        }
        Ok(())
    }
}
