//! LOCK / LOCKT / LOCKU / RELEASE_LOCKOWNER against the central store.
//!
//! Range arithmetic and conflict detection live in the shared byte-range
//! lock manager; this module owns the protocol metadata: lock-owners with
//! their seqid streams, lock-states, and the linkage back to the open the
//! lock was derived from.
//!
//! The blocking lock types (READW_LT / WRITEW_LT) are answered exactly like
//! their non-blocking forms: a conflict returns LOCK4denied immediately and
//! the client polls.

use tracing::debug;

use crate::protocol::xdr::encode;
use crate::protocol::xdr::nfs4::{
    clientid4, lock_owner4, nfs_lock_type4, nfsstat4, stateid4, LOCK4denied, LOCK4res,
    OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_ACCESS_WRITE,
};
use crate::state::error::{NfsError, Result};
use crate::state::lock_manager::{HeldLock, LockHolder};
use crate::state::records::{CachedReply, LockOwnerState, LockState, OwnerKey};
use crate::state::stateid::{next_seqid, StateidType};
use crate::state::StateManager;

/// LOCK under a new lock-owner: authorized by the open stateid and the
/// open-owner's seqid stream.
#[derive(Clone, Debug)]
pub struct LockNewArgs {
    pub client_id: clientid4,
    pub open_stateid: stateid4,
    pub open_owner: Vec<u8>,
    pub open_seqid: u32,
    pub lock_owner: Vec<u8>,
    pub lock_seqid: u32,
    pub locktype: nfs_lock_type4,
    pub offset: u64,
    pub length: u64,
    pub reclaim: bool,
}

/// LOCK under an existing lock-owner: authorized by the lock stateid and the
/// lock-owner's own seqid stream.
#[derive(Clone, Debug)]
pub struct LockExistingArgs {
    pub client_id: clientid4,
    pub lock_stateid: stateid4,
    pub lock_seqid: u32,
    pub locktype: nfs_lock_type4,
    pub offset: u64,
    pub length: u64,
    pub reclaim: bool,
}

/// LOCKT: a conflict probe that never creates state.
#[derive(Clone, Debug)]
pub struct LocktArgs {
    pub client_id: clientid4,
    pub owner: Vec<u8>,
    pub locktype: nfs_lock_type4,
    pub offset: u64,
    pub length: u64,
}

/// LOCKU.
#[derive(Clone, Debug)]
pub struct UnlockArgs {
    pub client_id: clientid4,
    pub lock_stateid: stateid4,
    pub seqid: u32,
    pub offset: u64,
    pub length: u64,
}

/// Result of a LOCK-family operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Granted(stateid4),
    Denied(LOCK4denied),
    Replay(CachedReply),
}

fn denied_from(conflict: HeldLock) -> LOCK4denied {
    LOCK4denied {
        offset: conflict.offset,
        length: conflict.length,
        locktype: if conflict.exclusive {
            nfs_lock_type4::WRITE_LT
        } else {
            nfs_lock_type4::READ_LT
        },
        // The holder identity round-trips the opaque owner bytes we stored;
        // foreign adapters' owners come back as-is.
        owner: lock_owner4 { clientid: conflict.holder.client_id, owner: conflict.holder.owner },
    }
}

fn check_openmode(locktype: nfs_lock_type4, share_access: u32) -> Result<()> {
    let needed = if locktype.is_write() {
        OPEN4_SHARE_ACCESS_WRITE
    } else {
        OPEN4_SHARE_ACCESS_READ
    };
    if share_access & needed == 0 {
        return Err(NfsError::openmode());
    }
    Ok(())
}

impl StateManager {
    fn lock_grace_gate(&self, reclaim: bool) -> Result<bool> {
        let active = self.grace().is_active();
        if !reclaim && active {
            return Err(NfsError::grace());
        }
        if reclaim && !active {
            return Err(NfsError::no_grace());
        }
        Ok(active)
    }

    /// LOCK, new-lock-owner path.
    pub fn lock_new(&self, args: &LockNewArgs) -> Result<LockOutcome> {
        let grace_active = self.lock_grace_gate(args.reclaim)?;

        let outcome = {
            let mut store = self.store.write().expect("state store poisoned");

            let open = store
                .opens
                .get(&args.open_stateid.other)
                .ok_or_else(|| NfsError::bad_stateid("no open state for LOCK"))?;
            if open.owner.client_id != args.client_id {
                return Err(NfsError::bad_stateid("open stateid owned by another client"));
            }
            Self::check_state_seqid(args.open_stateid.seqid, open.stateid.seqid)?;
            check_openmode(args.locktype, open.share_access)?;
            let open_owner_key = open.owner.clone();
            let fh = open.fh.clone();

            let open_owner = store
                .open_owners
                .get(&open_owner_key)
                .ok_or_else(|| NfsError::serverfault("open without owner record"))?;
            if args.open_seqid == open_owner.last_seqid {
                return open_owner
                    .last_reply
                    .clone()
                    .map(LockOutcome::Replay)
                    .ok_or_else(|| NfsError::bad_seqid("replay of an uncached operation"));
            }
            if args.open_seqid != next_seqid(open_owner.last_seqid) {
                return Err(NfsError::bad_seqid("LOCK open-owner seqid out of order"));
            }

            let lock_key = OwnerKey { client_id: args.client_id, owner: args.lock_owner.clone() };
            let holder =
                LockHolder { client_id: args.client_id, owner: args.lock_owner.clone() };
            if let Err(conflict) = self.lock_manager.try_lock(
                &fh,
                &holder,
                args.locktype.is_write(),
                args.offset,
                args.length,
            ) {
                // Denied grants bump nothing: the client retries with the
                // same seqids.
                return Ok(LockOutcome::Denied(denied_from(conflict)));
            }

            // Find or create the lock-state for this (owner, open) pair.
            let existing = store
                .lock_owners
                .get(&lock_key)
                .into_iter()
                .flat_map(|o| o.locks.iter())
                .find(|other| {
                    store
                        .locks
                        .get(*other)
                        .map(|l| l.open_other == args.open_stateid.other)
                        .unwrap_or(false)
                })
                .copied();

            let lock_stateid = match existing {
                Some(other) => {
                    let lock = store
                        .locks
                        .get_mut(&other)
                        .ok_or_else(|| NfsError::serverfault("lock index desynchronized"))?;
                    lock.stateid.seqid = next_seqid(lock.stateid.seqid);
                    lock.stateid
                }
                None => {
                    let other = self.allocator.generate_other(StateidType::Lock);
                    let lock_stateid = stateid4 { seqid: 1, other };
                    store.locks.insert(
                        other,
                        LockState {
                            stateid: lock_stateid,
                            owner: lock_key.clone(),
                            open_other: args.open_stateid.other,
                            fh: fh.clone(),
                        },
                    );
                    store
                        .lock_owners
                        .entry(lock_key.clone())
                        .or_insert_with(|| LockOwnerState {
                            key: lock_key.clone(),
                            last_seqid: args.lock_seqid,
                            locks: Vec::new(),
                            last_reply: None,
                        })
                        .locks
                        .push(other);
                    if let Some(open) = store.opens.get_mut(&args.open_stateid.other) {
                        open.locks.push(other);
                    }
                    lock_stateid
                }
            };

            let encoded = encode(&LOCK4res::Resok4(lock_stateid))
                .map_err(|e| NfsError::serverfault(format!("LOCK reply encoding: {e}")))?;
            let open_owner = store
                .open_owners
                .get_mut(&open_owner_key)
                .ok_or_else(|| NfsError::serverfault("owner vanished during LOCK"))?;
            open_owner.last_seqid = args.open_seqid;
            open_owner.last_reply =
                Some(CachedReply { status: nfsstat4::NFS4_OK, body: encoded });

            Self::renew_owning_lease(&store, args.client_id)?;
            debug!(client_id = args.client_id, stateid = %lock_stateid, "lock granted");
            LockOutcome::Granted(lock_stateid)
        };

        if grace_active && args.reclaim {
            self.note_grace_reclaim(args.client_id);
        }
        Ok(outcome)
    }

    /// LOCK, existing-lock-owner path.
    pub fn lock_existing(&self, args: &LockExistingArgs) -> Result<LockOutcome> {
        let grace_active = self.lock_grace_gate(args.reclaim)?;

        let outcome = {
            let mut store = self.store.write().expect("state store poisoned");

            let lock = store
                .locks
                .get(&args.lock_stateid.other)
                .ok_or_else(|| NfsError::bad_stateid("no lock state with this id"))?;
            if lock.owner.client_id != args.client_id {
                return Err(NfsError::bad_stateid("lock stateid owned by another client"));
            }
            Self::check_state_seqid(args.lock_stateid.seqid, lock.stateid.seqid)?;
            let lock_key = lock.owner.clone();
            let open_other = lock.open_other;
            let fh = lock.fh.clone();

            let share_access = store
                .opens
                .get(&open_other)
                .map(|o| o.share_access)
                .unwrap_or(0);
            check_openmode(args.locktype, share_access)?;

            let owner_rec = store
                .lock_owners
                .get(&lock_key)
                .ok_or_else(|| NfsError::serverfault("lock without owner record"))?;
            if args.lock_seqid == owner_rec.last_seqid {
                return owner_rec
                    .last_reply
                    .clone()
                    .map(LockOutcome::Replay)
                    .ok_or_else(|| NfsError::bad_seqid("replay of an uncached operation"));
            }
            if args.lock_seqid != next_seqid(owner_rec.last_seqid) {
                return Err(NfsError::bad_seqid("LOCK lock-owner seqid out of order"));
            }

            let holder = LockHolder { client_id: lock_key.client_id, owner: lock_key.owner.clone() };
            if let Err(conflict) = self.lock_manager.try_lock(
                &fh,
                &holder,
                args.locktype.is_write(),
                args.offset,
                args.length,
            ) {
                return Ok(LockOutcome::Denied(denied_from(conflict)));
            }

            let lock = store
                .locks
                .get_mut(&args.lock_stateid.other)
                .ok_or_else(|| NfsError::serverfault("lock vanished during LOCK"))?;
            lock.stateid.seqid = next_seqid(lock.stateid.seqid);
            let lock_stateid = lock.stateid;

            let encoded = encode(&LOCK4res::Resok4(lock_stateid))
                .map_err(|e| NfsError::serverfault(format!("LOCK reply encoding: {e}")))?;
            let owner_rec = store
                .lock_owners
                .get_mut(&lock_key)
                .ok_or_else(|| NfsError::serverfault("owner vanished during LOCK"))?;
            owner_rec.last_seqid = args.lock_seqid;
            owner_rec.last_reply = Some(CachedReply { status: nfsstat4::NFS4_OK, body: encoded });

            Self::renew_owning_lease(&store, args.client_id)?;
            LockOutcome::Granted(lock_stateid)
        };

        if grace_active && args.reclaim {
            self.note_grace_reclaim(args.client_id);
        }
        Ok(outcome)
    }

    /// LOCKT: reports a conflicting lock, creating nothing either way.
    pub fn test_lock(&self, args: &LocktArgs, fh: &[u8]) -> Result<Option<LOCK4denied>> {
        {
            let store = self.store.read().expect("state store poisoned");
            store
                .clients
                .get(&args.client_id)
                .filter(|c| c.confirmed)
                .ok_or_else(NfsError::stale_clientid)?;
            Self::renew_owning_lease(&store, args.client_id)?;
        }
        let holder = LockHolder { client_id: args.client_id, owner: args.owner.clone() };
        Ok(self
            .lock_manager
            .test_lock(fh, &holder, args.locktype.is_write(), args.offset, args.length)
            .map(denied_from))
    }

    /// LOCKU: removes the range with POSIX split semantics; idempotent.
    pub fn unlock(&self, args: &UnlockArgs) -> Result<LockOutcome> {
        let mut store = self.store.write().expect("state store poisoned");

        let lock = store
            .locks
            .get(&args.lock_stateid.other)
            .ok_or_else(|| NfsError::bad_stateid("no lock state with this id"))?;
        if lock.owner.client_id != args.client_id {
            return Err(NfsError::bad_stateid("lock stateid owned by another client"));
        }
        Self::check_state_seqid(args.lock_stateid.seqid, lock.stateid.seqid)?;
        let lock_key = lock.owner.clone();
        let fh = lock.fh.clone();

        let owner_rec = store
            .lock_owners
            .get(&lock_key)
            .ok_or_else(|| NfsError::serverfault("lock without owner record"))?;
        if args.seqid == owner_rec.last_seqid {
            return owner_rec
                .last_reply
                .clone()
                .map(LockOutcome::Replay)
                .ok_or_else(|| NfsError::bad_seqid("replay of an uncached operation"));
        }
        if args.seqid != next_seqid(owner_rec.last_seqid) {
            return Err(NfsError::bad_seqid("LOCKU seqid out of order"));
        }

        let holder = LockHolder { client_id: lock_key.client_id, owner: lock_key.owner.clone() };
        self.lock_manager.unlock(&fh, &holder, args.offset, args.length);

        let lock = store
            .locks
            .get_mut(&args.lock_stateid.other)
            .ok_or_else(|| NfsError::serverfault("lock vanished during LOCKU"))?;
        lock.stateid.seqid = next_seqid(lock.stateid.seqid);
        let lock_stateid = lock.stateid;

        let encoded = encode(&lock_stateid)
            .map_err(|e| NfsError::serverfault(format!("LOCKU reply encoding: {e}")))?;
        let owner_rec = store
            .lock_owners
            .get_mut(&lock_key)
            .ok_or_else(|| NfsError::serverfault("owner vanished during LOCKU"))?;
        owner_rec.last_seqid = args.seqid;
        owner_rec.last_reply = Some(CachedReply { status: nfsstat4::NFS4_OK, body: encoded });

        Self::renew_owning_lease(&store, args.client_id)?;
        Ok(LockOutcome::Granted(lock_stateid))
    }

    /// RELEASE_LOCKOWNER: drops a lock-owner once it holds no ranges.
    pub fn release_lock_owner(&self, client_id: clientid4, owner: Vec<u8>) -> Result<()> {
        let holder = LockHolder { client_id, owner: owner.clone() };
        if self.lock_manager.holder_has_locks(&holder) {
            return Err(NfsError::locks_held());
        }

        let mut store = self.store.write().expect("state store poisoned");
        let key = OwnerKey { client_id, owner };
        if let Some(owner_rec) = store.lock_owners.remove(&key) {
            for other in owner_rec.locks {
                if let Some(lock) = store.locks.remove(&other) {
                    if let Some(open) = store.opens.get_mut(&lock.open_other) {
                        open.locks.retain(|o| o != &other);
                    }
                }
            }
            debug!(client_id, "lock owner released");
        }
        Ok(())
    }
}
