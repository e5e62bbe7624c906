//! State-manager tests for the OPEN family and stateid validation: the
//! open / confirm / lock / close flow, owner-seqid replay semantics, stateid
//! allocation invariants, and the lease side effects of validation.

mod support;

use nfs4_mamont::protocol::xdr::encode;
use nfs4_mamont::protocol::xdr::nfs4::{
    nfs_lock_type4, nfsstat4, open_claim_type4, stateid4, OPEN4_RESULT_CONFIRM,
    OPEN4_RESULT_LOCKTYPE_POSIX, OPEN4_SHARE_ACCESS_BOTH, OPEN4_SHARE_ACCESS_READ,
    OPEN4_SHARE_ACCESS_WRITE, OPEN4_SHARE_DENY_NONE, OPEN4_SHARE_DENY_WRITE,
};
use nfs4_mamont::state::{
    LockNewArgs, LockOutcome, LocktArgs, OpenArgs, OpenOutcome, StateidOutcome, UnlockArgs,
};

use support::{confirmed_client, fresh_manager};

fn open_args(client_id: u64, owner: &[u8], seqid: u32, fh: &[u8], access: u32) -> OpenArgs {
    OpenArgs {
        client_id,
        owner: owner.to_vec(),
        seqid,
        fh: fh.to_vec(),
        share_access: access,
        share_deny: OPEN4_SHARE_DENY_NONE,
        claim: open_claim_type4::CLAIM_NULL,
        grant_delegation: None,
    }
}

fn granted(outcome: OpenOutcome) -> nfs4_mamont::protocol::xdr::nfs4::OPEN4resok {
    match outcome {
        OpenOutcome::Granted(resok) => resok,
        OpenOutcome::Replay(_) => panic!("expected a fresh grant"),
    }
}

fn granted_stateid(outcome: StateidOutcome) -> stateid4 {
    match outcome {
        StateidOutcome::Granted(stateid) => stateid,
        StateidOutcome::Replay(_) => panic!("expected a fresh grant"),
    }
}

#[tokio::test]
async fn open_confirm_lock_close_flow() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"client-one");
    let fh = b"file-1".to_vec();

    // First OPEN from a fresh owner must be told to confirm.
    let resok = granted(
        manager
            .open_file(&open_args(client, b"oo", 1, &fh, OPEN4_SHARE_ACCESS_BOTH))
            .expect("OPEN"),
    );
    assert_ne!(resok.rflags & OPEN4_RESULT_CONFIRM, 0);
    assert_ne!(resok.rflags & OPEN4_RESULT_LOCKTYPE_POSIX, 0);
    let open_stateid = resok.stateid;
    assert_eq!(open_stateid.seqid, 1);

    let open_stateid = granted_stateid(
        manager
            .confirm_open(client, b"oo".to_vec(), 2, &open_stateid)
            .expect("OPEN_CONFIRM"),
    );
    assert_eq!(open_stateid.seqid, 2);

    // Write lock under a new lock-owner.
    let lock_outcome = manager
        .lock_new(&LockNewArgs {
            client_id: client,
            open_stateid,
            open_owner: b"oo".to_vec(),
            open_seqid: 3,
            lock_owner: b"lo".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::WRITE_LT,
            offset: 0,
            length: 100,
            reclaim: false,
        })
        .expect("LOCK");
    let lock_stateid = match lock_outcome {
        LockOutcome::Granted(stateid) => stateid,
        other => panic!("expected granted lock, got {other:?}"),
    };

    // CLOSE with the lock still held is refused.
    let err = manager
        .close_file(client, b"oo".to_vec(), 4, &open_stateid)
        .expect_err("CLOSE with locks");
    assert_eq!(err.status, nfsstat4::NFS4ERR_LOCKS_HELD);

    // Unlock, drop the owner, then CLOSE succeeds with the same seqid the
    // failed attempt used (failures do not consume the stream).
    let unlocked = manager
        .unlock(&UnlockArgs {
            client_id: client,
            lock_stateid,
            seqid: 2,
            offset: 0,
            length: 100,
        })
        .expect("LOCKU");
    assert!(matches!(unlocked, LockOutcome::Granted(_)));
    manager
        .release_lock_owner(client, b"lo".to_vec())
        .expect("RELEASE_LOCKOWNER");

    let closed = granted_stateid(
        manager
            .close_file(client, b"oo".to_vec(), 4, &open_stateid)
            .expect("CLOSE"),
    );
    assert_eq!(closed, stateid4::anonymous());
}

#[tokio::test]
async fn owner_seqid_replay_returns_cached_bytes() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"client-two");
    let fh = b"file-2".to_vec();

    let first = granted(
        manager
            .open_file(&open_args(client, b"owner", 1, &fh, OPEN4_SHARE_ACCESS_READ))
            .expect("OPEN"),
    );
    let first_bytes = encode(&first).expect("encode");

    // Same seqid replays the exact cached bytes.
    match manager
        .open_file(&open_args(client, b"owner", 1, &fh, OPEN4_SHARE_ACCESS_READ))
        .expect("OPEN replay")
    {
        OpenOutcome::Replay(cached) => {
            assert_eq!(cached.status, nfsstat4::NFS4_OK);
            assert_eq!(cached.body, first_bytes);
        }
        OpenOutcome::Granted(_) => panic!("replay must come from the cache"),
    }

    // Neither replay nor successor: BAD_SEQID.
    let err = manager
        .open_file(&open_args(client, b"owner", 5, &fh, OPEN4_SHARE_ACCESS_READ))
        .expect_err("bad seqid");
    assert_eq!(err.status, nfsstat4::NFS4ERR_BAD_SEQID);

    // Re-opening with the successor accumulates share bits on the same
    // state and bumps its stateid seqid.
    let second = granted(
        manager
            .open_file(&open_args(client, b"owner", 2, &fh, OPEN4_SHARE_ACCESS_WRITE))
            .expect("OPEN upgrade"),
    );
    assert_eq!(second.stateid.other, first.stateid.other);
    assert_eq!(second.stateid.seqid, first.stateid.seqid + 1);
    let view = manager
        .validate_stateid(&second.stateid, &fh)
        .expect("validate")
        .expect("not special");
    assert_eq!(view.share_access, OPEN4_SHARE_ACCESS_BOTH);
}

#[tokio::test]
async fn close_retransmit_replays_cached_reply() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"closer");

    // Two opens under one owner, so the owner outlives the first CLOSE and
    // its replay cache stays reachable.
    let kept = granted(
        manager
            .open_file(&open_args(client, b"oo", 1, b"kept-file", OPEN4_SHARE_ACCESS_READ))
            .expect("OPEN kept"),
    );
    let closing = granted(
        manager
            .open_file(&open_args(client, b"oo", 2, b"closing-file", OPEN4_SHARE_ACCESS_READ))
            .expect("OPEN closing"),
    );

    let closed = granted_stateid(
        manager
            .close_file(client, b"oo".to_vec(), 3, &closing.stateid)
            .expect("CLOSE"),
    );
    assert_eq!(closed, stateid4::anonymous());

    // A retransmitted CLOSE with the same owner seqid replays CLOSE's own
    // cached bytes, not whatever the previous operation cached.
    match manager
        .close_file(client, b"oo".to_vec(), 3, &closing.stateid)
        .expect("CLOSE retransmit")
    {
        StateidOutcome::Replay(cached) => {
            assert_eq!(cached.status, nfsstat4::NFS4_OK);
            assert_eq!(cached.body, encode(&stateid4::anonymous()).expect("encode"));
        }
        StateidOutcome::Granted(_) => panic!("retransmit must come from the cache"),
    }

    // The sibling open is untouched by the replay.
    manager
        .validate_stateid(&kept.stateid, b"kept-file")
        .expect("validate")
        .expect("not special");
}

#[tokio::test]
async fn stateids_are_unique_and_epoch_tagged() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"client-three");

    let mut others = std::collections::HashSet::new();
    for i in 0..32_u32 {
        let fh = format!("uniq-{i}").into_bytes();
        let resok = granted(
            manager
                .open_file(&open_args(client, b"owner", i + 1, &fh, OPEN4_SHARE_ACCESS_READ))
                .expect("OPEN"),
        );
        assert!(others.insert(resok.stateid.other), "duplicate stateid issued");
        assert_eq!(resok.stateid.other[0], 0x01);
    }

    // Damaging the epoch fragment turns the id stale, not bad.
    let sample = *others.iter().next().expect("at least one");
    let mut foreign = sample;
    foreign[1] ^= 0xff;
    let err = manager
        .validate_stateid(&stateid4 { seqid: 1, other: foreign }, &[])
        .expect_err("stale epoch");
    assert_eq!(err.status, nfsstat4::NFS4ERR_STALE_STATEID);

    // Same epoch but unknown serial is bad, not stale.
    let mut unknown = sample;
    unknown[11] ^= 0xff;
    let err = manager
        .validate_stateid(&stateid4 { seqid: 1, other: unknown }, &[])
        .expect_err("unknown id");
    assert_eq!(err.status, nfsstat4::NFS4ERR_BAD_STATEID);
}

#[tokio::test]
async fn validation_rules_and_lease_renewal() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"client-four");
    let fh = b"file-4".to_vec();

    let resok = granted(
        manager
            .open_file(&open_args(client, b"owner", 1, &fh, OPEN4_SHARE_ACCESS_READ))
            .expect("OPEN"),
    );
    let stateid = resok.stateid;

    // Special stateids bypass lookup entirely.
    assert!(manager
        .validate_stateid(&stateid4::anonymous(), &fh)
        .expect("anonymous")
        .is_none());
    assert!(manager
        .validate_stateid(&stateid4::read_bypass(), &fh)
        .expect("read bypass")
        .is_none());

    // Wrong file handle is BAD_STATEID; an empty handle skips the check.
    let err = manager
        .validate_stateid(&stateid, b"other-file")
        .expect_err("wrong fh");
    assert_eq!(err.status, nfsstat4::NFS4ERR_BAD_STATEID);
    assert!(manager.validate_stateid(&stateid, &[]).expect("no fh").is_some());

    // Older and future seqids are rejected distinctly.
    let bumped = granted_stateid(
        manager
            .confirm_open(client, b"owner".to_vec(), 2, &stateid)
            .expect("OPEN_CONFIRM"),
    );
    let err = manager.validate_stateid(&stateid, &fh).expect_err("old seqid");
    assert_eq!(err.status, nfsstat4::NFS4ERR_OLD_STATEID);
    let future = stateid4 { seqid: bumped.seqid + 1, other: bumped.other };
    let err = manager.validate_stateid(&future, &fh).expect_err("future seqid");
    assert_eq!(err.status, nfsstat4::NFS4ERR_BAD_STATEID);

    // Successful validation implicitly renews the lease.
    let before = manager.client_last_renew(client).expect("lease");
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    manager.validate_stateid(&bumped, &fh).expect("validate");
    let after = manager.client_last_renew(client).expect("lease");
    assert!(after > before, "validation must renew the lease");

    // test_stateids reports without renewing.
    let statuses = manager.test_stateids(&[bumped, stateid4::anonymous()]);
    assert_eq!(statuses[0], nfsstat4::NFS4_OK);
    assert_eq!(statuses[1], nfsstat4::NFS4ERR_BAD_STATEID);
    let unrenewed = manager.client_last_renew(client).expect("lease");
    assert_eq!(unrenewed, after);
}

#[tokio::test]
async fn downgrade_only_contracts() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"client-five");
    let fh = b"file-5".to_vec();

    let mut args = open_args(client, b"owner", 1, &fh, OPEN4_SHARE_ACCESS_BOTH);
    args.share_deny = OPEN4_SHARE_DENY_WRITE;
    let resok = granted(manager.open_file(&args).expect("OPEN"));
    let stateid = granted_stateid(
        manager
            .confirm_open(client, b"owner".to_vec(), 2, &resok.stateid)
            .expect("OPEN_CONFIRM"),
    );

    // Adding a deny bit is rejected.
    let err = manager
        .downgrade_open(
            client,
            b"owner".to_vec(),
            3,
            &stateid,
            OPEN4_SHARE_ACCESS_READ,
            0x3,
        )
        .expect_err("widening downgrade");
    assert_eq!(err.status, nfsstat4::NFS4ERR_INVAL);

    // Downgrading to zero access is rejected.
    let err = manager
        .downgrade_open(client, b"owner".to_vec(), 3, &stateid, 0, 0)
        .expect_err("empty access");
    assert_eq!(err.status, nfsstat4::NFS4ERR_INVAL);

    // A genuine contraction succeeds and bumps the stateid.
    let narrowed = granted_stateid(
        manager
            .downgrade_open(
                client,
                b"owner".to_vec(),
                3,
                &stateid,
                OPEN4_SHARE_ACCESS_READ,
                OPEN4_SHARE_DENY_NONE,
            )
            .expect("OPEN_DOWNGRADE"),
    );
    assert_eq!(narrowed.seqid, stateid.seqid + 1);
    let view = manager
        .validate_stateid(&narrowed, &fh)
        .expect("validate")
        .expect("not special");
    assert_eq!(view.share_access, OPEN4_SHARE_ACCESS_READ);
    assert_eq!(view.share_deny, OPEN4_SHARE_DENY_NONE);
}

#[tokio::test]
async fn share_reservations_deny_conflicting_opens() {
    let manager = fresh_manager();
    let client_a = confirmed_client(&manager, b"client-a");
    let client_b = confirmed_client(&manager, b"client-b");
    let fh = b"contested".to_vec();

    let mut args = open_args(client_a, b"a-owner", 1, &fh, OPEN4_SHARE_ACCESS_BOTH);
    args.share_deny = OPEN4_SHARE_DENY_WRITE;
    manager.open_file(&args).expect("first OPEN");

    // B asking for write access hits A's deny bits.
    let err = manager
        .open_file(&open_args(client_b, b"b-owner", 1, &fh, OPEN4_SHARE_ACCESS_WRITE))
        .expect_err("share conflict");
    assert_eq!(err.status, nfsstat4::NFS4ERR_SHARE_DENIED);

    // Read-only access is compatible.
    manager
        .open_file(&open_args(client_b, b"b-owner", 1, &fh, OPEN4_SHARE_ACCESS_READ))
        .expect("read OPEN");
}

#[tokio::test]
async fn lockt_is_a_pure_query_and_locku_is_idempotent() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"client-locks");
    let fh = b"locked-file".to_vec();

    let resok = granted(
        manager
            .open_file(&open_args(client, b"oo", 1, &fh, OPEN4_SHARE_ACCESS_BOTH))
            .expect("OPEN"),
    );
    let open_stateid = granted_stateid(
        manager
            .confirm_open(client, b"oo".to_vec(), 2, &resok.stateid)
            .expect("OPEN_CONFIRM"),
    );

    // LOCKT with no conflicting lock: no state appears.
    let held_before = manager.lock_manager().held_count();
    let probe = manager
        .test_lock(
            &LocktArgs {
                client_id: client,
                owner: b"probe-owner".to_vec(),
                locktype: nfs_lock_type4::WRITE_LT,
                offset: 0,
                length: 10,
            },
            &fh,
        )
        .expect("LOCKT");
    assert!(probe.is_none());
    assert_eq!(manager.lock_manager().held_count(), held_before);

    let lock_stateid = match manager
        .lock_new(&LockNewArgs {
            client_id: client,
            open_stateid,
            open_owner: b"oo".to_vec(),
            open_seqid: 3,
            lock_owner: b"lo".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::WRITE_LT,
            offset: 100,
            length: 100,
            reclaim: false,
        })
        .expect("LOCK")
    {
        LockOutcome::Granted(stateid) => stateid,
        other => panic!("expected grant, got {other:?}"),
    };

    // A different owner probing the held range sees the conflict.
    let denied = manager
        .test_lock(
            &LocktArgs {
                client_id: client,
                owner: b"probe-owner".to_vec(),
                locktype: nfs_lock_type4::READ_LT,
                offset: 150,
                length: 10,
            },
            &fh,
        )
        .expect("LOCKT")
        .expect("conflict reported");
    assert_eq!(denied.offset, 100);
    assert_eq!(denied.length, 100);
    assert_eq!(denied.locktype, nfs_lock_type4::WRITE_LT);
    assert_eq!(denied.owner.owner, b"lo".to_vec());

    // Unlocking a range that was never held still succeeds and advances the
    // lock stateid.
    let outcome = manager
        .unlock(&UnlockArgs {
            client_id: client,
            lock_stateid,
            seqid: 2,
            offset: 5000,
            length: 1,
        })
        .expect("idempotent LOCKU");
    match outcome {
        LockOutcome::Granted(stateid) => assert_eq!(stateid.seqid, lock_stateid.seqid + 1),
        other => panic!("expected grant, got {other:?}"),
    }
}

#[tokio::test]
async fn blocking_lock_variants_do_not_block() {
    let manager = fresh_manager();
    let client_a = confirmed_client(&manager, b"waiter-a");
    let client_b = confirmed_client(&manager, b"waiter-b");
    let fh = b"busy-file".to_vec();

    for (client, owner) in [(client_a, b"oa".as_slice()), (client_b, b"ob".as_slice())] {
        let resok = granted(
            manager
                .open_file(&open_args(client, owner, 1, &fh, OPEN4_SHARE_ACCESS_BOTH))
                .expect("OPEN"),
        );
        manager
            .confirm_open(client, owner.to_vec(), 2, &resok.stateid)
            .expect("OPEN_CONFIRM");
    }

    // Re-open to learn A's current open stateid after the confirm bump.
    let stateid_a = granted(
        manager
            .open_file(&open_args(client_a, b"oa", 3, &fh, OPEN4_SHARE_ACCESS_BOTH))
            .expect("OPEN again"),
    )
    .stateid;

    manager
        .lock_new(&LockNewArgs {
            client_id: client_a,
            open_stateid: stateid_a,
            open_owner: b"oa".to_vec(),
            open_seqid: 4,
            lock_owner: b"la".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::WRITE_LT,
            offset: 0,
            length: u64::MAX,
            reclaim: false,
        })
        .expect("LOCK A");

    let stateid_b = granted(
        manager
            .open_file(&open_args(client_b, b"ob", 3, &fh, OPEN4_SHARE_ACCESS_BOTH))
            .expect("OPEN B again"),
    )
    .stateid;

    // WRITEW_LT is answered immediately with the conflict.
    let outcome = manager
        .lock_new(&LockNewArgs {
            client_id: client_b,
            open_stateid: stateid_b,
            open_owner: b"ob".to_vec(),
            open_seqid: 4,
            lock_owner: b"lb".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::WRITEW_LT,
            offset: 10,
            length: 10,
            reclaim: false,
        })
        .expect("LOCK B");
    match outcome {
        LockOutcome::Denied(denied) => {
            assert_eq!(denied.owner.clientid, client_a);
        }
        other => panic!("blocking variant must deny immediately, got {other:?}"),
    }
}

#[tokio::test]
async fn openmode_gates_lock_types() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"read-only-client");
    let fh = b"readonly-file".to_vec();

    let resok = granted(
        manager
            .open_file(&open_args(client, b"oo", 1, &fh, OPEN4_SHARE_ACCESS_READ))
            .expect("OPEN"),
    );
    let open_stateid = granted_stateid(
        manager
            .confirm_open(client, b"oo".to_vec(), 2, &resok.stateid)
            .expect("OPEN_CONFIRM"),
    );

    let err = manager
        .lock_new(&LockNewArgs {
            client_id: client,
            open_stateid,
            open_owner: b"oo".to_vec(),
            open_seqid: 3,
            lock_owner: b"lo".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::WRITE_LT,
            offset: 0,
            length: 1,
            reclaim: false,
        })
        .expect_err("write lock on read-only open");
    assert_eq!(err.status, nfsstat4::NFS4ERR_OPENMODE);
}

#[tokio::test]
async fn free_stateid_honors_per_type_rules() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"freeing-client");
    let fh = b"free-file".to_vec();

    let resok = granted(
        manager
            .open_file(&open_args(client, b"oo", 1, &fh, OPEN4_SHARE_ACCESS_BOTH))
            .expect("OPEN"),
    );
    let open_stateid = granted_stateid(
        manager
            .confirm_open(client, b"oo".to_vec(), 2, &resok.stateid)
            .expect("OPEN_CONFIRM"),
    );
    let lock_stateid = match manager
        .lock_new(&LockNewArgs {
            client_id: client,
            open_stateid,
            open_owner: b"oo".to_vec(),
            open_seqid: 3,
            lock_owner: b"lo".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::READ_LT,
            offset: 0,
            length: 10,
            reclaim: false,
        })
        .expect("LOCK")
    {
        LockOutcome::Granted(stateid) => stateid,
        other => panic!("expected grant, got {other:?}"),
    };

    // Specials cannot be freed.
    let err = manager
        .free_stateid(&stateid4::anonymous())
        .expect_err("free special");
    assert_eq!(err.status, nfsstat4::NFS4ERR_BAD_STATEID);

    // Open with lock states: LOCKS_HELD.
    let err = manager
        .free_stateid(&open_stateid)
        .expect_err("free open with locks");
    assert_eq!(err.status, nfsstat4::NFS4ERR_LOCKS_HELD);

    // Freeing the lock state releases the ranges and drops the owner.
    manager.free_stateid(&lock_stateid).expect("free lock");
    assert_eq!(manager.lock_manager().held_count(), 0);

    // Now the open can go too.
    manager.free_stateid(&open_stateid).expect("free open");
    let err = manager
        .validate_stateid(&open_stateid, &fh)
        .expect_err("open is gone");
    assert_eq!(err.status, nfsstat4::NFS4ERR_BAD_STATEID);
}
