//! Grace-period behavior after a simulated restart: reclaim gating, early
//! exit once every expected client has reclaimed, and the recovery snapshot
//! that seeds it all.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nfs4_mamont::protocol::xdr::nfs4::{
    nfs_lock_type4, nfsstat4, open_claim_type4, OPEN4_SHARE_ACCESS_READ,
    OPEN4_SHARE_DENY_NONE,
};
use nfs4_mamont::state::recovery::{RecoverySnapshot, SnapshotClient};
use nfs4_mamont::state::{LockNewArgs, OpenArgs, OpenOutcome};

use support::{confirmed_client, fresh_manager, recovering_manager};

fn reclaim_open(client_id: u64, owner: &[u8], fh: &[u8], claim: open_claim_type4) -> OpenArgs {
    OpenArgs {
        client_id,
        owner: owner.to_vec(),
        seqid: 1,
        fh: fh.to_vec(),
        share_access: OPEN4_SHARE_ACCESS_READ,
        share_deny: OPEN4_SHARE_DENY_NONE,
        claim,
        grant_delegation: None,
    }
}

fn restart_snapshot() -> RecoverySnapshot {
    RecoverySnapshot {
        clients: vec![
            SnapshotClient {
                client_id: 100,
                id_string: b"c-one".to_vec(),
                verifier: b"bootverf".to_vec(),
                client_addr: "10.0.0.1:700".to_string(),
            },
            SnapshotClient {
                client_id: 200,
                id_string: b"c-two".to_vec(),
                verifier: b"bootverf".to_vec(),
                client_addr: "10.0.0.2:700".to_string(),
            },
        ],
    }
}

#[tokio::test]
async fn grace_admits_reclaims_and_exits_early() {
    let ended = Arc::new(AtomicUsize::new(0));
    let ended_cb = Arc::clone(&ended);
    let manager =
        recovering_manager(restart_snapshot(), Box::new(move || {
            ended_cb.fetch_add(1, Ordering::SeqCst);
        }));
    assert!(manager.grace().is_active());

    // New state is refused while grace runs.
    let unknown = confirmed_client(&manager, b"newcomer");
    let err = manager
        .open_file(&reclaim_open(unknown, b"oo", b"f", open_claim_type4::CLAIM_NULL))
        .expect_err("CLAIM_NULL during grace");
    assert_eq!(err.status, nfsstat4::NFS4ERR_GRACE);

    // First expected client reclaims; grace stays active.
    let one = confirmed_client(&manager, b"c-one");
    match manager
        .open_file(&reclaim_open(one, b"oo-1", b"f1", open_claim_type4::CLAIM_PREVIOUS))
        .expect("reclaim one")
    {
        OpenOutcome::Granted(_) => {}
        OpenOutcome::Replay(_) => panic!("fresh reclaim cannot be a replay"),
    }
    assert!(manager.grace().is_active());
    assert_eq!(ended.load(Ordering::SeqCst), 0);

    // Second expected client reclaims; grace ends once, on this call path.
    let two = confirmed_client(&manager, b"c-two");
    manager
        .open_file(&reclaim_open(two, b"oo-2", b"f2", open_claim_type4::CLAIM_PREVIOUS))
        .expect("reclaim two");
    assert!(!manager.grace().is_active());
    assert_eq!(ended.load(Ordering::SeqCst), 1);

    // The end callback is idempotent against the timer racing the reclaim.
    manager.grace().end("test double end");
    assert_eq!(ended.load(Ordering::SeqCst), 1);

    // After grace: reclaims are refused, ordinary opens work.
    let err = manager
        .open_file(&reclaim_open(one, b"oo-1", b"f3", open_claim_type4::CLAIM_PREVIOUS))
        .expect_err("reclaim outside grace");
    assert_eq!(err.status, nfsstat4::NFS4ERR_NO_GRACE);
    manager
        .open_file(&reclaim_open(unknown, b"oo", b"f", open_claim_type4::CLAIM_NULL))
        .expect("ordinary OPEN after grace");
}

#[tokio::test]
async fn grace_gates_non_reclaim_locks() {
    let manager = recovering_manager(restart_snapshot(), Box::new(|| {}));
    let client = confirmed_client(&manager, b"c-one");

    let resok = match manager
        .open_file(&reclaim_open(client, b"oo", b"f", open_claim_type4::CLAIM_PREVIOUS))
        .expect("reclaim open")
    {
        OpenOutcome::Granted(resok) => resok,
        OpenOutcome::Replay(_) => panic!("fresh reclaim cannot be a replay"),
    };

    let err = manager
        .lock_new(&LockNewArgs {
            client_id: client,
            open_stateid: resok.stateid,
            open_owner: b"oo".to_vec(),
            open_seqid: 2,
            lock_owner: b"lo".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::READ_LT,
            offset: 0,
            length: 1,
            reclaim: false,
        })
        .expect_err("non-reclaim LOCK during grace");
    assert_eq!(err.status, nfsstat4::NFS4ERR_GRACE);

    // The reclaim variant is admitted.
    manager
        .lock_new(&LockNewArgs {
            client_id: client,
            open_stateid: resok.stateid,
            open_owner: b"oo".to_vec(),
            open_seqid: 2,
            lock_owner: b"lo".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::READ_LT,
            offset: 0,
            length: 1,
            reclaim: true,
        })
        .expect("reclaim LOCK during grace");
}

#[tokio::test]
async fn empty_snapshot_skips_grace_entirely() {
    let ended = Arc::new(AtomicUsize::new(0));
    let ended_cb = Arc::clone(&ended);
    let manager = recovering_manager(
        RecoverySnapshot::default(),
        Box::new(move || {
            ended_cb.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert!(!manager.grace().is_active());

    let client = confirmed_client(&manager, b"solo");
    manager
        .open_file(&reclaim_open(client, b"oo", b"f", open_claim_type4::CLAIM_NULL))
        .expect("OPEN with no grace period");
}

#[tokio::test]
async fn snapshot_round_trips_through_disk() {
    let manager = fresh_manager();
    let a = confirmed_client(&manager, b"persist-a");
    let b = confirmed_client(&manager, b"persist-b");

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.clients.len(), 2);
    let mut ids = snapshot.expected_client_ids();
    ids.sort_unstable();
    let mut expected = vec![a, b];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("clients.toml");
    snapshot.save(&path).expect("save snapshot");

    let loaded = RecoverySnapshot::load(&path);
    assert_eq!(loaded, snapshot);

    // Unreadable snapshots degrade to an empty one.
    let missing = RecoverySnapshot::load(&dir.path().join("nope.toml"));
    assert!(missing.clients.is_empty());
}

#[tokio::test]
async fn lease_expiry_cascades_client_state() {
    let manager = fresh_manager();
    let client = confirmed_client(&manager, b"doomed");
    let fh = b"doomed-file".to_vec();

    let resok = match manager
        .open_file(&reclaim_open(client, b"oo", &fh, open_claim_type4::CLAIM_NULL))
        .expect("OPEN")
    {
        OpenOutcome::Granted(resok) => resok,
        OpenOutcome::Replay(_) => panic!("unexpected replay"),
    };
    let open_stateid = resok.stateid;

    manager.expire_client(client);
    assert!(!manager.client_exists(client));
    let err = manager
        .validate_stateid(&open_stateid, &fh)
        .expect_err("state gone with the client");
    assert_eq!(err.status, nfsstat4::NFS4ERR_BAD_STATEID);
    let err = manager.renew(client).expect_err("client gone");
    assert_eq!(err.status, nfsstat4::NFS4ERR_STALE_CLIENTID);
}
