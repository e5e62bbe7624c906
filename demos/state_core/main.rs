//! Demonstrates the NFSv4 state core without a network in front of it:
//! a client registers and confirms, opens a file, takes and releases a
//! byte-range lock, earns a delegation, and a second client's conflicting
//! open triggers the recall path.
//!
//! Run with `cargo run --example state_core`.

use std::sync::Arc;
use std::time::Duration;

use nfs4_mamont::callback::CallbackClient;
use nfs4_mamont::config::StateConfig;
use nfs4_mamont::delegation::DelegationEngine;
use nfs4_mamont::protocol::rpc::{ConnRegistry, PendingReplyRouter};
use nfs4_mamont::protocol::xdr::nfs4::{
    nfs_lock_type4, open_claim_type4, open_delegation4, OPEN4_SHARE_ACCESS_BOTH,
    OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_DENY_NONE,
};
use nfs4_mamont::session::SessionTable;
use nfs4_mamont::state::lock_manager::LockManager;
use nfs4_mamont::state::records::CallbackInfo;
use nfs4_mamont::state::recovery::RecoverySnapshot;
use nfs4_mamont::state::{
    LockNewArgs, LockOutcome, OpenArgs, OpenOutcome, StateManager, StateidOutcome,
};

fn demo_client(manager: &StateManager, name: &str) -> u64 {
    let (client_id, confirm) = manager
        .set_client_id(
            name.as_bytes().to_vec(),
            *b"demoboot",
            CallbackInfo {
                program: 0x4000_0000,
                netid: "tcp".to_string(),
                addr: "127.0.0.1.3.233".to_string(),
            },
            "127.0.0.1:1021".to_string(),
        )
        .expect("SETCLIENTID");
    manager
        .confirm_client_id(client_id, confirm)
        .expect("SETCLIENTID_CONFIRM");
    client_id
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = StateConfig::default();
    let lock_manager = Arc::new(LockManager::new());
    let manager = StateManager::new(
        config.clone(),
        Arc::clone(&lock_manager),
        RecoverySnapshot::default(),
        Box::new(|| println!("grace period over")),
    );
    let registry = Arc::new(ConnRegistry::new());
    let router = Arc::new(PendingReplyRouter::new());
    let sessions = SessionTable::new(
        config.clone(),
        Arc::clone(&manager),
        Arc::clone(&registry),
        Arc::clone(&router),
    );
    sessions.start_reaper();
    let engine = DelegationEngine::new(
        config,
        Arc::clone(&manager),
        sessions,
        Arc::new(CallbackClient::new(Duration::from_secs(5))),
    );

    let alice = demo_client(&manager, "alice-workstation");
    manager.set_cb_path_up(alice, true);
    println!("alice registered as client {alice:#018x}");

    let fh = b"/export/report.txt".to_vec();
    let open = match engine
        .open_file(&OpenArgs {
            client_id: alice,
            owner: b"alice-process-42".to_vec(),
            seqid: 1,
            fh: fh.clone(),
            share_access: OPEN4_SHARE_ACCESS_BOTH,
            share_deny: OPEN4_SHARE_DENY_NONE,
            claim: open_claim_type4::CLAIM_NULL,
            grant_delegation: None,
        })
        .expect("OPEN")
    {
        OpenOutcome::Granted(resok) => resok,
        OpenOutcome::Replay(_) => unreachable!("fresh owner"),
    };
    println!("open stateid {}", open.stateid);
    match &open.delegation {
        open_delegation4::Write(w) => println!("write delegation {}", w.stateid),
        open_delegation4::Read(r) => println!("read delegation {}", r.stateid),
        open_delegation4::None => println!("no delegation granted"),
    }

    let open_stateid = match manager
        .confirm_open(alice, b"alice-process-42".to_vec(), 2, &open.stateid)
        .expect("OPEN_CONFIRM")
    {
        StateidOutcome::Granted(stateid) => stateid,
        StateidOutcome::Replay(_) => unreachable!(),
    };

    match manager
        .lock_new(&LockNewArgs {
            client_id: alice,
            open_stateid,
            open_owner: b"alice-process-42".to_vec(),
            open_seqid: 3,
            lock_owner: b"alice-pid-42".to_vec(),
            lock_seqid: 1,
            locktype: nfs_lock_type4::WRITE_LT,
            offset: 0,
            length: 4096,
            reclaim: false,
        })
        .expect("LOCK")
    {
        LockOutcome::Granted(stateid) => println!("lock stateid {stateid}"),
        LockOutcome::Denied(denied) => println!("lock denied by {:?}", denied.owner),
        LockOutcome::Replay(_) => unreachable!(),
    }

    // A second client's open hits the delegation and waits for the recall.
    let bob = demo_client(&manager, "bob-laptop");
    let conflict = engine.open_file(&OpenArgs {
        client_id: bob,
        owner: b"bob-process-7".to_vec(),
        seqid: 1,
        fh,
        share_access: OPEN4_SHARE_ACCESS_READ,
        share_deny: OPEN4_SHARE_DENY_NONE,
        claim: open_claim_type4::CLAIM_NULL,
        grant_delegation: None,
    });
    match conflict {
        Err(e) => println!("bob's open answered with {:?} while the recall runs", e.status),
        Ok(_) => println!("bob's open went through"),
    }

    println!(
        "store: {} delegation(s), {} held lock range(s)",
        manager.delegation_count(),
        lock_manager.held_count()
    );
}
