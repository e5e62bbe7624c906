//! Session-layer tests: slot-table exactly-once semantics, CREATE_SESSION
//! replay caching, DESTROY_SESSION gating, and the backchannel sender's
//! CB_COMPOUND construction and reply demultiplexing.

mod support;

use std::io::Cursor;
use std::sync::Arc;

use nfs4_mamont::config::StateConfig;
use nfs4_mamont::protocol::rpc::{ConnRegistry, PendingReplyRouter};
use nfs4_mamont::protocol::xdr::nfs4::{
    channel_attrs4, nfs_cb_argop4, nfs_cb_opnum4, nfsstat4, stateid4, CB_COMPOUND4args,
    CB_SEQUENCE4resok, CREATE_SESSION4resok, CREATE_SESSION4_FLAG_CONN_BACK_CHAN,
    CREATE_SESSION4_FLAG_PERSIST,
};
use nfs4_mamont::protocol::xdr::rpc::{call_body, rpc_body, rpc_msg};
use nfs4_mamont::protocol::xdr::{deserialize, encode, Serialize};
use nfs4_mamont::session::backchannel::CallbackOp;
use nfs4_mamont::session::slot_table::{SequenceDisposition, SlotTable};
use nfs4_mamont::session::SessionTable;
use nfs4_mamont::state::StateManager;

use support::{fresh_manager, test_config, MemConnWriter};

fn requested_attrs() -> channel_attrs4 {
    channel_attrs4 {
        ca_headerpadsize: 0,
        ca_maxrequestsize: 256 * 1024,
        ca_maxresponsesize: 256 * 1024,
        ca_maxresponsesize_cached: 16 * 1024,
        ca_maxoperations: 8,
        ca_maxrequests: 8,
        ca_rdma_ird: Vec::new(),
    }
}

fn session_table(manager: &Arc<StateManager>) -> (Arc<SessionTable>, Arc<ConnRegistry>, Arc<PendingReplyRouter>) {
    let registry = Arc::new(ConnRegistry::new());
    let router = Arc::new(PendingReplyRouter::new());
    let table = SessionTable::new(
        test_config(),
        Arc::clone(manager),
        Arc::clone(&registry),
        Arc::clone(&router),
    );
    (table, registry, router)
}

#[test]
fn slot_table_dispositions() {
    let mut table = SlotTable::new(2);

    // Beyond the negotiated table.
    assert_eq!(
        table.check_sequence(2, 1).expect_err("badslot").status,
        nfsstat4::NFS4ERR_BADSLOT
    );

    // New request, then completion with caching.
    assert_eq!(table.check_sequence(0, 1).expect("new"), SequenceDisposition::New);
    // While executing: the same seqid asks the client to wait, others are
    // misordered.
    assert_eq!(
        table.check_sequence(0, 1).expect_err("busy").status,
        nfsstat4::NFS4ERR_DELAY
    );
    assert_eq!(
        table.check_sequence(0, 2).expect_err("busy misordered").status,
        nfsstat4::NFS4ERR_SEQ_MISORDERED
    );
    table.complete(0, 1, true, b"cached reply".to_vec());

    // Replay is served from the cache.
    match table.check_sequence(0, 1).expect("replay") {
        SequenceDisposition::Replay(bytes) => assert_eq!(bytes, b"cached reply"),
        SequenceDisposition::New => panic!("must be a replay"),
    }

    // Next in sequence; completed without caching, its replay is refused.
    assert_eq!(table.check_sequence(0, 2).expect("new"), SequenceDisposition::New);
    table.complete(0, 2, false, Vec::new());
    assert_eq!(
        table.check_sequence(0, 2).expect_err("uncached").status,
        nfsstat4::NFS4ERR_RETRY_UNCACHED_REP
    );

    // Gaps are misordered.
    assert_eq!(
        table.check_sequence(0, 9).expect_err("gap").status,
        nfsstat4::NFS4ERR_SEQ_MISORDERED
    );

    // v4.1 slot seqids wrap straight through zero.
    table.complete(1, u32::MAX, false, Vec::new());
    assert_eq!(table.check_sequence(1, 0).expect("wrap"), SequenceDisposition::New);

    // Target feedback is clamped to the table.
    table.set_target_highest_slot_id(500);
    assert_eq!(table.target_highest_slot_id(), 1);
}

#[tokio::test]
async fn create_session_replay_is_byte_identical() {
    let manager = fresh_manager();
    let (table, _registry, _router) = session_table(&manager);

    let (client_id, first_seq) = manager
        .exchange_id(b"v41-client".to_vec(), *b"bootverf", "10.0.0.9:301".to_string())
        .expect("EXCHANGE_ID");
    assert_eq!(first_seq, 1);

    let reply = table
        .create_session(
            client_id,
            1,
            &requested_attrs(),
            &requested_attrs(),
            CREATE_SESSION4_FLAG_CONN_BACK_CHAN | CREATE_SESSION4_FLAG_PERSIST,
            0x4000_0001,
        )
        .expect("CREATE_SESSION");
    let resok = deserialize::<CREATE_SESSION4resok>(&mut Cursor::new(&reply)).expect("decode");
    // PERSIST is never granted; the slot count honors the server clamp.
    assert_eq!(resok.csr_flags & CREATE_SESSION4_FLAG_PERSIST, 0);
    assert_ne!(resok.csr_flags & CREATE_SESSION4_FLAG_CONN_BACK_CHAN, 0);
    assert_eq!(resok.csr_sequence, 1);
    assert_eq!(resok.csr_fore_chan_attrs.ca_maxrequests, 8);

    // Replay of the same sequence returns exactly the cached bytes and does
    // not create a second session.
    let replay = table
        .create_session(
            client_id,
            1,
            &requested_attrs(),
            &requested_attrs(),
            CREATE_SESSION4_FLAG_CONN_BACK_CHAN,
            0x4000_0001,
        )
        .expect("CREATE_SESSION replay");
    assert_eq!(replay, reply);
    assert_eq!(table.len(), 1);

    // Skipping ahead is misordered.
    let err = table
        .create_session(
            client_id,
            3,
            &requested_attrs(),
            &requested_attrs(),
            0,
            0x4000_0001,
        )
        .expect_err("misordered");
    assert_eq!(err.status, nfsstat4::NFS4ERR_SEQ_MISORDERED);

    // The first CREATE_SESSION confirmed the client.
    manager.renew(client_id).expect("client is confirmed now");
}

#[tokio::test]
async fn destroy_session_waits_for_slots() {
    let manager = fresh_manager();
    let (table, _registry, _router) = session_table(&manager);
    let (client_id, _) = manager
        .exchange_id(b"destroyer".to_vec(), *b"bootverf", "10.0.0.9:302".to_string())
        .expect("EXCHANGE_ID");
    let reply = table
        .create_session(client_id, 1, &requested_attrs(), &requested_attrs(), 0, 0)
        .expect("CREATE_SESSION");
    let resok = deserialize::<CREATE_SESSION4resok>(&mut Cursor::new(&reply)).expect("decode");
    // SEQUENCE through the table validates the slot and renews the lease.
    let renew_before = manager.client_last_renew(client_id).expect("lease");
    let (_session, disposition) = table
        .sequence(&resok.csr_sessionid, 0, 1)
        .expect("SEQUENCE");
    assert_eq!(disposition, SequenceDisposition::New);
    assert!(manager.client_last_renew(client_id).expect("lease") >= renew_before);

    let err = table
        .destroy_session(&resok.csr_sessionid, false)
        .expect_err("slot in use");
    assert_eq!(err.status, nfsstat4::NFS4ERR_DELAY);

    // Administrative eviction bypasses the check.
    table
        .destroy_session(&resok.csr_sessionid, true)
        .expect("admin destroy");
    assert!(table.is_empty());
}

#[tokio::test]
async fn backchannel_sends_cb_compound_and_demuxes_replies() {
    let manager = fresh_manager();
    let (table, registry, router) = session_table(&manager);
    let (client_id, _) = manager
        .exchange_id(b"cb-client".to_vec(), *b"bootverf", "10.0.0.9:303".to_string())
        .expect("EXCHANGE_ID");
    let reply = table
        .create_session(
            client_id,
            1,
            &requested_attrs(),
            &requested_attrs(),
            CREATE_SESSION4_FLAG_CONN_BACK_CHAN,
            0x4000_0002,
        )
        .expect("CREATE_SESSION");
    let resok = deserialize::<CREATE_SESSION4resok>(&mut Cursor::new(&reply)).expect("decode");
    let session_id = resok.csr_sessionid;
    let session = table.session(&session_id).expect("session");

    let (conn, mut records) = MemConnWriter::new(1);
    registry.bind(session_id, conn);

    let recall_stateid = stateid4 { seqid: 1, other: [3; 12] };
    for expected_cb_seqid in [1_u32, 2] {
        let done = session
            .send_callback(CallbackOp::Recall {
                stateid: recall_stateid,
                fh: b"recalled-file".to_vec(),
                truncate: false,
            })
            .expect("enqueue callback");

        // The sender frames an RPC call for the callback program with
        // CB_SEQUENCE first.
        let record = records.recv().await.expect("record written");
        let mut cursor = Cursor::new(record.as_slice());
        let msg = deserialize::<rpc_msg>(&mut cursor).expect("rpc header");
        let call = match msg.body {
            rpc_body::CALL(call) => call,
            rpc_body::REPLY(_) => panic!("backchannel must send calls"),
        };
        assert_eq!(call.prog, 0x4000_0002);
        let args = deserialize::<CB_COMPOUND4args>(&mut cursor).expect("compound");
        assert_eq!(args.minorversion, 1);
        assert_eq!(args.argarray.len(), 2);
        match &args.argarray[0] {
            nfs_cb_argop4::CbSequence(seq) => {
                assert_eq!(seq.csa_sessionid, session_id);
                assert_eq!(seq.csa_sequenceid, expected_cb_seqid);
                assert_eq!(seq.csa_slotid, 0);
            }
            other => panic!("first op must be CB_SEQUENCE, got {other:?}"),
        }
        match &args.argarray[1] {
            nfs_cb_argop4::CbRecall(recall) => {
                assert_eq!(recall.stateid, recall_stateid);
                assert_eq!(recall.fh, b"recalled-file".to_vec());
            }
            other => panic!("second op must be CB_RECALL, got {other:?}"),
        }

        // Answer the call through the router, as the transport read loop
        // would.
        let mut reply = encode(&nfs4_mamont::protocol::xdr::rpc::make_success_reply(msg.xid))
            .expect("reply header");
        nfsstat4::NFS4_OK.serialize(&mut reply).expect("status");
        String::new().serialize(&mut reply).expect("tag");
        2_u32.serialize(&mut reply).expect("count");
        nfs_cb_opnum4::OP_CB_SEQUENCE.serialize(&mut reply).expect("op");
        nfsstat4::NFS4_OK.serialize(&mut reply).expect("op status");
        CB_SEQUENCE4resok {
            csr_sessionid: session_id,
            csr_sequenceid: expected_cb_seqid,
            csr_slotid: 0,
            csr_highest_slotid: 0,
            csr_target_highest_slotid: 0,
        }
        .serialize(&mut reply)
        .expect("sequence resok");
        nfs_cb_opnum4::OP_CB_RECALL.serialize(&mut reply).expect("op");
        nfsstat4::NFS4_OK.serialize(&mut reply).expect("op status");
        assert!(router.deliver(msg.xid, reply));

        assert!(done.await.expect("callback outcome"), "callback must succeed");
        assert!(!session.backchannel_faulted());
    }

    assert_eq!(router.pending(), 0);
    table.destroy_session(&session_id, true).expect("destroy");
    assert!(registry.bound_connections(&session_id).is_empty());
}

#[tokio::test]
async fn backchannel_fails_over_to_alternate_connection() {
    let manager = fresh_manager();
    let (table, registry, router) = session_table(&manager);
    let (client_id, _) = manager
        .exchange_id(b"failover".to_vec(), *b"bootverf", "10.0.0.9:304".to_string())
        .expect("EXCHANGE_ID");
    let reply = table
        .create_session(
            client_id,
            1,
            &requested_attrs(),
            &requested_attrs(),
            CREATE_SESSION4_FLAG_CONN_BACK_CHAN,
            0x4000_0003,
        )
        .expect("CREATE_SESSION");
    let resok = deserialize::<CREATE_SESSION4resok>(&mut Cursor::new(&reply)).expect("decode");
    let session = table.session(&resok.csr_sessionid).expect("session");

    let (dead, _dead_records) = MemConnWriter::new(1);
    dead.broken.store(true, std::sync::atomic::Ordering::Relaxed);
    let (live, mut live_records) = MemConnWriter::new(2);
    registry.bind(resok.csr_sessionid, dead);
    registry.bind(resok.csr_sessionid, live);

    let done = session
        .send_callback(CallbackOp::Recall {
            stateid: stateid4 { seqid: 1, other: [5; 12] },
            fh: b"f".to_vec(),
            truncate: false,
        })
        .expect("enqueue");

    // The write lands on the second connection after the first refuses it.
    let record = live_records.recv().await.expect("failover write");
    let mut cursor = Cursor::new(record.as_slice());
    let msg = deserialize::<rpc_msg>(&mut cursor).expect("rpc header");

    let mut reply = encode(&nfs4_mamont::protocol::xdr::rpc::make_success_reply(msg.xid))
        .expect("reply header");
    nfsstat4::NFS4_OK.serialize(&mut reply).expect("status");
    String::new().serialize(&mut reply).expect("tag");
    1_u32.serialize(&mut reply).expect("count");
    nfs_cb_opnum4::OP_CB_RECALL.serialize(&mut reply).expect("op");
    nfsstat4::NFS4_OK.serialize(&mut reply).expect("op status");
    router.deliver(msg.xid, reply);

    assert!(done.await.expect("callback outcome"));
}

#[tokio::test(start_paused = true)]
async fn reaper_collects_sessions_of_departed_clients() {
    let manager = fresh_manager();
    let (table, _registry, _router) = session_table(&manager);
    let (client_id, _) = manager
        .exchange_id(b"short-lived".to_vec(), *b"bootverf", "10.0.0.9:305".to_string())
        .expect("EXCHANGE_ID");
    table
        .create_session(client_id, 1, &requested_attrs(), &requested_attrs(), 0, 0)
        .expect("CREATE_SESSION");
    assert_eq!(table.len(), 1);

    table.start_reaper();
    manager.expire_client(client_id);

    // Let the reaper run a cycle (virtual time).
    tokio::time::sleep(std::time::Duration::from_secs(65)).await;
    assert!(table.is_empty());
    table.stop_reaper();
}

#[test]
fn reply_router_delivers_exactly_once() {
    let router = PendingReplyRouter::new();
    let rx = router.register(7);
    assert!(router.deliver(7, b"hello".to_vec()));
    // A second delivery has no waiter.
    assert!(!router.deliver(7, b"again".to_vec()));
    assert_eq!(rx.blocking_recv().expect("reply"), b"hello");

    let rx2 = router.register(8);
    router.cancel(8);
    assert!(rx2.blocking_recv().is_err());
    assert_eq!(router.pending(), 0);
}

#[test]
fn unknown_callback_call_body_is_rejected() {
    // A garbled record must not panic the reply parser.
    let bogus = call_body::default();
    let msg = rpc_msg { xid: 1, body: rpc_body::CALL(bogus) };
    let bytes = encode(&msg).expect("encode");
    let parsed = deserialize::<rpc_msg>(&mut Cursor::new(&bytes)).expect("decode");
    assert_eq!(parsed.xid, 1);
}
