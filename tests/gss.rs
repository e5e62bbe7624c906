//! RPCSEC_GSS tests: the credential codec, the sequence window, the
//! RFC 4121 token codec, and the processor's full context lifecycle.

mod support;

use std::io::Cursor;
use std::time::Duration;

use std::sync::Arc;

use nfs4_mamont::gss::token::{
    self, FLAG_ACCEPTOR_SUBKEY, FLAG_SENT_BY_ACCEPTOR, KG_USAGE_ACCEPTOR_SIGN,
    KG_USAGE_INITIATOR_SEAL, KG_USAGE_INITIATOR_SIGN,
};
use nfs4_mamont::gss::window::{SequenceWindow, WINDOW_SIZE};
use nfs4_mamont::gss::{error::GssError, GssProcessor, ProcessedCall};
use nfs4_mamont::xdr::gss::{
    integ_inner, rpc_gss_cred, rpc_gss_integ_data, rpc_gss_proc, rpc_gss_service,
    GSS_S_COMPLETE, GSS_S_DEFECTIVE_CREDENTIAL, MAXSEQ,
};
use nfs4_mamont::xdr::{deserialize, encode};

use support::{test_key, test_key_256, StubMapper, StubVerifier};

fn processor() -> GssProcessor {
    GssProcessor::new(
        Arc::new(StubVerifier),
        Arc::new(StubMapper),
        Duration::from_secs(3600),
    )
}

fn cred(proc_: rpc_gss_proc, seq: u32, service: rpc_gss_service, handle: Vec<u8>) -> rpc_gss_cred {
    rpc_gss_cred { gss_proc: proc_, seq_num: seq, service, handle }
}

#[test]
fn gss_credential_codec_round_trips() {
    let cases = [
        cred(rpc_gss_proc::RPCSEC_GSS_INIT, 0, rpc_gss_service::RPC_GSS_SVC_NONE, vec![]),
        cred(
            rpc_gss_proc::RPCSEC_GSS_DATA,
            7,
            rpc_gss_service::RPC_GSS_SVC_INTEGRITY,
            vec![1, 2, 3, 4, 5],
        ),
        cred(
            rpc_gss_proc::RPCSEC_GSS_DESTROY,
            9,
            rpc_gss_service::RPC_GSS_SVC_NONE,
            vec![9, 9, 9, 9],
        ),
        cred(
            rpc_gss_proc::RPCSEC_GSS_DATA,
            u32::MAX / 2 - 1,
            rpc_gss_service::RPC_GSS_SVC_PRIVACY,
            vec![0; 8],
        ),
    ];
    for case in cases {
        let bytes = encode(&case).expect("encode credential");
        let back = deserialize::<rpc_gss_cred>(&mut Cursor::new(&bytes)).expect("decode");
        assert_eq!(case, back);
    }
}

#[test]
fn sequence_window_slides_and_rejects() {
    let mut window = SequenceWindow::new();
    assert!(window.accept(1));
    assert!(window.accept(2 + WINDOW_SIZE));
    // 1 has slid below the window.
    assert!(!window.accept(1));

    // In-window duplicates are rejected exactly once.
    let mut window = SequenceWindow::new();
    assert!(window.accept(5));
    assert!(window.accept(3));
    assert!(!window.accept(3));
    assert!(!window.accept(5));
    assert!(window.accept(4));

    // The sequence space ends at MAXSEQ.
    assert!(!window.accept(MAXSEQ));
    assert!(!window.accept(MAXSEQ + 17));
}

#[test]
fn mic_round_trips_and_rejects_tampering() {
    let key = test_key();
    let data = b"the quick brown fox";
    let mic = token::get_mic(&key, KG_USAGE_INITIATOR_SIGN, 0, 42, data);

    let info = token::verify_mic(&key, KG_USAGE_INITIATOR_SIGN, &mic, data).expect("verify");
    assert_eq!(info.seq, 42);

    // Any flipped bit in the token or the data must fail verification.
    for i in 0..mic.len() {
        let mut bad = mic.clone();
        bad[i] ^= 0x80;
        assert!(token::verify_mic(&key, KG_USAGE_INITIATOR_SIGN, &bad, data).is_err());
    }
    let mut bad_data = data.to_vec();
    bad_data[3] ^= 1;
    assert!(token::verify_mic(&key, KG_USAGE_INITIATOR_SIGN, &mic, &bad_data).is_err());
    // Wrong key usage selects a different derived key.
    assert!(token::verify_mic(&key, KG_USAGE_ACCEPTOR_SIGN, &mic, data).is_err());
}

#[test]
fn wrap_round_trips_sealed_and_unsealed() {
    for key in [test_key(), test_key_256()] {
        for payload_len in [0_usize, 1, 15, 16, 17, 100] {
            let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
            for seal in [true, false] {
                let wrapped =
                    token::wrap(&key, KG_USAGE_INITIATOR_SEAL, 0, 31, &payload, seal);
                let unwrapped =
                    token::unwrap(&key, KG_USAGE_INITIATOR_SEAL, &wrapped).expect("unwrap");
                assert_eq!(unwrapped.data, payload);
                assert_eq!(unwrapped.info.seq, 31);
                assert_eq!(unwrapped.sealed, seal);

                for i in 0..wrapped.len() {
                    let mut bad = wrapped.clone();
                    bad[i] ^= 0x40;
                    // Flipping any byte must not yield the same payload; it
                    // either fails outright or changes observable fields.
                    match token::unwrap(&key, KG_USAGE_INITIATOR_SEAL, &bad) {
                        Err(_) => {}
                        Ok(out) => assert!(
                            out.data != payload || out.info.seq != 31,
                            "tampered byte {i} went unnoticed"
                        ),
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn context_lifecycle_matches_protocol() {
    let processor = processor();

    // INIT with principal alice.
    let init_args = encode(&b"alice".to_vec()).expect("encode token");
    let init_cred =
        cred(rpc_gss_proc::RPCSEC_GSS_INIT, 0, rpc_gss_service::RPC_GSS_SVC_NONE, vec![]);
    let handle = match processor.process_call(&init_cred, &init_args).await.expect("INIT") {
        ProcessedCall::Control { body, verf } => {
            assert_eq!(body.gss_major, GSS_S_COMPLETE);
            assert_eq!(body.seq_window, WINDOW_SIZE);
            assert_eq!(body.gss_token, b"ap-rep-token");
            assert!(!body.handle.is_empty());
            assert!(!verf.body.is_empty());
            body.handle
        }
        ProcessedCall::Data { .. } => panic!("INIT must be a control call"),
    };
    assert_eq!(processor.context_count(), 1);

    // DATA seq=1, service none: arguments pass through untouched.
    let data_cred = cred(
        rpc_gss_proc::RPCSEC_GSS_DATA,
        1,
        rpc_gss_service::RPC_GSS_SVC_NONE,
        handle.clone(),
    );
    match processor.process_call(&data_cred, b"payload").await.expect("DATA") {
        ProcessedCall::Data { args, identity, seq_num, .. } => {
            assert_eq!(args, b"payload");
            assert_eq!(identity.uid, 1000);
            assert_eq!(seq_num, 1);
        }
        ProcessedCall::Control { .. } => panic!("DATA must not be a control call"),
    }

    // DATA seq=2 succeeds; replaying seq=1 is silently discarded.
    let cred2 = cred(
        rpc_gss_proc::RPCSEC_GSS_DATA,
        2,
        rpc_gss_service::RPC_GSS_SVC_NONE,
        handle.clone(),
    );
    assert!(processor.process_call(&cred2, b"x").await.is_ok());
    let replay = processor.process_call(&data_cred, b"payload").await;
    assert!(matches!(replay, Err(GssError::SilentDiscard)));

    // DESTROY drops the context.
    let destroy_cred = cred(
        rpc_gss_proc::RPCSEC_GSS_DESTROY,
        3,
        rpc_gss_service::RPC_GSS_SVC_NONE,
        handle.clone(),
    );
    assert!(processor.process_call(&destroy_cred, &[]).await.is_ok());
    assert_eq!(processor.context_count(), 0);

    // The stale handle now reports a credential problem.
    let stale = cred(
        rpc_gss_proc::RPCSEC_GSS_DATA,
        4,
        rpc_gss_service::RPC_GSS_SVC_NONE,
        handle,
    );
    assert!(matches!(
        processor.process_call(&stale, b"y").await,
        Err(GssError::CredProblem)
    ));
}

#[tokio::test]
async fn init_failure_still_replies_with_defective_credential() {
    let processor = processor();
    // The stub refuses an empty principal.
    let init_args = encode(&Vec::<u8>::new()).expect("encode token");
    let init_cred =
        cred(rpc_gss_proc::RPCSEC_GSS_INIT, 0, rpc_gss_service::RPC_GSS_SVC_NONE, vec![]);
    match processor.process_call(&init_cred, &init_args).await.expect("INIT error reply") {
        ProcessedCall::Control { body, .. } => {
            assert_eq!(body.gss_major, GSS_S_DEFECTIVE_CREDENTIAL);
            assert!(body.handle.is_empty());
        }
        ProcessedCall::Data { .. } => panic!("failed INIT must stay a control call"),
    }
    assert_eq!(processor.context_count(), 0);
}

#[tokio::test]
async fn integrity_and_privacy_bodies_are_unwrapped_per_call() {
    let processor = processor();
    let init_args = encode(&b"alice".to_vec()).expect("encode token");
    let init_cred =
        cred(rpc_gss_proc::RPCSEC_GSS_INIT, 0, rpc_gss_service::RPC_GSS_SVC_NONE, vec![]);
    let handle = match processor.process_call(&init_cred, &init_args).await.expect("INIT") {
        ProcessedCall::Control { body, .. } => body.handle,
        _ => unreachable!(),
    };
    let key = test_key();

    // Integrity-protected call body.
    let inner = integ_inner(1, b"integ args");
    let checksum = token::get_mic(&key, KG_USAGE_INITIATOR_SIGN, 0, 1, &inner);
    let body = encode(&rpc_gss_integ_data { databody: inner, checksum }).expect("encode");
    let integ_cred = cred(
        rpc_gss_proc::RPCSEC_GSS_DATA,
        1,
        rpc_gss_service::RPC_GSS_SVC_INTEGRITY,
        handle.clone(),
    );
    match processor.process_call(&integ_cred, &body).await.expect("integrity DATA") {
        ProcessedCall::Data { args, .. } => assert_eq!(args, b"integ args"),
        _ => unreachable!(),
    }

    // Privacy-protected call body on the same context: the service comes
    // from the credential, not the context.
    let inner = integ_inner(2, b"private args");
    let wrapped = token::wrap(&key, KG_USAGE_INITIATOR_SEAL, 0, 2, &inner, true);
    let body = encode(&wrapped).expect("encode");
    let priv_cred = cred(
        rpc_gss_proc::RPCSEC_GSS_DATA,
        2,
        rpc_gss_service::RPC_GSS_SVC_PRIVACY,
        handle.clone(),
    );
    match processor.process_call(&priv_cred, &body).await.expect("privacy DATA") {
        ProcessedCall::Data { args, .. } => assert_eq!(args, b"private args"),
        _ => unreachable!(),
    }

    // A sequence number mismatch between credential and protected body is a
    // context problem.
    let inner = integ_inner(9, b"mismatch");
    let checksum = token::get_mic(&key, KG_USAGE_INITIATOR_SIGN, 0, 3, &inner);
    let body = encode(&rpc_gss_integ_data { databody: inner, checksum }).expect("encode");
    let bad_cred = cred(
        rpc_gss_proc::RPCSEC_GSS_DATA,
        3,
        rpc_gss_service::RPC_GSS_SVC_INTEGRITY,
        handle,
    );
    assert!(matches!(
        processor.process_call(&bad_cred, &body).await,
        Err(GssError::CtxProblem(_))
    ));
}

#[tokio::test]
async fn acceptor_subkey_flag_is_set_on_server_tokens() {
    let processor = processor();
    let init_args = encode(&b"bob+subkey".to_vec()).expect("encode token");
    let init_cred =
        cred(rpc_gss_proc::RPCSEC_GSS_INIT, 0, rpc_gss_service::RPC_GSS_SVC_NONE, vec![]);
    let (handle, init_verf) =
        match processor.process_call(&init_cred, &init_args).await.expect("INIT") {
            ProcessedCall::Control { body, verf } => (body.handle, verf),
            _ => unreachable!(),
        };

    // The INIT reply verifier is a MIC over the window size, signed with the
    // subkey and carrying the acceptor-subkey flag.
    let window_bytes = WINDOW_SIZE.to_be_bytes();
    let info = token::verify_mic(
        &test_key_256(),
        KG_USAGE_ACCEPTOR_SIGN,
        &init_verf.body,
        &window_bytes,
    )
    .expect("verify INIT reply MIC");
    assert_ne!(info.flags & FLAG_ACCEPTOR_SUBKEY, 0);
    assert_ne!(info.flags & FLAG_SENT_BY_ACCEPTOR, 0);

    // DATA replies keep setting the flag.
    let data_cred = cred(
        rpc_gss_proc::RPCSEC_GSS_DATA,
        1,
        rpc_gss_service::RPC_GSS_SVC_NONE,
        handle,
    );
    let context = match processor.process_call(&data_cred, b"z").await.expect("DATA") {
        ProcessedCall::Data { context, .. } => context,
        _ => unreachable!(),
    };
    let verf = processor.data_reply_verifier(&context, 1);
    let info = token::verify_mic(
        &test_key_256(),
        KG_USAGE_ACCEPTOR_SIGN,
        &verf.body,
        &1_u32.to_be_bytes(),
    )
    .expect("verify DATA reply MIC");
    assert_ne!(info.flags & FLAG_ACCEPTOR_SUBKEY, 0);
}
