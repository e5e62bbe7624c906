//! MOUNT protocol tests: export resolution, fail-closed access checking,
//! and the auth-flavor advertisement carrying the Kerberos pseudo-flavors.

use std::io::Cursor;
use std::net::IpAddr;

use nfs4_mamont::mount::{Exports, MountHandler};
use nfs4_mamont::protocol::xdr::mount::{deserialize_list, mountbody, mountres3_ok, mountstat3};
use nfs4_mamont::protocol::xdr::rpc::{
    rpc_msg, AUTH_GSS_KRB5, AUTH_GSS_KRB5I, AUTH_GSS_KRB5P,
};
use nfs4_mamont::protocol::xdr::{deserialize, encode};

struct TestExports;

impl Exports for TestExports {
    fn root_handle(&self, path: &[u8]) -> Option<Vec<u8>> {
        (path == b"/export").then(|| b"root-fh".to_vec())
    }

    fn check_access(&self, client_ip: IpAddr, _path: &[u8]) -> bool {
        client_ip.is_loopback()
    }

    fn list(&self) -> Vec<(Vec<u8>, Vec<Vec<u8>>)> {
        vec![(b"/export".to_vec(), vec![b"trusted".to_vec()])]
    }
}

fn mnt_reply(handler: &MountHandler<TestExports>, path: &[u8], addr: &str) -> Vec<u8> {
    let mut input = encode(&path.to_vec()).expect("encode path");
    let mut output = Vec::new();
    handler
        .mnt(7, &mut Cursor::new(&mut input), &mut output, addr)
        .expect("mnt handler");
    output
}

fn parse_status(output: &[u8]) -> (Cursor<&[u8]>, mountstat3) {
    let mut cursor = Cursor::new(output);
    deserialize::<rpc_msg>(&mut cursor).expect("rpc reply");
    let status = deserialize::<mountstat3>(&mut cursor).expect("status");
    (cursor, status)
}

#[test]
fn mnt_advertises_gss_flavors_when_enabled() {
    let handler = MountHandler::new(TestExports, true);
    let output = mnt_reply(&handler, b"/export", "127.0.0.1:1020");
    let (mut cursor, status) = parse_status(&output);
    assert_eq!(status, mountstat3::MNT3_OK);

    let res = deserialize::<mountres3_ok>(&mut cursor).expect("mount result");
    assert_eq!(res.fhandle, b"root-fh".to_vec());
    assert_eq!(res.auth_flavors, vec![1, AUTH_GSS_KRB5, AUTH_GSS_KRB5I, AUTH_GSS_KRB5P]);

    // Without GSS only AUTH_UNIX is advertised.
    let handler = MountHandler::new(TestExports, false);
    let output = mnt_reply(&handler, b"/export", "127.0.0.1:1020");
    let (mut cursor, status) = parse_status(&output);
    assert_eq!(status, mountstat3::MNT3_OK);
    let res = deserialize::<mountres3_ok>(&mut cursor).expect("mount result");
    assert_eq!(res.auth_flavors, vec![1]);
}

#[test]
fn mnt_fails_closed() {
    let handler = MountHandler::new(TestExports, true);

    // Unknown export.
    let output = mnt_reply(&handler, b"/elsewhere", "127.0.0.1:1020");
    let (_, status) = parse_status(&output);
    assert_eq!(status, mountstat3::MNT3ERR_NOENT);

    // Denied address.
    let output = mnt_reply(&handler, b"/export", "192.0.2.7:1020");
    let (_, status) = parse_status(&output);
    assert_eq!(status, mountstat3::MNT3ERR_ACCES);

    // Unparsable address: any doubt denies.
    let output = mnt_reply(&handler, b"/export", "not an address");
    let (_, status) = parse_status(&output);
    assert_eq!(status, mountstat3::MNT3ERR_ACCES);
}

#[test]
fn dump_and_umnt_track_mounts() {
    let handler = MountHandler::new(TestExports, false);
    mnt_reply(&handler, b"/export", "127.0.0.1:1020");

    let mut output = Vec::new();
    handler.dump(8, &mut output).expect("dump");
    let mut cursor = Cursor::new(output.as_slice());
    deserialize::<rpc_msg>(&mut cursor).expect("rpc reply");
    let mounts: Vec<mountbody> = deserialize_list(&mut cursor).expect("mount list");
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].ml_directory, b"/export".to_vec());

    // UMNT removes the entry; DUMP is empty afterwards.
    let mut input = encode(&b"/export".to_vec()).expect("encode path");
    let mut output = Vec::new();
    handler
        .umnt(9, &mut Cursor::new(&mut input), &mut output, "127.0.0.1:1020")
        .expect("umnt");

    let mut output = Vec::new();
    handler.dump(10, &mut output).expect("dump");
    let mut cursor = Cursor::new(output.as_slice());
    deserialize::<rpc_msg>(&mut cursor).expect("rpc reply");
    let mounts: Vec<mountbody> = deserialize_list(&mut cursor).expect("mount list");
    assert!(mounts.is_empty());
}

#[test]
fn export_lists_groups() {
    let handler = MountHandler::new(TestExports, false);
    let mut output = Vec::new();
    handler.export(11, &mut output).expect("export");

    let mut cursor = Cursor::new(output.as_slice());
    deserialize::<rpc_msg>(&mut cursor).expect("rpc reply");
    let nodes: Vec<nfs4_mamont::protocol::xdr::mount::exportnode> =
        deserialize_list(&mut cursor).expect("export list");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].ex_dir, b"/export".to_vec());
    assert_eq!(nodes[0].ex_groups, vec![b"trusted".to_vec()]);
}
