//! NFSv4.0 callback client.
//!
//! Version 4.0 predates sessions, so the server reaches the client by
//! dialing the callback endpoint the client registered with SETCLIENTID:
//! a universal address plus an RPC program number. This module parses those
//! addresses, probes the path with CB_NULL after confirmation, and delivers
//! CB_RECALL. Every call gets one combined dial-plus-I/O budget; a slow or
//! dead callback path must never stall the fore channel.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::protocol::rpc::{read_record, write_record};
use crate::protocol::xdr::nfs4::{
    nfsstat4, stateid4, CB_COMPOUND4args, CB_COMPOUND4res, CB_RECALL4args, nfs_cb_argop4,
    CB_COMPOUND, CB_NULL,
};
use crate::protocol::xdr::rpc::{
    accept_body, call_body, opaque_auth, reply_body, rpc_body, rpc_msg,
};
use crate::protocol::xdr::{deserialize, encode, Serialize};
use crate::state::records::CallbackInfo;
use crate::state::CallbackProbe;

/// Version of the NFSv4.0 callback program.
const CB_VERSION: u32 = 1;

/// Parses a universal address (`h1.h2.h3.h4.p1.p2`, or an IPv6 host with the
/// same two port octets appended) into a socket address.
///
/// The port is `p1 * 256 + p2`; both octets must be in range. Anything
/// malformed is an error; the caller treats that as a dead callback path.
pub fn parse_universal_addr(addr: &str) -> Result<SocketAddr, anyhow::Error> {
    let (host_part, p1, p2) = {
        let mut parts = addr.rsplitn(3, '.');
        let p2 = parts.next().ok_or_else(|| anyhow!("universal address missing port"))?;
        let p1 = parts.next().ok_or_else(|| anyhow!("universal address missing port"))?;
        let host = parts.next().ok_or_else(|| anyhow!("universal address missing host"))?;
        (host, p1, p2)
    };
    let p1: u16 = p1.parse().map_err(|_| anyhow!("bad port octet in {addr}"))?;
    let p2: u16 = p2.parse().map_err(|_| anyhow!("bad port octet in {addr}"))?;
    if p1 > 255 || p2 > 255 {
        return Err(anyhow!("port octet out of range in {addr}"));
    }
    let port = p1 * 256 + p2;
    let ip: IpAddr = host_part.parse().map_err(|_| anyhow!("bad host in {addr}"))?;
    Ok(SocketAddr::new(ip, port))
}

/// Dials NFSv4.0 callback endpoints.
pub struct CallbackClient {
    timeout: Duration,
    next_xid: AtomicU32,
}

impl CallbackClient {
    pub fn new(timeout: Duration) -> CallbackClient {
        CallbackClient { timeout, next_xid: AtomicU32::new(0x4000_0000) }
    }

    fn xid(&self) -> u32 {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// One dial-send-receive exchange under the combined budget.
    async fn exchange(
        &self,
        callback: &CallbackInfo,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, anyhow::Error> {
        let addr = parse_universal_addr(&callback.addr)?;
        tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            write_record(&mut stream, &request).await?;
            read_record(&mut stream).await
        })
        .await
        .map_err(|_| anyhow!("callback to {addr} timed out"))?
    }

    fn call_header(&self, callback: &CallbackInfo, proc_num: u32) -> (u32, rpc_msg) {
        let xid = self.xid();
        let msg = rpc_msg {
            xid,
            body: rpc_body::CALL(call_body {
                rpcvers: 2,
                prog: callback.program,
                vers: CB_VERSION,
                proc: proc_num,
                cred: opaque_auth::default(),
                verf: opaque_auth::default(),
            }),
        };
        (xid, msg)
    }

    fn parse_reply(xid: u32, record: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
        let mut cursor = std::io::Cursor::new(record);
        let reply = deserialize::<rpc_msg>(&mut cursor)?;
        if reply.xid != xid {
            return Err(anyhow!("callback reply xid {} does not match {xid}", reply.xid));
        }
        match reply.body {
            rpc_body::REPLY(reply_body::MSG_ACCEPTED(accepted)) => match accepted.reply_data {
                accept_body::SUCCESS => {
                    let offset = cursor.position() as usize;
                    Ok(record[offset..].to_vec())
                }
                other => Err(anyhow!("callback call not successful: {other:?}")),
            },
            rpc_body::REPLY(reply_body::MSG_DENIED(denied)) => {
                Err(anyhow!("callback call denied: {denied:?}"))
            }
            rpc_body::CALL(_) => Err(anyhow!("callback peer sent a CALL, expected REPLY")),
        }
    }

    /// CB_NULL: a ping that validates the callback path end to end.
    pub async fn cb_null(&self, callback: &CallbackInfo) -> Result<(), anyhow::Error> {
        let (xid, header) = self.call_header(callback, CB_NULL);
        let request = encode(&header)?;
        let reply = self.exchange(callback, request).await?;
        Self::parse_reply(xid, &reply)?;
        debug!(addr = %callback.addr, "CB_NULL round trip succeeded");
        Ok(())
    }

    /// CB_RECALL for one delegation, as a single-op CB_COMPOUND.
    pub async fn cb_recall(
        &self,
        callback: &CallbackInfo,
        stateid: stateid4,
        fh: Vec<u8>,
        truncate: bool,
    ) -> Result<(), anyhow::Error> {
        let (xid, header) = self.call_header(callback, CB_COMPOUND);
        let args = CB_COMPOUND4args {
            tag: String::new(),
            minorversion: 0,
            callback_ident: callback.program,
            argarray: vec![nfs_cb_argop4::CbRecall(CB_RECALL4args { stateid, truncate, fh })],
        };
        let mut request = encode(&header)?;
        args.serialize(&mut request)?;

        let reply = self.exchange(callback, request).await?;
        let body = Self::parse_reply(xid, &reply)?;
        let mut cursor = std::io::Cursor::new(body.as_slice());
        let res = deserialize::<CB_COMPOUND4res>(&mut cursor)?;
        if res.status != nfsstat4::NFS4_OK {
            return Err(anyhow!("CB_RECALL failed with {:?}", res.status));
        }
        Ok(())
    }
}

#[async_trait]
impl CallbackProbe for CallbackClient {
    async fn probe(&self, callback: &CallbackInfo) -> bool {
        match self.cb_null(callback).await {
            Ok(()) => true,
            Err(e) => {
                warn!(addr = %callback.addr, "callback path probe failed: {e}");
                false
            }
        }
    }
}
