//! Backchannel sender: server-to-client callbacks over session-bound
//! connections (RFC 8881 §2.10.3).
//!
//! One sender task per session. Callback requests arrive through a bounded
//! queue (enqueue never blocks; a full queue is an observable drop). The
//! task serializes callbacks: each gets a fresh XID, a CB_SEQUENCE op on
//! backchannel slot 0 with a monotonic sequence id, and a bounded wait for
//! the demultiplexed reply. Write failures fail over to an alternate bound
//! connection; repeated failures back off and eventually fault the
//! backchannel, which a later success clears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::rpc::{ConnRegistry, PendingReplyRouter};
use crate::protocol::xdr::nfs4::{
    nfs_cb_argop4, nfsstat4, notify4, sessionid4, stateid4, CB_COMPOUND, CB_COMPOUND4args,
    CB_COMPOUND4res, CB_NOTIFY4args, CB_RECALL4args, CB_SEQUENCE4args,
};
use crate::protocol::xdr::rpc::{
    accept_body, call_body, opaque_auth, reply_body, rpc_body, rpc_msg,
};
use crate::protocol::xdr::{deserialize, encode, Serialize};

/// Version of the NFSv4.1 callback program.
const CB_VERSION: u32 = 1;

/// Retry schedule before the backchannel is declared faulted.
const RETRY_BACKOFF: [Duration; 3] =
    [Duration::from_secs(5), Duration::from_secs(10), Duration::from_secs(20)];

/// A callback the state core wants delivered to the client.
#[derive(Clone, Debug)]
pub enum CallbackOp {
    Recall { stateid: stateid4, fh: Vec<u8>, truncate: bool },
    Notify { stateid: stateid4, fh: Vec<u8>, changes: Vec<notify4> },
}

impl CallbackOp {
    fn into_argop(self) -> nfs_cb_argop4 {
        match self {
            CallbackOp::Recall { stateid, fh, truncate } => {
                nfs_cb_argop4::CbRecall(CB_RECALL4args { stateid, truncate, fh })
            }
            CallbackOp::Notify { stateid, fh, changes } => {
                nfs_cb_argop4::CbNotify(CB_NOTIFY4args {
                    cna_stateid: stateid,
                    cna_fh: fh,
                    cna_changes: changes,
                })
            }
        }
    }
}

struct CallbackRequest {
    op: CallbackOp,
    done: oneshot::Sender<bool>,
}

/// Handle owned by the session; the sender task lives behind it.
pub struct BackchannelHandle {
    queue: mpsc::Sender<CallbackRequest>,
    faulted: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl BackchannelHandle {
    /// Non-blocking enqueue. Returns a completion receiver, or `None` when
    /// the queue is full and the caller must treat the callback as dropped.
    pub fn enqueue(&self, op: CallbackOp) -> Option<oneshot::Receiver<bool>> {
        let (done, done_rx) = oneshot::channel();
        match self.queue.try_send(CallbackRequest { op, done }) {
            Ok(()) => Some(done_rx),
            Err(_) => {
                warn!("backchannel queue full, callback dropped");
                None
            }
        }
    }

    /// True after the retry schedule was exhausted; cleared by any success.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Spawns the sender task for one session's backchannel.
pub fn spawn_backchannel(
    session_id: sessionid4,
    cb_program: u32,
    back_slots: u32,
    registry: Arc<ConnRegistry>,
    router: Arc<PendingReplyRouter>,
    queue_depth: usize,
    reply_timeout: Duration,
) -> BackchannelHandle {
    let (queue, rx) = mpsc::channel(queue_depth.max(1));
    let faulted = Arc::new(AtomicBool::new(false));
    let sender = SenderTask {
        session_id,
        cb_program,
        back_slots,
        registry,
        router,
        reply_timeout,
        faulted: Arc::clone(&faulted),
        next_xid: 0x6000_0000,
        next_cb_seqid: 1,
    };
    let task = tokio::spawn(sender.run(rx));
    BackchannelHandle { queue, faulted, task }
}

struct BuiltRecord {
    xid: u32,
    bytes: Vec<u8>,
}

struct SenderTask {
    session_id: sessionid4,
    cb_program: u32,
    back_slots: u32,
    registry: Arc<ConnRegistry>,
    router: Arc<PendingReplyRouter>,
    reply_timeout: Duration,
    faulted: Arc<AtomicBool>,
    next_xid: u32,
    next_cb_seqid: u32,
}

impl SenderTask {
    async fn run(mut self, mut rx: mpsc::Receiver<CallbackRequest>) {
        while let Some(request) = rx.recv().await {
            let ok = self.deliver(request.op).await;
            let _ = request.done.send(ok);
        }
        debug!("backchannel sender finished");
    }

    /// Delivers one callback with retries; returns overall success.
    async fn deliver(&mut self, op: CallbackOp) -> bool {
        // The sequence id is fixed for the whole delivery: a retry must look
        // like a retry to the client's slot table, not a new request.
        let cb_seqid = self.next_cb_seqid;
        let record = match self.build_record(cb_seqid, op) {
            Ok(record) => record,
            Err(e) => {
                warn!("failed to build CB_COMPOUND: {e}");
                return false;
            }
        };

        for (attempt, backoff) in RETRY_BACKOFF.iter().enumerate() {
            match self.try_once(&record.bytes, record.xid).await {
                Ok(()) => {
                    self.faulted.store(false, Ordering::Release);
                    self.next_cb_seqid = cb_seqid.wrapping_add(1);
                    return true;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, "backchannel callback failed: {e}");
                    if attempt + 1 < RETRY_BACKOFF.len() {
                        tokio::time::sleep(*backoff).await;
                    }
                }
            }
        }
        self.faulted.store(true, Ordering::Release);
        false
    }

    /// Builds the framed-ready CB_COMPOUND record: RPC call header, then
    /// CB_SEQUENCE on slot 0, then the payload op.
    fn build_record(
        &mut self,
        cb_seqid: u32,
        op: CallbackOp,
    ) -> Result<BuiltRecord, anyhow::Error> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);

        let header = rpc_msg {
            xid,
            body: rpc_body::CALL(call_body {
                rpcvers: 2,
                prog: self.cb_program,
                vers: CB_VERSION,
                proc: CB_COMPOUND,
                cred: opaque_auth::default(),
                verf: opaque_auth::default(),
            }),
        };
        let args = CB_COMPOUND4args {
            tag: String::new(),
            minorversion: 1,
            callback_ident: 0,
            argarray: vec![
                nfs_cb_argop4::CbSequence(CB_SEQUENCE4args {
                    csa_sessionid: self.session_id,
                    csa_sequenceid: cb_seqid,
                    csa_slotid: 0,
                    csa_highest_slotid: self.back_slots.saturating_sub(1),
                    csa_cachethis: false,
                    csa_referring_call_lists: Vec::new(),
                }),
                op.into_argop(),
            ],
        };
        let mut bytes = encode(&header)?;
        args.serialize(&mut bytes)?;
        Ok(BuiltRecord { xid, bytes })
    }

    /// One write-and-wait attempt, failing over between bound connections.
    async fn try_once(&self, record: &[u8], xid: u32) -> Result<(), anyhow::Error> {
        let conns = self.registry.bound_connections(&self.session_id);
        if conns.is_empty() {
            return Err(anyhow!("no connections bound to the backchannel"));
        }

        let reply_rx = self.router.register(xid);
        let mut written = false;
        for conn in conns {
            match conn.write_record(record).await {
                Ok(()) => {
                    written = true;
                    break;
                }
                Err(e) => {
                    debug!(conn = conn.id(), "backchannel write failed, trying alternate: {e}");
                }
            }
        }
        if !written {
            self.router.cancel(xid);
            return Err(anyhow!("all bound connections refused the write"));
        }

        let reply = match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(anyhow!("reply channel closed"));
            }
            Err(_) => {
                self.router.cancel(xid);
                return Err(anyhow!("timed out waiting for callback reply"));
            }
        };
        Self::check_reply(xid, &reply)
    }

    fn check_reply(xid: u32, reply: &[u8]) -> Result<(), anyhow::Error> {
        let mut cursor = std::io::Cursor::new(reply);
        let msg = deserialize::<rpc_msg>(&mut cursor)?;
        if msg.xid != xid {
            return Err(anyhow!("reply xid {} does not match call {xid}", msg.xid));
        }
        match msg.body {
            rpc_body::REPLY(reply_body::MSG_ACCEPTED(accepted)) => match accepted.reply_data {
                accept_body::SUCCESS => {
                    let res = deserialize::<CB_COMPOUND4res>(&mut cursor)?;
                    if res.status != nfsstat4::NFS4_OK {
                        return Err(anyhow!("CB_COMPOUND failed with {:?}", res.status));
                    }
                    Ok(())
                }
                other => Err(anyhow!("callback call not successful: {other:?}")),
            },
            rpc_body::REPLY(reply_body::MSG_DENIED(denied)) => {
                Err(anyhow!("callback call denied: {denied:?}"))
            }
            rpc_body::CALL(_) => Err(anyhow!("expected a REPLY on the backchannel")),
        }
    }
}
