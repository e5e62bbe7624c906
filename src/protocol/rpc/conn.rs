//! Connection writers and the registry of backchannel-bound connections.
//!
//! NFSv4.1 has no server-initiated connections: callbacks travel over TCP
//! connections the client opened and then bound to a session's backchannel.
//! The transport registers such connections here, and the backchannel sender
//! picks one (failing over to another on write errors).
//!
//! A connection is shared between fore-channel replies and callback calls,
//! so every writer serializes its record writes behind a mutex; fragments
//! from different records never interleave on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::protocol::rpc::wire::write_record;
use crate::protocol::xdr::nfs4::sessionid4;

/// Capability for writing one framed RPC record to a connection.
///
/// Implementations must be safe to call from concurrent tasks; the write of
/// a whole record is atomic with respect to other writers of the same
/// connection.
#[async_trait]
pub trait ConnWriter: Send + Sync {
    /// Writes `record` as record-marked fragments, holding the connection's
    /// write lock for the duration.
    async fn write_record(&self, record: &[u8]) -> Result<(), anyhow::Error>;

    /// Identifier for logs and registry bookkeeping.
    fn id(&self) -> u64;
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// [`ConnWriter`] over the write half of an accepted TCP connection.
pub struct TcpConnWriter {
    id: u64,
    write_half: Mutex<OwnedWriteHalf>,
}

impl TcpConnWriter {
    pub fn new(write_half: OwnedWriteHalf) -> TcpConnWriter {
        TcpConnWriter {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            write_half: Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl ConnWriter for TcpConnWriter {
    async fn write_record(&self, record: &[u8]) -> Result<(), anyhow::Error> {
        let mut write_half = self.write_half.lock().await;
        write_record(&mut *write_half, record).await
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Tracks which connections are bound to which session's backchannel.
///
/// BIND_CONN_TO_SESSION (and CREATE_SESSION with CONN_BACK_CHAN) add entries;
/// connection teardown removes them. The backchannel sender asks for the
/// current set and tries them in order.
#[derive(Default)]
pub struct ConnRegistry {
    bound: StdMutex<HashMap<sessionid4, Vec<Arc<dyn ConnWriter>>>>,
}

impl ConnRegistry {
    pub fn new() -> ConnRegistry {
        ConnRegistry::default()
    }

    /// Binds a connection to the session's backchannel.
    pub fn bind(&self, session_id: sessionid4, conn: Arc<dyn ConnWriter>) {
        let mut bound = self.bound.lock().expect("conn registry poisoned");
        let conns = bound.entry(session_id).or_default();
        if !conns.iter().any(|c| c.id() == conn.id()) {
            debug!("binding connection {} to session backchannel", conn.id());
            conns.push(conn);
        }
    }

    /// Removes a connection from every session it was bound to.
    pub fn unbind(&self, conn_id: u64) {
        let mut bound = self.bound.lock().expect("conn registry poisoned");
        for conns in bound.values_mut() {
            conns.retain(|c| c.id() != conn_id);
        }
        bound.retain(|_, conns| !conns.is_empty());
    }

    /// Drops all bindings for a destroyed session.
    pub fn remove_session(&self, session_id: &sessionid4) {
        let mut bound = self.bound.lock().expect("conn registry poisoned");
        bound.remove(session_id);
    }

    /// Returns the connections currently bound to the session's backchannel.
    pub fn bound_connections(&self, session_id: &sessionid4) -> Vec<Arc<dyn ConnWriter>> {
        let bound = self.bound.lock().expect("conn registry poisoned");
        bound.get(session_id).cloned().unwrap_or_default()
    }
}
