//! NFSv4.1 sessions: creation, SEQUENCE routing, destruction, and the
//! reaper that collects sessions of departed clients.
//!
//! Sessions connect the v4.1 client association model to the slot tables
//! (exactly-once semantics) and to the backchannel sender. The CREATE_SESSION
//! replay cache itself lives on the client record in the state manager; this
//! module owns everything keyed by session id.

pub mod backchannel;
pub mod slot_table;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StateConfig;
use crate::protocol::rpc::{ConnRegistry, PendingReplyRouter};
use crate::protocol::xdr::encode;
use crate::protocol::xdr::nfs4::{
    channel_attrs4, clientid4, sessionid4, CREATE_SESSION4resok,
    CREATE_SESSION4_FLAG_CONN_BACK_CHAN, CREATE_SESSION4_FLAG_CONN_RDMA,
    CREATE_SESSION4_FLAG_PERSIST,
};
use crate::state::error::{NfsError, Result};
use crate::state::records::CallbackInfo;
use crate::state::StateManager;
use backchannel::{BackchannelHandle, CallbackOp};
use slot_table::{SequenceDisposition, SlotTable};

/// One live session.
pub struct Session {
    pub id: sessionid4,
    pub client_id: clientid4,
    pub flags: u32,
    pub cb_program: u32,
    fore: Mutex<SlotTable>,
    back: Mutex<SlotTable>,
    backchannel: Option<BackchannelHandle>,
}

impl Session {
    /// Fore-channel SEQUENCE validation for this session.
    pub fn check_sequence(&self, slot_id: u32, seqid: u32) -> Result<SequenceDisposition> {
        self.fore.lock().expect("slot table poisoned").check_sequence(slot_id, seqid)
    }

    /// Completes a fore-channel request admitted by [`Self::check_sequence`].
    pub fn complete(&self, slot_id: u32, seqid: u32, cache_this: bool, reply: Vec<u8>) {
        self.fore
            .lock()
            .expect("slot table poisoned")
            .complete(slot_id, seqid, cache_this, reply)
    }

    pub fn fore_slots(&self) -> u32 {
        self.fore.lock().expect("slot table poisoned").max_slots()
    }

    pub fn target_highest_slot_id(&self) -> u32 {
        self.fore.lock().expect("slot table poisoned").target_highest_slot_id()
    }

    fn any_slot_in_use(&self) -> bool {
        self.fore.lock().expect("slot table poisoned").any_in_use()
            || self.back.lock().expect("slot table poisoned").any_in_use()
    }

    /// Enqueues a callback on this session's backchannel.
    pub fn send_callback(&self, op: CallbackOp) -> Option<tokio::sync::oneshot::Receiver<bool>> {
        self.backchannel.as_ref()?.enqueue(op)
    }

    pub fn backchannel_faulted(&self) -> bool {
        self.backchannel.as_ref().map(|b| b.is_faulted()).unwrap_or(true)
    }
}

/// All sessions, plus the machinery they share.
pub struct SessionTable {
    config: StateConfig,
    manager: Arc<StateManager>,
    registry: Arc<ConnRegistry>,
    router: Arc<PendingReplyRouter>,
    sessions: Mutex<HashMap<sessionid4, Arc<Session>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTable {
    pub fn new(
        config: StateConfig,
        manager: Arc<StateManager>,
        registry: Arc<ConnRegistry>,
        router: Arc<PendingReplyRouter>,
    ) -> Arc<SessionTable> {
        Arc::new(SessionTable {
            config,
            manager,
            registry,
            router,
            sessions: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
        })
    }

    /// Clamps client-requested channel attributes to server limits. PERSIST
    /// and RDMA are never granted.
    fn negotiate_attrs(&self, requested: &channel_attrs4) -> channel_attrs4 {
        channel_attrs4 {
            ca_headerpadsize: 0,
            ca_maxrequestsize: requested.ca_maxrequestsize.min(1024 * 1024),
            ca_maxresponsesize: requested.ca_maxresponsesize.min(1024 * 1024),
            ca_maxresponsesize_cached: requested.ca_maxresponsesize_cached.min(64 * 1024),
            ca_maxoperations: requested.ca_maxoperations.min(16),
            ca_maxrequests: requested
                .ca_maxrequests
                .clamp(self.config.min_slots, self.config.max_slots),
            ca_rdma_ird: Vec::new(),
        }
    }

    /// CREATE_SESSION. Returns the encoded result, which is byte-identical
    /// on a replay of the same client sequence id.
    pub fn create_session(
        &self,
        client_id: clientid4,
        seq: u32,
        fore_attrs: &channel_attrs4,
        back_attrs: &channel_attrs4,
        flags: u32,
        cb_program: u32,
    ) -> Result<Vec<u8>> {
        if let Some(cached) = self.manager.create_session_check(client_id, seq)? {
            debug!(client_id, seq, "CREATE_SESSION replay served from cache");
            return Ok(cached);
        }

        {
            let sessions = self.sessions.lock().expect("session table poisoned");
            let held = sessions.values().filter(|s| s.client_id == client_id).count();
            if held >= self.config.sessions_per_client {
                return Err(NfsError::delay("session limit reached for client"));
            }
        }

        let mut id = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut id);

        let fore = self.negotiate_attrs(fore_attrs);
        let back = self.negotiate_attrs(back_attrs);
        // Reply caching on a persistent store and RDMA operation are not
        // offered; the flags come back cleared.
        let granted_flags =
            flags & !(CREATE_SESSION4_FLAG_PERSIST | CREATE_SESSION4_FLAG_CONN_RDMA);

        let backchannel = if granted_flags & CREATE_SESSION4_FLAG_CONN_BACK_CHAN != 0 {
            Some(backchannel::spawn_backchannel(
                id,
                cb_program,
                back.ca_maxrequests,
                Arc::clone(&self.registry),
                Arc::clone(&self.router),
                self.config.backchannel_queue,
                self.config.backchannel_timeout(),
            ))
        } else {
            None
        };

        let session = Arc::new(Session {
            id,
            client_id,
            flags: granted_flags,
            cb_program,
            fore: Mutex::new(SlotTable::new(fore.ca_maxrequests)),
            back: Mutex::new(SlotTable::new(back.ca_maxrequests)),
            backchannel,
        });

        let resok = CREATE_SESSION4resok {
            csr_sessionid: id,
            csr_sequence: seq,
            csr_flags: granted_flags,
            csr_fore_chan_attrs: fore,
            csr_back_chan_attrs: back,
        };
        let encoded = encode(&resok)
            .map_err(|e| NfsError::serverfault(format!("CREATE_SESSION encoding: {e}")))?;

        self.manager.create_session_commit(
            client_id,
            seq,
            encoded.clone(),
            CallbackInfo { program: cb_program, netid: String::new(), addr: String::new() },
        )?;
        self.sessions.lock().expect("session table poisoned").insert(id, session);
        info!(client_id, "session created");
        Ok(encoded)
    }

    pub fn session(&self, id: &sessionid4) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .get(id)
            .cloned()
            .ok_or_else(NfsError::bad_session)
    }

    /// SEQUENCE: slot validation plus the implicit lease renewal every
    /// successful SEQUENCE carries (RFC 8881 §18.46).
    pub fn sequence(
        &self,
        session_id: &sessionid4,
        slot_id: u32,
        seqid: u32,
    ) -> Result<(Arc<Session>, SequenceDisposition)> {
        let session = self.session(session_id)?;
        let disposition = session.check_sequence(slot_id, seqid)?;
        if let Err(e) = self.manager.renew(session.client_id) {
            // The slot must not stay busy for a client that is gone.
            if matches!(disposition, SequenceDisposition::New) {
                session.complete(slot_id, seqid, false, Vec::new());
            }
            return Err(e);
        }
        Ok((session, disposition))
    }

    /// All sessions of one client, newest last.
    pub fn sessions_of_client(&self, client_id: clientid4) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .values()
            .filter(|s| s.client_id == client_id)
            .cloned()
            .collect()
    }

    /// Enqueues a callback on any of the client's session backchannels.
    pub fn send_callback_to_client(
        &self,
        client_id: clientid4,
        op: CallbackOp,
    ) -> Option<tokio::sync::oneshot::Receiver<bool>> {
        for session in self.sessions_of_client(client_id) {
            if let Some(rx) = session.send_callback(op.clone()) {
                return Some(rx);
            }
        }
        None
    }

    /// DESTROY_SESSION. Refuses with DELAY while any slot is executing,
    /// unless this is an administrative eviction.
    pub fn destroy_session(&self, id: &sessionid4, admin: bool) -> Result<()> {
        let session = self.session(id)?;
        if !admin && session.any_slot_in_use() {
            return Err(NfsError::delay("session has requests in flight"));
        }
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        if let Some(session) = sessions.remove(id) {
            if let Some(ref backchannel) = session.backchannel {
                backchannel.shutdown();
            }
            self.registry.remove_session(id);
            info!(client_id = session.client_id, "session destroyed");
        }
        Ok(())
    }

    /// Starts the periodic reaper: sessions whose client has expired or been
    /// evicted are destroyed on the next cycle.
    pub fn start_reaper(self: &Arc<SessionTable>) {
        let table = Arc::downgrade(self);
        let cycle = self.config.reaper_cycle();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cycle);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else { return };
                let stale: Vec<sessionid4> = {
                    let sessions = table.sessions.lock().expect("session table poisoned");
                    sessions
                        .values()
                        .filter(|s| !table.manager.client_exists(s.client_id))
                        .map(|s| s.id)
                        .collect()
                };
                for id in stale {
                    warn!("reaping session of departed client");
                    let _ = table.destroy_session(&id, true);
                }
            }
        });
        *self.reaper.lock().expect("reaper slot poisoned") = Some(handle);
    }

    pub fn stop_reaper(&self) {
        if let Some(handle) = self.reaper.lock().expect("reaper slot poisoned").take() {
            handle.abort();
        }
    }

    /// Session count, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SessionTable {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().expect("reaper slot poisoned").take() {
            handle.abort();
        }
    }
}
