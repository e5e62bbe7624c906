//! Established GSS context records and the handle-keyed context store.
//!
//! A context is created by INIT, looked up by every DATA call, and removed
//! by DESTROY. Contexts idle longer than the store's TTL are evicted; a
//! client using an evicted handle sees CREDPROBLEM and re-establishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::sync::Cache;
use rand::RngCore;
use tracing::debug;

use crate::gss::crypto::SessionKey;
use crate::gss::window::SequenceWindow;

/// Length of the opaque context handle issued to clients.
pub const HANDLE_LEN: usize = 16;

/// One established RPCSEC_GSS context.
pub struct GssContext {
    /// Opaque handle the client presents in its credentials.
    pub handle: Vec<u8>,
    /// Authenticated principal (without realm).
    pub principal: String,
    /// Realm the principal authenticated under.
    pub realm: String,
    /// Protection key: the authenticator subkey when one was sent, otherwise
    /// the ticket session key.
    pub key: SessionKey,
    /// Whether the protection key is an acceptor-side subkey; controls the
    /// AcceptorSubkey flag on every token this server emits.
    pub acceptor_subkey: bool,
    /// When the context was established.
    pub created_at: Instant,
    /// Replay window over credential sequence numbers.
    window: Mutex<SequenceWindow>,
    /// Set once a MAXSEQ violation or DESTROY invalidates the context.
    destroyed: AtomicBool,
}

impl GssContext {
    pub fn new(
        handle: Vec<u8>,
        principal: String,
        realm: String,
        key: SessionKey,
        acceptor_subkey: bool,
    ) -> GssContext {
        GssContext {
            handle,
            principal,
            realm,
            key,
            acceptor_subkey,
            created_at: Instant::now(),
            window: Mutex::new(SequenceWindow::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Runs the sequence window for one DATA call.
    pub fn accept_seq(&self, seq: u32) -> bool {
        self.window.lock().expect("sequence window poisoned").accept(seq)
    }

    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Flags byte for tokens sent by this server under this context.
    pub fn acceptor_flags(&self) -> u8 {
        use crate::gss::token::{FLAG_ACCEPTOR_SUBKEY, FLAG_SENT_BY_ACCEPTOR};
        let mut flags = FLAG_SENT_BY_ACCEPTOR;
        if self.acceptor_subkey {
            flags |= FLAG_ACCEPTOR_SUBKEY;
        }
        flags
    }
}

/// Handle-keyed store of live contexts with idle-TTL eviction.
pub struct ContextStore {
    contexts: Cache<Vec<u8>, Arc<GssContext>>,
}

impl ContextStore {
    pub fn new(ttl: Duration) -> ContextStore {
        ContextStore {
            contexts: Cache::builder().time_to_idle(ttl).build(),
        }
    }

    /// Generates a fresh random handle, avoiding the vanishing chance of a
    /// collision with a live context.
    pub fn fresh_handle(&self) -> Vec<u8> {
        loop {
            let mut handle = vec![0_u8; HANDLE_LEN];
            rand::thread_rng().fill_bytes(&mut handle);
            if self.contexts.get(&handle).is_none() {
                return handle;
            }
        }
    }

    pub fn insert(&self, context: Arc<GssContext>) {
        debug!(principal = %context.principal, "storing GSS context");
        self.contexts.insert(context.handle.clone(), context);
    }

    pub fn get(&self, handle: &[u8]) -> Option<Arc<GssContext>> {
        self.contexts.get(handle)
    }

    pub fn remove(&self, handle: &[u8]) -> Option<Arc<GssContext>> {
        let context = self.contexts.remove(handle);
        if let Some(ref ctx) = context {
            ctx.mark_destroyed();
        }
        context
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.run_pending_tasks();
        self.contexts.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
