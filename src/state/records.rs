//! Record types held by the state manager's central store.
//!
//! Opens, locks, and delegations reference each other cyclically in the
//! protocol model (owner to state and back). Here every record lives in a
//! map keyed by a stable identifier (the stateid's `other` bytes for states,
//! the client-scoped owner bytes for owners) and cross-references are those
//! identifiers, not pointers; all resolution happens under the store lock.

use std::sync::Arc;
use std::time::Instant;

use crate::protocol::xdr::nfs4::{clientid4, nfsstat4, stateid4, NFS4_OTHER_SIZE};
use crate::state::lease::LeaseTimer;

/// Opaque file handle bytes.
pub type Fh = Vec<u8>;
/// The `other` bytes of a stateid; the primary key of state records.
pub type Other = [u8; NFS4_OTHER_SIZE];

/// Client-scoped owner identifier, shared by open-owners and lock-owners.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub client_id: clientid4,
    pub owner: Vec<u8>,
}

/// Callback endpoint registered by SETCLIENTID / CREATE_SESSION.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallbackInfo {
    /// Client-chosen callback RPC program number.
    pub program: u32,
    /// Transport class, `tcp` or `tcp6`.
    pub netid: String,
    /// Universal address (`h1.h2.h3.h4.p1.p2`).
    pub addr: String,
}

/// One NFSv4 client, confirmed or not.
pub struct ClientRecord {
    /// Server-assigned id: boot epoch in the high word, serial in the low.
    pub client_id: clientid4,
    /// The client's opaque identity string (nfs_client_id4.id / co_ownerid).
    pub id_string: Vec<u8>,
    /// Client-supplied boot verifier.
    pub verifier: [u8; 8],
    /// Random verifier SETCLIENTID_CONFIRM must echo.
    pub confirm_verifier: [u8; 8],
    pub confirmed: bool,
    pub callback: CallbackInfo,
    /// Last known state of the callback path; gates delegation grants.
    pub cb_path_up: bool,
    pub created_at: Instant,
    /// Minor version the client bound with (0 or 1).
    pub minor_version: u32,
    /// v4.1: last CREATE_SESSION sequence processed for this client.
    pub sequence_id: u32,
    /// v4.1: encoded reply for `sequence_id`, replayed byte for byte.
    pub cached_create_session: Option<Vec<u8>>,
    /// Network address, persisted into the recovery snapshot.
    pub client_addr: String,
    pub lease: Arc<LeaseTimer>,
}

/// Cached encoded reply for owner-seqid replay (RFC 7530 §9.1.7).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedReply {
    pub status: nfsstat4,
    pub body: Vec<u8>,
}

/// Open-owner: groups opens sharing one client-chosen owner identity.
pub struct OpenOwner {
    pub key: OwnerKey,
    pub last_seqid: u32,
    pub confirmed: bool,
    /// Open-states belonging to this owner.
    pub opens: Vec<Other>,
    pub last_reply: Option<CachedReply>,
}

/// Lock-owner: a seqid stream independent of the open-owner's.
pub struct LockOwnerState {
    pub key: OwnerKey,
    pub last_seqid: u32,
    /// Lock-states belonging to this owner.
    pub locks: Vec<Other>,
    pub last_reply: Option<CachedReply>,
}

/// One open of a file by one open-owner.
pub struct OpenState {
    pub stateid: stateid4,
    pub owner: OwnerKey,
    pub fh: Fh,
    /// Accumulated access bits; only OPEN adds, only OPEN_DOWNGRADE removes.
    pub share_access: u32,
    pub share_deny: u32,
    pub confirmed: bool,
    /// Lock-states derived from this open.
    pub locks: Vec<Other>,
}

/// One (lock-owner, open-state) lock association.
pub struct LockState {
    pub stateid: stateid4,
    pub owner: OwnerKey,
    /// The open-state this lock-state was derived from.
    pub open_other: Other,
    pub fh: Fh,
}

/// Delegation kinds tracked by the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DelegationType {
    Read,
    Write,
    DirectoryRead,
}

impl DelegationType {
    pub fn is_directory(&self) -> bool {
        matches!(self, DelegationType::DirectoryRead)
    }
}

/// One granted delegation.
pub struct DelegationState {
    pub stateid: stateid4,
    pub client_id: clientid4,
    pub fh: Fh,
    pub deleg_type: DelegationType,
    /// Directory delegations: which notification types the client asked for
    /// (bits are `1 << NOTIFY4_*`).
    pub notify_mask: u32,
    pub recall_sent: bool,
    pub recall_time: Option<Instant>,
    pub revoked: bool,
}

/// Snapshot of a validated state handed back to I/O paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateView {
    pub stateid: stateid4,
    pub client_id: clientid4,
    pub fh: Fh,
    /// Access bits for opens and locks (the lock's parent open); delegations
    /// report their implied access.
    pub share_access: u32,
    pub share_deny: u32,
}
