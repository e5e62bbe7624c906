//! The module defines XDR data types and constants for Network File System (NFS)
//! version 4, as defined in RFC 7530 (NFSv4.0) and RFC 8881 (NFSv4.1).
//!
//! Unlike NFSv3, version 4 is a stateful protocol: opens, byte-range locks,
//! delegations, and sessions are all named by server-issued state tokens.
//! This module provides the wire representations of those tokens and of the
//! callback path (CB_COMPOUND) the server uses to reach back into clients.
//!
//! Only the structures the state core speaks are defined here; the forward
//! COMPOUND procedure bodies live with the dispatch shell, outside this crate.

// Allow unused code since we implement the complete RFC specification
#![allow(dead_code)]
// Keep original RFC naming conventions for consistency with the specification
#![allow(non_camel_case_types)]

use std::fmt;
use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

use super::*;

/// The RPC program number for NFS version 4 service.
pub const PROGRAM: u32 = 100003;
/// The version number for NFS version 4 protocol.
pub const VERSION: u32 = 4;

/// Size in bytes of a session identifier.
pub const NFS4_SESSIONID_SIZE: usize = 16;
/// Size in bytes of the opaque portion of a stateid.
pub const NFS4_OTHER_SIZE: usize = 12;
/// Size in bytes of a client/server verifier.
pub const NFS4_VERIFIER_SIZE: usize = 8;

/// An opaque 8-byte quantity used for boot instance and confirmation checks.
pub type verifier4 = [u8; NFS4_VERIFIER_SIZE];
/// Server-assigned 64-bit client identifier, scoped to a boot epoch.
pub type clientid4 = u64;
/// Per-slot and per-owner 32-bit sequence counter.
pub type sequenceid4 = u32;
/// Index into a session's slot table.
pub type slotid4 = u32;
/// Session identifier bytes.
pub type sessionid4 = [u8; NFS4_SESSIONID_SIZE];
/// Attribute/notification bitmap, one bit per word-indexed flag.
pub type bitmap4 = Vec<u32>;

// Share access / deny bits (RFC 7530 §16.16).
pub const OPEN4_SHARE_ACCESS_READ: u32 = 0x0000_0001;
pub const OPEN4_SHARE_ACCESS_WRITE: u32 = 0x0000_0002;
pub const OPEN4_SHARE_ACCESS_BOTH: u32 = 0x0000_0003;
pub const OPEN4_SHARE_DENY_NONE: u32 = 0x0000_0000;
pub const OPEN4_SHARE_DENY_READ: u32 = 0x0000_0001;
pub const OPEN4_SHARE_DENY_WRITE: u32 = 0x0000_0002;
pub const OPEN4_SHARE_DENY_BOTH: u32 = 0x0000_0003;

// OPEN result flags (RFC 7530 §16.16.4).
/// The open-owner must confirm this open with OPEN_CONFIRM.
pub const OPEN4_RESULT_CONFIRM: u32 = 0x0000_0002;
/// The server provides POSIX byte-range lock semantics on this file.
pub const OPEN4_RESULT_LOCKTYPE_POSIX: u32 = 0x0000_0004;

// CREATE_SESSION flags (RFC 8881 §18.36).
pub const CREATE_SESSION4_FLAG_PERSIST: u32 = 0x0000_0001;
pub const CREATE_SESSION4_FLAG_CONN_BACK_CHAN: u32 = 0x0000_0002;
pub const CREATE_SESSION4_FLAG_CONN_RDMA: u32 = 0x0000_0004;

/// Status codes the state core produces (RFC 7530 §13, RFC 8881 §15).
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum nfsstat4 {
    #[default]
    NFS4_OK = 0,
    NFS4ERR_PERM = 1,
    NFS4ERR_NOENT = 2,
    NFS4ERR_IO = 5,
    NFS4ERR_ACCESS = 13,
    NFS4ERR_EXIST = 17,
    NFS4ERR_NOTDIR = 20,
    NFS4ERR_ISDIR = 21,
    NFS4ERR_INVAL = 22,
    NFS4ERR_STALE = 70,
    NFS4ERR_BADHANDLE = 10001,
    NFS4ERR_BAD_COOKIE = 10003,
    NFS4ERR_NOTSUPP = 10004,
    NFS4ERR_SERVERFAULT = 10006,
    NFS4ERR_BADTYPE = 10007,
    NFS4ERR_DELAY = 10008,
    NFS4ERR_SAME = 10009,
    NFS4ERR_DENIED = 10010,
    NFS4ERR_EXPIRED = 10011,
    NFS4ERR_LOCKED = 10012,
    NFS4ERR_GRACE = 10013,
    NFS4ERR_FHEXPIRED = 10014,
    NFS4ERR_SHARE_DENIED = 10015,
    NFS4ERR_WRONGSEC = 10016,
    NFS4ERR_CLID_INUSE = 10017,
    NFS4ERR_RESOURCE = 10018,
    NFS4ERR_MOVED = 10019,
    NFS4ERR_NOFILEHANDLE = 10020,
    NFS4ERR_MINOR_VERS_MISMATCH = 10021,
    NFS4ERR_STALE_CLIENTID = 10022,
    NFS4ERR_STALE_STATEID = 10023,
    NFS4ERR_OLD_STATEID = 10024,
    NFS4ERR_BAD_STATEID = 10025,
    NFS4ERR_BAD_SEQID = 10026,
    NFS4ERR_NOT_SAME = 10027,
    NFS4ERR_LOCK_RANGE = 10028,
    NFS4ERR_SYMLINK = 10029,
    NFS4ERR_RESTOREFH = 10030,
    NFS4ERR_LEASE_MOVED = 10031,
    NFS4ERR_ATTRNOTSUPP = 10032,
    NFS4ERR_NO_GRACE = 10033,
    NFS4ERR_RECLAIM_BAD = 10034,
    NFS4ERR_RECLAIM_CONFLICT = 10035,
    NFS4ERR_BADXDR = 10036,
    NFS4ERR_LOCKS_HELD = 10037,
    NFS4ERR_OPENMODE = 10038,
    NFS4ERR_BADOWNER = 10039,
    NFS4ERR_BADCHAR = 10040,
    NFS4ERR_BADNAME = 10041,
    NFS4ERR_BAD_RANGE = 10042,
    NFS4ERR_LOCK_NOTSUPP = 10043,
    NFS4ERR_OP_ILLEGAL = 10044,
    NFS4ERR_DEADLOCK = 10045,
    NFS4ERR_FILE_OPEN = 10046,
    NFS4ERR_ADMIN_REVOKED = 10047,
    NFS4ERR_CB_PATH_DOWN = 10048,
    NFS4ERR_BADSESSION = 10052,
    NFS4ERR_BADSLOT = 10053,
    NFS4ERR_COMPLETE_ALREADY = 10054,
    NFS4ERR_CONN_NOT_BOUND_TO_SESSION = 10055,
    NFS4ERR_DELEG_ALREADY_WANTED = 10056,
    NFS4ERR_BACK_CHAN_BUSY = 10057,
    NFS4ERR_NOMATCHING_LAYOUT = 10060,
    NFS4ERR_SEQ_FALSE_RETRY = 10072,
    NFS4ERR_SEQ_MISORDERED = 10063,
    NFS4ERR_SEQUENCE_POS = 10064,
    NFS4ERR_REQ_TOO_BIG = 10066,
    NFS4ERR_REP_TOO_BIG = 10067,
    NFS4ERR_RETRY_UNCACHED_REP = 10068,
    NFS4ERR_TOO_MANY_OPS = 10070,
    NFS4ERR_OP_NOT_IN_SESSION = 10071,
    NFS4ERR_DELEG_REVOKED = 10087,
}
SerializeEnum!(nfsstat4);
DeserializeEnum!(nfsstat4);

/// State token naming one protocol-visible piece of state (RFC 7530 §9.1.4).
///
/// The `other` layout is private to this server (type byte, boot-epoch low
/// bits, monotonic counter) but stable within a boot so stale detection works.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct stateid4 {
    /// Mutation counter for this particular state; wraps to 1, never 0
    pub seqid: u32,
    /// Opaque server-private identifier bytes
    pub other: [u8; NFS4_OTHER_SIZE],
}
DeserializeStruct!(stateid4, seqid, other);
SerializeStruct!(stateid4, seqid, other);

impl stateid4 {
    /// The anonymous stateid: permitted in I/O ops to bypass per-open checks.
    pub fn anonymous() -> stateid4 {
        stateid4 { seqid: 0, other: [0; NFS4_OTHER_SIZE] }
    }

    /// The READ bypass stateid: like anonymous, but also bypasses deny modes.
    pub fn read_bypass() -> stateid4 {
        stateid4 { seqid: u32::MAX, other: [0xff; NFS4_OTHER_SIZE] }
    }

    /// True for the two special stateids that skip lookup and lease checks.
    pub fn is_special(&self) -> bool {
        *self == stateid4::anonymous() || *self == stateid4::read_bypass()
    }
}

impl fmt::Display for stateid4 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.seqid)?;
        for b in self.other {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Byte-range lock types (RFC 7530 §16.10).
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum nfs_lock_type4 {
    #[default]
    READ_LT = 1,
    WRITE_LT = 2,
    /// Blocking read lock; this server answers it non-blocking
    READW_LT = 3,
    /// Blocking write lock; this server answers it non-blocking
    WRITEW_LT = 4,
}
SerializeEnum!(nfs_lock_type4);
DeserializeEnum!(nfs_lock_type4);

impl nfs_lock_type4 {
    /// True for WRITE_LT and its blocking variant.
    pub fn is_write(&self) -> bool {
        matches!(self, nfs_lock_type4::WRITE_LT | nfs_lock_type4::WRITEW_LT)
    }
}

/// How an OPEN names the file and what state it claims (RFC 7530 §16.16).
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum open_claim_type4 {
    /// Ordinary open of a file by name
    #[default]
    CLAIM_NULL = 0,
    /// Reclaim of state held before a server restart
    CLAIM_PREVIOUS = 1,
    /// Open by a client holding a delegation on the file
    CLAIM_DELEGATE_CUR = 2,
    /// Reclaim of a delegation held before restart
    CLAIM_DELEGATE_PREV = 3,
    /// v4.1 open by filehandle
    CLAIM_FH = 4,
    /// v4.1 delegation claim by filehandle
    CLAIM_DELEG_CUR_FH = 5,
    /// v4.1 delegation reclaim by filehandle
    CLAIM_DELEG_PREV_FH = 6,
}
SerializeEnum!(open_claim_type4);
DeserializeEnum!(open_claim_type4);

/// Delegation kinds (RFC 8881 §20.4; directory delegations §20.39).
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum open_delegation_type4 {
    #[default]
    OPEN_DELEGATE_NONE = 0,
    OPEN_DELEGATE_READ = 1,
    OPEN_DELEGATE_WRITE = 2,
}
SerializeEnum!(open_delegation_type4);
DeserializeEnum!(open_delegation_type4);

/// An owner of opens: the client id plus client-chosen opaque bytes.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct open_owner4 {
    pub clientid: clientid4,
    pub owner: Vec<u8>,
}
DeserializeStruct!(open_owner4, clientid, owner);
SerializeStruct!(open_owner4, clientid, owner);

/// An owner of byte-range locks; its seqid stream is independent of the
/// open-owner's.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct lock_owner4 {
    pub clientid: clientid4,
    pub owner: Vec<u8>,
}
DeserializeStruct!(lock_owner4, clientid, owner);
SerializeStruct!(lock_owner4, clientid, owner);

/// Conflicting-lock description returned when a LOCK or LOCKT is denied
/// (RFC 7530 §16.10.5).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LOCK4denied {
    pub offset: u64,
    pub length: u64,
    pub locktype: nfs_lock_type4,
    pub owner: lock_owner4,
}
DeserializeStruct!(LOCK4denied, offset, length, locktype, owner);
SerializeStruct!(LOCK4denied, offset, length, locktype, owner);

/// LOCK result: a new lock stateid or the conflicting holder.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LOCK4res {
    Resok4(stateid4),
    Denied(LOCK4denied),
}

impl Default for LOCK4res {
    fn default() -> LOCK4res {
        LOCK4res::Resok4(stateid4::default())
    }
}

impl Serialize for LOCK4res {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            LOCK4res::Resok4(sid) => {
                nfsstat4::NFS4_OK.serialize(dest)?;
                sid.serialize(dest)
            }
            LOCK4res::Denied(denied) => {
                nfsstat4::NFS4ERR_DENIED.serialize(dest)?;
                denied.serialize(dest)
            }
        }
    }
}
impl Deserialize for LOCK4res {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<nfsstat4>(src)? {
            nfsstat4::NFS4_OK => *self = LOCK4res::Resok4(deserialize(src)?),
            nfsstat4::NFS4ERR_DENIED => *self = LOCK4res::Denied(deserialize(src)?),
            status => {
                return Err(invalid_data(format!("Invalid status in LOCK4res: {status:?}")));
            }
        }
        Ok(())
    }
}

/// Directory-change attribute pair reported alongside OPEN (RFC 7530 §16.16).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct change_info4 {
    pub atomic: bool,
    pub before: u64,
    pub after: u64,
}
DeserializeStruct!(change_info4, atomic, before, after);
SerializeStruct!(change_info4, atomic, before, after);

/// ACE granted to the delegation holder; this server always grants to
/// EVERYONE@ as permitted by RFC 7530 §10.4.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct nfsace4 {
    pub acetype: u32,
    pub flag: u32,
    pub access_mask: u32,
    pub who: String,
}
DeserializeStruct!(nfsace4, acetype, flag, access_mask, who);
SerializeStruct!(nfsace4, acetype, flag, access_mask, who);

/// Space limit accompanying a write delegation.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum nfs_space_limit4 {
    /// Limit expressed in bytes
    Size(u64),
    /// Limit expressed in blocks
    Blocks { num_blocks: u32, bytes_per_block: u32 },
}

impl Default for nfs_space_limit4 {
    fn default() -> nfs_space_limit4 {
        nfs_space_limit4::Size(u64::MAX)
    }
}

impl Serialize for nfs_space_limit4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            nfs_space_limit4::Size(sz) => {
                1_u32.serialize(dest)?;
                sz.serialize(dest)
            }
            nfs_space_limit4::Blocks { num_blocks, bytes_per_block } => {
                2_u32.serialize(dest)?;
                num_blocks.serialize(dest)?;
                bytes_per_block.serialize(dest)
            }
        }
    }
}
impl Deserialize for nfs_space_limit4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<u32>(src)? {
            1 => *self = nfs_space_limit4::Size(deserialize(src)?),
            2 => {
                *self = nfs_space_limit4::Blocks {
                    num_blocks: deserialize(src)?,
                    bytes_per_block: deserialize(src)?,
                }
            }
            kind => {
                return Err(invalid_data(format!("Invalid limitby in nfs_space_limit4: {kind}")))
            }
        }
        Ok(())
    }
}

/// Read delegation body (RFC 7530 §16.16.5).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct open_read_delegation4 {
    pub stateid: stateid4,
    pub recall: bool,
    pub permissions: nfsace4,
}
DeserializeStruct!(open_read_delegation4, stateid, recall, permissions);
SerializeStruct!(open_read_delegation4, stateid, recall, permissions);

/// Write delegation body (RFC 7530 §16.16.5).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct open_write_delegation4 {
    pub stateid: stateid4,
    pub recall: bool,
    pub space_limit: nfs_space_limit4,
    pub permissions: nfsace4,
}
DeserializeStruct!(open_write_delegation4, stateid, recall, space_limit, permissions);
SerializeStruct!(open_write_delegation4, stateid, recall, space_limit, permissions);

/// Delegation arm of the OPEN result.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum open_delegation4 {
    #[default]
    None,
    Read(open_read_delegation4),
    Write(open_write_delegation4),
}

impl Serialize for open_delegation4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            open_delegation4::None => {
                open_delegation_type4::OPEN_DELEGATE_NONE.serialize(dest)
            }
            open_delegation4::Read(v) => {
                open_delegation_type4::OPEN_DELEGATE_READ.serialize(dest)?;
                v.serialize(dest)
            }
            open_delegation4::Write(v) => {
                open_delegation_type4::OPEN_DELEGATE_WRITE.serialize(dest)?;
                v.serialize(dest)
            }
        }
    }
}
impl Deserialize for open_delegation4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<open_delegation_type4>(src)? {
            open_delegation_type4::OPEN_DELEGATE_NONE => *self = open_delegation4::None,
            open_delegation_type4::OPEN_DELEGATE_READ => {
                *self = open_delegation4::Read(deserialize(src)?)
            }
            open_delegation_type4::OPEN_DELEGATE_WRITE => {
                *self = open_delegation4::Write(deserialize(src)?)
            }
        }
        Ok(())
    }
}

/// Successful OPEN result (RFC 7530 §16.16); these bytes are what the
/// open-owner replay cache stores.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OPEN4resok {
    pub stateid: stateid4,
    pub cinfo: change_info4,
    pub rflags: u32,
    pub attrset: bitmap4,
    pub delegation: open_delegation4,
}
DeserializeStruct!(OPEN4resok, stateid, cinfo, rflags, attrset, delegation);
SerializeStruct!(OPEN4resok, stateid, cinfo, rflags, attrset, delegation);

/// Channel limits negotiated at CREATE_SESSION (RFC 8881 §18.36).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct channel_attrs4 {
    pub ca_headerpadsize: u32,
    pub ca_maxrequestsize: u32,
    pub ca_maxresponsesize: u32,
    pub ca_maxresponsesize_cached: u32,
    pub ca_maxoperations: u32,
    pub ca_maxrequests: u32,
    pub ca_rdma_ird: Vec<u32>,
}
DeserializeStruct!(
    channel_attrs4,
    ca_headerpadsize,
    ca_maxrequestsize,
    ca_maxresponsesize,
    ca_maxresponsesize_cached,
    ca_maxoperations,
    ca_maxrequests,
    ca_rdma_ird
);
SerializeStruct!(
    channel_attrs4,
    ca_headerpadsize,
    ca_maxrequestsize,
    ca_maxresponsesize,
    ca_maxresponsesize_cached,
    ca_maxoperations,
    ca_maxrequests,
    ca_rdma_ird
);

/// Callback operation numbers (RFC 8881 §20).
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum nfs_cb_opnum4 {
    #[default]
    OP_CB_GETATTR = 3,
    OP_CB_RECALL = 4,
    OP_CB_LAYOUTRECALL = 5,
    OP_CB_NOTIFY = 6,
    OP_CB_PUSH_DELEG = 7,
    OP_CB_RECALL_ANY = 8,
    OP_CB_RECALLABLE_OBJ_AVAIL = 9,
    OP_CB_RECALL_SLOT = 10,
    OP_CB_SEQUENCE = 11,
    OP_CB_WANTS_CANCELLED = 12,
    OP_CB_NOTIFY_LOCK = 13,
    OP_CB_NOTIFY_DEVICEID = 14,
    OP_CB_ILLEGAL = 10044,
}
SerializeEnum!(nfs_cb_opnum4);
DeserializeEnum!(nfs_cb_opnum4);

/// The CB_NULL procedure number within the callback program.
pub const CB_NULL: u32 = 0;
/// The CB_COMPOUND procedure number within the callback program.
pub const CB_COMPOUND: u32 = 1;

// Directory notification types (RFC 8881 §20.4.3); the mask stores 1 << type.
pub const NOTIFY4_CHANGE_CHILD_ATTRS: u32 = 0;
pub const NOTIFY4_CHANGE_DIR_ATTRS: u32 = 1;
pub const NOTIFY4_REMOVE_ENTRY: u32 = 2;
pub const NOTIFY4_ADD_ENTRY: u32 = 3;
pub const NOTIFY4_RENAME_ENTRY: u32 = 4;
pub const NOTIFY4_CHANGE_COOKIE_VERIFIER: u32 = 5;

/// CB_SEQUENCE arguments: establishes exactly-once semantics on the
/// backchannel (RFC 8881 §20.9). Referring call lists are not produced by
/// this server and are encoded empty.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_SEQUENCE4args {
    pub csa_sessionid: sessionid4,
    pub csa_sequenceid: sequenceid4,
    pub csa_slotid: slotid4,
    pub csa_highest_slotid: slotid4,
    pub csa_cachethis: bool,
    pub csa_referring_call_lists: Vec<u32>,
}
DeserializeStruct!(
    CB_SEQUENCE4args,
    csa_sessionid,
    csa_sequenceid,
    csa_slotid,
    csa_highest_slotid,
    csa_cachethis,
    csa_referring_call_lists
);
SerializeStruct!(
    CB_SEQUENCE4args,
    csa_sessionid,
    csa_sequenceid,
    csa_slotid,
    csa_highest_slotid,
    csa_cachethis,
    csa_referring_call_lists
);

/// CB_RECALL arguments (RFC 7530 §14.2, RFC 8881 §20.2).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_RECALL4args {
    pub stateid: stateid4,
    pub truncate: bool,
    pub fh: Vec<u8>,
}
DeserializeStruct!(CB_RECALL4args, stateid, truncate, fh);
SerializeStruct!(CB_RECALL4args, stateid, truncate, fh);

/// A single notification blob within CB_NOTIFY: the mask says which
/// notification types are packed into the opaque values.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct notify4 {
    pub notify_mask: bitmap4,
    pub notify_vals: Vec<u8>,
}
DeserializeStruct!(notify4, notify_mask, notify_vals);
SerializeStruct!(notify4, notify_mask, notify_vals);

/// CB_NOTIFY arguments (RFC 8881 §20.4): directory change notifications for
/// a directory delegation.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_NOTIFY4args {
    pub cna_stateid: stateid4,
    pub cna_fh: Vec<u8>,
    pub cna_changes: Vec<notify4>,
}

impl Serialize for CB_NOTIFY4args {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.cna_stateid.serialize(dest)?;
        self.cna_fh.serialize(dest)?;
        (self.cna_changes.len() as u32).serialize(dest)?;
        for change in &self.cna_changes {
            change.serialize(dest)?;
        }
        Ok(())
    }
}
impl Deserialize for CB_NOTIFY4args {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.cna_stateid.deserialize(src)?;
        self.cna_fh.deserialize(src)?;
        let count = deserialize::<u32>(src)? as usize;
        self.cna_changes.clear();
        for _ in 0..count {
            self.cna_changes.push(deserialize(src)?);
        }
        Ok(())
    }
}

/// One operation inside a CB_COMPOUND call.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum nfs_cb_argop4 {
    CbSequence(CB_SEQUENCE4args),
    CbRecall(CB_RECALL4args),
    CbNotify(CB_NOTIFY4args),
}

impl Default for nfs_cb_argop4 {
    fn default() -> nfs_cb_argop4 {
        nfs_cb_argop4::CbRecall(CB_RECALL4args::default())
    }
}

impl Serialize for nfs_cb_argop4 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            nfs_cb_argop4::CbSequence(v) => {
                nfs_cb_opnum4::OP_CB_SEQUENCE.serialize(dest)?;
                v.serialize(dest)
            }
            nfs_cb_argop4::CbRecall(v) => {
                nfs_cb_opnum4::OP_CB_RECALL.serialize(dest)?;
                v.serialize(dest)
            }
            nfs_cb_argop4::CbNotify(v) => {
                nfs_cb_opnum4::OP_CB_NOTIFY.serialize(dest)?;
                v.serialize(dest)
            }
        }
    }
}
impl Deserialize for nfs_cb_argop4 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<nfs_cb_opnum4>(src)? {
            nfs_cb_opnum4::OP_CB_SEQUENCE => *self = nfs_cb_argop4::CbSequence(deserialize(src)?),
            nfs_cb_opnum4::OP_CB_RECALL => *self = nfs_cb_argop4::CbRecall(deserialize(src)?),
            nfs_cb_opnum4::OP_CB_NOTIFY => *self = nfs_cb_argop4::CbNotify(deserialize(src)?),
            op => return Err(invalid_data(format!("Unsupported callback op {op:?}"))),
        }
        Ok(())
    }
}

/// CB_COMPOUND call body (RFC 8881 §20.1). The v4.1 backchannel always puts
/// CB_SEQUENCE first; v4.0 callbacks omit it.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_COMPOUND4args {
    pub tag: String,
    pub minorversion: u32,
    pub callback_ident: u32,
    pub argarray: Vec<nfs_cb_argop4>,
}

impl Serialize for CB_COMPOUND4args {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.tag.serialize(dest)?;
        self.minorversion.serialize(dest)?;
        self.callback_ident.serialize(dest)?;
        (self.argarray.len() as u32).serialize(dest)?;
        for op in &self.argarray {
            op.serialize(dest)?;
        }
        Ok(())
    }
}
impl Deserialize for CB_COMPOUND4args {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.tag.deserialize(src)?;
        self.minorversion.deserialize(src)?;
        self.callback_ident.deserialize(src)?;
        let count = deserialize::<u32>(src)? as usize;
        self.argarray.clear();
        for _ in 0..count {
            self.argarray.push(deserialize(src)?);
        }
        Ok(())
    }
}

/// CB_COMPOUND reply as far as the state core consumes it: the overall
/// status, the echoed tag, and the per-op status codes. Per-op result bodies
/// beyond the status are skipped by the reply reader in the backchannel.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_COMPOUND4res {
    pub status: nfsstat4,
    pub tag: String,
    pub opcodes: Vec<(nfs_cb_opnum4, nfsstat4)>,
}

impl Deserialize for CB_COMPOUND4res {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.status.deserialize(src)?;
        self.tag.deserialize(src)?;
        let count = deserialize::<u32>(src)? as usize;
        self.opcodes.clear();
        for _ in 0..count {
            let op = deserialize::<nfs_cb_opnum4>(src)?;
            let status = deserialize::<nfsstat4>(src)?;
            self.opcodes.push((op, status));
            // Remaining per-op result bytes (CB_SEQUENCE resok etc.) follow;
            // the caller stops after the op it cares about.
            if status != nfsstat4::NFS4_OK || op != nfs_cb_opnum4::OP_CB_SEQUENCE {
                break;
            }
            let mut resok = CB_SEQUENCE4resok::default();
            resok.deserialize(src)?;
        }
        Ok(())
    }
}

/// CREATE_SESSION successful result (RFC 8881 §18.36); the encoding of this
/// structure is what the per-client replay cache stores and replays byte for
/// byte.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CREATE_SESSION4resok {
    pub csr_sessionid: sessionid4,
    pub csr_sequence: sequenceid4,
    pub csr_flags: u32,
    pub csr_fore_chan_attrs: channel_attrs4,
    pub csr_back_chan_attrs: channel_attrs4,
}
DeserializeStruct!(
    CREATE_SESSION4resok,
    csr_sessionid,
    csr_sequence,
    csr_flags,
    csr_fore_chan_attrs,
    csr_back_chan_attrs
);
SerializeStruct!(
    CREATE_SESSION4resok,
    csr_sessionid,
    csr_sequence,
    csr_flags,
    csr_fore_chan_attrs,
    csr_back_chan_attrs
);

/// CB_SEQUENCE successful result body (RFC 8881 §20.9).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CB_SEQUENCE4resok {
    pub csr_sessionid: sessionid4,
    pub csr_sequenceid: sequenceid4,
    pub csr_slotid: slotid4,
    pub csr_highest_slotid: slotid4,
    pub csr_target_highest_slotid: slotid4,
}
DeserializeStruct!(
    CB_SEQUENCE4resok,
    csr_sessionid,
    csr_sequenceid,
    csr_slotid,
    csr_highest_slotid,
    csr_target_highest_slotid
);
SerializeStruct!(
    CB_SEQUENCE4resok,
    csr_sessionid,
    csr_sequenceid,
    csr_slotid,
    csr_highest_slotid,
    csr_target_highest_slotid
);
