//! Structured errors for state-manager operations.
//!
//! Every protocol-visible failure carries both the NFSv4 status code the
//! outer handler will put on the wire and a short human-readable message for
//! logs. Internal invariants map to `NFS4ERR_SERVERFAULT`; request paths
//! never panic.

use thiserror::Error;

use crate::protocol::xdr::nfs4::nfsstat4;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{status:?}: {message}")]
pub struct NfsError {
    pub status: nfsstat4,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, NfsError>;

impl NfsError {
    pub fn new(status: nfsstat4, message: impl Into<String>) -> NfsError {
        NfsError { status, message: message.into() }
    }

    pub fn bad_stateid(message: impl Into<String>) -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_BAD_STATEID, message)
    }

    pub fn old_stateid() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_OLD_STATEID, "stateid seqid is older than current")
    }

    pub fn stale_stateid() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_STALE_STATEID, "stateid from a previous server instance")
    }

    pub fn stale_clientid() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_STALE_CLIENTID, "unknown or unconfirmed client id")
    }

    pub fn expired() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_EXPIRED, "client lease has expired")
    }

    pub fn bad_seqid(message: impl Into<String>) -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_BAD_SEQID, message)
    }

    pub fn locks_held() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_LOCKS_HELD, "byte-range locks still held")
    }

    pub fn openmode() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_OPENMODE, "lock type incompatible with open access")
    }

    pub fn share_denied() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_SHARE_DENIED, "conflicting share reservation")
    }

    pub fn grace() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_GRACE, "new state not permitted during grace")
    }

    pub fn no_grace() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_NO_GRACE, "reclaim outside the grace period")
    }

    pub fn delay(message: impl Into<String>) -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_DELAY, message)
    }

    pub fn bad_session() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_BADSESSION, "unknown session id")
    }

    pub fn badslot() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_BADSLOT, "slot id beyond negotiated table")
    }

    pub fn seq_misordered() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_SEQ_MISORDERED, "sequence id out of order")
    }

    pub fn retry_uncached() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_RETRY_UNCACHED_REP, "replay of an uncached reply")
    }

    pub fn clid_in_use() -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_CLID_INUSE, "client id string held by another principal")
    }

    pub fn inval(message: impl Into<String>) -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_INVAL, message)
    }

    pub fn serverfault(message: impl Into<String>) -> NfsError {
        NfsError::new(nfsstat4::NFS4ERR_SERVERFAULT, message)
    }
}
