//! NFS4 Mamont - the NFSv4 server state core of the mamont NFS server family
//!
//! This library implements the stateful heart of an NFSv4.0 / NFSv4.1 server
//! as defined in RFC 7530 and RFC 8881, together with the RPCSEC_GSS
//! security flavor of RFC 2203 over the Kerberos 5 mechanism of RFC 4121.
//!
//! ## Main Components
//!
//! - `gss`: The RPCSEC_GSS processor - context establishment and teardown,
//!   per-call sequence-window replay protection, and the MIC / Wrap token
//!   codec used for integrity and privacy protection of call bodies.
//!
//! - `state`: The state manager - client identities (SETCLIENTID and
//!   EXCHANGE_ID), open-owners and lock-owners with seqid replay caches,
//!   open / lock / delegation stateids tagged with the boot epoch, leases
//!   with implicit renewal, and the post-restart grace period.
//!
//! - `session`: NFSv4.1 sessions - slot tables providing exactly-once
//!   semantics, CREATE_SESSION replay caching, and the backchannel sender
//!   that multiplexes CB_COMPOUND onto client-initiated connections.
//!
//! - `delegation`: The delegation engine - grant policy, conflict detection
//!   with asynchronous recall, bounded revocation timers, and batched
//!   directory-change notifications.
//!
//! - `callback`: The NFSv4.0 out-of-band callback client (CB_NULL and
//!   CB_RECALL over a dialed TCP connection).
//!
//! - `protocol`: XDR wire types for RPC, RPCSEC_GSS, NFSv4, and MOUNT,
//!   plus the record-marking transport helpers and the pending-reply router
//!   shared by the callback paths.
//!
//! Filesystem access, principal verification, and identity mapping stay
//! behind capability traits; this crate holds protocol state, not data.
//!
//! ## Standards Compliance
//!
//! - RFC 7530: NFS Version 4 Protocol Specification
//! - RFC 8881: NFS Version 4 Minor Version 1 Protocol Specification
//! - RFC 2203 / RFC 5403: RPCSEC_GSS Protocol Specification
//! - RFC 4121: The Kerberos Version 5 GSS-API Mechanism, Version 2
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//! - RFC 1813 Appendix I: MOUNT Protocol

pub mod callback;
pub mod config;
pub mod delegation;
pub mod gss;
pub mod mount;
pub mod protocol;
pub mod session;
pub mod state;

pub use delegation::DelegationEngine;
pub use protocol::xdr;
pub use state::StateManager;
