//! RPC (Remote Procedure Call) transport plumbing as specified in RFC 5531.
//!
//! This module carries the pieces of the RPC layer the state core owns:
//!
//! 1. Record marking for TCP (fragment framing and reassembly)
//! 2. Connection writers that serialize concurrent writes onto one socket
//! 3. The pending-reply router that matches backchannel replies to waiters
//!
//! The forward-path dispatcher (program/procedure routing) lives in the
//! server shell outside this crate; the backchannel sender in
//! [`crate::session`] builds directly on these primitives.

mod conn;
mod reply_router;
mod wire;

pub use conn::{ConnRegistry, ConnWriter, TcpConnWriter};
pub use reply_router::PendingReplyRouter;
pub use wire::{read_fragment, read_record, write_record};

/// Maximum accepted size of one reassembled RPC record.
pub const MAX_RPC_RECORD_LENGTH: usize = 1024 * 1024;
