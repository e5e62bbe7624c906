//! This module provides data structures for the RPCSEC_GSS security flavor
//! as defined in RFC 2203 (updated by RFC 5403).
//!
//! RPCSEC_GSS carries GSS-API security services over ONC RPC. The credential
//! travels in the call's `cred` field (flavor 6); control procedures
//! (context creation and destruction) travel in the procedure-argument
//! position, and protected data bodies wrap the original procedure arguments.

// Allow unused code since we implement the complete RFC specification
#![allow(dead_code)]
// Keep original RFC naming conventions for consistency with the specification
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

use super::*;

/// RPCSEC_GSS protocol version carried in every credential
pub const RPCSEC_GSS_VERS_1: u32 = 1;

/// Sequence numbers at or above this value destroy the context (RFC 2203 §5.3.3.1)
pub const MAXSEQ: u32 = 0x8000_0000;

/// Kerberos 5 GSS-API mechanism OID 1.2.840.113554.1.2.2, DER encoded
pub const KRB5_MECH_OID: [u8; 11] =
    [0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x12, 0x01, 0x02, 0x02];

// GSS-API major status values used in init replies (RFC 2744 §3.9.1).
/// Context establishment completed
pub const GSS_S_COMPLETE: u32 = 0;
/// More token exchanges are required to finish establishment
pub const GSS_S_CONTINUE_NEEDED: u32 = 1;
/// The supplied token was malformed
pub const GSS_S_DEFECTIVE_TOKEN: u32 = 9 << 16;
/// The supplied credential was malformed or could not be verified
pub const GSS_S_DEFECTIVE_CREDENTIAL: u32 = 10 << 16;
/// Unspecified mechanism-level failure
pub const GSS_S_FAILURE: u32 = 13 << 16;

/// RPCSEC_GSS control procedures (RFC 2203 §5.2)
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum rpc_gss_proc {
    /// Ordinary data call under an established context
    #[default]
    RPCSEC_GSS_DATA = 0,
    /// First token of context establishment
    RPCSEC_GSS_INIT = 1,
    /// Subsequent tokens of context establishment
    RPCSEC_GSS_CONTINUE_INIT = 2,
    /// Tear down an established context
    RPCSEC_GSS_DESTROY = 3,
}
SerializeEnum!(rpc_gss_proc);
DeserializeEnum!(rpc_gss_proc);

/// Protection service requested for a data call (RFC 2203 §5.3.1).
///
/// The service is read from the credential on every call; a single context
/// may alternate between levels call by call.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum rpc_gss_service {
    /// Authentication only; arguments travel in the clear
    #[default]
    RPC_GSS_SVC_NONE = 1,
    /// Arguments are integrity protected with a MIC
    RPC_GSS_SVC_INTEGRITY = 2,
    /// Arguments are encrypted
    RPC_GSS_SVC_PRIVACY = 3,
}
SerializeEnum!(rpc_gss_service);
DeserializeEnum!(rpc_gss_service);

/// The RPCSEC_GSS credential, version 1 (RFC 2203 §5.3.1).
///
/// Wire form is the version discriminant followed by the version-1 body.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct rpc_gss_cred {
    /// Control or data procedure selector
    pub gss_proc: rpc_gss_proc,
    /// Per-context sequence number, replay protected by the server window
    pub seq_num: u32,
    /// Protection level for this call
    pub service: rpc_gss_service,
    /// Server-issued opaque context handle; empty on INIT
    pub handle: Vec<u8>,
}

impl Serialize for rpc_gss_cred {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        RPCSEC_GSS_VERS_1.serialize(dest)?;
        self.gss_proc.serialize(dest)?;
        self.seq_num.serialize(dest)?;
        self.service.serialize(dest)?;
        self.handle.serialize(dest)
    }
}

impl Deserialize for rpc_gss_cred {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let version = deserialize::<u32>(src)?;
        if version != RPCSEC_GSS_VERS_1 {
            return Err(invalid_data(format!("Unsupported RPCSEC_GSS version {version}")));
        }
        self.gss_proc.deserialize(src)?;
        self.seq_num.deserialize(src)?;
        self.service.deserialize(src)?;
        self.handle.deserialize(src)
    }
}

/// Response to RPCSEC_GSS_INIT / CONTINUE_INIT (RFC 2203 §5.2.2).
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct rpc_gss_init_res {
    /// Context handle the client must present on subsequent calls
    pub handle: Vec<u8>,
    /// GSS-API major status for the establishment step
    pub gss_major: u32,
    /// Mechanism-specific minor status
    pub gss_minor: u32,
    /// Size of the server's sequence-number replay window
    pub seq_window: u32,
    /// Output token (AP-REP for mutual authentication), possibly empty
    pub gss_token: Vec<u8>,
}
DeserializeStruct!(rpc_gss_init_res, handle, gss_major, gss_minor, seq_window, gss_token);
SerializeStruct!(rpc_gss_init_res, handle, gss_major, gss_minor, seq_window, gss_token);

/// Integrity-protected data body (RFC 2203 §5.3.2.2).
///
/// `databody` is itself the XDR encoding of `{ seq_num, proc args }`; the
/// checksum is the MIC computed over those bytes.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct rpc_gss_integ_data {
    /// Serialized `{ seq_num, arguments }`
    pub databody: Vec<u8>,
    /// MIC over `databody`
    pub checksum: Vec<u8>,
}
DeserializeStruct!(rpc_gss_integ_data, databody, checksum);
SerializeStruct!(rpc_gss_integ_data, databody, checksum);

/// Builds the integrity inner body: the call sequence number followed by the
/// raw procedure arguments.
pub fn integ_inner(seq_num: u32, args: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + args.len());
    // Length-unprefixed: args are already XDR-encoded procedure arguments.
    let _ = seq_num.serialize(&mut body);
    body.extend_from_slice(args);
    body
}

/// Splits an integrity inner body back into `(seq_num, args)`.
pub fn split_integ_inner(body: &[u8]) -> std::io::Result<(u32, Vec<u8>)> {
    if body.len() < 4 {
        return Err(invalid_data("integrity body shorter than its sequence number"));
    }
    let mut cursor = &body[..4];
    let seq = deserialize::<u32>(&mut cursor)?;
    Ok((seq, body[4..].to_vec()))
}
