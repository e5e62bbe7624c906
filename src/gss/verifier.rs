//! Capability interfaces the GSS processor depends on.
//!
//! Kerberos itself (keytab access, AP-REQ decryption, AP-REP construction)
//! stays behind the [`Verifier`] trait, and principal-to-identity mapping
//! behind [`IdentityMapper`]. Both are hot-swappable at runtime so keytab
//! rotation and mapping reconfiguration need no restart.

use async_trait::async_trait;

use crate::gss::crypto::SessionKey;
use crate::gss::error::GssError;
use crate::protocol::xdr::gss::KRB5_MECH_OID;

/// Outcome of a successful AP-REQ verification.
#[derive(Clone, Debug)]
pub struct ApReqVerification {
    /// Client principal without the realm, e.g. `alice`.
    pub principal: String,
    /// Realm the principal authenticated under.
    pub realm: String,
    /// Ticket session key.
    pub session_key: SessionKey,
    /// Authenticator subkey, if the client sent one. When present it becomes
    /// the context's protection key and must be echoed in the AP-REP.
    pub subkey: Option<SessionKey>,
    /// Encoded AP-REP for mutual authentication; empty when the client did
    /// not request it.
    pub ap_rep: Vec<u8>,
}

/// Validates Kerberos AP-REQ tokens and produces AP-REP responses.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verifies the AP-REQ (already stripped of any GSS-API mech wrapper)
    /// and extracts the context key material.
    async fn verify_ap_req(&self, ap_req: &[u8]) -> Result<ApReqVerification, GssError>;
}

/// Local identity for an authenticated principal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

/// Maps Kerberos principals onto local uid/gid identities.
#[async_trait]
pub trait IdentityMapper: Send + Sync {
    async fn map(&self, principal: &str, realm: &str) -> Result<Identity, GssError>;
}

/// Strips the GSS-API initial context token framing, if present.
///
/// RFC 2743 §3.1 wraps the mechanism token as
/// `[APPLICATION 0] IMPLICIT SEQUENCE { OID, token }`, and RFC 4121 §4.1
/// prefixes the AP-REQ with the token id bytes `01 00`. Clients send the
/// wrapper on the first INIT token only, so a bare AP-REQ passes through
/// unchanged.
pub fn strip_mech_wrapper(token: &[u8]) -> Result<&[u8], GssError> {
    if token.first() != Some(&0x60) {
        return Ok(token);
    }
    // DER length: short form or long form with up to 4 length bytes.
    let (length, mut offset) = match token.get(1) {
        Some(&b) if b < 0x80 => (b as usize, 2),
        Some(&b) if (0x81..=0x84).contains(&b) => {
            let n = (b - 0x80) as usize;
            if token.len() < 2 + n {
                return Err(GssError::BadToken("truncated DER length".into()));
            }
            let mut length = 0_usize;
            for i in 0..n {
                length = (length << 8) | token[2 + i] as usize;
            }
            (length, 2 + n)
        }
        _ => return Err(GssError::BadToken("bad DER length".into())),
    };
    if token.len() < offset + length {
        return Err(GssError::BadToken("token shorter than DER length".into()));
    }

    let inner = &token[offset..offset + length];
    if !inner.starts_with(&KRB5_MECH_OID) {
        return Err(GssError::BadToken("unexpected GSS mechanism OID".into()));
    }
    offset = KRB5_MECH_OID.len();
    // RFC 4121 token id: 01 00 identifies an AP-REQ.
    if inner.len() < offset + 2 || inner[offset] != 0x01 || inner[offset + 1] != 0x00 {
        return Err(GssError::BadToken("unexpected inner token id".into()));
    }
    Ok(&inner[offset + 2..])
}
