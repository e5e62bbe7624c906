//! RFC 4121 per-message token codec: MIC and Wrap tokens.
//!
//! MIC tokens carry an HMAC over external data; Wrap tokens carry the data
//! itself, either sealed (encrypted) or integrity-only. Both embed a 64-bit
//! send sequence number, which RPCSEC_GSS binds to the credential's per-call
//! sequence number, and a flags byte identifying the sender and key
//! selection.
//!
//! Token header layout (16 bytes):
//!
//! ```text
//! MIC:  04 04 | flags | ff ff ff ff ff | snd_seq(8)
//! Wrap: 05 04 | flags | ff | EC(2) | RRC(2) | snd_seq(8)
//! ```

use crate::gss::crypto::{self, SessionKey, CHECKSUM_LEN};
use crate::gss::error::GssError;

/// Token identifier bytes.
const MIC_TOK_ID: [u8; 2] = [0x04, 0x04];
const WRAP_TOK_ID: [u8; 2] = [0x05, 0x04];

const HEADER_LEN: usize = 16;

/// Flag bits in byte 2 of every token.
pub const FLAG_SENT_BY_ACCEPTOR: u8 = 0x01;
pub const FLAG_SEALED: u8 = 0x02;
pub const FLAG_ACCEPTOR_SUBKEY: u8 = 0x04;

// RFC 4121 §2 key usage numbers.
pub const KG_USAGE_ACCEPTOR_SEAL: u32 = 22;
pub const KG_USAGE_ACCEPTOR_SIGN: u32 = 23;
pub const KG_USAGE_INITIATOR_SEAL: u32 = 24;
pub const KG_USAGE_INITIATOR_SIGN: u32 = 25;

/// Parsed fields common to both token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub flags: u8,
    pub seq: u64,
}

fn mic_header(flags: u8, seq: u64) -> [u8; HEADER_LEN] {
    let mut header = [0xff_u8; HEADER_LEN];
    header[..2].copy_from_slice(&MIC_TOK_ID);
    header[2] = flags;
    header[8..].copy_from_slice(&seq.to_be_bytes());
    header
}

fn wrap_header(flags: u8, ec: u16, rrc: u16, seq: u64) -> [u8; HEADER_LEN] {
    let mut header = [0_u8; HEADER_LEN];
    header[..2].copy_from_slice(&WRAP_TOK_ID);
    header[2] = flags;
    header[3] = 0xff;
    header[4..6].copy_from_slice(&ec.to_be_bytes());
    header[6..8].copy_from_slice(&rrc.to_be_bytes());
    header[8..].copy_from_slice(&seq.to_be_bytes());
    header
}

/// Computes a MIC token over `data`.
pub fn get_mic(key: &SessionKey, usage: u32, flags: u8, seq: u64, data: &[u8]) -> Vec<u8> {
    let header = mic_header(flags, seq);
    let cksum = crypto::checksum(key, usage, &[data, &header]);
    let mut token = Vec::with_capacity(HEADER_LEN + cksum.len());
    token.extend_from_slice(&header);
    token.extend_from_slice(&cksum);
    token
}

/// Verifies a MIC token over `data` and returns its flags and sequence number.
pub fn verify_mic(
    key: &SessionKey,
    usage: u32,
    token: &[u8],
    data: &[u8],
) -> Result<TokenInfo, GssError> {
    if token.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(GssError::BadToken("MIC token too short".into()));
    }
    if token[..2] != MIC_TOK_ID {
        return Err(GssError::BadToken("not a MIC token".into()));
    }
    if token[3..8] != [0xff; 5] {
        return Err(GssError::BadToken("bad MIC filler".into()));
    }
    let flags = token[2];
    let seq = u64::from_be_bytes(token[8..16].try_into().expect("checked length"));

    let header = mic_header(flags, seq);
    let expected = crypto::checksum(key, usage, &[data, &header]);
    if !crypto::checksum_matches(&expected, &token[HEADER_LEN..]) {
        return Err(GssError::IntegrityFailure);
    }
    Ok(TokenInfo { flags, seq })
}

/// Rotates payload bytes right by `rrc` positions (RFC 4121 §4.2.5).
fn rotate_right(payload: &mut [u8], rrc: usize) {
    if payload.is_empty() {
        return;
    }
    let rrc = rrc % payload.len();
    payload.rotate_right(rrc);
}

/// Builds a Wrap token around `data`.
///
/// With `seal`, the payload is the encryption of `data || header-copy`;
/// without it, the payload is `data || checksum(data || header-copy)` with
/// EC announcing the checksum length. The emitted RRC is always zero; peers
/// may send any rotation and [`unwrap`] reverses it.
pub fn wrap(
    key: &SessionKey,
    seal_usage: u32,
    flags: u8,
    seq: u64,
    data: &[u8],
    seal: bool,
) -> Vec<u8> {
    let flags = if seal { flags | FLAG_SEALED } else { flags & !FLAG_SEALED };
    if seal {
        let inner = wrap_header(flags, 0, 0, seq);
        let mut plaintext = Vec::with_capacity(data.len() + HEADER_LEN);
        plaintext.extend_from_slice(data);
        plaintext.extend_from_slice(&inner);
        let payload = crypto::encrypt(key, seal_usage, &plaintext);

        let mut token = Vec::with_capacity(HEADER_LEN + payload.len());
        token.extend_from_slice(&wrap_header(flags, 0, 0, seq));
        token.extend_from_slice(&payload);
        token
    } else {
        let ec = CHECKSUM_LEN as u16;
        let inner = wrap_header(flags, ec, 0, seq);
        let cksum = crypto::checksum(key, seal_usage, &[data, &inner]);

        let mut token = Vec::with_capacity(HEADER_LEN + data.len() + cksum.len());
        token.extend_from_slice(&wrap_header(flags, ec, 0, seq));
        token.extend_from_slice(data);
        token.extend_from_slice(&cksum);
        token
    }
}

/// Result of unwrapping a Wrap token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub data: Vec<u8>,
    pub info: TokenInfo,
    pub sealed: bool,
}

/// Parses and verifies a Wrap token, returning the protected data.
///
/// Accepts both sealed and integrity-only variants and reverses any RRC
/// rotation the sender applied. The header copy bound inside the payload is
/// compared against the outer header with RRC zeroed, defeating header
/// splicing.
pub fn unwrap(key: &SessionKey, seal_usage: u32, token: &[u8]) -> Result<Unwrapped, GssError> {
    if token.len() < HEADER_LEN {
        return Err(GssError::BadToken("Wrap token too short".into()));
    }
    if token[..2] != WRAP_TOK_ID {
        return Err(GssError::BadToken("not a Wrap token".into()));
    }
    if token[3] != 0xff {
        return Err(GssError::BadToken("bad Wrap filler".into()));
    }
    let flags = token[2];
    let ec = u16::from_be_bytes(token[4..6].try_into().expect("checked length"));
    let rrc = u16::from_be_bytes(token[6..8].try_into().expect("checked length"));
    let seq = u64::from_be_bytes(token[8..16].try_into().expect("checked length"));
    let sealed = flags & FLAG_SEALED != 0;

    let mut payload = token[HEADER_LEN..].to_vec();
    // Reversing a right-rotation of rrc is a further rotation by len - rrc.
    if !payload.is_empty() {
        let rrc = rrc as usize % payload.len();
        if rrc != 0 {
            let split_at = payload.len() - rrc;
            rotate_right(&mut payload, split_at);
        }
    }

    if sealed {
        let plaintext = crypto::decrypt(key, seal_usage, &payload)
            .map_err(|e| GssError::PrivacyFailure(e.to_string()))?;
        if plaintext.len() < HEADER_LEN {
            return Err(GssError::PrivacyFailure("sealed payload lost its header".into()));
        }
        let (data, inner) = plaintext.split_at(plaintext.len() - HEADER_LEN);
        let expected = wrap_header(flags, ec, 0, seq);
        if inner != expected {
            return Err(GssError::PrivacyFailure("header copy mismatch".into()));
        }
        // EC filler bytes precede the header copy in the sealed variant.
        if (ec as usize) > data.len() {
            return Err(GssError::PrivacyFailure("EC exceeds payload".into()));
        }
        let data = data[..data.len() - ec as usize].to_vec();
        Ok(Unwrapped { data, info: TokenInfo { flags, seq }, sealed })
    } else {
        if ec as usize != CHECKSUM_LEN || payload.len() < ec as usize {
            return Err(GssError::BadToken("bad EC for integrity-only Wrap".into()));
        }
        let (data, cksum) = payload.split_at(payload.len() - ec as usize);
        let inner = wrap_header(flags, ec, 0, seq);
        let expected = crypto::checksum(key, seal_usage, &[data, &inner]);
        if !crypto::checksum_matches(&expected, cksum) {
            return Err(GssError::IntegrityFailure);
        }
        Ok(Unwrapped { data: data.to_vec(), info: TokenInfo { flags, seq }, sealed })
    }
}
