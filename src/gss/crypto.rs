//! Kerberos 5 cryptographic primitives backing the RFC 4121 token codec.
//!
//! Implements the AES simplified profile of RFC 3961/3962: usage-keyed
//! derivation, HMAC-SHA1-96 checksums, and AES in CBC mode with ciphertext
//! stealing (CS3) over a random confounder block.
//!
//! The session key itself comes from the `Verifier` capability; everything
//! here is deterministic given that key, so the initiator and acceptor sides
//! of a context always agree.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::gss::error::GssError;

type HmacSha1 = Hmac<Sha1>;

/// Truncated HMAC length used by the SHA1-96 checksum profile.
pub const CHECKSUM_LEN: usize = 12;
/// AES block and confounder size.
pub const BLOCK_LEN: usize = 16;

// RFC 3961 well-known derivation constants.
const KD_CHECKSUM: u8 = 0x99;
const KD_ENCRYPT: u8 = 0xAA;
const KD_INTEGRITY: u8 = 0x55;

/// Kerberos encryption types this server accepts from the verifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Etype {
    Aes128CtsHmacSha196 = 17,
    Aes256CtsHmacSha196 = 18,
}

impl Etype {
    pub fn from_u32(etype: u32) -> Option<Etype> {
        match etype {
            17 => Some(Etype::Aes128CtsHmacSha196),
            18 => Some(Etype::Aes256CtsHmacSha196),
            _ => None,
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            Etype::Aes128CtsHmacSha196 => 16,
            Etype::Aes256CtsHmacSha196 => 32,
        }
    }
}

/// Protection key for one GSS context: the negotiated etype plus key bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKey {
    pub etype: Etype,
    pub key: Vec<u8>,
}

impl SessionKey {
    pub fn new(etype: Etype, key: Vec<u8>) -> Result<SessionKey, GssError> {
        if key.len() != etype.key_len() {
            return Err(GssError::BadKey(format!(
                "key length {} does not match etype {:?}",
                key.len(),
                etype
            )));
        }
        Ok(SessionKey { etype, key })
    }
}

fn hmac_sha1(key: &[u8], chunks: &[&[u8]]) -> Vec<u8> {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    for chunk in chunks {
        mac.update(chunk);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Derives a usage-specific key from the context's protection key.
///
/// The derivation is the counter-mode HMAC expansion over the 4-byte key
/// usage and the RFC 3961 well-known constant byte, truncated to the etype's
/// key length.
fn derive_key(base: &SessionKey, usage: u32, constant: u8) -> Vec<u8> {
    let label = [
        (usage >> 24) as u8,
        (usage >> 16) as u8,
        (usage >> 8) as u8,
        usage as u8,
        constant,
    ];
    let mut derived = Vec::with_capacity(base.etype.key_len());
    let mut counter = 1_u8;
    while derived.len() < base.etype.key_len() {
        let block = hmac_sha1(&base.key, &[&label, &[counter]]);
        derived.extend_from_slice(&block);
        counter += 1;
    }
    derived.truncate(base.etype.key_len());
    derived
}

/// HMAC-SHA1-96 checksum with the usage's checksum key (Kc).
pub fn checksum(key: &SessionKey, usage: u32, chunks: &[&[u8]]) -> Vec<u8> {
    let kc = derive_key(key, usage, KD_CHECKSUM);
    let mut digest = hmac_sha1(&kc, chunks);
    digest.truncate(CHECKSUM_LEN);
    digest
}

/// Constant-time-ish checksum comparison; length mismatch fails first.
pub fn checksum_matches(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len()
        && expected.iter().zip(actual).fold(0_u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

enum AesKey {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl AesKey {
    fn new(key: &[u8]) -> AesKey {
        match key.len() {
            16 => AesKey::Aes128(Aes128::new_from_slice(key).expect("checked length")),
            _ => AesKey::Aes256(Aes256::new_from_slice(key).expect("checked length")),
        }
    }

    fn encrypt(&self, block: &mut [u8; BLOCK_LEN]) {
        match self {
            AesKey::Aes128(k) => k.encrypt_block(block.into()),
            AesKey::Aes256(k) => k.encrypt_block(block.into()),
        }
    }

    fn decrypt(&self, block: &mut [u8; BLOCK_LEN]) {
        match self {
            AesKey::Aes128(k) => k.decrypt_block(block.into()),
            AesKey::Aes256(k) => k.decrypt_block(block.into()),
        }
    }
}

fn xor_block(dst: &mut [u8; BLOCK_LEN], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// AES-CBC with ciphertext stealing (CS3), zero IV, over data >= one block.
fn cts_encrypt(key: &AesKey, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() >= BLOCK_LEN);
    let full = data.len() / BLOCK_LEN;
    let tail = data.len() % BLOCK_LEN;
    let nblocks = if tail == 0 { full } else { full + 1 };

    let mut blocks: Vec<[u8; BLOCK_LEN]> = Vec::with_capacity(nblocks);
    let mut prev = [0_u8; BLOCK_LEN];
    for i in 0..nblocks {
        let mut block = [0_u8; BLOCK_LEN];
        let start = i * BLOCK_LEN;
        let end = std::cmp::min(start + BLOCK_LEN, data.len());
        block[..end - start].copy_from_slice(&data[start..end]);
        xor_block(&mut block, &prev);
        key.encrypt(&mut block);
        prev = block;
        blocks.push(block);
    }

    let mut out = Vec::with_capacity(data.len());
    if nblocks == 1 {
        out.extend_from_slice(&blocks[0]);
        return out;
    }
    let last_len = if tail == 0 { BLOCK_LEN } else { tail };
    for block in &blocks[..nblocks - 2] {
        out.extend_from_slice(block);
    }
    // CS3 swaps the final two blocks and truncates the stolen bytes.
    out.extend_from_slice(&blocks[nblocks - 1]);
    out.extend_from_slice(&blocks[nblocks - 2][..last_len]);
    out
}

fn cts_decrypt(key: &AesKey, data: &[u8]) -> Result<Vec<u8>, GssError> {
    if data.len() < BLOCK_LEN {
        return Err(GssError::BadToken("ciphertext shorter than one block".into()));
    }
    let full = data.len() / BLOCK_LEN;
    let tail = data.len() % BLOCK_LEN;
    let nblocks = if tail == 0 { full } else { full + 1 };

    if nblocks == 1 {
        let mut block = [0_u8; BLOCK_LEN];
        block.copy_from_slice(data);
        key.decrypt(&mut block);
        return Ok(block.to_vec());
    }

    let last_len = if tail == 0 { BLOCK_LEN } else { tail };
    let prefix_len = (nblocks - 2) * BLOCK_LEN;
    let (prefix, rest) = data.split_at(prefix_len);
    let (swapped_full, last_short) = rest.split_at(BLOCK_LEN);

    // Reconstruct the stolen block from the decryption of the swapped one.
    let mut dn = [0_u8; BLOCK_LEN];
    dn.copy_from_slice(swapped_full);
    key.decrypt(&mut dn);

    let mut second_last = [0_u8; BLOCK_LEN];
    second_last[..last_len].copy_from_slice(last_short);
    second_last[last_len..].copy_from_slice(&dn[last_len..]);

    let mut out = Vec::with_capacity(data.len());
    let mut prev = [0_u8; BLOCK_LEN];
    for chunk in prefix.chunks(BLOCK_LEN) {
        let mut block = [0_u8; BLOCK_LEN];
        block.copy_from_slice(chunk);
        let cipher = block;
        key.decrypt(&mut block);
        xor_block(&mut block, &prev);
        out.extend_from_slice(&block);
        prev = cipher;
    }

    let mut pn1 = second_last;
    let cipher_n1 = second_last;
    key.decrypt(&mut pn1);
    xor_block(&mut pn1, &prev);
    out.extend_from_slice(&pn1);

    let mut pn = dn;
    xor_block(&mut pn, &cipher_n1);
    out.extend_from_slice(&pn[..last_len]);
    Ok(out)
}

/// Encrypts `plaintext` for the given key usage: random confounder, CBC-CS3
/// with the encryption key (Ke), trailing HMAC-SHA1-96 with the integrity
/// key (Ki) over the confounded plaintext.
pub fn encrypt(key: &SessionKey, usage: u32, plaintext: &[u8]) -> Vec<u8> {
    let ke = derive_key(key, usage, KD_ENCRYPT);
    let ki = derive_key(key, usage, KD_INTEGRITY);

    let mut confounded = vec![0_u8; BLOCK_LEN + plaintext.len()];
    rand::thread_rng().fill_bytes(&mut confounded[..BLOCK_LEN]);
    confounded[BLOCK_LEN..].copy_from_slice(plaintext);

    let aes = AesKey::new(&ke);
    let mut out = cts_encrypt(&aes, &confounded);
    let mut tag = hmac_sha1(&ki, &[&confounded]);
    tag.truncate(CHECKSUM_LEN);
    out.extend_from_slice(&tag);
    out
}

/// Reverses [`encrypt`], verifying the integrity tag before returning the
/// plaintext (without the confounder).
pub fn decrypt(key: &SessionKey, usage: u32, ciphertext: &[u8]) -> Result<Vec<u8>, GssError> {
    if ciphertext.len() < BLOCK_LEN + CHECKSUM_LEN {
        return Err(GssError::BadToken("ciphertext too short".into()));
    }
    let ke = derive_key(key, usage, KD_ENCRYPT);
    let ki = derive_key(key, usage, KD_INTEGRITY);

    let (body, tag) = ciphertext.split_at(ciphertext.len() - CHECKSUM_LEN);
    let aes = AesKey::new(&ke);
    let confounded = cts_decrypt(&aes, body)?;
    let mut expected = hmac_sha1(&ki, &[&confounded]);
    expected.truncate(CHECKSUM_LEN);
    if !checksum_matches(&expected, tag) {
        return Err(GssError::IntegrityFailure);
    }
    Ok(confounded[BLOCK_LEN..].to_vec())
}
