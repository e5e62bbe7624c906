//! Stateid allocation and the opaque `other` layout.
//!
//! The twelve opaque bytes of every stateid issued by this server are:
//!
//! ```text
//! byte 0      state type (0x01 open, 0x02 lock, 0x03 delegation)
//! bytes 1-3   low 24 bits of the boot epoch
//! bytes 4-11  monotonic 64-bit counter
//! ```
//!
//! The epoch fragment lets a restarted server distinguish its own stale
//! stateids (NFS4ERR_STALE_STATEID) from garbage (NFS4ERR_BAD_STATEID). The
//! counter guarantees uniqueness within a boot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::xdr::nfs4::NFS4_OTHER_SIZE;

/// State classes encoded in byte 0 of `other`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StateidType {
    Open = 0x01,
    Lock = 0x02,
    Delegation = 0x03,
}

impl StateidType {
    pub fn from_byte(b: u8) -> Option<StateidType> {
        match b {
            0x01 => Some(StateidType::Open),
            0x02 => Some(StateidType::Lock),
            0x03 => Some(StateidType::Delegation),
            _ => None,
        }
    }
}

/// Issues unique `other` values for one boot epoch.
pub struct StateidAllocator {
    epoch: u32,
    counter: AtomicU64,
}

impl StateidAllocator {
    /// Creates an allocator for the given boot epoch (seconds since the Unix
    /// epoch at startup).
    pub fn new(epoch: u32) -> StateidAllocator {
        StateidAllocator { epoch, counter: AtomicU64::new(1) }
    }

    /// Creates an allocator with the epoch taken from the wall clock.
    pub fn from_clock() -> StateidAllocator {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);
        StateidAllocator::new(epoch)
    }

    /// Boot epoch this allocator stamps into stateids.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Produces a fresh `other` value of the given type.
    pub fn generate_other(&self, kind: StateidType) -> [u8; NFS4_OTHER_SIZE] {
        let serial = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut other = [0_u8; NFS4_OTHER_SIZE];
        other[0] = kind as u8;
        other[1] = (self.epoch >> 16) as u8;
        other[2] = (self.epoch >> 8) as u8;
        other[3] = self.epoch as u8;
        other[4..].copy_from_slice(&serial.to_be_bytes());
        other
    }

    /// True if the `other` bytes carry this boot's epoch fragment.
    pub fn is_current_epoch(&self, other: &[u8; NFS4_OTHER_SIZE]) -> bool {
        other[1] == (self.epoch >> 16) as u8
            && other[2] == (self.epoch >> 8) as u8
            && other[3] == self.epoch as u8
    }
}

/// Advances a stateid or owner seqid.
///
/// Seqids are 32-bit counters that skip zero: 0xFFFFFFFF wraps to 1 so that
/// a zero seqid remains reserved for the special stateids.
pub fn next_seqid(seqid: u32) -> u32 {
    match seqid.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}
