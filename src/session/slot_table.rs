//! Session slot tables: the NFSv4.1 exactly-once reply cache.
//!
//! Each channel of a session owns a fixed array of slots. A request names a
//! slot and a per-slot sequence id; the table decides whether it is new, a
//! replay (answered from the cached reply), a retry of something still
//! executing, or misordered. Unlike owner seqids, v4.1 slot seqids wrap
//! straight through zero.

use crate::state::error::{NfsError, Result};

/// One slot: its sequence position, execution state, and cached reply.
#[derive(Debug, Default)]
struct Slot {
    last_seqid: u32,
    in_use: bool,
    cached_reply: Option<Vec<u8>>,
}

/// Decision for an arriving SEQUENCE.
#[derive(Debug, PartialEq, Eq)]
pub enum SequenceDisposition {
    /// A new request: the slot is now marked in use and the caller must
    /// finish with [`SlotTable::complete`].
    New,
    /// A replay of a request whose reply was cached; return these bytes.
    Replay(Vec<u8>),
}

/// Slot table for one channel.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
    target_highest_slot_id: u32,
}

impl SlotTable {
    /// Builds a table of `count` slots; callers clamp `count` to the
    /// server's negotiated limits first.
    pub fn new(count: u32) -> SlotTable {
        let count = count.max(1) as usize;
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, Slot::default);
        SlotTable { slots, target_highest_slot_id: count as u32 - 1 }
    }

    pub fn max_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn highest_slot_id(&self) -> u32 {
        self.slots.len() as u32 - 1
    }

    /// Advisory feedback for the client, clamped to the table size.
    pub fn target_highest_slot_id(&self) -> u32 {
        self.target_highest_slot_id
    }

    pub fn set_target_highest_slot_id(&mut self, target: u32) {
        self.target_highest_slot_id = target.min(self.highest_slot_id());
    }

    /// Classifies one arriving (slot, seqid) pair.
    pub fn check_sequence(&mut self, slot_id: u32, seqid: u32) -> Result<SequenceDisposition> {
        let slot = self
            .slots
            .get_mut(slot_id as usize)
            .ok_or_else(NfsError::badslot)?;

        if slot.in_use {
            if seqid == slot.last_seqid {
                // The original is still executing; the client must wait.
                return Err(NfsError::delay("slot busy with the same request"));
            }
            return Err(NfsError::seq_misordered());
        }

        if seqid == slot.last_seqid {
            return match &slot.cached_reply {
                Some(bytes) => Ok(SequenceDisposition::Replay(bytes.clone())),
                None => Err(NfsError::retry_uncached()),
            };
        }
        // v4.1 slot seqids wrap through zero, unlike owner seqids.
        if seqid == slot.last_seqid.wrapping_add(1) {
            slot.in_use = true;
            return Ok(SequenceDisposition::New);
        }
        Err(NfsError::seq_misordered())
    }

    /// Finishes a request admitted by [`check_sequence`]: clears the busy
    /// mark, advances the slot, and caches the reply when asked to.
    pub fn complete(&mut self, slot_id: u32, seqid: u32, cache_this: bool, reply: Vec<u8>) {
        let Some(slot) = self.slots.get_mut(slot_id as usize) else { return };
        slot.in_use = false;
        slot.last_seqid = seqid;
        slot.cached_reply = if cache_this { Some(reply) } else { None };
    }

    /// True while any request is executing on any slot; DESTROY_SESSION
    /// refuses (with DELAY) until this clears.
    pub fn any_in_use(&self) -> bool {
        self.slots.iter().any(|s| s.in_use)
    }
}
