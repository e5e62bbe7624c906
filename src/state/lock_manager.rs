//! Byte-range lock manager with POSIX semantics.
//!
//! This is the single source of truth for byte-range conflicts, shared by
//! every protocol adapter that takes locks. The NFSv4 state manager stores
//! only ownership metadata (lock-owners, lock-stateids); all range
//! arithmetic happens here.
//!
//! POSIX behavior implemented:
//! - locks of the same owner never conflict; a new range replaces the
//!   owner's overlapping ranges (upgrade/downgrade in place)
//! - unlocking the middle of a held range splits it into up to two residuals
//! - unlocking a range that is not held succeeds (idempotent)

use std::collections::HashMap;
use std::sync::Mutex;

use smallvec::SmallVec;
use tracing::trace;

/// Identifies a lock holder across protocol adapters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockHolder {
    /// Owning NFSv4 client (or adapter-specific host id).
    pub client_id: u64,
    /// Opaque owner bytes chosen by the client.
    pub owner: Vec<u8>,
}

/// One held byte-range lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeldLock {
    pub holder: LockHolder,
    pub exclusive: bool,
    pub offset: u64,
    pub length: u64,
}

impl HeldLock {
    /// Exclusive end offset; a length of `u64::MAX` reaches end of file.
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    fn overlaps(&self, offset: u64, length: u64) -> bool {
        let end = offset.saturating_add(length);
        self.offset < end && offset < self.end()
    }
}

/// File-handle-keyed table of held locks.
#[derive(Default)]
pub struct LockManager {
    files: Mutex<HashMap<Vec<u8>, Vec<HeldLock>>>,
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager::default()
    }

    /// Attempts to acquire a lock; on conflict returns the first conflicting
    /// holder's lock without changing any state.
    pub fn try_lock(
        &self,
        fh: &[u8],
        holder: &LockHolder,
        exclusive: bool,
        offset: u64,
        length: u64,
    ) -> Result<(), HeldLock> {
        let mut files = self.files.lock().expect("lock table poisoned");
        let locks = files.entry(fh.to_vec()).or_default();

        if let Some(conflict) = conflicting(locks, holder, exclusive, offset, length) {
            return Err(conflict.clone());
        }

        // Replace any of the owner's own overlapping ranges (POSIX upgrade).
        let residuals = carve(locks, holder, offset, length);
        locks.extend(residuals);
        locks.push(HeldLock { holder: holder.clone(), exclusive, offset, length });
        trace!(?offset, ?length, exclusive, "byte-range lock acquired");
        Ok(())
    }

    /// Pure conflict query: reports a conflicting lock but never creates
    /// state, even on success.
    pub fn test_lock(
        &self,
        fh: &[u8],
        holder: &LockHolder,
        exclusive: bool,
        offset: u64,
        length: u64,
    ) -> Option<HeldLock> {
        let files = self.files.lock().expect("lock table poisoned");
        let locks = files.get(fh)?;
        conflicting(locks, holder, exclusive, offset, length).cloned()
    }

    /// Removes `[offset, offset+length)` from the holder's locks on `fh`,
    /// splitting held ranges as needed. Unlocking ranges that are not held
    /// is a no-op.
    pub fn unlock(&self, fh: &[u8], holder: &LockHolder, offset: u64, length: u64) {
        let mut files = self.files.lock().expect("lock table poisoned");
        if let Some(locks) = files.get_mut(fh) {
            let residuals = carve(locks, holder, offset, length);
            locks.extend(residuals);
            if locks.is_empty() {
                files.remove(fh);
            }
        }
    }

    /// True if the holder still has any lock on any file.
    pub fn holder_has_locks(&self, holder: &LockHolder) -> bool {
        let files = self.files.lock().expect("lock table poisoned");
        files.values().any(|locks| locks.iter().any(|l| &l.holder == holder))
    }

    /// Drops every lock belonging to the holder, across all files.
    pub fn release_holder(&self, holder: &LockHolder) {
        let mut files = self.files.lock().expect("lock table poisoned");
        for locks in files.values_mut() {
            locks.retain(|l| &l.holder != holder);
        }
        files.retain(|_, locks| !locks.is_empty());
    }

    /// Drops every lock belonging to any owner of the client. Used by lease
    /// expiry cascade.
    pub fn release_client(&self, client_id: u64) {
        let mut files = self.files.lock().expect("lock table poisoned");
        for locks in files.values_mut() {
            locks.retain(|l| l.holder.client_id != client_id);
        }
        files.retain(|_, locks| !locks.is_empty());
    }

    /// Total number of held ranges, for tests and diagnostics.
    pub fn held_count(&self) -> usize {
        let files = self.files.lock().expect("lock table poisoned");
        files.values().map(Vec::len).sum()
    }
}

fn conflicting<'a>(
    locks: &'a [HeldLock],
    holder: &LockHolder,
    exclusive: bool,
    offset: u64,
    length: u64,
) -> Option<&'a HeldLock> {
    locks.iter().find(|held| {
        &held.holder != holder
            && held.overlaps(offset, length)
            && (exclusive || held.exclusive)
    })
}

/// Removes `[offset, offset+length)` from the holder's ranges in place and
/// returns the residual pieces to re-insert. A single held range can produce
/// at most two residuals, hence the inline vector.
fn carve(
    locks: &mut Vec<HeldLock>,
    holder: &LockHolder,
    offset: u64,
    length: u64,
) -> SmallVec<[HeldLock; 2]> {
    let end = offset.saturating_add(length);
    let mut residuals: SmallVec<[HeldLock; 2]> = SmallVec::new();

    locks.retain(|held| {
        if &held.holder != holder || !held.overlaps(offset, length) {
            return true;
        }
        if held.offset < offset {
            residuals.push(HeldLock {
                holder: held.holder.clone(),
                exclusive: held.exclusive,
                offset: held.offset,
                length: offset - held.offset,
            });
        }
        if held.end() > end {
            residuals.push(HeldLock {
                holder: held.holder.clone(),
                exclusive: held.exclusive,
                offset: end,
                length: held.end() - end,
            });
        }
        false
    });
    residuals
}
