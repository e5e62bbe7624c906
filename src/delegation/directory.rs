//! Directory delegations: batched change notifications over the backchannel.
//!
//! A directory delegation carries a notification mask. Changes made by the
//! delegate itself are buffered per delegation, filtered by that mask, and
//! flushed as one CB_NOTIFY when either the batch window elapses or the
//! buffer reaches its cap. A change made by a *different* client conflicts
//! with the delegation and recalls it instead; deleting the directory
//! revokes it outright, with no recall round trip.
//!
//! Lock ordering: the buffer table's mutex is a leaf. It is taken only after
//! any state-manager call has returned, and is released before submitting to
//! the backchannel.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::xdr::nfs4::{clientid4, notify4, stateid4};
use crate::protocol::xdr::Serialize;
use crate::session::backchannel::CallbackOp;
use crate::state::records::{Fh, Other};

use super::DelegationEngine;

/// One buffered directory change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirNotification {
    /// A `NOTIFY4_*` type number.
    pub notify_type: u32,
    /// Entry the change concerns.
    pub entry_name: String,
    /// Directory cookie of the entry after the change.
    pub cookie: u64,
}

impl Serialize for DirNotification {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.notify_type.serialize(dest)?;
        self.entry_name.serialize(dest)?;
        self.cookie.serialize(dest)
    }
}

struct Buffer {
    client_id: clientid4,
    stateid: stateid4,
    dir_fh: Fh,
    entries: Vec<DirNotification>,
    flush_timer: Option<JoinHandle<()>>,
}

/// Per-delegation pending notification batches.
#[derive(Default)]
pub struct NotificationBuffers {
    buffers: Mutex<HashMap<Other, Buffer>>,
}

impl NotificationBuffers {
    pub fn new() -> NotificationBuffers {
        NotificationBuffers::default()
    }

    /// Discards the pending batch for a returned or revoked delegation.
    pub fn drop_buffer(&self, other: &Other) {
        let mut buffers = self.buffers.lock().expect("notification buffers poisoned");
        if let Some(buffer) = buffers.remove(other) {
            if let Some(timer) = buffer.flush_timer {
                timer.abort();
            }
        }
    }
}

impl DelegationEngine {
    /// Routes one directory change to the delegations on that directory.
    ///
    /// The delegate's own changes are batched for CB_NOTIFY; anyone else's
    /// change conflicts and recalls the delegation.
    pub fn notify_directory_change(
        &self,
        dir_fh: &[u8],
        origin_client: clientid4,
        notification: DirNotification,
    ) {
        for (other, client_id, mask, stateid) in
            self.manager().directory_delegations_on(dir_fh)
        {
            if client_id != origin_client {
                self.recall_delegation(&other, "conflict");
                continue;
            }
            if mask & (1 << notification.notify_type) == 0 {
                continue;
            }
            self.buffer_notification(other, client_id, stateid, dir_fh, notification.clone());
        }
    }

    /// Directory removal: every delegation on it is revoked immediately.
    pub fn directory_deleted(&self, dir_fh: &[u8]) {
        for (other, client_id, _, _) in self.manager().directory_delegations_on(dir_fh) {
            warn!(client_id, "revoking directory delegation: directory deleted");
            self.notifications.drop_buffer(&other);
            if let Some(fh) = self.manager().revoke_delegation(&other) {
                self.note_recalled(fh);
            }
        }
    }

    fn buffer_notification(
        &self,
        other: Other,
        client_id: clientid4,
        stateid: stateid4,
        dir_fh: &[u8],
        notification: DirNotification,
    ) {
        let cap = self.config().dir_batch_cap;
        let flush_now = {
            let mut buffers = self
                .notifications
                .buffers
                .lock()
                .expect("notification buffers poisoned");
            let buffer = buffers.entry(other).or_insert_with(|| Buffer {
                client_id,
                stateid,
                dir_fh: dir_fh.to_vec(),
                entries: Vec::new(),
                flush_timer: None,
            });
            buffer.entries.push(notification);

            if buffer.entries.len() >= cap {
                if let Some(timer) = buffer.flush_timer.take() {
                    timer.abort();
                }
                true
            } else {
                if buffer.flush_timer.is_none() {
                    buffer.flush_timer = Some(self.spawn_flush_timer(other));
                }
                false
            }
        };
        if flush_now {
            self.flush_notifications(&other);
        }
    }

    fn spawn_flush_timer(&self, other: Other) -> JoinHandle<()> {
        let window = self.config().dir_batch_window();
        let weak = self.weak();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(engine) = weak.upgrade() {
                engine.flush_notifications(&other);
            }
        })
    }

    /// Drains one delegation's batch and submits a CB_NOTIFY.
    pub fn flush_notifications(&self, other: &Other) {
        let (client_id, stateid, dir_fh, entries) = {
            let mut buffers = self
                .notifications
                .buffers
                .lock()
                .expect("notification buffers poisoned");
            let Some(buffer) = buffers.get_mut(other) else { return };
            if let Some(timer) = buffer.flush_timer.take() {
                timer.abort();
            }
            if buffer.entries.is_empty() {
                return;
            }
            (
                buffer.client_id,
                buffer.stateid,
                buffer.dir_fh.clone(),
                std::mem::take(&mut buffer.entries),
            )
        };

        let mut mask_word = 0_u32;
        let mut vals = Vec::new();
        for entry in &entries {
            mask_word |= 1 << entry.notify_type;
            if entry.serialize(&mut vals).is_err() {
                warn!("dropping unencodable directory notification");
            }
        }
        debug!(client_id, count = entries.len(), "flushing directory notifications");

        let op = CallbackOp::Notify {
            stateid,
            fh: dir_fh,
            changes: vec![notify4 { notify_mask: vec![mask_word], notify_vals: vals }],
        };
        if self.sessions().send_callback_to_client(client_id, op).is_none() {
            warn!(client_id, "no backchannel for directory notification batch");
        }
    }
}
