//! Crash-recovery snapshot of confirmed clients.
//!
//! At shutdown the server persists one record per confirmed client; at the
//! next startup the snapshot seeds the grace period's expected-clients list
//! and nothing else. No open, lock, or delegation state is persisted; the
//! clients re-establish it through reclaims.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One persisted client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotClient {
    pub client_id: u64,
    pub id_string: Vec<u8>,
    pub verifier: Vec<u8>,
    pub client_addr: String,
}

/// The full snapshot file.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoverySnapshot {
    pub clients: Vec<SnapshotClient>,
}

impl RecoverySnapshot {
    /// Loads the snapshot; a missing or unreadable file yields an empty
    /// snapshot (and therefore no grace period).
    pub fn load(path: &Path) -> RecoverySnapshot {
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("ignoring malformed recovery snapshot {}: {e}", path.display());
                    RecoverySnapshot::default()
                }
            },
            Err(_) => RecoverySnapshot::default(),
        }
    }

    /// Writes the snapshot.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(format!("snapshot encoding failed: {e}")))?;
        std::fs::write(path, text)?;
        info!(clients = self.clients.len(), "recovery snapshot written");
        Ok(())
    }

    /// Client ids expected to reclaim during grace.
    pub fn expected_client_ids(&self) -> Vec<u64> {
        self.clients.iter().map(|c| c.client_id).collect()
    }
}
