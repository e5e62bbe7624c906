//! Tunables for the state core.
//!
//! Defaults follow the protocol's recommendations (90 second leases, grace
//! equal to one lease). The struct deserializes from the server's TOML
//! configuration; every field has a serde default so partial configs work.

use std::time::Duration;

use serde::Deserialize;

fn default_lease_secs() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

fn default_max_delegations() -> usize {
    10_000
}

fn default_recall_ttl_secs() -> u64 {
    30
}

fn default_dir_batch_ms() -> u64 {
    50
}

fn default_dir_batch_cap() -> usize {
    100
}

fn default_sessions_per_client() -> usize {
    16
}

fn default_min_slots() -> u32 {
    1
}

fn default_max_slots() -> u32 {
    64
}

fn default_backchannel_queue() -> usize {
    32
}

fn default_backchannel_timeout_secs() -> u64 {
    10
}

fn default_callback_timeout_secs() -> u64 {
    5
}

fn default_reaper_secs() -> u64 {
    30
}

/// Configuration for the NFSv4 state manager and its satellites.
#[derive(Clone, Debug, Deserialize)]
pub struct StateConfig {
    /// Client lease duration in seconds.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Grace period duration in seconds; defaults to the lease duration.
    #[serde(default)]
    pub grace_secs: Option<u64>,

    /// Master switch for granting delegations.
    #[serde(default = "default_true")]
    pub delegations_enabled: bool,

    /// Upper bound on outstanding delegations.
    #[serde(default = "default_max_delegations")]
    pub max_delegations: usize,

    /// How long a recalled file stays ineligible for new delegations.
    #[serde(default = "default_recall_ttl_secs")]
    pub recall_ttl_secs: u64,

    /// Directory-notification batch window in milliseconds.
    #[serde(default = "default_dir_batch_ms")]
    pub dir_batch_ms: u64,

    /// Directory-notification buffer flush threshold.
    #[serde(default = "default_dir_batch_cap")]
    pub dir_batch_cap: usize,

    /// Maximum sessions one client may hold.
    #[serde(default = "default_sessions_per_client")]
    pub sessions_per_client: usize,

    /// Lower clamp for negotiated slot counts.
    #[serde(default = "default_min_slots")]
    pub min_slots: u32,

    /// Upper clamp for negotiated slot counts.
    #[serde(default = "default_max_slots")]
    pub max_slots: u32,

    /// Bounded depth of each session's backchannel queue.
    #[serde(default = "default_backchannel_queue")]
    pub backchannel_queue: usize,

    /// How long the backchannel waits for a callback reply, in seconds.
    #[serde(default = "default_backchannel_timeout_secs")]
    pub backchannel_timeout_secs: u64,

    /// Combined dial and I/O budget for v4.0 callbacks, in seconds.
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,

    /// Session reaper cycle, in seconds.
    #[serde(default = "default_reaper_secs")]
    pub reaper_secs: u64,
}

impl Default for StateConfig {
    fn default() -> StateConfig {
        toml::from_str("").expect("empty config uses serde defaults")
    }
}

impl StateConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn grace_duration(&self) -> Duration {
        Duration::from_secs(self.grace_secs.unwrap_or(self.lease_secs))
    }

    pub fn recall_ttl(&self) -> Duration {
        Duration::from_secs(self.recall_ttl_secs)
    }

    pub fn dir_batch_window(&self) -> Duration {
        Duration::from_millis(self.dir_batch_ms)
    }

    pub fn backchannel_timeout(&self) -> Duration {
        Duration::from_secs(self.backchannel_timeout_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    pub fn reaper_cycle(&self) -> Duration {
        Duration::from_secs(self.reaper_secs)
    }
}
