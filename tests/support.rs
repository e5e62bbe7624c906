//! Shared fixtures for the integration tests: a stub Kerberos verifier and
//! identity mapper, state-core construction helpers, and an in-memory
//! connection writer for backchannel tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use nfs4_mamont::config::StateConfig;
use nfs4_mamont::gss::crypto::{Etype, SessionKey};
use nfs4_mamont::gss::error::GssError;
use nfs4_mamont::gss::verifier::{ApReqVerification, Identity, IdentityMapper, Verifier};
use nfs4_mamont::protocol::rpc::ConnWriter;
use nfs4_mamont::state::grace::GraceEndFn;
use nfs4_mamont::state::lock_manager::LockManager;
use nfs4_mamont::state::records::CallbackInfo;
use nfs4_mamont::state::recovery::RecoverySnapshot;
use nfs4_mamont::state::StateManager;

/// A fixed 16-byte AES-128 key used across the GSS tests.
pub fn test_key() -> SessionKey {
    SessionKey::new(Etype::Aes128CtsHmacSha196, (0..16).collect()).expect("valid key")
}

/// A fixed 32-byte AES-256 key.
pub fn test_key_256() -> SessionKey {
    SessionKey::new(Etype::Aes256CtsHmacSha196, (0..32).collect()).expect("valid key")
}

/// Verifier that accepts any AP-REQ and reports the principal named in it.
///
/// The "AP-REQ" in these tests is simply the UTF-8 principal name; the stub
/// returns the fixed test session key and no subkey unless the principal
/// ends in `+subkey`.
pub struct StubVerifier;

#[async_trait]
impl Verifier for StubVerifier {
    async fn verify_ap_req(&self, ap_req: &[u8]) -> Result<ApReqVerification, GssError> {
        let principal = String::from_utf8(ap_req.to_vec())
            .map_err(|_| GssError::Defective("principal is not UTF-8".into()))?;
        if principal.is_empty() {
            return Err(GssError::Defective("empty principal".into()));
        }
        let subkey = principal.strip_suffix("+subkey").map(|_| test_key_256());
        let principal = principal.trim_end_matches("+subkey").to_string();
        Ok(ApReqVerification {
            principal,
            realm: "EXAMPLE.COM".to_string(),
            session_key: test_key(),
            subkey,
            ap_rep: b"ap-rep-token".to_vec(),
        })
    }
}

/// Maps `alice` to uid 1000 and everyone else to uid 65534.
pub struct StubMapper;

#[async_trait]
impl IdentityMapper for StubMapper {
    async fn map(&self, principal: &str, _realm: &str) -> Result<Identity, GssError> {
        let uid = if principal == "alice" { 1000 } else { 65534 };
        Ok(Identity { uid, gid: uid, gids: vec![uid] })
    }
}

/// Config with short timers suitable for tests.
pub fn test_config() -> StateConfig {
    let mut config = StateConfig::default();
    config.lease_secs = 60;
    config.grace_secs = Some(60);
    config
}

/// A manager with no recovery snapshot (grace skipped).
pub fn fresh_manager() -> Arc<StateManager> {
    StateManager::new(
        test_config(),
        Arc::new(LockManager::new()),
        RecoverySnapshot::default(),
        Box::new(|| {}),
    )
}

/// A manager seeded with a snapshot and a grace-end callback.
pub fn recovering_manager(
    snapshot: RecoverySnapshot,
    on_grace_end: GraceEndFn,
) -> Arc<StateManager> {
    StateManager::new(
        test_config(),
        Arc::new(LockManager::new()),
        snapshot,
        on_grace_end,
    )
}

/// Registers and confirms one v4.0 client, returning its id.
pub fn confirmed_client(manager: &StateManager, name: &[u8]) -> u64 {
    let (client_id, confirm) = manager
        .set_client_id(
            name.to_vec(),
            *b"bootverf",
            CallbackInfo {
                program: 0x4000_0000,
                netid: "tcp".to_string(),
                addr: "127.0.0.1.0.0".to_string(),
            },
            "127.0.0.1:700".to_string(),
        )
        .expect("SETCLIENTID");
    manager.confirm_client_id(client_id, confirm).expect("SETCLIENTID_CONFIRM");
    client_id
}

/// Connection writer that hands every written record to a channel.
pub struct MemConnWriter {
    id: u64,
    records: mpsc::UnboundedSender<Vec<u8>>,
    /// When set, writes fail; used to exercise failover.
    pub broken: std::sync::atomic::AtomicBool,
}

impl MemConnWriter {
    pub fn new(id: u64) -> (Arc<MemConnWriter>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(MemConnWriter {
                id,
                records: tx,
                broken: std::sync::atomic::AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ConnWriter for MemConnWriter {
    async fn write_record(&self, record: &[u8]) -> Result<(), anyhow::Error> {
        if self.broken.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(anyhow::anyhow!("connection marked broken"));
        }
        self.records
            .send(record.to_vec())
            .map_err(|_| anyhow::anyhow!("record receiver dropped"))
    }

    fn id(&self) -> u64 {
        self.id
    }
}
