//! MOUNT version 3 procedures (RFC 1813 Appendix I).
//!
//! The mount program is the front door of the server: MNT validates the
//! export, checks the caller's address against the export's access rules,
//! and returns the root file handle together with the authentication
//! flavors the NFS program will accept. When RPCSEC_GSS is enabled the
//! Kerberos pseudo-flavors are advertised after AUTH_UNIX.
//!
//! Access checking fails closed: an unparsable client address or any error
//! from the export registry denies the mount.

use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::protocol::xdr::rpc::{AUTH_GSS_KRB5, AUTH_GSS_KRB5I, AUTH_GSS_KRB5P};
use crate::protocol::xdr::{self, deserialize, mount, Serialize};

/// Export lookup and access control, provided by the server shell.
pub trait Exports: Send + Sync {
    /// Resolves an export path to its root file handle.
    fn root_handle(&self, path: &[u8]) -> Option<Vec<u8>>;

    /// Whether `client_ip` may mount `path`.
    fn check_access(&self, client_ip: IpAddr, path: &[u8]) -> bool;

    /// Exported directories and the groups allowed to mount them.
    fn list(&self) -> Vec<(Vec<u8>, Vec<Vec<u8>>)>;
}

/// One recorded mount, for DUMP.
#[derive(Clone, Debug, PartialEq, Eq)]
struct MountEntry {
    hostname: Vec<u8>,
    directory: Vec<u8>,
}

/// Handles the six MOUNT procedures against an export registry.
pub struct MountHandler<E: Exports> {
    exports: E,
    /// Whether to advertise the RPCSEC_GSS Kerberos pseudo-flavors.
    gss_enabled: bool,
    mounts: Mutex<Vec<MountEntry>>,
}

impl<E: Exports> MountHandler<E> {
    pub fn new(exports: E, gss_enabled: bool) -> MountHandler<E> {
        MountHandler { exports, gss_enabled, mounts: Mutex::new(Vec::new()) }
    }

    fn auth_flavors(&self) -> Vec<u32> {
        let mut flavors = vec![xdr::rpc::auth_flavor::AUTH_UNIX as u32];
        if self.gss_enabled {
            flavors.extend_from_slice(&[AUTH_GSS_KRB5, AUTH_GSS_KRB5I, AUTH_GSS_KRB5P]);
        }
        flavors
    }

    /// Handles MOUNT NULL (procedure 0).
    pub fn null(&self, xid: u32, output: &mut impl Write) -> Result<(), anyhow::Error> {
        xdr::rpc::make_success_reply(xid).serialize(output)?;
        Ok(())
    }

    /// Handles MNT (procedure 1): export validation, access check, and the
    /// root file handle plus auth-flavor advertisement.
    pub fn mnt(
        &self,
        xid: u32,
        input: &mut impl Read,
        output: &mut impl Write,
        client_addr: &str,
    ) -> Result<(), anyhow::Error> {
        let path = deserialize::<mount::dirpath>(input)?;
        debug!("mountproc3_mnt({:?},{:?})", xid, String::from_utf8_lossy(&path));

        // Fail closed: no parsable source address, no mount.
        let client_ip = match client_addr.rsplit_once(':').map(|(host, _)| host) {
            Some(host) => host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>(),
            None => client_addr.parse::<IpAddr>(),
        };
        let client_ip = match client_ip {
            Ok(ip) => ip,
            Err(_) => {
                warn!("denying mount: unparsable client address {client_addr}");
                xdr::rpc::make_success_reply(xid).serialize(output)?;
                mount::mountstat3::MNT3ERR_ACCES.serialize(output)?;
                return Ok(());
            }
        };
        if !self.exports.check_access(client_ip, &path) {
            debug!("{:?} --> access denied for {client_ip}", xid);
            xdr::rpc::make_success_reply(xid).serialize(output)?;
            mount::mountstat3::MNT3ERR_ACCES.serialize(output)?;
            return Ok(());
        }

        match self.exports.root_handle(&path) {
            Some(fhandle) => {
                let response =
                    mount::mountres3_ok { fhandle, auth_flavors: self.auth_flavors() };
                debug!("{:?} --> {:?}", xid, response);
                self.mounts.lock().expect("mount list poisoned").push(MountEntry {
                    hostname: client_addr.as_bytes().to_vec(),
                    directory: path,
                });
                xdr::rpc::make_success_reply(xid).serialize(output)?;
                mount::mountstat3::MNT3_OK.serialize(output)?;
                response.serialize(output)?;
            }
            None => {
                debug!("{:?} --> no matching export", xid);
                xdr::rpc::make_success_reply(xid).serialize(output)?;
                mount::mountstat3::MNT3ERR_NOENT.serialize(output)?;
            }
        }
        Ok(())
    }

    /// Handles DUMP (procedure 2): the list of current mounts.
    pub fn dump(&self, xid: u32, output: &mut impl Write) -> Result<(), anyhow::Error> {
        xdr::rpc::make_success_reply(xid).serialize(output)?;
        let mounts = self.mounts.lock().expect("mount list poisoned");
        let bodies: Vec<mount::mountbody> = mounts
            .iter()
            .map(|m| mount::mountbody {
                ml_hostname: m.hostname.clone(),
                ml_directory: m.directory.clone(),
            })
            .collect();
        mount::serialize_list(&bodies, output)?;
        Ok(())
    }

    /// Handles UMNT (procedure 3): removes one recorded mount.
    pub fn umnt(
        &self,
        xid: u32,
        input: &mut impl Read,
        output: &mut impl Write,
        client_addr: &str,
    ) -> Result<(), anyhow::Error> {
        let path = deserialize::<mount::dirpath>(input)?;
        let mut mounts = self.mounts.lock().expect("mount list poisoned");
        mounts.retain(|m| !(m.hostname == client_addr.as_bytes() && m.directory == path));
        xdr::rpc::make_success_reply(xid).serialize(output)?;
        Ok(())
    }

    /// Handles UMNTALL (procedure 4): removes every mount of the caller.
    pub fn umntall(
        &self,
        xid: u32,
        output: &mut impl Write,
        client_addr: &str,
    ) -> Result<(), anyhow::Error> {
        let mut mounts = self.mounts.lock().expect("mount list poisoned");
        mounts.retain(|m| m.hostname != client_addr.as_bytes());
        xdr::rpc::make_success_reply(xid).serialize(output)?;
        Ok(())
    }

    /// Handles EXPORT (procedure 5): the export list with its groups.
    pub fn export(&self, xid: u32, output: &mut impl Write) -> Result<(), anyhow::Error> {
        xdr::rpc::make_success_reply(xid).serialize(output)?;
        let nodes: Vec<mount::exportnode> = self
            .exports
            .list()
            .into_iter()
            .map(|(ex_dir, ex_groups)| mount::exportnode { ex_dir, ex_groups })
            .collect();
        mount::serialize_list(&nodes, output)?;
        Ok(())
    }
}
