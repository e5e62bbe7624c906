//! This module implements the `MOUNT` protocol (RFC 1813 Appendix I) data structures
//! for XDR serialization and deserialization.
//!
//! The `MOUNT` protocol is used to establish the initial connection between an NFS
//! client and server. Besides handing out the root file handle, the MNT reply is
//! where the server advertises which authentication flavors it will accept for
//! the NFS program, including the RPCSEC_GSS Kerberos pseudo-flavors.

// Allow unused code since we implement the complete RFC specification
#![allow(dead_code)]
// Keep original RFC naming conventions for consistency with the specification
#![allow(non_camel_case_types)]

use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;

use super::*;

/// MOUNT program number for RPC
pub const PROGRAM: u32 = 100005;
/// MOUNT protocol version 3
pub const VERSION: u32 = 3;

/// Maximum bytes in a path name
pub const MNTPATHLEN: u32 = 1024;
/// Maximum bytes in a name
pub const MNTNAMLEN: u32 = 255;
/// Maximum bytes in a V3 file handle
pub const FHSIZE3: u32 = 64;

/// File handle for NFS version 3
pub type fhandle3 = Vec<u8>;
/// Directory path on the server
pub type dirpath = Vec<u8>;
/// Name in the directory
pub type name = Vec<u8>;

/// Status codes returned by `MOUNT` protocol operations
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum mountstat3 {
    /// No error
    #[default]
    MNT3_OK = 0,
    /// Not owner
    MNT3ERR_PERM = 1,
    /// No such file or directory
    MNT3ERR_NOENT = 2,
    /// I/O error
    MNT3ERR_IO = 5,
    /// Permission denied
    MNT3ERR_ACCES = 13,
    /// Not a directory
    MNT3ERR_NOTDIR = 20,
    /// Invalid argument
    MNT3ERR_INVAL = 22,
    /// Filename too long
    MNT3ERR_NAMETOOLONG = 63,
    /// Operation not supported
    MNT3ERR_NOTSUPP = 10004,
    /// A failure on the server
    MNT3ERR_SERVERFAULT = 10006,
}
SerializeEnum!(mountstat3);
DeserializeEnum!(mountstat3);

/// Successful response to a mount request
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct mountres3_ok {
    /// File handle for the mounted directory
    pub fhandle: fhandle3,
    /// List of authentication flavors supported by the server
    pub auth_flavors: Vec<u32>,
}
DeserializeStruct!(mountres3_ok, fhandle, auth_flavors);
SerializeStruct!(mountres3_ok, fhandle, auth_flavors);

/// One entry in the DUMP reply: a client and the path it has mounted.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct mountbody {
    pub ml_hostname: name,
    pub ml_directory: dirpath,
}
DeserializeStruct!(mountbody, ml_hostname, ml_directory);
SerializeStruct!(mountbody, ml_hostname, ml_directory);

/// One entry in the EXPORT reply: an exported path and the groups allowed
/// to mount it.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct exportnode {
    pub ex_dir: dirpath,
    pub ex_groups: Vec<name>,
}

impl Serialize for exportnode {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.ex_dir.serialize(dest)?;
        // groups is an XDR linked list
        for group in &self.ex_groups {
            true.serialize(dest)?;
            group.serialize(dest)?;
        }
        false.serialize(dest)
    }
}
impl Deserialize for exportnode {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        self.ex_dir.deserialize(src)?;
        self.ex_groups.clear();
        while deserialize::<bool>(src)? {
            self.ex_groups.push(deserialize(src)?);
        }
        Ok(())
    }
}

/// Serializes a list as the XDR optional-data linked list the MOUNT protocol
/// uses for DUMP and EXPORT replies.
pub fn serialize_list<T: Serialize>(items: &[T], dest: &mut impl Write) -> std::io::Result<()> {
    for item in items {
        true.serialize(dest)?;
        item.serialize(dest)?;
    }
    false.serialize(dest)
}

/// Reads back an XDR linked list.
pub fn deserialize_list<T: Default + Deserialize>(
    src: &mut impl Read,
) -> std::io::Result<Vec<T>> {
    let mut items = Vec::new();
    while deserialize::<bool>(src)? {
        items.push(deserialize(src)?);
    }
    Ok(items)
}

/// Procedure numbers for the `MOUNT` version 3 protocol
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MountProgram {
    /// Null procedure for service availability testing
    #[default]
    MOUNTPROC3_NULL = 0,
    /// Mount a file system
    MOUNTPROC3_MNT = 1,
    /// Get list of mounted file systems
    MOUNTPROC3_DUMP = 2,
    /// Unmount a file system
    MOUNTPROC3_UMNT = 3,
    /// Unmount all file systems
    MOUNTPROC3_UMNTALL = 4,
    /// Get list of exported file systems
    MOUNTPROC3_EXPORT = 5,
    /// Invalid procedure number
    INVALID,
}
