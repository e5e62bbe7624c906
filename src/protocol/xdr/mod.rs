//! The XDR (External Data Representation) module defines the traits and macros
//! for serializing/deserializing protocol data according to RFC 4506.
//!
//! XDR provides a machine-independent data representation format,
//! which is critical for network protocols like NFS.
//!
//! All data structures that cross the wire implement the [`Serialize`] and
//! [`Deserialize`] traits, usually through the `SerializeStruct!` /
//! `DeserializeStruct!` / `SerializeEnum!` / `DeserializeEnum!` macro family.

use std::io::{Read, Write};

use byteorder::BigEndian;
use byteorder::{ReadBytesExt, WriteBytesExt};

pub mod gss;
pub mod mount;
pub mod nfs4;
pub mod rpc;

/// Type alias for the standard endianness used in XDR serialization (Big Endian).
pub type XDREndian = BigEndian;

/// XDR quantities are aligned to four bytes; opaques are zero-padded up to it.
pub const ALIGNMENT: usize = 4;

/// Serializes the implementing type to the provided writer in XDR form.
pub trait Serialize {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

/// Deserializes XDR data from the provided reader into the implementing type.
pub trait Deserialize {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()>;
}

/// Reads a value of type `T` from the reader.
///
/// Convenience wrapper over [`Deserialize::deserialize`] for types with a
/// `Default` starting state.
pub fn deserialize<T: Default + Deserialize>(src: &mut impl Read) -> std::io::Result<T> {
    let mut value = T::default();
    value.deserialize(src)?;
    Ok(value)
}

/// Serializes a value into a fresh byte buffer.
///
/// Used wherever an encoded form must be retained (owner replay caches,
/// CREATE_SESSION response caching, backchannel framing).
pub fn encode<T: Serialize>(value: &T) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    value.serialize(&mut buf)?;
    Ok(buf)
}

/// Constructs an `InvalidData` IO error with the given message.
pub fn invalid_data(m: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, m.into())
}

fn write_padding(len: usize, dest: &mut impl Write) -> std::io::Result<()> {
    let pad = (ALIGNMENT - len % ALIGNMENT) % ALIGNMENT;
    let zeros = [0_u8; ALIGNMENT];
    if pad > 0 {
        dest.write_all(&zeros[..pad])?;
    }
    Ok(())
}

fn read_padding(len: usize, src: &mut impl Read) -> std::io::Result<()> {
    let pad = (ALIGNMENT - len % ALIGNMENT) % ALIGNMENT;
    let mut zeros = [0_u8; ALIGNMENT];
    src.read_exact(&mut zeros[..pad])
}

/// XDR booleans are 4-byte big endian integers, 0 for false.
impl Serialize for bool {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u32::<XDREndian>(*self as u32)
    }
}
impl Deserialize for bool {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u32::<XDREndian>()? > 0;
        Ok(())
    }
}

impl Serialize for i32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_i32::<XDREndian>(*self)
    }
}
impl Deserialize for i32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_i32::<XDREndian>()?;
        Ok(())
    }
}

impl Serialize for i64 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_i64::<XDREndian>(*self)
    }
}
impl Deserialize for i64 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_i64::<XDREndian>()?;
        Ok(())
    }
}

impl Serialize for u32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u32::<XDREndian>(*self)
    }
}
impl Deserialize for u32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u32::<XDREndian>()?;
        Ok(())
    }
}

impl Serialize for u64 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u64::<XDREndian>(*self)
    }
}
impl Deserialize for u64 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u64::<XDREndian>()?;
        Ok(())
    }
}

/// Fixed-size arrays are serialized as raw bytes without a length prefix.
impl<const N: usize> Serialize for [u8; N] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_all(self)
    }
}
impl<const N: usize> Deserialize for [u8; N] {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        src.read_exact(self)
    }
}

/// Variable-length opaques carry a 4-byte length prefix and trailing padding.
impl Serialize for Vec<u8> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        assert!(self.len() < u32::MAX as usize);
        (self.len() as u32).serialize(dest)?;
        dest.write_all(self)?;
        write_padding(self.len(), dest)
    }
}
impl Deserialize for Vec<u8> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<u32>(src)? as usize;
        self.clear();
        self.resize(length, 0);
        src.read_exact(self)?;
        read_padding(length, src)
    }
}

impl Serialize for Vec<u32> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        assert!(self.len() < u32::MAX as usize);
        (self.len() as u32).serialize(dest)?;
        for i in self {
            i.serialize(dest)?;
        }
        Ok(())
    }
}
impl Deserialize for Vec<u32> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<u32>(src)? as usize;
        self.clear();
        self.resize(length, 0);
        for i in self.iter_mut() {
            i.deserialize(src)?;
        }
        Ok(())
    }
}

/// XDR strings are length-prefixed UTF-8 opaques.
impl Serialize for String {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        assert!(self.len() < u32::MAX as usize);
        (self.len() as u32).serialize(dest)?;
        dest.write_all(self.as_bytes())?;
        write_padding(self.len(), dest)
    }
}
impl Deserialize for String {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let bytes = deserialize::<Vec<u8>>(src)?;
        *self = String::from_utf8(bytes).map_err(|_| invalid_data("string is not UTF-8"))?;
        Ok(())
    }
}

/// XDR optional-data: a boolean discriminant followed by the value when present.
impl<T: Default + Serialize> Serialize for Option<T> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            None => false.serialize(dest),
            Some(v) => {
                true.serialize(dest)?;
                v.serialize(dest)
            }
        }
    }
}
impl<T: Default + Deserialize> Deserialize for Option<T> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        if deserialize::<bool>(src)? {
            *self = Some(deserialize::<T>(src)?);
        } else {
            *self = None;
        }
        Ok(())
    }
}

/// Implements [`Serialize`] for a struct by serializing each field in order.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! SerializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl $crate::protocol::xdr::Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                $(self.$element.serialize(dest)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Deserialize`] for a struct by deserializing each field in order.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! DeserializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl $crate::protocol::xdr::Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                $(self.$element.deserialize(src)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Serialize`] for an enum represented as a 32-bit discriminant.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! SerializeEnum {
    ($t:ident) => {
        impl $crate::protocol::xdr::Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                use byteorder::WriteBytesExt;
                dest.write_u32::<$crate::protocol::xdr::XDREndian>(*self as u32)
            }
        }
    };
}

/// Implements [`Deserialize`] for an enum represented as a 32-bit discriminant.
///
/// Unknown discriminants are an `InvalidData` error; the wire layer maps them
/// to GARBAGE_ARGS rather than panicking.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! DeserializeEnum {
    ($t:ident) => {
        impl $crate::protocol::xdr::Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                use byteorder::ReadBytesExt;
                let r = src.read_u32::<$crate::protocol::xdr::XDREndian>()?;
                if let Some(p) = FromPrimitive::from_u32(r) {
                    *self = p;
                } else {
                    return Err($crate::protocol::xdr::invalid_data(format!(
                        "Invalid value {} for {}",
                        r,
                        stringify!($t)
                    )));
                }
                Ok(())
            }
        }
    };
}

/// Implements [`Serialize`] for an XDR union whose discriminant is a boolean:
/// a void arm and a single value-carrying arm.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! SerializeBoolUnion {
    (
        $t:ident, $enumcase:ident, $enumtype:ty
    ) => {
        impl $crate::protocol::xdr::Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                match self {
                    $t::Void => false.serialize(dest),
                    $t::$enumcase(v) => {
                        true.serialize(dest)?;
                        v.serialize(dest)
                    }
                }
            }
        }
    };
}

#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! DeserializeBoolUnion {
    (
        $t:ident, $enumcase:ident, $enumtype:ty
    ) => {
        impl $crate::protocol::xdr::Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                if $crate::protocol::xdr::deserialize::<bool>(src)? {
                    let mut r = <$enumtype>::default();
                    r.deserialize(src)?;
                    *self = $t::$enumcase(r);
                } else {
                    *self = $t::Void;
                }
                Ok(())
            }
        }
    };
}

// Re-export the macro family for `use crate::xdr::{...}` call sites.
pub use crate::DeserializeBoolUnion;
pub use crate::DeserializeEnum;
pub use crate::DeserializeStruct;
pub use crate::SerializeBoolUnion;
pub use crate::SerializeEnum;
pub use crate::SerializeStruct;
