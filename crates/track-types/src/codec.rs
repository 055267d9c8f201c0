//! Versioned binary encoding for [`TrackDescriptor`].
//!
//! Layout:
//! - magic: 2 bytes "TD"
//! - version: u8
//! - title, author, identifier, uri: `u32 LE len` + UTF-8 bytes each
//! - duration_ms: u64 LE
//! - is_stream: u8 (0/1)
//! - version >= 2: artwork_url, isrc as `u8 present` + optional string
//!
//! Older versions stay decodable; versions newer than [`VERSION`] are rejected.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::TrackDescriptor;

pub const MAGIC: [u8; 2] = *b"TD";
pub const VERSION: u8 = 2;

const MAX_STRING_LEN: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum DescriptorCodecError {
    #[error("bad descriptor magic")]
    BadMagic,
    #[error("unsupported descriptor version {0}")]
    UnsupportedVersion(u8),
    #[error("string field of {0} bytes exceeds limit")]
    FieldTooLarge(u32),
    #[error("descriptor field is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encode a descriptor with the current version.
pub fn encode(descriptor: &TrackDescriptor) -> Result<Vec<u8>, DescriptorCodecError> {
    let mut out = Vec::with_capacity(64 + descriptor.uri.len() + descriptor.title.len());
    write_descriptor(&mut out, descriptor)?;
    Ok(out)
}

/// Decode a descriptor written by any supported version.
pub fn decode(mut bytes: &[u8]) -> Result<TrackDescriptor, DescriptorCodecError> {
    read_descriptor(&mut bytes)
}

/// Write a descriptor to `w`. Fields longer than the decoder accepts are
/// rejected before anything of them is written.
pub fn write_descriptor(
    mut w: impl Write,
    d: &TrackDescriptor,
) -> Result<(), DescriptorCodecError> {
    w.write_all(&MAGIC)?;
    w.write_all(&[VERSION])?;
    write_string(&mut w, &d.title)?;
    write_string(&mut w, &d.author)?;
    write_string(&mut w, &d.identifier)?;
    write_string(&mut w, &d.uri)?;
    w.write_all(&d.duration_ms.to_le_bytes())?;
    w.write_all(&[d.is_stream as u8])?;
    write_optional(&mut w, d.artwork_url.as_deref())?;
    write_optional(&mut w, d.isrc.as_deref())?;
    Ok(())
}

/// Read a descriptor from `r`.
pub fn read_descriptor(mut r: impl Read) -> Result<TrackDescriptor, DescriptorCodecError> {
    let mut magic = [0u8; 2];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(DescriptorCodecError::BadMagic);
    }
    let version = read_u8(&mut r)?;
    if version == 0 || version > VERSION {
        return Err(DescriptorCodecError::UnsupportedVersion(version));
    }

    let title = read_string(&mut r)?;
    let author = read_string(&mut r)?;
    let identifier = read_string(&mut r)?;
    let uri = read_string(&mut r)?;
    let mut duration = [0u8; 8];
    r.read_exact(&mut duration)?;
    let is_stream = read_u8(&mut r)? != 0;

    let (artwork_url, isrc) = if version >= 2 {
        (read_optional(&mut r)?, read_optional(&mut r)?)
    } else {
        (None, None)
    };

    Ok(TrackDescriptor {
        title,
        author,
        duration_ms: u64::from_le_bytes(duration),
        identifier,
        is_stream,
        uri,
        artwork_url,
        isrc,
    })
}

fn write_string(w: &mut impl Write, s: &str) -> Result<(), DescriptorCodecError> {
    let len = u32::try_from(s.len()).unwrap_or(u32::MAX);
    if len > MAX_STRING_LEN {
        return Err(DescriptorCodecError::FieldTooLarge(len));
    }
    w.write_all(&len.to_le_bytes())?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn write_optional(w: &mut impl Write, s: Option<&str>) -> Result<(), DescriptorCodecError> {
    match s {
        Some(s) => {
            w.write_all(&[1])?;
            write_string(w, s)
        }
        None => Ok(w.write_all(&[0])?),
    }
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_string(r: &mut impl Read) -> Result<String, DescriptorCodecError> {
    let mut lenb = [0u8; 4];
    r.read_exact(&mut lenb)?;
    let len = u32::from_le_bytes(lenb);
    if len > MAX_STRING_LEN {
        return Err(DescriptorCodecError::FieldTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| DescriptorCodecError::InvalidUtf8)
}

fn read_optional(r: &mut impl Read) -> Result<Option<String>, DescriptorCodecError> {
    match read_u8(r)? {
        0 => Ok(None),
        _ => read_string(r).map(Some),
    }
}
