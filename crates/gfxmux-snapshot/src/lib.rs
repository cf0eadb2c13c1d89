//! Sectioned snapshot container for the gfxmux host session.
//!
//! The container holds the state the virtualization layer must persist for an
//! exact restore: the process-id generation counter and live-id set, the
//! boxed-handle tables, and the channel/consumer rosters. Framing is
//! self-describing: a fixed header followed by `(id, version, flags, len)`
//! sections. Unknown sections are skipped and trailing bytes inside known
//! sections are consumed, so newer writers stay readable by older loaders.
//!
//! Snapshots may come from untrusted places (copied files, remote storage);
//! the decoding helpers are bounded and must never panic on corrupt input.
#![forbid(unsafe_code)]

mod error;
mod format;
mod io;

pub use crate::error::{Result, SnapshotError};
pub use crate::format::{
    SectionId, SNAPSHOT_ENDIANNESS_LITTLE, SNAPSHOT_MAGIC, SNAPSHOT_VERSION_V1,
};
pub use crate::io::{ReadLeExt, WriteLeExt};

use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub id: SectionId,
    pub version: u16,
    pub len: u64,
}

pub fn write_file_header<W: Write>(w: &mut W) -> Result<()> {
    w.write_bytes(SNAPSHOT_MAGIC)?;
    w.write_u16_le(SNAPSHOT_VERSION_V1)?;
    w.write_u8(SNAPSHOT_ENDIANNESS_LITTLE)?;
    w.write_u8(0)?; // reserved
    w.write_u32_le(0)?; // flags/reserved
    Ok(())
}

pub fn read_file_header<R: Read>(r: &mut R) -> Result<()> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }
    let version = r.read_u16_le()?;
    if version != SNAPSHOT_VERSION_V1 {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    let endianness = r.read_u8()?;
    if endianness != SNAPSHOT_ENDIANNESS_LITTLE {
        return Err(SnapshotError::InvalidEndianness(endianness));
    }
    let _reserved = r.read_u8()?;
    let _flags = r.read_u32_le()?;
    Ok(())
}

/// Write one section, backfilling the payload length once `f` has run.
pub fn write_section<W: Write + Seek>(
    w: &mut W,
    id: SectionId,
    version: u16,
    flags: u16,
    f: impl FnOnce(&mut W) -> Result<()>,
) -> Result<()> {
    let header_pos = w.stream_position()?;
    w.write_u32_le(id.0)?;
    w.write_u16_le(version)?;
    w.write_u16_le(flags)?;
    w.write_u64_le(0)?; // placeholder len

    let payload_start = w.stream_position()?;
    f(w)?;
    let payload_end = w.stream_position()?;

    let len = payload_end
        .checked_sub(payload_start)
        .ok_or(SnapshotError::Corrupt("stream position underflow"))?;

    w.seek(SeekFrom::Start(header_pos + 8))?;
    w.write_u64_le(len)?;
    w.seek(SeekFrom::Start(payload_end))?;
    Ok(())
}

/// Read the next section header, or `None` at a clean end of stream.
pub fn read_section_header<R: Read>(r: &mut R) -> Result<Option<SectionHeader>> {
    let mut first = [0u8; 1];
    match r.read(&mut first)? {
        0 => return Ok(None),
        1 => {}
        _ => unreachable!("read() with 1-byte buffer"),
    }
    let mut tag_bytes = [0u8; 4];
    tag_bytes[0] = first[0];
    r.read_exact(&mut tag_bytes[1..])?;
    let id = SectionId(u32::from_le_bytes(tag_bytes));
    let version = r.read_u16_le()?;
    let _flags = r.read_u16_le()?;
    let len = r.read_u64_le()?;
    Ok(Some(SectionHeader { id, version, len }))
}

/// Consume whatever `f` left unread in a `len`-bounded section payload.
///
/// Returns `Corrupt` if the payload ends before `len` bytes were available.
pub fn finish_section<R: Read>(section_reader: &mut std::io::Take<R>) -> Result<()> {
    std::io::copy(section_reader, &mut std::io::sink())?;
    if section_reader.limit() != 0 {
        return Err(SnapshotError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated section payload",
        )));
    }
    Ok(())
}
