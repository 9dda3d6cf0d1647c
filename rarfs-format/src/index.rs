//! `.r2i` sidecar indexes.
//!
//! A sidecar stores the member table of an archive together with raw-read
//! geometry so a mount can skip the full header walk. The file sits next to
//! the archive (`movie.rar` -> `movie.r2i`) and is only trusted while it is
//! at least as new as the archive itself.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

use crate::geometry::RawGeometry;

const R2I_MAGIC: [u8; 4] = *b"R2I\x01";

const FLAG_RAW: u8 = 0x01;
const FLAG_DIRECTORY: u8 = 0x02;
const FLAG_ENCRYPTED: u8 = 0x04;
const FLAG_MULTIPART: u8 = 0x08;
const FLAG_LINK: u8 = 0x10;
const FLAG_MODE: u8 = 0x20;

/// One member record of a sidecar index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub unix_mode: Option<u32>,
    pub method: u8,
    pub raw: bool,
    pub directory: bool,
    pub encrypted: bool,
    pub multipart: bool,
    pub link_target: Option<String>,
    pub geometry: RawGeometry,
}

/// Sidecar path belonging to an archive path.
pub fn sidecar_path(archive: &Path) -> PathBuf {
    archive.with_extension("r2i")
}

/// Whether the sidecar at `index` is at least as new as `archive`.
pub fn is_fresh(index: &Path, archive: &Path) -> bool {
    let index_mtime = match std::fs::metadata(index).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let archive_mtime = match std::fs::metadata(archive).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(_) => return false,
    };
    index_mtime >= archive_mtime
}

/// Read a sidecar index. `use_mmap` is turned off by `--no-idx-mmap`.
pub fn read_index(path: &Path, use_mmap: bool) -> Result<Vec<IndexEntry>, Error> {
    let mut file = File::open(path)?;
    if use_mmap {
        let map = unsafe { Mmap::map(&file)? };
        parse_index(&map)
    } else {
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        parse_index(&data)
    }
}

fn parse_index(data: &[u8]) -> Result<Vec<IndexEntry>, Error> {
    let mut cursor = Cursor::new(data);
    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if magic != R2I_MAGIC {
        bail!("not an index file (bad magic)");
    }
    let count = cursor.read_u32::<LittleEndian>()?;
    let mut entries = Vec::with_capacity(count.min(4096) as usize);
    for _ in 0..count {
        entries.push(parse_entry(&mut cursor)?);
    }
    Ok(entries)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let len = usize::from(cursor.read_u16::<LittleEndian>()?);
    let mut raw = vec![0u8; len];
    cursor.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| anyhow::format_err!("index string is not UTF-8"))
}

fn parse_entry(cursor: &mut Cursor<&[u8]>) -> Result<IndexEntry, Error> {
    let name = read_string(cursor)?;
    let size = cursor.read_u64::<LittleEndian>()?;
    let mtime = cursor.read_i64::<LittleEndian>()?;
    let mode = cursor.read_u32::<LittleEndian>()?;
    let method = cursor.read_u8()?;
    let flags = cursor.read_u8()?;
    let link_target = if flags & FLAG_LINK != 0 {
        Some(read_string(cursor)?)
    } else {
        None
    };
    let geometry = RawGeometry {
        offset: cursor.read_u64::<LittleEndian>()?,
        offset_next: cursor.read_u64::<LittleEndian>()?,
        vsize_first: cursor.read_u64::<LittleEndian>()?,
        vsize_next: cursor.read_u64::<LittleEndian>()?,
        vsize_real_first: cursor.read_u64::<LittleEndian>()?,
        vsize_real_next: cursor.read_u64::<LittleEndian>()?,
        vno_base: cursor.read_u16::<LittleEndian>()?,
        vno_first: cursor.read_u16::<LittleEndian>()?,
        vlen: cursor.read_u8()?,
        vpos: cursor.read_u8()?,
        vtype: cursor.read_u8()?,
    };
    Ok(IndexEntry {
        name,
        size,
        mtime,
        unix_mode: (flags & FLAG_MODE != 0).then_some(mode),
        method,
        raw: flags & FLAG_RAW != 0,
        directory: flags & FLAG_DIRECTORY != 0,
        encrypted: flags & FLAG_ENCRYPTED != 0,
        multipart: flags & FLAG_MULTIPART != 0,
        link_target,
        geometry,
    })
}

/// Write a sidecar index.
pub fn write_index(path: &Path, entries: &[IndexEntry]) -> Result<(), Error> {
    let mut out = Vec::new();
    out.extend_from_slice(&R2I_MAGIC);
    out.write_u32::<LittleEndian>(u32::try_from(entries.len())?)?;
    for entry in entries {
        write_entry(&mut out, entry)?;
    }
    let mut file = File::create(path)?;
    file.write_all(&out)?;
    Ok(())
}

fn write_string(out: &mut Vec<u8>, text: &str) -> Result<(), Error> {
    out.write_u16::<LittleEndian>(u16::try_from(text.len())?)?;
    out.extend_from_slice(text.as_bytes());
    Ok(())
}

fn write_entry(out: &mut Vec<u8>, entry: &IndexEntry) -> Result<(), Error> {
    write_string(out, &entry.name)?;
    out.write_u64::<LittleEndian>(entry.size)?;
    out.write_i64::<LittleEndian>(entry.mtime)?;
    out.write_u32::<LittleEndian>(entry.unix_mode.unwrap_or(0))?;
    out.write_u8(entry.method)?;
    let mut flags = 0u8;
    if entry.raw {
        flags |= FLAG_RAW;
    }
    if entry.directory {
        flags |= FLAG_DIRECTORY;
    }
    if entry.encrypted {
        flags |= FLAG_ENCRYPTED;
    }
    if entry.multipart {
        flags |= FLAG_MULTIPART;
    }
    if entry.link_target.is_some() {
        flags |= FLAG_LINK;
    }
    if entry.unix_mode.is_some() {
        flags |= FLAG_MODE;
    }
    out.write_u8(flags)?;
    if let Some(target) = &entry.link_target {
        write_string(out, target)?;
    }
    let g = &entry.geometry;
    out.write_u64::<LittleEndian>(g.offset)?;
    out.write_u64::<LittleEndian>(g.offset_next)?;
    out.write_u64::<LittleEndian>(g.vsize_first)?;
    out.write_u64::<LittleEndian>(g.vsize_next)?;
    out.write_u64::<LittleEndian>(g.vsize_real_first)?;
    out.write_u64::<LittleEndian>(g.vsize_real_next)?;
    out.write_u16::<LittleEndian>(g.vno_base)?;
    out.write_u16::<LittleEndian>(g.vno_first)?;
    out.write_u8(g.vlen)?;
    out.write_u8(g.vpos)?;
    out.write_u8(g.vtype)?;
    Ok(())
}
