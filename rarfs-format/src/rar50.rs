//! RAR5 block headers.

use std::io::{Cursor, Read, Seek, SeekFrom};

use anyhow::{bail, Error};
use byteorder::{LittleEndian, ReadBytesExt};

use crate::block::{MemberBlock, VolumeInfo};
use crate::vint::read_vint;

const TYPE_MAIN: u64 = 1;
const TYPE_FILE: u64 = 2;
const TYPE_CRYPT: u64 = 4;
const TYPE_END: u64 = 5;

const HFL_EXTRA: u64 = 0x01;
const HFL_DATA: u64 = 0x02;
const HFL_SPLIT_BEFORE: u64 = 0x08;
const HFL_SPLIT_AFTER: u64 = 0x10;

const MAIN_VOLUME: u64 = 0x01;
const MAIN_VOLNUMBER: u64 = 0x02;

const FILE_DIRECTORY: u64 = 0x01;
const FILE_MTIME: u64 = 0x02;
const FILE_CRC32: u64 = 0x04;

const EXTRA_CRYPT: u64 = 0x01;
const EXTRA_REDIR: u64 = 0x05;

const REDIR_UNIX_SYMLINK: u64 = 1;
const REDIR_WIN_SYMLINK: u64 = 2;

const HOST_UNIX: u64 = 1;

/// Header sizes are bounded in practice by name length; anything bigger than
/// this is a crafted archive.
const MAX_HEADER_SIZE: u64 = 1 << 21;

struct RawHeader {
    block_type: u64,
    flags: u64,
    extra_size: u64,
    data_size: u64,
    /// Type-specific fields followed by the extra area.
    body: Vec<u8>,
    /// Absolute offset of the byte right after the whole header.
    data_offset: u64,
}

pub(crate) struct Walker<R> {
    reader: R,
    next_block: u64,
    done: bool,
}

impl<R: Read + Seek> Walker<R> {
    /// `reader` is positioned just past the signature.
    pub(crate) fn open(mut reader: R) -> Result<(Self, VolumeInfo), Error> {
        let header = match read_header(&mut reader)? {
            Some(header) => header,
            None => bail!("truncated archive: missing main header"),
        };

        let mut info = VolumeInfo::default();
        match header.block_type {
            TYPE_MAIN => {
                let mut body = Cursor::new(&header.body);
                let archive_flags = read_vint(&mut body)?;
                info.volume = archive_flags & MAIN_VOLUME != 0;
                if archive_flags & MAIN_VOLNUMBER != 0 {
                    info.volume_number = Some(read_vint(&mut body)?);
                }
                // RAR5 only stamps a volume number from the second volume on.
                info.first_volume = info.volume_number.map_or(true, |n| n == 0);
            }
            TYPE_CRYPT => {
                info.headers_encrypted = true;
            }
            other => bail!("unexpected leading block type {}", other),
        }

        let next_block = header.data_offset + header.data_size;
        Ok((
            Self {
                reader,
                next_block,
                done: false,
            },
            info,
        ))
    }

    pub(crate) fn next_member(&mut self) -> Result<Option<MemberBlock>, Error> {
        while !self.done {
            self.reader.seek(SeekFrom::Start(self.next_block))?;
            let header = match read_header(&mut self.reader)? {
                Some(header) => header,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            self.next_block = header.data_offset + header.data_size;
            match header.block_type {
                TYPE_FILE => return Ok(Some(parse_file(&header)?)),
                TYPE_END => {
                    self.done = true;
                    return Ok(None);
                }
                // Service blocks (comments, quick-open data) and anything
                // unknown are stepped over; data_size already accounted.
                _ => {}
            }
        }
        Ok(None)
    }
}

fn read_header<R: Read + Seek>(reader: &mut R) -> Result<Option<RawHeader>, Error> {
    let mut crc_buf = [0u8; 4];
    let mut got = 0;
    while got < crc_buf.len() {
        let n = reader.read(&mut crc_buf[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    if got < crc_buf.len() {
        return Ok(None);
    }
    let stored_crc = u32::from_le_bytes(crc_buf);

    let header_size = read_vint(reader)?;
    if header_size == 0 || header_size > MAX_HEADER_SIZE {
        bail!("header size {} out of range", header_size);
    }
    let mut raw = vec![0u8; header_size as usize];
    reader.read_exact(&mut raw)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw);
    if hasher.finalize() != stored_crc {
        bail!("header checksum mismatch");
    }

    let mut cursor = Cursor::new(&raw);
    let block_type = read_vint(&mut cursor)?;
    let flags = read_vint(&mut cursor)?;
    let extra_size = if flags & HFL_EXTRA != 0 {
        read_vint(&mut cursor)?
    } else {
        0
    };
    let data_size = if flags & HFL_DATA != 0 {
        read_vint(&mut cursor)?
    } else {
        0
    };
    let body_start = cursor.position() as usize;
    if extra_size as usize > raw.len() - body_start {
        bail!("extra area overruns its header");
    }

    Ok(Some(RawHeader {
        block_type,
        flags,
        extra_size,
        data_size,
        body: raw[body_start..].to_vec(),
        data_offset: reader.stream_position()?,
    }))
}

fn parse_file(header: &RawHeader) -> Result<MemberBlock, Error> {
    let fields_len = header.body.len() - header.extra_size as usize;
    let mut body = Cursor::new(&header.body[..fields_len]);

    let file_flags = read_vint(&mut body)?;
    let unpacked_size = read_vint(&mut body)?;
    let attributes = read_vint(&mut body)?;
    let mtime = if file_flags & FILE_MTIME != 0 {
        i64::from(body.read_u32::<LittleEndian>()?)
    } else {
        0
    };
    let crc32 = if file_flags & FILE_CRC32 != 0 {
        body.read_u32::<LittleEndian>()?
    } else {
        0
    };
    let compression_info = read_vint(&mut body)?;
    let host_os = read_vint(&mut body)?;
    let name_len = read_vint(&mut body)? as usize;

    let name_start = body.position() as usize;
    if name_start + name_len > fields_len {
        bail!("file name overruns its header");
    }
    let name_raw = header.body[name_start..name_start + name_len].to_vec();

    let mut encrypted = false;
    let mut link_target = None;
    parse_extra(
        &header.body[fields_len..],
        &mut encrypted,
        &mut link_target,
    )?;

    let unix_mode = if host_os == HOST_UNIX {
        Some(attributes as u32)
    } else {
        None
    };

    Ok(MemberBlock {
        name_raw,
        unpacked_size,
        packed_size: header.data_size,
        data_offset: header.data_offset,
        method: ((compression_info >> 7) & 0x7) as u8,
        mtime,
        crc32,
        unix_mode,
        link_target,
        directory: file_flags & FILE_DIRECTORY != 0,
        encrypted,
        split_before: header.flags & HFL_SPLIT_BEFORE != 0,
        split_after: header.flags & HFL_SPLIT_AFTER != 0,
    })
}

fn parse_extra(
    mut extra: &[u8],
    encrypted: &mut bool,
    link_target: &mut Option<Vec<u8>>,
) -> Result<(), Error> {
    while !extra.is_empty() {
        let mut cursor = Cursor::new(extra);
        let record_size = read_vint(&mut cursor)? as usize;
        let record_start = cursor.position() as usize;
        if record_size == 0 || record_start + record_size > extra.len() {
            // Tolerate sloppy writers: an inconsistent trailing record is
            // ignored rather than failing the whole member.
            return Ok(());
        }
        let record = &extra[record_start..record_start + record_size];
        let mut cursor = Cursor::new(record);
        match read_vint(&mut cursor)? {
            EXTRA_CRYPT => *encrypted = true,
            EXTRA_REDIR => {
                let redir_type = read_vint(&mut cursor)?;
                let _redir_flags = read_vint(&mut cursor)?;
                let name_len = read_vint(&mut cursor)? as usize;
                let name_start = cursor.position() as usize;
                if name_start + name_len <= record.len()
                    && (redir_type == REDIR_UNIX_SYMLINK || redir_type == REDIR_WIN_SYMLINK)
                {
                    *link_target = Some(record[name_start..name_start + name_len].to_vec());
                }
            }
            _ => {}
        }
        extra = &extra[record_start + record_size..];
    }
    Ok(())
}
