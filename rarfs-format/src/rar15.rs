//! Block headers of the classic (v1.5 through 4.x) format.

use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Error};
use byteorder::{LittleEndian, ReadBytesExt};

use crate::block::{dos_time_to_unix, MemberBlock, VolumeInfo};

const BLOCK_MAIN: u8 = 0x73;
const BLOCK_FILE: u8 = 0x74;
const BLOCK_ENDARC: u8 = 0x7b;

const FLAG_LONG_BLOCK: u16 = 0x8000;

const MHD_VOLUME: u16 = 0x0001;
const MHD_PASSWORD: u16 = 0x0080;
const MHD_FIRSTVOLUME: u16 = 0x0100;

const LHD_SPLIT_BEFORE: u16 = 0x0001;
const LHD_SPLIT_AFTER: u16 = 0x0002;
const LHD_PASSWORD: u16 = 0x0004;
const LHD_WINDOW_MASK: u16 = 0x00e0;
const LHD_LARGE: u16 = 0x0100;
const LHD_UNICODE: u16 = 0x0200;

const HOST_UNIX: u8 = 3;

const BASE_HEADER_LEN: u64 = 7;
const FILE_HEADER_MIN: u64 = 32;

struct BaseHeader {
    block_type: u8,
    flags: u16,
    size: u64,
    start: u64,
}

pub(crate) struct Walker<R> {
    reader: R,
    next_block: u64,
    done: bool,
}

impl<R: Read + Seek> Walker<R> {
    /// `reader` is positioned just past the signature.
    pub(crate) fn open(mut reader: R) -> Result<(Self, VolumeInfo), Error> {
        let start = reader.stream_position()?;
        let base = match read_base(&mut reader)? {
            Some(base) => base,
            None => bail!("truncated archive: missing main header"),
        };
        if base.block_type != BLOCK_MAIN {
            bail!("unexpected leading block type {:#x}", base.block_type);
        }
        if base.size < BASE_HEADER_LEN {
            bail!("main header size out of range");
        }
        let info = VolumeInfo {
            volume: base.flags & MHD_VOLUME != 0,
            first_volume: base.flags & MHD_FIRSTVOLUME != 0,
            headers_encrypted: base.flags & MHD_PASSWORD != 0,
            volume_number: None,
        };
        let next_block = start + base.size;
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
            let base = match read_base(&mut self.reader)? {
                Some(base) => base,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            match base.block_type {
                BLOCK_FILE => {
                    let (member, skip) = self.parse_file(&base)?;
                    self.next_block = base.start + base.size + skip;
                    return Ok(Some(member));
                }
                BLOCK_ENDARC => {
                    self.done = true;
                    return Ok(None);
                }
                _ => {
                    // Comment, sub and service blocks: step over header and
                    // any attached data area.
                    let add_size = if base.flags & FLAG_LONG_BLOCK != 0 {
                        u64::from(self.reader.read_u32::<LittleEndian>()?)
                    } else {
                        0
                    };
                    if base.size < BASE_HEADER_LEN {
                        bail!("block header size out of range");
                    }
                    self.next_block = base.start + base.size + add_size;
                }
            }
        }
        Ok(None)
    }

    fn parse_file(&mut self, base: &BaseHeader) -> Result<(MemberBlock, u64), Error> {
        if base.size < FILE_HEADER_MIN {
            bail!("file header too short ({} bytes)", base.size);
        }
        let reader = &mut self.reader;
        let pack_size = u64::from(reader.read_u32::<LittleEndian>()?);
        let unp_size = u64::from(reader.read_u32::<LittleEndian>()?);
        let host_os = reader.read_u8()?;
        let file_crc = reader.read_u32::<LittleEndian>()?;
        let ftime = reader.read_u32::<LittleEndian>()?;
        let _unp_ver = reader.read_u8()?;
        let method = reader.read_u8()?;
        let name_size = usize::from(reader.read_u16::<LittleEndian>()?);
        let attr = reader.read_u32::<LittleEndian>()?;

        let (pack_size, unp_size) = if base.flags & LHD_LARGE != 0 {
            let pack_high = u64::from(reader.read_u32::<LittleEndian>()?);
            let unp_high = u64::from(reader.read_u32::<LittleEndian>()?);
            (pack_size | pack_high << 32, unp_size | unp_high << 32)
        } else {
            (pack_size, unp_size)
        };

        let header_used = reader.stream_position()? - base.start;
        if header_used + name_size as u64 > base.size {
            bail!("file name overruns its header");
        }
        let mut name_raw = vec![0u8; name_size];
        reader.read_exact(&mut name_raw)?;
        if base.flags & LHD_UNICODE != 0 {
            // The field holds "ascii\0<packed unicode>"; keep the plain part.
            if let Some(nul) = name_raw.iter().position(|&b| b == 0) {
                name_raw.truncate(nul);
            }
        }

        let directory = base.flags & LHD_WINDOW_MASK == LHD_WINDOW_MASK;
        let unix_mode = if host_os == HOST_UNIX {
            Some(attr)
        } else {
            None
        };

        let member = MemberBlock {
            name_raw,
            unpacked_size: unp_size,
            packed_size: pack_size,
            data_offset: base.start + base.size,
            method: method.saturating_sub(0x30),
            mtime: dos_time_to_unix(ftime),
            crc32: file_crc,
            unix_mode,
            link_target: None,
            directory,
            encrypted: base.flags & LHD_PASSWORD != 0,
            split_before: base.flags & LHD_SPLIT_BEFORE != 0,
            split_after: base.flags & LHD_SPLIT_AFTER != 0,
        };
        Ok((member, pack_size))
    }
}

fn read_base<R: Read + Seek>(reader: &mut R) -> Result<Option<BaseHeader>, Error> {
    let start = reader.stream_position()?;
    let mut buf = [0u8; 7];
    let mut got = 0;
    while got < buf.len() {
        let n = reader.read(&mut buf[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    if got < buf.len() {
        // A clean end of volume; anything shorter than a base header cannot
        // be another block.
        return Ok(None);
    }
    let flags = u16::from_le_bytes([buf[3], buf[4]]);
    let size = u64::from(u16::from_le_bytes([buf[5], buf[6]]));
    Ok(Some(BaseHeader {
        block_type: buf[2],
        flags,
        size,
        start,
    }))
}
