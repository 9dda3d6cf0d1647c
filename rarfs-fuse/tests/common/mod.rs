//! Shared fixtures: a small classic-format archive writer and a decoder
//! that "decompresses" by walking the same headers, so the whole pipeline
//! runs end to end on synthetic archives.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Error;

use rarfs_config::{ConfigDb, Options};
use rarfs_format::block::RAR15_SIGNATURE;
use rarfs_fuse::decoder::{ArchiveSource, DataSink, Decoder, DecoderHandle, MemberHeader};
use rarfs_fuse::Shared;

pub struct Member<'a> {
    pub name: &'a [u8],
    pub data: &'a [u8],
    pub unpacked_size: u64,
    pub method: u8,
    pub directory: bool,
    pub split_before: bool,
    pub split_after: bool,
    pub unix_mode: Option<u32>,
}

impl<'a> Member<'a> {
    pub fn stored(name: &'a [u8], data: &'a [u8]) -> Self {
        Member {
            name,
            data,
            unpacked_size: data.len() as u64,
            method: 0x30,
            directory: false,
            split_before: false,
            split_after: false,
            unix_mode: Some(0o100644),
        }
    }

    /// Payload kept verbatim but marked compressed, forcing the piped path.
    pub fn compressed(name: &'a [u8], data: &'a [u8]) -> Self {
        Member {
            method: 0x33,
            ..Member::stored(name, data)
        }
    }
}

pub fn rar4_volume(members: &[Member], is_volume: bool, first: bool, headers_encrypted: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&RAR15_SIGNATURE);

    let mut flags = 0u16;
    if is_volume {
        flags |= 0x0001;
    }
    if first {
        flags |= 0x0100;
    }
    if headers_encrypted {
        flags |= 0x0080;
    }
    out.extend_from_slice(&[0, 0, 0x73]);
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&13u16.to_le_bytes());
    out.extend_from_slice(&[0u8; 6]);

    for member in members {
        let mut flags = 0x8000u16;
        if member.directory {
            flags |= 0x00e0;
        }
        if member.split_before {
            flags |= 0x0001;
        }
        if member.split_after {
            flags |= 0x0002;
        }
        let head_size = 32 + member.name.len() as u16;
        out.extend_from_slice(&[0, 0, 0x74]);
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&head_size.to_le_bytes());
        out.extend_from_slice(&(member.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(member.unpacked_size as u32).to_le_bytes());
        out.push(if member.unix_mode.is_some() { 3 } else { 2 });
        out.extend_from_slice(&0u32.to_le_bytes());
        let dos = (30u32 << 25) | (1 << 21) | (1 << 16);
        out.extend_from_slice(&dos.to_le_bytes());
        out.push(29);
        out.push(member.method);
        out.extend_from_slice(&(member.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&member.unix_mode.unwrap_or(0x20).to_le_bytes());
        out.extend_from_slice(member.name);
        out.extend_from_slice(member.data);
    }

    out.extend_from_slice(&[0, 0, 0x7b]);
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&7u16.to_le_bytes());
    out
}

/// A single-volume archive with stored members.
pub fn simple_archive(members: &[Member]) -> Vec<u8> {
    rar4_volume(members, false, false, false)
}

/// Split one stored member across part-style volumes of `piece` bytes of
/// payload each; returns the written volume paths.
pub fn write_split_set(
    dir: &Path,
    stem: &str,
    name: &[u8],
    content: &[u8],
    piece: usize,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let chunks: Vec<&[u8]> = content.chunks(piece).collect();
    for (index, chunk) in chunks.iter().enumerate() {
        let member = Member {
            name,
            data: chunk,
            unpacked_size: content.len() as u64,
            method: 0x30,
            directory: false,
            split_before: index > 0,
            split_after: index + 1 < chunks.len(),
            unix_mode: Some(0o100644),
        };
        let volume = rar4_volume(&[member], true, index == 0, false);
        let path = dir.join(format!("{}.part{}.rar", stem, index + 1));
        std::fs::write(&path, volume).unwrap();
        paths.push(path);
    }
    paths
}

/// Decoder stand-in that walks the synthetic headers and serves payload
/// bytes verbatim, whatever the method byte claims.
pub struct WalkerDecoder;

struct Listed {
    name_raw: Vec<u8>,
    data: Vec<u8>,
    directory: bool,
}

struct WalkerHandle {
    members: Vec<Listed>,
    cursor: usize,
    started: bool,
}

impl Decoder for WalkerDecoder {
    fn open(
        &self,
        source: &ArchiveSource,
        _password: Option<&str>,
    ) -> Result<Box<dyn DecoderHandle>, Error> {
        let mut bytes = match source {
            ArchiveSource::File(path) => std::fs::read(path)?,
            ArchiveSource::Memory { data, .. } => data.to_vec(),
        };
        // The real decoder can read password-protected headers; the mock
        // simply clears the encryption bit of the fixture's main header.
        if bytes.len() > 12 && bytes[..7] == RAR15_SIGNATURE {
            let flags = u16::from_le_bytes([bytes[10], bytes[11]]);
            bytes[10..12].copy_from_slice(&(flags & !0x0080).to_le_bytes());
        }
        let mut walker = rarfs_format::Walker::open(Cursor::new(bytes.clone()))?;
        let mut members = Vec::new();
        while let Some(block) = walker.next_member()? {
            let start = block.data_offset as usize;
            let end = start + block.packed_size as usize;
            members.push(Listed {
                name_raw: block.name_raw.clone(),
                data: bytes.get(start..end).unwrap_or_default().to_vec(),
                directory: block.directory,
            });
        }
        Ok(Box::new(WalkerHandle {
            members,
            cursor: 0,
            started: false,
        }))
    }
}

impl DecoderHandle for WalkerHandle {
    fn next_header(&mut self) -> Result<Option<MemberHeader>, Error> {
        if self.started {
            self.cursor += 1;
        }
        self.started = true;
        Ok(self.members.get(self.cursor).map(|member| MemberHeader {
            name_raw: member.name_raw.clone(),
            unpacked_size: member.data.len() as u64,
            directory: member.directory,
        }))
    }

    fn process_file(&mut self, sink: DataSink) -> Result<u64, Error> {
        let member = self
            .members
            .get(self.cursor)
            .ok_or_else(|| anyhow::format_err!("no current member"))?;
        for chunk in member.data.chunks(11) {
            sink(chunk)?;
        }
        Ok(member.data.len() as u64)
    }
}

/// Build the shared owner object over a temp source tree.
pub fn shared_for(source: &Path, mut opts: Options) -> Arc<Shared> {
    let source = source.canonicalize().unwrap();
    opts.source = source.clone();
    opts.mountpoint = PathBuf::from("/nonexistent-mountpoint");
    let config = ConfigDb::load(&source).unwrap();
    Arc::new(Shared::new(opts, source, config, Arc::new(WalkerDecoder)))
}

/// Sorted, client-visible names of a materialized directory.
pub fn listing(shared: &Shared, vdir: &str) -> Vec<String> {
    rarfs_fuse::prober::materialize_dir(shared, vdir, true).unwrap();
    let cache = shared.cache.read().unwrap();
    let mut names: Vec<String> = cache
        .dirs
        .get(vdir)
        .map(|d| d.list.iter_valid().map(|e| e.name.clone()).collect())
        .unwrap_or_default();
    names.sort();
    names
}
