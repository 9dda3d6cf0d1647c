//! The decoder boundary.
//!
//! The archive decoder is an opaque producer: it is asked to open an
//! archive, enumerate member headers and extract one member at a time
//! through a data-chunk sink. Everything behind [`Decoder`] is replaceable;
//! the production implementation drives the `unrar` library. Decoding
//! happens only where decompression is unavoidable (piped reads, nested
//! extraction, and header listing for archives whose headers are
//! encrypted); stored payloads never come through here.

use std::fmt;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use rarfs_format::path::sanitize_member_path;

/// Wall-clock budget for opening an archive through the decoder.
pub const DECODER_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Chunk granularity delivered to data sinks.
const SINK_CHUNK: usize = 128 * 1024;

/// Marker error raised when a producer is cancelled between chunks.
#[derive(Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "extraction cancelled")
    }
}

impl std::error::Error for Cancelled {}

pub fn is_cancelled(err: &Error) -> bool {
    err.is::<Cancelled>()
}

/// What the decoder is asked to open: a volume file on disk, or a nested
/// archive that only exists as bytes in memory.
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    File(PathBuf),
    Memory {
        data: Arc<Vec<u8>>,
        /// Diagnostic name (the nested archive's virtual path).
        name: PathBuf,
    },
}

impl ArchiveSource {
    pub fn display_name(&self) -> &Path {
        match self {
            ArchiveSource::File(path) => path,
            ArchiveSource::Memory { name, .. } => name,
        }
    }
}

/// One member header as reported by the decoder.
#[derive(Debug, Clone)]
pub struct MemberHeader {
    pub name_raw: Vec<u8>,
    pub unpacked_size: u64,
    pub directory: bool,
}

pub type DataSink<'a> = &'a mut dyn FnMut(&[u8]) -> Result<(), Error>;

/// An open archive inside the decoder. Closing happens on drop.
pub trait DecoderHandle: Send {
    /// Advance to the next member header, `None` at end of archive.
    fn next_header(&mut self) -> Result<Option<MemberHeader>, Error>;

    /// Extract the member whose header was returned last, feeding decoded
    /// chunks to `sink`. Returns the number of bytes produced.
    fn process_file(&mut self, sink: DataSink) -> Result<u64, Error>;
}

pub trait Decoder: Send + Sync {
    fn open(
        &self,
        source: &ArchiveSource,
        password: Option<&str>,
    ) -> Result<Box<dyn DecoderHandle>, Error>;
}

/// Open through the decoder with a wall-clock timeout. The opener runs on
/// its own thread so a wedged decoder cannot pin the caller; on timeout the
/// thread is abandoned and its eventual result dropped.
pub fn open_with_timeout(
    decoder: &Arc<dyn Decoder>,
    source: &ArchiveSource,
    password: Option<&str>,
    timeout: Duration,
) -> Result<Box<dyn DecoderHandle>, Error> {
    let (tx, rx) = mpsc::channel();
    let decoder = Arc::clone(decoder);
    let source = source.clone();
    let password = password.map(str::to_owned);
    std::thread::spawn(move || {
        let _ = tx.send(decoder.open(&source, password.as_deref()));
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            log::warn!(
                "decoder open timed out after {:?}: {}",
                timeout,
                source.display_name().display()
            );
            bail!(
                "timed out opening archive {}",
                source.display_name().display()
            );
        }
    }
}

/// Extract one member into memory, bounded by `cap` bytes.
pub fn extract_member(
    decoder: &Arc<dyn Decoder>,
    source: &ArchiveSource,
    password: Option<&str>,
    member: &str,
    cap: u64,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<u8>, Error> {
    let mut handle = open_with_timeout(decoder, source, password, DECODER_OPEN_TIMEOUT)?;
    while let Some(header) = handle.next_header()? {
        if let Some(cancel) = cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(Cancelled.into());
            }
        }
        let matches = sanitize_member_path(&header.name_raw)
            .map(|name| name == member)
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let mut buffer = Vec::new();
        handle.process_file(&mut |chunk| {
            if let Some(cancel) = cancel {
                if cancel.load(Ordering::Relaxed) {
                    return Err(Cancelled.into());
                }
            }
            if buffer.len() as u64 + chunk.len() as u64 > cap {
                bail!("extraction exceeds the {} byte buffer limit", cap);
            }
            buffer.extend_from_slice(chunk);
            Ok(())
        })?;
        return Ok(buffer);
    }
    bail!(
        "member '{}' not found in {}",
        member,
        source.display_name().display()
    );
}

/// Production decoder driving the unrar library.
pub struct UnrarDecoder;

enum State {
    BeforeHeader(unrar::OpenArchive<unrar::Process, unrar::CursorBeforeHeader>),
    BeforeFile(Box<unrar::OpenArchive<unrar::Process, unrar::CursorBeforeFile>>),
    Finished,
}

struct UnrarHandle {
    state: State,
}

// The unrar handle is driven from exactly one producer thread at a time.
unsafe impl Send for UnrarHandle {}

impl Decoder for UnrarDecoder {
    fn open(
        &self,
        source: &ArchiveSource,
        password: Option<&str>,
    ) -> Result<Box<dyn DecoderHandle>, Error> {
        let path = match source {
            ArchiveSource::File(path) => path.clone(),
            ArchiveSource::Memory { data, name } => spill_to_tempfile(data, name)?,
        };

        let archive = match password {
            Some(password) => unrar::Archive::with_password(&path, password),
            None => unrar::Archive::new(&path),
        };
        let opened = archive
            .open_for_processing()
            .map_err(|err| format_err!("cannot open {}: {:?}", path.display(), err));

        // The decoder holds its own descriptor from here on; a spilled
        // nested archive must not outlive the open call.
        if matches!(source, ArchiveSource::Memory { .. }) {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("cannot unlink {}: {}", path.display(), err);
            }
        }

        Ok(Box::new(UnrarHandle {
            state: State::BeforeHeader(opened?),
        }))
    }
}

impl DecoderHandle for UnrarHandle {
    fn next_header(&mut self) -> Result<Option<MemberHeader>, Error> {
        loop {
            match std::mem::replace(&mut self.state, State::Finished) {
                State::BeforeHeader(archive) => {
                    match archive.read_header().map_err(|err| format_err!("{:?}", err))? {
                        Some(before_file) => {
                            let entry = before_file.entry();
                            let header = MemberHeader {
                                name_raw: entry.filename.as_os_str().as_bytes().to_vec(),
                                unpacked_size: entry.unpacked_size as u64,
                                directory: entry.is_directory(),
                            };
                            self.state = State::BeforeFile(Box::new(before_file));
                            return Ok(Some(header));
                        }
                        None => return Ok(None),
                    }
                }
                State::BeforeFile(before_file) => {
                    // The previous member was not extracted; step over it.
                    let archive = before_file
                        .skip()
                        .map_err(|err| format_err!("{:?}", err))?;
                    self.state = State::BeforeHeader(archive);
                }
                State::Finished => return Ok(None),
            }
        }
    }

    fn process_file(&mut self, sink: DataSink) -> Result<u64, Error> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::BeforeFile(before_file) => {
                let (data, archive) = before_file
                    .read()
                    .map_err(|err| format_err!("{:?}", err))?;
                self.state = State::BeforeHeader(archive);
                for chunk in data.chunks(SINK_CHUNK) {
                    sink(chunk)?;
                }
                Ok(data.len() as u64)
            }
            other => {
                self.state = other;
                bail!("no current member to process");
            }
        }
    }
}

/// Write a memory-backed archive to a secure unique temp file so the
/// decoder can open it; the file is unlinked as soon as the decoder holds
/// the descriptor.
fn spill_to_tempfile(data: &[u8], name: &Path) -> Result<PathBuf, Error> {
    let template = std::env::temp_dir().join("rarfs-nested-XXXXXX");
    let (fd, path) = nix::unistd::mkstemp(&template)
        .map_err(|err| format_err!("mkstemp failed: {}", err))?;
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let result = file.write_all(data).and_then(|_| file.sync_all());
    if let Err(err) = result {
        let _ = std::fs::remove_file(&path);
        return Err(format_err!(
            "cannot spill {} to a temp file: {}",
            name.display(),
            err
        ));
    }
    Ok(path)
}
