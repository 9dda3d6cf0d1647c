//! The read engine: one I/O handle per open.
//!
//! Three flavors: passthrough handles proxy to a host file, raw handles
//! serve stored members by positional reads over volume files, and piped
//! handles consume a producer that drives the decoder. The handle is the
//! sole per-open mutable context; the session keeps each one behind its own
//! async mutex so reads on a single handle stay ordered while different
//! handles proceed in parallel.

use std::io;
use std::os::unix::fs::FileExt;

pub mod piped;
pub mod raw;

pub use piped::{PipedReader, ProducerSpec};
pub use raw::RawReader;

/// Passthrough handle over a host file.
pub struct PassReader {
    file: std::fs::File,
}

impl PassReader {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        Ok(PassReader {
            file: std::fs::File::open(path)?,
        })
    }

    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut pos = 0;
        while pos < len {
            let got = self.file.read_at(&mut buf[pos..], offset + pos as u64)?;
            if got == 0 {
                break;
            }
            pos += got;
        }
        buf.truncate(pos);
        Ok(buf)
    }
}

/// One open file handle.
pub enum IoHandle {
    Pass(PassReader),
    Raw(RawReader),
    Piped(PipedReader),
}

impl IoHandle {
    /// Positional read. Raw and passthrough reads are bounded by disk
    /// latency and run via `block_in_place`; the piped flavor awaits the
    /// producer.
    pub async fn read(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        match self {
            IoHandle::Pass(reader) => tokio::task::block_in_place(|| reader.read_at(offset, len)),
            IoHandle::Raw(reader) => tokio::task::block_in_place(|| reader.read_at(offset, len)),
            IoHandle::Piped(reader) => reader.read(offset, len).await,
        }
    }

    /// Size the handle believes in, when it tracks one.
    pub fn logical_offset(&self) -> u64 {
        match self {
            IoHandle::Pass(_) | IoHandle::Raw(_) => 0,
            IoHandle::Piped(reader) => reader.logical_offset(),
        }
    }

    /// Tear the handle down; cancels and reaps a piped producer.
    pub async fn release(self) {
        if let IoHandle::Piped(reader) = self {
            reader.shutdown().await;
        }
    }
}
