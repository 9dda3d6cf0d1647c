//! Piped reads: a producer drives the decoder, the handle consumes.
//!
//! The pipe is a bounded single-producer single-consumer channel. The
//! producer is a dedicated thread (the decoder is blocking) that extracts
//! the member chunk by chunk; for nested members it first rebuilds the
//! chain of enclosing archives in memory. Forward seeks within the
//! configured window are absorbed by draining the pipe; anything else
//! cancels the producer and spawns a fresh one from byte zero. Restarts
//! are the single most expensive operation the engine knows, so the handle
//! counts them.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use tokio::sync::mpsc;

use crate::decoder::{
    extract_member, is_cancelled, open_with_timeout, ArchiveSource, Cancelled, Decoder,
    DECODER_OPEN_TIMEOUT,
};
use crate::recursion::MAX_NESTED_BUFFER;

use rarfs_format::path::sanitize_member_path;

/// Chunks in flight between producer and consumer.
const PIPE_DEPTH: usize = 16;

/// Grace period for the producer to wind down on release.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything a producer needs to re-create its stream from byte zero.
#[derive(Clone)]
pub struct ProducerSpec {
    pub decoder: Arc<dyn Decoder>,
    /// First volume of the top-level archive set.
    pub archive: PathBuf,
    /// Member names of the nested-archive chain, outermost first; empty
    /// for members of a top-level archive.
    pub chain: Vec<String>,
    /// The member to stream, named within the innermost archive.
    pub member: String,
    pub password: Option<String>,
    /// Run to completion even without a consumer, to learn the true size.
    pub save_eof: bool,
    pub declared_size: u64,
}

type Chunk = io::Result<Vec<u8>>;

/// Consumer half of one piped open.
pub struct PipedReader {
    spec: ProducerSpec,
    seek_length: u64,
    rx: mpsc::Receiver<Chunk>,
    cancel: Arc<AtomicBool>,
    producer: Option<std::thread::JoinHandle<()>>,
    /// Leftover of the chunk currently being consumed.
    chunk: Vec<u8>,
    chunk_pos: usize,
    logical: u64,
    eof: bool,
    poisoned: Option<(io::ErrorKind, String)>,
    restarts: u64,
    discarded: u64,
}

impl PipedReader {
    /// Spawn the producer and return the consuming handle.
    pub fn new(spec: ProducerSpec, seek_length: u64) -> Self {
        let (rx, cancel, producer) = spawn_producer(&spec);
        PipedReader {
            spec,
            seek_length,
            rx,
            cancel,
            producer: Some(producer),
            chunk: Vec::new(),
            chunk_pos: 0,
            logical: 0,
            eof: false,
            poisoned: None,
            restarts: 0,
            discarded: 0,
        }
    }

    pub fn logical_offset(&self) -> u64 {
        self.logical
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn poison(&mut self, kind: io::ErrorKind, message: String) -> io::Error {
        self.poisoned = Some((kind, message.clone()));
        io::Error::new(kind, message)
    }

    /// Positional read; the logical offset advances by exactly the number
    /// of bytes returned.
    pub async fn read(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        if let Some((kind, message)) = &self.poisoned {
            return Err(io::Error::new(*kind, message.clone()));
        }

        if offset < self.logical {
            self.restart();
            self.drain(offset).await?;
        } else if offset > self.logical {
            let distance = offset - self.logical;
            if distance <= self.seek_length && self.seek_length > 0 {
                self.drain(offset).await?;
            } else {
                self.restart();
                self.drain(offset).await?;
            }
        }

        let mut out = Vec::with_capacity(len);
        while out.len() < len && !self.eof {
            if self.chunk_pos == self.chunk.len() {
                if !self.fill().await? {
                    break;
                }
            }
            let take = (len - out.len()).min(self.chunk.len() - self.chunk_pos);
            out.extend_from_slice(&self.chunk[self.chunk_pos..self.chunk_pos + take]);
            self.chunk_pos += take;
        }
        self.logical += out.len() as u64;
        Ok(out)
    }

    /// Pull the next chunk off the pipe. `Ok(false)` means end of stream.
    async fn fill(&mut self) -> io::Result<bool> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => {
                self.chunk = chunk;
                self.chunk_pos = 0;
                Ok(true)
            }
            Some(Err(err)) => {
                let kind = err.kind();
                Err(self.poison(kind, err.to_string()))
            }
            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Discard bytes until the logical offset reaches `target`.
    async fn drain(&mut self, target: u64) -> io::Result<()> {
        while self.logical < target && !self.eof {
            if self.chunk_pos == self.chunk.len() {
                if !self.fill().await? {
                    break;
                }
            }
            let available = (self.chunk.len() - self.chunk_pos) as u64;
            let skip = available.min(target - self.logical);
            self.chunk_pos += skip as usize;
            self.logical += skip;
            self.discarded += skip;
        }
        Ok(())
    }

    /// Cancel the current producer and start over from byte zero.
    fn restart(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        // Closing the receiver unblocks a producer stuck on a full pipe;
        // the cancelled thread winds down on its own.
        self.rx.close();
        if let Some(old) = self.producer.take() {
            drop(old);
        }

        let (rx, cancel, producer) = spawn_producer(&self.spec);
        self.rx = rx;
        self.cancel = cancel;
        self.producer = Some(producer);
        self.chunk = Vec::new();
        self.chunk_pos = 0;
        self.logical = 0;
        self.eof = false;
        self.restarts += 1;
    }

    /// Cancel the producer and wait (bounded) for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.rx.close();
        if self.restarts > 0 || self.discarded > 0 {
            log::debug!(
                "piped handle stats: {} restarts, {} bytes discarded",
                self.restarts,
                self.discarded
            );
        }
        if let Some(producer) = self.producer.take() {
            let reaped = tokio::time::timeout(
                SHUTDOWN_GRACE,
                tokio::task::spawn_blocking(move || {
                    let _ = producer.join();
                }),
            )
            .await;
            if reaped.is_err() {
                log::warn!("producer did not exit within the shutdown grace period");
            }
        }
    }
}

impl Drop for PipedReader {
    fn drop(&mut self) {
        // A handle dropped without an explicit shutdown (release racing a
        // read) must still stop its producer.
        self.cancel.store(true, Ordering::Relaxed);
    }
}

fn spawn_producer(
    spec: &ProducerSpec,
) -> (
    mpsc::Receiver<Chunk>,
    Arc<AtomicBool>,
    std::thread::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);
    let cancel = Arc::new(AtomicBool::new(false));
    let spec = spec.clone();
    let flag = Arc::clone(&cancel);
    let producer = std::thread::spawn(move || producer_main(spec, tx, flag));
    (rx, cancel, producer)
}

fn producer_main(spec: ProducerSpec, tx: mpsc::Sender<Chunk>, cancel: Arc<AtomicBool>) {
    match produce(&spec, &tx, &cancel) {
        Ok(produced) => {
            if spec.save_eof && produced != spec.declared_size {
                log::warn!(
                    "{}: archive declared {} bytes but produced {}",
                    spec.member,
                    spec.declared_size,
                    produced
                );
            }
        }
        Err(err) if is_cancelled(&err) => {}
        Err(err) => {
            log::error!("producer for '{}' failed: {:#}", spec.member, err);
            let _ = tx.blocking_send(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{:#}", err),
            )));
        }
    }
}

fn produce(
    spec: &ProducerSpec,
    tx: &mpsc::Sender<Chunk>,
    cancel: &Arc<AtomicBool>,
) -> Result<u64, Error> {
    let password = spec.password.as_deref();

    // Rebuild the nested chain in memory, outermost first.
    let mut source = ArchiveSource::File(spec.archive.clone());
    for nested in &spec.chain {
        if cancel.load(Ordering::Relaxed) {
            return Err(Cancelled.into());
        }
        let data = extract_member(
            &spec.decoder,
            &source,
            password,
            nested,
            MAX_NESTED_BUFFER,
            Some(cancel),
        )?;
        source = ArchiveSource::Memory {
            data: Arc::new(data),
            name: PathBuf::from(nested),
        };
    }

    let mut handle = open_with_timeout(&spec.decoder, &source, password, DECODER_OPEN_TIMEOUT)?;
    while let Some(header) = handle.next_header()? {
        if cancel.load(Ordering::Relaxed) {
            return Err(Cancelled.into());
        }
        let matches = sanitize_member_path(&header.name_raw)
            .map(|name| name == spec.member)
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let mut produced = 0u64;
        let mut receiver_gone = false;
        handle.process_file(&mut |chunk| {
            if cancel.load(Ordering::Relaxed) {
                return Err(Cancelled.into());
            }
            produced += chunk.len() as u64;
            if !receiver_gone && tx.blocking_send(Ok(chunk.to_vec())).is_err() {
                // Consumer went away. With save-eof the stream still runs
                // to completion so the size check below is meaningful.
                if spec.save_eof {
                    receiver_gone = true;
                } else {
                    return Err(Cancelled.into());
                }
            }
            Ok(())
        })?;
        return Ok(produced);
    }

    anyhow::bail!(
        "member '{}' not found in {}",
        spec.member,
        source.display_name().display()
    );
}
