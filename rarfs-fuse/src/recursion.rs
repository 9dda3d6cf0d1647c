//! Nested-archive recursion guards and extraction.
//!
//! The recursion context travels down one probe chain and enforces every
//! security bound: fingerprint cycle detection, depth limits, cumulative
//! unpacked size, and the per-extraction buffer cap. Nested archives are
//! unpacked into memory and probed from there; a temp-file spill only ever
//! happens inside the decoder when it cannot be driven from memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Error};

use rarfs_config::Options;
use rarfs_format::Fingerprint;

use crate::decoder::{extract_member, ArchiveSource, Decoder};

/// Hard ceiling for one nested extraction buffer: 1 GiB.
pub const MAX_NESTED_BUFFER: u64 = 1024 * 1024 * 1024;

/// Per-chain recursion state.
pub struct RecursionContext {
    depth: u8,
    max_depth: u8,
    visited: Vec<Fingerprint>,
    chain: Vec<PathBuf>,
    total_unpacked: u64,
    max_unpacked: u64,
    started: Instant,
}

impl RecursionContext {
    pub fn new(opts: &Options) -> Self {
        RecursionContext {
            depth: 0,
            max_depth: opts.recursion_depth(),
            visited: Vec::new(),
            chain: Vec::new(),
            total_unpacked: 0,
            max_unpacked: opts.max_unpack_size(),
            started: Instant::now(),
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn chain(&self) -> &[PathBuf] {
        &self.chain
    }

    /// Cheap pre-check used before paying for an extraction that a depth
    /// limit would reject anyway.
    pub fn can_descend(&self) -> bool {
        self.depth < self.max_depth
    }

    /// Whether this fingerprint is already on the chain. Logs the full
    /// chain when it is, since that is the one diagnostic that makes
    /// archive cycles debuggable.
    pub fn is_cycle(&self, fingerprint: &Fingerprint) -> bool {
        let hit = self.visited.iter().position(|v| v == fingerprint);
        if let Some(at) = hit {
            log::warn!(
                "archive cycle detected at depth {} (hash {:#018x}, size {})",
                at,
                fingerprint.hash,
                fingerprint.size
            );
            for (index, path) in self.chain.iter().enumerate() {
                log::warn!("  chain[{}]: {}", index, path.display());
            }
        }
        hit.is_some()
    }

    /// Charge `bytes` against the cumulative unpack budget.
    pub fn charge_size(&mut self, bytes: u64) -> Result<(), Error> {
        let next = self
            .total_unpacked
            .checked_add(bytes)
            .ok_or_else(|| anyhow::format_err!("unpack size counter overflow"))?;
        if next > self.max_unpacked {
            bail!(
                "nested archives too big: {} + {} exceeds the {} byte budget",
                self.total_unpacked,
                bytes,
                self.max_unpacked
            );
        }
        self.total_unpacked = next;
        Ok(())
    }

    pub fn total_unpacked(&self) -> u64 {
        self.total_unpacked
    }

    /// Enter a nested archive. Must be balanced by [`Self::pop`].
    pub fn push(&mut self, fingerprint: Fingerprint, path: &Path) -> Result<(), Error> {
        if self.depth >= self.max_depth {
            bail!(
                "nested archive too deep: depth {} reached the limit {}",
                self.depth,
                self.max_depth
            );
        }
        if self.depth >= rarfs_config::MAX_RECURSION_DEPTH {
            bail!(
                "nested archive depth hit the absolute cap {}",
                rarfs_config::MAX_RECURSION_DEPTH
            );
        }
        self.visited.push(fingerprint);
        self.chain.push(path.to_owned());
        self.depth += 1;
        Ok(())
    }

    pub fn pop(&mut self) {
        if self.depth == 0 {
            log::warn!("recursion pop without matching push");
            return;
        }
        self.depth -= 1;
        self.visited.pop();
        self.chain.pop();
    }
}

/// Fast-path location of a stored, unsplit member.
#[derive(Debug, Clone, Copy)]
pub struct StoredLocation {
    pub data_offset: u64,
    pub packed_size: u64,
}

/// Unpack one member of `source` into memory, bounded by `cap`.
///
/// Stored members are copied straight out of the containing bytes or file;
/// everything else goes through the decoder.
pub fn extract_to_memory(
    decoder: &Arc<dyn Decoder>,
    source: &ArchiveSource,
    password: Option<&str>,
    member_name: &str,
    stored: Option<StoredLocation>,
    cap: u64,
) -> Result<Vec<u8>, Error> {
    if let Some(location) = stored {
        if location.packed_size > cap {
            bail!(
                "stored member is {} bytes, over the {} byte buffer limit",
                location.packed_size,
                cap
            );
        }
        match source {
            ArchiveSource::Memory { data, name } => {
                let start = usize::try_from(location.data_offset)?;
                let len = usize::try_from(location.packed_size)?;
                if start.checked_add(len).map_or(true, |end| end > data.len()) {
                    bail!(
                        "stored member range out of bounds in {}",
                        name.display()
                    );
                }
                return Ok(data[start..start + len].to_vec());
            }
            ArchiveSource::File(path) => {
                use std::os::unix::fs::FileExt;
                let file = std::fs::File::open(path)?;
                let mut buffer = vec![0u8; usize::try_from(location.packed_size)?];
                file.read_exact_at(&mut buffer, location.data_offset)?;
                return Ok(buffer);
            }
        }
    }
    extract_member(decoder, source, password, member_name, cap, None)
}
