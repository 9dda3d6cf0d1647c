//! The filename cache.
//!
//! A fixed-bucket chained hash table keyed by virtual path, holding the
//! canonical metadata record for everything the mount can serve. Two
//! sentinels replace the record in a lookup: `Local` means "this path is a
//! passthrough to the source root", `Loop` means "this path is known dead"
//! (the mountpoint nested inside the source, for instance). The table is
//! always used under the process-wide reader/writer lock owned by
//! [`crate::Shared`]; lookups hand out borrows whose lifetime is tied to
//! that guard, and callers that need data past the lock clone the record.

use std::path::PathBuf;

use bitflags::bitflags;

use rarfs_format::RawGeometry;

const BUCKET_COUNT: usize = 1024;

bitflags! {
    /// The packed per-entry flag record. Individual bits only ever change
    /// under the writer lock, and only the deferred/unresolved group may
    /// transition after insertion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        /// Stored member, readable by positional reads without the decoder.
        const RAW = 1 << 0;
        /// Member of a multi-volume set.
        const MULTIPART = 1 << 1;
        /// Empty payload with a trailing separator: present as a directory.
        const FORCE_DIR = 1 << 2;
        /// Spanning geometry not derived yet.
        const VSIZE_FIXUP_NEEDED = 1 << 3;
        const ENCRYPTED = 1 << 4;
        /// Spanning geometry fully derived.
        const VSIZE_RESOLVED = 1 << 5;
        /// Placeholder record; the owning archive has not been probed.
        const UNRESOLVED = 1 << 6;
        /// Geometry resolution has been attempted once.
        const DRY_RUN_DONE = 1 << 7;
        /// Restore the archive's atime when the last handle closes.
        const CHECK_ATIME = 1 << 8;
        /// Serve opens with direct I/O (bypass the kernel page cache).
        const DIRECT_IO = 1 << 9;
        /// Media sniff for unreliable declared sizes already happened.
        const AVI_TESTED = 1 << 10;
        /// Run the producer to completion to learn the true size.
        const SAVE_EOF = 1 << 11;
        /// Archive-nature of this file has not been determined yet.
        const DETECTION_DEFERRED = 1 << 12;
        /// This entry is an archive found inside another archive.
        const IS_NESTED_RAR = 1 << 13;
    }
}

/// POSIX-ish stat block shared between the filename and directory caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryStat {
    pub ino: u64,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
}

impl EntryStat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }
}

/// The canonical metadata record for one virtual path.
///
/// `archive_path` and `member_name` are immutable once inserted; the
/// prober only flips deferred/unresolved flag bits afterwards.
#[derive(Debug, Clone, Default)]
pub struct FileCacheEntry {
    /// First volume of the backing archive set.
    pub archive_path: PathBuf,
    /// Name inside the archive; empty for synthetic directory entries.
    pub member_name: String,
    pub link_target: Option<String>,
    pub stat: EntryStat,
    /// Normalized compression method (exposed via `user.method`).
    pub method: u8,
    pub geometry: RawGeometry,
    pub flags: EntryFlags,
    /// 0 for members of a top-level archive.
    pub nested_depth: u8,
    pub hide_from_listing: bool,
    /// Virtual path of the containing nested archive's record, if any.
    pub parent_archive_path: Option<PathBuf>,
}

impl FileCacheEntry {
    pub fn is_raw(&self) -> bool {
        self.flags.contains(EntryFlags::RAW)
    }

    pub fn is_dir(&self) -> bool {
        self.stat.is_dir() || self.flags.contains(EntryFlags::FORCE_DIR)
    }
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup<'a> {
    Miss,
    /// Passthrough to the source root.
    Local,
    /// Known dead path.
    Loop,
    Entry(&'a FileCacheEntry),
}

enum Slot {
    Local,
    Loop,
    Entry(Box<FileCacheEntry>),
}

struct Node {
    hash: u32,
    path: String,
    slot: Slot,
}

/// Non-cryptographic rolling hash over the path bytes.
pub fn rolling_hash(path: &str) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in path.as_bytes() {
        hash = hash.wrapping_mul(33) ^ u32::from(byte);
    }
    hash
}

/// Fixed-bucket chained hash table keyed by virtual path.
pub struct FileCache {
    buckets: Vec<Vec<Node>>,
    len: usize,
}

impl Default for FileCache {
    fn default() -> Self {
        FileCache {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }
}

impl FileCache {
    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    fn set(&mut self, path: &str, slot: Slot) {
        let hash = rolling_hash(path);
        let bucket = self.bucket_of(hash);
        let chain = &mut self.buckets[bucket];
        for node in chain.iter_mut() {
            if node.hash == hash && node.path == path {
                // Overwrite semantics: a fresh record replaces any prior
                // entry for the same path.
                node.slot = slot;
                return;
            }
        }
        chain.push(Node {
            hash,
            path: path.to_owned(),
            slot,
        });
        self.len += 1;
    }

    /// Insert (or replace) the record for `path`.
    pub fn insert(&mut self, path: &str, entry: FileCacheEntry) {
        self.set(path, Slot::Entry(Box::new(entry)));
    }

    /// Mark `path` as a passthrough to the source root.
    pub fn insert_local(&mut self, path: &str) {
        self.set(path, Slot::Local);
    }

    /// Mark `path` as known dead.
    pub fn insert_loop(&mut self, path: &str) {
        self.set(path, Slot::Loop);
    }

    pub fn get(&self, path: &str) -> Lookup<'_> {
        let hash = rolling_hash(path);
        let chain = &self.buckets[self.bucket_of(hash)];
        for node in chain {
            if node.hash == hash && node.path == path {
                return match &node.slot {
                    Slot::Local => Lookup::Local,
                    Slot::Loop => Lookup::Loop,
                    Slot::Entry(entry) => Lookup::Entry(entry),
                };
            }
        }
        Lookup::Miss
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut FileCacheEntry> {
        let hash = rolling_hash(path);
        let bucket = self.bucket_of(hash);
        for node in &mut self.buckets[bucket] {
            if node.hash == hash && node.path == path {
                if let Slot::Entry(entry) = &mut node.slot {
                    return Some(entry);
                }
                return None;
            }
        }
        None
    }

    /// Drop the record for `path`.
    pub fn invalidate(&mut self, path: &str) {
        let hash = rolling_hash(path);
        let bucket = self.bucket_of(hash);
        let chain = &mut self.buckets[bucket];
        if let Some(pos) = chain
            .iter()
            .position(|node| node.hash == hash && node.path == path)
        {
            chain.swap_remove(pos);
            self.len -= 1;
        }
    }

    /// Drop every record below `prefix` (inclusive).
    pub fn invalidate_subtree(&mut self, prefix: &str) {
        let sub = if prefix.ends_with('/') {
            prefix.to_owned()
        } else {
            format!("{}/", prefix)
        };
        for chain in &mut self.buckets {
            let before = chain.len();
            chain.retain(|node| node.path != prefix && !node.path.starts_with(&sub));
            self.len -= before - chain.len();
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
