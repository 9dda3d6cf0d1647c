//! The directory cache.
//!
//! Per-directory listings built incrementally while archives are probed and
//! the host directory is enumerated. Duplicates are allowed during build;
//! closing a listing sorts it by (name, origin, kind) and marks the losers
//! invalid, with passthrough entries taking priority over archive-backed
//! ones and earlier contributions over later ones. Invalid entries are
//! never surfaced to a client.

use std::collections::HashMap;

use crate::filecache::{rolling_hash, EntryStat};

/// Where a listing entry came from; sort order makes `Fs` win duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryOrigin {
    Fs,
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    Other,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub hash: u32,
    pub kind: EntryKind,
    pub origin: EntryOrigin,
    pub valid: bool,
    /// Shared with the filename cache record backing this name.
    pub stat: EntryStat,
}

/// One directory's listing.
#[derive(Debug, Clone, Default)]
pub struct DirList {
    entries: Vec<DirEntry>,
}

impl DirList {
    pub fn new() -> Self {
        DirList::default()
    }

    /// Add one entry. Exact duplicates (same name, kind and origin) are
    /// folded immediately; everything else is kept for close-time
    /// resolution.
    pub fn add(&mut self, name: &str, kind: EntryKind, origin: EntryOrigin, stat: EntryStat) {
        let hash = rolling_hash(name);
        if self
            .entries
            .iter()
            .any(|e| e.hash == hash && e.kind == kind && e.origin == origin && e.name == name)
        {
            return;
        }
        self.entries.push(DirEntry {
            name: name.to_owned(),
            hash,
            kind,
            origin,
            valid: true,
            stat,
        });
    }

    /// Sort and resolve duplicates. Safe to call again after more adds.
    pub fn close(&mut self) {
        self.entries
            .sort_by(|a, b| (&a.name, a.origin, a.kind).cmp(&(&b.name, b.origin, b.kind)));
        let mut previous: Option<usize> = None;
        for index in 0..self.entries.len() {
            self.entries[index].valid = true;
            if let Some(prev) = previous {
                if self.entries[prev].name == self.entries[index].name {
                    self.entries[index].valid = false;
                    continue;
                }
            }
            previous = Some(index);
        }
    }

    /// Append every entry of `other` (used when one directory collects
    /// contributions from several archives).
    pub fn append(&mut self, other: &DirList) {
        for entry in &other.entries {
            self.add(&entry.name, entry.kind, entry.origin, entry.stat);
        }
    }

    pub fn iter_valid(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| e.valid)
    }

    pub fn contains(&self, name: &str) -> bool {
        let hash = rolling_hash(name);
        self.entries
            .iter()
            .any(|e| e.valid && e.hash == hash && e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cached listing plus materialization progress for one directory.
#[derive(Debug, Default)]
pub struct DirCacheEntry {
    pub list: DirList,
    /// Host directory enumerated and sentinels inserted.
    pub fs_enumerated: bool,
    /// All archive candidates in this directory probed.
    pub probed: bool,
}

/// Directory path -> listing.
#[derive(Debug, Default)]
pub struct DirCache {
    map: HashMap<String, DirCacheEntry>,
}

impl DirCache {
    pub fn get(&self, vdir: &str) -> Option<&DirCacheEntry> {
        self.map.get(vdir)
    }

    pub fn get_or_create(&mut self, vdir: &str) -> &mut DirCacheEntry {
        self.map.entry(vdir.to_owned()).or_default()
    }

    pub fn invalidate(&mut self, vdir: &str) {
        self.map.remove(vdir);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
