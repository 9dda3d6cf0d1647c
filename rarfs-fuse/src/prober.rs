//! Archive probing and directory materialization.
//!
//! Directories materialize in two passes. The light pass enumerates the
//! host directory, adds passthrough entries and drops a deferred
//! placeholder for every archive candidate; it is enough to answer lookups
//! of plain files. The full pass walks the headers of every deferred
//! archive and commits the resulting member records. Header walking runs
//! without the global lock; results are committed under the writer lock in
//! one step, so readers never observe a half-probed archive.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};

use rarfs_format::path::{has_trailing_separator, sanitize_member_path};
use rarfs_format::volume::{is_archive_candidate, is_continuation_volume, MAX_VOLUMES};
use rarfs_format::{index, Fingerprint, MemberBlock, VolumeSet, Walker};

use crate::decoder::{open_with_timeout, ArchiveSource, DECODER_OPEN_TIMEOUT};
use crate::dirlist::{EntryKind, EntryOrigin};
use crate::filecache::{EntryFlags, EntryStat, FileCacheEntry, Lookup};
use crate::recursion::{extract_to_memory, RecursionContext, StoredLocation, MAX_NESTED_BUFFER};
use crate::{vpath_join, vpath_name, Caches, Shared};

/// Longest symlink target recovered from a stored payload.
const MAX_LINK_TARGET: u64 = 4096;

/// Cap on members accepted from a decoder-side listing.
const MAX_LISTING_ENTRIES: usize = 10_000;

/// One volume's byte stream: a file on disk or a shared nested buffer.
enum VolumeReader {
    File(File),
    Memory(Cursor<OwnedBytes>),
}

impl Read for VolumeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            VolumeReader::File(file) => file.read(buf),
            VolumeReader::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for VolumeReader {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        match self {
            VolumeReader::File(file) => file.seek(pos),
            VolumeReader::Memory(cursor) => cursor.seek(pos),
        }
    }
}

/// Make sure `vdir` is materialized. The light pass is enough for lookups
/// of passthrough files; `full` walks every archive in the directory.
pub fn materialize_dir(shared: &Shared, vdir: &str, full: bool) -> Result<(), Error> {
    {
        let cache = shared.cache.read().unwrap();
        if let Some(entry) = cache.dirs.get(vdir) {
            if entry.fs_enumerated && (!full || entry.probed) {
                return Ok(());
            }
        }
    }

    let host_entries = enumerate_host_dir(shared, vdir);

    {
        let mut cache = shared.cache.write().unwrap();
        let Caches { files, dirs } = &mut *cache;
        let dir_entry = dirs.get_or_create(vdir);
        if !dir_entry.fs_enumerated {
            for host in &host_entries {
                let vpath = vpath_join(vdir, &host.name);
                if matches!(files.get(&vpath), Lookup::Loop) {
                    continue;
                }
                match host.class {
                    HostClass::Plain => {
                        dir_entry
                            .list
                            .add(&host.name, host.kind, EntryOrigin::Fs, host.stat);
                        files.insert_local(&vpath);
                    }
                    HostClass::Continuation => {
                        // Continuation volumes never appear on their own.
                    }
                    HostClass::Archive => {
                        if matches!(files.get(&vpath), Lookup::Miss) {
                            files.insert(
                                &vpath,
                                FileCacheEntry {
                                    archive_path: host.path.clone(),
                                    stat: host.stat,
                                    flags: EntryFlags::DETECTION_DEFERRED
                                        | EntryFlags::UNRESOLVED,
                                    ..Default::default()
                                },
                            );
                        }
                    }
                }
            }
            dir_entry.fs_enumerated = true;
            dir_entry.list.close();
        }
    }

    if !full {
        return Ok(());
    }

    for host in &host_entries {
        if host.class != HostClass::Archive {
            continue;
        }
        let vpath = vpath_join(vdir, &host.name);
        let deferred = {
            let cache = shared.cache.read().unwrap();
            matches!(
                cache.files.get(&vpath),
                Lookup::Entry(e) if e.flags.contains(EntryFlags::DETECTION_DEFERRED)
            )
        };
        if deferred {
            probe_and_commit(shared, &host.path, vdir, &vpath);
        }
    }

    let mut cache = shared.cache.write().unwrap();
    let dir_entry = cache.dirs.get_or_create(vdir);
    dir_entry.probed = true;
    dir_entry.list.close();
    Ok(())
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum HostClass {
    Plain,
    Archive,
    Continuation,
}

struct HostEntry {
    name: String,
    path: PathBuf,
    kind: EntryKind,
    stat: EntryStat,
    class: HostClass,
}

fn enumerate_host_dir(shared: &Shared, vdir: &str) -> Vec<HostEntry> {
    let host_dir = shared.host_path(vdir);
    let mut entries = Vec::new();
    let read_dir = match std::fs::read_dir(&host_dir) {
        Ok(read_dir) => read_dir,
        Err(_) => return entries,
    };
    for dirent in read_dir.flatten() {
        let name = match dirent.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if name == ".rarconfig" {
            continue;
        }
        let path = dirent.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let stat = host_entry_stat(&meta);
        let kind = kind_from_mode(stat.mode);
        let class = if meta.is_file() && is_continuation_volume(&name) {
            HostClass::Continuation
        } else if meta.is_file() && is_archive_candidate(&name) {
            HostClass::Archive
        } else {
            HostClass::Plain
        };
        entries.push(HostEntry {
            name,
            path,
            kind,
            stat,
            class,
        });
    }
    // Deterministic probe order makes first-wins collisions stable.
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

fn host_entry_stat(meta: &std::fs::Metadata) -> EntryStat {
    use std::os::unix::fs::MetadataExt;
    EntryStat {
        ino: 0,
        mode: meta.mode(),
        size: meta.len(),
        mtime: meta.mtime(),
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink() as u32,
    }
}

pub(crate) fn kind_from_mode(mode: u32) -> EntryKind {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => EntryKind::Directory,
        libc::S_IFREG => EntryKind::Regular,
        libc::S_IFLNK => EntryKind::Symlink,
        _ => EntryKind::Other,
    }
}

/// Probe one archive and commit the outcome. Malformed archives demote to
/// passthrough; that is the contract that keeps corrupt `.rar` files
/// looking like plain files instead of failing the mount.
pub fn probe_and_commit(shared: &Shared, archive_host: &Path, vdir: &str, archive_vpath: &str) {
    let password = shared
        .config
        .lock()
        .unwrap()
        .password(archive_host)
        .map(str::to_owned);
    let mut ctx = RecursionContext::new(&shared.opts);
    let mut staged = StagedProbe::default();
    let params = WalkParams {
        archive_host,
        vdir,
        depth: 0,
        parent_vpath: None,
        password: password.as_deref(),
    };
    let outcome = match probe_source(shared, &params, &mut ctx, &mut staged) {
        // An archive that contributes nothing is indistinguishable from a
        // plain file as far as the namespace goes; show the file.
        Ok(()) if staged.files.is_empty() => Err(format_err!("no members found")),
        other => other,
    };

    let host_stat = std::fs::symlink_metadata(archive_host)
        .map(|meta| host_entry_stat(&meta))
        .unwrap_or_default();

    let mut cache = shared.cache.write().unwrap();
    let Caches { files, dirs } = &mut *cache;
    let archive_name = vpath_name(archive_vpath).to_owned();

    match outcome {
        Err(err) => {
            log::info!(
                "{}: exposing as a regular file: {:#}",
                archive_host.display(),
                err
            );
            files.insert_local(archive_vpath);
            let list = &mut dirs.get_or_create(vdir).list;
            list.add(
                &archive_name,
                kind_from_mode(host_stat.mode),
                EntryOrigin::Fs,
                host_stat,
            );
            list.close();
        }
        Ok(()) => {
            // The archive itself disappears from the namespace; its
            // members stand in for it.
            files.insert(
                archive_vpath,
                FileCacheEntry {
                    archive_path: archive_host.to_owned(),
                    stat: host_stat,
                    hide_from_listing: true,
                    ..Default::default()
                },
            );

            let mut touched: HashSet<String> = HashSet::new();
            touched.insert(vdir.to_owned());
            let mut committed: HashSet<String> = HashSet::new();
            for (vpath, entry) in staged.files {
                if committed.contains(&vpath) {
                    // Within one probe the first staged claim wins
                    // (insertion order of enumeration).
                    continue;
                }
                match files.get(&vpath) {
                    // Passthrough and dead paths always win.
                    Lookup::Local | Lookup::Loop => continue,
                    Lookup::Entry(existing) => {
                        let replaceable = existing.flags.contains(EntryFlags::UNRESOLVED)
                            || existing.archive_path == entry.archive_path;
                        if !replaceable {
                            // First archive to claim a name keeps it.
                            continue;
                        }
                    }
                    Lookup::Miss => {}
                }
                committed.insert(vpath.clone());
                files.insert(&vpath, entry);
            }
            for (dir_vpath, name, kind, stat) in staged.dir_adds {
                dirs.get_or_create(&dir_vpath)
                    .list
                    .add(&name, kind, EntryOrigin::Archive, stat);
                touched.insert(dir_vpath);
            }
            for dir_vpath in touched {
                dirs.get_or_create(&dir_vpath).list.close();
            }
        }
    }
}

struct WalkParams<'a> {
    /// First volume of the top-level archive; every record points here.
    archive_host: &'a Path,
    /// Directory the archive (and its flattened members) lives in.
    vdir: &'a str,
    /// Nesting level of the archive being walked.
    depth: u8,
    /// Virtual path of the containing nested-archive record.
    parent_vpath: Option<&'a str>,
    password: Option<&'a str>,
}

#[derive(Default)]
struct StagedProbe {
    files: Vec<(String, FileCacheEntry)>,
    dir_adds: Vec<(String, String, EntryKind, EntryStat)>,
    dirs_seen: HashSet<String>,
}

fn probe_source(
    shared: &Shared,
    params: &WalkParams,
    ctx: &mut RecursionContext,
    staged: &mut StagedProbe,
) -> Result<(), Error> {
    // A fresh sidecar index replaces the header walk. Recursive mounts
    // always walk: nested archives cannot be expanded from an index.
    if !shared.opts.recursive() {
        let sidecar = index::sidecar_path(params.archive_host);
        if index::is_fresh(&sidecar, params.archive_host) {
            match index::read_index(&sidecar, shared.opts.idx_mmap()) {
                Ok(entries) => {
                    log::debug!(
                        "{}: using sidecar index ({} entries)",
                        params.archive_host.display(),
                        entries.len()
                    );
                    stage_from_index(shared, entries, params, staged);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!("{}: ignoring sidecar: {:#}", sidecar.display(), err);
                }
            }
        }
    }

    let set = VolumeSet::detect(params.archive_host);
    let source = ArchiveSource::File(params.archive_host.to_owned());
    probe_walk(shared, &source, set.as_ref(), params, ctx, staged)
}

struct PendingSplit {
    /// Decoder-visible member name.
    clean: String,
    /// Presentation name (after aliasing).
    name: String,
    /// Directory the member flattens into.
    vdir: String,
    entry: FileCacheEntry,
    accumulated: u64,
    degraded: bool,
}

fn probe_walk(
    shared: &Shared,
    source: &ArchiveSource,
    set: Option<&VolumeSet>,
    params: &WalkParams,
    ctx: &mut RecursionContext,
    staged: &mut StagedProbe,
) -> Result<(), Error> {
    let mut volume_index: u32 = 0;
    let mut pending: Option<PendingSplit> = None;
    let mut is_volume_archive = false;

    loop {
        if volume_index >= MAX_VOLUMES {
            log::warn!(
                "{}: volume cap reached, stopping the walk",
                params.archive_host.display()
            );
            break;
        }

        let opened = open_volume(source, set, volume_index);
        let (mut walker, file_len) = match opened {
            Ok(Some(pair)) => pair,
            Ok(None) => break,
            Err(err) => {
                if volume_index == 0 {
                    return Err(err);
                }
                log::warn!(
                    "{}: volume {} unreadable: {:#}",
                    params.archive_host.display(),
                    volume_index,
                    err
                );
                break;
            }
        };

        if walker.info().headers_encrypted {
            if volume_index == 0 {
                return probe_encrypted_listing(shared, source, params, staged);
            }
            bail!("continuation volume has encrypted headers");
        }
        if volume_index == 0 {
            is_volume_archive = walker.info().volume;
        }

        while let Some(block) = walker.next_member()? {
            if block.split_before {
                accumulate_continuation(&mut pending, &block, volume_index, file_len, staged);
                continue;
            }
            if let Some(stale) = pending.take() {
                log::warn!(
                    "{}: split member '{}' never terminated",
                    params.archive_host.display(),
                    stale.name
                );
                finalize_pending(stale, false, staged);
            }
            // Naming fields only matter when the headers say this really
            // is a volume set.
            let member_set = if is_volume_archive { set } else { None };
            process_member(
                shared,
                source,
                member_set,
                &block,
                file_len,
                volume_index,
                params,
                ctx,
                staged,
                &mut pending,
            )?;
        }

        let multi = is_volume_archive
            && set.is_some()
            && matches!(source, ArchiveSource::File(_));
        if !multi {
            break;
        }
        volume_index += 1;
    }

    if let Some(dangling) = pending.take() {
        // Tail volume missing: geometry stays unresolved.
        finalize_pending(dangling, false, staged);
    }
    Ok(())
}

type VolumePair = (Walker<VolumeReader>, u64);

fn open_volume(
    source: &ArchiveSource,
    set: Option<&VolumeSet>,
    volume_index: u32,
) -> Result<Option<VolumePair>, Error> {
    match source {
        ArchiveSource::Memory { data, .. } => {
            if volume_index > 0 {
                // Nested archives are single buffers; sibling volumes of a
                // nested set are not reconstructed.
                return Ok(None);
            }
            let data = Arc::clone(data);
            let len = data.len() as u64;
            let cursor = Cursor::new(OwnedBytes(data));
            let walker = Walker::open(VolumeReader::Memory(cursor))?;
            Ok(Some((walker, len)))
        }
        ArchiveSource::File(first) => {
            let path = if volume_index == 0 {
                first.clone()
            } else {
                match set.and_then(|s| s.volume_path(volume_index)) {
                    Some(path) => path,
                    None => return Ok(None),
                }
            };
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && volume_index > 0 => {
                    return Ok(None);
                }
                Err(err) => {
                    return Err(format_err!("cannot open {}: {}", path.display(), err));
                }
            };
            let len = file.metadata()?.len();
            let walker = Walker::open(VolumeReader::File(file))?;
            Ok(Some((walker, len)))
        }
    }
}

/// `Cursor` wants `AsRef<[u8]>` ownership; an `Arc<Vec<u8>>` wrapper keeps
/// the nested buffer shared instead of copied.
struct OwnedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for OwnedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

fn accumulate_continuation(
    pending: &mut Option<PendingSplit>,
    block: &MemberBlock,
    volume_index: u32,
    file_len: u64,
    staged: &mut StagedProbe,
) {
    let matches = match (&*pending, sanitize_member_path(&block.name_raw)) {
        (Some(p), Some(clean)) => p.clean == clean,
        _ => false,
    };
    if !matches {
        log::warn!("orphan continuation block, skipping");
        return;
    }
    let p = pending.as_mut().expect("matched above");
    let geometry = &mut p.entry.geometry;
    let continuation_index = volume_index - u32::from(geometry.vno_first);
    if continuation_index == 1 {
        geometry.offset_next = block.data_offset;
        geometry.vsize_next = file_len;
        geometry.vsize_real_next = block.packed_size;
    } else if block.split_after
        && (block.packed_size != geometry.vsize_real_next || block.data_offset != geometry.offset_next)
    {
        // Irregular volume sizes defeat the arithmetic mapping; the member
        // still works through the decoder.
        p.degraded = true;
    }
    p.accumulated += block.packed_size;
    if !block.split_after {
        let done = pending.take().expect("matched above");
        finalize_pending(done, true, staged);
    }
}

fn finalize_pending(mut p: PendingSplit, resolved: bool, staged: &mut StagedProbe) {
    let flags = &mut p.entry.flags;
    if resolved && !p.degraded {
        flags.remove(EntryFlags::VSIZE_FIXUP_NEEDED);
        flags.insert(EntryFlags::VSIZE_RESOLVED);
        if p.accumulated != p.entry.stat.size {
            log::warn!(
                "'{}': volumes carry {} bytes but the header declares {}",
                p.name,
                p.accumulated,
                p.entry.stat.size
            );
        }
    } else if p.degraded {
        flags.remove(EntryFlags::RAW);
        flags.remove(EntryFlags::VSIZE_FIXUP_NEEDED);
    }
    flags.insert(EntryFlags::DRY_RUN_DONE);
    let name = p.name.clone();
    let vdir = p.vdir.clone();
    stage_member(staged, &vdir, &name, p.entry, false);
}

#[allow(clippy::too_many_arguments)]
fn process_member(
    shared: &Shared,
    source: &ArchiveSource,
    set: Option<&VolumeSet>,
    block: &MemberBlock,
    file_len: u64,
    volume_index: u32,
    params: &WalkParams,
    ctx: &mut RecursionContext,
    staged: &mut StagedProbe,
    pending: &mut Option<PendingSplit>,
) -> Result<(), Error> {
    let Some(clean) = sanitize_member_path(&block.name_raw) else {
        log::warn!(
            "{}: skipping member with unsafe name",
            params.archive_host.display()
        );
        return Ok(());
    };

    // Aliases are bound to the top-level archive path.
    let name = if params.depth == 0 {
        shared
            .config
            .lock()
            .unwrap()
            .alias_for(params.archive_host, &clean)
            .map(str::to_owned)
            .unwrap_or_else(|| clean.clone())
    } else {
        clean.clone()
    };

    let force_dir =
        !block.directory && block.unpacked_size == 0 && has_trailing_separator(&block.name_raw);
    let is_dir = block.directory || force_dir;
    if shared.opts.flat_only() && (is_dir || name.contains('/')) {
        return Ok(());
    }

    let mode = member_mode(block, is_dir);
    let stored_single = block.is_stored() && !block.split_after && !block.split_before;

    // A member that is itself an archive: descend when enabled, otherwise
    // it stays a plain file.
    if !is_dir
        && shared.opts.recursive()
        && is_archive_candidate(vpath_name(&name))
        && !is_continuation_volume(vpath_name(&name))
    {
        let stored_loc = stored_single.then_some(StoredLocation {
            data_offset: block.data_offset,
            packed_size: block.packed_size,
        });
        match try_nested(shared, source, block, &clean, &name, stored_loc, params, ctx, staged) {
            Ok(()) => return Ok(()),
            Err(err) => {
                log::warn!(
                    "nested archive '{}' in {} not expanded: {:#}",
                    name,
                    params.archive_host.display(),
                    err
                );
            }
        }
    }

    let mut entry = FileCacheEntry {
        archive_path: params.archive_host.to_owned(),
        member_name: clean,
        stat: EntryStat {
            ino: 0,
            mode,
            size: block.unpacked_size,
            mtime: block.mtime,
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            nlink: if is_dir { 2 } else { 1 },
        },
        method: block.method,
        flags: base_flags(shared, params),
        nested_depth: params.depth,
        parent_archive_path: params.parent_vpath.map(PathBuf::from),
        ..Default::default()
    };
    if force_dir {
        entry.flags |= EntryFlags::FORCE_DIR;
    }
    if block.encrypted {
        entry.flags |= EntryFlags::ENCRYPTED;
    }

    // Raw geometry only exists for stored top-level members; nested members
    // always go through the decoder chain.
    let rawable = params.depth == 0 && matches!(source, ArchiveSource::File(_));
    if rawable && block.is_stored() && !is_dir {
        entry.flags |= EntryFlags::RAW;
        let geometry = &mut entry.geometry;
        geometry.offset = block.data_offset;
        geometry.vsize_first = file_len;
        geometry.vsize_real_first = block.packed_size;
        geometry.vno_first = volume_index as u16;
        if let Some(set) = set {
            geometry.vtype = set.naming().as_vtype();
            geometry.vpos = set.vpos() as u8;
            geometry.vlen = set.vlen() as u8;
            geometry.vno_base = set.vno_base() as u16;
            entry.flags |= EntryFlags::MULTIPART;
        }
        if block.split_after {
            entry.flags |= EntryFlags::MULTIPART | EntryFlags::VSIZE_FIXUP_NEEDED;
            *pending = Some(PendingSplit {
                clean: entry.member_name.clone(),
                name,
                vdir: params.vdir.to_owned(),
                accumulated: block.packed_size,
                degraded: false,
                entry,
            });
            return Ok(());
        }
        entry.flags |= EntryFlags::VSIZE_RESOLVED | EntryFlags::DRY_RUN_DONE;
    } else if block.split_after && !is_dir {
        // A compressed split member: it is served through the decoder, but
        // its continuation blocks still need to be swallowed.
        entry.flags |= EntryFlags::MULTIPART;
        *pending = Some(PendingSplit {
            clean: entry.member_name.clone(),
            name,
            vdir: params.vdir.to_owned(),
            accumulated: block.packed_size,
            degraded: true,
            entry,
        });
        return Ok(());
    }

    if entry.stat.is_symlink() {
        entry.link_target = link_target_for(block, source, stored_single);
        if entry.link_target.is_none() {
            // A link we cannot resolve is worse than a file we can read.
            entry.stat.mode = libc::S_IFREG | 0o644;
        }
    }

    stage_member(staged, params.vdir, &name, entry, false);
    Ok(())
}

fn base_flags(shared: &Shared, params: &WalkParams) -> EntryFlags {
    let mut flags = EntryFlags::CHECK_ATIME;
    let save_eof = shared
        .config
        .lock()
        .unwrap()
        .save_eof(params.archive_host)
        .unwrap_or_else(|| shared.opts.save_eof());
    if save_eof {
        flags |= EntryFlags::SAVE_EOF;
    }
    if shared.opts.direct_io() {
        flags |= EntryFlags::DIRECT_IO;
    }
    flags
}

fn member_mode(block: &MemberBlock, is_dir: bool) -> u32 {
    let mode = match block.unix_mode {
        Some(mode) if mode & libc::S_IFMT != 0 => mode,
        Some(mode) => {
            if is_dir {
                libc::S_IFDIR | (mode & 0o7777)
            } else {
                libc::S_IFREG | (mode & 0o7777)
            }
        }
        None => {
            if is_dir {
                libc::S_IFDIR | 0o755
            } else {
                libc::S_IFREG | 0o644
            }
        }
    };
    if is_dir && mode & libc::S_IFMT != libc::S_IFDIR {
        libc::S_IFDIR | (mode & 0o7777)
    } else {
        mode
    }
}

fn link_target_for(
    block: &MemberBlock,
    source: &ArchiveSource,
    stored_single: bool,
) -> Option<String> {
    if let Some(raw) = &block.link_target {
        return String::from_utf8(raw.clone()).ok();
    }
    // Classic-format links store the target as the member payload.
    if !stored_single || block.packed_size == 0 || block.packed_size > MAX_LINK_TARGET {
        return None;
    }
    let mut buf = vec![0u8; block.packed_size as usize];
    match source {
        ArchiveSource::File(path) => {
            use std::os::unix::fs::FileExt;
            let file = File::open(path).ok()?;
            file.read_exact_at(&mut buf, block.data_offset).ok()?;
        }
        ArchiveSource::Memory { data, .. } => {
            let start = usize::try_from(block.data_offset).ok()?;
            let end = start.checked_add(buf.len())?;
            if end > data.len() {
                return None;
            }
            buf.copy_from_slice(&data[start..end]);
        }
    }
    String::from_utf8(buf).ok()
}

#[allow(clippy::too_many_arguments)]
fn try_nested(
    shared: &Shared,
    source: &ArchiveSource,
    block: &MemberBlock,
    clean: &str,
    name: &str,
    stored_loc: Option<StoredLocation>,
    params: &WalkParams,
    ctx: &mut RecursionContext,
    staged: &mut StagedProbe,
) -> Result<(), Error> {
    if !ctx.can_descend() {
        bail!("nested archive too deep (depth {})", ctx.depth());
    }
    ctx.charge_size(block.unpacked_size)?;

    let data = extract_to_memory(
        &shared.decoder,
        source,
        params.password,
        clean,
        stored_loc,
        MAX_NESTED_BUFFER,
    )?;
    let fingerprint = Fingerprint::of_bytes(&data, block.mtime);
    if ctx.is_cycle(&fingerprint) {
        bail!("archive cycle detected");
    }

    let member_vpath = vpath_join(params.vdir, name);
    ctx.push(fingerprint, Path::new(&member_vpath))?;
    let nested_source = ArchiveSource::Memory {
        data: Arc::new(data),
        name: PathBuf::from(&member_vpath),
    };
    // Members flatten into the directory their own archive sits in, which
    // for a nested archive inside a subdirectory is that subdirectory.
    let nested_vdir = crate::vpath_parent(&member_vpath).to_owned();
    let nested_params = WalkParams {
        archive_host: params.archive_host,
        vdir: &nested_vdir,
        depth: params.depth + 1,
        parent_vpath: Some(&member_vpath),
        password: params.password,
    };
    let walked = probe_walk(shared, &nested_source, None, &nested_params, ctx, staged);
    ctx.pop();
    walked?;

    // The nested archive itself stays in the cache, hidden, so readers of
    // its members can rebuild the extraction chain through it.
    let entry = FileCacheEntry {
        archive_path: params.archive_host.to_owned(),
        member_name: clean.to_owned(),
        stat: EntryStat {
            ino: 0,
            mode: libc::S_IFREG | 0o644,
            size: block.unpacked_size,
            mtime: block.mtime,
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            nlink: 1,
        },
        method: block.method,
        flags: EntryFlags::IS_NESTED_RAR,
        nested_depth: params.depth,
        hide_from_listing: true,
        parent_archive_path: params.parent_vpath.map(PathBuf::from),
        ..Default::default()
    };
    stage_member(staged, params.vdir, name, entry, true);
    Ok(())
}

/// Listing fallback for archives whose headers only the decoder can read.
fn probe_encrypted_listing(
    shared: &Shared,
    source: &ArchiveSource,
    params: &WalkParams,
    staged: &mut StagedProbe,
) -> Result<(), Error> {
    let password = params
        .password
        .ok_or_else(|| format_err!("archive headers are encrypted and no password is configured"))?;
    let mut handle =
        open_with_timeout(&shared.decoder, source, Some(password), DECODER_OPEN_TIMEOUT)?;
    let mut count = 0usize;
    while let Some(header) = handle.next_header()? {
        count += 1;
        if count > MAX_LISTING_ENTRIES {
            bail!("listing exceeds {} entries", MAX_LISTING_ENTRIES);
        }
        let Some(name) = sanitize_member_path(&header.name_raw) else {
            continue;
        };
        if shared.opts.flat_only() && (header.directory || name.contains('/')) {
            continue;
        }
        let entry = FileCacheEntry {
            archive_path: params.archive_host.to_owned(),
            member_name: name.clone(),
            stat: EntryStat {
                ino: 0,
                mode: if header.directory {
                    libc::S_IFDIR | 0o755
                } else {
                    libc::S_IFREG | 0o644
                },
                size: header.unpacked_size,
                mtime: 0,
                uid: unsafe { libc::geteuid() },
                gid: unsafe { libc::getegid() },
                nlink: if header.directory { 2 } else { 1 },
            },
            method: 0xff,
            flags: base_flags(shared, params) | EntryFlags::ENCRYPTED,
            nested_depth: params.depth,
            parent_archive_path: params.parent_vpath.map(PathBuf::from),
            ..Default::default()
        };
        stage_member(staged, params.vdir, &name, entry, false);
    }
    Ok(())
}

fn stage_from_index(
    shared: &Shared,
    entries: Vec<index::IndexEntry>,
    params: &WalkParams,
    staged: &mut StagedProbe,
) {
    for indexed in entries {
        let name = shared
            .config
            .lock()
            .unwrap()
            .alias_for(params.archive_host, &indexed.name)
            .map(str::to_owned)
            .unwrap_or_else(|| indexed.name.clone());
        if shared.opts.flat_only() && (indexed.directory || name.contains('/')) {
            continue;
        }
        let mode = match indexed.unix_mode {
            Some(mode) if mode & libc::S_IFMT != 0 => mode,
            _ if indexed.directory => libc::S_IFDIR | 0o755,
            Some(mode) => libc::S_IFREG | (mode & 0o7777),
            None => libc::S_IFREG | 0o644,
        };
        let mut flags = base_flags(shared, params);
        if indexed.raw {
            flags |= EntryFlags::RAW | EntryFlags::VSIZE_RESOLVED | EntryFlags::DRY_RUN_DONE;
        }
        if indexed.encrypted {
            flags |= EntryFlags::ENCRYPTED;
        }
        if indexed.multipart {
            flags |= EntryFlags::MULTIPART;
        }
        let entry = FileCacheEntry {
            archive_path: params.archive_host.to_owned(),
            member_name: indexed.name,
            link_target: indexed.link_target,
            stat: EntryStat {
                ino: 0,
                mode,
                size: indexed.size,
                mtime: indexed.mtime,
                uid: unsafe { libc::geteuid() },
                gid: unsafe { libc::getegid() },
                nlink: if indexed.directory { 2 } else { 1 },
            },
            method: indexed.method,
            geometry: indexed.geometry,
            flags,
            ..Default::default()
        };
        stage_member(staged, params.vdir, &name, entry, false);
    }
}

/// Stage one member record plus the directory-cache entries for it and any
/// intermediate virtual directories. `name` is relative to `vdir`, the
/// directory the archive lives in (members flatten into it).
fn stage_member(staged: &mut StagedProbe, vdir: &str, name: &str, entry: FileCacheEntry, hidden: bool) {
    let mut dir = vdir.to_owned();
    let parts: Vec<&str> = name.split('/').collect();
    for part in &parts[..parts.len().saturating_sub(1)] {
        let child = vpath_join(&dir, part);
        if staged.dirs_seen.insert(child.clone()) {
            let stat = EntryStat {
                ino: 0,
                mode: libc::S_IFDIR | 0o755,
                size: 0,
                mtime: entry.stat.mtime,
                uid: entry.stat.uid,
                gid: entry.stat.gid,
                nlink: 2,
            };
            staged
                .dir_adds
                .push((dir.clone(), (*part).to_owned(), EntryKind::Directory, stat));
            staged.files.push((
                child.clone(),
                FileCacheEntry {
                    archive_path: entry.archive_path.clone(),
                    member_name: String::new(),
                    stat,
                    flags: EntryFlags::FORCE_DIR,
                    nested_depth: entry.nested_depth,
                    parent_archive_path: entry.parent_archive_path.clone(),
                    ..Default::default()
                },
            ));
        }
        dir = child;
    }

    let leaf = parts.last().copied().unwrap_or(name);
    let vpath = vpath_join(&dir, leaf);
    if !hidden && !entry.hide_from_listing {
        staged
            .dir_adds
            .push((dir, leaf.to_owned(), kind_for_entry(&entry), entry.stat));
    }
    staged.files.push((vpath, entry));
}

fn kind_for_entry(entry: &FileCacheEntry) -> EntryKind {
    if entry.is_dir() {
        EntryKind::Directory
    } else if entry.stat.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::Regular
    }
}
