//! The kernel callback layer.
//!
//! `RarFs` implements the bridge's `Filesystem` trait by forwarding every
//! request onto the tokio runtime and replying from the spawned task, so
//! callbacks dispatched in parallel are served in parallel. The actual
//! handlers live on `SessionImpl` as async functions returning `Result`;
//! errno mapping happens in exactly one place. Any `io::Error` fails the
//! single request, anything else is an internal error reported as `EIO`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Error;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyXattr,
    Request,
};
use tokio::runtime::Handle;

use rarfs_format::method_name;

use crate::dirlist::EntryKind;
use crate::filecache::{EntryFlags, EntryStat, FileCacheEntry, Lookup};
use crate::inode::InodeTable;
use crate::prober;
use crate::reader::{IoHandle, PassReader, PipedReader, ProducerSpec, RawReader};
use crate::{vpath_join, vpath_name, vpath_parent, Shared};

const TTL: Duration = Duration::from_secs(1);

/// FUSE open flag: bypass the kernel page cache for this file.
const FOPEN_DIRECT_IO: u32 = 1 << 0;

/// The one extended attribute archive-backed files carry.
const XATTR_METHOD: &str = "user.method";

macro_rules! io_return {
    ($errno:expr) => {
        return Err(::std::io::Error::from_raw_os_error($errno).into())
    };
}

fn errno_of(err: &Error) -> i32 {
    match err.downcast_ref::<std::io::Error>() {
        Some(io_err) => io_err.raw_os_error().unwrap_or(libc::EIO),
        None => {
            log::error!("internal error: {:#}", err);
            libc::EIO
        }
    }
}

enum Resolved {
    Passthrough(PathBuf),
    Entry(FileCacheEntry),
}

struct AtimeRestore {
    path: PathBuf,
    atime: (i64, i64),
    mtime: (i64, i64),
}

struct FileHandleState {
    io: IoHandle,
    size: u64,
    atime_restore: Option<AtimeRestore>,
}

struct DirEntryOut {
    ino: u64,
    kind: FileType,
    name: String,
}

pub struct SessionImpl {
    shared: Arc<Shared>,
    runtime: Handle,
    inodes: Mutex<InodeTable>,
    next_fh: AtomicU64,
    file_handles: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<FileHandleState>>>>,
    dir_handles: Mutex<HashMap<u64, Arc<Vec<DirEntryOut>>>>,
}

impl SessionImpl {
    pub fn new(shared: Arc<Shared>, runtime: Handle) -> Self {
        SessionImpl {
            shared,
            runtime,
            inodes: Mutex::new(InodeTable::default()),
            next_fh: AtomicU64::new(1),
            file_handles: Mutex::new(HashMap::new()),
            dir_handles: Mutex::new(HashMap::new()),
        }
    }

    fn vpath_of(&self, ino: u64) -> Result<String, Error> {
        match self.inodes.lock().unwrap().path_of(ino) {
            Some(vpath) => Ok(vpath.to_owned()),
            None => io_return!(libc::ENOENT),
        }
    }

    fn ino_for(&self, vpath: &str) -> u64 {
        self.inodes.lock().unwrap().ino_for(vpath)
    }

    /// Resolve a virtual path against the caches, materializing the parent
    /// directory lazily: a light pass first (enough for passthrough hits),
    /// the full archive probe only when the light pass did not answer.
    async fn resolve(&self, vpath: &str) -> Result<Resolved, Error> {
        if vpath == "/" {
            return Ok(Resolved::Passthrough(self.shared.source.clone()));
        }
        for pass in 0..3u8 {
            {
                let cache = self.shared.cache.read().unwrap();
                match cache.files.get(vpath) {
                    Lookup::Entry(entry) if entry.flags.contains(EntryFlags::DETECTION_DEFERRED) => {
                        // Needs the full pass below.
                    }
                    Lookup::Entry(entry) if entry.hide_from_listing => io_return!(libc::ENOENT),
                    Lookup::Entry(entry) => return Ok(Resolved::Entry(entry.clone())),
                    Lookup::Local => {
                        return Ok(Resolved::Passthrough(self.shared.host_path(vpath)))
                    }
                    Lookup::Loop => io_return!(libc::ENOENT),
                    Lookup::Miss => {}
                }
            }
            if pass == 2 {
                break;
            }
            let parent = vpath_parent(vpath).to_owned();
            let shared = Arc::clone(&self.shared);
            let full = pass == 1;
            tokio::task::block_in_place(move || prober::materialize_dir(&shared, &parent, full))?;
        }
        io_return!(libc::ENOENT)
    }

    async fn stat_of(&self, vpath: &str, resolved: &Resolved) -> Result<EntryStat, Error> {
        let ino = self.ino_for(vpath);
        match resolved {
            Resolved::Entry(entry) => {
                let mut stat = entry.stat;
                stat.ino = ino;
                Ok(stat)
            }
            Resolved::Passthrough(host) => {
                let meta = std::fs::symlink_metadata(host)?;
                use std::os::unix::fs::MetadataExt;
                Ok(EntryStat {
                    ino,
                    mode: meta.mode(),
                    size: meta.len(),
                    mtime: meta.mtime(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    nlink: meta.nlink() as u32,
                })
            }
        }
    }

    async fn getattr_impl(&self, ino: u64) -> Result<FileAttr, Error> {
        let vpath = self.vpath_of(ino)?;
        let resolved = self.resolve(&vpath).await?;
        let stat = self.stat_of(&vpath, &resolved).await?;
        Ok(to_file_attr(&stat))
    }

    async fn lookup_impl(&self, parent: u64, name: &OsStr) -> Result<FileAttr, Error> {
        let parent_vpath = self.vpath_of(parent)?;
        let Some(name) = name.to_str() else {
            io_return!(libc::ENOENT);
        };
        let vpath = vpath_join(&parent_vpath, name);
        let resolved = self.resolve(&vpath).await?;
        let stat = self.stat_of(&vpath, &resolved).await?;
        Ok(to_file_attr(&stat))
    }

    async fn readlink_impl(&self, ino: u64) -> Result<Vec<u8>, Error> {
        let vpath = self.vpath_of(ino)?;
        match self.resolve(&vpath).await? {
            Resolved::Entry(entry) => match entry.link_target {
                Some(target) => Ok(target.into_bytes()),
                None => io_return!(libc::EINVAL),
            },
            Resolved::Passthrough(host) => {
                let target = std::fs::read_link(&host)?;
                Ok(target.into_os_string().into_encoded_bytes())
            }
        }
    }

    /// Walk `parent_archive_path` links into the ordered chain of nested
    /// archive member names, outermost first.
    fn nested_chain(&self, entry: &FileCacheEntry) -> Vec<String> {
        let cache = self.shared.cache.read().unwrap();
        let mut chain = Vec::new();
        let mut cursor = entry.parent_archive_path.clone();
        let mut steps = 0u8;
        while let Some(vpath) = cursor {
            steps += 1;
            if steps > rarfs_config::MAX_RECURSION_DEPTH {
                break;
            }
            let Some(vpath) = vpath.to_str() else { break };
            match cache.files.get(vpath) {
                Lookup::Entry(parent) => {
                    chain.push(parent.member_name.clone());
                    cursor = parent.parent_archive_path.clone();
                }
                _ => break,
            }
        }
        chain.reverse();
        chain
    }

    /// Attempt to resolve deferred spanning geometry by re-probing the
    /// archive, then re-fetch the entry.
    fn ensure_geometry(&self, vpath: &str, entry: &FileCacheEntry) -> FileCacheEntry {
        let vdir = member_vdir(vpath, &entry.member_name);
        let archive_name = entry
            .archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        let archive_vpath = vpath_join(&vdir, &archive_name);
        prober::probe_and_commit(&self.shared, &entry.archive_path, &vdir, &archive_vpath);

        let cache = self.shared.cache.read().unwrap();
        match cache.files.get(vpath) {
            Lookup::Entry(fresh) => fresh.clone(),
            _ => entry.clone(),
        }
    }

    async fn open_impl(&self, ino: u64, flags: i32) -> Result<(u64, u32), Error> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            io_return!(libc::EROFS);
        }
        let vpath = self.vpath_of(ino)?;
        let (io, size, atime_restore, direct_io) = match self.resolve(&vpath).await? {
            Resolved::Passthrough(host) => {
                let reader = tokio::task::block_in_place(|| PassReader::open(&host))?;
                let size = std::fs::metadata(&host).map(|m| m.len()).unwrap_or(0);
                (IoHandle::Pass(reader), size, None, false)
            }
            Resolved::Entry(mut entry) => {
                if entry.is_dir() {
                    io_return!(libc::EISDIR);
                }
                let password = self
                    .shared
                    .config
                    .lock()
                    .unwrap()
                    .password(&entry.archive_path)
                    .map(str::to_owned);
                if entry.flags.contains(EntryFlags::ENCRYPTED) && password.is_none() {
                    io_return!(libc::EACCES);
                }

                if entry.flags.contains(EntryFlags::RAW)
                    && entry.flags.contains(EntryFlags::VSIZE_FIXUP_NEEDED)
                {
                    entry = tokio::task::block_in_place(|| self.ensure_geometry(&vpath, &entry));
                }

                let atime_restore = entry
                    .flags
                    .contains(EntryFlags::CHECK_ATIME)
                    .then(|| capture_atime(&entry.archive_path))
                    .flatten();

                let size = entry.stat.size;
                if entry.flags.contains(EntryFlags::RAW)
                    && entry.flags.contains(EntryFlags::VSIZE_RESOLVED)
                {
                    let reader = RawReader::new(&entry)?;
                    let direct = entry.flags.contains(EntryFlags::DIRECT_IO);
                    (IoHandle::Raw(reader), size, atime_restore, direct)
                } else {
                    let save_eof = self.save_eof_for(&vpath, &entry);
                    let seek_length = self
                        .shared
                        .config
                        .lock()
                        .unwrap()
                        .seek_length(&entry.archive_path)
                        .unwrap_or_else(|| self.shared.opts.seek_length());
                    let spec = ProducerSpec {
                        decoder: Arc::clone(&self.shared.decoder),
                        archive: entry.archive_path.clone(),
                        chain: self.nested_chain(&entry),
                        member: entry.member_name.clone(),
                        password,
                        save_eof,
                        declared_size: size,
                    };
                    let reader = PipedReader::new(spec, seek_length);
                    let direct = entry.flags.contains(EntryFlags::DIRECT_IO) || save_eof;
                    (IoHandle::Piped(reader), size, atime_restore, direct)
                }
            }
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        let state = FileHandleState {
            io,
            size,
            atime_restore,
        };
        self.file_handles
            .lock()
            .unwrap()
            .insert(fh, Arc::new(tokio::sync::Mutex::new(state)));
        let open_flags = if direct_io || self.shared.opts.direct_io() {
            FOPEN_DIRECT_IO
        } else {
            0
        };
        Ok((fh, open_flags))
    }

    /// Media containers are notorious for declared sizes the archive got
    /// wrong; the first open of one turns save-eof on for the entry.
    fn save_eof_for(&self, vpath: &str, entry: &FileCacheEntry) -> bool {
        if entry.flags.contains(EntryFlags::SAVE_EOF) {
            return true;
        }
        if entry.flags.contains(EntryFlags::AVI_TESTED) {
            return false;
        }
        let name = vpath_name(vpath).to_ascii_lowercase();
        let looks_like_media = name.ends_with(".avi") || name.ends_with(".mkv");
        let mut cache = self.shared.cache.write().unwrap();
        if let Some(cached) = cache.files.get_mut(vpath) {
            cached.flags |= EntryFlags::AVI_TESTED;
            if looks_like_media {
                cached.flags |= EntryFlags::SAVE_EOF;
            }
        }
        looks_like_media
    }

    fn handle_of(&self, fh: u64) -> Result<Arc<tokio::sync::Mutex<FileHandleState>>, Error> {
        match self.file_handles.lock().unwrap().get(&fh) {
            Some(state) => Ok(Arc::clone(state)),
            None => io_return!(libc::EBADF),
        }
    }

    async fn read_impl(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, Error> {
        if offset < 0 {
            io_return!(libc::EINVAL);
        }
        let state = self.handle_of(fh)?;
        let mut guard = state.lock().await;
        let data = guard.io.read(offset as u64, size as usize).await?;
        Ok(data)
    }

    async fn release_impl(&self, fh: u64) -> Result<(), Error> {
        let state = match self.file_handles.lock().unwrap().remove(&fh) {
            Some(state) => state,
            None => return Ok(()),
        };
        let state = match Arc::try_unwrap(state) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => {
                // A racing read still holds the handle; wait our turn.
                let _unused = shared.lock().await;
                log::warn!("release raced with an in-flight read on fh {}", fh);
                return Ok(());
            }
        };
        if let Some(restore) = &state.atime_restore {
            restore_atime(restore);
        }
        state.io.release().await;
        Ok(())
    }

    async fn opendir_impl(&self, ino: u64) -> Result<u64, Error> {
        let vpath = self.vpath_of(ino)?;
        let resolved = self.resolve(&vpath).await?;
        match &resolved {
            Resolved::Entry(entry) if !entry.is_dir() => io_return!(libc::ENOTDIR),
            Resolved::Passthrough(host) => {
                if host != &self.shared.source && !host.is_dir() {
                    io_return!(libc::ENOTDIR);
                }
            }
            _ => {}
        }

        let shared = Arc::clone(&self.shared);
        let vdir = vpath.clone();
        tokio::task::block_in_place(move || prober::materialize_dir(&shared, &vdir, true))?;

        let mut snapshot = vec![
            DirEntryOut {
                ino,
                kind: FileType::Directory,
                name: ".".to_owned(),
            },
            DirEntryOut {
                ino: self.ino_for(vpath_parent(&vpath)),
                kind: FileType::Directory,
                name: "..".to_owned(),
            },
        ];
        {
            let cache = self.shared.cache.read().unwrap();
            if let Some(dir) = cache.dirs.get(&vpath) {
                let mut inodes = self.inodes.lock().unwrap();
                for entry in dir.list.iter_valid() {
                    let child = vpath_join(&vpath, &entry.name);
                    snapshot.push(DirEntryOut {
                        ino: inodes.ino_for(&child),
                        kind: kind_to_file_type(entry.kind),
                        name: entry.name.clone(),
                    });
                }
            }
        }

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.dir_handles
            .lock()
            .unwrap()
            .insert(fh, Arc::new(snapshot));
        Ok(fh)
    }

    fn dir_snapshot(&self, fh: u64) -> Option<Arc<Vec<DirEntryOut>>> {
        self.dir_handles.lock().unwrap().get(&fh).map(Arc::clone)
    }

    async fn lseek_impl(&self, fh: u64, offset: i64, whence: i32) -> Result<i64, Error> {
        let state = self.handle_of(fh)?;
        let guard = state.lock().await;
        let size = guard.size as i64;
        let logical = guard.io.logical_offset() as i64;
        let target = match whence {
            libc::SEEK_SET => offset,
            libc::SEEK_CUR => logical.checked_add(offset).unwrap_or(-1),
            libc::SEEK_END => size.checked_add(offset).unwrap_or(-1),
            libc::SEEK_DATA => {
                // Archive members have no holes: data everywhere short of
                // the end, one implicit hole at it.
                if offset < size {
                    offset
                } else {
                    io_return!(libc::ENXIO);
                }
            }
            libc::SEEK_HOLE => {
                if offset < size {
                    size
                } else {
                    io_return!(libc::ENXIO);
                }
            }
            _ => io_return!(libc::EINVAL),
        };
        if target < 0 {
            io_return!(libc::EINVAL);
        }
        Ok(target)
    }

    async fn getxattr_impl(&self, ino: u64, name: &OsStr, size: u32) -> Result<XattrReply, Error> {
        let vpath = self.vpath_of(ino)?;
        let entry = match self.resolve(&vpath).await? {
            Resolved::Entry(entry) => entry,
            Resolved::Passthrough(_) => io_return!(libc::ENODATA),
        };
        if name.to_str() != Some(XATTR_METHOD) {
            io_return!(libc::ENODATA);
        }
        let value = method_name(entry.method).as_bytes().to_vec();
        if size == 0 {
            return Ok(XattrReply::Size(value.len() as u32));
        }
        if (size as usize) < value.len() {
            io_return!(libc::ERANGE);
        }
        Ok(XattrReply::Data(value))
    }

    async fn statfs_impl(&self) -> Result<nix::sys::statvfs::Statvfs, Error> {
        let source = self.shared.source.clone();
        let stat = tokio::task::block_in_place(move || nix::sys::statvfs::statvfs(&source))?;
        Ok(stat)
    }
}

enum XattrReply {
    Size(u32),
    Data(Vec<u8>),
}

fn capture_atime(path: &std::path::Path) -> Option<AtimeRestore> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some(AtimeRestore {
        path: path.to_owned(),
        atime: (meta.atime(), meta.atime_nsec()),
        mtime: (meta.mtime(), meta.mtime_nsec()),
    })
}

fn restore_atime(restore: &AtimeRestore) {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;
    let atime = TimeSpec::new(restore.atime.0, restore.atime.1);
    let mtime = TimeSpec::new(restore.mtime.0, restore.mtime.1);
    if let Err(err) = utimensat(
        None,
        &restore.path,
        &atime,
        &mtime,
        UtimensatFlags::NoFollowSymlink,
    ) {
        log::debug!(
            "cannot restore atime of {}: {}",
            restore.path.display(),
            err
        );
    }
}

/// Directory of a member's virtual path, accounting for member names with
/// subdirectory components.
fn member_vdir(vpath: &str, member_name: &str) -> String {
    if !member_name.is_empty() {
        if let Some(stripped) = vpath.strip_suffix(member_name) {
            let dir = stripped.trim_end_matches('/');
            return if dir.is_empty() {
                "/".to_owned()
            } else {
                dir.to_owned()
            };
        }
    }
    // Aliased members keep their directory, so component count still holds.
    let mut dir = vpath;
    for _ in member_name.split('/') {
        dir = vpath_parent(dir);
    }
    dir.to_owned()
}

fn kind_to_file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::Regular => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::Other => FileType::RegularFile,
    }
}

fn to_file_attr(stat: &EntryStat) -> FileAttr {
    let kind = match stat.mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    };
    let mtime = system_time(stat.mtime);
    FileAttr {
        ino: stat.ino,
        size: stat.size,
        blocks: stat.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn system_time(secs: i64) -> SystemTime {
    if secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    }
}

/// The mounted filesystem: forwards callbacks onto the runtime.
pub struct RarFs {
    inner: Arc<SessionImpl>,
}

impl RarFs {
    pub fn new(shared: Arc<Shared>, runtime: Handle) -> Self {
        RarFs {
            inner: Arc::new(SessionImpl::new(shared, runtime)),
        }
    }

    fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.runtime.spawn(fut);
    }
}

impl Filesystem for RarFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        self.spawn(async move {
            match inner.lookup_impl(parent, &name).await {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.getattr_impl(ino).await {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.readlink_impl(ino).await {
                Ok(target) => reply.data(&target),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.open_impl(ino, flags).await {
                Ok((fh, open_flags)) => reply.opened(fh, open_flags),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.read_impl(fh, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.release_impl(fh).await {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.opendir_impl(ino).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let snapshot = match self.inner.dir_snapshot(fh) {
            Some(snapshot) => snapshot,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        for (index, entry) in snapshot.iter().enumerate().skip(offset as usize) {
            if reply.add(entry.ino, index as i64 + 1, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.inner.dir_handles.lock().unwrap().remove(&fh);
        reply.ok();
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let inner = Arc::clone(&self.inner);
        let name = name.to_owned();
        self.spawn(async move {
            match inner.getxattr_impl(ino, &name, size).await {
                Ok(XattrReply::Size(len)) => reply.size(len),
                Ok(XattrReply::Data(data)) => reply.data(&data),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.statfs_impl().await {
                Ok(stat) => reply.statfs(
                    stat.blocks(),
                    stat.blocks_free(),
                    stat.blocks_available(),
                    stat.files(),
                    stat.files_free(),
                    stat.block_size() as u32,
                    stat.name_max() as u32,
                    stat.fragment_size() as u32,
                ),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            match inner.lseek_impl(fh, offset, whence).await {
                Ok(target) => reply.offset(target),
                Err(err) => reply.error(errno_of(&err)),
            }
        });
    }
}

/// A mounted session; dropping it unmounts.
pub struct Session {
    background: fuser::BackgroundSession,
}

impl Session {
    /// Mount at `opts.mountpoint`. The mountpoint-inside-source case is
    /// fenced off with a dead-path sentinel so walks cannot recurse into
    /// the mount itself.
    pub fn mount(shared: Arc<Shared>, runtime: Handle) -> Result<Session, Error> {
        let mountpoint = shared.opts.mountpoint.clone();
        if let Ok(canonical) = mountpoint.canonicalize() {
            if let Ok(relative) = canonical.strip_prefix(&shared.source) {
                if let Some(relative) = relative.to_str().filter(|r| !r.is_empty()) {
                    let vpath = format!("/{}", relative);
                    shared.cache.write().unwrap().files.insert_loop(&vpath);
                    log::warn!(
                        "mountpoint lies inside the source tree, hiding {}",
                        vpath
                    );
                }
            }
        }

        let options = mount_options(&shared);
        let fs = RarFs::new(shared, runtime);
        let background = fuser::spawn_mount2(fs, &mountpoint, &options)?;
        Ok(Session { background })
    }

    /// Block until the filesystem is unmounted.
    pub fn join(self) {
        self.background.join();
    }
}

fn mount_options(shared: &Shared) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("rarfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    for raw in &shared.opts.fuse_options {
        for part in raw.split(',').filter(|p| !p.is_empty()) {
            options.push(match part {
                "allow_other" => MountOption::AllowOther,
                "allow_root" => MountOption::AllowRoot,
                "auto_unmount" => MountOption::AutoUnmount,
                "noatime" => MountOption::NoAtime,
                "sync" => MountOption::Sync,
                other => MountOption::CUSTOM(other.to_owned()),
            });
        }
    }
    options
}
