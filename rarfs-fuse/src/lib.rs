//! The mounted filesystem: caches, probing, read engine and the kernel
//! callback layer.
//!
//! Everything here hangs off one [`Shared`] owner object created at mount
//! time: the filename and directory caches behind a single process-wide
//! reader/writer lock, the per-archive configuration table, the options
//! registry and the decoder. Kernel callbacks are forwarded onto the tokio
//! runtime so parallel requests are served concurrently; request handlers
//! are async functions returning `Result` and errno mapping happens in one
//! place.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use rarfs_config::{ConfigDb, Options};

pub mod decoder;
pub mod dirlist;
pub mod filecache;
pub mod inode;
pub mod prober;
pub mod reader;
pub mod recursion;
pub mod session;

pub use session::Session;

use dirlist::DirCache;
use filecache::FileCache;

/// Both path-keyed caches, guarded together by one reader/writer lock.
#[derive(Default)]
pub struct Caches {
    pub files: FileCache,
    pub dirs: DirCache,
}

/// The owner object every component borrows.
pub struct Shared {
    pub opts: Options,
    /// Canonicalized source root.
    pub source: PathBuf,
    pub cache: RwLock<Caches>,
    pub config: Mutex<ConfigDb>,
    pub decoder: Arc<dyn decoder::Decoder>,
}

impl Shared {
    pub fn new(
        opts: Options,
        source: PathBuf,
        config: ConfigDb,
        decoder: Arc<dyn decoder::Decoder>,
    ) -> Self {
        Shared {
            opts,
            source,
            cache: RwLock::new(Caches::default()),
            config: Mutex::new(config),
            decoder,
        }
    }

    /// Host path backing a virtual path.
    pub fn host_path(&self, vpath: &str) -> PathBuf {
        self.source.join(vpath.trim_start_matches('/'))
    }
}

/// Join a virtual directory and a child name.
pub fn vpath_join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent of a virtual path ("/" is its own parent).
pub fn vpath_parent(vpath: &str) -> &str {
    match vpath.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &vpath[..pos],
    }
}

/// Final component of a virtual path.
pub fn vpath_name(vpath: &str) -> &str {
    vpath.rsplit('/').next().unwrap_or("")
}
