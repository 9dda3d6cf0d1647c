//! Mount RAR archive sets as a read-only filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use rarfs_config::{ConfigDb, Options};
use rarfs_fuse::decoder::UnrarDecoder;
use rarfs_fuse::{Session, Shared};

#[derive(Debug, Parser)]
#[command(
    name = "rarfs",
    about = "Mount the contents of RAR archives as ordinary files.",
    version
)]
struct Cli {
    /// Host directory whose contents (including archives) are exposed.
    source: PathBuf,

    /// Empty directory to mount the filesystem on.
    mountpoint: PathBuf,

    /// Bytes of forward seek absorbed by draining the pipe; 0 forces a
    /// restart on every forward jump.
    #[arg(long, value_name = "BYTES")]
    seek_length: Option<u64>,

    /// Always run extraction to completion so lying archives are caught.
    #[arg(long)]
    save_eof: bool,

    /// Do not materialize archive subdirectories; top-level members only.
    #[arg(long)]
    flat_only: bool,

    /// Never memory-map sidecar index files.
    #[arg(long)]
    no_idx_mmap: bool,

    /// Serve opens with direct I/O (bypass the kernel page cache).
    #[arg(long)]
    direct_io: bool,

    /// Unpack archives found inside archives.
    #[arg(long)]
    recursive: bool,

    /// Nested unpacking depth limit (1-10).
    #[arg(long, value_name = "N")]
    recursion_depth: Option<u8>,

    /// Cumulative unpack budget for one recursive chain, in bytes.
    #[arg(long, value_name = "BYTES")]
    max_unpack_size: Option<u64>,

    /// Worker threads servicing filesystem callbacks.
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Mount options forwarded to the kernel bridge (comma separated,
    /// may be given multiple times).
    #[arg(short = 'o', long = "fuse-option", value_name = "OPTS")]
    fuse_options: Vec<String>,

    /// More logging; repeat for trace output.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_options(self) -> Options {
        Options {
            source: self.source,
            mountpoint: self.mountpoint,
            seek_length: self.seek_length,
            save_eof: self.save_eof.then_some(true),
            direct_io: self.direct_io.then_some(true),
            flat_only: self.flat_only.then_some(true),
            no_idx_mmap: self.no_idx_mmap.then_some(true),
            threads: self.threads,
            recursive: self.recursive.then_some(true),
            recursion_depth: self.recursion_depth,
            max_unpack_size: self.max_unpack_size,
            fuse_options: self.fuse_options,
        }
    }
}

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_MOUNT: i32 = 2;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(EXIT_CONFIG);
        }
    };

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RARFS_LOG", default_level))
        .init();

    let shared = match setup(cli) {
        Ok(shared) => shared,
        Err(err) => {
            log::error!("{:#}", err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    match serve(shared) {
        Ok(()) => std::process::exit(EXIT_OK),
        Err(err) => {
            log::error!("mount failed: {:#}", err);
            std::process::exit(EXIT_MOUNT);
        }
    }
}

/// Everything that can fail here is a configuration error.
fn setup(cli: Cli) -> Result<Arc<Shared>, Error> {
    let opts = cli.into_options();
    opts.validate()?;

    let source = opts
        .source
        .canonicalize()
        .map_err(|err| format_err!("source {}: {}", opts.source.display(), err))?;
    if !source.is_dir() {
        bail!("source {} is not a directory", source.display());
    }
    if !opts.mountpoint.is_dir() {
        bail!("mountpoint {} is not a directory", opts.mountpoint.display());
    }

    let config = ConfigDb::load(&source)
        .map_err(|err| format_err!("cannot read .rarconfig: {}", err))?;

    Ok(Arc::new(Shared::new(
        opts,
        source,
        config,
        Arc::new(UnrarDecoder),
    )))
}

fn serve(shared: Arc<Shared>) -> Result<(), Error> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = shared.opts.threads() {
        builder.worker_threads(threads);
    }
    let runtime = builder.build()?;

    runtime.block_on(async {
        let session = Session::mount(Arc::clone(&shared), tokio::runtime::Handle::current())?;

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => log::debug!("interrupted"),
            _ = terminate.recv() => log::debug!("terminated"),
        }

        // Dropping the session unmounts and tears down open handles.
        drop(session);
        Ok(())
    })
}
