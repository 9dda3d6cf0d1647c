//! The options registry.
//!
//! A typed key/value store in struct clothing: every knob keeps its "was it
//! given" bit by being an `Option`, and the accessors fold in the defaults.
//! The registry is built at startup, validated once, then shared read-only;
//! nothing writes to it after callbacks are registered.

use std::path::PathBuf;

use anyhow::{bail, Error};

/// Absolute ceiling on nested-archive depth.
pub const MAX_RECURSION_DEPTH: u8 = 10;

/// Default nested-archive depth when `--recursive` is given.
pub const DEFAULT_RECURSION_DEPTH: u8 = 5;

/// Default cumulative unpack budget for one recursive chain: 10 GiB.
pub const DEFAULT_MAX_UNPACK_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default forward-seek window absorbed by draining the pipe: 1 MiB.
pub const DEFAULT_SEEK_LENGTH: u64 = 1024 * 1024;

/// Everything the mount was started with.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Host directory whose contents are exposed.
    pub source: PathBuf,
    /// Empty directory the filesystem is mounted on.
    pub mountpoint: PathBuf,

    pub seek_length: Option<u64>,
    pub save_eof: Option<bool>,
    pub direct_io: Option<bool>,
    pub flat_only: Option<bool>,
    pub no_idx_mmap: Option<bool>,
    pub threads: Option<usize>,
    pub recursive: Option<bool>,
    pub recursion_depth: Option<u8>,
    pub max_unpack_size: Option<u64>,
    /// Raw `-o`/`--fuse-*` strings forwarded to the kernel bridge.
    pub fuse_options: Vec<String>,
}

impl Options {
    /// Validate ranges; called once at startup so violations are
    /// configuration errors, not runtime surprises.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(depth) = self.recursion_depth {
            if depth < 1 || depth > MAX_RECURSION_DEPTH {
                bail!(
                    "recursion-depth must be within 1..={}, got {}",
                    MAX_RECURSION_DEPTH,
                    depth
                );
            }
        }
        if self.max_unpack_size == Some(0) {
            bail!("max-unpack-size must be positive");
        }
        if self.threads == Some(0) {
            bail!("thread count must be positive");
        }
        Ok(())
    }

    /// Forward-seek drain window in bytes; 0 disables draining entirely.
    pub fn seek_length(&self) -> u64 {
        self.seek_length.unwrap_or(DEFAULT_SEEK_LENGTH)
    }

    pub fn save_eof(&self) -> bool {
        self.save_eof.unwrap_or(false)
    }

    pub fn direct_io(&self) -> bool {
        self.direct_io.unwrap_or(false)
    }

    pub fn flat_only(&self) -> bool {
        self.flat_only.unwrap_or(false)
    }

    /// Whether sidecar indexes may be memory-mapped.
    pub fn idx_mmap(&self) -> bool {
        !self.no_idx_mmap.unwrap_or(false)
    }

    pub fn recursive(&self) -> bool {
        self.recursive.unwrap_or(false)
    }

    pub fn recursion_depth(&self) -> u8 {
        self.recursion_depth
            .unwrap_or(DEFAULT_RECURSION_DEPTH)
            .min(MAX_RECURSION_DEPTH)
    }

    pub fn max_unpack_size(&self) -> u64 {
        self.max_unpack_size.unwrap_or(DEFAULT_MAX_UNPACK_SIZE)
    }

    /// Worker threads for the runtime; defaults to what the runtime picks.
    pub fn threads(&self) -> Option<usize> {
        self.threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let opts = Options::default();
        assert_eq!(opts.seek_length(), DEFAULT_SEEK_LENGTH);
        assert!(!opts.save_eof());
        assert!(!opts.recursive());
        assert_eq!(opts.recursion_depth(), DEFAULT_RECURSION_DEPTH);
        assert_eq!(opts.max_unpack_size(), DEFAULT_MAX_UNPACK_SIZE);
        assert!(opts.idx_mmap());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn explicit_values_win() {
        let opts = Options {
            seek_length: Some(0),
            no_idx_mmap: Some(true),
            recursion_depth: Some(7),
            ..Default::default()
        };
        assert_eq!(opts.seek_length(), 0);
        assert!(!opts.idx_mmap());
        assert_eq!(opts.recursion_depth(), 7);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let opts = Options {
            recursion_depth: Some(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        let opts = Options {
            recursion_depth: Some(11),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        let opts = Options {
            max_unpack_size: Some(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
        let opts = Options {
            threads: Some(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
