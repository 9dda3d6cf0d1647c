//! Mount configuration.
//!
//! Two layers: the process-wide options registry filled from the command
//! line exactly once before any filesystem callback runs, and the optional
//! `.rarconfig` file in the source root that binds passwords, tuning knobs
//! and member aliases to individual archives.

pub mod options;
pub mod rarconfig;

mod parse;

pub use options::{Options, DEFAULT_MAX_UNPACK_SIZE, DEFAULT_RECURSION_DEPTH, DEFAULT_SEEK_LENGTH, MAX_RECURSION_DEPTH};
pub use rarconfig::{ArchiveConfig, ConfigDb};
