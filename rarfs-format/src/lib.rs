//! RAR container parsing.
//!
//! This crate knows the byte layout of RAR archives (both the classic v1.5+
//! format and RAR5), the volume naming schemes used by segmented sets, and
//! the geometry needed to read stored members straight out of volume files
//! without a decoder. It operates on anything `Read + Seek` so the same
//! walker serves on-disk volumes and in-memory buffers alike.

pub mod block;
pub mod fingerprint;
pub mod geometry;
pub mod index;
pub mod path;
pub mod vint;
pub mod volume;

mod rar15;
mod rar50;

pub use block::{detect_format, Format, MemberBlock, VolumeInfo, Walker};
pub use fingerprint::Fingerprint;
pub use geometry::{RawExtent, RawGeometry};
pub use volume::{VolumeNaming, VolumeSet};

/// Hard cap on the number of header blocks walked in a single volume.
pub const MAX_HEADERS_PER_VOLUME: usize = 10_000;

/// Compression method identifiers, normalized across both formats.
///
/// RAR v1.5 stores these as ASCII `0x30..=0x35`, RAR5 as plain `0..=5`.
pub const METHOD_STORE: u8 = 0;

/// Human readable method names, indexed by the normalized method id.
pub const METHOD_NAMES: [&str; 6] = ["store", "fastest", "fast", "normal", "good", "best"];

/// Name for a method id, used for the `user.method` xattr.
pub fn method_name(method: u8) -> &'static str {
    METHOD_NAMES
        .get(method as usize)
        .copied()
        .unwrap_or("unknown")
}
