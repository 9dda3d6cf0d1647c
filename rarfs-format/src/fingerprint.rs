//! Archive fingerprints for cycle detection.
//!
//! A fingerprint is the FNV-1a 64 hash of the first 4 KiB XORed with the
//! hash of the last 4 KiB, rehashed, paired with the archive length and
//! mtime. It is only ever compared against other fingerprints on the live
//! recursion stack; it is not a content checksum.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::Error;

const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_64_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// Bytes hashed from each end of the archive.
pub const FINGERPRINT_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: u64,
    pub size: u64,
    pub mtime: i64,
}

pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_64_OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_64_PRIME);
    }
    hash
}

impl Fingerprint {
    /// Fingerprint an in-memory archive.
    pub fn of_bytes(data: &[u8], mtime: i64) -> Fingerprint {
        let first_len = data.len().min(FINGERPRINT_CHUNK_SIZE);
        let hash_first = fnv1a_64(&data[..first_len]);
        let hash_last = if data.len() > FINGERPRINT_CHUNK_SIZE {
            fnv1a_64(&data[data.len() - FINGERPRINT_CHUNK_SIZE..])
        } else {
            0
        };
        let combined = hash_first ^ hash_last;
        Fingerprint {
            hash: fnv1a_64(&combined.to_le_bytes()),
            size: data.len() as u64,
            mtime,
        }
    }

    /// Fingerprint an archive on disk without reading it whole.
    pub fn of_file(path: &Path) -> Result<Fingerprint, Error> {
        let mut file = File::open(path)?;
        let meta = file.metadata()?;
        let size = meta.len();
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut first = vec![0u8; FINGERPRINT_CHUNK_SIZE.min(size as usize)];
        file.read_exact(&mut first)?;
        let hash_first = fnv1a_64(&first);
        let hash_last = if size > FINGERPRINT_CHUNK_SIZE as u64 {
            let mut last = vec![0u8; FINGERPRINT_CHUNK_SIZE];
            file.seek(SeekFrom::End(-(FINGERPRINT_CHUNK_SIZE as i64)))?;
            file.read_exact(&mut last)?;
            fnv1a_64(&last)
        } else {
            0
        };
        let combined = hash_first ^ hash_last;
        Ok(Fingerprint {
            hash: fnv1a_64(&combined.to_le_bytes()),
            size,
            mtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_fnv_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn file_and_memory_agree() -> Result<(), Error> {
        let mut data = vec![0u8; 10_000];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("archive.rar");
        File::create(&path)?.write_all(&data)?;

        let from_file = Fingerprint::of_file(&path)?;
        let from_mem = Fingerprint::of_bytes(&data, from_file.mtime);
        assert_eq!(from_file, from_mem);
        Ok(())
    }

    #[test]
    fn middle_bytes_do_not_matter_but_ends_do() {
        let base = vec![7u8; 20_000];
        let mut middle = base.clone();
        middle[10_000] = 8;
        let mut tail = base.clone();
        *tail.last_mut().unwrap() = 8;

        let fp_base = Fingerprint::of_bytes(&base, 0);
        assert_eq!(fp_base, Fingerprint::of_bytes(&middle, 0));
        assert_ne!(fp_base, Fingerprint::of_bytes(&tail, 0));
        // Same bytes, different mtime: still distinct.
        assert_ne!(fp_base, Fingerprint::of_bytes(&base, 1));
    }

    #[test]
    fn short_archives_hash() {
        let fp = Fingerprint::of_bytes(b"tiny", 42);
        assert_eq!(fp.size, 4);
        assert_eq!(fp.mtime, 42);
        assert_ne!(fp.hash, 0);
    }
}
