//! Raw reads: stored members served by positional reads on volume files.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use rarfs_format::{RawGeometry, VolumeSet};

use crate::filecache::{EntryFlags, FileCacheEntry};

enum VolumeSource {
    Single(PathBuf),
    Set(VolumeSet),
}

/// Serves a contiguous member payload spread over one or more volumes.
/// Holds the descriptor of the current volume between reads and switches
/// files when a read crosses a volume boundary.
pub struct RawReader {
    size: u64,
    geometry: RawGeometry,
    source: VolumeSource,
    current: Option<(u32, File)>,
}

impl RawReader {
    pub fn new(entry: &FileCacheEntry) -> io::Result<Self> {
        let source = if entry.flags.contains(EntryFlags::MULTIPART) {
            let set = VolumeSet::from_parts(
                &entry.archive_path,
                entry.geometry.vtype,
                entry.geometry.vpos as usize,
                entry.geometry.vlen as usize,
                u32::from(entry.geometry.vno_base),
            )
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "bad volume naming fields for {}",
                        entry.archive_path.display()
                    ),
                )
            })?;
            VolumeSource::Set(set)
        } else {
            VolumeSource::Single(entry.archive_path.clone())
        };
        Ok(RawReader {
            size: entry.stat.size,
            geometry: entry.geometry,
            source,
            current: None,
        })
    }

    fn volume_path(&self, index: u32) -> Option<PathBuf> {
        match &self.source {
            VolumeSource::Single(path) => (index == 0).then(|| path.clone()),
            VolumeSource::Set(set) => set.volume_path(index),
        }
    }

    fn volume_file(&mut self, index: u32) -> io::Result<Option<&File>> {
        if self.current.as_ref().map(|(i, _)| *i) != Some(index) {
            let path = match self.volume_path(index) {
                Some(path) => path,
                // Naming scheme exhausted: nothing beyond this point.
                None => return Ok(None),
            };
            match File::open(&path) {
                Ok(file) => self.current = Some((index, file)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    // Missing volume. A gap (the next volume exists) is an
                    // I/O error; past the last contiguous volume it is EOF.
                    let next_exists = self
                        .volume_path(index + 1)
                        .map(|p| p.exists())
                        .unwrap_or(false);
                    if next_exists {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("missing volume {}", path.display()),
                        ));
                    }
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(self.current.as_ref().map(|(_, file)| file))
    }

    /// Read `[offset, offset + len)`, shorter only at end of data.
    pub fn read_at(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let extents = self.geometry.map_range(self.size, offset, len as u64);
        let mut out = Vec::with_capacity(len.min(1 << 20));
        let total = extents.len();
        for (index, extent) in extents.into_iter().enumerate() {
            let is_last = index + 1 == total;
            let file = match self.volume_file(extent.volume)? {
                Some(file) => file,
                None => break,
            };
            let start = out.len();
            out.resize(start + extent.len as usize, 0);
            let mut pos = 0usize;
            while (pos as u64) < extent.len {
                let got = file.read_at(&mut out[start + pos..], extent.offset + pos as u64)?;
                if got == 0 {
                    break;
                }
                pos += got;
            }
            out.truncate(start + pos);
            if (pos as u64) < extent.len {
                // Short volume. Data expected further on means the set is
                // inconsistent, not merely truncated at its tail.
                if !is_last {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "volume shorter than its recorded payload",
                    ));
                }
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filecache::EntryStat;
    use std::io::Write;

    fn entry_for(path: &std::path::Path, size: u64, geometry: RawGeometry, multipart: bool) -> FileCacheEntry {
        let mut flags = EntryFlags::RAW | EntryFlags::VSIZE_RESOLVED;
        if multipart {
            flags |= EntryFlags::MULTIPART;
        }
        FileCacheEntry {
            archive_path: path.to_owned(),
            member_name: "payload.bin".into(),
            stat: EntryStat {
                mode: libc::S_IFREG | 0o644,
                size,
                nlink: 1,
                ..Default::default()
            },
            geometry,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn reads_single_volume_payload() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("solo.rar");
        let mut file = File::create(&path)?;
        file.write_all(&[0u8; 64])?; // pretend headers
        file.write_all(b"ABCDEFGHIJ")?;
        drop(file);

        let geometry = RawGeometry {
            offset: 64,
            vsize_real_first: 10,
            ..Default::default()
        };
        let mut reader = RawReader::new(&entry_for(&path, 10, geometry, false))?;
        assert_eq!(reader.read_at(0, 10)?, b"ABCDEFGHIJ");
        assert_eq!(reader.read_at(3, 4)?, b"DEFG");
        assert_eq!(reader.read_at(8, 100)?, b"IJ");
        assert!(reader.read_at(10, 4)?.is_empty());
        Ok(())
    }

    #[test]
    fn reads_across_volumes_and_reports_gaps() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        // Three volumes carrying "AAAA" "BBBB" "CC" at payload offset 8.
        for (name, payload) in [
            ("multi.part1.rar", &b"AAAA"[..]),
            ("multi.part2.rar", &b"BBBB"[..]),
            ("multi.part3.rar", &b"CC"[..]),
        ] {
            let mut file = File::create(dir.path().join(name))?;
            file.write_all(&[0u8; 8])?;
            file.write_all(payload)?;
        }
        let first = dir.path().join("multi.part1.rar");
        let geometry = RawGeometry {
            offset: 8,
            offset_next: 8,
            vsize_first: 12,
            vsize_next: 12,
            vsize_real_first: 4,
            vsize_real_next: 4,
            vno_base: 1,
            vno_first: 0,
            vlen: 1,
            vpos: 10,
            vtype: 1,
        };
        let entry = entry_for(&first, 10, geometry, true);
        let mut reader = RawReader::new(&entry)?;
        assert_eq!(reader.read_at(0, 10)?, b"AAAABBBBCC");
        assert_eq!(reader.read_at(2, 4)?, b"AABB");
        assert_eq!(reader.read_at(7, 3)?, b"BCC");

        // Remove the middle volume: now there is a gap.
        std::fs::remove_file(dir.path().join("multi.part2.rar"))?;
        let mut reader = RawReader::new(&entry)?;
        let err = reader.read_at(0, 10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Remove the tail too: reads past volume 1 are plain end-of-file.
        std::fs::remove_file(dir.path().join("multi.part3.rar"))?;
        let mut reader = RawReader::new(&entry)?;
        assert_eq!(reader.read_at(0, 10)?, b"AAAA");
        Ok(())
    }

    #[test]
    fn vpos_window_math_matches_fixture_names() {
        // "multi.part1.rar": the digit sits at byte 10, width 1.
        assert_eq!(&"multi.part1.rar"[10..11], "1");
    }
}
