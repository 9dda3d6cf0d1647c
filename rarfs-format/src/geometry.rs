//! Raw-read geometry of stored members.
//!
//! A stored member is a contiguous run of payload bytes spread over one or
//! more volume files. The geometry captures where that run starts in the
//! first volume, how many member bytes each volume carries and where payload
//! sits inside continuation volumes, so a logical byte range can be turned
//! into positional reads without touching any headers again.

/// Per-member raw geometry. All sizes in bytes.
///
/// Invariant once resolved: `vsize_real_first` plus the sum of per-volume
/// continuation payloads (each at most `vsize_real_next`) equals the member
/// size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawGeometry {
    /// Payload offset inside the first volume.
    pub offset: u64,
    /// Payload offset inside continuation volumes.
    pub offset_next: u64,
    /// Physical length of the first volume file.
    pub vsize_first: u64,
    /// Physical length of continuation volume files.
    pub vsize_next: u64,
    /// Member bytes carried by the first volume.
    pub vsize_real_first: u64,
    /// Member bytes carried by each full continuation volume.
    pub vsize_real_next: u64,
    /// Numeric value at the filename window of the set's first volume.
    pub vno_base: u16,
    /// Set-relative index of the volume where this member starts.
    pub vno_first: u16,
    /// Width of the numeric window within the volume filename.
    pub vlen: u8,
    /// Byte position of the numeric window within the volume filename.
    pub vpos: u8,
    /// Volume naming scheme variant.
    pub vtype: u8,
}

/// One positional read against a single volume file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    /// Set-relative volume index (0 is the set's first volume).
    pub volume: u32,
    /// Byte offset within that volume file.
    pub offset: u64,
    /// Bytes to read there.
    pub len: u64,
}

impl RawGeometry {
    /// Translate `[logical, logical + len)` of a member of `size` bytes into
    /// per-volume extents. The result is clamped to the member size; an
    /// empty vector means end of file.
    pub fn map_range(&self, size: u64, logical: u64, len: u64) -> Vec<RawExtent> {
        let mut extents = Vec::new();
        if logical >= size {
            return extents;
        }
        let mut remaining = len.min(size - logical);
        let mut logical = logical;

        if logical < self.vsize_real_first || self.vsize_real_next == 0 {
            let in_first = if self.vsize_real_next == 0 {
                // Single-volume member; everything lives in the first volume.
                remaining
            } else {
                remaining.min(self.vsize_real_first - logical)
            };
            if in_first > 0 {
                extents.push(RawExtent {
                    volume: u32::from(self.vno_first),
                    offset: self.offset + logical,
                    len: in_first,
                });
                remaining -= in_first;
                logical += in_first;
            }
        }

        while remaining > 0 && self.vsize_real_next > 0 {
            let past_first = logical - self.vsize_real_first;
            let volume = u32::from(self.vno_first) + 1 + (past_first / self.vsize_real_next) as u32;
            let within = past_first % self.vsize_real_next;
            let chunk = remaining.min(self.vsize_real_next - within);
            extents.push(RawExtent {
                volume,
                offset: self.offset_next + within,
                len: chunk,
            });
            remaining -= chunk;
            logical += chunk;
        }

        extents
    }

    /// Number of volumes the member's payload touches.
    pub fn volumes_spanned(&self, size: u64) -> u32 {
        if self.vsize_real_next == 0 || size <= self.vsize_real_first {
            return 1;
        }
        let rest = size - self.vsize_real_first;
        1 + rest.div_ceil(self.vsize_real_next) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_geometry() -> RawGeometry {
        RawGeometry {
            offset: 100,
            offset_next: 60,
            vsize_first: 1100,
            vsize_next: 1080,
            vsize_real_first: 1000,
            vsize_real_next: 1000,
            vno_first: 0,
            ..Default::default()
        }
    }

    #[test]
    fn single_volume_range() {
        let geometry = RawGeometry {
            offset: 64,
            vsize_real_first: 500,
            ..Default::default()
        };
        let extents = geometry.map_range(500, 10, 100);
        assert_eq!(
            extents,
            vec![RawExtent {
                volume: 0,
                offset: 74,
                len: 100
            }]
        );
        assert!(geometry.map_range(500, 500, 10).is_empty());
        // Reads are clamped at end of member.
        assert_eq!(geometry.map_range(500, 490, 100)[0].len, 10);
    }

    #[test]
    fn range_crossing_volumes() {
        let geometry = split_geometry();
        let size = 2500;
        let extents = geometry.map_range(size, 900, 1200);
        assert_eq!(
            extents,
            vec![
                RawExtent {
                    volume: 0,
                    offset: 1000,
                    len: 100
                },
                RawExtent {
                    volume: 1,
                    offset: 60,
                    len: 1000
                },
                RawExtent {
                    volume: 2,
                    offset: 60,
                    len: 100
                },
            ]
        );
        assert_eq!(geometry.volumes_spanned(size), 3);
    }

    #[test]
    fn range_entirely_in_continuation() {
        let geometry = split_geometry();
        let extents = geometry.map_range(2500, 1500, 200);
        assert_eq!(
            extents,
            vec![RawExtent {
                volume: 1,
                offset: 560,
                len: 200
            }]
        );
    }

    #[test]
    fn whole_member_concatenates() {
        let geometry = split_geometry();
        let size = 2500;
        let extents = geometry.map_range(size, 0, size);
        let total: u64 = extents.iter().map(|e| e.len).sum();
        assert_eq!(total, size);
        // Extents are strictly ordered by volume.
        for pair in extents.windows(2) {
            assert!(pair[0].volume < pair[1].volume);
        }
    }
}
