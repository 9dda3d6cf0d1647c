//! Volume naming schemes of segmented archives.
//!
//! Two conventions are in the wild: the old scheme where the first volume is
//! `name.rar` and continuations count `name.r00`, `name.r01`, ... (spilling
//! into `.s00` and beyond past 99), and the new scheme `name.partNN.rar`
//! where the digit window sits before the `.rar` suffix. Composition is a
//! pure textual substitution on the digit window so the resolver never has
//! to scan a directory.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

/// Hard cap on volumes enumerated for one set.
pub const MAX_VOLUMES: u32 = 1000;

lazy_static! {
    static ref PART_RE: Regex = Regex::new(r"(?i)^(.*\.part)(\d{1,9})(\.rar)$").unwrap();
    static ref OLD_FIRST_RE: Regex = Regex::new(r"(?i)^(.*)\.rar$").unwrap();
    static ref OLD_CONT_RE: Regex = Regex::new(r"(?i)^.*\.[r-z]\d{2}$").unwrap();
}

/// Naming scheme variant (the `vtype` of a cache entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeNaming {
    /// `name.rar`, `name.r00`, `name.r01`, ...
    Old,
    /// `name.partNN.rar` with a fixed-width digit window.
    Part,
}

impl VolumeNaming {
    pub fn as_vtype(self) -> u8 {
        match self {
            VolumeNaming::Old => 0,
            VolumeNaming::Part => 1,
        }
    }

    pub fn from_vtype(vtype: u8) -> Option<Self> {
        match vtype {
            0 => Some(VolumeNaming::Old),
            1 => Some(VolumeNaming::Part),
            _ => None,
        }
    }
}

/// A volume set anchored at its first volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSet {
    first: PathBuf,
    naming: VolumeNaming,
    /// Byte position of the digit window in the file name (`vpos`).
    vpos: usize,
    /// Width of the digit window (`vlen`).
    vlen: usize,
    /// Number parsed from the first volume's window (`vno_base`).
    vno_base: u32,
}

impl VolumeSet {
    /// Interpret `first` as the first volume of a set. Always succeeds for
    /// a `.rar` path; whether the set actually has more volumes is decided
    /// by the archive headers, not the name.
    pub fn detect(first: &Path) -> Option<VolumeSet> {
        let name = first.file_name()?.to_str()?;
        if let Some(caps) = PART_RE.captures(name) {
            let digits = caps.get(2).unwrap();
            return Some(VolumeSet {
                first: first.to_owned(),
                naming: VolumeNaming::Part,
                vpos: digits.start(),
                vlen: digits.as_str().len(),
                vno_base: digits.as_str().parse().ok()?,
            });
        }
        if OLD_FIRST_RE.is_match(name) {
            // The digit window only exists from the second volume on; it
            // replaces the last two extension characters.
            return Some(VolumeSet {
                first: first.to_owned(),
                naming: VolumeNaming::Old,
                vpos: name.len() - 2,
                vlen: 2,
                vno_base: 0,
            });
        }
        None
    }

    /// Rebuild a set from cached geometry fields.
    pub fn from_parts(first: &Path, vtype: u8, vpos: usize, vlen: usize, vno_base: u32) -> Option<VolumeSet> {
        Some(VolumeSet {
            first: first.to_owned(),
            naming: VolumeNaming::from_vtype(vtype)?,
            vpos,
            vlen,
            vno_base,
        })
    }

    pub fn naming(&self) -> VolumeNaming {
        self.naming
    }

    pub fn vpos(&self) -> usize {
        self.vpos
    }

    pub fn vlen(&self) -> usize {
        self.vlen
    }

    pub fn vno_base(&self) -> u32 {
        self.vno_base
    }

    pub fn first_path(&self) -> &Path {
        &self.first
    }

    /// Compose the path of volume `index` (0 being the first volume).
    /// Returns `None` past the naming scheme's range or the volume cap.
    pub fn volume_path(&self, index: u32) -> Option<PathBuf> {
        if index >= MAX_VOLUMES {
            return None;
        }
        if index == 0 {
            return Some(self.first.clone());
        }
        let name = self.first.file_name()?.to_str()?;
        let composed = match self.naming {
            VolumeNaming::Old => {
                // Volume k replaces the ".rar" suffix with ".rNN"; past r99
                // the leading letter is bumped (r99 -> s00).
                let number = index - 1;
                let letter_bump = number / 100;
                let letter = (b'r' + u8::try_from(letter_bump).ok()?) as char;
                if letter > 'z' {
                    return None;
                }
                let stem = &name[..name.len() - 4];
                format!("{}.{}{:02}", stem, letter, number % 100)
            }
            VolumeNaming::Part => {
                let number = self.vno_base.checked_add(index)?;
                let digits = format!("{:0width$}", number, width = self.vlen);
                if digits.len() > self.vlen {
                    return None;
                }
                format!(
                    "{}{}{}",
                    &name[..self.vpos],
                    digits,
                    &name[self.vpos + self.vlen..]
                )
            }
        };
        Some(self.first.with_file_name(composed))
    }
}

/// Whether `name` looks like any archive volume at all (used to pick probe
/// candidates out of a directory).
pub fn is_archive_candidate(name: &str) -> bool {
    OLD_FIRST_RE.is_match(name) || OLD_CONT_RE.is_match(name)
}

/// Whether `name` is a continuation volume that should never be probed or
/// listed on its own.
pub fn is_continuation_volume(name: &str) -> bool {
    if OLD_CONT_RE.is_match(name) {
        return true;
    }
    if let Some(caps) = PART_RE.captures(name) {
        let number: u32 = match caps.get(2).unwrap().as_str().parse() {
            Ok(n) => n,
            Err(_) => return false,
        };
        return number > 1;
    }
    false
}
