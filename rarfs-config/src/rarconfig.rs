//! Per-archive configuration from `<source>/.rarconfig`.
//!
//! An INI-like file with one section per archive path and `key = value`
//! lines below it. Recognized keys: `password` (quoted), `seek-length`
//! (bytes), `save-eof` (true/false) and `alias` (two quoted member paths).
//! Unknown keys are ignored with a warning so newer files keep working on
//! older mounts. The first section for a path wins for every property it
//! sets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Error;

use crate::parse;

/// Settings bound to one archive.
#[derive(Debug, Clone, Default)]
pub struct ArchiveConfig {
    pub password: Option<String>,
    pub seek_length: Option<u64>,
    pub save_eof: Option<bool>,
    aliases: Vec<(String, String)>,
}

impl ArchiveConfig {
    /// Alias for `member`, if one is configured. Member paths are compared
    /// with any leading slash removed, matching how the prober names them.
    pub fn alias_for(&self, member: &str) -> Option<&str> {
        let member = member.trim_start_matches('/');
        self.aliases
            .iter()
            .find(|(file, _)| file.trim_start_matches('/') == member)
            .map(|(_, alias)| alias.trim_start_matches('/'))
    }

    pub fn aliases(&self) -> &[(String, String)] {
        &self.aliases
    }

    fn add_alias(&mut self, file: &str, alias: &str) -> bool {
        if !alias_paths_compatible(file, alias) {
            return false;
        }
        if self.alias_for(file.trim_start_matches('/')).is_some() {
            return false;
        }
        self.aliases.push((file.to_owned(), alias.to_owned()));
        true
    }
}

/// An alias may only rename within its directory; anything that would move
/// a member across directories is treated as a collision and dropped.
fn alias_paths_compatible(file: &str, alias: &str) -> bool {
    let file = file.trim_start_matches('/');
    let alias = alias.trim_start_matches('/');
    if file.is_empty() || alias.is_empty() {
        return false;
    }
    let dir_of = |p: &str| p.rsplit_once('/').map(|(d, _)| d.to_owned()).unwrap_or_default();
    let name_of = |p: &str| p.rsplit_once('/').map(|(_, n)| n.to_owned()).unwrap_or_else(|| p.to_owned());
    if name_of(alias).is_empty() || name_of(file).is_empty() {
        return false;
    }
    dir_of(file) == dir_of(alias)
}

/// The per-archive configuration table.
#[derive(Debug, Default)]
pub struct ConfigDb {
    entries: HashMap<PathBuf, ArchiveConfig>,
}

impl ConfigDb {
    /// Load `<source>/.rarconfig`. A missing file is an empty table; a
    /// malformed line is skipped with a warning rather than failing the
    /// mount.
    pub fn load(source: &Path) -> Result<ConfigDb, Error> {
        let path = source.join(".rarconfig");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ConfigDb::default());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self::parse(source, &text))
    }

    /// Parse configuration text; section paths may be absolute or relative
    /// to the source root.
    pub fn parse(source: &Path, text: &str) -> ConfigDb {
        let mut db = ConfigDb::default();
        let mut current: Option<PathBuf> = None;

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if line.starts_with('[') {
                match parse::parse_section(line) {
                    Ok(section) => {
                        let path = if section.starts_with('/') {
                            PathBuf::from(section)
                        } else {
                            source.join(section)
                        };
                        db.entries.entry(path.clone()).or_default();
                        current = Some(path);
                    }
                    Err(err) => {
                        log::warn!(".rarconfig line {}: {}", lineno + 1, err);
                        current = None;
                    }
                }
                continue;
            }
            let Some(section) = current.as_ref() else {
                log::warn!(".rarconfig line {}: value outside any section", lineno + 1);
                continue;
            };
            let Some((key, value)) = parse::split_key_value(line) else {
                log::warn!(".rarconfig line {}: expected key = value", lineno + 1);
                continue;
            };
            let entry = db.entries.get_mut(section).expect("section entry exists");
            if let Err(err) = apply_key(entry, key, value) {
                log::warn!(".rarconfig line {}: {}", lineno + 1, err);
            }
        }
        db
    }

    pub fn lookup(&self, archive: &Path) -> Option<&ArchiveConfig> {
        self.entries.get(archive)
    }

    pub fn password(&self, archive: &Path) -> Option<&str> {
        self.lookup(archive).and_then(|e| e.password.as_deref())
    }

    pub fn seek_length(&self, archive: &Path) -> Option<u64> {
        self.lookup(archive).and_then(|e| e.seek_length)
    }

    pub fn save_eof(&self, archive: &Path) -> Option<bool> {
        self.lookup(archive).and_then(|e| e.save_eof)
    }

    pub fn alias_for(&self, archive: &Path, member: &str) -> Option<&str> {
        self.lookup(archive).and_then(|e| e.alias_for(member))
    }

    /// Bind an alias at runtime (used when nested archives inherit renames).
    pub fn set_alias(&mut self, archive: &Path, file: &str, alias: &str) -> bool {
        self.entries
            .entry(archive.to_owned())
            .or_default()
            .add_alias(file, alias)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn apply_key(entry: &mut ArchiveConfig, key: &str, value: &str) -> Result<(), Error> {
    match key.to_ascii_lowercase().as_str() {
        "password" => {
            let password = parse::parse_quoted_value(value)?;
            if entry.password.is_none() {
                entry.password = Some(password.to_owned());
            }
        }
        "seek-length" => {
            let parsed: u64 = value
                .parse()
                .map_err(|_| anyhow::format_err!("seek-length is not a number: '{}'", value))?;
            if entry.seek_length.is_none() {
                entry.seek_length = Some(parsed);
            }
        }
        "save-eof" => {
            let parsed = match value.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                other => anyhow::bail!("save-eof must be true or false, got '{}'", other),
            };
            if entry.save_eof.is_none() {
                entry.save_eof = Some(parsed);
            }
        }
        "alias" => {
            let (file, alias) = parse::parse_alias_value(value)?;
            if !entry.add_alias(file, alias) {
                anyhow::bail!("alias '{}' -> '{}' rejected (cross-directory or duplicate)", file, alias);
            }
        }
        other => {
            anyhow::bail!("unknown key '{}'", other);
        }
    }
    Ok(())
}
