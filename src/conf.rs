//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, str::FromStr};

use crate::error::Error;

/// The global configuration for a seeding run.
///
/// The host is responsible for populating this from whatever configuration
/// source it uses; the engine consumes it as-is.
#[derive(Debug, Clone)]
pub struct Conf {
    /// Where the persistent file index lives.
    pub db_path: PathBuf,
    /// The roots that are scanned into the index.
    pub disks: Vec<PathBuf>,
    /// Glob patterns for file names the Normal table must skip. Matched
    /// against normalized names.
    pub ignore_files: Vec<String>,
    /// The directory under which per-torrent staging directories are created.
    pub store_path: PathBuf,
    /// A torrent missing more than this many bytes is refused, when the
    /// percentage threshold is also exceeded.
    pub add_limit_size: u64,
    /// A torrent missing more than this percentage is refused, when the size
    /// threshold is also exceeded. 0 to 100.
    pub add_limit_percent: f64,
    /// Whether staged files are symlinks or hard links.
    pub link_type: LinkType,
    /// Remove the `.torrent` file once its content is seeded.
    pub delete_torrents: bool,
    /// Which matching strategies the index is built for.
    pub scan_modes: ScanModes,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, expecting the index
    /// path, scan roots, and staging directory, as it is not sensible to
    /// guess those for the user.
    pub fn new(
        db_path: impl Into<PathBuf>,
        disks: Vec<PathBuf>,
        store_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            disks,
            ignore_files: Vec::new(),
            store_path: store_path.into(),
            add_limit_size: 0,
            add_limit_percent: 0.0,
            link_type: LinkType::Soft,
            delete_torrents: false,
            scan_modes: ScanModes::default(),
        }
    }
}

/// How a matched file is materialized in the staging directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Symbolic links.
    Soft,
    /// Hard links. Requires staging and source on the same filesystem.
    Hard,
}

impl FromStr for LinkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soft" => Ok(LinkType::Soft),
            "hard" => Ok(LinkType::Hard),
            other => Err(Error::UnknownLinkType(other.to_string())),
        }
    }
}

/// The matching strategies the index supports.
///
/// Each enabled mode costs index space and rebuild time, so hosts opt in to
/// exactly the strategies they want.
#[derive(Debug, Clone, Copy)]
pub struct ScanModes {
    /// Match files by normalized name and size.
    pub normal: bool,
    /// Group release directories (multi-part archives, DVD/Blu-ray trees)
    /// and match them as a whole.
    pub unsplitable: bool,
    /// Match a whole torrent against an identically named file or directory.
    pub exact: bool,
    /// Hash-probe candidates that share a normalized name.
    pub hash_name: bool,
    /// Hash-probe candidates that share an exact size.
    pub hash_size: bool,
    /// Hash-probe candidates within 10% of the wanted size. Implies scanning
    /// the whole size table, hence slow.
    pub hash_slow: bool,
}

impl ScanModes {
    /// Returns true if any hash-probing strategy is enabled.
    pub fn any_hash(&self) -> bool {
        self.hash_name || self.hash_size || self.hash_slow
    }

    /// Returns true if files must be inserted into the size table.
    pub(crate) fn wants_size_table(&self) -> bool {
        self.hash_size || self.hash_slow
    }
}

impl Default for ScanModes {
    fn default() -> Self {
        ScanModes {
            normal: true,
            unsplitable: true,
            exact: false,
            hash_name: false,
            hash_size: false,
            hash_slow: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_link_types() {
        assert_eq!("soft".parse::<LinkType>().unwrap(), LinkType::Soft);
        assert_eq!("hard".parse::<LinkType>().unwrap(), LinkType::Hard);
        assert!(matches!(
            "reflink".parse::<LinkType>(),
            Err(Error::UnknownLinkType(_))
        ));
    }
}
