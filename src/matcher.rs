//! Reconciles a torrent's file list against the file index.
//!
//! Strategies are tried in a fixed order: an exact directory or file match
//! short-circuits everything, the link strategy resolves files one by one
//! (grouping unsplitable releases), and hash probing finally upgrades files
//! the cheap lookups missed.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::index::Result;
use crate::index::{ExactKind, Index};
use crate::metainfo::{Metainfo, TorrentFile};
use crate::pieces::Pieces;
use crate::unsplitable::{is_unsplitable, root_of_unsplitable};

/// Which strategy produced a torrent's staging plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Files are materialized as links into the staging directory.
    Link,
    /// At least one file was found by hash probing; rewrites may be needed
    /// and fast resume is off the table.
    Hash,
    /// An existing directory (or file) already lays the content out
    /// correctly; it is seeded in place.
    Exact,
}

/// How a rewrite realigns a size-mismatched candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteAction {
    /// Zero bytes are spliced in at the breakpoint.
    Add,
    /// Excess candidate bytes are dropped at the breakpoint.
    Remove,
}

/// The verdict for a single torrent file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A local file satisfies this torrent file as-is.
    Completed { actual_path: PathBuf },
    /// A local file carries the content but needs bytes spliced in or out
    /// at `breakpoint` while copying into the staging area.
    NeedsRewrite {
        actual_path: PathBuf,
        action: RewriteAction,
        breakpoint: u64,
    },
    /// No candidate.
    Missing,
}

impl Decision {
    /// True for decisions that contribute found bytes.
    pub fn is_found(&self) -> bool {
        !matches!(self, Decision::Missing)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Decision::Completed { .. })
    }

    /// The local path backing this decision, if any.
    pub fn actual_path(&self) -> Option<&Path> {
        match self {
            Decision::Completed { actual_path } => Some(actual_path),
            Decision::NeedsRewrite { actual_path, .. } => Some(actual_path),
            Decision::Missing => None,
        }
    }
}

/// One torrent file together with its match decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatch {
    pub file: TorrentFile,
    pub decision: Decision,
}

/// The full matching outcome for one torrent.
#[derive(Debug)]
pub struct MatchResult {
    pub mode: MatchMode,
    /// In exact mode, the directory the client seeds in place.
    pub source_path: Option<PathBuf>,
    /// One entry per torrent file, in metainfo order.
    pub files: Vec<FileMatch>,
    pub found_bytes: u64,
    pub missing_bytes: u64,
}

impl MatchResult {
    fn new(mode: MatchMode, source_path: Option<PathBuf>, files: Vec<FileMatch>) -> Self {
        let found_bytes = files
            .iter()
            .filter(|f| f.decision.is_found())
            .map(|f| f.file.len)
            .sum();
        let missing_bytes = files
            .iter()
            .filter(|f| !f.decision.is_found())
            .map(|f| f.file.len)
            .sum();
        MatchResult {
            mode,
            source_path,
            files,
            found_bytes,
            missing_bytes,
        }
    }

    /// The admission gate: a torrent is refused only when bytes are missing
    /// and both configured thresholds are exceeded.
    pub fn is_refused(&self, add_limit_size: u64, add_limit_percent: f64) -> bool {
        if self.missing_bytes == 0 {
            return false;
        }
        let total = (self.found_bytes + self.missing_bytes) as f64;
        let missing_percent = self.missing_bytes as f64 / total * 100.0;
        missing_percent > add_limit_percent && self.missing_bytes > add_limit_size
    }
}

/// Finds the physical location of every file in the torrent.
pub fn match_torrent(index: &mut Index, metainfo: &Metainfo) -> Result<MatchResult> {
    if index.modes().exact {
        if let Some(result) = match_exact(index, metainfo) {
            log::info!("Did an exact match for {:?}", metainfo.name());
            return Ok(result);
        }
    }

    let mut files = match_linkable(index, metainfo);

    let mut mode = MatchMode::Link;
    if index.modes().any_hash() && files.iter().any(|f| !f.decision.is_found()) {
        if hash_augment(index, metainfo, &mut files)? {
            mode = MatchMode::Hash;
        }
    }

    Ok(MatchResult::new(mode, None, files))
}

/// Tries to place the whole torrent onto an identically named file or
/// directory.
fn match_exact(index: &Index, metainfo: &Metainfo) -> Option<MatchResult> {
    if !metainfo.is_multi_file() {
        let file = &metainfo.files()[0];
        for path in index.find_exact(ExactKind::File, metainfo.name()) {
            log::debug!("Checking exact path {:?}", path);
            if file_size(&path) != Some(file.len) {
                continue;
            }
            let source = path.parent()?.to_path_buf();
            let files = vec![FileMatch {
                file: file.clone(),
                decision: Decision::Completed { actual_path: path },
            }];
            return Some(MatchResult::new(MatchMode::Exact, Some(source), files));
        }
        return None;
    }

    'candidate: for dir in index.find_exact(ExactKind::Dir, metainfo.name()) {
        log::debug!("Checking exact path {:?}", dir);
        let mut files = Vec::with_capacity(metainfo.files().len());
        for file in metainfo.files() {
            let path = file.path.iter().fold(dir.clone(), |p, c| p.join(c));
            match file_size(&path) {
                Some(size) if size == file.len => files.push(FileMatch {
                    file: file.clone(),
                    decision: Decision::Completed { actual_path: path },
                }),
                Some(size) => {
                    log::debug!(
                        "File {:?} did not match, this is not exact (got size {}, expected {})",
                        path,
                        size,
                        file.len
                    );
                    continue 'candidate;
                }
                None => {
                    log::debug!("File {:?} does not exist", path);
                    continue 'candidate;
                }
            }
        }
        return Some(MatchResult::new(MatchMode::Exact, Some(dir), files));
    }
    None
}

/// The link strategy: every file resolved through the Normal table, or the
/// Unsplitable table when its directory belongs to a release.
fn match_linkable(index: &Index, metainfo: &Metainfo) -> Vec<FileMatch> {
    let unsplitable_roots = if index.modes().unsplitable && metainfo.is_multi_file() {
        torrent_unsplitable_roots(metainfo)
    } else {
        HashSet::new()
    };

    metainfo
        .files()
        .iter()
        .map(|file| {
            let actual_path = match release_of(file, metainfo, &unsplitable_roots) {
                Some(root_components) => {
                    let root = root_components.last().map(String::as_str).unwrap_or_default();
                    let dir = dir_components(file, metainfo);
                    let subpath: Vec<&str> = dir[root_components.len()..]
                        .iter()
                        .map(String::as_str)
                        .collect();
                    index.find_unsplitable(root, &subpath, file.name(), file.len)
                }
                None => index.find_normal(file.name(), file.len),
            };

            let decision = match actual_path {
                Some(actual_path) => Decision::Completed { actual_path },
                None => Decision::Missing,
            };
            FileMatch {
                file: file.clone(),
                decision,
            }
        })
        .collect()
}

/// The directory holding a torrent file, as components rooted at the torrent
/// name.
fn dir_components(file: &TorrentFile, metainfo: &Metainfo) -> Vec<String> {
    let mut components = vec![metainfo.name().to_string()];
    components.extend_from_slice(&file.path[..file.path.len().saturating_sub(1)]);
    components
}

/// Release roots present in the torrent's own layout.
fn torrent_unsplitable_roots(metainfo: &Metainfo) -> HashSet<Vec<String>> {
    let mut groups: Vec<(Vec<String>, Vec<&str>)> = Vec::new();
    for file in metainfo.files() {
        let dir = dir_components(file, metainfo);
        match groups.iter_mut().find(|(d, _)| *d == dir) {
            Some((_, names)) => names.push(file.name()),
            None => groups.push((dir, vec![file.name()])),
        }
    }

    let mut roots = HashSet::new();
    for (dir, names) in groups {
        if !is_unsplitable(names.iter().copied()) {
            continue;
        }
        let root_name = match root_of_unsplitable(dir.iter().map(String::as_str)) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let mut root = dir;
        while !root.is_empty() && root.last() != Some(&root_name) {
            root.pop();
        }
        if !root.is_empty() {
            roots.insert(root);
        }
    }
    roots
}

/// The release-root prefix covering this file's directory, if any.
fn release_of(
    file: &TorrentFile,
    metainfo: &Metainfo,
    roots: &HashSet<Vec<String>>,
) -> Option<Vec<String>> {
    if roots.is_empty() {
        return None;
    }
    let mut dir = dir_components(file, metainfo);
    while !dir.is_empty() {
        if roots.contains(&dir) {
            return Some(dir);
        }
        dir.pop();
    }
    None
}

/// Hash probing for files the table lookups left missing. Returns whether
/// any file was upgraded.
fn hash_augment(
    index: &mut Index,
    metainfo: &Metainfo,
    files: &mut [FileMatch],
) -> Result<bool> {
    let pieces = Pieces::new(metainfo);

    if index.modes().hash_slow {
        log::info!("Slow mode enabled, building hash size table");
        index.build_size_table()?;
    }

    log::info!("Hash scan mode enabled, checking for incomplete files");
    let mut upgraded = false;
    for entry in files.iter_mut().filter(|f| !f.decision.is_found()) {
        let file = &entry.file;

        let mut candidates = Vec::new();
        if index.modes().hash_size {
            log::debug!("Using hash size mode to find files");
            candidates.extend(index.find_hash_by_size(file.len));
        }
        if index.modes().hash_name {
            log::debug!("Using hash name mode to find files");
            candidates.extend(index.find_hash_by_name(file.name()));
        }
        if index.modes().hash_slow {
            log::debug!("Using hash slow mode to find files");
            candidates.extend(index.find_hash_by_varying_size(file.len));
        }
        log::debug!(
            "Found {} files to check for matching hash",
            candidates.len()
        );

        let mut checked = HashSet::new();
        for candidate in candidates {
            if !checked.insert(candidate.clone()) {
                log::debug!("File {:?} already checked, skipping", candidate);
                continue;
            }

            log::info!("Hash checking {:?}", candidate);
            let (matches_head, matches_tail) =
                pieces.match_file(&candidate, file.torrent_offset, file.torrent_end());
            log::debug!(
                "Hash result for {:?} head:{} tail:{}",
                candidate,
                matches_head,
                matches_tail
            );
            if !matches_head && !matches_tail {
                continue;
            }

            let candidate_size = match file_size(&candidate) {
                Some(size) => size,
                None => continue,
            };

            if candidate_size == file.len {
                if !(matches_head && matches_tail) {
                    continue;
                }
                log::debug!("Perfect size, perfect match");
                entry.decision = Decision::Completed {
                    actual_path: candidate,
                };
            } else {
                log::debug!("File does not have correct size, need to align it");
                let breakpoint = if matches_head && matches_tail {
                    pieces.find_piece_breakpoint(
                        &candidate,
                        file.torrent_offset,
                        file.torrent_end(),
                    )
                } else if matches_head {
                    file.len.min(candidate_size)
                } else {
                    0
                };
                let action = if candidate_size > file.len {
                    RewriteAction::Remove
                } else {
                    RewriteAction::Add
                };
                entry.decision = Decision::NeedsRewrite {
                    actual_path: candidate,
                    action,
                    breakpoint,
                };
            }
            upgraded = true;
            break;
        }
    }

    Ok(upgraded)
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}
