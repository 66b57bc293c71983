//! Materializes a matcher result into a staging directory and synthesizes
//! fast-resume data.
//!
//! Completed files become links; size-mismatched hash matches are streamed
//! into place with bytes spliced in or out at their breakpoint. Staging
//! never touches the indexed source files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::bencode::Value;
use crate::conf::LinkType;
use crate::error::assemble::{AssembleError, Result};
use crate::matcher::{Decision, FileMatch, RewriteAction};
use crate::metainfo::Metainfo;
use crate::Bitfield;

/// Rewrites stream in fixed chunks of this many bytes.
const CHUNK_SIZE: usize = 0x10000;

/// Links every completed file into the staging directory.
pub fn link_files(
    destination_path: &Path,
    files: &[FileMatch],
    link_type: LinkType,
) -> Result<()> {
    make_dir(destination_path)?;

    for entry in files {
        let actual_path = match &entry.decision {
            Decision::Completed { actual_path } => actual_path,
            _ => continue,
        };

        let destination = staged_path(destination_path, entry);
        if let Some(parent) = destination.parent() {
            make_dir(parent)?;
        }

        log::debug!(
            "Making {:?} link from {:?} to {:?}",
            link_type,
            actual_path,
            destination
        );
        let result = match link_type {
            LinkType::Soft => symlink(actual_path, &destination),
            LinkType::Hard => fs::hard_link(actual_path, &destination),
        };
        result.map_err(|error| AssembleError::Link {
            from: actual_path.clone(),
            to: destination,
            error,
        })?;
    }

    Ok(())
}

/// Streams every rewrite candidate into the staging directory, splicing
/// zero bytes in or dropping surplus bytes at its breakpoint.
pub fn rewrite_files(destination_path: &Path, files: &[FileMatch]) -> Result<()> {
    make_dir(destination_path)?;

    for entry in files {
        let (actual_path, action, breakpoint) = match &entry.decision {
            Decision::NeedsRewrite {
                actual_path,
                action,
                breakpoint,
            } => (actual_path, *action, *breakpoint),
            _ => continue,
        };

        let destination = staged_path(destination_path, entry);
        if let Some(parent) = destination.parent() {
            make_dir(parent)?;
        }

        log::debug!("Rewriting file from {:?} to {:?}", actual_path, destination);
        rewrite_one(actual_path, &destination, entry.file.len, action, breakpoint)?;
    }

    Ok(())
}

/// Copies a candidate into place while realigning it at the breakpoint.
fn rewrite_one(
    source: &Path,
    destination: &Path,
    target_len: u64,
    action: RewriteAction,
    breakpoint: u64,
) -> Result<()> {
    let mut input = File::open(source)?;
    let mut output = File::create(destination)?;

    let current_size = input.metadata()?.len();
    let diff = current_size.abs_diff(target_len);
    log::debug!(
        "Splicing {:?} with action {:?}, {} bytes at breakpoint {}",
        source,
        action,
        diff,
        breakpoint
    );

    copy_bytes(&mut input, &mut output, breakpoint)?;
    match action {
        RewriteAction::Add => {
            let zeros = [0u8; CHUNK_SIZE];
            let mut remaining = diff;
            while remaining > 0 {
                let chunk = remaining.min(CHUNK_SIZE as u64) as usize;
                output.write_all(&zeros[..chunk])?;
                remaining -= chunk as u64;
            }
        }
        RewriteAction::Remove => {
            input.seek(SeekFrom::Start(breakpoint + diff))?;
        }
    }
    copy_bytes(&mut input, &mut output, u64::MAX)?;

    output.flush()?;
    Ok(())
}

/// Copies up to `limit` bytes in fixed-size chunks, stopping at EOF.
fn copy_bytes(input: &mut File, output: &mut File, limit: u64) -> Result<()> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = limit;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let read = input.read(&mut buf[..want])?;
        if read == 0 {
            break;
        }
        output.write_all(&buf[..read])?;
        remaining -= read as u64;
    }
    Ok(())
}

/// Builds the `libtorrent_resume` dictionary for a staged torrent.
///
/// The bitfield marks the pieces wholly contributed by completed files; a
/// fully available torrent collapses it to the piece count, which is the
/// form seeding clients expect for complete content.
pub fn fast_resume(metainfo: &Metainfo, files: &[FileMatch], destination_path: &Path) -> Value {
    let piece_len = metainfo.piece_len();
    let piece_count = metainfo.piece_count();
    let mut bitfield = Bitfield::repeat(true, piece_count);

    let mut file_entries = Vec::with_capacity(files.len());
    for entry in files {
        let completed = entry.decision.is_completed();

        let mut record = BTreeMap::new();
        record.insert(b"priority".to_vec(), Value::Integer(1));
        record.insert(b"completed".to_vec(), Value::Integer(i64::from(completed)));
        if completed {
            let staged = staged_path(destination_path, entry);
            match file_mtime(&staged) {
                Some(mtime) => record.insert(b"mtime".to_vec(), Value::Integer(mtime)),
                None => {
                    log::warn!("Cannot read mtime of staged file {:?}", staged);
                    None
                }
            };
        }
        file_entries.push(Value::Dict(record));

        // a piece is only available if every file overlapping it is
        let first_piece = (entry.file.torrent_offset / piece_len) as usize;
        let last_piece = ((entry.file.torrent_end() + piece_len - 1) / piece_len) as usize;
        if !completed {
            for piece in first_piece..last_piece.min(piece_count) {
                log::debug!("Setting piece {} to false", piece);
                bitfield.set(piece, false);
            }
        }
    }

    let bitfield_value = if bitfield.all() {
        // seeding clients want the number of pieces when content is complete
        Value::Integer(piece_count as i64)
    } else {
        Value::Bytes(bitfield.into_vec())
    };

    let mut resume = BTreeMap::new();
    resume.insert(b"bitfield".to_vec(), bitfield_value);
    resume.insert(b"files".to_vec(), Value::List(file_entries));
    Value::Dict(resume)
}

/// The path a torrent file occupies below the staging directory.
fn staged_path(destination_path: &Path, entry: &FileMatch) -> PathBuf {
    entry
        .file
        .path
        .iter()
        .fold(destination_path.to_path_buf(), |p, c| p.join(c))
}

fn make_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|error| AssembleError::CreateDir {
        path: path.to_path_buf(),
        error,
    })
}

fn file_mtime(path: &Path) -> Option<i64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let seconds = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(seconds as i64)
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}
