//! Piece-level verification of candidate files against a torrent's piece
//! table.
//!
//! A candidate is never hashed in full: a sample of whole pieces from the
//! head and the tail decides whether it carries the wanted content, and a
//! budgeted forward probe locates the piece boundary where a misaligned
//! candidate diverges.

use std::cmp;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::metainfo::Metainfo;
use crate::Sha1Hash;

/// The piece table of one torrent, ready for sampled verification.
pub struct Pieces {
    piece_len: u64,
    hashes: Vec<Sha1Hash>,
}

/// The slice of the piece table wholly contained in one file's extent.
#[derive(Debug, PartialEq, Eq)]
pub struct Window<'a> {
    /// Bytes to skip at the file's start to reach the first contained piece
    /// boundary.
    pub head_offset: u64,
    /// Bytes at the file's end past the last contained piece boundary.
    pub tail_offset: u64,
    /// The expected hashes of the contained pieces.
    pub hashes: &'a [Sha1Hash],
}

impl Pieces {
    pub fn new(metainfo: &Metainfo) -> Self {
        Pieces {
            piece_len: metainfo.piece_len(),
            hashes: (0..metainfo.piece_count())
                .map(|i| metainfo.piece_hash(i))
                .collect(),
        }
    }

    /// The pieces wholly contained within `[file_start, file_end)` of the
    /// concatenated content.
    pub fn window(&self, file_start: u64, file_end: u64) -> Window<'_> {
        let first = (file_start + self.piece_len - 1) / self.piece_len;
        let last = file_end / self.piece_len;
        if last <= first {
            return Window {
                head_offset: 0,
                tail_offset: 0,
                hashes: &[],
            };
        }
        Window {
            head_offset: first * self.piece_len - file_start,
            tail_offset: file_end - last * self.piece_len,
            hashes: &self.hashes[first as usize..last as usize],
        }
    }

    /// Samples whole pieces from both ends of a candidate file and reports
    /// whether its head and tail carry the expected content.
    ///
    /// Tail probes are aligned to the end of the candidate, so a candidate
    /// whose size differs from the target extent is still recognized when
    /// its suffix is intact.
    pub fn match_file(&self, path: &Path, file_start: u64, file_end: u64) -> (bool, bool) {
        let window = self.window(file_start, file_end);
        let piece_count = window.hashes.len();
        if piece_count == 0 {
            return (false, false);
        }

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Cannot open candidate {:?}: {}", path, e);
                return (false, false);
            }
        };
        let candidate_size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                log::warn!("Cannot stat candidate {:?}: {}", path, e);
                return (false, false);
            }
        };

        let probes = cmp::max(piece_count / 10, 1);
        let required = match probes {
            0..=3 => 1,
            4..=9 => 2,
            _ => cmp::max(probes / 10, 3),
        };
        log::debug!(
            "Hash probing {:?} with {} pieces per end, {} required",
            path,
            probes,
            required
        );

        let mut buf = vec![0; self.piece_len as usize];

        let mut head_matches = 0;
        for (i, expected) in window.hashes.iter().take(probes).enumerate() {
            let offset = window.head_offset + i as u64 * self.piece_len;
            if self.piece_at(&mut file, offset, &mut buf) == Some(*expected) {
                head_matches += 1;
            }
        }

        // align the probe window with the end of the candidate, which is
        // where the suffix of a size-mismatched file lives
        let target_len = file_end - file_start;
        let shift = candidate_size as i64 - target_len as i64;
        let mut tail_matches = 0;
        for (i, expected) in window.hashes.iter().enumerate().skip(piece_count - probes) {
            let offset = window.head_offset as i64 + i as i64 * self.piece_len as i64 + shift;
            if offset < 0 {
                continue;
            }
            if self.piece_at(&mut file, offset as u64, &mut buf) == Some(*expected) {
                tail_matches += 1;
            }
        }

        (head_matches >= required, tail_matches >= required)
    }

    /// Walks pieces forward from the head until the miss budget is spent and
    /// returns the offset, relative to the file start, of the piece boundary
    /// ending the contiguous run of matching pieces.
    ///
    /// Every piece before the returned offset hashes correctly, which makes
    /// it the right place to splice bytes in or out of the candidate.
    pub fn find_piece_breakpoint(&self, path: &Path, file_start: u64, file_end: u64) -> u64 {
        let window = self.window(file_start, file_end);

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Cannot open candidate {:?}: {}", path, e);
                return window.head_offset;
            }
        };

        let mut budget = cmp::max(window.hashes.len() / 20, 1);
        let mut buf = vec![0; self.piece_len as usize];
        let mut run = 0;
        let mut unbroken = true;

        for (i, expected) in window.hashes.iter().enumerate() {
            let offset = window.head_offset + i as u64 * self.piece_len;
            if self.piece_at(&mut file, offset, &mut buf) == Some(*expected) {
                if unbroken {
                    run = i + 1;
                }
            } else {
                unbroken = false;
                budget -= 1;
                if budget == 0 {
                    break;
                }
            }
        }

        let breakpoint = window.head_offset + run as u64 * self.piece_len;
        log::debug!(
            "Breakpoint for {:?} after {} contiguous pieces, at {}",
            path,
            run,
            breakpoint
        );
        breakpoint
    }

    /// Hashes one whole piece at the given file offset. `None` when the file
    /// is too short or unreadable there.
    fn piece_at(&self, file: &mut File, offset: u64, buf: &mut [u8]) -> Option<Sha1Hash> {
        file.seek(SeekFrom::Start(offset)).ok()?;
        file.read_exact(buf).ok()?;
        Some(Sha1::digest(buf).into())
    }
}
