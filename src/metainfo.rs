use std::fmt;

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::metainfo::{MetainfoError, Result};
use crate::{Sha1Hash, PIECE_HASH_LEN};

/// The meta info from a torrent file.
///
/// The decoded structure is kept alongside the typed fields so the info-hash
/// is always computed over the original bytes. Decoded path strings are a
/// best-effort view for filesystem work; they never feed back into hashing.
#[derive(Clone)]
pub struct Metainfo {
    /// The full decoded torrent, preserved byte-exact for re-encoding.
    root: Value,
    /// torrent name, the form for the staging path.
    name: String,
    /// contains a concatenation of each piece's SHA-1,
    /// length is a multiple of 20 bytes.
    pieces: Vec<u8>,
    /// the length of each piece except possibly the last.
    piece_len: u64,
    /// every file in the torrent, in metainfo order.
    files: Vec<TorrentFile>,
    /// whether the torrent carried a `files` list.
    multi_file: bool,
}

/// One file of a torrent, with its position in the concatenated content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components relative to the staging directory, decoded
    /// best-effort. The last component is the file name.
    pub path: Vec<String>,
    /// Size of the file in bytes.
    pub len: u64,
    /// Position in the metainfo file list.
    pub index: usize,
    /// Byte offset of the file's first byte in the concatenated content.
    pub torrent_offset: u64,
}

impl TorrentFile {
    /// The file name, i.e. the last path component.
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// The end offset of this file in the concatenated content.
    pub fn torrent_end(&self) -> u64 {
        self.torrent_offset + self.len
    }
}

impl fmt::Debug for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metainfo")
            .field("name", &self.name)
            .field("pieces", &"<pieces...>")
            .field("piece_len", &self.piece_len)
            .field("files", &self.files)
            .finish()
    }
}

/// Decodes a raw byte string as UTF-8, falling back to ISO-8859-1.
///
/// The fallback cannot fail: every byte maps to the code point of the same
/// value.
pub fn try_decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            log::debug!("Failed to decode {:?} using UTF-8", bytes);
            bytes.iter().map(|&b| char::from(b)).collect()
        }
    }
}

/// Returns false for path components that could escape the staging tree.
fn is_legal_component(component: &str) -> bool {
    component != "." && component != ".." && !component.contains('/')
}

impl Metainfo {
    /// Parses a torrent file buffer into a [`Metainfo`] instance.
    ///
    /// Verification rules:
    /// - the bencode syntax must be correct and `info` present.
    /// - the length of `pieces` must be a multiple of 20 and cover the
    ///   total content length.
    /// - exactly one of `length` (single file) and `files` (multi file)
    ///   must be present.
    /// - no decoded path component may be `.`, `..`, or contain `/`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let root = bencode::decode(bytes)?;
        Self::from_value(root)
    }

    /// Like [`Metainfo::from_bytes`], starting from an already decoded value.
    pub fn from_value(root: Value) -> Result<Self> {
        let info = root
            .get(b"info")
            .and_then(|v| v.as_dict())
            .ok_or(MetainfoError::MissingField("info"))?;

        let name_raw = info
            .get(b"name".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("name"))?;
        let name = try_decode(name_raw);
        if !is_legal_component(&name) {
            log::warn!("Torrent name {:?} is a dangerous path", name);
            return Err(MetainfoError::IllegalPath(name));
        }

        let piece_len = info
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_int())
            .ok_or(MetainfoError::MissingField("piece length"))?;
        if piece_len <= 0 {
            log::warn!("Piece length {} is not positive", piece_len);
            return Err(MetainfoError::InvalidMetainfo);
        }
        let piece_len = piece_len as u64;

        let pieces = info
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        // the pieces field is a concatenation of 20 byte SHA-1 hashes, so it
        // must be a multiple of 20
        if pieces.len() % PIECE_HASH_LEN != 0 {
            return Err(MetainfoError::InvalidPieces);
        }

        let length = info.get(b"length".as_slice());
        let file_list = info.get(b"files".as_slice());

        let mut files = Vec::new();
        match (length, file_list) {
            (Some(_), Some(_)) => {
                log::warn!("Metainfo cannot contain both `length` and `files`");
                return Err(MetainfoError::InvalidMetainfo);
            }
            (Some(length), None) => {
                let len = length.as_int().ok_or(MetainfoError::MissingField("length"))?;
                if len <= 0 {
                    log::warn!("File length {} is not positive", len);
                    return Err(MetainfoError::InvalidMetainfo);
                }

                // the path of this file is just the torrent name
                files.push(TorrentFile {
                    path: vec![name.clone()],
                    len: len as u64,
                    index: 0,
                    torrent_offset: 0,
                });
            }
            (None, Some(file_list)) => {
                let raw_files = file_list
                    .as_list()
                    .ok_or(MetainfoError::MissingField("files"))?;
                if raw_files.is_empty() {
                    log::warn!("Metainfo files must not be empty");
                    return Err(MetainfoError::InvalidMetainfo);
                }

                files.reserve_exact(raw_files.len());

                // the running offset of each file in the content
                let mut torrent_offset = 0;
                for (index, file) in raw_files.iter().enumerate() {
                    let len = file
                        .get(b"length")
                        .and_then(|v| v.as_int())
                        .ok_or(MetainfoError::MissingField("length"))?;
                    if len < 0 {
                        log::warn!("File length {} is negative", len);
                        return Err(MetainfoError::InvalidMetainfo);
                    }

                    let raw_path = file
                        .get(b"path")
                        .and_then(|v| v.as_list())
                        .ok_or(MetainfoError::MissingField("path"))?;

                    // decode components best-effort, dropping empty fragments
                    let mut path = Vec::with_capacity(raw_path.len());
                    for component in raw_path {
                        let component = component
                            .as_bytes()
                            .ok_or(MetainfoError::MissingField("path"))?;
                        if component.is_empty() {
                            continue;
                        }
                        let component = try_decode(component);
                        if !is_legal_component(&component) {
                            log::warn!("Torrent path {:?} is dangerous", component);
                            return Err(MetainfoError::IllegalPath(component));
                        }
                        path.push(component);
                    }
                    if path.is_empty() {
                        log::warn!("Path in metainfo is empty");
                        return Err(MetainfoError::InvalidMetainfo);
                    }

                    files.push(TorrentFile {
                        path,
                        len: len as u64,
                        index,
                        torrent_offset,
                    });
                    torrent_offset += len as u64;
                }
            }
            (None, None) => {
                log::warn!("No `length` or `files` key present in metainfo");
                return Err(MetainfoError::InvalidMetainfo);
            }
        }

        let total: u64 = files.iter().map(|f| f.len).sum();
        let expected_pieces = (total + piece_len - 1) / piece_len;
        if (pieces.len() / PIECE_HASH_LEN) as u64 != expected_pieces {
            log::warn!(
                "Piece table has {} pieces, content needs {}",
                pieces.len() / PIECE_HASH_LEN,
                expected_pieces
            );
            return Err(MetainfoError::InvalidPieces);
        }

        Ok(Metainfo {
            name,
            pieces: pieces.to_vec(),
            piece_len,
            files,
            multi_file: file_list.is_some(),
            root,
        })
    }

    /// The torrent name, best-effort decoded.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the torrent carries more than a bare file.
    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn piece_len(&self) -> u64 {
        self.piece_len
    }

    /// The number of pieces in the piece table.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / PIECE_HASH_LEN
    }

    /// The expected SHA-1 of the given piece.
    pub fn piece_hash(&self, index: usize) -> Sha1Hash {
        let mut hash = [0; PIECE_HASH_LEN];
        hash.copy_from_slice(&self.pieces[index * PIECE_HASH_LEN..][..PIECE_HASH_LEN]);
        hash
    }

    /// Every file of the torrent in metainfo order, with cumulative offsets.
    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    /// The lowercase hex SHA-1 over the re-encoded `info` dictionary.
    ///
    /// Computed from the preserved decoded structure, so it is identical to
    /// hashing the corresponding span of the original file.
    pub fn info_hash(&self) -> String {
        let info = self.root.get(b"info").expect("validated on parse");
        let digest = Sha1::digest(bencode::encode(info));
        hex::encode(digest)
    }

    /// The preserved decoded torrent.
    pub fn value(&self) -> &Value {
        &self.root
    }

    /// A copy of the torrent with a `libtorrent_resume` dictionary attached.
    pub fn with_resume(&self, resume: Value) -> Value {
        let mut root = self.root.clone();
        root.insert(b"libtorrent_resume".as_slice(), resume);
        root
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testutil::build_torrent;

    #[test]
    fn parses_multi_file_layout() {
        let torrent = build_torrent(
            "test",
            16384,
            &[
                (&["file_a.txt"], b"aaaaaaaaaaa".to_vec()),
                (&["sub", "file_b.txt"], b"bbbbbbbbbbb".to_vec()),
            ],
        );
        let metainfo = Metainfo::from_value(torrent).unwrap();

        assert_eq!(metainfo.name(), "test");
        assert!(metainfo.is_multi_file());
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(
            metainfo.files(),
            &[
                TorrentFile {
                    path: vec!["file_a.txt".to_string()],
                    len: 11,
                    index: 0,
                    torrent_offset: 0,
                },
                TorrentFile {
                    path: vec!["sub".to_string(), "file_b.txt".to_string()],
                    len: 11,
                    index: 1,
                    torrent_offset: 11,
                },
            ]
        );
    }

    #[test]
    fn parses_single_file_layout() {
        let torrent = build_torrent("file_a.txt", 16384, &[(&[], b"aaaaaaaaaaa".to_vec())]);
        let metainfo = Metainfo::from_value(torrent).unwrap();

        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.files().len(), 1);
        assert_eq!(metainfo.files()[0].path, vec!["file_a.txt".to_string()]);
        assert_eq!(metainfo.files()[0].len, 11);
    }

    #[test]
    fn info_hash_is_stable_across_reencoding() {
        let torrent = build_torrent("test", 16384, &[(&["a"], vec![b'x'; 100])]);
        let encoded = crate::bencode::encode(&torrent);

        let metainfo = Metainfo::from_bytes(&encoded).unwrap();
        let reencoded = crate::bencode::encode(metainfo.value());
        assert_eq!(reencoded, encoded);

        let reparsed = Metainfo::from_bytes(&reencoded).unwrap();
        assert_eq!(reparsed.info_hash(), metainfo.info_hash());
    }

    #[test]
    fn rejects_dangerous_paths() {
        for component in [".", "..", "a/b"] {
            let torrent = build_torrent("test", 16384, &[(&[component], vec![b'x'; 4])]);
            assert!(matches!(
                Metainfo::from_value(torrent),
                Err(MetainfoError::IllegalPath(_))
            ));
        }

        let torrent = build_torrent("..", 16384, &[(&["a"], vec![b'x'; 4])]);
        assert!(matches!(
            Metainfo::from_value(torrent),
            Err(MetainfoError::IllegalPath(_))
        ));
    }

    #[test]
    fn drops_empty_path_fragments() {
        let torrent = build_torrent("test", 16384, &[(&["", "a"], vec![b'x'; 4])]);
        let metainfo = Metainfo::from_value(torrent).unwrap();
        assert_eq!(metainfo.files()[0].path, vec!["a".to_string()]);
    }

    #[test]
    fn rejects_short_piece_table() {
        let mut torrent = build_torrent("test", 64, &[(&["a"], vec![b'x'; 200])]);
        // truncate the piece table to a single piece
        if let Value::Dict(root) = &mut torrent {
            let info = root.get_mut(b"info".as_slice()).unwrap();
            let pieces = info.get(b"pieces").unwrap().as_bytes().unwrap()[..20].to_vec();
            info.insert(b"pieces".as_slice(), Value::Bytes(pieces));
        }
        assert!(matches!(
            Metainfo::from_value(torrent),
            Err(MetainfoError::InvalidPieces)
        ));
    }

    #[test]
    fn decodes_names_with_fallback() {
        assert_eq!(try_decode(b"\xbf"), "\u{bf}");
        assert_eq!(try_decode(b"\xc3\xbc"), "\u{fc}");
        assert_eq!(try_decode(b"a"), "a");
    }
}
