//! Shared fixtures for the crate's tests: an in-memory torrent builder and
//! small filesystem helpers.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use sha1::{Digest, Sha1};

use crate::bencode::Value;

/// Creates a file with the given content, creating parent directories as
/// needed.
pub fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Deterministic filler content so piece hashes are reproducible.
pub fn patterned_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Builds a decoded torrent for the given piece length and file set.
///
/// A single entry with an empty path produces a single-file torrent named
/// `name`; otherwise every entry becomes a `files` record under `name`.
pub fn build_torrent(name: &str, piece_len: usize, files: &[(&[&str], Vec<u8>)]) -> Value {
    let mut content = Vec::new();
    for (_, data) in files {
        content.extend_from_slice(data);
    }

    let mut pieces = Vec::new();
    for piece in content.chunks(piece_len) {
        pieces.extend_from_slice(&Sha1::digest(piece));
    }

    let mut info = BTreeMap::new();
    info.insert(b"name".to_vec(), Value::from(name));
    info.insert(b"piece length".to_vec(), Value::Integer(piece_len as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(pieces));

    let single_file = files.len() == 1 && files[0].0.is_empty();
    if single_file {
        info.insert(
            b"length".to_vec(),
            Value::Integer(files[0].1.len() as i64),
        );
    } else {
        let records = files
            .iter()
            .map(|(path, data)| {
                let mut record = BTreeMap::new();
                record.insert(b"length".to_vec(), Value::Integer(data.len() as i64));
                record.insert(
                    b"path".to_vec(),
                    Value::List(path.iter().map(|c| Value::from(*c)).collect()),
                );
                Value::Dict(record)
            })
            .collect();
        info.insert(b"files".to_vec(), Value::List(records));
    }

    let mut root = BTreeMap::new();
    root.insert(b"announce".to_vec(), Value::from("http://127.0.0.1/announce"));
    root.insert(b"info".to_vec(), Value::Dict(info));
    Value::Dict(root)
}

/// Writes a decoded torrent to disk in its canonical encoding.
pub fn write_torrent_file(path: &Path, torrent: &Value) {
    create_file(path, &crate::bencode::encode(torrent));
}
