//! The engine is the top-level coordinator: it owns the file index and the
//! client adapter, and runs each torrent through the full transaction of
//! matching, admission, staging, and hand-off.
//!
//! Every [`Engine::handle_torrent`] call is self-contained; a failed torrent
//! reports its status or error and leaves the engine ready for the next one.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::assemble;
use crate::client::ClientAdapter;
use crate::conf::Conf;
use crate::error::{EngineResult, Error};
use crate::index::Index;
use crate::matcher::{self, MatchMode};
use crate::metainfo::Metainfo;

/// The outcome of handling one torrent file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The torrent was staged and accepted by the client.
    Ok,
    /// Too much content is missing to admit the torrent.
    MissingFiles,
    /// The client already seeds this info-hash.
    AlreadySeeding,
    /// The staging directory exists but the torrent is not seeded.
    FolderExistNotSeeding,
    /// The client refused or failed to accept the torrent.
    FailedToAddToClient,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Status::Ok => "OK",
            Status::MissingFiles => "Missing",
            Status::AlreadySeeding => "Seeded",
            Status::FolderExistNotSeeding => "Exists",
            Status::FailedToAddToClient => "Failed",
        };
        f.write_str(message)
    }
}

/// The matching outcome of a dry run, with nothing staged.
#[derive(Debug)]
pub struct DryRunReport {
    pub found_bytes: u64,
    pub missing_bytes: u64,
    /// Whether the admission gate would let the torrent through.
    pub would_add: bool,
    /// The local files the matcher resolved, in metainfo order.
    pub matched_paths: Vec<PathBuf>,
}

/// Coordinates the index, matcher, assembler, and client for a deployment.
pub struct Engine<C> {
    conf: Conf,
    index: Index,
    client: C,
    /// Info-hashes the client reported as seeded, lowercase hex.
    seeded: HashSet<String>,
}

impl<C: ClientAdapter> Engine<C> {
    pub fn new(conf: Conf, client: C) -> EngineResult<Self> {
        let index = Index::open(&conf)?;
        Ok(Engine {
            conf,
            index,
            client,
            seeded: HashSet::new(),
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Rebuilds the file index; see [`Index::rebuild`].
    pub fn rebuild_index(&mut self, paths: Option<&[PathBuf]>) -> EngineResult<()> {
        self.index.rebuild(paths)?;
        Ok(())
    }

    /// Fetches the set of currently seeded info-hashes from the client.
    pub fn refresh_seeded(&mut self) -> EngineResult<()> {
        self.seeded = self
            .client
            .get_torrents()?
            .into_iter()
            .map(|hash| hash.to_lowercase())
            .collect();
        Ok(())
    }

    /// Checks a torrent file for seedable content, stages it, and hands it
    /// to the client.
    pub fn handle_torrent(&mut self, path: &Path) -> EngineResult<Status> {
        log::info!("Handling file {:?}", path);
        let metainfo = self.open_torrent(path)?;

        if self.seeded.contains(&metainfo.info_hash()) {
            log::info!("Torrent {:?} is already seeded", metainfo.name());
            self.delete_torrent_file(path);
            return Ok(Status::AlreadySeeding);
        }

        let result = matcher::match_torrent(&mut self.index, &metainfo)?;
        if result.is_refused(self.conf.add_limit_size, self.conf.add_limit_percent) {
            let total = (result.found_bytes + result.missing_bytes) as f64;
            log::info!(
                "Files missing from {:?}, only {:.2}% found ({} bytes missing)",
                path,
                result.found_bytes as f64 / total * 100.0,
                result.missing_bytes
            );
            return Ok(Status::MissingFiles);
        }

        let destination_path = match result.mode {
            MatchMode::Link | MatchMode::Hash => {
                log::info!("Preparing torrent using link mode");
                let destination = self.conf.store_path.join(torrent_stem(path));
                if destination.is_dir() {
                    log::info!("Folder exists but torrent is not seeded: {:?}", destination);
                    return Ok(Status::FolderExistNotSeeding);
                }
                assemble::link_files(&destination, &result.files, self.conf.link_type)?;
                destination
            }
            MatchMode::Exact => {
                log::info!("Preparing torrent using exact mode");
                debug_assert!(result.source_path.is_some());
                match result.source_path.clone() {
                    Some(source) => source,
                    None => self.conf.store_path.join(torrent_stem(path)),
                }
            }
        };

        let fast_resume = result.mode != MatchMode::Hash;
        if result.mode == MatchMode::Hash {
            log::info!("There are files found using hashing that need rewriting");
            assemble::rewrite_files(&destination_path, &result.files)?;
        }

        let torrent = if fast_resume {
            let resume = assemble::fast_resume(&metainfo, &result.files, &destination_path);
            metainfo.with_resume(resume)
        } else {
            metainfo.value().clone()
        };

        self.delete_torrent_file(path);

        if self
            .client
            .add_torrent(&torrent, &destination_path, &result.files, fast_resume)?
        {
            Ok(Status::Ok)
        } else {
            Ok(Status::FailedToAddToClient)
        }
    }

    /// Runs matching and the admission computation without staging anything.
    pub fn dry_run(&mut self, path: &Path) -> EngineResult<DryRunReport> {
        let metainfo = self.open_torrent(path)?;
        let result = matcher::match_torrent(&mut self.index, &metainfo)?;

        let matched_paths = result
            .files
            .iter()
            .filter_map(|f| f.decision.actual_path())
            .map(Path::to_path_buf)
            .collect();
        Ok(DryRunReport {
            found_bytes: result.found_bytes,
            missing_bytes: result.missing_bytes,
            would_add: !result.is_refused(self.conf.add_limit_size, self.conf.add_limit_percent),
            matched_paths,
        })
    }

    fn open_torrent(&self, path: &Path) -> EngineResult<Metainfo> {
        let bytes = fs::read(path)?;
        Metainfo::from_bytes(&bytes).map_err(|error| Error::Metainfo {
            path: path.to_path_buf(),
            error,
        })
    }

    fn delete_torrent_file(&self, path: &Path) {
        if !self.conf.delete_torrents {
            return;
        }
        log::info!("Removing torrent {:?}", path);
        if let Err(e) = fs::remove_file(path) {
            log::warn!("Cannot remove torrent {:?}: {}", path, e);
        }
    }
}

/// The staging directory name for a torrent file: its base name without the
/// extension.
fn torrent_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;

    use super::*;
    use crate::bencode::{self, Value};
    use crate::conf::ScanModes;
    use crate::matcher::FileMatch;
    use crate::testutil::{build_torrent, create_file, patterned_content, write_torrent_file};

    /// An in-memory stand-in for a torrent client.
    struct MemoryClient {
        hashes: HashSet<String>,
        accept: bool,
        last_destination: Option<PathBuf>,
        last_fast_resume: Option<bool>,
        last_torrent: Option<Value>,
    }

    impl MemoryClient {
        fn new() -> Self {
            MemoryClient {
                hashes: HashSet::new(),
                accept: true,
                last_destination: None,
                last_fast_resume: None,
                last_torrent: None,
            }
        }
    }

    impl ClientAdapter for MemoryClient {
        fn get_torrents(&self) -> anyhow::Result<HashSet<String>> {
            Ok(self.hashes.clone())
        }

        fn add_torrent(
            &mut self,
            torrent: &Value,
            destination_path: &Path,
            _files: &[FileMatch],
            fast_resume: bool,
        ) -> anyhow::Result<bool> {
            let info = torrent.get(b"info").expect("torrent has an info dict");
            let info_hash = hex::encode(Sha1::digest(bencode::encode(info)));
            self.hashes.insert(info_hash);
            self.last_destination = Some(destination_path.to_path_buf());
            self.last_fast_resume = Some(fast_resume);
            self.last_torrent = Some(torrent.clone());
            Ok(self.accept)
        }

        fn test_connection(&self) -> anyhow::Result<String> {
            Ok("memory client".to_string())
        }
    }

    fn engine_fixture(dir: &TempDir, modes: ScanModes) -> Engine<MemoryClient> {
        let mut conf = Conf::new(
            dir.path().join("index.db"),
            vec![dir.path().join("src")],
            dir.path().join("dst"),
        );
        conf.scan_modes = modes;
        Engine::new(conf, MemoryClient::new()).unwrap()
    }

    fn three_file_setup(dir: &TempDir, names: &[&str]) -> PathBuf {
        for name in names {
            let byte = name.as_bytes()[5];
            create_file(&dir.path().join("src").join(name), &vec![byte; 11]);
        }

        let torrent = build_torrent(
            "test",
            32768,
            &[
                (&["file_a.txt"], vec![b'a'; 11]),
                (&["file_b.txt"], vec![b'b'; 11]),
                (&["file_c.txt"], vec![b'c'; 11]),
            ],
        );
        let path = dir.path().join("test.torrent");
        write_torrent_file(&path, &torrent);
        path
    }

    #[test]
    fn stages_and_adds_a_fully_matched_torrent() {
        let dir = TempDir::new().unwrap();
        let torrent = three_file_setup(&dir, &["file_a.txt", "file_b.txt", "file_c.txt"]);

        let mut engine = engine_fixture(&dir, ScanModes::default());
        engine.rebuild_index(None).unwrap();
        engine.refresh_seeded().unwrap();

        assert_eq!(engine.handle_torrent(&torrent).unwrap(), Status::Ok);

        // the torrent file itself stays around by default
        assert!(torrent.is_file());
        for name in ["file_a.txt", "file_b.txt", "file_c.txt"] {
            assert!(dir.path().join("dst/test").join(name).is_file());
        }

        let client = engine.client();
        assert_eq!(
            client.last_destination,
            Some(dir.path().join("dst/test"))
        );
        assert_eq!(client.last_fast_resume, Some(true));

        // complete content collapses the resume bitfield to the piece count
        let added = client.last_torrent.as_ref().unwrap();
        let resume = added.get(b"libtorrent_resume").unwrap();
        assert_eq!(resume.get(b"bitfield"), Some(&Value::Integer(1)));
    }

    #[test]
    fn refuses_a_torrent_missing_too_much() {
        let dir = TempDir::new().unwrap();
        let torrent = three_file_setup(&dir, &["file_a.txt", "file_c.txt"]);

        let mut engine = engine_fixture(&dir, ScanModes::default());
        engine.rebuild_index(None).unwrap();

        assert_eq!(engine.handle_torrent(&torrent).unwrap(), Status::MissingFiles);
        assert!(!dir.path().join("dst/test").exists());
    }

    #[test]
    fn admits_a_partial_torrent_under_lax_limits() {
        let dir = TempDir::new().unwrap();
        let torrent = three_file_setup(&dir, &["file_a.txt", "file_c.txt"]);

        let mut engine = engine_fixture(&dir, ScanModes::default());
        engine.conf.add_limit_percent = 50.0;
        engine.conf.add_limit_size = 12;
        engine.rebuild_index(None).unwrap();

        assert_eq!(engine.handle_torrent(&torrent).unwrap(), Status::Ok);
        assert!(dir.path().join("dst/test/file_a.txt").is_file());
        assert!(!dir.path().join("dst/test/file_b.txt").exists());

        // partial content keeps the packed bitfield form
        let added = engine.client().last_torrent.as_ref().unwrap();
        let resume = added.get(b"libtorrent_resume").unwrap();
        assert!(matches!(resume.get(b"bitfield"), Some(Value::Bytes(_))));
    }

    #[test]
    fn reports_seeded_and_colliding_torrents() {
        let dir = TempDir::new().unwrap();
        let torrent = three_file_setup(&dir, &["file_a.txt", "file_b.txt", "file_c.txt"]);

        let mut engine = engine_fixture(&dir, ScanModes::default());
        engine.rebuild_index(None).unwrap();
        engine.refresh_seeded().unwrap();

        assert_eq!(engine.handle_torrent(&torrent).unwrap(), Status::Ok);

        // the staging directory now exists, but the seeded set is stale
        assert_eq!(
            engine.handle_torrent(&torrent).unwrap(),
            Status::FolderExistNotSeeding
        );

        engine.refresh_seeded().unwrap();
        assert_eq!(
            engine.handle_torrent(&torrent).unwrap(),
            Status::AlreadySeeding
        );
    }

    #[test]
    fn surfaces_a_client_refusal() {
        let dir = TempDir::new().unwrap();
        let torrent = three_file_setup(&dir, &["file_a.txt", "file_b.txt", "file_c.txt"]);

        let mut engine = engine_fixture(&dir, ScanModes::default());
        engine.client.accept = false;
        engine.rebuild_index(None).unwrap();

        assert_eq!(
            engine.handle_torrent(&torrent).unwrap(),
            Status::FailedToAddToClient
        );
    }

    #[test]
    fn deletes_the_torrent_file_when_configured() {
        let dir = TempDir::new().unwrap();
        let torrent = three_file_setup(&dir, &["file_a.txt", "file_b.txt", "file_c.txt"]);

        let mut engine = engine_fixture(&dir, ScanModes::default());
        engine.conf.delete_torrents = true;
        engine.rebuild_index(None).unwrap();

        assert_eq!(engine.handle_torrent(&torrent).unwrap(), Status::Ok);
        assert!(!torrent.exists());
    }

    #[test]
    fn rewrites_hash_matches_without_fast_resume() {
        let dir = TempDir::new().unwrap();
        let content = patterned_content(22528);

        let mut spliced = content[..10028].to_vec();
        spliced.extend_from_slice(&[0; 51]);
        spliced.extend_from_slice(&content[10028..]);
        create_file(&dir.path().join("src/othername_WHAT"), &spliced);

        let torrent = build_torrent("file_b", 256, &[(&[], content.clone())]);
        let torrent_path = dir.path().join("realign.torrent");
        write_torrent_file(&torrent_path, &torrent);

        let modes = ScanModes {
            normal: false,
            unsplitable: false,
            exact: false,
            hash_name: true,
            hash_size: true,
            hash_slow: true,
        };
        let mut engine = engine_fixture(&dir, modes);
        engine.rebuild_index(None).unwrap();

        assert_eq!(engine.handle_torrent(&torrent_path).unwrap(), Status::Ok);
        assert_eq!(engine.client().last_fast_resume, Some(false));

        let staged = fs::read(dir.path().join("dst/realign/file_b")).unwrap();
        assert_eq!(staged.len(), 22528);
        assert_eq!(&staged[..100], &content[..100]);
        assert_eq!(&staged[staged.len() - 100..], &content[content.len() - 100..]);
    }

    #[test]
    fn exact_matches_seed_in_place() {
        let dir = TempDir::new().unwrap();
        for (name, byte) in [("file_a.txt", b'a'), ("file_b.txt", b'b'), ("file_c.txt", b'c')] {
            create_file(&dir.path().join("src/test").join(name), &vec![byte; 11]);
        }
        let torrent = build_torrent(
            "test",
            32768,
            &[
                (&["file_a.txt"], vec![b'a'; 11]),
                (&["file_b.txt"], vec![b'b'; 11]),
                (&["file_c.txt"], vec![b'c'; 11]),
            ],
        );
        let torrent_path = dir.path().join("test.torrent");
        write_torrent_file(&torrent_path, &torrent);

        let mut modes = ScanModes::default();
        modes.exact = true;
        let mut engine = engine_fixture(&dir, modes);
        engine.rebuild_index(None).unwrap();

        assert_eq!(engine.handle_torrent(&torrent_path).unwrap(), Status::Ok);
        assert_eq!(
            engine.client().last_destination,
            Some(dir.path().join("src/test"))
        );
        // nothing is staged for exact matches
        assert!(!dir.path().join("dst/test").exists());
    }

    #[test]
    fn dry_run_reports_without_staging() {
        let dir = TempDir::new().unwrap();
        let torrent = three_file_setup(&dir, &["file_a.txt", "file_b.txt", "file_c.txt"]);

        let mut engine = engine_fixture(&dir, ScanModes::default());
        engine.rebuild_index(None).unwrap();

        let report = engine.dry_run(&torrent).unwrap();
        assert_eq!(report.found_bytes, 33);
        assert_eq!(report.missing_bytes, 0);
        assert!(report.would_add);
        assert_eq!(
            report.matched_paths,
            vec![
                dir.path().join("src/file_a.txt"),
                dir.path().join("src/file_b.txt"),
                dir.path().join("src/file_c.txt"),
            ]
        );
        assert!(!dir.path().join("dst/test").exists());
    }

    #[test]
    fn rejects_a_malformed_torrent_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.torrent");
        create_file(&path, b"d4:info");

        let mut engine = engine_fixture(&dir, ScanModes::default());
        assert!(matches!(
            engine.handle_torrent(&path),
            Err(Error::Metainfo { .. })
        ));
    }
}
