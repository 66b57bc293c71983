//! The persistent file index over the configured scan roots.
//!
//! One ordered key/value store backs six logical tables; which tables a
//! rebuild populates is decided by the configured scan modes. Per-entry
//! problems (unreadable files, undecodable names) are logged and skipped so
//! a single bad entry cannot abort a scan.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::bencode::{self, Value};
use crate::conf::{Conf, ScanModes};
use crate::error::index::Result;
use crate::unsplitable::{is_unsplitable, root_of_unsplitable};

/// Which exact table a raw name is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExactKind {
    File,
    Dir,
}

impl ExactKind {
    fn prefix(self) -> &'static str {
        match self {
            ExactKind::File => "f",
            ExactKind::Dir => "d",
        }
    }
}

/// The content-addressable index of already-downloaded files.
pub struct Index {
    db: sled::Db,
    disks: Vec<PathBuf>,
    ignore_files: Vec<glob::Pattern>,
    modes: ScanModes,
    /// Sorted distinct sizes, materialized for the lifetime of one matching
    /// pass when slow hash mode probes varying sizes.
    size_table: Option<Vec<u64>>,
}

/// Normalizes a filename to better detect similar files.
pub fn normalize_filename(filename: &str) -> String {
    filename.replace(' ', "_").to_lowercase()
}

/// One scanned directory: its files with sizes and its subdirectory names.
struct ScannedDir {
    path: PathBuf,
    files: Vec<(String, u64)>,
    subdirs: Vec<String>,
}

impl Index {
    /// Opens the backing store at the configured path.
    ///
    /// The store is held exclusively by this process until the index is
    /// dropped.
    pub fn open(conf: &Conf) -> Result<Self> {
        let db = sled::open(&conf.db_path)?;

        let mut ignore_files = Vec::with_capacity(conf.ignore_files.len());
        for pattern in &conf.ignore_files {
            match glob::Pattern::new(&normalize_filename(pattern)) {
                Ok(pattern) => ignore_files.push(pattern),
                Err(e) => log::warn!("Ignoring bad ignore pattern {:?}: {}", pattern, e),
            }
        }

        Ok(Index {
            db,
            disks: conf.disks.clone(),
            ignore_files,
            modes: conf.scan_modes,
            size_table: None,
        })
    }

    pub fn modes(&self) -> &ScanModes {
        &self.modes
    }

    /// Rebuilds the index.
    ///
    /// With no paths the store is truncated and every configured root is
    /// rescanned; with paths the listed roots are scanned into the existing
    /// store, extending it.
    pub fn rebuild(&mut self, paths: Option<&[PathBuf]>) -> Result<()> {
        let roots = match paths {
            None => {
                log::info!("Truncating the index");
                self.db.clear()?;
                self.disks.clone()
            }
            Some(paths) => paths.to_vec(),
        };

        for root in &roots {
            log::info!("Scanning {:?}", root);
            self.scan_root(root)?;
            log::info!("Done scanning {:?}", root);
        }

        self.db.flush()?;
        self.clear_size_table();
        Ok(())
    }

    /// Looks for a file by normalized name and size.
    pub fn find_normal(&self, name: &str, size: u64) -> Option<PathBuf> {
        let key = digest_key(size, [normalize_filename(name).as_str()]);
        self.get_path(key.as_bytes())
    }

    /// Looks for a file inside an unsplitable release by its release root,
    /// subpath below the root, name, and size.
    pub fn find_unsplitable(
        &self,
        root: &str,
        subpath: &[&str],
        name: &str,
        size: u64,
    ) -> Option<PathBuf> {
        let mut parts = Vec::with_capacity(subpath.len() + 2);
        parts.push(normalize_filename(root));
        parts.extend(subpath.iter().map(|p| normalize_filename(p)));
        parts.push(normalize_filename(name));
        let key = digest_key(size, parts.iter().map(String::as_str));
        self.get_path(key.as_bytes())
    }

    /// Every indexed path carrying exactly this raw file or directory name.
    pub fn find_exact(&self, kind: ExactKind, raw_name: &str) -> Vec<PathBuf> {
        self.get_path_list(format!("{}:{}", kind.prefix(), raw_name).as_bytes())
    }

    /// Every indexed path whose normalized name matches.
    pub fn find_hash_by_name(&self, name: &str) -> Vec<PathBuf> {
        let digest = hex::encode(Sha256::digest(normalize_filename(name)));
        self.get_path_list(format!("n:{}", digest).as_bytes())
    }

    /// Every indexed path of exactly this size.
    pub fn find_hash_by_size(&self, size: u64) -> Vec<PathBuf> {
        self.get_path_list(size_key(size).as_bytes())
    }

    /// Every indexed path within 10% of this size, closest sizes first.
    ///
    /// Requires [`Index::build_size_table`] to have been called for the
    /// current matching pass.
    pub fn find_hash_by_varying_size(&self, size: u64) -> Vec<PathBuf> {
        let table = match &self.size_table {
            Some(table) => table,
            None => {
                log::warn!("Varying-size lookup without a size table");
                return Vec::new();
            }
        };

        let epsilon = size / 10;
        let lo = size.saturating_sub(epsilon);
        let hi = size.saturating_add(epsilon);

        let start = table.partition_point(|&s| s < lo);
        let mut candidates: Vec<u64> = table[start..]
            .iter()
            .take_while(|&&s| s <= hi)
            .copied()
            .collect();
        candidates.sort_by_key(|&s| (s.abs_diff(size), s));

        candidates
            .into_iter()
            .flat_map(|s| self.find_hash_by_size(s))
            .collect()
    }

    /// Materializes the sorted set of indexed sizes for a matching pass.
    pub fn build_size_table(&mut self) -> Result<()> {
        let mut sizes = Vec::new();
        for entry in self.db.scan_prefix(b"s:") {
            let (key, _) = entry?;
            if let Some(size) = std::str::from_utf8(&key[2..])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                sizes.push(size);
            }
        }
        sizes.sort_unstable();
        sizes.dedup();
        log::debug!("Size table built with {} distinct sizes", sizes.len());
        self.size_table = Some(sizes);
        Ok(())
    }

    /// Drops the materialized size table.
    pub fn clear_size_table(&mut self) {
        self.size_table = None;
    }

    fn get_path(&self, key: &[u8]) -> Option<PathBuf> {
        match self.db.get(key) {
            Ok(value) => value.map(|v| PathBuf::from(String::from_utf8_lossy(&v).into_owned())),
            Err(e) => {
                log::warn!("Index lookup failed: {}", e);
                None
            }
        }
    }

    fn get_path_list(&self, key: &[u8]) -> Vec<PathBuf> {
        let value = match self.db.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::warn!("Index lookup failed: {}", e);
                return Vec::new();
            }
        };

        match bencode::decode(&value) {
            Ok(Value::List(items)) => items
                .iter()
                .filter_map(|item| item.as_bytes())
                .map(|b| PathBuf::from(String::from_utf8_lossy(b).into_owned()))
                .collect(),
            _ => {
                log::warn!("Corrupt index entry for key {:?}", String::from_utf8_lossy(key));
                Vec::new()
            }
        }
    }

    fn scan_root(&mut self, root: &Path) -> Result<()> {
        let root = match fs::canonicalize(root) {
            Ok(root) => root,
            Err(e) => {
                log::warn!("Cannot canonicalize root {:?}: {}", root, e);
                return Ok(());
            }
        };

        let mut dirs = Vec::new();
        self.collect_dirs(&root, &mut dirs);

        // preliminary pass: which directories sit under an unsplitable root
        let unsplitable_roots = find_unsplitable_roots(&dirs);

        for dir in &dirs {
            let release_root = self
                .modes
                .unsplitable
                .then(|| nearest_unsplitable_root(&dir.path, &unsplitable_roots))
                .flatten();

            for (name, size) in &dir.files {
                let path = dir.path.join(name);

                if let Some(release_root) = &release_root {
                    self.insert_unsplitable(release_root, &dir.path, name, *size, &path);
                } else if self.modes.normal {
                    self.insert_normal(name, *size, &path);
                }

                if self.modes.exact {
                    self.append_multi(format!("f:{}", name).as_bytes(), &path);
                }
                if self.modes.hash_name {
                    let digest = hex::encode(Sha256::digest(normalize_filename(name)));
                    self.append_multi(format!("n:{}", digest).as_bytes(), &path);
                }
                if self.modes.wants_size_table() {
                    self.append_multi(size_key(*size).as_bytes(), &path);
                }
            }

            if self.modes.exact {
                for subdir in &dir.subdirs {
                    let path = dir.path.join(subdir);
                    self.append_multi(format!("d:{}", subdir).as_bytes(), &path);
                }
            }
        }

        Ok(())
    }

    /// Walks a directory tree depth-first, recording each directory's files
    /// and subdirectories in name order.
    fn collect_dirs(&self, dir: &Path, out: &mut Vec<ScannedDir>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot read directory {:?}: {}", dir, e);
                return;
            }
        };

        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Cannot read an entry of {:?}: {}", dir, e);
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata() {
                Ok(meta) if meta.is_dir() => subdirs.push(name),
                Ok(meta) if meta.is_file() => files.push((name, meta.len())),
                Ok(_) => log::debug!("Skipping special file {:?}", entry.path()),
                Err(e) => log::warn!("Cannot stat {:?}: {}", entry.path(), e),
            }
        }

        // a stable order keeps rebuilds deterministic
        files.sort();
        subdirs.sort();

        for subdir in &subdirs {
            self.collect_dirs(&dir.join(subdir), out);
        }
        out.push(ScannedDir {
            path: dir.to_path_buf(),
            files,
            subdirs,
        });
    }

    fn insert_normal(&self, name: &str, size: u64, path: &Path) {
        let normalized = normalize_filename(name);
        if self
            .ignore_files
            .iter()
            .any(|pattern| pattern.matches(&normalized))
        {
            log::debug!("Ignoring {:?}", path);
            return;
        }

        let key = digest_key(size, [normalized.as_str()]);
        self.insert_path(key.as_bytes(), path);
    }

    fn insert_unsplitable(
        &self,
        release_root: &Path,
        dir: &Path,
        name: &str,
        size: u64,
        path: &Path,
    ) {
        let root_name = match release_root.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return,
        };

        let mut parts = vec![normalize_filename(&root_name)];
        if let Ok(subpath) = dir.strip_prefix(release_root) {
            parts.extend(
                subpath
                    .components()
                    .map(|c| normalize_filename(&c.as_os_str().to_string_lossy())),
            );
        }
        parts.push(normalize_filename(name));

        let key = digest_key(size, parts.iter().map(String::as_str));
        self.insert_path(key.as_bytes(), path);
    }

    /// Single-valued insert with the duplicate policy: the last writer wins,
    /// and a collision between different inodes is reported.
    fn insert_path(&self, key: &[u8], path: &Path) {
        let path_str = path.to_string_lossy().into_owned();

        match self.db.get(key) {
            Ok(Some(existing)) if existing.as_ref() != path_str.as_bytes() => {
                let existing = PathBuf::from(String::from_utf8_lossy(&existing).into_owned());
                if !is_same_inode(&existing, path) {
                    log::warn!("Duplicate key {:?} and {:?}", path, existing);
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Index read failed for {:?}: {}", path, e),
        }

        if let Err(e) = self.db.insert(key, path_str.as_bytes()) {
            log::warn!("Index write failed for {:?}: {}", path, e);
        }
    }

    /// Appends a path to a multi-valued entry, keeping the list duplicate
    /// free.
    fn append_multi(&self, key: &[u8], path: &Path) {
        let path_bytes = path.to_string_lossy().into_owned().into_bytes();

        let mut items = match self.db.get(key) {
            Ok(Some(value)) => match bencode::decode(&value) {
                Ok(Value::List(items)) => items,
                _ => Vec::new(),
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("Index read failed for {:?}: {}", path, e);
                return;
            }
        };

        if items
            .iter()
            .any(|item| item.as_bytes() == Some(path_bytes.as_slice()))
        {
            return;
        }
        items.push(Value::Bytes(path_bytes));

        let encoded = bencode::encode(&Value::List(items));
        if let Err(e) = self.db.insert(key, encoded) {
            log::warn!("Index write failed for {:?}: {}", path, e);
        }
    }
}

/// Turns a size and the tuple of name parts into a stable store key.
fn digest_key<'a>(size: u64, parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut joined = size.to_string();
    for part in parts {
        joined.push('|');
        joined.push_str(part);
    }
    hex::encode(Sha256::digest(joined))
}

fn size_key(size: u64) -> String {
    format!("s:{}", size)
}

/// The preliminary pass of a rebuild: every release root that covers an
/// unsplitable directory.
fn find_unsplitable_roots(dirs: &[ScannedDir]) -> HashSet<PathBuf> {
    let mut roots = HashSet::new();
    for dir in dirs {
        if !is_unsplitable(dir.files.iter().map(|(name, _)| name.as_str())) {
            continue;
        }

        let components: Vec<&str> = dir
            .path
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        let root_name = match root_of_unsplitable(components.iter().copied()) {
            Some(name) => name,
            None => continue,
        };

        // the stored root path terminates at the first non-packaging
        // component above the unsplitable directory
        let mut root = dir.path.clone();
        let found = loop {
            let at_root = root
                .file_name()
                .map(|name| name.to_string_lossy() == root_name)
                .unwrap_or(false);
            if at_root {
                break true;
            }
            if !root.pop() {
                break false;
            }
        };
        if found {
            roots.insert(root);
        }
    }
    roots
}

/// The nearest ancestor of `dir` (including itself) that is a release root.
fn nearest_unsplitable_root(dir: &Path, roots: &HashSet<PathBuf>) -> Option<PathBuf> {
    dir.ancestors()
        .find(|a| roots.contains(*a))
        .map(Path::to_path_buf)
}

#[cfg(unix)]
fn is_same_inode(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.ino() == b.ino() && a.dev() == b.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn is_same_inode(_a: &Path, _b: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::testutil::create_file;

    fn test_conf(dir: &TempDir, disks: Vec<PathBuf>) -> Conf {
        let mut conf = Conf::new(dir.path().join("index.db"), disks, dir.path().join("store"));
        conf.scan_modes = ScanModes {
            normal: true,
            unsplitable: true,
            exact: true,
            hash_name: true,
            hash_size: true,
            hash_slow: true,
        };
        conf
    }

    fn simple_fixture(dir: &TempDir) -> PathBuf {
        let root = dir.path().join("data");
        create_file(&root.join("file_a.txt"), &vec![b'x'; 11]);
        create_file(&root.join("file_b.txt"), &vec![b'y'; 20]);
        create_file(&root.join("sub/nested.bin"), &vec![b'z'; 30]);
        root
    }

    #[test]
    fn finds_files_by_normalized_name_and_size() {
        let dir = TempDir::new().unwrap();
        let root = simple_fixture(&dir);
        create_file(&root.join("B C"), &vec![b'q'; 16]);

        let mut index = Index::open(&test_conf(&dir, vec![root.clone()])).unwrap();
        index.rebuild(None).unwrap();

        assert_eq!(
            index.find_normal("file_a.txt", 11),
            Some(root.join("file_a.txt"))
        );
        assert_eq!(index.find_normal("file_a.txt", 12), None);
        assert_eq!(index.find_normal("nested.bin", 30), Some(root.join("sub/nested.bin")));

        // normalization folds case and spaces
        assert_eq!(index.find_normal("B C", 16), Some(root.join("B C")));
        assert_eq!(index.find_normal("b_c", 16), index.find_normal("B C", 16));
    }

    #[test]
    fn ignore_patterns_only_mask_the_normal_table() {
        let dir = TempDir::new().unwrap();
        let root = simple_fixture(&dir);

        let mut conf = test_conf(&dir, vec![root.clone()]);
        conf.ignore_files = vec!["*.txt".to_string()];
        let mut index = Index::open(&conf).unwrap();
        index.rebuild(None).unwrap();

        assert_eq!(index.find_normal("file_a.txt", 11), None);
        assert_eq!(index.find_normal("nested.bin", 30), Some(root.join("sub/nested.bin")));
        // hash and exact tables are unaffected
        assert_eq!(
            index.find_hash_by_name("file_a.txt"),
            vec![root.join("file_a.txt")]
        );
        assert_eq!(
            index.find_exact(ExactKind::File, "file_a.txt"),
            vec![root.join("file_a.txt")]
        );
    }

    #[test]
    fn last_writer_wins_on_duplicate_keys() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        create_file(&root.join("one/movie.mkv"), &vec![b'x'; 50]);
        create_file(&root.join("two/movie.mkv"), &vec![b'y'; 50]);

        let mut index = Index::open(&test_conf(&dir, vec![root.clone()])).unwrap();
        index.rebuild(None).unwrap();

        // directories are walked in name order, so `two` is scanned last
        assert_eq!(
            index.find_normal("movie.mkv", 50),
            Some(root.join("two/movie.mkv"))
        );
    }

    #[test]
    fn rebuild_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let root = simple_fixture(&dir);

        let mut index = Index::open(&test_conf(&dir, vec![root])).unwrap();
        index.rebuild(None).unwrap();
        let first = (
            index.find_normal("file_a.txt", 11),
            index.find_hash_by_size(11),
            index.find_exact(ExactKind::Dir, "sub"),
        );

        index.rebuild(None).unwrap();
        let second = (
            index.find_normal("file_a.txt", 11),
            index.find_hash_by_size(11),
            index.find_exact(ExactKind::Dir, "sub"),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn rebuild_with_paths_extends_the_index() {
        let dir = TempDir::new().unwrap();
        let root_one = dir.path().join("one");
        let root_two = dir.path().join("two");
        create_file(&root_one.join("first.bin"), &vec![b'x'; 10]);
        create_file(&root_two.join("second.bin"), &vec![b'y'; 10]);

        let mut index = Index::open(&test_conf(&dir, vec![root_one.clone()])).unwrap();
        index.rebuild(None).unwrap();
        assert_eq!(index.find_normal("second.bin", 10), None);

        index.rebuild(Some(&[root_two.clone()])).unwrap();
        assert_eq!(
            index.find_normal("first.bin", 10),
            Some(root_one.join("first.bin"))
        );
        assert_eq!(
            index.find_normal("second.bin", 10),
            Some(root_two.join("second.bin"))
        );
    }

    #[test]
    fn groups_unsplitable_releases_under_their_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        for part in ["r00", "r01", "rar", "sfv"] {
            create_file(
                &root.join("Some-CD-Release/CD1").join(format!("somestuff-1.{}", part)),
                &vec![b'x'; 11],
            );
        }
        // same bare name elsewhere must not shadow the release copy
        create_file(&root.join("unrelated/somestuff-1.r00"), &vec![b'z'; 11]);

        let mut index = Index::open(&test_conf(&dir, vec![root.clone()])).unwrap();
        index.rebuild(None).unwrap();

        assert_eq!(
            index.find_unsplitable("Some-CD-Release", &["CD1"], "somestuff-1.r00", 11),
            Some(root.join("Some-CD-Release/CD1/somestuff-1.r00"))
        );
        // release files are keyed under the root, not by bare name
        assert_eq!(
            index.find_normal("somestuff-1.r00", 11),
            Some(root.join("unrelated/somestuff-1.r00"))
        );
    }

    #[test]
    fn exact_tables_use_raw_names() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        create_file(&root.join("My Movie/content.mkv"), &vec![b'x'; 9]);

        let mut index = Index::open(&test_conf(&dir, vec![root.clone()])).unwrap();
        index.rebuild(None).unwrap();

        assert_eq!(
            index.find_exact(ExactKind::Dir, "My Movie"),
            vec![root.join("My Movie")]
        );
        assert_eq!(index.find_exact(ExactKind::Dir, "my_movie"), Vec::<PathBuf>::new());
        assert_eq!(
            index.find_exact(ExactKind::File, "content.mkv"),
            vec![root.join("My Movie/content.mkv")]
        );
    }

    #[test]
    fn varying_size_lookup_orders_by_distance() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("data");
        create_file(&root.join("exact.bin"), &vec![b'a'; 1000]);
        create_file(&root.join("near.bin"), &vec![b'b'; 1020]);
        create_file(&root.join("nearer.bin"), &vec![b'c'; 990]);
        create_file(&root.join("far.bin"), &vec![b'd'; 2000]);

        let mut index = Index::open(&test_conf(&dir, vec![root.clone()])).unwrap();
        index.rebuild(None).unwrap();
        index.build_size_table().unwrap();

        assert_eq!(
            index.find_hash_by_varying_size(1000),
            vec![
                root.join("exact.bin"),
                root.join("nearer.bin"),
                root.join("near.bin"),
            ]
        );

        index.clear_size_table();
        assert_eq!(index.find_hash_by_varying_size(1000), Vec::<PathBuf>::new());
    }
}
