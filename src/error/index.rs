pub type Result<T> = std::result::Result<T, IndexError>;

/// Error type returned on file index failures.
///
/// Only storage-layer faults surface here. Per-entry problems during a
/// rebuild (unreadable files, undecodable names) are logged and skipped so
/// one bad entry cannot abort a whole scan.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("{0}")]
    /// The backing store failed to open, read, or write.
    Db(#[from] sled::Error),

    #[error("{0}")]
    /// An IO error occurred while walking a root.
    Io(#[from] std::io::Error),
}
