use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, AssembleError>;

/// Error type returned on failed staging.
///
/// Staging aborts the torrent before the client adapter is invoked; a
/// partially created staging tree is left behind (known limitation).
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("failed to create {path:?}: {error}")]
    /// The staging directory tree could not be created.
    CreateDir {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("failed to link {from:?} -> {to:?}: {error}")]
    /// Symbolic or hard link creation failed.
    Link {
        from: PathBuf,
        to: PathBuf,
        error: std::io::Error,
    },

    #[error("{0}")]
    /// An IO error occurred while streaming a rewrite.
    Io(#[from] std::io::Error),
}
