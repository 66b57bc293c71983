//! Set of module Error
pub mod assemble;
pub mod bencode;
pub mod index;
pub mod metainfo;

pub use assemble::{AssembleError, Result as AssembleResult};
pub use bencode::{BencodeError, Result as BencodeResult};
pub use index::{IndexError, Result as IndexResult};
pub use metainfo::{MetainfoError, Result as MetainfoResult};

pub type EngineResult<T, E = Error> = std::result::Result<T, E>;

/// The top-level error for a torrent hand-off run.
///
/// Per-torrent failures carry enough context for the host to report them and
/// continue with the next torrent; only configuration errors are fatal for
/// the whole run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("unknown link type {0:?}")]
    /// The configured link type is neither `soft` nor `hard`. Fatal for
    /// the run.
    UnknownLinkType(String),

    #[error("{0}")]
    /// Holds global IO related errors.
    Io(#[from] std::io::Error),

    #[error("torrent file {path}: {error}")]
    /// The metainfo file could not be decoded or failed validation.
    Metainfo {
        path: std::path::PathBuf,
        error: MetainfoError,
    },

    #[error("{0}")]
    /// The file index failed at the storage layer.
    Index(#[from] IndexError),

    #[error("staging failed: {0}")]
    /// Link creation or rewrite streaming failed before the client hand-off.
    Assemble(#[from] AssembleError),

    #[error("client adapter error: {0}")]
    /// An opaque error raised by the torrent client adapter.
    Client(#[from] anyhow::Error),
}
