use crate::error::BencodeError;

pub type Result<T> = std::result::Result<T, MetainfoError>;

#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
    #[error("{0}")]
    Bencode(#[from] BencodeError),

    #[error("missing or ill-typed field `{0}`")]
    MissingField(&'static str),

    #[error("invalid metainfo")]
    InvalidMetainfo,

    #[error("invalid pieces")]
    /// The piece table is not a multiple of 20 bytes or does not cover the
    /// total content length.
    InvalidPieces,

    #[error("illegal path component {0:?}")]
    /// A path component is `.`, `..`, or contains a separator. Torrents
    /// carrying such paths are rejected outright.
    IllegalPath(String),
}
