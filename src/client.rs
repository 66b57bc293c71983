//! The capability the engine needs from a concrete torrent client.
//!
//! RPC adapters live outside this crate; the engine only ever sees this
//! trait and treats every implementation as opaque.

use std::collections::HashSet;
use std::path::Path;

use crate::bencode::Value;
use crate::matcher::FileMatch;

/// Connects the engine to a running torrent client.
///
/// Adapters fail in backend-specific ways (transport, authentication, RPC
/// versions), so errors are opaque; the engine maps any failure to the
/// failed-to-add status of the torrent at hand.
pub trait ClientAdapter {
    /// The set of info-hashes currently added to the client, lowercase hex.
    fn get_torrents(&self) -> anyhow::Result<HashSet<String>>;

    /// Hands a staged torrent to the client.
    ///
    /// `torrent` is the decoded metainfo, already carrying fast-resume data
    /// when `fast_resume` is set. `destination_path` holds the staged
    /// content. Returns whether the client accepted the torrent.
    fn add_torrent(
        &mut self,
        torrent: &Value,
        destination_path: &Path,
        files: &[FileMatch],
        fast_resume: bool,
    ) -> anyhow::Result<bool>;

    /// Probes the connection and returns identifying information from the
    /// client.
    fn test_connection(&self) -> anyhow::Result<String>;
}
