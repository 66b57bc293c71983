/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// Per-piece availability of a torrent.
///
/// It is a compact bool vector from most significant bit to least
/// significant bit, that is, the highest bit of the first byte represents
/// the first piece, the next bit the second piece, and so on. This matches
/// the big-endian packing fast-resume data is serialized with.
pub type Bitfield = bitvec::prelude::BitVec<u8, bitvec::prelude::Msb0>;

/// The number of bytes a piece hash occupies in the piece table.
pub(crate) const PIECE_HASH_LEN: usize = 20;
