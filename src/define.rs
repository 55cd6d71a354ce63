use bitvec::{order::Msb0, vec::BitVec};

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The zero-based index of a chunk within the torrent.
pub type ChunkIndex = u32;

/// The zero-based index of a file within the torrent's file list.
pub type FileIndex = usize;

/// One bit per chunk, most significant bit first, matching the wire
/// representation of the peer protocol's bitfield message.
pub type Bitfield = BitVec<u8, Msb0>;

/// The length of a block requested by peers, 16 KiB.
///
/// Pieces handed out to the protocol layer are at most this long, except
/// when a whole chunk is loaded for hashing.
pub const BLOCK_LEN: u32 = 0x4000;
