use std::fmt;

use crate::{ChunkIndex, BLOCK_LEN};

/// A block is a fixed size part of a chunk, which in turn is a fixed size
/// part of the content. Pieces handed out by the caches cover such blocks
/// (or a whole chunk when hashing), and the piece cache is keyed by them.
#[derive(
  Clone,
  Copy,
  Debug,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
)]
pub struct BlockInfo {
  /// The index of the chunk of which this is a block.
  pub chunk: ChunkIndex,
  /// The zero-based byte offset into the chunk.
  pub offset: u32,
  /// The block's length in bytes.
  pub len: u32,
}

impl BlockInfo {
  pub fn new(
    chunk: ChunkIndex,
    offset: u32,
    len: u32,
  ) -> Self {
    Self { chunk, offset, len }
  }

  /// Returns the offset one past the block's last byte within the chunk.
  pub fn end(&self) -> u32 {
    self.offset + self.len
  }
}

impl fmt::Display for BlockInfo {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(
      f,
      "(chunk: {} offset: {} len: {})",
      self.chunk, self.offset, self.len
    )
  }
}

/// Returns the length of the block at the index in the chunk.
///
/// If the chunk is not a multiple of the default block length,
/// the last block is shorter.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed the
/// chunk length.
pub fn block_len(
  chunk_len: u32,
  block_index: usize,
) -> u32 {
  let block_index = block_index as u32;
  let block_offset = block_index * BLOCK_LEN;
  assert!(chunk_len > block_offset);
  std::cmp::min(chunk_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a chunk of the given length.
pub fn block_count(chunk_len: u32) -> usize {
  // all but the last chunk are a multiple of the block length,
  // but the last chunk may be shorter so we need to account for this
  // by rounding up before dividing to get the number of blocks in chunk.
  (chunk_len as usize + (BLOCK_LEN as usize - 1))
    / BLOCK_LEN as usize
}

/// Iterates over the blocks covering a chunk of the given length.
pub fn blocks(
  chunk: ChunkIndex,
  chunk_len: u32,
) -> impl Iterator<Item = BlockInfo> {
  (0..block_count(chunk_len)).map(move |i| {
    BlockInfo::new(
      chunk,
      i as u32 * BLOCK_LEN,
      block_len(chunk_len, i),
    )
  })
}
