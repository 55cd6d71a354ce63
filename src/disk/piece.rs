use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::io::mmap::MappedRegion;
use crate::{
    blockinfo::BlockInfo,
    error::disk::{Result, StorageError},
    ChunkIndex, Sha1Hash,
};

/// Pieces are shared between the cache and the protocol layer. The cache's
/// own reference counts as one, see [`PieceData::in_use`].
pub type PiecePtr = Arc<PieceData>;

enum Backing {
    /// Released, or not attached yet.
    Unloaded,
    Heap(Box<[u8]>),
    Mapped(MappedRegion),
}

/// A fixed length view of a range of one chunk.
///
/// The bytes live either in a memory mapping of the backing file, in which
/// case writes land on disk without further ado, or in a heap buffer that the
/// cache flushes on `save_piece`.
pub struct PieceData {
    block: BlockInfo,
    read_only: bool,
    backing: Mutex<Backing>,
}

impl PieceData {
    /// Creates a piece without data, to be attached to a mapping.
    pub(crate) fn new_unloaded(block: BlockInfo, read_only: bool) -> PiecePtr {
        Arc::new(Self {
            block,
            read_only,
            backing: Mutex::new(Backing::Unloaded),
        })
    }

    /// Creates a zeroed heap backed piece.
    pub(crate) fn new_heap(block: BlockInfo, read_only: bool) -> PiecePtr {
        Arc::new(Self {
            block,
            read_only,
            backing: Mutex::new(Backing::Heap(vec![0u8; block.len as usize].into_boxed_slice())),
        })
    }

    pub(crate) fn attach(&self, region: MappedRegion) {
        debug_assert_eq!(region.len(), self.block.len as usize);
        *self.backing.lock() = Backing::Mapped(region);
    }

    pub fn block(&self) -> BlockInfo {
        self.block
    }

    pub fn chunk(&self) -> ChunkIndex {
        self.block.chunk
    }

    /// The offset of the piece within its chunk.
    pub fn offset(&self) -> u32 {
        self.block.offset
    }

    pub fn len(&self) -> u32 {
        self.block.len
    }

    pub fn is_empty(&self) -> bool {
        self.block.len == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn writable(&self) -> bool {
        !self.read_only
    }

    pub fn is_mapped(&self) -> bool {
        matches!(*self.backing.lock(), Backing::Mapped(_))
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(*self.backing.lock(), Backing::Unloaded)
    }

    /// Whether someone besides the cache holds the piece.
    pub fn in_use(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) > 1
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<()> {
        if offset as u64 + len as u64 > self.block.len as u64 {
            return Err(StorageError::OutOfBounds {
                offset,
                len: len as u32,
                piece_len: self.block.len,
            });
        }
        Ok(())
    }

    /// Copies `dst.len()` bytes starting at `offset` within the piece.
    pub fn read(&self, dst: &mut [u8], offset: u32) -> Result<()> {
        self.check_bounds(offset, dst.len())?;
        let start = offset as usize;
        let end = start + dst.len();
        self.with_data(|data| dst.copy_from_slice(&data[start..end]))
    }

    /// Copies `src` into the piece at `offset`.
    pub fn write(&self, src: &[u8], offset: u32) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnlyViolation);
        }
        self.check_bounds(offset, src.len())?;
        let start = offset as usize;
        let end = start + src.len();
        self.with_data_mut(|data| data[start..end].copy_from_slice(src))
    }

    /// Computes the SHA-1 hash of the whole piece.
    pub fn hash(&self) -> Result<Sha1Hash> {
        self.with_data(|data| Sha1::digest(data).into())
    }

    /// Releases the mapping or the heap buffer. Does nothing if already
    /// unloaded.
    pub fn unload(&self) {
        let old = std::mem::replace(&mut *self.backing.lock(), Backing::Unloaded);
        // dropped outside the lock, releasing a mapping takes the file's lock
        drop(old);
    }

    /// Called by the file when it drops the mapping itself on close.
    pub(crate) fn unmapped(&self) {
        let old = {
            let mut backing = self.backing.lock();
            match &mut *backing {
                Backing::Mapped(region) => region.detach(),
                _ => return,
            }
            std::mem::replace(&mut *backing, Backing::Unloaded)
        };
        drop(old);
    }

    /// Runs `f` on the piece's bytes, after making sure a mapping is still
    /// backed by its file.
    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let backing = self.backing.lock();
        match &*backing {
            Backing::Unloaded => Err(StorageError::Unloaded),
            Backing::Heap(buf) => Ok(f(&buf[..])),
            Backing::Mapped(region) => {
                region.validate()?;
                Ok(f(region.bytes()))
            }
        }
    }

    /// Runs `f` on the piece's bytes for writing. Unlike [`PieceData::write`]
    /// this ignores the read only flag, the cache uses it to fill buffered
    /// pieces from disk.
    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut backing = self.backing.lock();
        match &mut *backing {
            Backing::Unloaded => Err(StorageError::Unloaded),
            Backing::Heap(buf) => Ok(f(&mut buf[..])),
            Backing::Mapped(region) => {
                region.validate()?;
                match region.bytes_mut() {
                    Some(data) => Ok(f(data)),
                    None => Err(StorageError::ReadOnlyViolation),
                }
            }
        }
    }
}

impl std::fmt::Debug for PieceData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceData")
            .field("block", &self.block)
            .field("read_only", &self.read_only)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
