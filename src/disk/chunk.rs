use crate::{priority::Priority, ChunkIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    NotDownloaded,
    /// The chunk passed its hash check and is stored in the cache.
    OnDisk,
}

/// The bookkeeping of one chunk of the torrent.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub(crate) index: ChunkIndex,
    pub(crate) size: u32,
    pub(crate) status: ChunkStatus,
    pub(crate) priority: Priority,
}

impl Chunk {
    pub(crate) fn new(index: ChunkIndex, size: u32) -> Self {
        Self {
            index,
            size,
            status: ChunkStatus::NotDownloaded,
            priority: Priority::Normal,
        }
    }

    pub fn index(&self) -> ChunkIndex {
        self.index
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn is_excluded(&self) -> bool {
        self.priority == Priority::Excluded
    }

    pub fn is_excluded_for_downloading(&self) -> bool {
        !self.priority.is_wanted()
    }
}
