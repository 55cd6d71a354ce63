use std::{io, path::PathBuf};

use crate::{ChunkIndex, FileIndex};

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Error type returned by the storage engine.
///
/// These are fatal for the torrent: the control layer is expected to stop
/// the torrent and show the message to the user.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("cannot open file {path:?}: {source}")]
    /// The backing file could not be opened or created.
    Open { path: PathBuf, source: io::Error },

    #[error("cannot open file {0:?} for writing: the file is read only")]
    /// A write or a writable mapping was requested on a file that could
    /// only be opened read only.
    ReadOnlyFile(PathBuf),

    #[error("cannot grow file {path:?} to {end} bytes, its maximum size is {max} bytes")]
    /// A write would extend the file past its declared size.
    BeyondMaxSize { path: PathBuf, end: u64, max: u64 },

    #[error("reading {len} bytes at offset {offset} of {path:?} goes past the end of the file ({file_len} bytes)")]
    /// A buffered read asked for bytes that are not in the file yet.
    ReadPastEnd {
        path: PathBuf,
        offset: u64,
        len: u64,
        file_len: u64,
    },

    #[error("cannot expand file {path:?}: {source}")]
    /// The file could not be extended.
    Grow { path: PathBuf, source: io::Error },

    #[error("IO error on {path:?}: {source}")]
    /// Any other IO error on a file.
    Io { path: PathBuf, source: io::Error },

    #[error("not enough free disk space for {0:?}")]
    /// The filesystem ran out of space.
    DiskFull(PathBuf),

    #[error("cannot preallocate diskspace for {path:?}: {source}")]
    /// Preallocation failed and the portable fallback did as well.
    Preallocate { path: PathBuf, source: io::Error },

    #[error("cannot create directory {path:?}: {source}")]
    /// Creating the output or bookkeeping directories failed.
    CreateDir { path: PathBuf, source: io::Error },

    #[error("cannot write to a piece obtained read only")]
    /// A write was attempted through a read only piece handle.
    ReadOnlyViolation,

    #[error("access of {len} bytes at offset {offset} is out of bounds of a {piece_len} byte piece")]
    /// The accessed range does not fit inside the piece or region.
    OutOfBounds { offset: u32, len: u32, piece_len: u32 },

    #[error("media fault on {path:?}: the file shrank to {file_len} bytes, {required} bytes are mapped")]
    /// The file backing a memory mapping shrank or disappeared, touching the
    /// mapped pages would have raised a bus error.
    IoFault {
        path: PathBuf,
        file_len: u64,
        required: u64,
    },

    #[error("piece data has been unloaded")]
    /// The piece's buffer was released, e.g. because its file was closed.
    Unloaded,

    #[error("invalid chunk index {0}")]
    /// The chunk index is not part of the torrent.
    InvalidChunk(ChunkIndex),

    #[error("invalid file index {0}")]
    /// The file index is not part of the torrent.
    InvalidFile(FileIndex),

    #[error("invalid torrent layout: {0}")]
    /// The torrent metadata describes an impossible layout.
    InvalidLayout(String),

    #[error("cannot save {path:?}: {reason}")]
    /// A bookkeeping record could not be encoded.
    Persist { path: PathBuf, reason: String },
}

impl StorageError {
    /// Wraps an IO error that happened on the given path, recognizing a full
    /// disk.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if is_disk_full(&source) {
            Self::DiskFull(path)
        } else {
            Self::Io { path, source }
        }
    }
}

#[cfg(unix)]
fn is_disk_full(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::ENOSPC as i32)
}

#[cfg(not(unix))]
fn is_disk_full(_: &io::Error) -> bool {
    false
}

/// The reason a memory mapping was not created.
///
/// This is never surfaced as an error: the caller falls back to a heap
/// buffer and buffered IO.
#[derive(Debug, thiserror::Error)]
pub enum MmapUnavailable {
    #[error("memory mapping is disabled")]
    Disabled,
    #[error("too many previous mmap failures")]
    TooManyFailures,
    #[error("too close to the file descriptor limit")]
    DescriptorBudget,
    #[error("the filesystem does not support mmap reliably")]
    UnreliableFilesystem,
    #[error("mmap failure injected")]
    Injected,
    #[error("mmap failed: {0}")]
    Os(io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn should_classify_enospc_as_disk_full() {
        let e = io::Error::from_raw_os_error(nix::errno::Errno::ENOSPC as i32);
        assert!(matches!(
            StorageError::io("/tmp/x", e),
            StorageError::DiskFull(_)
        ));
        let e = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(matches!(
            StorageError::io("/tmp/x", e),
            StorageError::Io { .. }
        ));
    }
}
