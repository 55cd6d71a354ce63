//! Low level access to the files backing a torrent.
//!
//! ```text
//!            ┌──────────────┐ map/unmap ┌─────────────┐
//!  PieceData │ MappedRegion ├──────────►│  CacheFile  │ one OS handle, opened lazily
//!            └──────────────┘           │  mappings   │
//!  Cache ───────── read/write ─────────►│  prealloc   │
//!                                       └─────────────┘
//!  MultiFileCache ─ first/last region ─► DndFile        boundary bytes of excluded files
//! ```
use std::{fs, fs::File, io, path::Path};

use crate::error::disk::{Result, StorageError};

pub mod dnd;
pub mod file;
mod file_io;
pub mod mmap;

/// Reads exactly `buf.len()` bytes at the offset.
#[cfg(unix)]
pub(crate) fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    match pread_up_to(file, buf, offset)? {
        n if n == buf.len() => Ok(()),
        _ => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
    }
}

/// Reads until the buffer is full or the end of the file is reached and
/// returns the number of bytes read.
pub(crate) fn pread_up_to(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match read_at(file, &mut buf[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Writes the whole buffer at the offset.
#[cfg(unix)]
pub(crate) fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        match file.seek_write(&buf[written..], offset + written as u64) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Returns the number of bytes the file occupies on disk, which is less
/// than its length for sparse files. A missing file uses nothing.
pub(crate) fn disk_usage_of(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => Ok(allocated_bytes(&meta)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

#[cfg(unix)]
fn allocated_bytes(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn allocated_bytes(meta: &fs::Metadata) -> u64 {
    meta.len()
}

/// Creates the file if it does not exist, along with its parent
/// directories. Returns true if the file was already there.
pub(crate) fn touch(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(true);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::CreateDir {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    File::create(path).map_err(|e| {
        log::warn!("Cannot create file {:?}: {}", path, e);
        StorageError::Open {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    Ok(false)
}
