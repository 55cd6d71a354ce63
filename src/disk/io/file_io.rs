//! Buffered access to a [`CacheFile`], used when a piece could not be memory
//! mapped or spans several files.
use super::{
    file::{CacheFile, FileInner, OpenMode},
    pread_exact, pwrite_all,
};
use crate::error::disk::{Result, StorageError};

impl CacheFile {
    /// Reads exactly `buf.len()` bytes at the offset.
    ///
    /// Reading past the current end of the file is an error: the bytes have
    /// not been written yet.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let res = read_locked(&mut inner, buf, offset);
        inner.close_if_unused();
        res
    }

    /// Writes the whole buffer at the offset, growing the file as needed but
    /// never beyond its maximum size.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let res = write_locked(&mut inner, buf, offset);
        inner.close_if_unused();
        res
    }
}

fn read_locked(inner: &mut FileInner, buf: &mut [u8], offset: u64) -> Result<()> {
    inner.open_handle(OpenMode::Read)?;

    let len = buf.len() as u64;
    if offset + len > inner.file_size {
        log::warn!(
            "Reading {} bytes at {} past the end of {:?} ({} bytes)",
            len,
            offset,
            inner.path,
            inner.file_size
        );
        return Err(StorageError::ReadPastEnd {
            path: inner.path.clone(),
            offset,
            len,
            file_len: inner.file_size,
        });
    }

    pread_exact(inner.file()?, buf, offset).map_err(|e| {
        log::warn!("File {:?} read error: {}", inner.path, e);
        StorageError::io(&inner.path, e)
    })
}

fn write_locked(inner: &mut FileInner, buf: &[u8], offset: u64) -> Result<()> {
    inner.open_handle(OpenMode::Write)?;

    let end = offset + buf.len() as u64;
    if end > inner.max_size {
        return Err(StorageError::BeyondMaxSize {
            path: inner.path.clone(),
            end,
            max: inner.max_size,
        });
    }
    // fill the gap up to the write offset, the write itself extends the
    // file to its end
    if offset > inner.file_size {
        inner.grow(offset)?;
    }

    pwrite_all(inner.file()?, buf, offset).map_err(|e| {
        log::warn!("File {:?} write error: {}", inner.path, e);
        StorageError::io(&inner.path, e)
    })?;
    inner.file_size = inner.file_size.max(end);
    Ok(())
}
