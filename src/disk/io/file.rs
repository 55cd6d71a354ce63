use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Weak,
    },
};

#[cfg(test)]
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;

use super::{disk_usage_of, mmap::MappingKey, pwrite_all};
use crate::{
    conf::DiskConf,
    disk::piece::PieceData,
    error::disk::{Result, StorageError},
};

/// How a file or a mapping of it is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn writes(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Receives the number of bytes a file was extended to during preallocation.
pub trait ProgressSink {
    fn written(&self, bytes: u64);
}

impl ProgressSink for AtomicU64 {
    fn written(&self, bytes: u64) {
        self.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// A mapping handed out by [`CacheFile::map`].
pub(super) struct MappingEntry {
    /// The piece the mapping belongs to. Weak so the table does not keep the
    /// piece alive.
    pub owner: Weak<PieceData>,
    /// The page aligned offset the OS mapping starts at.
    pub offset: u64,
    /// The length of the OS mapping, including the alignment padding.
    pub size: usize,
    pub mode: OpenMode,
}

/// One file of a torrent on disk.
///
/// The OS handle is opened lazily and closed again as soon as nothing needs
/// it, so that torrents with thousands of files do not exhaust the file
/// descriptor limit. All access goes through a single lock, because the
/// preallocation worker and the primary thread use the same file.
pub struct CacheFile {
    pub(super) inner: Mutex<FileInner>,
    map_attempts: AtomicU64,
    #[cfg(test)]
    pub(super) fail_mmap: AtomicBool,
}

pub(super) struct FileInner {
    pub path: PathBuf,
    /// The declared size of the file, it is never grown beyond.
    pub max_size: u64,
    /// The current length of the file on disk, as far as we know.
    pub file_size: u64,
    pub handle: Option<File>,
    pub read_only: bool,
    pub mappings: HashMap<MappingKey, MappingEntry>,
    pub reserved_fds: u64,
}

impl CacheFile {
    /// Records the path and the size the file will have once complete. The
    /// file itself is not touched.
    pub fn open(path: impl Into<PathBuf>, max_size: u64, conf: &DiskConf) -> Self {
        Self {
            inner: Mutex::new(FileInner {
                path: path.into(),
                max_size,
                file_size: 0,
                handle: None,
                read_only: false,
                mappings: HashMap::new(),
                reserved_fds: conf.reserved_fds,
            }),
            map_attempts: AtomicU64::new(0),
            #[cfg(test)]
            fail_mmap: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    pub fn max_size(&self) -> u64 {
        self.inner.lock().max_size
    }

    /// Points the file at a new location, e.g. after the data was moved.
    /// An open handle keeps referring to the moved file.
    pub fn change_path(&self, path: impl Into<PathBuf>) {
        self.inner.lock().path = path.into();
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    /// Closes the OS handle and releases every mapping. Pieces still holding
    /// a mapping of this file are unloaded.
    pub fn close(&self) {
        let owners: Vec<Weak<PieceData>> = {
            let mut inner = self.inner.lock();
            inner.handle = None;
            inner.mappings.drain().map(|(_, e)| e.owner).collect()
        };
        // the lock must not be held here, unloading a piece takes the
        // piece's own lock
        for owner in owners {
            if let Some(piece) = owner.upgrade() {
                piece.unmapped();
            }
        }
    }

    /// The number of mappings currently handed out.
    pub fn mapping_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// The number of mappings whose piece no longer exists. Always 0 unless
    /// a piece is being dropped on another thread right now.
    pub fn orphaned_mappings(&self) -> usize {
        self.inner
            .lock()
            .mappings
            .values()
            .filter(|e| e.owner.strong_count() == 0)
            .count()
    }

    /// How often a mapping was requested, successful or not.
    pub fn map_attempts(&self) -> u64 {
        self.map_attempts.load(Ordering::Relaxed)
    }

    pub(super) fn count_map_attempt(&self) {
        self.map_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Makes every following `map` call fail as if the OS refused.
    #[cfg(test)]
    pub(crate) fn inject_mmap_failure(&self, fail: bool) {
        self.fail_mmap.store(fail, Ordering::Relaxed);
    }

    /// The number of bytes the file occupies on disk.
    pub fn disk_usage(&self) -> Result<u64> {
        disk_usage_of(&self.path())
    }

    /// Extends the file to its maximum size and reports the size reached to
    /// the progress sink.
    ///
    /// With `fully` the blocks are reserved with `posix_fallocate` where
    /// available, falling back to writing zeros. Otherwise the length is
    /// just set, leaving a sparse file.
    pub fn preallocate(&self, fully: bool, progress: &dyn ProgressSink) -> Result<()> {
        let mut inner = self.inner.lock();
        let res = inner.preallocate(fully);
        inner.close_if_unused();
        let size = res?;
        progress.written(size);
        Ok(())
    }
}

impl FileInner {
    /// Opens the OS handle if it is not open yet. A file that cannot be
    /// opened for writing is opened read only when only reading is wanted.
    pub fn open_handle(&mut self, mode: OpenMode) -> Result<()> {
        if self.handle.is_none() {
            let (file, read_only) = open_file(&self.path, mode)?;
            self.file_size = file
                .metadata()
                .map_err(|e| StorageError::io(&self.path, e))?
                .len();
            self.read_only = read_only;
            self.handle = Some(file);
        }

        if mode.writes() && self.read_only {
            return Err(StorageError::ReadOnlyFile(self.path.clone()));
        }
        Ok(())
    }

    /// Returns the open handle.
    pub fn file(&self) -> Result<&File> {
        self.handle.as_ref().ok_or_else(|| StorageError::Io {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::NotConnected, "file is not open"),
        })
    }

    /// Grows the file to `end` bytes, refusing to go past the maximum size.
    pub fn grow(&mut self, end: u64) -> Result<()> {
        if end > self.max_size {
            log::warn!(
                "Attempting to grow {:?} to {} bytes, beyond its maximum size {}",
                self.path,
                end,
                self.max_size
            );
            return Err(StorageError::BeyondMaxSize {
                path: self.path.clone(),
                end,
                max: self.max_size,
            });
        }
        if self.read_only {
            return Err(StorageError::ReadOnlyFile(self.path.clone()));
        }

        self.file()?.set_len(end).map_err(|e| {
            log::warn!("Cannot expand file {:?}: {}", self.path, e);
            match StorageError::io(&self.path, e) {
                StorageError::Io { path, source } => StorageError::Grow { path, source },
                other => other,
            }
        })?;
        self.file_size = end;
        Ok(())
    }

    /// Closes the handle if no mapping needs it. It is reopened on the next
    /// access.
    pub fn close_if_unused(&mut self) {
        if self.mappings.is_empty() {
            self.handle = None;
        }
    }

    fn preallocate(&mut self, fully: bool) -> Result<u64> {
        let on_disk = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if on_disk >= self.max_size {
            log::info!("{:?} is already big enough", self.path);
            return Ok(self.max_size);
        }

        log::info!(
            "Preallocating {:?} to {} bytes ({})",
            self.path,
            self.max_size,
            if fully { "fully" } else { "sparse" }
        );
        self.open_handle(OpenMode::ReadWrite)?;
        let file = self.file()?;
        let res = if fully {
            allocate_fully(file, on_disk, self.max_size)
        } else {
            file.set_len(self.max_size)
        };
        res.map_err(|e| {
            log::warn!("Cannot preallocate diskspace for {:?}: {}", self.path, e);
            StorageError::Preallocate {
                path: self.path.clone(),
                source: e,
            }
        })?;

        self.file_size = self.max_size;
        Ok(self.max_size)
    }

    /// Checks that the file is still at least `required` bytes long, which
    /// must hold before touching the pages of a mapping ending there.
    pub fn check_backing(&mut self, required: u64) -> Result<()> {
        let len = match &self.handle {
            Some(file) => file.metadata().map(|m| m.len()),
            None => fs::metadata(&self.path).map(|m| m.len()),
        }
        .unwrap_or(0);

        if len < required {
            log::warn!(
                "{:?} shrank to {} bytes while {} bytes are mapped",
                self.path,
                len,
                required
            );
            self.file_size = len;
            return Err(StorageError::IoFault {
                path: self.path.clone(),
                file_len: len,
                required,
            });
        }
        Ok(())
    }
}

fn open_file(path: &Path, mode: OpenMode) -> Result<(File, bool)> {
    let rw = OpenOptions::new()
        .create(mode.writes())
        .read(true)
        .write(true)
        .open(path);
    match rw {
        Ok(file) => Ok((file, false)),
        Err(e) if mode == OpenMode::Read && path.exists() => {
            let file = File::open(path).map_err(|_| {
                log::warn!("Failed to open file {:?}: {}", path, e);
                StorageError::Open {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;
            Ok((file, true))
        }
        Err(e) => {
            log::warn!("Failed to open file {:?}: {}", path, e);
            Err(StorageError::Open {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }
}

#[cfg(target_os = "linux")]
fn allocate_fully(file: &File, from: u64, to: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    match nix::fcntl::posix_fallocate(file.as_raw_fd(), 0, to as nix::libc::off_t) {
        Ok(()) => Ok(()),
        Err(errno) => {
            log::debug!("posix_fallocate failed ({}), writing zeros instead", errno);
            zero_fill(file, from, to)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn allocate_fully(file: &File, from: u64, to: u64) -> io::Result<()> {
    zero_fill(file, from, to)
}

fn zero_fill(file: &File, from: u64, to: u64) -> io::Result<()> {
    const FILL_BLOCK: usize = 1 << 20;
    let zeros = vec![0u8; FILL_BLOCK];
    let mut pos = from;
    while pos < to {
        let n = (to - pos).min(FILL_BLOCK as u64) as usize;
        pwrite_all(file, &zeros[..n], pos)?;
        pos += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;

    /// Constructing the file does not create it on disk.
    #[test]
    fn should_open_lazily() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lazy");
        let file = CacheFile::open(&path, 100, &DiskConf::default());
        assert!(!path.exists());
        assert!(!file.is_open());
        assert_eq!(file.max_size(), 100);
    }

    #[test]
    fn should_preallocate_to_max_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prealloc");
        let progress = AtomicU64::new(0);

        let sparse = CacheFile::open(&path, 3000, &DiskConf::default());
        sparse.preallocate(false, &progress).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 3000);
        assert!(!sparse.is_open());

        let full_path = dir.path().join("full");
        let full = CacheFile::open(&full_path, 5000, &DiskConf::default());
        full.preallocate(true, &progress).unwrap();
        assert_eq!(fs::metadata(&full_path).unwrap().len(), 5000);
        assert!(full.disk_usage().unwrap() >= 5000);

        assert_eq!(progress.load(Ordering::Relaxed), 8000);
    }

    /// A file that is already complete is left alone but still counted.
    #[test]
    fn should_skip_preallocating_complete_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("done");
        fs::write(&path, vec![7u8; 64]).unwrap();
        let progress = AtomicU64::new(0);

        let file = CacheFile::open(&path, 64, &DiskConf::default());
        file.preallocate(true, &progress).unwrap();
        assert_eq!(progress.load(Ordering::Relaxed), 64);
        assert_eq!(fs::read(&path).unwrap(), vec![7u8; 64]);
    }

    /// Closing the file unloads pieces mapping it, and their later drop does
    /// not unmap twice.
    #[test]
    fn should_unload_mapped_pieces_on_close() {
        let dir = TempDir::new().unwrap();
        let file = Arc::new(CacheFile::open(
            dir.path().join("mapped"),
            4096 * 3,
            &DiskConf::default(),
        ));
        let piece = PieceData::new_unloaded(crate::blockinfo::BlockInfo::new(0, 0, 100), false);
        match file
            .map(Arc::downgrade(&piece), 4000, 100, OpenMode::ReadWrite)
            .unwrap()
        {
            super::super::mmap::Mapping::Mapped(region) => piece.attach(region),
            super::super::mmap::Mapping::Unavailable(reason) => {
                // mmap can legitimately be unavailable on some test filesystems
                log::warn!("mmap unavailable: {}", reason);
                return;
            }
        }
        assert!(file.is_open());
        assert_eq!(file.mapping_count(), 1);

        file.close();
        assert_eq!(file.mapping_count(), 0);
        assert!(!file.is_open());
        assert!(!piece.is_loaded());
        assert!(matches!(
            piece.read(&mut [0u8; 4], 0),
            Err(StorageError::Unloaded)
        ));
        drop(piece);
        assert_eq!(file.mapping_count(), 0);
    }
}
