//! Memory mapped views of a [`CacheFile`].
//!
//! The OS only maps whole pages, so a request for `size` bytes at `offset`
//! maps from the page boundary below `offset` and hands out a view starting
//! `offset % page_size` bytes into the mapping:
//!
//! ```text
//!  page boundary        offset              offset + size
//!       │◄──── diff ────►│◄────── size ──────►│
//!       ├────────────────┼────────────────────┤
//!       └─── OS mapping (diff + size bytes) ──┘
//! ```
use std::{
    fmt,
    path::Path,
    sync::{Arc, Weak},
};

use memmap2::{Mmap, MmapMut, MmapOptions};
use once_cell::sync::Lazy;

use super::file::{CacheFile, FileInner, MappingEntry, OpenMode};
use crate::{
    disk::piece::PieceData,
    error::disk::{MmapUnavailable, Result, StorageError},
};

static PAGE_SIZE: Lazy<u64> = Lazy::new(page_size);

#[cfg(unix)]
fn page_size() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => 4096,
    }
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    4096
}

/// Identifies a mapping in its file's mapping table. It is the address of
/// the first byte handed out to the caller.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey(usize);

impl fmt::Debug for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The outcome of a mapping request.
pub enum Mapping {
    Mapped(MappedRegion),
    /// The caller should fall back to buffered IO.
    Unavailable(MmapUnavailable),
}

enum RegionMap {
    Read(Mmap),
    Write(MmapMut),
}

impl RegionMap {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Read(m) => m,
            Self::Write(m) => m,
        }
    }
}

/// A byte exact view of a file, released from the file's mapping table
/// when dropped.
pub struct MappedRegion {
    file: Arc<CacheFile>,
    map: RegionMap,
    key: MappingKey,
    /// Where the view starts in the OS mapping.
    diff: usize,
    len: usize,
    /// The file offset of the view's first byte.
    offset: u64,
    /// False once the file dropped the table entry itself.
    registered: bool,
}

impl MappedRegion {
    pub fn key(&self) -> MappingKey {
        self.key
    }

    pub fn file(&self) -> &Arc<CacheFile> {
        &self.file
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, RegionMap::Write(_))
    }

    /// Verifies the backing file still covers the whole view. Touching a
    /// page past the end of a shrunk file raises a bus error, so this must
    /// be called before every access.
    pub fn validate(&self) -> Result<()> {
        self.file
            .inner
            .lock()
            .check_backing(self.offset + self.len as u64)
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.map.as_slice()[self.diff..self.diff + self.len]
    }

    /// The view for writing, or `None` for a read only mapping.
    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.map {
            RegionMap::Write(m) => Some(&mut m[self.diff..self.diff + self.len]),
            RegionMap::Read(_) => None,
        }
    }

    /// Forgets the table entry, which the file already removed.
    pub(crate) fn detach(&mut self) {
        self.registered = false;
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if self.registered {
            self.file.unmap(self.key);
        }
    }
}

impl CacheFile {
    /// Maps `size` bytes of the file at `offset` on behalf of `owner`.
    ///
    /// Opens the handle if needed and grows the file when the range ends
    /// past its current length. Growing past the maximum size and writable
    /// mappings of read only files are errors. When mapping is not possible
    /// `Mapping::Unavailable` is returned, which is not an error.
    pub fn map(
        self: &Arc<Self>,
        owner: Weak<PieceData>,
        offset: u64,
        size: usize,
        mode: OpenMode,
    ) -> Result<Mapping> {
        self.count_map_attempt();
        #[cfg(test)]
        if self.fail_mmap.load(std::sync::atomic::Ordering::Relaxed) {
            return Ok(Mapping::Unavailable(MmapUnavailable::Injected));
        }

        let mut inner = self.inner.lock();
        let res = self.map_locked(&mut inner, owner, offset, size, mode);
        inner.close_if_unused();
        res
    }

    fn map_locked(
        self: &Arc<Self>,
        inner: &mut FileInner,
        owner: Weak<PieceData>,
        offset: u64,
        size: usize,
        mode: OpenMode,
    ) -> Result<Mapping> {
        if size == 0 {
            return Ok(Mapping::Unavailable(MmapUnavailable::Disabled));
        }
        if inner.handle.is_none() {
            if let Err(reason) = mmap_allowed(&inner.path, inner.reserved_fds) {
                return Ok(Mapping::Unavailable(reason));
            }
        }
        inner.open_handle(mode)?;

        let end = offset + size as u64;
        if end > inner.max_size {
            log::warn!(
                "Attempting to map {:?} beyond its maximum size ({} > {})",
                inner.path,
                end,
                inner.max_size
            );
            return Err(StorageError::BeyondMaxSize {
                path: inner.path.clone(),
                end,
                max: inner.max_size,
            });
        }
        if end > inner.file_size {
            inner.grow(end)?;
        }

        let diff = (offset % *PAGE_SIZE) as usize;
        let aligned = offset - diff as u64;
        let map_len = size + diff;
        let file = inner.file()?;
        let mut opts = MmapOptions::new();
        opts.offset(aligned).len(map_len);
        // SAFETY: the mapping is only accessed through `MappedRegion`, which
        // validates the file length before every access
        let map = match mode {
            OpenMode::Read => unsafe { opts.map(file) }.map(RegionMap::Read),
            OpenMode::Write | OpenMode::ReadWrite => {
                unsafe { opts.map_mut(file) }.map(RegionMap::Write)
            }
        };
        let map = match map {
            Ok(map) => map,
            Err(e) => {
                log::debug!("mmap of {:?} at {} failed: {}", inner.path, offset, e);
                return Ok(Mapping::Unavailable(MmapUnavailable::Os(e)));
            }
        };

        let key = MappingKey(map.as_slice().as_ptr() as usize + diff);
        inner.mappings.insert(
            key,
            MappingEntry {
                owner,
                offset: aligned,
                size: map_len,
                mode,
            },
        );
        Ok(Mapping::Mapped(MappedRegion {
            file: Arc::clone(self),
            map,
            key,
            diff,
            len: size,
            offset,
            registered: true,
        }))
    }

    /// Removes a mapping from the table. The handle is closed when it was
    /// the last one.
    pub(crate) fn unmap(&self, key: MappingKey) {
        let mut inner = self.inner.lock();
        match inner.mappings.remove(&key) {
            Some(entry) => log::trace!(
                "Unmapped {:?} ({} bytes at {}, {:?}) of {:?}",
                key,
                entry.size,
                entry.offset,
                entry.mode,
                inner.path
            ),
            None => log::warn!("Unmapping unknown region {:?} of {:?}", key, inner.path),
        }
        inner.close_if_unused();
    }
}

fn mmap_allowed(path: &Path, reserved_fds: u64) -> Result<(), MmapUnavailable> {
    if !descriptors_available(reserved_fds) {
        return Err(MmapUnavailable::DescriptorBudget);
    }
    if unreliable_filesystem(path) {
        return Err(MmapUnavailable::UnreliableFilesystem);
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn descriptors_available(reserved_fds: u64) -> bool {
    use nix::sys::resource::{getrlimit, Resource};

    let limit = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((soft, _)) => soft as u64,
        Err(_) => return true,
    };
    let open = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries.count() as u64,
        Err(_) => return true,
    };
    limit.saturating_sub(open) > reserved_fds
}

#[cfg(not(target_os = "linux"))]
fn descriptors_available(_reserved_fds: u64) -> bool {
    true
}

/// Filesystem magic numbers of network, FUSE and NTFS-like filesystems,
/// where faults on mapped pages are common.
#[cfg(target_os = "linux")]
const UNRELIABLE_FILESYSTEMS: &[u32] = &[
    0x6573_5546, // fuse, fuseblk (ntfs-3g, exfat-fuse)
    0x5346_544e, // ntfs
    0x6969,      // nfs
    0x517b,      // smb
    0xff53_4d42, // cifs
    0xfe53_4d42, // smb2
];

#[cfg(target_os = "linux")]
fn unreliable_filesystem(path: &Path) -> bool {
    let probe = match path.ancestors().find(|p| p.exists()) {
        Some(p) => p,
        None => return false,
    };
    match nix::sys::statfs::statfs(probe) {
        Ok(fs) => UNRELIABLE_FILESYSTEMS.contains(&(fs.filesystem_type().0 as u32)),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn unreliable_filesystem(_path: &Path) -> bool {
    false
}
