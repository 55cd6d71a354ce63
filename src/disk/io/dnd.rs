//! Sparse storage for the boundary bytes of a file the user does not want.
//!
//! When a file is excluded, the chunks it shares with its neighbours (its
//! first and last chunk) may still be needed to complete those neighbours.
//! Only the file's bytes inside these two chunks are kept:
//!
//! ```text
//!  ┌────────┬─────────────────────────┬─────────────────────────┐
//!  │ header │ first region            │ last region             │
//!  │ 12 B   │ file bytes in 1st chunk │ file bytes in last chunk│
//!  └────────┴─────────────────────────┴─────────────────────────┘
//! ```
//!
//! The header holds a magic number and the two region lengths. A file with
//! a missing or foreign header is recreated empty: it never holds anything
//! that cannot be downloaded again.
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use bytes::{Buf, BufMut, BytesMut};

use super::{pread_up_to, pwrite_all};
use crate::{
    error::disk::{Result, StorageError},
    storage_info::TorrentFile,
    ChunkIndex,
};

const DND_FILE_MAGIC: u32 = 0xD123_4567;
const HEADER_LEN: u64 = 12;

/// Which of the two stored regions an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DndRegion {
    /// The file's bytes inside its first chunk.
    First,
    /// The file's bytes inside its last chunk.
    Last,
}

#[derive(Debug)]
pub struct DndFile {
    path: PathBuf,
    first_len: u32,
    last_len: u32,
}

impl DndFile {
    /// Describes the DND file for the torrent file. Nothing is created on
    /// disk until [`DndFile::check_integrity`] or a write.
    pub fn new(path: impl Into<PathBuf>, file: &TorrentFile, chunk_len: u32) -> Self {
        Self {
            path: path.into(),
            first_len: file.first_region_len(chunk_len),
            last_len: file.last_region_len(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn change_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn region_len(&self, region: DndRegion) -> u32 {
        match region {
            DndRegion::First => self.first_len,
            DndRegion::Last => self.last_len,
        }
    }

    /// Finds where a byte of the torrent file is kept: the region and the
    /// offset inside it. Bytes in the file's middle chunks are not kept.
    pub fn locate(file: &TorrentFile, chunk: ChunkIndex, file_offset: u64) -> Option<(DndRegion, u32)> {
        if chunk == file.first_chunk {
            Some((DndRegion::First, file_offset as u32))
        } else if chunk == file.last_chunk {
            let region_start = file.len() - file.last_region_len() as u64;
            Some((DndRegion::Last, (file_offset - region_start) as u32))
        } else {
            None
        }
    }

    /// Recreates the file if it is missing or its header is not ours.
    pub fn check_integrity(&self) -> Result<()> {
        match self.read_header() {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => {
                log::info!("DND file {:?} is missing or corrupt, recreating it", self.path);
                self.create()
            }
        }
    }

    /// Returns true if the header matches this file's layout.
    fn read_header(&self) -> io::Result<bool> {
        let file = File::open(&self.path)?;
        let mut header = [0u8; HEADER_LEN as usize];
        if pread_up_to(&file, &mut header, 0)? < header.len() {
            return Ok(false);
        }
        let mut buf = &header[..];
        let magic = buf.get_u32_le();
        let first_len = buf.get_u32_le();
        let last_len = buf.get_u32_le();
        Ok(magic == DND_FILE_MAGIC && first_len == self.first_len && last_len == self.last_len)
    }

    /// Writes a fresh header, dropping any stored bytes.
    pub fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut header = BytesMut::with_capacity(HEADER_LEN as usize);
        header.put_u32_le(DND_FILE_MAGIC);
        header.put_u32_le(self.first_len);
        header.put_u32_le(self.last_len);
        fs::write(&self.path, &header).map_err(|e| {
            log::warn!("Cannot create DND file {:?}: {}", self.path, e);
            StorageError::io(&self.path, e)
        })
    }

    fn region_offset(&self, region: DndRegion) -> u64 {
        match region {
            DndRegion::First => HEADER_LEN,
            DndRegion::Last => HEADER_LEN + self.first_len as u64,
        }
    }

    fn check_bounds(&self, region: DndRegion, offset: u32, len: usize) -> Result<()> {
        let region_len = self.region_len(region);
        if offset as u64 + len as u64 > region_len as u64 {
            return Err(StorageError::OutOfBounds {
                offset,
                len: len as u32,
                piece_len: region_len,
            });
        }
        Ok(())
    }

    /// Reads from a region. Bytes never written read as zeros. Returns the
    /// number of bytes actually stored.
    pub fn read(&self, region: DndRegion, buf: &mut [u8], offset: u32) -> Result<usize> {
        self.check_bounds(region, offset, buf.len())?;
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.create()?;
                buf.fill(0);
                return Ok(0);
            }
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        let pos = self.region_offset(region) + offset as u64;
        let n = pread_up_to(&file, buf, pos).map_err(|e| StorageError::io(&self.path, e))?;
        buf[n..].fill(0);
        Ok(n)
    }

    /// Writes into a region.
    pub fn write(&self, region: DndRegion, buf: &[u8], offset: u32) -> Result<()> {
        self.check_bounds(region, offset, buf.len())?;
        if !self.path.exists() {
            self.create()?;
        }
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                log::warn!("Failed to open DND file {:?}: {}", self.path, e);
                StorageError::Open {
                    path: self.path.clone(),
                    source: e,
                }
            })?;
        let pos = self.region_offset(region) + offset as u64;
        pwrite_all(&file, buf, pos).map_err(|e| StorageError::io(&self.path, e))
    }

    pub fn read_first_chunk(&self, buf: &mut [u8], offset: u32) -> Result<usize> {
        self.read(DndRegion::First, buf, offset)
    }

    pub fn write_first_chunk(&self, buf: &[u8], offset: u32) -> Result<()> {
        self.write(DndRegion::First, buf, offset)
    }

    pub fn read_last_chunk(&self, buf: &mut [u8], offset: u32) -> Result<usize> {
        self.read(DndRegion::Last, buf, offset)
    }

    pub fn write_last_chunk(&self, buf: &[u8], offset: u32) -> Result<()> {
        self.write(DndRegion::Last, buf, offset)
    }
}
