//! The files a chunk manager keeps in the torrent's bookkeeping directory.
//!
//! * `index`: the downloaded chunks, as little endian `u32` chunk indices.
//!   Entries are appended as chunks complete and the whole file is rewritten
//!   after a hash check.
//! * `file_priority`: the files whose priority is not normal.
//! * `file_info`: the excluded files only, read when the priority record is
//!   missing.
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};

use bytes::{Buf, BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};

use super::ChunkManager;
use crate::{
    disk::{chunk::ChunkStatus, record},
    error::disk::{Result, StorageError},
    priority::Priority,
    ChunkIndex, FileIndex,
};

const INDEX_FILE: &str = "index";
const PRIORITY_FILE: &str = "file_priority";
const FILE_INFO_FILE: &str = "file_info";

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct PriorityRecord {
    pub files: Vec<FilePriority>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct FilePriority {
    pub file: u32,
    pub priority: u8,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub(crate) struct FileInfoRecord {
    pub dnd: Vec<u32>,
}

impl ChunkManager {
    pub(super) fn index_path(&self) -> PathBuf {
        self.tmpdir.join(INDEX_FILE)
    }

    fn priority_path(&self) -> PathBuf {
        self.tmpdir.join(PRIORITY_FILE)
    }

    fn file_info_path(&self) -> PathBuf {
        self.tmpdir.join(FILE_INFO_FILE)
    }

    /// Appends a downloaded chunk to the index.
    pub(super) fn write_index_entry(&self, index: ChunkIndex) -> Result<()> {
        let path = self.index_path();
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(index);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(&buf))
            .map_err(|e| {
                log::warn!("Cannot append chunk {} to {:?}: {}", index, path, e);
                StorageError::io(&path, e)
            })
    }

    /// Rewrites the index with every chunk on disk, then the priority
    /// records.
    pub fn save_index_file(&self) -> Result<()> {
        let path = self.index_path();
        let mut buf = BytesMut::with_capacity(4 * self.downloaded.count_ones());
        for chunk in &self.chunks {
            if chunk.status == ChunkStatus::OnDisk {
                buf.put_u32_le(chunk.index);
            }
        }

        let tmp = path.with_extension("tmp");
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            log::warn!("Cannot save index file {:?}: {}", path, e);
            StorageError::io(&path, e)
        })?;

        self.save_priority_info();
        Ok(())
    }

    /// Replays the persisted state: marks the chunks of the index as
    /// downloaded and reapplies the saved file priorities.
    ///
    /// A missing index is a torrent that never downloaded anything. Entries
    /// that do not name a chunk of the torrent and a truncated trailing
    /// entry are skipped.
    pub fn load_index_file(&mut self) -> Result<()> {
        self.during_load = true;
        let res = self.replay_state();
        self.during_load = false;
        res?;
        self.cache.load_mount_points();
        Ok(())
    }

    fn replay_state(&mut self) -> Result<()> {
        let path = self.index_path();
        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let mut entries = buf.chunks_exact(4);
        for mut entry in entries.by_ref() {
            let index = entry.get_u32_le();
            match self.chunks.get_mut(index as usize) {
                Some(chunk) => {
                    chunk.status = ChunkStatus::OnDisk;
                    self.downloaded.set(index as usize, true);
                    self.todo.set(index as usize, false);
                }
                None => log::warn!("Index file {:?} names unknown chunk {}", path, index),
            }
        }
        if !entries.remainder().is_empty() {
            log::warn!(
                "Index file {:?} ends with a partial entry of {} bytes",
                path,
                entries.remainder().len()
            );
        }

        for (file, priority) in self.load_priority_info() {
            self.set_file_priority(file, priority)?;
        }
        self.update_all_file_percentages();
        log::debug!(
            "Loaded {} downloaded chunks from {:?}",
            self.downloaded.count_ones(),
            path
        );
        Ok(())
    }

    /// Writes the non default file priorities. Failures are logged only:
    /// the records are rebuilt from the next change.
    pub(super) fn save_priority_info(&self) {
        if self.during_load {
            return;
        }
        let files = &self.torrent.files;
        let priorities = PriorityRecord {
            files: files
                .iter()
                .filter(|f| f.priority() != Priority::Normal)
                .map(|f| FilePriority {
                    file: f.index as u32,
                    priority: f.priority().code(),
                })
                .collect(),
        };
        let info = FileInfoRecord {
            dnd: files
                .iter()
                .filter(|f| f.do_not_download())
                .map(|f| f.index as u32)
                .collect(),
        };
        if let Err(e) = record::write_record(&self.priority_path(), &priorities) {
            log::warn!("Failed to save priorities: {}", e);
        }
        if let Err(e) = record::write_record(&self.file_info_path(), &info) {
            log::warn!("Failed to save file info: {}", e);
        }
    }

    /// Reads the saved file priorities, falling back to the list of excluded
    /// files. Invalid entries are dropped.
    fn load_priority_info(&self) -> Vec<(FileIndex, Priority)> {
        let file_count = self.torrent.files.len();
        if let Some(rec) = record::read_record::<PriorityRecord>(&self.priority_path()) {
            return rec
                .files
                .into_iter()
                .filter_map(|e| {
                    let priority = Priority::from_code(e.priority);
                    let file = e.file as FileIndex;
                    if file >= file_count || priority.is_none() {
                        log::warn!("Ignoring invalid priority entry {:?}", e);
                    }
                    priority.filter(|_| file < file_count).map(|p| (file, p))
                })
                .collect();
        }
        record::read_record::<FileInfoRecord>(&self.file_info_path())
            .map(|rec| {
                rec.dnd
                    .into_iter()
                    .map(|i| i as FileIndex)
                    .filter(|&i| i < file_count)
                    .map(|i| (i, Priority::Excluded))
                    .collect()
            })
            .unwrap_or_default()
    }
}
