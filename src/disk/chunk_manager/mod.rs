//! The chunk bookkeeping of a torrent.
//!
//! [`ChunkManager`] owns the torrent's [`Cache`] and the state of every
//! chunk: whether it is on disk, excluded because only unwanted files
//! overlap it, or kept for seeding only. It turns the user's per file
//! priority changes into chunk ranges, keeps the chunks shared by two files
//! (border chunks) wanted as long as one of the files needs them, and
//! persists what was downloaded so that a restart resumes where it stopped.
//!
//! All methods are called from the torrent's control loop. Only the
//! preallocation worker runs elsewhere, and it reports back through an
//! [`Alert`].
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use bitvec::prelude::*;

use super::{
    cache::{multi::MultiFileCache, single::SingleFileCache, Cache},
    chunk::{Chunk, ChunkStatus},
    piece::{PieceData, PiecePtr},
    prealloc::{PreallocHandle, PreallocationThread},
};
use crate::{
    alert::{self, Alert, AlertSender},
    blockinfo,
    conf::DiskConf,
    error::disk::{Result, StorageError},
    priority::Priority,
    storage_info::{MediaKind, StorageInfo},
    Bitfield, ChunkIndex, FileIndex,
};

mod persist;
mod test;

pub struct ChunkManager {
    torrent: StorageInfo,
    cache: Box<dyn Cache>,
    conf: DiskConf,
    /// The torrent's bookkeeping directory, holding the index and the
    /// priority records.
    tmpdir: PathBuf,
    chunks: Vec<Chunk>,
    /// Chunks that passed their hash check and are on disk.
    downloaded: Bitfield,
    /// Chunks overlapping only files the user excluded.
    excluded: Bitfield,
    /// Chunks overlapping only files kept for seeding.
    only_seed: Bitfield,
    /// Chunks still to download: neither downloaded, excluded nor seed only.
    todo: Bitfield,
    /// Chunks shared by two adjacent files.
    border_chunks: BTreeSet<ChunkIndex>,
    /// Set while persisted state is replayed, which must not write it back
    /// or reset chunks.
    during_load: bool,
    corrupted_chunks: u32,
    alert_tx: Option<AlertSender>,
}

impl ChunkManager {
    /// Sets up the storage of a torrent whose bookkeeping lives in `tmpdir`
    /// and whose data goes into `datadir`, under the torrent's name or
    /// `custom_output_name`.
    ///
    /// Nothing is read from or written to the data files yet, see
    /// [`ChunkManager::load_index_file`] and [`ChunkManager::create_files`].
    pub fn new(
        mut torrent: StorageInfo,
        tmpdir: impl Into<PathBuf>,
        datadir: impl Into<PathBuf>,
        custom_output_name: Option<&str>,
        conf: DiskConf,
        alert_tx: Option<AlertSender>,
    ) -> Result<Self> {
        let tmpdir = tmpdir.into();
        let datadir = datadir.into();
        fs::create_dir_all(&tmpdir).map_err(|e| StorageError::CreateDir {
            path: tmpdir.clone(),
            source: e,
        })?;

        let mut cache: Box<dyn Cache> = if torrent.is_multi_file() {
            Box::new(MultiFileCache::new(
                &torrent,
                &tmpdir,
                &datadir,
                custom_output_name,
                conf.clone(),
            ))
        } else {
            Box::new(SingleFileCache::new(
                &torrent,
                &tmpdir,
                &datadir,
                custom_output_name,
                conf.clone(),
            ))
        };
        cache.load_file_map(&mut torrent)?;

        let chunk_count = torrent.chunk_count as usize;
        let chunks = (0..torrent.chunk_count)
            .map(|i| Chunk::new(i, torrent.chunk_size(i)))
            .collect();

        let mut manager = Self {
            torrent,
            cache,
            conf,
            tmpdir,
            chunks,
            downloaded: bitvec![u8, Msb0; 0; chunk_count],
            excluded: bitvec![u8, Msb0; 0; chunk_count],
            only_seed: bitvec![u8, Msb0; 0; chunk_count],
            todo: bitvec![u8, Msb0; 1; chunk_count],
            border_chunks: BTreeSet::new(),
            during_load: false,
            corrupted_chunks: 0,
            alert_tx,
        };
        manager.setup_priorities();
        Ok(manager)
    }

    fn setup_priorities(&mut self) {
        if self.torrent.is_multi_file() {
            // empty files hold no bytes of the chunk they sit on
            let spans: Vec<_> = self
                .torrent
                .files
                .iter()
                .filter(|f| !f.is_empty())
                .map(|f| (f.first_chunk, f.last_chunk))
                .collect();
            self.border_chunks = spans
                .windows(2)
                .filter(|w| w[0].1 == w[1].0)
                .map(|w| w[0].1)
                .collect();
        }
        for i in 0..self.torrent.files.len() {
            if self.torrent.files[i].is_multimedia() {
                self.do_preview_priority(i);
            }
        }
    }

    pub fn torrent(&self) -> &StorageInfo {
        &self.torrent
    }

    pub fn conf(&self) -> &DiskConf {
        &self.conf
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn chunk(&self, index: ChunkIndex) -> Option<&Chunk> {
        self.chunks.get(index as usize)
    }

    pub fn is_border_chunk(&self, index: ChunkIndex) -> bool {
        self.border_chunks.contains(&index)
    }

    pub fn downloaded_chunks(&self) -> &Bitfield {
        &self.downloaded
    }

    pub fn excluded_chunks(&self) -> &Bitfield {
        &self.excluded
    }

    pub fn only_seed_chunks(&self) -> &Bitfield {
        &self.only_seed
    }

    pub fn todo_chunks(&self) -> &Bitfield {
        &self.todo
    }

    /// The number of chunks found corrupt by a hash check since the
    /// torrent was loaded.
    pub fn corrupted_chunks(&self) -> u32 {
        self.corrupted_chunks
    }

    fn post(&self, alert: Alert) {
        alert::post(self.alert_tx.as_ref(), alert);
    }

    /// Clamps an inclusive range to the torrent's chunks, swapping reversed
    /// bounds. Returns `None` if nothing is left.
    fn clamp_range(&self, from: ChunkIndex, to: ChunkIndex) -> Option<(ChunkIndex, ChunkIndex)> {
        let (from, to) = if from > to { (to, from) } else { (from, to) };
        let last = self.chunk_count().checked_sub(1)?;
        (from <= last).then(|| (from, to.min(last)))
    }

    // Lifecycle

    /// Opens the backing files.
    pub fn start(&mut self) -> Result<()> {
        self.cache.open(&self.torrent)
    }

    /// Closes the backing files.
    pub fn stop(&mut self) {
        self.cache.close();
    }

    /// Creates the data files on first run. With `check_priority` the
    /// persisted non default priorities are applied once the files exist.
    pub fn create_files(&mut self, check_priority: bool) -> Result<()> {
        super::io::touch(&self.index_path())?;
        self.cache.create(&mut self.torrent)?;

        if check_priority {
            self.during_load = true;
            let mut res = Ok(());
            for i in 0..self.torrent.files.len() {
                let f = &self.torrent.files[i];
                let (prio, old) = (f.priority(), f.old_priority());
                if prio != Priority::Normal {
                    res = self.download_priority_changed(i, prio, old);
                    if res.is_err() {
                        break;
                    }
                }
            }
            self.during_load = false;
            res?;
            self.save_priority_info();
        }
        Ok(())
    }

    /// Returns the data files that should exist but do not.
    pub fn has_missing_files(&mut self) -> Vec<PathBuf> {
        self.cache.has_missing_files(&mut self.torrent)
    }

    /// Recreates missing data files empty and forgets the chunks they held.
    pub fn recreate_missing_files(&mut self) -> Result<()> {
        self.cache.create(&mut self.torrent)?;
        if self.torrent.is_multi_file() {
            for i in 0..self.torrent.files.len() {
                if !self.torrent.files[i].missing {
                    continue;
                }
                let (first, last) = self.file_chunks(i);
                for chunk in first..=last {
                    self.reset_chunk(chunk);
                }
                self.torrent.files[i].missing = false;
            }
        } else {
            for chunk in 0..self.chunk_count() {
                self.reset_chunk(chunk);
            }
            self.torrent.files[0].missing = false;
        }
        self.save_index_file()
    }

    /// Excludes missing data files instead of recreating them.
    pub fn dnd_missing_files(&mut self) -> Result<()> {
        for i in 0..self.torrent.files.len() {
            if !self.torrent.files[i].missing {
                continue;
            }
            let (first, last) = self.file_chunks(i);
            for chunk in first..=last {
                self.reset_chunk(chunk);
            }
            self.torrent.files[i].missing = false;
            self.set_do_not_download(i, true)?;
        }
        self.save_priority_info();
        self.save_index_file()
    }

    pub fn is_storage_mounted(&self) -> bool {
        self.cache.is_storage_mounted()
    }

    /// The mount points recorded for the data files that are not mounted
    /// anymore.
    pub fn unmounted_storage(&self) -> Vec<PathBuf> {
        self.cache.unmounted_storage()
    }

    pub fn save_file_map(&self) -> Result<()> {
        self.cache.save_file_map(&self.torrent)
    }

    pub fn output_path(&self) -> PathBuf {
        self.cache.output_path()
    }

    pub fn tmpdir(&self) -> &Path {
        &self.tmpdir
    }

    /// Points the manager at a bookkeeping directory the caller already
    /// moved.
    pub fn change_tmp_dir(&mut self, tmpdir: impl Into<PathBuf>) {
        self.tmpdir = tmpdir.into();
        self.cache.change_tmp_dir(&self.torrent, &self.tmpdir);
    }

    pub fn change_output_path(&mut self, path: &Path) -> Result<()> {
        self.cache.change_output_path(&mut self.torrent, path)
    }

    pub fn move_data_files(&mut self, new_dir: &Path) -> Result<()> {
        self.cache.move_data_files(&mut self.torrent, new_dir)
    }

    pub fn delete_data_files(&mut self) -> Result<()> {
        self.cache.delete_data_files(&self.torrent)
    }

    pub fn disk_usage(&self) -> Result<u64> {
        self.cache.disk_usage(&self.torrent)
    }

    pub fn save_mount_points(&mut self) -> Result<()> {
        self.cache.save_mount_points(&self.torrent)
    }

    /// Evicts the cached pieces the protocol layer no longer holds.
    pub fn check_memory_usage(&mut self) {
        self.cache.check_memory_usage();
    }

    /// Starts extending the data files to their final size on a background
    /// thread. Returns `None` when preallocation is disabled.
    pub fn preallocate(&mut self) -> Result<Option<PreallocHandle>> {
        if !self.conf.preallocate_files {
            return Ok(None);
        }
        let mut prealloc = PreallocationThread::new(self.conf.preallocate_fully);
        self.cache.prepare_preallocation(&self.torrent, &mut prealloc)?;
        let handle = prealloc
            .spawn(self.alert_tx.clone())
            .map_err(|e| StorageError::io(&self.tmpdir, e))?;
        Ok(Some(handle))
    }

    // Chunk IO

    /// Returns a piece of a chunk, read only or writable.
    pub fn get_piece(
        &mut self,
        chunk: ChunkIndex,
        offset: u32,
        len: u32,
        read_only: bool,
    ) -> Result<PiecePtr> {
        if read_only {
            self.cache.load_piece(&self.torrent, chunk, offset, len)
        } else {
            self.cache.prepare_piece(&self.torrent, chunk, offset, len)
        }
    }

    /// Reads `buf.len()` bytes of a chunk at the offset.
    pub fn read_piece(&mut self, chunk: ChunkIndex, offset: u32, buf: &mut [u8]) -> Result<()> {
        let piece = self.get_piece(chunk, offset, buf.len() as u32, true)?;
        piece.read(buf, 0)
    }

    pub fn save_piece(&mut self, piece: &PieceData) -> Result<()> {
        self.cache.save_piece(&self.torrent, piece)
    }

    /// Stores a whole chunk, block by block like the download path does.
    pub fn write_chunk(&mut self, chunk: ChunkIndex, data: &[u8]) -> Result<()> {
        let size = self
            .chunk(chunk)
            .ok_or(StorageError::InvalidChunk(chunk))?
            .size();
        if data.len() != size as usize {
            return Err(StorageError::OutOfBounds {
                offset: 0,
                len: data.len() as u32,
                piece_len: size,
            });
        }
        for block in blockinfo::blocks(chunk, size) {
            let piece = self.get_piece(chunk, block.offset, block.len, false)?;
            piece.write(&data[block.offset as usize..block.end() as usize], 0)?;
            self.save_piece(&piece)?;
        }
        Ok(())
    }

    /// Compares the stored chunk with its expected hash. A torrent without
    /// hashes accepts every chunk.
    pub fn check_hash(&mut self, chunk: ChunkIndex) -> Result<bool> {
        let size = self
            .chunk(chunk)
            .ok_or(StorageError::InvalidChunk(chunk))?
            .size();
        let expected = match self.torrent.chunk_hashes.get(chunk as usize) {
            Some(hash) => *hash,
            None => return Ok(true),
        };
        let actual = self.get_piece(chunk, 0, size, true)?.hash()?;
        if actual != expected {
            log::warn!(
                "Chunk {} hash mismatch: expected {}, got {}",
                chunk,
                hex::encode(expected),
                hex::encode(actual)
            );
            return Ok(false);
        }
        Ok(true)
    }

    // Chunk state

    /// Records a verified chunk as downloaded and appends it to the index.
    pub fn chunk_downloaded(&mut self, index: ChunkIndex) -> Result<()> {
        let i = index as usize;
        let chunk = self
            .chunks
            .get_mut(i)
            .ok_or(StorageError::InvalidChunk(index))?;
        if chunk.is_excluded() {
            log::warn!("Attempted to save chunk {}, which is excluded", index);
            return Ok(());
        }
        chunk.status = ChunkStatus::OnDisk;
        self.downloaded.set(i, true);
        self.todo.set(i, false);
        self.write_index_entry(index)?;
        self.update_file_percentage(index);
        Ok(())
    }

    /// Marks a chunk as not downloaded and drops its cached pieces. Does
    /// nothing while persisted state is being loaded.
    pub fn reset_chunk(&mut self, index: ChunkIndex) {
        let i = index as usize;
        if i >= self.chunks.len() || self.during_load {
            return;
        }
        self.cache.clear_pieces(index);
        self.chunks[i].status = ChunkStatus::NotDownloaded;
        self.downloaded.set(i, false);
        self.todo.set(i, !self.excluded[i] && !self.only_seed[i]);
        self.update_file_percentage(index);
        log::debug!("Reset chunk {}", index);
    }

    fn mark_downloaded(&mut self, index: ChunkIndex) {
        let i = index as usize;
        self.chunks[i].status = ChunkStatus::OnDisk;
        self.downloaded.set(i, true);
        self.todo.set(i, false);
        self.update_file_percentage(index);
    }

    /// Reconciles a hash check of the chunks in `[from, to]` with what is
    /// believed to be on disk. Chunks that turn out corrupt are reset and
    /// counted, chunks found intact are marked downloaded.
    pub fn data_checked(&mut self, ok_chunks: &Bitfield, from: ChunkIndex, to: ChunkIndex) -> Result<()> {
        if let Some((from, to)) = self.clamp_range(from, to) {
            for index in from..=to {
                let i = index as usize;
                let ok = ok_chunks.get(i).map(|b| *b).unwrap_or(false);
                if ok && !self.downloaded[i] {
                    self.mark_downloaded(index);
                } else if !ok && self.downloaded[i] {
                    log::warn!("Previously OK chunk {} is corrupt", index);
                    self.corrupted_chunks += 1;
                    self.chunks[i].status = ChunkStatus::NotDownloaded;
                    self.downloaded.set(i, false);
                    self.todo.set(i, !self.only_seed[i] && !self.excluded[i]);
                    self.update_file_percentage(index);
                    self.post(Alert::ChunkCorrupted(index));
                }
            }
        }
        self.post(Alert::UpdateStats);
        self.save_index_file()
    }

    pub fn has_existing_files(&self) -> bool {
        self.cache.has_existing_files()
    }

    /// Imports data that was already on disk when the files were created,
    /// marking the chunks of pre-existing files as downloaded. A chunk
    /// shared with other files is only marked if they all pre-existed.
    pub fn mark_existing_files_as_downloaded(&mut self) -> Result<()> {
        if self.torrent.is_multi_file() {
            for i in 0..self.torrent.files.len() {
                let f = &self.torrent.files[i];
                if !f.preexisting || f.is_empty() {
                    continue;
                }
                let (first, last) = (f.first_chunk, f.last_chunk);
                for chunk in first + 1..last {
                    self.mark_downloaded(chunk);
                }
                for chunk in [first, last] {
                    if self.all_files_exist_of_chunk(chunk) {
                        self.mark_downloaded(chunk);
                    }
                }
            }
        } else if self.cache.has_existing_files() {
            for chunk in 0..self.chunk_count() {
                self.mark_downloaded(chunk);
            }
        }
        self.save_index_file()
    }

    fn all_files_exist_of_chunk(&self, chunk: ChunkIndex) -> bool {
        self.torrent.files[self.torrent.files_of_chunk(chunk)]
            .iter()
            .filter(|f| !f.is_empty())
            .all(|f| f.preexisting)
    }

    fn file_chunks(&self, file: FileIndex) -> (ChunkIndex, ChunkIndex) {
        let f = &self.torrent.files[file];
        (f.first_chunk, f.last_chunk)
    }

    /// Recounts the downloaded chunks of the files overlapping the chunk.
    fn update_file_percentage(&mut self, chunk: ChunkIndex) {
        let range = self.torrent.files_of_chunk(chunk);
        for f in &mut self.torrent.files[range] {
            f.downloaded_chunks = self.downloaded[f.first_chunk as usize..=f.last_chunk as usize].count_ones() as u32;
        }
    }

    fn update_all_file_percentages(&mut self) {
        for f in &mut self.torrent.files {
            f.downloaded_chunks = self.downloaded[f.first_chunk as usize..=f.last_chunk as usize].count_ones() as u32;
        }
    }

    // Statistics

    fn bytes_of(&self, set: &BitSlice<u8, Msb0>) -> u64 {
        set.iter_ones().map(|i| self.chunks[i].size as u64).sum()
    }

    /// Whether every wanted chunk is on disk.
    pub fn completed(&self) -> bool {
        self.todo.not_any() && self.downloaded.any()
    }

    pub fn have_all_chunks(&self) -> bool {
        self.downloaded.all()
    }

    pub fn chunks_downloaded(&self) -> u32 {
        self.downloaded.count_ones() as u32
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_of(&self.downloaded)
    }

    /// The bytes not on disk, wanted or not.
    pub fn bytes_left(&self) -> u64 {
        self.torrent.total_len - self.bytes_downloaded()
    }

    /// The bytes still to download, leaving out excluded and seed only
    /// chunks.
    pub fn bytes_left_to_download(&self) -> u64 {
        self.bytes_of(&self.todo)
    }

    /// The chunks not on disk that are not excluded. Seed only chunks count.
    pub fn chunks_left(&self) -> u32 {
        self.downloaded
            .iter()
            .by_vals()
            .zip(self.excluded.iter().by_vals())
            .filter(|&(downloaded, excluded)| !downloaded && !excluded)
            .count() as u32
    }

    pub fn chunks_excluded(&self) -> u32 {
        (self.excluded.count_ones() + self.only_seed.count_ones()) as u32
    }

    pub fn only_seed_count(&self) -> u32 {
        self.only_seed.count_ones() as u32
    }

    /// The bytes of excluded and seed only chunks that are not on disk.
    pub fn bytes_excluded(&self) -> u64 {
        (0..self.chunks.len())
            .filter(|&i| (self.excluded[i] || self.only_seed[i]) && !self.downloaded[i])
            .map(|i| self.chunks[i].size as u64)
            .sum()
    }

    // Priorities

    /// Sets the priority of the chunks in `[from, to]`. `Excluded` is the
    /// same as [`ChunkManager::exclude`].
    pub fn prioritise(&mut self, from: ChunkIndex, to: ChunkIndex, priority: Priority) {
        if priority == Priority::Excluded {
            self.exclude(from, to);
            return;
        }
        let (from, to) = match self.clamp_range(from, to) {
            Some(range) => range,
            None => return,
        };
        log::trace!("Prioritising chunks {}..={} as {}", from, to, priority);
        for i in from as usize..=to as usize {
            self.chunks[i].priority = priority;
            self.excluded.set(i, false);
            if priority == Priority::OnlySeed {
                self.only_seed.set(i, true);
                self.todo.set(i, false);
            } else {
                self.only_seed.set(i, false);
                self.todo.set(i, !self.downloaded[i]);
            }
        }
        self.post(Alert::UpdateStats);
    }

    /// Boosts the chunks in `[from, to]` to the preview tier of their
    /// priority.
    pub fn prioritise_preview(&mut self, from: ChunkIndex, to: ChunkIndex) {
        let (from, to) = match self.clamp_range(from, to) {
            Some(range) => range,
            None => return,
        };
        for chunk in &mut self.chunks[from as usize..=to as usize] {
            chunk.priority = chunk.priority.to_preview();
        }
        self.post(Alert::UpdateStats);
    }

    /// Stops downloading the chunks in `[from, to]` and forgets they were
    /// downloaded.
    pub fn exclude(&mut self, from: ChunkIndex, to: ChunkIndex) {
        let (from, to) = match self.clamp_range(from, to) {
            Some(range) => range,
            None => return,
        };
        log::trace!("Excluding chunks {}..={}", from, to);
        for i in from as usize..=to as usize {
            self.chunks[i].priority = Priority::Excluded;
            self.chunks[i].status = ChunkStatus::NotDownloaded;
            self.excluded.set(i, true);
            self.only_seed.set(i, false);
            self.todo.set(i, false);
            self.downloaded.set(i, false);
            self.cache.clear_pieces(i as ChunkIndex);
        }
        if !self.during_load {
            self.update_all_file_percentages();
        }
        self.post(Alert::ChunksExcluded { from, to });
        self.post(Alert::UpdateStats);
    }

    /// Wants the chunks in `[from, to]` again, at normal priority.
    pub fn include(&mut self, from: ChunkIndex, to: ChunkIndex) {
        let (from, to) = match self.clamp_range(from, to) {
            Some(range) => range,
            None => return,
        };
        log::trace!("Including chunks {}..={}", from, to);
        for i in from as usize..=to as usize {
            if !self.chunks[i].priority.is_wanted() {
                self.chunks[i].priority = Priority::Normal;
            }
            self.excluded.set(i, false);
            self.only_seed.set(i, false);
            self.todo.set(i, !self.downloaded[i]);
        }
        self.post(Alert::UpdateStats);
        self.post(Alert::ChunksIncluded { from, to });
    }

    /// Changes the priority of a file and applies it to its chunks.
    pub fn set_file_priority(&mut self, file: FileIndex, priority: Priority) -> Result<()> {
        let f = self.torrent.file_mut(file)?;
        if !f.set_priority(priority) {
            return Ok(());
        }
        let old = f.old_priority();
        log::trace!("File {} priority changed from {} to {}", file, old, priority);
        self.download_priority_changed(file, priority, old)
    }

    /// Excludes a file, or includes it again at normal priority.
    pub fn set_do_not_download(&mut self, file: FileIndex, dnd: bool) -> Result<()> {
        if dnd {
            self.set_file_priority(file, Priority::Excluded)
        } else if self.torrent.file(file)?.do_not_download() {
            self.set_file_priority(file, Priority::Normal)
        } else {
            Ok(())
        }
    }

    /// Applies a file's priority change to its chunks. Border chunks get the
    /// most eager priority of the files sharing them.
    pub fn download_priority_changed(
        &mut self,
        file: FileIndex,
        new: Priority,
        old: Priority,
    ) -> Result<()> {
        self.torrent.file(file)?;
        if new == Priority::Excluded {
            return self.download_status_changed(file, false);
        }
        if old == Priority::Excluded {
            self.download_status_changed(file, true)?;
        }
        self.save_priority_info();
        if self.torrent.files[file].is_empty() {
            return Ok(());
        }

        let (mut first, mut last) = self.file_chunks(file);
        if old == Priority::OnlySeed {
            self.include(first, last);
        }

        if first == last {
            if self.is_border_chunk(first) {
                self.set_border_chunk_priority(first, new);
            } else {
                self.prioritise(first, first, new);
            }
            if new == Priority::OnlySeed {
                self.post(Alert::ChunksExcluded {
                    from: first,
                    to: last,
                });
            }
        } else {
            if self.is_border_chunk(first) {
                self.set_border_chunk_priority(first, new);
                first += 1;
            }
            if self.is_border_chunk(last) {
                self.set_border_chunk_priority(last, new);
                last -= 1;
            }
            if first <= last {
                self.prioritise(first, last, new);
                if new == Priority::OnlySeed {
                    self.post(Alert::ChunksExcluded {
                        from: first,
                        to: last,
                    });
                }
            }
        }

        if self.torrent.files[file].is_multimedia() {
            self.do_preview_priority(file);
        }
        Ok(())
    }

    /// Handles a file being excluded or included again: updates its chunks
    /// and converts its storage.
    fn download_status_changed(&mut self, file: FileIndex, download: bool) -> Result<()> {
        let (first, last) = self.file_chunks(file);
        if self.torrent.files[file].is_empty() {
            log::trace!("File {} holds no chunk bytes", file);
        } else if download {
            self.include(first, last);
            if self.torrent.files[file].is_multimedia() {
                self.do_preview_priority(file);
            }
        } else if first == last {
            if !self.is_border_chunk(first) {
                self.reset_chunk(first);
                self.exclude(first, first);
            } else if self.reset_border_chunk(first, file) {
                self.exclude(first, first);
            }
        } else {
            for chunk in first + 1..last {
                self.reset_chunk(chunk);
            }
            let keep_first = if self.is_border_chunk(first) {
                !self.reset_border_chunk(first, file)
            } else {
                self.reset_chunk(first);
                false
            };
            let keep_last = if self.is_border_chunk(last) {
                !self.reset_border_chunk(last, file)
            } else {
                self.reset_chunk(last);
                false
            };
            let from = if keep_first { first + 1 } else { first };
            let to = if keep_last { last - 1 } else { last };
            if from <= to {
                self.exclude(from, to);
            }
        }

        self.cache
            .download_status_changed(&self.torrent, file, download)?;
        self.save_priority_info();
        if !self.during_load {
            self.update_all_file_percentages();
        }
        Ok(())
    }

    /// Gives a border chunk the most eager of `priority` and the priorities
    /// of the files sharing it.
    fn set_border_chunk_priority(&mut self, chunk: ChunkIndex, priority: Priority) {
        let highest = self.torrent.files[self.torrent.files_of_chunk(chunk)]
            .iter()
            .filter(|f| !f.is_empty())
            .map(|f| f.priority())
            .fold(priority, Priority::max);
        self.prioritise(chunk, chunk, highest);
        if highest == Priority::OnlySeed {
            self.post(Alert::ChunksExcluded {
                from: chunk,
                to: chunk,
            });
        }
    }

    /// Resets a border chunk of an excluded file, unless another file
    /// sharing it still wants it. Returns whether it was reset.
    fn reset_border_chunk(&mut self, chunk: ChunkIndex, file: FileIndex) -> bool {
        let needed_by = self.torrent.files[self.torrent.files_of_chunk(chunk)]
            .iter()
            .find(|f| f.index != file && !f.is_empty() && !f.do_not_download())
            .map(|f| f.priority());
        match needed_by {
            Some(priority) => {
                self.set_border_chunk_priority(chunk, priority);
                false
            }
            None => {
                self.reset_chunk(chunk);
                true
            }
        }
    }

    // Preview

    /// The number of chunks at each end of a multimedia file that get a
    /// preview priority, 0 for other files.
    pub fn preview_chunk_range_size(&self, file: FileIndex) -> u32 {
        let f = match self.torrent.files.get(file) {
            Some(f) => f,
            None => return 0,
        };
        let budget = match f.media_kind() {
            Some(MediaKind::Video) => self.conf.preview_size_video,
            Some(MediaKind::Audio) => self.conf.preview_size_audio,
            None => return 0,
        };
        if f.first_chunk == f.last_chunk {
            return 1;
        }
        (budget / self.torrent.chunk_len).max(1)
    }

    fn do_preview_priority(&mut self, file: FileIndex) {
        let f = &self.torrent.files[file];
        if !f.priority().is_wanted() || f.is_empty() {
            return;
        }
        let (first, last) = (f.first_chunk, f.last_chunk);
        let n = self.preview_chunk_range_size(file);
        if n == 0 {
            return;
        }
        self.prioritise_preview(first, (first + n - 1).min(last));
        self.prioritise_preview(last.saturating_sub(n - 1).max(first), last);
    }
}
