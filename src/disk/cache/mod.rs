//! The storage of a torrent's chunks.
//!
//! A [`Cache`] turns `(chunk, offset, len)` requests into [`PieceData`]
//! handles backed by the torrent's files. Two layouts exist, picked once when
//! the torrent is loaded:
//!
//! - [`single::SingleFileCache`]: the torrent is one file and chunk `i`
//!   starts at byte `i * chunk_len` of it.
//! - [`multi::MultiFileCache`]: a chunk may span several files, some of which
//!   may be excluded and only kept as [`DndFile`](crate::disk::io::dnd::DndFile)s.
//!
//! Both share a [`CacheBase`] holding the piece cache, the mmap fallback
//! state and the mount point bookkeeping.
use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_derive::{Deserialize, Serialize};

use super::{
    io::{
        file::{CacheFile, OpenMode},
        mmap::Mapping,
    },
    piece::{PieceData, PiecePtr},
    prealloc::PreallocationThread,
};
use crate::{
    blockinfo::BlockInfo,
    conf::DiskConf,
    error::disk::{Result, StorageError},
    storage_info::StorageInfo,
    ChunkIndex, FileIndex,
};

pub mod mount;
pub mod multi;
pub mod single;

/// The path map record: where each file lives on disk and the path the
/// user sees.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct FileMapRecord {
    pub files: Vec<FileMapEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FileMapEntry {
    pub path_on_disk: String,
    pub user_path: String,
}

impl FileMapRecord {
    pub fn from_torrent(torrent: &StorageInfo) -> Self {
        Self {
            files: torrent
                .files
                .iter()
                .map(|f| FileMapEntry {
                    path_on_disk: f.path_on_disk.to_string_lossy().into_owned(),
                    user_path: f.user_path.to_string_lossy().into_owned(),
                })
                .collect(),
        }
    }
}

pub trait Cache: Send {
    fn base(&self) -> &CacheBase;

    fn base_mut(&mut self) -> &mut CacheBase;

    /// Loads the path map, or writes it on first run.
    fn load_file_map(&mut self, torrent: &mut StorageInfo) -> Result<()>;

    fn save_file_map(&self, torrent: &StorageInfo) -> Result<()> {
        super::record::write_record(
            &self.base().file_map_path(),
            &FileMapRecord::from_torrent(torrent),
        )
    }

    /// The output file of a single file torrent, or the output directory.
    fn output_path(&self) -> PathBuf;

    /// Moves the bookkeeping directory.
    fn change_tmp_dir(&mut self, torrent: &StorageInfo, tmpdir: &Path);

    /// Points the cache at data that is already at a new location.
    fn change_output_path(&mut self, torrent: &mut StorageInfo, path: &Path) -> Result<()>;

    /// Moves the data files into a new directory.
    fn move_data_files(&mut self, torrent: &mut StorageInfo, new_dir: &Path) -> Result<()>;

    /// Opens the backing files. The OS handles themselves are opened lazily.
    fn open(&mut self, torrent: &StorageInfo) -> Result<()>;

    /// Closes the backing files. Pieces mapping them are unloaded.
    fn close(&mut self);

    /// Creates the output files on first run.
    fn create(&mut self, torrent: &mut StorageInfo) -> Result<()>;

    /// Returns a read only piece with the stored bytes of the range.
    fn load_piece(
        &mut self,
        torrent: &StorageInfo,
        chunk: ChunkIndex,
        offset: u32,
        len: u32,
    ) -> Result<PiecePtr>;

    /// Returns a writable piece for the range. Its initial content is
    /// unspecified for buffered pieces.
    fn prepare_piece(
        &mut self,
        torrent: &StorageInfo,
        chunk: ChunkIndex,
        offset: u32,
        len: u32,
    ) -> Result<PiecePtr>;

    /// Flushes a buffered piece to its file(s). Mapped pieces are written
    /// by the OS.
    fn save_piece(&mut self, torrent: &StorageInfo, piece: &PieceData) -> Result<()>;

    /// Reacts to a file being excluded or included again.
    fn download_status_changed(
        &mut self,
        _torrent: &StorageInfo,
        _file: FileIndex,
        _download: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// Hands the files to be preallocated to the worker.
    fn prepare_preallocation(
        &mut self,
        torrent: &StorageInfo,
        prealloc: &mut PreallocationThread,
    ) -> Result<()>;

    /// Returns the files that should be on disk but are not, flagging them
    /// as missing.
    fn has_missing_files(&self, torrent: &mut StorageInfo) -> Vec<PathBuf>;

    fn delete_data_files(&mut self, torrent: &StorageInfo) -> Result<()>;

    /// The number of bytes the data files occupy on disk.
    fn disk_usage(&self, torrent: &StorageInfo) -> Result<u64>;

    /// The mount points of the data files, `None` if they cannot be
    /// determined.
    fn mount_points(&self, torrent: &StorageInfo) -> Option<BTreeSet<PathBuf>>;

    fn clear_pieces(&mut self, chunk: ChunkIndex) {
        self.base_mut().clear_pieces(chunk);
    }

    /// Evicts every cached piece nobody else uses.
    fn check_memory_usage(&mut self) {
        self.base_mut().check_memory_usage();
    }

    fn cached_bytes(&self) -> u64 {
        self.base().cached_bytes()
    }

    /// Whether any data file was already on disk when the files were
    /// created.
    fn has_existing_files(&self) -> bool {
        self.base().preexisting_files
    }

    fn save_mount_points(&mut self, torrent: &StorageInfo) -> Result<()> {
        match self.mount_points(torrent) {
            Some(points) => self.base_mut().save_mount_points(points),
            None => Ok(()),
        }
    }

    fn load_mount_points(&mut self) {
        self.base_mut().load_mount_points();
    }

    /// The recorded mount points that are no longer mounted.
    fn unmounted_storage(&self) -> Vec<PathBuf> {
        self.base().unmounted_storage()
    }

    fn is_storage_mounted(&self) -> bool {
        self.unmounted_storage().is_empty()
    }
}

/// The state shared by both cache layouts.
pub struct CacheBase {
    pub(crate) conf: DiskConf,
    /// The torrent's bookkeeping directory.
    pub(crate) tmpdir: PathBuf,
    pub(crate) preexisting_files: bool,
    mmap_failures: u32,
    /// The pieces handed out, by chunk. The cache holds one reference to
    /// each of them.
    pieces: HashMap<ChunkIndex, Vec<PiecePtr>>,
    mount_points: BTreeSet<PathBuf>,
}

impl CacheBase {
    pub fn new(tmpdir: impl Into<PathBuf>, conf: DiskConf) -> Self {
        Self {
            conf,
            tmpdir: tmpdir.into(),
            preexisting_files: false,
            mmap_failures: 0,
            pieces: HashMap::new(),
            mount_points: BTreeSet::new(),
        }
    }

    pub fn file_map_path(&self) -> PathBuf {
        self.tmpdir.join("file_map")
    }

    fn mount_points_path(&self) -> PathBuf {
        self.tmpdir.join("mount_points")
    }

    /// Looks up a cached piece. A writable piece also serves read only
    /// requests.
    pub fn find_piece(&self, block: BlockInfo, read_only: bool) -> Option<PiecePtr> {
        self.pieces
            .get(&block.chunk)?
            .iter()
            .find(|p| p.block() == block && (read_only || p.writable()))
            .cloned()
    }

    pub fn insert_piece(&mut self, piece: PiecePtr) {
        self.pieces.entry(piece.chunk()).or_default().push(piece);
    }

    pub fn remove_piece(&mut self, piece: &PiecePtr) {
        if let Some(list) = self.pieces.get_mut(&piece.chunk()) {
            list.retain(|p| !Arc::ptr_eq(p, piece));
            if list.is_empty() {
                self.pieces.remove(&piece.chunk());
            }
        }
    }

    pub fn clear_pieces(&mut self, chunk: ChunkIndex) {
        self.pieces.remove(&chunk);
    }

    pub fn has_pieces(&self) -> bool {
        !self.pieces.is_empty()
    }

    /// Empties the piece table. Pieces held elsewhere stay usable unless
    /// their mapping was released by closing its file.
    pub fn forget_pieces(&mut self) {
        self.pieces.clear();
    }

    pub fn check_memory_usage(&mut self) {
        let mut freed = 0u64;
        let mut used = 0u64;
        self.pieces.retain(|_, list| {
            list.retain(|p| {
                if p.in_use() {
                    used += p.len() as u64;
                    true
                } else {
                    freed += p.len() as u64;
                    p.unload();
                    false
                }
            });
            !list.is_empty()
        });
        log::debug!(
            "Piece cache: freed {} bytes, {} bytes still in use",
            freed,
            used
        );
    }

    pub fn cached_bytes(&self) -> u64 {
        self.pieces
            .values()
            .flatten()
            .map(|p| p.len() as u64)
            .sum()
    }

    /// Whether the next piece may be memory mapped.
    pub fn mmap_allowed(&self) -> bool {
        self.conf.use_mmap && self.mmap_failures < self.conf.max_mmap_failures
    }

    /// Creates a piece and adds it to the cache. It is mapped from `file` at
    /// `file_offset` if possible, otherwise it is a heap buffer the caller
    /// has to fill.
    pub(crate) fn create_piece(
        &mut self,
        file: Option<&Arc<CacheFile>>,
        block: BlockInfo,
        file_offset: u64,
        read_only: bool,
    ) -> Result<PiecePtr> {
        if let Some(file) = file.filter(|_| self.mmap_allowed()) {
            let piece = PieceData::new_unloaded(block, read_only);
            let mode = if read_only {
                OpenMode::Read
            } else {
                OpenMode::ReadWrite
            };
            match file.map(Arc::downgrade(&piece), file_offset, block.len as usize, mode)? {
                Mapping::Mapped(region) => {
                    self.mmap_failures = 0;
                    piece.attach(region);
                    self.insert_piece(Arc::clone(&piece));
                    return Ok(piece);
                }
                Mapping::Unavailable(reason) => {
                    self.mmap_failures += 1;
                    log::debug!(
                        "Cannot map piece {} ({}), falling back to buffered mode",
                        block,
                        reason
                    );
                    if !self.mmap_allowed() {
                        log::info!(
                            "{} mmap failures, no longer mapping pieces of {:?}",
                            self.mmap_failures,
                            self.tmpdir
                        );
                    }
                }
            }
        }

        let piece = PieceData::new_heap(block, read_only);
        self.insert_piece(Arc::clone(&piece));
        Ok(piece)
    }

    /// Unloads every piece, in use or not. Done when the cache goes away.
    pub fn cleanup(&mut self) {
        for piece in self.pieces.values().flatten() {
            piece.unload();
        }
        self.pieces.clear();
    }

    pub fn save_mount_points(&mut self, points: BTreeSet<PathBuf>) -> Result<()> {
        let path = self.mount_points_path();
        let content: String = points
            .iter()
            .map(|p| format!("{}\n", p.to_string_lossy()))
            .collect();
        fs::write(&path, content).map_err(|e| {
            log::warn!("Cannot save mount points to {:?}: {}", path, e);
            StorageError::io(&path, e)
        })?;
        self.mount_points = points;
        Ok(())
    }

    pub fn load_mount_points(&mut self) {
        // no record means the torrent predates mount point tracking
        self.mount_points = fs::read_to_string(self.mount_points_path())
            .map(|content| {
                content
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
    }

    pub fn unmounted_storage(&self) -> Vec<PathBuf> {
        self.mount_points
            .iter()
            .filter(|mp| !mount::is_mounted(mp))
            .cloned()
            .collect()
    }
}

impl Drop for CacheBase {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Moves a file, copying it when it has to cross filesystems.
pub(crate) fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::CreateDir {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| {
        log::warn!("Cannot move {:?} to {:?}: {}", from, to, e);
        StorageError::io(to, e)
    })?;
    fs::remove_file(from).map_err(|e| StorageError::io(from, e))
}

/// Removes the empty directories between `leaf` and `root`, `root`
/// included.
pub(crate) fn delete_empty_dirs(root: &Path, leaf: &Path) {
    for dir in leaf.ancestors() {
        if !dir.starts_with(root) {
            break;
        }
        // fails on non empty directories, which ends the walk
        if fs::remove_dir(dir).is_err() {
            break;
        }
    }
}
