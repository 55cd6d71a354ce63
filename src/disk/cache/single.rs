use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{move_file, mount, Cache, CacheBase, FileMapRecord};
use crate::{
    blockinfo::BlockInfo,
    conf::DiskConf,
    disk::{
        io::{disk_usage_of, file::CacheFile, touch},
        piece::{PieceData, PiecePtr},
        prealloc::PreallocationThread,
        record,
    },
    error::disk::{Result, StorageError},
    storage_info::StorageInfo,
    ChunkIndex,
};

/// Stores a single file torrent: chunk `i` lives at byte `i * chunk_len` of
/// the output file.
pub struct SingleFileCache {
    base: CacheBase,
    output_file: PathBuf,
    file: Option<Arc<CacheFile>>,
}

impl SingleFileCache {
    pub fn new(
        torrent: &StorageInfo,
        tmpdir: impl Into<PathBuf>,
        datadir: impl Into<PathBuf>,
        custom_name: Option<&str>,
        conf: DiskConf,
    ) -> Self {
        let datadir = datadir.into();
        let output_file = datadir.join(custom_name.unwrap_or(&torrent.name));
        Self {
            base: CacheBase::new(tmpdir, conf),
            output_file,
            file: None,
        }
    }

    /// Returns the output file, opening it first if needed.
    fn file(&mut self, torrent: &StorageInfo) -> Arc<CacheFile> {
        let conf = &self.base.conf;
        let output_file = &self.output_file;
        Arc::clone(
            self.file
                .get_or_insert_with(|| Arc::new(CacheFile::open(output_file, torrent.total_len, conf))),
        )
    }

    fn piece(
        &mut self,
        torrent: &StorageInfo,
        chunk: ChunkIndex,
        offset: u32,
        len: u32,
        read_only: bool,
    ) -> Result<PiecePtr> {
        let block = checked_block(torrent, chunk, offset, len)?;
        if let Some(piece) = self.base.find_piece(block, read_only) {
            return Ok(piece);
        }

        let file = self.file(torrent);
        let file_offset = torrent.chunk_offset(chunk) + offset as u64;
        let piece = self
            .base
            .create_piece(Some(&file), block, file_offset, read_only)?;
        if read_only && !piece.is_mapped() {
            let res = piece.with_data_mut(|buf| file.read(buf, file_offset));
            if let Err(e) = res.and_then(|r| r) {
                self.base.remove_piece(&piece);
                return Err(e);
            }
        }
        Ok(piece)
    }
}

/// Validates a piece request against the torrent's chunk geometry.
pub(super) fn checked_block(
    torrent: &StorageInfo,
    chunk: ChunkIndex,
    offset: u32,
    len: u32,
) -> Result<BlockInfo> {
    if chunk >= torrent.chunk_count {
        return Err(StorageError::InvalidChunk(chunk));
    }
    let chunk_size = torrent.chunk_size(chunk);
    if len == 0 || offset as u64 + len as u64 > chunk_size as u64 {
        return Err(StorageError::OutOfBounds {
            offset,
            len,
            piece_len: chunk_size,
        });
    }
    Ok(BlockInfo::new(chunk, offset, len))
}

impl Cache for SingleFileCache {
    fn base(&self) -> &CacheBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CacheBase {
        &mut self.base
    }

    fn load_file_map(&mut self, torrent: &mut StorageInfo) -> Result<()> {
        let record: Option<FileMapRecord> = record::read_record(&self.base.file_map_path());
        if let Some(entry) = record.and_then(|r| r.files.into_iter().next()) {
            self.output_file = PathBuf::from(entry.path_on_disk);
            torrent.files[0].user_path = PathBuf::from(entry.user_path);
        }
        torrent.files[0].path_on_disk = self.output_file.clone();
        Ok(())
    }

    fn output_path(&self) -> PathBuf {
        self.output_file.clone()
    }

    fn change_tmp_dir(&mut self, _torrent: &StorageInfo, tmpdir: &Path) {
        self.base.tmpdir = tmpdir.to_path_buf();
    }

    fn change_output_path(&mut self, torrent: &mut StorageInfo, path: &Path) -> Result<()> {
        self.output_file = path.to_path_buf();
        torrent.files[0].path_on_disk = self.output_file.clone();
        if let Some(file) = &self.file {
            file.change_path(path);
        }
        self.save_file_map(torrent)
    }

    fn move_data_files(&mut self, torrent: &mut StorageInfo, new_dir: &Path) -> Result<()> {
        let name = self
            .output_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| torrent.name.clone().into());
        let target = new_dir.join(name);
        self.close();
        if self.output_file.exists() {
            log::info!("Moving {:?} to {:?}", self.output_file, target);
            move_file(&self.output_file, &target)?;
        }
        self.change_output_path(torrent, &target)?;
        self.save_mount_points(torrent)
    }

    fn open(&mut self, torrent: &StorageInfo) -> Result<()> {
        self.file(torrent);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            file.close();
        }
        self.base.forget_pieces();
    }

    fn create(&mut self, torrent: &mut StorageInfo) -> Result<()> {
        let existed = touch(&self.output_file)?;
        if existed {
            log::info!("Output file {:?} already exists", self.output_file);
        }
        torrent.files[0].preexisting = existed;
        self.base.preexisting_files = existed;
        torrent.files[0].path_on_disk = self.output_file.clone();
        self.save_file_map(torrent)
    }

    fn load_piece(
        &mut self,
        torrent: &StorageInfo,
        chunk: ChunkIndex,
        offset: u32,
        len: u32,
    ) -> Result<PiecePtr> {
        self.piece(torrent, chunk, offset, len, true)
    }

    fn prepare_piece(
        &mut self,
        torrent: &StorageInfo,
        chunk: ChunkIndex,
        offset: u32,
        len: u32,
    ) -> Result<PiecePtr> {
        self.piece(torrent, chunk, offset, len, false)
    }

    fn save_piece(&mut self, torrent: &StorageInfo, piece: &PieceData) -> Result<()> {
        if piece.is_mapped() || piece.is_read_only() {
            return Ok(());
        }
        let file = self.file(torrent);
        let file_offset = torrent.chunk_offset(piece.chunk()) + piece.offset() as u64;
        piece.with_data(|data| file.write(data, file_offset))?
    }

    fn prepare_preallocation(
        &mut self,
        torrent: &StorageInfo,
        prealloc: &mut PreallocationThread,
    ) -> Result<()> {
        prealloc.add(self.file(torrent));
        Ok(())
    }

    fn has_missing_files(&self, torrent: &mut StorageInfo) -> Vec<PathBuf> {
        let missing = !self.output_file.exists();
        torrent.files[0].missing = missing;
        if missing {
            vec![self.output_file.clone()]
        } else {
            Vec::new()
        }
    }

    fn delete_data_files(&mut self, _torrent: &StorageInfo) -> Result<()> {
        self.close();
        match fs::remove_file(&self.output_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                log::warn!("Cannot delete {:?}: {}", self.output_file, e);
                Err(StorageError::io(&self.output_file, e))
            }
        }
    }

    fn disk_usage(&self, _torrent: &StorageInfo) -> Result<u64> {
        disk_usage_of(&self.output_file)
    }

    fn mount_points(&self, _torrent: &StorageInfo) -> Option<BTreeSet<PathBuf>> {
        mount::mount_point(&self.output_file).map(|mp| BTreeSet::from([mp]))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::RngCore;
    use tempfile::TempDir;

    use super::*;

    fn setup(dir: &TempDir, len: u64, chunk_len: u32) -> (StorageInfo, SingleFileCache) {
        let mut torrent = StorageInfo::new_single("single.bin", len, chunk_len, Vec::new()).unwrap();
        let mut cache = SingleFileCache::new(
            &torrent,
            dir.path(),
            dir.path().join("data"),
            None,
            DiskConf::default(),
        );
        cache.load_file_map(&mut torrent).unwrap();
        cache.create(&mut torrent).unwrap();
        cache.open(&torrent).unwrap();
        (torrent, cache)
    }

    /// Bytes written through a piece read back the same, after a reopen
    /// too.
    #[test]
    fn should_round_trip_piece_through_reopen() {
        let dir = TempDir::new().unwrap();
        let (torrent, mut cache) = setup(&dir, 3 * 8192 + 100, 8192);

        let mut payload = vec![0u8; 1000];
        rand::thread_rng().fill_bytes(&mut payload);
        let piece = cache.prepare_piece(&torrent, 1, 500, 1000).unwrap();
        piece.write(&payload, 0).unwrap();
        cache.save_piece(&torrent, &piece).unwrap();
        drop(piece);

        cache.close();
        cache.open(&torrent).unwrap();
        let loaded = cache.load_piece(&torrent, 1, 500, 1000).unwrap();
        let mut buf = vec![0u8; 1000];
        loaded.read(&mut buf, 0).unwrap();
        assert_eq!(buf, payload);

        let on_disk = fs::read(dir.path().join("data/single.bin")).unwrap();
        assert_eq!(&on_disk[8192 + 500..8192 + 1500], &payload[..]);
    }

    /// The same round trip with mmap disabled exercises the heap path.
    #[test]
    fn should_round_trip_buffered_piece() {
        let dir = TempDir::new().unwrap();
        let mut torrent = StorageInfo::new_single("buffered.bin", 40, 16, Vec::new()).unwrap();
        let conf = DiskConf {
            use_mmap: false,
            ..DiskConf::default()
        };
        let mut cache = SingleFileCache::new(&torrent, dir.path(), dir.path(), None, conf);
        cache.load_file_map(&mut torrent).unwrap();
        cache.create(&mut torrent).unwrap();

        let piece = cache.prepare_piece(&torrent, 2, 0, 8).unwrap();
        assert!(!piece.is_mapped());
        piece.write(b"lastpart", 0).unwrap();
        cache.save_piece(&torrent, &piece).unwrap();

        let loaded = cache.load_piece(&torrent, 2, 4, 4).unwrap();
        let mut buf = [0u8; 4];
        loaded.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"part");
        assert_eq!(fs::metadata(dir.path().join("buffered.bin")).unwrap().len(), 40);
    }

    #[test]
    fn should_reject_requests_outside_chunk() {
        let dir = TempDir::new().unwrap();
        let (torrent, mut cache) = setup(&dir, 40, 16);
        assert!(matches!(
            cache.prepare_piece(&torrent, 3, 0, 1),
            Err(StorageError::InvalidChunk(3))
        ));
        // the last chunk is only 8 bytes long
        assert!(matches!(
            cache.prepare_piece(&torrent, 2, 4, 8),
            Err(StorageError::OutOfBounds { piece_len: 8, .. })
        ));
    }

    /// After the configured number of failures the cache stops trying to
    /// map pieces.
    #[test]
    fn should_stop_mapping_after_repeated_failures() {
        let dir = TempDir::new().unwrap();
        let (torrent, mut cache) = setup(&dir, 10 * 16384, 16384);
        let file = cache.file(&torrent);
        file.inject_mmap_failure(true);

        for chunk in 0..5 {
            let piece = cache.prepare_piece(&torrent, chunk, 0, 1024).unwrap();
            assert!(!piece.is_mapped());
        }
        assert_eq!(file.map_attempts(), 3);
        assert!(!cache.base().mmap_allowed());

        // the heap pieces still work
        let piece = cache.prepare_piece(&torrent, 6, 0, 4).unwrap();
        piece.write(b"heap", 0).unwrap();
        cache.save_piece(&torrent, &piece).unwrap();
        assert_eq!(file.map_attempts(), 3);
    }

    /// A mapped piece whose file was truncated behind our back reports a
    /// fault instead of crashing.
    #[test]
    fn should_report_fault_on_truncated_file() {
        let dir = TempDir::new().unwrap();
        let (torrent, mut cache) = setup(&dir, 4 * 16384, 16384);
        let piece = cache.prepare_piece(&torrent, 3, 0, 16384).unwrap();
        if !piece.is_mapped() {
            return;
        }
        piece.write(b"data", 0).unwrap();

        fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("data/single.bin"))
            .unwrap()
            .set_len(16384)
            .unwrap();
        assert!(matches!(
            piece.write(b"more", 4),
            Err(StorageError::IoFault { .. })
        ));
        assert!(matches!(piece.hash(), Err(StorageError::IoFault { .. })));
    }

    #[test]
    fn should_move_data_files() {
        let dir = TempDir::new().unwrap();
        let (mut torrent, mut cache) = setup(&dir, 40, 16);
        let piece = cache.prepare_piece(&torrent, 0, 0, 16).unwrap();
        piece.write(b"0123456789abcdef", 0).unwrap();
        cache.save_piece(&torrent, &piece).unwrap();
        drop(piece);

        let new_dir = dir.path().join("moved");
        cache.move_data_files(&mut torrent, &new_dir).unwrap();
        let target = new_dir.join("single.bin");
        assert_eq!(cache.output_path(), target);
        assert_eq!(torrent.files[0].path_on_disk, target);
        assert!(!dir.path().join("data/single.bin").exists());
        assert_eq!(&fs::read(&target).unwrap()[..16], b"0123456789abcdef");
        assert!(cache.is_storage_mounted());

        // the new location survives a reload
        let mut reloaded = StorageInfo::new_single("single.bin", 40, 16, Vec::new()).unwrap();
        let mut other = SingleFileCache::new(
            &reloaded,
            dir.path(),
            dir.path().join("data"),
            None,
            DiskConf::default(),
        );
        other.load_file_map(&mut reloaded).unwrap();
        assert_eq!(other.output_path(), target);
    }

    #[test]
    fn should_detect_missing_and_preexisting_files() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("single.bin"), vec![1u8; 40]).unwrap();

        let (mut torrent, mut cache) = setup(&dir, 40, 16);
        assert!(cache.has_existing_files());
        assert!(torrent.files[0].preexisting);
        assert!(cache.has_missing_files(&mut torrent).is_empty());

        cache.delete_data_files(&torrent).unwrap();
        assert_eq!(cache.has_missing_files(&mut torrent), vec![data.join("single.bin")]);
        assert!(torrent.files[0].missing);
    }
}
