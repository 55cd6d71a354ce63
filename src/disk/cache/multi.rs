use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{delete_empty_dirs, move_file, mount, single::checked_block, Cache, CacheBase, FileMapRecord};
use crate::{
    conf::DiskConf,
    disk::{
        io::{
            disk_usage_of,
            dnd::{DndFile, DndRegion},
            file::CacheFile,
            pread_up_to, touch,
        },
        piece::{PieceData, PiecePtr},
        prealloc::PreallocationThread,
        record,
    },
    error::disk::{Result, StorageError},
    storage_info::{FileSlice, StorageInfo, TorrentFile},
    ChunkIndex, FileIndex,
};

/// Stores a multi file torrent under its output directory.
///
/// A chunk may span several files. Pieces of a chunk lying inside one
/// wanted file are mapped like in the single file case, every other piece
/// is a heap buffer read and written file by file. Files the user excluded
/// are replaced by a [`DndFile`] keeping only their bytes in the chunks they
/// share with their neighbours.
pub struct MultiFileCache {
    base: CacheBase,
    output_dir: PathBuf,
    files: BTreeMap<FileIndex, Arc<CacheFile>>,
    dnd_files: HashMap<FileIndex, DndFile>,
}

impl MultiFileCache {
    pub fn new(
        torrent: &StorageInfo,
        tmpdir: impl Into<PathBuf>,
        datadir: impl Into<PathBuf>,
        custom_name: Option<&str>,
        conf: DiskConf,
    ) -> Self {
        let datadir = datadir.into();
        let output_dir = datadir.join(custom_name.unwrap_or(&torrent.name));
        Self {
            base: CacheBase::new(tmpdir, conf),
            output_dir,
            files: BTreeMap::new(),
            dnd_files: HashMap::new(),
        }
    }

    fn dnd_dir(&self) -> PathBuf {
        self.base.tmpdir.join("dnd")
    }

    fn dnd_path(&self, index: FileIndex) -> PathBuf {
        self.dnd_dir().join(format!("file{}.dnd", index))
    }

    fn cache_file(&mut self, torrent: &StorageInfo, index: FileIndex) -> Arc<CacheFile> {
        let conf = &self.base.conf;
        let f = &torrent.files[index];
        Arc::clone(
            self.files
                .entry(index)
                .or_insert_with(|| Arc::new(CacheFile::open(&f.path_on_disk, f.len(), conf))),
        )
    }

    fn dnd_file(&mut self, torrent: &StorageInfo, index: FileIndex) -> &DndFile {
        let path = self.dnd_path(index);
        let chunk_len = torrent.chunk_len;
        self.dnd_files
            .entry(index)
            .or_insert_with(|| DndFile::new(path, &torrent.files[index], chunk_len))
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

        let slices = torrent.chunk_slices(chunk, offset, len);
        let piece = match slices.as_slice() {
            [slice] if !torrent.files[slice.index].do_not_download() => {
                let file = self.cache_file(torrent, slice.index);
                self.base
                    .create_piece(Some(&file), block, slice.offset, read_only)?
            }
            _ => self.base.create_piece(None, block, 0, read_only)?,
        };

        if read_only && !piece.is_mapped() {
            let res = piece.with_data_mut(|buf| self.read_slices(torrent, chunk, &slices, buf));
            if let Err(e) = res.and_then(|r| r) {
                self.base.remove_piece(&piece);
                return Err(e);
            }
        }
        Ok(piece)
    }

    /// Fills `buf` with the bytes of the slices, in order.
    fn read_slices(
        &mut self,
        torrent: &StorageInfo,
        chunk: ChunkIndex,
        slices: &[FileSlice],
        buf: &mut [u8],
    ) -> Result<()> {
        let mut pos = 0;
        for slice in slices {
            let dst = &mut buf[pos..pos + slice.len as usize];
            let file = &torrent.files[slice.index];
            if file.do_not_download() {
                match DndFile::locate(file, chunk, slice.offset) {
                    Some((region, offset)) => {
                        self.dnd_file(torrent, slice.index).read(region, dst, offset)?;
                    }
                    None => dst.fill(0),
                }
            } else {
                self.cache_file(torrent, slice.index).read(dst, slice.offset)?;
            }
            pos += slice.len as usize;
        }
        Ok(())
    }

    /// Distributes `buf` over the slices, in order.
    fn write_slices(
        &mut self,
        torrent: &StorageInfo,
        chunk: ChunkIndex,
        slices: &[FileSlice],
        buf: &[u8],
    ) -> Result<()> {
        let mut pos = 0;
        for slice in slices {
            let src = &buf[pos..pos + slice.len as usize];
            let file = &torrent.files[slice.index];
            if file.do_not_download() {
                match DndFile::locate(file, chunk, slice.offset) {
                    Some((region, offset)) => {
                        self.dnd_file(torrent, slice.index).write(region, src, offset)?;
                    }
                    None => log::warn!(
                        "Dropping {} bytes of chunk {} for excluded file {:?}",
                        slice.len,
                        chunk,
                        file.user_path
                    ),
                }
            } else {
                self.cache_file(torrent, slice.index).write(src, slice.offset)?;
            }
            pos += slice.len as usize;
        }
        Ok(())
    }

    /// Drops the cached pieces of the file's chunks, they may route their
    /// bytes differently from now on.
    fn clear_file_pieces(&mut self, file: &TorrentFile) {
        for chunk in file.first_chunk..=file.last_chunk {
            self.base.clear_pieces(chunk);
        }
    }

    /// Keeps the boundary bytes of a file that is being excluded in its DND
    /// file and removes the data file.
    fn exclude_file(&mut self, torrent: &StorageInfo, index: FileIndex) -> Result<()> {
        let file = &torrent.files[index];
        let dnd_path = self.dnd_path(index);
        let dnd = DndFile::new(&dnd_path, file, torrent.chunk_len);
        if dnd_path.exists() {
            dnd.check_integrity()?;
        } else {
            dnd.create()?;
            if file.path_on_disk.exists() {
                save_boundary_regions(file, &dnd)?;
            }
        }

        self.clear_file_pieces(file);
        if let Some(cache_file) = self.files.remove(&index) {
            cache_file.close();
        }
        match fs::remove_file(&file.path_on_disk) {
            Ok(()) => log::info!(
                "Excluded {:?}, kept its boundary bytes in {:?}",
                file.path_on_disk,
                dnd_path
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&file.path_on_disk, e)),
        }
        self.dnd_files.insert(index, dnd);
        Ok(())
    }

    /// Recreates the data file of a file that is included again, restoring
    /// the boundary bytes kept in its DND file.
    fn include_file(&mut self, torrent: &StorageInfo, index: FileIndex) -> Result<()> {
        let file = &torrent.files[index];
        if file.path_on_disk.exists() {
            self.dnd_files.remove(&index);
            self.cache_file(torrent, index);
            return Ok(());
        }

        let dnd_path = self.dnd_path(index);
        touch(&file.path_on_disk)?;
        let cache_file = Arc::new(CacheFile::open(&file.path_on_disk, file.len(), &self.base.conf));
        if dnd_path.exists() {
            let dnd = DndFile::new(&dnd_path, file, torrent.chunk_len);
            restore_boundary_regions(file, &dnd, &cache_file)?;
        }

        self.clear_file_pieces(file);
        self.files.insert(index, cache_file);
        self.dnd_files.remove(&index);
        if let Err(e) = fs::remove_file(&dnd_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Cannot delete DND file {:?}: {}", dnd_path, e);
            }
        }
        log::info!("Included {:?} again", file.path_on_disk);
        Ok(())
    }
}

/// Copies the file's bytes in its first and last chunk into the DND file.
/// Bytes not in the data file yet are stored as zeros.
fn save_boundary_regions(file: &TorrentFile, dnd: &DndFile) -> Result<()> {
    let data = fs::File::open(&file.path_on_disk).map_err(|e| {
        log::warn!("Failed to open file {:?}: {}", file.path_on_disk, e);
        StorageError::Open {
            path: file.path_on_disk.clone(),
            source: e,
        }
    })?;

    let regions = [
        (DndRegion::First, 0),
        (DndRegion::Last, file.len() - dnd.region_len(DndRegion::Last) as u64),
    ];
    for (region, file_offset) in regions {
        let mut buf = vec![0u8; dnd.region_len(region) as usize];
        if buf.is_empty() {
            continue;
        }
        let n = pread_up_to(&data, &mut buf, file_offset)
            .map_err(|e| StorageError::io(&file.path_on_disk, e))?;
        buf[n..].fill(0);
        dnd.write(region, &buf, 0)?;
    }
    Ok(())
}

/// Writes the bytes kept in the DND file back into the data file.
fn restore_boundary_regions(file: &TorrentFile, dnd: &DndFile, target: &CacheFile) -> Result<()> {
    let regions = [
        (DndRegion::First, 0),
        (DndRegion::Last, file.len() - dnd.region_len(DndRegion::Last) as u64),
    ];
    for (region, file_offset) in regions {
        let mut buf = vec![0u8; dnd.region_len(region) as usize];
        if buf.is_empty() {
            continue;
        }
        let n = dnd.read(region, &mut buf, 0)?;
        if n > 0 {
            target.write(&buf[..n], file_offset)?;
        }
    }
    Ok(())
}

impl Cache for MultiFileCache {
    fn base(&self) -> &CacheBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut CacheBase {
        &mut self.base
    }

    fn load_file_map(&mut self, torrent: &mut StorageInfo) -> Result<()> {
        let record: Option<FileMapRecord> = record::read_record(&self.base.file_map_path());
        match record {
            Some(record) if record.files.len() == torrent.files.len() => {
                for (f, entry) in torrent.files.iter_mut().zip(record.files) {
                    f.path_on_disk = PathBuf::from(entry.path_on_disk);
                    f.user_path = PathBuf::from(entry.user_path);
                }
            }
            Some(record) => {
                log::warn!(
                    "File map lists {} files instead of {}, ignoring it",
                    record.files.len(),
                    torrent.files.len()
                );
                self.default_paths(torrent);
            }
            None => self.default_paths(torrent),
        }
        Ok(())
    }

    fn output_path(&self) -> PathBuf {
        self.output_dir.clone()
    }

    fn change_tmp_dir(&mut self, _torrent: &StorageInfo, tmpdir: &Path) {
        self.base.tmpdir = tmpdir.to_path_buf();
        let paths: Vec<(FileIndex, PathBuf)> = self
            .dnd_files
            .keys()
            .map(|&i| (i, self.dnd_path(i)))
            .collect();
        for (i, path) in paths {
            if let Some(dnd) = self.dnd_files.get_mut(&i) {
                dnd.change_path(path);
            }
        }
    }

    fn change_output_path(&mut self, torrent: &mut StorageInfo, path: &Path) -> Result<()> {
        self.output_dir = path.to_path_buf();
        for f in torrent.files.iter_mut() {
            f.path_on_disk = self.output_dir.join(&f.user_path);
            if let Some(file) = self.files.get(&f.index) {
                file.change_path(&f.path_on_disk);
            }
        }
        self.save_file_map(torrent)
    }

    fn move_data_files(&mut self, torrent: &mut StorageInfo, new_dir: &Path) -> Result<()> {
        let name = self
            .output_dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| torrent.name.clone().into());
        let target = new_dir.join(name);
        self.close();

        for f in &torrent.files {
            if f.do_not_download() || !f.path_on_disk.exists() {
                continue;
            }
            let to = target.join(&f.user_path);
            log::info!("Moving {:?} to {:?}", f.path_on_disk, to);
            move_file(&f.path_on_disk, &to)?;
            if let Some(parent) = f.path_on_disk.parent() {
                delete_empty_dirs(&self.output_dir, parent);
            }
        }
        self.change_output_path(torrent, &target)?;
        self.save_mount_points(torrent)
    }

    fn open(&mut self, torrent: &StorageInfo) -> Result<()> {
        for f in &torrent.files {
            if f.do_not_download() {
                self.dnd_file(torrent, f.index).check_integrity()?;
            } else if !f.is_empty() {
                self.cache_file(torrent, f.index);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        for file in self.files.values() {
            file.close();
        }
        self.files.clear();
        self.dnd_files.clear();
        self.base.forget_pieces();
    }

    fn create(&mut self, torrent: &mut StorageInfo) -> Result<()> {
        fs::create_dir_all(&self.output_dir).map_err(|e| StorageError::CreateDir {
            path: self.output_dir.clone(),
            source: e,
        })?;
        fs::create_dir_all(self.dnd_dir()).map_err(|e| StorageError::CreateDir {
            path: self.dnd_dir(),
            source: e,
        })?;

        let mut preexisting = false;
        for i in 0..torrent.files.len() {
            if torrent.files[i].do_not_download() {
                let dnd_path = self.dnd_path(i);
                DndFile::new(dnd_path, &torrent.files[i], torrent.chunk_len).check_integrity()?;
                continue;
            }
            let f = &mut torrent.files[i];
            let existed = touch(&f.path_on_disk)?;
            f.preexisting = existed;
            if existed && !f.is_empty() {
                log::info!("File {:?} already exists", f.path_on_disk);
                preexisting = true;
            }
        }
        self.base.preexisting_files = preexisting;
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
        let chunk = piece.chunk();
        let slices = torrent.chunk_slices(chunk, piece.offset(), piece.len());
        piece.with_data(|data| self.write_slices(torrent, chunk, &slices, data))?
    }

    fn download_status_changed(
        &mut self,
        torrent: &StorageInfo,
        file: FileIndex,
        download: bool,
    ) -> Result<()> {
        if torrent.file(file)?.is_empty() {
            return Ok(());
        }
        if download {
            self.include_file(torrent, file)
        } else {
            self.exclude_file(torrent, file)
        }
    }

    fn prepare_preallocation(
        &mut self,
        torrent: &StorageInfo,
        prealloc: &mut PreallocationThread,
    ) -> Result<()> {
        for f in &torrent.files {
            if !f.do_not_download() && !f.is_empty() {
                prealloc.add(self.cache_file(torrent, f.index));
            }
        }
        Ok(())
    }

    fn has_missing_files(&self, torrent: &mut StorageInfo) -> Vec<PathBuf> {
        let mut missing = Vec::new();
        for f in torrent.files.iter_mut() {
            f.missing = !f.do_not_download() && !f.path_on_disk.exists();
            if f.missing {
                missing.push(f.path_on_disk.clone());
            }
        }
        missing
    }

    fn delete_data_files(&mut self, torrent: &StorageInfo) -> Result<()> {
        self.close();
        for f in &torrent.files {
            match fs::remove_file(&f.path_on_disk) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Cannot delete {:?}: {}", f.path_on_disk, e);
                    return Err(StorageError::io(&f.path_on_disk, e));
                }
            }
            if let Some(parent) = f.path_on_disk.parent() {
                delete_empty_dirs(&self.output_dir, parent);
            }
        }
        if let Err(e) = fs::remove_dir_all(self.dnd_dir()) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Cannot delete {:?}: {}", self.dnd_dir(), e);
            }
        }
        Ok(())
    }

    fn disk_usage(&self, torrent: &StorageInfo) -> Result<u64> {
        let mut usage = 0;
        for f in &torrent.files {
            usage += if f.do_not_download() {
                disk_usage_of(&self.dnd_path(f.index))?
            } else {
                disk_usage_of(&f.path_on_disk)?
            };
        }
        Ok(usage)
    }

    fn mount_points(&self, torrent: &StorageInfo) -> Option<BTreeSet<PathBuf>> {
        torrent
            .files
            .iter()
            .filter(|f| !f.do_not_download())
            .map(|f| mount::mount_point(&f.path_on_disk))
            .collect()
    }
}

impl MultiFileCache {
    fn default_paths(&self, torrent: &mut StorageInfo) {
        for f in torrent.files.iter_mut() {
            f.path_on_disk = self.output_dir.join(&f.info.path);
            f.user_path = f.info.path.clone();
        }
    }
}
