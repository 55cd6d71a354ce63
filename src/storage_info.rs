use std::{
    ops::Range,
    path::{Path, PathBuf},
};

use crate::{
    error::disk::{Result, StorageError},
    priority::Priority,
    ChunkIndex, FileIndex, Sha1Hash,
};

/// Information about the torrent file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// file's relative path from the download directory.
    pub path: PathBuf,
    /// the file's length
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// The torrent offset one past the last byte of the file.
    pub fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }
}

/// The part of a piece that falls into a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    /// The index of the file in the torrent.
    pub index: FileIndex,
    /// The offset of the slice relative to the start of the file.
    pub offset: u64,
    /// The number of bytes of the piece inside this file.
    pub len: u64,
}

/// The kind of multimedia content a file holds, which determines its
/// preview budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

const AUDIO_EXTENSIONS: &[&str] = &[
    "aac", "ac3", "aiff", "ape", "flac", "m4a", "mka", "mp2", "mp3", "oga", "ogg", "opus",
    "wav", "wma",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    "3gp", "asf", "avi", "divx", "flv", "m2ts", "m4v", "mkv", "mov", "mp4", "mpeg", "mpg",
    "ogm", "ogv", "rm", "rmvb", "ts", "vob", "webm", "wmv",
];

impl MediaKind {
    /// Guesses the media kind from the file extension.
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Audio)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }
}

/// A file of the torrent: its static position in the torrent's byte stream
/// and the user's download decisions about it.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub index: FileIndex,
    pub info: FileInfo,
    /// The chunk holding the file's first byte.
    pub first_chunk: ChunkIndex,
    /// The chunk holding the file's last byte.
    pub last_chunk: ChunkIndex,
    /// Where the file starts inside its first chunk.
    pub first_chunk_offset: u32,
    /// How many of the file's bytes lie in its last chunk, counted from the
    /// start of that chunk.
    pub last_chunk_len: u32,

    priority: Priority,
    old_priority: Priority,
    /// The file is not on disk although it should be.
    pub missing: bool,
    /// The file was already on disk when the torrent's files were created.
    pub preexisting: bool,
    /// Where the file lives on disk.
    pub path_on_disk: PathBuf,
    /// The path shown to the user, relative to the output directory.
    pub user_path: PathBuf,
    /// The number of this file's chunks that are on disk.
    pub downloaded_chunks: u32,
}

impl TorrentFile {
    fn new(index: FileIndex, info: FileInfo, chunk_len: u32, chunk_count: u32) -> Self {
        let cl = chunk_len as u64;
        let max_chunk = chunk_count.saturating_sub(1);
        let first_chunk = ((info.torrent_offset / cl) as ChunkIndex).min(max_chunk);
        let first_chunk_offset = (info.torrent_offset - first_chunk as u64 * cl) as u32;
        let (last_chunk, last_chunk_len) = if info.len == 0 {
            (first_chunk, first_chunk_offset)
        } else {
            let end = info.torrent_end_offset();
            let last = ((end - 1) / cl) as ChunkIndex;
            (last, (end - last as u64 * cl) as u32)
        };
        let user_path = info.path.clone();
        Self {
            index,
            info,
            first_chunk,
            last_chunk,
            first_chunk_offset,
            last_chunk_len,
            priority: Priority::Normal,
            old_priority: Priority::Normal,
            missing: false,
            preexisting: false,
            path_on_disk: PathBuf::new(),
            user_path,
            downloaded_chunks: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.info.len
    }

    pub fn is_empty(&self) -> bool {
        self.info.len == 0
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn old_priority(&self) -> Priority {
        self.old_priority
    }

    /// Changes the priority, remembering the previous one for the transition
    /// logic.
    ///
    /// Returns false if the priority did not change.
    pub fn set_priority(&mut self, prio: Priority) -> bool {
        if prio == self.priority {
            return false;
        }
        self.old_priority = self.priority;
        self.priority = prio;
        true
    }

    /// Whether the user opted out of downloading this file.
    pub fn do_not_download(&self) -> bool {
        self.priority == Priority::Excluded
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        MediaKind::detect(&self.user_path)
    }

    pub fn is_multimedia(&self) -> bool {
        self.media_kind().is_some()
    }

    /// The number of chunks overlapping this file.
    pub fn chunk_count(&self) -> u32 {
        self.last_chunk - self.first_chunk + 1
    }

    /// The number of the file's bytes inside its first chunk.
    pub fn first_region_len(&self, chunk_len: u32) -> u32 {
        let room = (chunk_len - self.first_chunk_offset) as u64;
        room.min(self.info.len) as u32
    }

    /// The number of the file's bytes inside its last chunk, or 0 if the file
    /// fits in a single chunk, in which case the first region covers it.
    pub fn last_region_len(&self) -> u32 {
        if self.first_chunk == self.last_chunk {
            0
        } else {
            self.last_chunk_len
        }
    }

    /// The percentage of the file's chunks that are downloaded.
    pub fn download_percentage(&self) -> f32 {
        if self.is_empty() {
            return 100.0;
        }
        100.0 * self.downloaded_chunks as f32 / self.chunk_count() as f32
    }
}

/// All information concerning the torrent's storage: its chunk geometry and
/// the files it consists of.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    /// The torrent's name, the output file name of a single file torrent or
    /// the output directory name of a multi file torrent.
    pub name: String,
    /// The nominal length of a chunk.
    pub chunk_len: u32,
    /// The length of the last chunk, which may be shorter.
    pub last_chunk_len: u32,
    pub chunk_count: u32,
    /// The sum of the length of all files in the torrent.
    pub total_len: u64,
    pub files: Vec<TorrentFile>,
    /// The expected hash of every chunk. May be empty if unknown.
    pub chunk_hashes: Vec<Sha1Hash>,
    multi_file: bool,
}

impl StorageInfo {
    /// Describes a torrent that downloads into a single file called `name`.
    pub fn new_single(
        name: impl Into<String>,
        len: u64,
        chunk_len: u32,
        chunk_hashes: Vec<Sha1Hash>,
    ) -> Result<Self> {
        let name = name.into();
        let files = vec![FileInfo {
            path: PathBuf::from(&name),
            len,
            torrent_offset: 0,
        }];
        Self::build(name, chunk_len, files, chunk_hashes, false)
    }

    /// Describes a torrent that downloads into a directory called `name`.
    /// The files' paths are relative to that directory.
    pub fn new_multi(
        name: impl Into<String>,
        chunk_len: u32,
        files: Vec<FileInfo>,
        chunk_hashes: Vec<Sha1Hash>,
    ) -> Result<Self> {
        Self::build(name.into(), chunk_len, files, chunk_hashes, true)
    }

    fn build(
        name: String,
        chunk_len: u32,
        files: Vec<FileInfo>,
        chunk_hashes: Vec<Sha1Hash>,
        multi_file: bool,
    ) -> Result<Self> {
        if chunk_len == 0 {
            return Err(StorageError::InvalidLayout("chunk length is zero".into()));
        }
        if files.is_empty() {
            return Err(StorageError::InvalidLayout("torrent has no files".into()));
        }

        let mut total_len = 0;
        for (i, f) in files.iter().enumerate() {
            if f.torrent_offset != total_len {
                return Err(StorageError::InvalidLayout(format!(
                    "file {} starts at {} instead of {}",
                    i, f.torrent_offset, total_len
                )));
            }
            total_len += f.len;
        }
        if total_len == 0 {
            return Err(StorageError::InvalidLayout("torrent is empty".into()));
        }

        let cl = chunk_len as u64;
        let chunk_count = ((total_len + cl - 1) / cl) as u32;
        let last_chunk_len = (total_len - (chunk_count as u64 - 1) * cl) as u32;
        if !chunk_hashes.is_empty() && chunk_hashes.len() != chunk_count as usize {
            return Err(StorageError::InvalidLayout(format!(
                "{} chunk hashes for {} chunks",
                chunk_hashes.len(),
                chunk_count
            )));
        }

        let files = files
            .into_iter()
            .enumerate()
            .map(|(i, info)| TorrentFile::new(i, info, chunk_len, chunk_count))
            .collect();

        Ok(Self {
            name,
            chunk_len,
            last_chunk_len,
            chunk_count,
            total_len,
            files,
            chunk_hashes,
            multi_file,
        })
    }

    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn last_chunk(&self) -> ChunkIndex {
        self.chunk_count - 1
    }

    /// Returns the length of the chunk at the index.
    pub fn chunk_size(&self, index: ChunkIndex) -> u32 {
        if index == self.last_chunk() {
            self.last_chunk_len
        } else {
            self.chunk_len
        }
    }

    /// Returns the torrent offset of the chunk's first byte.
    pub fn chunk_offset(&self, index: ChunkIndex) -> u64 {
        index as u64 * self.chunk_len as u64
    }

    pub fn file(&self, index: FileIndex) -> Result<&TorrentFile> {
        self.files.get(index).ok_or(StorageError::InvalidFile(index))
    }

    pub fn file_mut(&mut self, index: FileIndex) -> Result<&mut TorrentFile> {
        self.files
            .get_mut(index)
            .ok_or(StorageError::InvalidFile(index))
    }

    /// Returns the ordered range of files overlapping the chunk.
    pub fn files_of_chunk(&self, index: ChunkIndex) -> Range<FileIndex> {
        let start = self.files.partition_point(|f| f.last_chunk < index);
        let end = self.files.partition_point(|f| f.first_chunk <= index);
        start..end.max(start)
    }

    /// Splits the byte range `[offset, offset + len)` of a chunk into the
    /// parts falling into each file, in torrent order.
    ///
    /// Only the first slice can start in the middle of its file, every later
    /// slice starts at its file's first byte. Zero-length files are skipped.
    pub fn chunk_slices(&self, index: ChunkIndex, offset: u32, len: u32) -> Vec<FileSlice> {
        let start = self.chunk_offset(index) + offset as u64;
        let end = start + len as u64;
        self.files[self.files_of_chunk(index)]
            .iter()
            .filter_map(|f| {
                let slice_start = start.max(f.info.torrent_offset);
                let slice_end = end.min(f.info.torrent_end_offset());
                (slice_start < slice_end).then(|| FileSlice {
                    index: f.index,
                    offset: slice_start - f.info.torrent_offset,
                    len: slice_end - slice_start,
                })
            })
            .collect()
    }

    /// Guesses the media kind of a single file torrent from its name.
    pub fn media_kind(&self) -> Option<MediaKind> {
        if self.multi_file {
            None
        } else {
            MediaKind::detect(Path::new(&self.name))
        }
    }
}
