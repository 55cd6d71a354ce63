//! Configuration of the disk storage engine.
//!
//! There is no global state: a [`DiskConf`] is handed to the caches and the
//! preallocation worker when they are constructed.

/// The default preview budget for audio files, 256 KiB.
pub const DEFAULT_PREVIEW_SIZE_AUDIO: u32 = 256 * 1024;
/// The default preview budget for video files, 2 MiB.
pub const DEFAULT_PREVIEW_SIZE_VIDEO: u32 = 2 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct DiskConf {
    /// Extend every backing file to its final size before the download
    /// starts.
    pub preallocate_files: bool,
    /// Physically reserve the blocks of the backing files instead of only
    /// setting their length.
    ///
    /// Only meaningful when `preallocate_files` is set.
    pub preallocate_fully: bool,
    /// How many bytes at each end of an audio file are boosted to a preview
    /// priority.
    pub preview_size_audio: u32,
    /// How many bytes at each end of a video file are boosted to a preview
    /// priority.
    pub preview_size_video: u32,
    /// Whether pieces may be memory mapped at all.
    pub use_mmap: bool,
    /// After this many failed mmap attempts a cache serves every piece from
    /// heap buffers for the rest of the session.
    pub max_mmap_failures: u32,
    /// The number of file descriptors that must stay free before a backing
    /// file is reopened for mapping.
    pub reserved_fds: u64,
}

impl Default for DiskConf {
    fn default() -> Self {
        Self {
            preallocate_files: true,
            preallocate_fully: false,
            preview_size_audio: DEFAULT_PREVIEW_SIZE_AUDIO,
            preview_size_video: DEFAULT_PREVIEW_SIZE_VIDEO,
            use_mmap: true,
            max_mmap_failures: 3,
            reserved_fds: 100,
        }
    }
}
