use std::path::PathBuf;

use crate::storage_info::{FileInfo, StorageInfo};

/// A multi file torrent called "multi" with files `file0`, `file1`, ... of
/// the given lengths and no chunk hashes.
pub(crate) fn multi(chunk_len: u32, lens: &[u64]) -> StorageInfo {
    let mut torrent_offset = 0;
    let files = lens
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let info = FileInfo {
                path: PathBuf::from(format!("file{}", i)),
                len,
                torrent_offset,
            };
            torrent_offset += len;
            info
        })
        .collect();
    StorageInfo::new_multi("multi", chunk_len, files, Vec::new()).unwrap()
}
