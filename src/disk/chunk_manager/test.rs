/// test the chunk manager's bookkeeping against real files.
#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use bitvec::prelude::*;
    use pretty_assertions::assert_eq;
    use sha1::{Digest, Sha1};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::{
        alert::{Alert, AlertReceiver},
        conf::DiskConf,
        disk::{cache::Cache, chunk::ChunkStatus, chunk_manager::ChunkManager},
        priority::Priority,
        storage_info::{FileInfo, StorageInfo},
        test_util::multi,
    };

    fn conf() -> DiskConf {
        DiskConf {
            preallocate_files: false,
            ..Default::default()
        }
    }

    fn manager(dir: &TempDir, torrent: StorageInfo) -> (ChunkManager, AlertReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cm = ChunkManager::new(
            torrent,
            dir.path().join("tmp"),
            dir.path().join("data"),
            None,
            conf(),
            Some(tx),
        )
        .unwrap();
        (cm, rx)
    }

    fn single(len: u64, chunk_len: u32) -> StorageInfo {
        StorageInfo::new_single("single.bin", len, chunk_len, Vec::new()).unwrap()
    }

    fn drain(rx: &mut AlertReceiver) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            alerts.push(alert);
        }
        alerts
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    /// Every byte of the torrent is either downloaded, still to download or
    /// excluded.
    fn assert_bytes_add_up(cm: &ChunkManager) {
        assert_eq!(
            cm.bytes_downloaded() + cm.bytes_left_to_download() + cm.bytes_excluded(),
            cm.torrent().total_len
        );
    }

    #[test]
    fn should_persist_downloaded_chunks() {
        let dir = TempDir::new().unwrap();
        let data = pattern(40);
        {
            let (mut cm, _rx) = manager(&dir, single(40, 16));
            cm.create_files(false).unwrap();
            cm.start().unwrap();
            cm.write_chunk(0, &data[..16]).unwrap();
            cm.chunk_downloaded(0).unwrap();
            cm.write_chunk(2, &data[32..]).unwrap();
            cm.chunk_downloaded(2).unwrap();
            assert_eq!(cm.chunks_downloaded(), 2);
            assert_eq!(cm.bytes_left(), 16);
            assert_eq!(cm.torrent().files[0].downloaded_chunks, 2);
            cm.stop();
        }

        let (mut cm, _rx) = manager(&dir, single(40, 16));
        cm.load_index_file().unwrap();
        cm.start().unwrap();
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 1, 0, 1]);
        assert_eq!(cm.chunk(2).unwrap().status(), ChunkStatus::OnDisk);
        assert!(cm.todo_chunks()[1]);
        assert!(!cm.completed());

        let mut buf = vec![0; 8];
        cm.read_piece(2, 0, &mut buf).unwrap();
        assert_eq!(buf, &data[32..]);
    }

    #[test]
    fn should_skip_garbage_in_index() {
        let dir = TempDir::new().unwrap();
        let (cm, _rx) = manager(&dir, single(40, 16));
        let mut index = Vec::new();
        index.extend_from_slice(&1u32.to_le_bytes());
        index.extend_from_slice(&99u32.to_le_bytes());
        index.extend_from_slice(&[2, 0]);
        fs::write(cm.tmpdir().join("index"), index).unwrap();
        drop(cm);

        let (mut cm, _rx) = manager(&dir, single(40, 16));
        cm.load_index_file().unwrap();
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 0, 1, 0]);
    }

    #[test]
    fn should_reject_invalid_chunks() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, single(40, 16));
        cm.create_files(false).unwrap();
        assert!(cm.chunk_downloaded(3).is_err());
        assert!(cm.write_chunk(0, &[0; 15]).is_err());
        assert!(cm.write_chunk(3, &[0; 16]).is_err());
        assert!(cm.check_hash(7).is_err());
    }

    #[test]
    fn should_reset_chunk_idempotently() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, single(40, 16));
        cm.chunk_downloaded(1).unwrap();
        cm.reset_chunk(1);
        cm.reset_chunk(1);
        // out of range is ignored
        cm.reset_chunk(3);

        assert_eq!(cm.chunks_downloaded(), 0);
        assert!(cm.todo_chunks()[1]);
        assert_eq!(cm.chunk(1).unwrap().status(), ChunkStatus::NotDownloaded);
        assert_bytes_add_up(&cm);
    }

    #[test]
    fn should_exclude_and_include_range() {
        let dir = TempDir::new().unwrap();
        let (mut cm, mut rx) = manager(&dir, single(40, 16));
        cm.chunk_downloaded(2).unwrap();

        cm.exclude(2, 2);
        assert_eq!(cm.chunks_excluded(), 1);
        assert_eq!(cm.bytes_excluded(), 8);
        assert_eq!(cm.bytes_left_to_download(), 32);
        assert_eq!(cm.chunks_downloaded(), 0);
        assert!(!cm.todo_chunks()[2]);
        assert_eq!(cm.chunks_left(), 2);
        assert_bytes_add_up(&cm);

        // a downloaded chunk that is excluded is not recorded
        cm.chunk_downloaded(2).unwrap();
        assert_eq!(cm.chunks_downloaded(), 0);

        cm.include(2, 2);
        assert_eq!(cm.chunks_excluded(), 0);
        assert_eq!(cm.chunk(2).unwrap().priority(), Priority::Normal);
        assert!(cm.todo_chunks()[2]);
        assert_bytes_add_up(&cm);

        assert_eq!(
            drain(&mut rx),
            vec![
                Alert::ChunksExcluded { from: 2, to: 2 },
                Alert::UpdateStats,
                Alert::UpdateStats,
                Alert::ChunksIncluded { from: 2, to: 2 },
            ]
        );
    }

    #[test]
    fn should_treat_excluded_priority_as_exclusion() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, single(64, 16));

        // reversed bounds are swapped, the end is clamped
        cm.prioritise(9, 2, Priority::Excluded);
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 1, 1]);

        cm.prioritise(3, 3, Priority::OnlySeed);
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 1, 0]);
        assert_eq!(cm.only_seed_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 0, 1]);
        assert_eq!(cm.chunks_excluded(), 2);

        cm.prioritise(0, 3, Priority::First);
        assert_eq!(cm.chunks_excluded(), 0);
        assert_eq!(cm.todo_chunks().count_ones(), 4);
        assert_eq!(cm.chunk(2).unwrap().priority(), Priority::First);
    }

    #[test]
    fn should_drop_cached_pieces_of_excluded_chunks() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, single(40, 16));
        cm.create_files(false).unwrap();
        cm.start().unwrap();
        cm.write_chunk(0, &pattern(16)).unwrap();
        cm.chunk_downloaded(0).unwrap();
        assert_eq!(cm.cache.cached_bytes(), 16);
        assert_eq!(cm.torrent().files[0].downloaded_chunks, 1);

        cm.prioritise(0, 0, Priority::Excluded);
        assert_eq!(cm.cache.cached_bytes(), 0);
        assert_eq!(cm.torrent().files[0].downloaded_chunks, 0);
        assert_eq!(cm.chunks_downloaded(), 0);
        assert_bytes_add_up(&cm);
    }

    #[test]
    fn should_count_only_seed_chunks_as_left() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, single(64, 16));
        cm.chunk_downloaded(0).unwrap();
        cm.chunk_downloaded(1).unwrap();
        cm.prioritise(1, 2, Priority::OnlySeed);

        // the downloaded seed only chunk is kept
        assert_eq!(cm.chunks_downloaded(), 2);
        assert_eq!(cm.only_seed_count(), 2);
        assert_eq!(cm.bytes_excluded(), 16);
        assert_eq!(cm.bytes_left_to_download(), 16);
        assert_eq!(cm.chunks_left(), 2);
        assert_bytes_add_up(&cm);

        cm.chunk_downloaded(3).unwrap();
        assert!(cm.completed());
        assert!(!cm.have_all_chunks());
    }

    #[test]
    fn should_keep_border_chunks_of_wanted_neighbours() {
        let dir = TempDir::new().unwrap();
        // chunks: [f0 f0] [f0 f1] [f1 f1] [f1 f2] [f2 f2]
        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        assert!(cm.is_border_chunk(1));
        assert!(cm.is_border_chunk(3));
        assert!(!cm.is_border_chunk(2));

        cm.create_files(false).unwrap();
        cm.start().unwrap();
        let data = pattern(80);
        for chunk in 0..5 {
            let range = chunk as usize * 16..(chunk as usize + 1) * 16;
            cm.write_chunk(chunk, &data[range]).unwrap();
            cm.chunk_downloaded(chunk).unwrap();
        }

        cm.set_do_not_download(1, true).unwrap();
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 1, 0, 0]);
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 1, 1, 0, 1, 1]);
        assert!(cm.torrent().files[1].do_not_download());
        assert!(!cm.output_path().join("file1").exists());
        assert_bytes_add_up(&cm);

        // the border chunks still read the bytes of the excluded file
        let mut buf = vec![0; 16];
        cm.read_piece(1, 0, &mut buf).unwrap();
        assert_eq!(buf, &data[16..32]);
        cm.read_piece(3, 0, &mut buf).unwrap();
        assert_eq!(buf, &data[48..64]);

        cm.set_do_not_download(1, false).unwrap();
        assert_eq!(cm.chunks_excluded(), 0);
        assert!(cm.todo_chunks()[2]);
        let file1 = fs::read(cm.output_path().join("file1")).unwrap();
        assert_eq!(file1.len(), 40);
        assert_eq!(&file1[..12], &data[20..32]);
        assert_eq!(&file1[28..], &data[48..60]);
        cm.read_piece(1, 0, &mut buf).unwrap();
        assert_eq!(buf, &data[16..32]);
    }

    /// Excluding both neighbours of a border chunk excludes the border chunk
    /// as well.
    #[test]
    fn should_exclude_border_chunk_of_excluded_neighbours() {
        let dir = TempDir::new().unwrap();
        let (mut cm, mut rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.create_files(false).unwrap();

        cm.set_do_not_download(0, true).unwrap();
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 1, 0, 0, 0, 0]);
        cm.set_do_not_download(1, true).unwrap();
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 1, 1, 1, 0, 0]);
        assert_eq!(cm.chunk(3).unwrap().priority(), Priority::Normal);
        assert_bytes_add_up(&cm);

        let alerts = drain(&mut rx);
        assert!(alerts.contains(&Alert::ChunksExcluded { from: 1, to: 2 }));
    }

    /// An empty file between two files does not make the chunk it sits on
    /// a border chunk.
    #[test]
    fn should_exclude_chunk_next_to_empty_file() {
        let dir = TempDir::new().unwrap();
        // chunks: [f0] [f2] [f2], f1 is empty at offset 16
        let (mut cm, _rx) = manager(&dir, multi(16, &[16, 0, 32]));
        assert!(!cm.is_border_chunk(1));
        cm.create_files(false).unwrap();

        // excluding the empty file leaves every chunk wanted
        cm.set_do_not_download(1, true).unwrap();
        assert_eq!(cm.chunks_excluded(), 0);
        assert_eq!(cm.todo_chunks().as_bitslice(), bits![u8, Msb0; 1, 1, 1]);

        cm.set_do_not_download(2, true).unwrap();
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 0, 1, 1]);
        assert_eq!(cm.todo_chunks().as_bitslice(), bits![u8, Msb0; 1, 0, 0]);
        assert_bytes_add_up(&cm);

        cm.set_file_priority(1, Priority::First).unwrap();
        assert_eq!(cm.chunk(1).unwrap().priority(), Priority::Excluded);
    }

    #[test]
    fn should_give_border_chunk_most_eager_priority() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.create_files(false).unwrap();

        cm.set_file_priority(2, Priority::OnlySeed).unwrap();
        assert_eq!(cm.chunk(3).unwrap().priority(), Priority::Normal);
        assert_eq!(cm.only_seed_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 0, 0, 1]);

        cm.set_file_priority(1, Priority::First).unwrap();
        assert_eq!(cm.chunk(1).unwrap().priority(), Priority::First);
        assert_eq!(cm.chunk(2).unwrap().priority(), Priority::First);
        assert_eq!(cm.chunk(3).unwrap().priority(), Priority::First);

        cm.set_file_priority(1, Priority::Last).unwrap();
        assert_eq!(cm.chunk(1).unwrap().priority(), Priority::Normal);
        assert_eq!(cm.chunk(2).unwrap().priority(), Priority::Last);
        assert_eq!(cm.chunk(3).unwrap().priority(), Priority::Last);
    }

    #[test]
    fn should_reload_file_priorities() {
        let dir = TempDir::new().unwrap();
        {
            let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
            cm.create_files(false).unwrap();
            cm.set_file_priority(2, Priority::OnlySeed).unwrap();
            cm.set_do_not_download(1, true).unwrap();
            assert_eq!(cm.only_seed_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 0, 1, 1]);
            cm.save_index_file().unwrap();
        }

        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.load_index_file().unwrap();
        cm.start().unwrap();
        assert_eq!(cm.torrent().files[1].priority(), Priority::Excluded);
        assert_eq!(cm.torrent().files[2].priority(), Priority::OnlySeed);
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 1, 0, 0]);
        assert_eq!(cm.only_seed_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 0, 1, 1]);
        assert_eq!(cm.chunks_excluded(), 3);
    }

    #[test]
    fn should_fall_back_to_file_info_record() {
        let dir = TempDir::new().unwrap();
        {
            let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
            cm.create_files(false).unwrap();
            cm.set_do_not_download(2, true).unwrap();
            fs::remove_file(cm.tmpdir().join("file_priority")).unwrap();
        }

        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.load_index_file().unwrap();
        assert!(cm.torrent().files[2].do_not_download());
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 0, 0, 1]);
    }

    #[test]
    fn should_reset_corrupt_chunks_on_data_check() {
        let dir = TempDir::new().unwrap();
        let (mut cm, mut rx) = manager(&dir, single(40, 16));
        cm.chunk_downloaded(0).unwrap();
        cm.chunk_downloaded(1).unwrap();
        drain(&mut rx);

        let ok = bitvec![u8, Msb0; 1, 0, 1];
        cm.data_checked(&ok, 0, 2).unwrap();
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 1, 0, 1]);
        assert_eq!(cm.corrupted_chunks(), 1);
        assert_eq!(
            drain(&mut rx),
            vec![Alert::ChunkCorrupted(1), Alert::UpdateStats]
        );
        drop(cm);

        // the check rewrote the index
        let (mut cm, _rx) = manager(&dir, single(40, 16));
        cm.load_index_file().unwrap();
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 1, 0, 1]);
    }

    #[test]
    fn should_verify_chunk_hashes() {
        let dir = TempDir::new().unwrap();
        let data = pattern(32);
        let hashes = data
            .chunks(16)
            .map(|c| {
                let mut hash = [0; 20];
                hash.copy_from_slice(&Sha1::digest(c));
                hash
            })
            .collect();
        let torrent = StorageInfo::new_single("hashed.bin", 32, 16, hashes).unwrap();
        let (mut cm, _rx) = manager(&dir, torrent);
        cm.create_files(false).unwrap();
        cm.start().unwrap();

        cm.write_chunk(0, &data[..16]).unwrap();
        assert!(cm.check_hash(0).unwrap());
        cm.write_chunk(1, &[0xff; 16]).unwrap();
        assert!(!cm.check_hash(1).unwrap());
    }

    #[test]
    fn should_boost_preview_chunks_of_multimedia_files() {
        let dir = TempDir::new().unwrap();
        let files = vec![
            FileInfo {
                path: PathBuf::from("video.mkv"),
                len: 100,
                torrent_offset: 0,
            },
            FileInfo {
                path: PathBuf::from("notes.txt"),
                len: 10,
                torrent_offset: 100,
            },
        ];
        let torrent = StorageInfo::new_multi("movie", 16, files, Vec::new()).unwrap();
        let conf = DiskConf {
            preview_size_video: 32,
            ..conf()
        };
        let cm = ChunkManager::new(
            torrent,
            dir.path().join("tmp"),
            dir.path().join("data"),
            None,
            conf,
            None,
        )
        .unwrap();

        assert_eq!(cm.preview_chunk_range_size(0), 2);
        assert_eq!(cm.preview_chunk_range_size(1), 0);
        let priorities: Vec<_> = (0..7).map(|i| cm.chunk(i).unwrap().priority()).collect();
        assert_eq!(
            priorities,
            vec![
                Priority::NormalPreview,
                Priority::NormalPreview,
                Priority::Normal,
                Priority::Normal,
                Priority::Normal,
                Priority::NormalPreview,
                Priority::NormalPreview,
            ]
        );
    }

    #[test]
    fn should_recreate_missing_files() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.create_files(false).unwrap();
        for chunk in 0..5 {
            cm.chunk_downloaded(chunk).unwrap();
        }
        let file1 = cm.output_path().join("file1");
        fs::remove_file(&file1).unwrap();

        assert_eq!(cm.has_missing_files(), vec![file1.clone()]);
        cm.recreate_missing_files().unwrap();
        assert!(file1.exists());
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 1, 0, 0, 0, 1]);
        assert!(cm.has_missing_files().is_empty());
    }

    #[test]
    fn should_exclude_missing_files() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.create_files(false).unwrap();
        for chunk in 0..5 {
            cm.chunk_downloaded(chunk).unwrap();
        }
        fs::remove_file(cm.output_path().join("file2")).unwrap();

        assert_eq!(cm.has_missing_files().len(), 1);
        cm.dnd_missing_files().unwrap();
        assert!(cm.torrent().files[2].do_not_download());
        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 0, 0, 1]);
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 1, 1, 1, 0, 0]);
        assert!(cm.todo_chunks()[3]);
    }

    #[test]
    fn should_import_preexisting_single_file() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("single.bin"), pattern(40)).unwrap();

        let (mut cm, _rx) = manager(&dir, single(40, 16));
        cm.create_files(false).unwrap();
        assert!(cm.has_existing_files());
        cm.mark_existing_files_as_downloaded().unwrap();
        assert!(cm.have_all_chunks());
        assert!(cm.completed());
        assert_eq!(cm.bytes_left(), 0);
    }

    /// A chunk shared with a file that was not on disk is not imported.
    #[test]
    fn should_import_only_fully_preexisting_chunks() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("data").join("multi");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("file1"), pattern(40)).unwrap();

        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.create_files(false).unwrap();
        cm.mark_existing_files_as_downloaded().unwrap();
        assert_eq!(cm.downloaded_chunks().as_bitslice(), bits![u8, Msb0; 0, 0, 1, 0, 0]);
    }

    #[test]
    fn should_apply_loaded_priorities_on_create() {
        let dir = TempDir::new().unwrap();
        let (mut cm, _rx) = manager(&dir, multi(16, &[20, 40, 20]));
        cm.torrent.files[0].set_priority(Priority::Excluded);
        cm.create_files(true).unwrap();

        assert_eq!(cm.excluded_chunks().as_bitslice(), bits![u8, Msb0; 1, 0, 0, 0, 0]);
        assert!(!cm.output_path().join("file0").exists());
        // the priority record was written once loading was over
        assert!(cm.tmpdir().join("file_priority").exists());
    }
}
