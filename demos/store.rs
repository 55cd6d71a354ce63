//! Stores a small two file torrent, excludes one of its files and prints
//! the bookkeeping along the way.
//!
//! Pass a directory to keep the result, otherwise a temporary one is used.
use std::path::PathBuf;

use anyhow::Context;
use bt_diskio::{
    alert::Alert,
    conf::DiskConf,
    disk::ChunkManager,
    storage_info::{FileInfo, StorageInfo},
};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

const CHUNK_LEN: u32 = 64 * 1024;

fn main() -> anyhow::Result<()> {
    let tmp = tempfile::TempDir::new()?;
    let root = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| tmp.path().to_path_buf());

    let lens = [300 * 1024, 1000];
    let mut data = vec![0u8; lens.iter().sum::<u64>() as usize];
    rand::thread_rng().fill_bytes(&mut data);
    let hashes = data
        .chunks(CHUNK_LEN as usize)
        .map(|c| {
            let mut hash = [0; 20];
            hash.copy_from_slice(&Sha1::digest(c));
            hash
        })
        .collect();
    let files = vec![
        FileInfo {
            path: PathBuf::from("album").join("01.flac"),
            len: lens[0],
            torrent_offset: 0,
        },
        FileInfo {
            path: PathBuf::from("notes.txt"),
            len: lens[1],
            torrent_offset: lens[0],
        },
    ];
    let torrent = StorageInfo::new_multi("demo", CHUNK_LEN, files, hashes)?;

    let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
    let mut cm = ChunkManager::new(
        torrent,
        root.join("tmp"),
        root.join("data"),
        None,
        DiskConf::default(),
        Some(alert_tx),
    )?;
    cm.load_index_file()?;
    cm.create_files(true)?;
    cm.start()?;

    if let Some(prealloc) = cm.preallocate()? {
        prealloc.join();
    }

    for (i, chunk) in data.chunks(CHUNK_LEN as usize).enumerate() {
        let index = i as u32;
        cm.write_chunk(index, chunk)
            .with_context(|| format!("cannot write chunk {}", index))?;
        if cm.check_hash(index)? {
            cm.chunk_downloaded(index)?;
        }
    }
    println!(
        "downloaded {}/{} chunks, {} bytes on disk",
        cm.chunks_downloaded(),
        cm.chunk_count(),
        cm.disk_usage()?
    );

    cm.set_do_not_download(1, true)?;
    println!(
        "after excluding notes.txt: {} chunks excluded, {} bytes left to download",
        cm.chunks_excluded(),
        cm.bytes_left_to_download()
    );
    for f in &cm.torrent().files {
        println!(
            "{:?}: {} ({:.0}%)",
            f.user_path,
            f.priority(),
            f.download_percentage()
        );
    }

    cm.stop();
    while let Ok(alert) = alert_rx.try_recv() {
        match alert {
            Alert::UpdateStats => {}
            alert => println!("alert: {:?}", alert),
        }
    }
    Ok(())
}
