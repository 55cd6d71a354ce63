//! Small bookkeeping records kept next to a torrent's data: the path map of
//! the caches and the priority records of the chunk manager.
//!
//! Records are bencoded and always rewritten in full, through a temporary
//! file that is renamed over the old one, so a crash leaves either the old
//! or the new record behind.
use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::disk::{Result, StorageError};

/// Encodes and atomically replaces the record at the path.
pub(crate) fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let buf = serde_bencode::to_bytes(record).map_err(|e| StorageError::Persist {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let tmp = path.with_extension("tmp");
    let write = || -> io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        log::warn!("Cannot save {:?}: {}", path, e);
        StorageError::io(path, e)
    })
}

/// Reads the record at the path. A missing record is `None`, and so is one
/// that cannot be decoded, e.g. because a crash truncated it.
pub(crate) fn read_record<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("Cannot read {:?}: {}", path, e);
            return None;
        }
    };
    match serde_bencode::from_bytes(&buf) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("Ignoring unreadable record {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_derive::{Deserialize, Serialize};
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
    }

    #[test]
    fn should_tolerate_missing_and_truncated_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("record");
        assert_eq!(read_record::<Sample>(&path), None);

        let sample = Sample {
            name: "x".into(),
            values: vec![1, 2, 3],
        };
        write_record(&path, &sample).unwrap();
        assert_eq!(read_record::<Sample>(&path), Some(sample));
        assert!(!path.with_extension("tmp").exists());

        let buf = fs::read(&path).unwrap();
        fs::write(&path, &buf[..buf.len() / 2]).unwrap();
        assert_eq!(read_record::<Sample>(&path), None);
    }
}
