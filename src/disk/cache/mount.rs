//! Detection of the filesystem a path lives on, used to notice removable or
//! network storage that went away.
use std::path::{Path, PathBuf};

/// Returns the mount point of the filesystem holding the path. The path
/// itself does not need to exist, its nearest existing ancestor is used.
#[cfg(unix)]
pub fn mount_point(path: &Path) -> Option<PathBuf> {
    use std::{fs, os::unix::fs::MetadataExt};

    let existing = path.ancestors().find(|p| p.exists())?;
    let mut current = fs::canonicalize(existing).ok()?;
    let dev = fs::metadata(&current).ok()?.dev();
    loop {
        let parent = match current.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Some(current),
        };
        match fs::metadata(&parent) {
            Ok(meta) if meta.dev() == dev => current = parent,
            _ => return Some(current),
        }
    }
}

#[cfg(not(unix))]
pub fn mount_point(path: &Path) -> Option<PathBuf> {
    let existing = path.ancestors().find(|p| p.exists())?;
    std::fs::canonicalize(existing)
        .ok()?
        .ancestors()
        .last()
        .map(Path::to_path_buf)
}

/// Whether a filesystem is still mounted at the path. An unmounted mount
/// point is either gone or just a directory on its parent's filesystem.
#[cfg(unix)]
pub fn is_mounted(mount_point: &Path) -> bool {
    use std::{fs, os::unix::fs::MetadataExt};

    let meta = match fs::metadata(mount_point) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    match mount_point.parent() {
        None => true,
        Some(parent) => fs::metadata(parent)
            .map(|p| p.dev() != meta.dev())
            .unwrap_or(true),
    }
}

#[cfg(not(unix))]
pub fn is_mounted(mount_point: &Path) -> bool {
    mount_point.exists()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn should_find_mount_point_of_missing_path() {
        let dir = TempDir::new().unwrap();
        let mp = mount_point(&dir.path().join("not/yet/created")).unwrap();
        assert!(is_mounted(&mp));
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert!(canonical.starts_with(&mp));
    }

    /// A plain directory is not a mount point.
    #[cfg(unix)]
    #[test]
    fn should_not_treat_plain_directory_as_mounted() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        assert!(!is_mounted(&sub));
        assert!(!is_mounted(&dir.path().join("gone")));
    }
}
