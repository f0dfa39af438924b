use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::error::FleetError;

/// Reads a small persisted text file, trimmed. Missing or unreadable files read as `None`.
pub fn read_text(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Writes `content` next to `path` and renames it into place, so readers
/// never observe a half-written file.
pub fn write_text(path: &Path, content: &str) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

pub fn sha1_hex(path: &Path) -> io::Result<String> {
    let mut hasher = Sha1::new();
    let mut file = fs::File::open(path)?;
    let mut buffer = [0; 32768];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reads at most the last `max_bytes` of a text file.
pub fn read_tail(path: &Path, max_bytes: u64) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len > max_bytes {
        file.seek(SeekFrom::Start(len - max_bytes))?;
    }
    let mut buf = Vec::with_capacity(len.min(max_bytes) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Copies a tree, overwriting files that already exist in `dst`. Symlinks are recreated.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves a directory. Falls back to copy and delete across filesystems.
pub fn move_dir(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                "{} and {} are on different filesystems, copying",
                src.display(),
                dst.display()
            );
            copy_tree(src, dst)?;
            fs::remove_dir_all(src)
        }
        Err(err) => Err(err),
    }
}

/// Removes a directory tree, retrying once after `delay` when removal races an open handle.
pub fn remove_dir_with_retry(path: &Path, delay: Duration) -> Result<(), FleetError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            warn!(
                "failed to remove {} ({}), retrying in {:?}",
                path.display(),
                err,
                delay
            );
            std::thread::sleep(delay);
            match fs::remove_dir_all(path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(FleetError::TransientIo {
                    path: path.to_path_buf(),
                    source,
                }),
            }
        }
    }
}

/// First of `base`, `base-1`, `base-2`, ... that does not exist yet.
pub fn unused_path(base: PathBuf) -> PathBuf {
    if base.symlink_metadata().is_err() {
        return base;
    }
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    (1..)
        .map(|n| base.with_file_name(format!("{}-{}", name, n)))
        .find(|p| p.symlink_metadata().is_err())
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_text_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intent");
        write_text(&path, "SERVING").unwrap();
        write_text(&path, "STOPPED").unwrap();
        assert_eq!(read_text(&path).as_deref(), Some("STOPPED"));
        assert!(!dir.path().join(".intent.tmp").exists());
    }

    #[test]
    fn read_text_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_text(&dir.path().join("nope")), None);
    }

    #[test]
    fn sha1_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha1_hex(&path).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "first line\nsecond line\n").unwrap();
        assert_eq!(read_tail(&path, 12).unwrap(), "second line\n");
        assert_eq!(read_tail(&path, 1024).unwrap(), "first line\nsecond line\n");
    }

    #[test]
    fn copy_tree_overwrites_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub").join("f.txt"), "new").unwrap();
        std::os::unix::fs::symlink("sub/f.txt", src.join("link")).unwrap();
        fs::create_dir_all(dst.join("sub")).unwrap();
        fs::write(dst.join("sub").join("f.txt"), "old").unwrap();
        fs::write(dst.join("keep"), "kept").unwrap();

        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("sub/f.txt")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dst.join("keep")).unwrap(), "kept");
        assert_eq!(fs::read_link(dst.join("link")).unwrap(), PathBuf::from("sub/f.txt"));
    }

    #[test]
    fn remove_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_dir_with_retry(&dir.path().join("gone"), Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn unused_path_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("20260101-000000_cmdline_partial");
        assert_eq!(unused_path(base.clone()), base);
        fs::create_dir(&base).unwrap();
        assert_eq!(
            unused_path(base.clone()),
            dir.path().join("20260101-000000_cmdline_partial-1")
        );
    }
}
