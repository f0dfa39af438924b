use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::debug;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use dsfleet_protocol::management::instance::InstanceId;

/// Exclusive advisory lock serialising mutations of one instance across processes.
/// The kernel drops it when the holder dies.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path_for(lock_dir: &Path, id: InstanceId) -> PathBuf {
        lock_dir.join(format!("server-{}.lock", id))
    }

    fn open(lock_dir: &Path, id: InstanceId) -> anyhow::Result<(File, PathBuf)> {
        std::fs::create_dir_all(lock_dir)
            .with_context(|| format!("failed to create {}", lock_dir.display()))?;
        let path = Self::path_for(lock_dir, id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock {}", path.display()))?;
        Ok((file, path))
    }

    /// Blocks until the lock is held.
    pub fn acquire(lock_dir: &Path, id: InstanceId) -> anyhow::Result<Self> {
        let (file, path) = Self::open(lock_dir, id)?;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to lock {}", path.display()))
                }
            }
        }
        debug!("acquired {}", path.display());
        Ok(Self { file, path })
    }

    /// `None` when another holder has it.
    pub fn try_acquire(lock_dir: &Path, id: InstanceId) -> anyhow::Result<Option<Self>> {
        let (file, path) = Self::open(lock_dir, id)?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to lock {}", path.display())),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        debug!("released {}", self.path.display());
    }
}
