use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info};

use crate::config::HostConfig;
use crate::error::FleetError;
use crate::storage::files::read_text;

const CHECKSUM_FILE: &str = "checksum.txt";
const ENTRY_EXTENSION: &str = "sbsB5";

/// Content-addressed store of compiled world files, keyed by world checksum.
/// Entries are immutable once written and never evicted.
pub struct BinaryArtifactCache {
    dir: PathBuf,
    artifact_file: String,
}

impl BinaryArtifactCache {
    pub fn new(dir: PathBuf, artifact_file: impl Into<String>) -> Self {
        Self {
            dir,
            artifact_file: artifact_file.into(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            config.resolve(&config.layout.binary_cache_dir),
            config.provision.artifact_file.clone(),
        )
    }

    fn entry_path(&self, checksum: &str) -> Option<PathBuf> {
        let valid = !checksum.is_empty() && checksum.chars().all(|c| c.is_ascii_hexdigit());
        valid.then(|| self.dir.join(format!("{}.{}", checksum, ENTRY_EXTENSION)))
    }

    pub fn get(&self, checksum: &str) -> Option<PathBuf> {
        self.entry_path(checksum).filter(|path| path.is_file())
    }

    pub fn read(&self, checksum: &str) -> Option<Vec<u8>> {
        fs::read(self.get(checksum)?).ok()
    }

    /// Stores a copy of `source`. Returns `false` when the entry already existed.
    pub fn put(&self, checksum: &str, source: &Path) -> anyhow::Result<bool> {
        let target = self.entry_path(checksum).ok_or_else(|| {
            FleetError::validation(format!("Invalid world checksum: {:?}", checksum))
        })?;
        if target.exists() {
            return Ok(false);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", checksum, std::process::id()));
        fs::copy(source, &tmp)
            .with_context(|| format!("failed to copy {} into cache", source.display()))?;
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("failed to commit {}", target.display()));
        }
        debug!("cached {} as {}", source.display(), target.display());
        Ok(true)
    }

    /// Caches the world's compiled file under its recorded checksum.
    pub fn store_from(&self, world_dir: &Path) -> anyhow::Result<bool> {
        let Some(checksum) = read_text(&world_dir.join(CHECKSUM_FILE)) else {
            return Ok(false);
        };
        let artifact = world_dir.join(&self.artifact_file);
        if !artifact.is_file() {
            return Ok(false);
        }
        self.put(&checksum, &artifact)
    }

    /// Copies a cached compiled file into the world. An existing local file is kept.
    pub fn restore_into(&self, world_dir: &Path) -> anyhow::Result<bool> {
        let artifact = world_dir.join(&self.artifact_file);
        if artifact.exists() {
            return Ok(false);
        }
        let Some(checksum) = read_text(&world_dir.join(CHECKSUM_FILE)) else {
            return Ok(false);
        };
        let Some(cached) = self.get(&checksum) else {
            return Ok(false);
        };
        fs::copy(&cached, &artifact)
            .with_context(|| format!("failed to restore {}", artifact.display()))?;
        info!("restored compiled world {} from cache", checksum);
        Ok(true)
    }
}
