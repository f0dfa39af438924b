use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use log::debug;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::config::{HostConfig, ProvisionConfig};
use crate::error::FleetError;
use crate::provision::prefix;

/// Filesystem steps of instance creation that depend on host layout.
pub trait Provisioner: Send + Sync {
    /// Replaces `target` with a clone of `template`.
    fn clone_tree(&self, template: &Path, target: &Path) -> anyhow::Result<()>;

    /// Makes a cloned runtime prefix unique and points it at `server_dir`.
    fn regenerate_identifiers(&self, prefix: &Path, server_dir: &Path) -> anyhow::Result<()>;

    /// Extracts `archive` into `target`, dropping a leading directory shared by every entry.
    fn unzip(&self, target: &Path, archive: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneAction {
    Skip,
    HardLink,
    Copy,
}

/// Which template files are shared by hard link, copied, or left out.
#[derive(Debug, Clone, Default)]
pub struct ClonePolicy {
    link: HashSet<String>,
    skip: HashSet<String>,
}

impl ClonePolicy {
    pub fn from_config(config: &ProvisionConfig) -> Self {
        let lower = |exts: &[String]| exts.iter().map(|e| e.to_lowercase()).collect();
        Self {
            link: lower(&config.link_extensions),
            skip: lower(&config.skip_extensions),
        }
    }

    pub fn classify(&self, path: &Path) -> CloneAction {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if self.skip.contains(&ext) {
            CloneAction::Skip
        } else if self.link.contains(&ext) {
            CloneAction::HardLink
        } else {
            CloneAction::Copy
        }
    }
}

pub struct FsProvisioner {
    policy: ClonePolicy,
    user_name: String,
}

impl FsProvisioner {
    pub fn new(policy: ClonePolicy, user_name: impl Into<String>) -> Self {
        Self {
            policy,
            user_name: user_name.into(),
        }
    }

    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(
            ClonePolicy::from_config(&config.provision),
            config.user_name.clone(),
        )
    }
}

impl Provisioner for FsProvisioner {
    fn clone_tree(&self, template: &Path, target: &Path) -> anyhow::Result<()> {
        if target.is_dir() {
            fs::remove_dir_all(target)
                .with_context(|| format!("failed to remove {}", target.display()))?;
        }
        for entry in WalkDir::new(template).follow_links(false) {
            let entry = entry?;
            let relative = entry.path().strip_prefix(template)?;
            let dst = target.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&dst)
                    .with_context(|| format!("failed to create {}", dst.display()))?;
                continue;
            }
            let action = if file_type.is_symlink() && entry.path().is_dir() {
                CloneAction::Copy
            } else {
                self.policy.classify(entry.path())
            };
            if action == CloneAction::Skip {
                continue;
            }
            if file_type.is_symlink() {
                let link_target = fs::read_link(entry.path())?;
                std::os::unix::fs::symlink(&link_target, &dst)
                    .with_context(|| format!("failed to link {}", dst.display()))?;
                continue;
            }
            match action {
                CloneAction::HardLink => fs::hard_link(entry.path(), &dst)
                    .with_context(|| format!("failed to hard link {}", dst.display()))?,
                _ => {
                    fs::copy(entry.path(), &dst)
                        .with_context(|| format!("failed to copy {}", dst.display()))?;
                }
            }
        }
        debug!("cloned {} into {}", template.display(), target.display());
        Ok(())
    }

    fn regenerate_identifiers(&self, prefix_dir: &Path, server_dir: &Path) -> anyhow::Result<()> {
        prefix::regenerate_registry(prefix_dir)?;
        prefix::relink_my_folders(prefix_dir, &self.user_name, server_dir)?;
        prefix::change_wine_server_id(prefix_dir)
    }

    fn unzip(&self, target: &Path, archive: &Path) -> anyhow::Result<()> {
        let file = fs::File::open(archive)
            .with_context(|| format!("failed to open {}", archive.display()))?;
        let mut zip = ZipArchive::new(file).map_err(FleetError::from)?;

        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let entry = zip.by_index(i).map_err(FleetError::from)?;
            let path = entry.enclosed_name().ok_or_else(|| {
                FleetError::validation(format!(
                    "Unsafe path {:?} in archive {}",
                    entry.name(),
                    archive.display()
                ))
            })?;
            entries.push((path, entry.is_dir()));
        }
        let strip = common_dir(&entries);

        for (i, (path, is_dir)) in entries.iter().enumerate() {
            let relative = path.strip_prefix(&strip).unwrap_or(path);
            if relative.as_os_str().is_empty() {
                continue;
            }
            let dst = target.join(relative);
            if *is_dir {
                fs::create_dir_all(&dst)?;
                continue;
            }
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut entry = zip.by_index(i).map_err(FleetError::from)?;
            let mut out = fs::File::create(&dst)
                .with_context(|| format!("failed to create {}", dst.display()))?;
            io::copy(&mut entry, &mut out)
                .with_context(|| format!("failed to extract {}", dst.display()))?;
        }
        debug!(
            "extracted {} entries of {} into {}",
            entries.len(),
            archive.display(),
            target.display()
        );
        Ok(())
    }
}

/// Longest directory shared by all entries. A directory entry counts as its own path.
fn common_dir(entries: &[(PathBuf, bool)]) -> PathBuf {
    let dirs = entries.iter().map(|(path, is_dir)| {
        let dir = if *is_dir {
            path.as_path()
        } else {
            path.parent().unwrap_or(Path::new(""))
        };
        dir.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect::<Vec<_>>()
    });
    let mut common: Option<Vec<Component>> = None;
    for dir in dirs {
        common = Some(match common {
            None => dir,
            Some(prev) => prev
                .into_iter()
                .zip(dir)
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect(),
        });
    }
    common.unwrap_or_default().iter().collect()
}
