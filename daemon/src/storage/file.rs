use std::path::Path;

use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};

pub trait FileIoWithBackup {
    /// Replaces `path` with `content`, keeping the previous version as `<name>.bak`.
    fn write_with_backup<P: AsRef<Path>>(path: P, content: &str) -> Result<(), std::io::Error> {
        let path = path.as_ref();
        if path.is_file() {
            std::fs::copy(path, path.with_extension("bak"))?;
        }
        super::files::write_text(path, content)
    }
}

/// JSON-backed settings file.
pub trait Config: FileIoWithBackup {
    type ConfigType: Serialize + for<'de> Deserialize<'de>;

    fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Self::ConfigType> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("malformed {}", path.display()))
    }

    fn save_config<P: AsRef<Path>>(path: P, config: &Self::ConfigType) -> anyhow::Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(config)?;
        Self::write_with_backup(path, &content)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Loads `path`, or writes `default()` there when it is not a file yet.
    fn load_config_or_default<P: AsRef<Path>, F: FnOnce() -> Self::ConfigType>(
        path: P,
        default: F,
    ) -> anyhow::Result<Self::ConfigType> {
        let path = path.as_ref();
        if path.is_file() {
            return Self::load_config(path);
        }
        let config = default();
        Self::save_config(path, &config)?;
        info!("wrote default config to {}", path.display());
        Ok(config)
    }
}
