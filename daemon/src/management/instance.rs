use std::path::{Path, PathBuf};

use anyhow::Context;
use dsfleet_protocol::management::instance::{InstanceId, Intent};

use crate::config::HostConfig;
use crate::error::FleetError;
use crate::storage::files::{read_text, write_text};

const INSTANCE_DIR: &str = "Instance";
const LOGS_DIR: &str = "Logs";
const PLUGINS_DIR: &str = "Plugins";
const WORLD_JSON: &str = "world.json";
const START_SCRIPT: &str = "start";
const START_LOG: &str = "start.log";
const INTENT_FILE: &str = "intent";
const ZIP_PATH_FILE: &str = "zip_path";
const SUFFIX_FILE: &str = "server_name_suffix";
const READY_FILE: &str = "ready";
const RECREATE_FILE: &str = "recreate";
const CANARY_FILE: &str = "canary";
const PRIORITY_FILE: &str = "priority";
const PHASE_FILE: &str = "phase";
const CHECKSUM_FILE: &str = "checksum.txt";
const CONTENT_LINK: &str = "content";

/// One numbered instance. All paths and ports are pure functions of the id.
#[derive(Clone, Copy)]
pub struct Instance<'a> {
    id: InstanceId,
    config: &'a HostConfig,
}

impl<'a> Instance<'a> {
    pub fn new(id: InstanceId, config: &'a HostConfig) -> Self {
        Self { id, config }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.config.network.base_port + self.id.get() as u16
    }

    pub fn admin_port(&self) -> u16 {
        self.config.network.admin_base_port + self.id.get() as u16
    }

    pub fn server_dir(&self) -> PathBuf {
        let layout = &self.config.layout;
        self.config
            .root
            .join(format!("{}{}", layout.server_dir_prefix, self.id.padded()))
    }

    /// Runtime prefix (the Wine prefix) owned by this instance.
    pub fn prefix_dir(&self) -> PathBuf {
        let layout = &self.config.layout;
        self.config
            .root
            .join(format!("{}{}", layout.prefix_dir_prefix, self.id.padded()))
    }

    pub fn instance_dir(&self) -> PathBuf {
        self.server_dir().join(INSTANCE_DIR)
    }

    pub fn world_dir(&self) -> PathBuf {
        self.instance_dir().join("Saves").join("World")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.server_dir().join(LOGS_DIR)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.server_dir().join(PLUGINS_DIR)
    }

    pub fn world_json_path(&self) -> PathBuf {
        self.server_dir().join(WORLD_JSON)
    }

    pub fn start_script_path(&self) -> PathBuf {
        self.server_dir().join(START_SCRIPT)
    }

    pub fn start_log_path(&self) -> PathBuf {
        self.server_dir().join(START_LOG)
    }

    pub fn ready_path(&self) -> PathBuf {
        self.server_dir().join(READY_FILE)
    }

    pub fn recreate_marker_path(&self) -> PathBuf {
        self.server_dir().join(RECREATE_FILE)
    }

    pub fn canary_path(&self) -> PathBuf {
        self.instance_dir().join(CANARY_FILE)
    }

    pub fn checksum_path(&self) -> PathBuf {
        self.world_dir().join(CHECKSUM_FILE)
    }

    pub fn content_link_path(&self) -> PathBuf {
        self.instance_dir().join(CONTENT_LINK)
    }

    pub fn content_cache_dir(&self) -> PathBuf {
        self.config
            .resolve(&self.config.layout.content_cache_dir)
            .join(format!("ds{}", self.id.padded()))
            .join("content")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.config
            .resolve(&self.config.layout.archive_dir)
            .join(format!("ds{}", self.id.padded()))
    }

    pub fn template_server_dir(&self) -> PathBuf {
        let layout = &self.config.layout;
        self.config
            .root
            .join(format!("{}{:02}", layout.server_dir_prefix, layout.template_number))
    }

    pub fn template_prefix_dir(&self) -> PathBuf {
        let layout = &self.config.layout;
        self.config
            .root
            .join(format!("{}{:02}", layout.prefix_dir_prefix, layout.template_number))
    }

    pub fn exists(&self) -> bool {
        self.server_dir().is_dir()
    }

    pub fn intent(&self) -> Option<Intent> {
        read_text(&self.server_dir().join(INTENT_FILE)).and_then(|s| Intent::parse(&s))
    }

    pub fn write_intent(&self, intent: Intent) -> anyhow::Result<()> {
        let path = self.server_dir().join(INTENT_FILE);
        write_text(&path, intent.as_str())
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Source archive recorded at creation, empty when unknown.
    pub fn zip_path(&self) -> String {
        read_text(&self.server_dir().join(ZIP_PATH_FILE)).unwrap_or_default()
    }

    pub fn write_zip_path(&self, zip_path: &Path) -> anyhow::Result<()> {
        write_text(
            &self.server_dir().join(ZIP_PATH_FILE),
            &zip_path.to_string_lossy(),
        )
        .context("failed to persist zip_path")
    }

    pub fn name_suffix(&self) -> String {
        read_text(&self.server_dir().join(SUFFIX_FILE)).unwrap_or_default()
    }

    pub fn write_name_suffix(&self, suffix: &str) -> anyhow::Result<()> {
        write_text(&self.server_dir().join(SUFFIX_FILE), suffix)
            .context("failed to persist server_name_suffix")
    }

    pub fn priority(&self) -> Option<String> {
        read_text(&self.instance_dir().join(PRIORITY_FILE)).filter(|p| !p.is_empty())
    }

    /// Diagnostic phase written by the hosting plugin. Read only.
    pub fn phase(&self) -> String {
        read_text(&self.instance_dir().join(PHASE_FILE)).unwrap_or_default()
    }

    pub fn world_checksum(&self) -> Option<String> {
        read_text(&self.checksum_path()).filter(|c| !c.is_empty())
    }

    pub fn recreate_requested(&self) -> bool {
        self.recreate_marker_path().exists()
    }

    /// Points `Instance/content` at this instance's shared content cache.
    pub fn link_content_cache(&self) -> anyhow::Result<()> {
        let cache = self.content_cache_dir();
        std::fs::create_dir_all(&cache)
            .with_context(|| format!("failed to create {}", cache.display()))?;
        if !self.instance_dir().is_dir() {
            return Err(FleetError::validation(format!(
                "Missing Instance folder: {}",
                self.instance_dir().display()
            ))
            .into());
        }
        let link = self.content_link_path();
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)
                .with_context(|| format!("failed to replace {}", link.display()))?;
        }
        std::os::unix::fs::symlink(&cache, &link)
            .with_context(|| format!("failed to link {}", link.display()))
    }
}
