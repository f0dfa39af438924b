use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, error, info, warn};

use dsfleet_protocol::management::instance::{InstanceId, Intent, LifecycleState};
use dsfleet_protocol::utils::render_all;

use crate::app::AppState;
use crate::error::FleetError;
use crate::management::comm::LaunchSpec;
use crate::management::host::ProcessInfo;
use crate::management::instance::Instance;
use crate::management::status::StatusOracle;
use crate::provision::setting::{self, DedicatedSettings};
use crate::provision::world;
use crate::storage::files::{copy_tree, move_dir, remove_dir_with_retry, unused_path};

const TORCH_CFG: &str = "Torch.cfg";
const DEDICATED_CFG: &str = "SpaceEngineers-Dedicated.cfg";
const PLUGIN_CFG: &str = "SpaceBattle.cfg";

/// One line of `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub state: LifecycleState,
    pub zip_path: String,
}

/// Lifecycle operations on numbered instances. Callers hold the instance lock
/// around every mutating call.
pub struct LifecycleController {
    state: AppState,
}

impl LifecycleController {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn instance(&self, id: InstanceId) -> Instance<'_> {
        Instance::new(id, &self.state.config)
    }

    pub fn oracle(&self) -> StatusOracle<'_> {
        StatusOracle::new(
            &self.state.config,
            self.state.host.as_ref(),
            &self.state.markers,
            &self.state.cache,
        )
    }

    fn process(&self, id: InstanceId) -> Option<ProcessInfo> {
        self.oracle().find_process(&self.instance(id))
    }

    pub fn pid(&self, id: InstanceId) -> Option<u32> {
        self.process(id).map(|p| p.pid)
    }

    pub fn status(&self, id: InstanceId) -> anyhow::Result<LifecycleState> {
        self.oracle().status(&self.instance(id))
    }

    /// Starting or serving.
    pub fn check(&self, id: InstanceId) -> anyhow::Result<bool> {
        Ok(self.status(id)?.is_working())
    }

    pub fn list(&self) -> anyhow::Result<Vec<InstanceSummary>> {
        let mut result = Vec::new();
        for id in InstanceId::all() {
            let state = self.status(id)?;
            if state != LifecycleState::Free {
                result.push(InstanceSummary {
                    id,
                    state,
                    zip_path: self.instance(id).zip_path(),
                });
            }
        }
        Ok(result)
    }

    fn require_exists(&self, inst: &Instance) -> anyhow::Result<()> {
        if !inst.exists() {
            return Err(FleetError::precondition(format!(
                "Server does not exist with number {}",
                inst.id()
            ))
            .into());
        }
        Ok(())
    }

    pub fn create(&self, id: InstanceId, archive: &Path, suffix: &str) -> anyhow::Result<()> {
        let inst = self.instance(id);
        if inst.exists() {
            let message = if self.pid(id).is_some() {
                format!(
                    "Server already exists and running with number {}, stop and archive it before recreating",
                    id
                )
            } else {
                format!(
                    "Server already exists with number {}, archive it before recreating",
                    id
                )
            };
            return Err(FleetError::precondition(message).into());
        }
        let config = &self.state.config;
        let provisioner = self.state.provisioner.as_ref();
        let host_ip = self.state.host_ip()?;
        info!("creating instance {} from {}", id, archive.display());

        let prefix = inst.prefix_dir();
        if prefix.is_dir() {
            fs::remove_dir_all(&prefix)
                .with_context(|| format!("failed to remove stale {}", prefix.display()))?;
        }
        provisioner
            .clone_tree(&inst.template_prefix_dir(), &prefix)
            .context("failed to clone runtime prefix")?;
        provisioner
            .clone_tree(&inst.template_server_dir(), &inst.server_dir())
            .context("failed to clone server template")?;
        provisioner.regenerate_identifiers(&prefix, &inst.server_dir())?;

        world::extract_world(provisioner, &inst.server_dir(), archive)?;
        let world_info = world::load_world(&inst.world_json_path())?;
        world::deploy_asteroids(&inst.world_dir(), &config.resolve(&config.layout.assets_dir))?;
        world::extract_plugins(
            provisioner,
            &world_info.plugins_with(&config.provision.required_plugin),
            &config.resolve(&config.layout.plugins_dir),
            &inst.plugins_dir(),
        )?;

        setting::configure_torch(
            &inst.server_dir().join(TORCH_CFG),
            &inst.plugins_dir(),
            &config.user_name,
        )?;
        let server_name = world_info.server_name(suffix);
        setting::configure_dedicated_server(
            &inst.instance_dir().join(DEDICATED_CFG),
            &DedicatedSettings {
                user_name: &config.user_name,
                port: inst.port(),
                admin_port: inst.admin_port(),
                server_name: &server_name,
            },
        )?;
        setting::configure_plugin(
            &inst.instance_dir().join(PLUGIN_CFG),
            &config.environment,
            host_ip,
            inst.port(),
        )?;
        let vars = HashMap::from([
            ("prefix".to_string(), prefix.to_string_lossy().to_string()),
            (
                "instance_path".to_string(),
                inst.instance_dir().to_string_lossy().to_string(),
            ),
            ("server_name".to_string(), server_name.clone()),
        ]);
        setting::write_start_script(&inst.start_script_path(), &config.process.start_script, &vars)?;

        inst.link_content_cache()?;
        inst.write_zip_path(archive)?;
        inst.write_name_suffix(suffix)?;
        world::checksum_world(&inst.world_dir(), &config.provision.world_files)?;
        if self.state.cache.restore_into(&inst.world_dir())? {
            debug!("instance {} skips world compilation", id);
        }
        info!("created instance {} ({})", id, server_name);
        Ok(())
    }

    /// Marks the instance as wanted and launches it unless it already runs.
    pub fn start(&self, id: InstanceId, update: bool) -> anyhow::Result<()> {
        let inst = self.instance(id);
        self.require_exists(&inst)?;
        inst.write_intent(Intent::Serving)?;
        if let Some(process) = self.process(id) {
            info!("instance {} already running as {}", id, process.pid);
            return Ok(());
        }

        let vars = HashMap::from([
            ("number".to_string(), id.to_string()),
            (
                "server_dir".to_string(),
                inst.server_dir().to_string_lossy().to_string(),
            ),
        ]);
        let mut command = render_all(&self.state.config.process.launch_command, &vars)
            .map_err(|e| FleetError::Config(format!("launch command: {}", e)))?;
        if update {
            command.push(self.state.config.process.update_arg.clone());
        }
        let spec = LaunchSpec::from_command(command, inst.server_dir(), inst.start_log_path())?;
        let pid = self
            .state
            .host
            .launch(&spec)
            .with_context(|| format!("failed to launch instance {}", id))?;
        info!("started instance {} (launcher {})", id, pid);
        Ok(())
    }

    pub fn stop(&self, id: InstanceId) -> anyhow::Result<()> {
        let inst = self.instance(id);
        if !inst.exists() {
            return Ok(());
        }
        inst.write_intent(Intent::Stopped)?;
        let Some(process) = self.process(id) else {
            return Ok(());
        };
        match self.state.host.terminate(process.pid) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("failed to stop process {}", process.pid))
            }
            _ => {
                info!("sent stop request to instance {} ({})", id, process.pid);
                Ok(())
            }
        }
    }

    pub fn kill(&self, id: InstanceId) -> anyhow::Result<()> {
        let inst = self.instance(id);
        if !inst.exists() {
            return Ok(());
        }
        inst.write_intent(Intent::Stopped)?;
        let timing = &self.state.config.timing;
        for _ in 0..timing.kill_attempts {
            let Some(process) = self.process(id) else {
                return Ok(());
            };
            match self.state.host.kill(process.pid) {
                Ok(()) => debug!("killed {} of instance {}", process.pid, id),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to kill process {}", process.pid))
                }
            }
            std::thread::sleep(self.state.config.kill_interval());
        }
        if self.process(id).is_none() {
            return Ok(());
        }
        error!("instance {} survived {} kill attempts", id, timing.kill_attempts);
        Err(FleetError::ProcessControl(format!(
            "Failed to kill server processes with -instancepath {}",
            inst.instance_dir().display()
        ))
        .into())
    }

    /// Moves the server dir into the archive and drops the runtime prefix.
    pub fn archive(&self, id: InstanceId, initiator: &str, full: bool) -> anyhow::Result<PathBuf> {
        let inst = self.instance(id);
        self.require_exists(&inst)?;
        if self.pid(id).is_some() {
            return Err(FleetError::precondition(format!(
                "Server is still running with number {}, stop it before archiving",
                id
            ))
            .into());
        }

        let archive_dir = inst.archive_dir();
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("failed to create {}", archive_dir.display()))?;
        let mode = if full { "full" } else { "partial" };
        let target = unused_path(archive_dir.join(format!(
            "{}_{}_{}",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            initiator,
            mode
        )));
        move_dir(&inst.server_dir(), &target)
            .with_context(|| format!("failed to move server dir to {}", target.display()))?;
        remove_dir_with_retry(&inst.prefix_dir(), self.state.config.removal_retry_delay())?;

        if !full {
            prune_archive(&target, &self.state.config.archive.retained)?;
        }
        info!("archived instance {} to {}", id, target.display());
        Ok(target)
    }

    /// Kills and deletes the instance. Removal failures are only logged.
    pub fn destroy(&self, id: InstanceId) -> anyhow::Result<()> {
        let inst = self.instance(id);
        if !inst.exists() {
            return Ok(());
        }
        self.kill(id)?;
        for dir in [inst.server_dir(), inst.prefix_dir()] {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("failed to remove {}: {}", dir.display(), e);
            }
        }
        info!("destroyed instance {}", id);
        Ok(())
    }

    /// Rebuilds the instance from the archive it was created from and starts it.
    pub fn recreate(&self, id: InstanceId, initiator: &str) -> anyhow::Result<()> {
        let inst = self.instance(id);
        info!("recreating instance {}", id);
        self.kill(id)?;

        let zip_path = inst.zip_path();
        if zip_path.is_empty() {
            return Err(FleetError::validation(format!(
                "No source archive recorded for instance {}",
                id
            ))
            .into());
        }
        let suffix = inst.name_suffix();
        let checksum = inst.world_checksum();

        self.archive(id, initiator, false)?;
        self.create(id, Path::new(&zip_path), &suffix)?;
        if checksum.is_some() && inst.world_checksum() != checksum {
            warn!("world of instance {} changed since {}", id, zip_path);
        }
        self.start(id, false)?;
        info!("recreated and started instance {}", id);
        Ok(())
    }

    pub fn restart(&self, id: InstanceId) -> anyhow::Result<()> {
        info!("restarting instance {}", id);
        self.kill(id)?;
        self.start(id, false)
    }

    /// Refreshes the server files from the template, keeping everything else.
    pub fn upgrade(&self, id: InstanceId) -> anyhow::Result<()> {
        let inst = self.instance(id);
        self.require_exists(&inst)?;
        if self.pid(id).is_some() {
            return Err(FleetError::precondition("Cannot upgrade, server is running").into());
        }
        copy_tree(&inst.template_server_dir(), &inst.server_dir())
            .context("failed to copy server template")?;
        info!("upgraded instance {}", id);
        Ok(())
    }

    /// Renices the running process according to the instance's priority class.
    /// Returns the applied nice level.
    pub fn apply_priority(&self, id: InstanceId) -> anyhow::Result<Option<i32>> {
        let Some(process) = self.process(id) else {
            return Ok(None);
        };
        let Some(class) = self.instance(id).priority() else {
            return Ok(None);
        };
        let Some(&nice) = self.state.config.priorities.get(&class) else {
            error!("Got unknown priority value {:?} for instance {}", class, id);
            return Ok(None);
        };
        if let Err(e) = self.state.host.renice(process.pid, nice) {
            warn!("failed to renice {} of instance {} to {}: {}", process.pid, id, nice, e);
            return Ok(None);
        }
        Ok(Some(nice))
    }
}

/// Deletes every top-level entry not in `retained`.
fn prune_archive(dir: &Path, retained: &[String]) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if retained.contains(&name) {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("failed to prune {}", path.display()))?;
    }
    Ok(())
}
