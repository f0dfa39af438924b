use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info};
use tokio::sync::Notify;

use dsfleet_protocol::management::instance::InstanceId;

use crate::cli::{Cli, Command};
use crate::config::{resolve_host_ip, HostConfig};
use crate::management::cache::BinaryArtifactCache;
use crate::management::controller::LifecycleController;
use crate::management::host::{ProcessHost, SystemHost};
use crate::management::keepalive::{watch_termination, KeepaliveSupervisor};
use crate::management::lock::InstanceLock;
use crate::management::markers::FatalMarkers;
use crate::provision::{FsProvisioner, Provisioner};
use crate::utils::DailyLogFile;

const INITIATOR: &str = "cmdline";

pub struct ApplicationState {
    pub config: HostConfig,
    pub host: Arc<dyn ProcessHost>,
    pub provisioner: Arc<dyn Provisioner>,
    pub markers: FatalMarkers,
    pub cache: BinaryArtifactCache,
    /// Filled on first use, so only commands that write the hosting plugin
    /// config depend on the host name resolving.
    pub host_ip: OnceLock<String>,
}
pub type AppState = Arc<ApplicationState>;

impl ApplicationState {
    /// Advertised host address, resolved at most once per process.
    pub fn host_ip(&self) -> anyhow::Result<&str> {
        if let Some(ip) = self.host_ip.get() {
            return Ok(ip);
        }
        let ip = resolve_host_ip(&self.config)?;
        debug!("host address: {}", ip);
        Ok(self.host_ip.get_or_init(|| ip))
    }
}

/// Loads the host config, applying command line overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<HostConfig> {
    let mut config = HostConfig::load(cli.config.clone())?;
    if let Some(environment) = &cli.environment {
        config.environment = environment.clone();
    }
    Ok(config)
}

/// Daily log sink of a running keepalive, `None` for every other command.
pub fn keepalive_log(config: &HostConfig, command: &Command) -> anyhow::Result<Option<DailyLogFile>> {
    match command {
        Command::Keepalive {
            number,
            stop: false,
            ..
        } => {
            let dir = config.resolve(&config.layout.log_dir);
            let log = DailyLogFile::new(&dir, format!("keepalive-{}", number))
                .with_context(|| format!("failed to open log directory {}", dir.display()))?;
            Ok(Some(log))
        }
        _ => Ok(None),
    }
}

fn init_app_state(config: HostConfig) -> anyhow::Result<AppState> {
    debug!(
        "config loaded: {}",
        serde_json::to_string_pretty(&config).unwrap_or_default()
    );

    let markers = FatalMarkers::load(config.markers_path.as_deref())?;

    Ok(Arc::new(ApplicationState {
        host: Arc::new(SystemHost),
        provisioner: Arc::new(FsProvisioner::from_config(&config)),
        cache: BinaryArtifactCache::from_config(&config),
        markers,
        host_ip: OnceLock::new(),
        config,
    }))
}

fn lock_dir(config: &HostConfig) -> std::path::PathBuf {
    config.resolve(&config.layout.lock_dir)
}

/// Runs one command. Returns `false` when the command reports failure
/// without an error, which is only `check` on an instance that is not working.
pub async fn run_app(config: HostConfig, command: Command) -> anyhow::Result<bool> {
    let state = init_app_state(config)?;

    if let Command::Keepalive {
        number,
        stop,
        period,
    } = command
    {
        return keepalive(state, number, stop, Duration::from_secs(period)).await;
    }

    tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        let controller = LifecycleController::new(state.clone());
        let _lock = match command.number() {
            Some(id) if command.is_locked() => {
                let lock_dir = lock_dir(&state.config);
                match InstanceLock::try_acquire(&lock_dir, id)? {
                    Some(lock) => Some(lock),
                    None => {
                        info!("Instance {} is busy, waiting", id);
                        Some(InstanceLock::acquire(&lock_dir, id)?)
                    }
                }
            }
            _ => None,
        };
        execute(&controller, &command)
    })
    .await
    .context("command task failed")?
}

/// Dispatches a foreground command. The caller holds the instance lock.
pub fn execute(controller: &LifecycleController, command: &Command) -> anyhow::Result<bool> {
    match command {
        Command::List => {
            for summary in controller.list()? {
                println!("{:02} {} {}", summary.id.get(), summary.state, summary.zip_path);
            }
        }
        Command::Create {
            number,
            world,
            suffix,
        } => {
            let world = absolute(world)?;
            controller.create(*number, &world, suffix)?;
        }
        Command::Archive { number, full } => {
            let target = controller.archive(*number, INITIATOR, *full)?;
            info!("Archived instance {} to {}", number, target.display());
        }
        Command::Destroy { number } => controller.destroy(*number)?,
        Command::Start { number, update } => controller.start(*number, *update)?,
        Command::Stop { number } => controller.stop(*number)?,
        Command::Kill { number } => controller.kill(*number)?,
        Command::Pid { number } => {
            if let Some(pid) = controller.pid(*number) {
                println!("{}", pid);
            }
        }
        Command::Check { number } => return controller.check(*number),
        Command::Status { number } => {
            println!("{}", controller.status(*number)?);
            let phase = controller.instance(*number).phase();
            if !phase.is_empty() {
                info!("Instance {} phase: {}", number, phase);
            }
        }
        Command::Recreate { number } => controller.recreate(*number, INITIATOR)?,
        Command::Restart { number } => controller.restart(*number)?,
        Command::Upgrade { number } => controller.upgrade(*number)?,
        Command::Keepalive { .. } => {
            anyhow::bail!("keepalive cannot run as a foreground command")
        }
    }
    Ok(true)
}

fn absolute(path: &Path) -> anyhow::Result<std::path::PathBuf> {
    std::path::absolute(path).with_context(|| format!("invalid path {}", path.display()))
}

async fn keepalive(
    state: AppState,
    id: InstanceId,
    stop: bool,
    period: Duration,
) -> anyhow::Result<bool> {
    let supervisor = Arc::new(KeepaliveSupervisor::new(state, id));
    if supervisor.stop_previous()? {
        info!("Stopped previous keepalive of instance {}", id);
    }
    if stop {
        return Ok(true);
    }

    supervisor.write_pid()?;
    let stop_notify = Arc::new(Notify::new());
    watch_termination(stop_notify.clone())?;
    supervisor.run(period, stop_notify).await;
    info!("Bye.");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management::testing::{FakeHost, Fixture};
    use clap::Parser;
    use dsfleet_protocol::management::instance::LifecycleState;
    use pretty_assertions::assert_eq;

    fn command(args: &[&str]) -> Command {
        Cli::try_parse_from(std::iter::once("dsfleet").chain(args.iter().copied()))
            .unwrap()
            .command
            .unwrap()
    }

    fn id(n: i64) -> InstanceId {
        InstanceId::new(n).unwrap()
    }

    #[test]
    fn check_reports_not_working_without_error() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(FakeHost::new()));
        assert!(!execute(&controller, &command(&["check", "4"])).unwrap());
    }

    #[test]
    fn create_then_start_through_commands() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let controller = fixture.controller(host.clone());
        let world = fixture.world_zip.to_string_lossy().to_string();

        assert!(execute(&controller, &command(&["create", "2", &world, "-s", "EU"])).unwrap());
        assert_eq!(controller.status(id(2)).unwrap(), LifecycleState::Stopped);

        assert!(execute(&controller, &command(&["start", "2"])).unwrap());
        assert_eq!(host.launches().len(), 1);
        assert!(execute(&controller, &command(&["check", "2"])).unwrap());
    }

    #[test]
    fn archive_of_missing_instance_fails() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(FakeHost::new()));
        let err = execute(&controller, &command(&["archive", "9"])).unwrap_err();
        assert!(err.to_string().contains("Server does not exist with number 9"));
    }

    #[test]
    fn host_address_is_resolved_on_first_use() {
        let fixture = Fixture::new();
        let state = fixture.state(Arc::new(FakeHost::new()));
        assert!(state.host_ip.get().is_none());
        assert_eq!(state.host_ip().unwrap(), "10.0.0.1");
        assert_eq!(state.host_ip.get().map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn keepalive_is_not_a_foreground_command() {
        let fixture = Fixture::new();
        let controller = fixture.controller(Arc::new(FakeHost::new()));
        assert!(execute(&controller, &command(&["keepalive", "1"])).is_err());
    }

    #[test]
    fn environment_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dsfleet.json");
        let cli = Cli::try_parse_from([
            "dsfleet",
            "--config",
            path.to_str().unwrap(),
            "--environment",
            "prod",
            "list",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.environment, "prod");
        assert!(path.exists());
    }

    #[test]
    fn only_running_keepalive_logs_to_file() {
        let fixture = Fixture::new();
        let log = keepalive_log(&fixture.config, &command(&["keepalive", "5"])).unwrap();
        let path = log.unwrap().path_for(chrono::Local::now().date_naive());
        assert!(path.starts_with(fixture.config.resolve(&fixture.config.layout.log_dir)));

        assert!(keepalive_log(&fixture.config, &command(&["keepalive", "5", "-s"]))
            .unwrap()
            .is_none());
        assert!(keepalive_log(&fixture.config, &command(&["status", "5"]))
            .unwrap()
            .is_none());
    }
}
