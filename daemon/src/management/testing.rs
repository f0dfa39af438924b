//! In-memory process host and on-disk host layout shared by the lifecycle tests.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::app::{AppState, ApplicationState};
use crate::config::HostConfig;
use crate::management::cache::BinaryArtifactCache;
use crate::management::comm::LaunchSpec;
use crate::management::controller::LifecycleController;
use crate::management::host::{ProcessHost, ProcessInfo};
use crate::management::markers::FatalMarkers;
use crate::provision::FsProvisioner;

#[derive(Default)]
pub struct FakeState {
    pub processes: Vec<ProcessInfo>,
    pub bound: HashSet<(u32, u16)>,
    pub unkillable: bool,
    pub renice_denied: bool,
    pub signals_denied: bool,
    pub launch_fails: bool,
    pub launches: Vec<LaunchSpec>,
    pub signals: Vec<(u32, &'static str)>,
    pub renices: Vec<(u32, i32)>,
    next_pid: u32,
}

/// Process table kept in memory. Launching an instance makes its game process
/// appear at once; signals remove it unless it is marked unkillable.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<FakeState>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_process(&self, cmd: Vec<String>, started_secs_ago: u64) -> u32 {
        let mut state = self.state();
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.processes.push(ProcessInfo {
            pid,
            cmd,
            start_time: unix_now().saturating_sub(started_secs_ago),
        });
        pid
    }

    /// Adds a game process serving `instance_dir`.
    pub fn spawn_instance(&self, instance_dir: &Path, started_secs_ago: u64) -> u32 {
        self.add_process(
            vec![
                "Torch.Server.exe".to_string(),
                "-nogui".to_string(),
                "-instancepath".to_string(),
                instance_dir.to_string_lossy().to_string(),
            ],
            started_secs_ago,
        )
    }

    pub fn bind(&self, pid: u32, port: u16) {
        self.state().bound.insert((pid, port));
    }

    pub fn set_unkillable(&self, unkillable: bool) {
        self.state().unkillable = unkillable;
    }

    pub fn set_renice_denied(&self, denied: bool) {
        self.state().renice_denied = denied;
    }

    pub fn set_signals_denied(&self, denied: bool) {
        self.state().signals_denied = denied;
    }

    /// Launches are still recorded, but no process appears.
    pub fn set_launch_fails(&self, fails: bool) {
        self.state().launch_fails = fails;
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state().launches.clone()
    }

    pub fn signals(&self) -> Vec<(u32, &'static str)> {
        self.state().signals.clone()
    }

    pub fn renices(&self) -> Vec<(u32, i32)> {
        self.state().renices.clone()
    }

    fn signal(&self, pid: u32, name: &'static str) -> io::Result<()> {
        let mut state = self.state();
        if !state.processes.iter().any(|p| p.pid == pid) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
        }
        if state.signals_denied {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        state.signals.push((pid, name));
        if !state.unkillable {
            state.processes.retain(|p| p.pid != pid);
        }
        Ok(())
    }
}

impl ProcessHost for FakeHost {
    fn processes(&self) -> Vec<ProcessInfo> {
        self.state().processes.clone()
    }

    fn udp_port_bound(&self, pid: u32, port: u16) -> bool {
        self.state().bound.contains(&(pid, port))
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        self.signal(pid, "TERM")
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.signal(pid, "KILL")
    }

    fn renice(&self, pid: u32, nice: i32) -> io::Result<()> {
        let mut state = self.state();
        if state.renice_denied {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        state.renices.push((pid, nice));
        Ok(())
    }

    fn launch(&self, spec: &LaunchSpec) -> io::Result<u32> {
        let mut state = self.state();
        state.launches.push(spec.clone());
        if state.launch_fails {
            return Err(io::Error::new(io::ErrorKind::NotFound, "xvfb-run not found"));
        }
        drop(state);
        Ok(self.spawn_instance(&spec.working_dir.join("Instance"), 0))
    }
}

/// Writes a zip archive. Entries with no content are directories.
pub fn write_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
    let file = fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, content) in entries {
        match content {
            Some(content) => {
                zip.start_file(*name, options).unwrap();
                zip.write_all(content.as_bytes()).unwrap();
            }
            None => zip.add_directory(*name, options).unwrap(),
        }
    }
    zip.finish().unwrap();
}

const TORCH_CFG: &str = "<?xml version=\"1.0\"?>\n<TorchConfig>\n  \
    <InstancePath>C:\\Users\\template\\Instance</InstancePath>\n  <Plugins></Plugins>\n</TorchConfig>\n";

const DEDICATED_CFG: &str = "<MyConfigDedicated>\n  <LoadWorld>C:/template</LoadWorld>\n  \
    <IP>0.0.0.0</IP>\n  <ServerPort>27016</ServerPort>\n  <RemoteApiPort>8080</RemoteApiPort>\n  \
    <ServerName>Template</ServerName>\n</MyConfigDedicated>\n";

const SANDBOX_SBS: &str = "<MyObjectBuilder_Sector>\n  <StorageName>Asteroid_1</StorageName>\n</MyObjectBuilder_Sector>\n";

/// A complete host root in a temp dir: templates, plugin bundles, assets and
/// two world archives.
pub struct Fixture {
    pub dir: TempDir,
    pub config: HostConfig,
    pub markers: FatalMarkers,
    pub cache: BinaryArtifactCache,
    pub world_zip: PathBuf,
    /// World archive lacking `world.json`.
    pub bare_zip: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let mut config = HostConfig {
            root: root.clone(),
            user_name: "ds".to_string(),
            host_ip: Some("10.0.0.1".to_string()),
            ..HostConfig::default()
        };
        config.timing.kill_interval_ms = 1;
        config.timing.removal_retry_delay_ms = 1;
        config.timing.keepalive_stop_grace_ms = 10;
        config.timing.recovery_cooldown_secs = 0;

        let prefix = root.join(".wine00");
        fs::create_dir_all(prefix.join("drive_c/users/ds")).unwrap();
        fs::write(
            prefix.join("system.reg"),
            "WINE REGISTRY Version 2\n\"MachineGuid\"=\"72d72157-dd3f-40c9-b462-c6a455a30bb9\"\n\
             \"MachineId\"=\"{1392A2EE-5B9E-4B71-A658-1B7163112B20}\"\n",
        )
        .unwrap();
        fs::write(
            prefix.join("user.reg"),
            "\"UserId\"=\"{64B8BFE8-E625-4C5E-8729-7F54773CF4FE}\"\n",
        )
        .unwrap();
        fs::write(prefix.join("wineserver"), "wine-abcdef").unwrap();

        let server = root.join("ds00");
        fs::create_dir_all(server.join("Instance")).unwrap();
        fs::create_dir_all(server.join("DedicatedServer64")).unwrap();
        fs::write(server.join("Torch.cfg"), TORCH_CFG).unwrap();
        fs::write(server.join("Torch.Server.exe"), "MZ").unwrap();
        fs::write(server.join("DedicatedServer64/VRage.dll"), "MZ").unwrap();
        fs::write(server.join("Torch.log"), "template log").unwrap();
        fs::write(
            server.join("Instance/SpaceEngineers-Dedicated.cfg"),
            DEDICATED_CFG,
        )
        .unwrap();

        let plugins = root.join("plugins");
        fs::create_dir_all(&plugins).unwrap();
        write_zip(
            &plugins.join("Hosting.zip"),
            &[("manifest.xml", Some("<PluginManifest>\n  <Guid>22222222-bbbb</Guid>\n</PluginManifest>"))],
        );
        write_zip(
            &plugins.join("Concealment.zip"),
            &[
                ("Concealment/", None),
                ("Concealment/manifest.xml", Some("<Guid>11111111-aaaa</Guid>")),
                ("Concealment/Concealment.dll", Some("MZ")),
            ],
        );

        fs::create_dir_all(root.join("asteroids")).unwrap();
        fs::write(root.join("asteroids/Asteroid_1.vx2"), "voxels").unwrap();

        let worlds = root.join("worlds");
        fs::create_dir_all(&worlds).unwrap();
        let world_zip = worlds.join("Frontier.zip");
        write_zip(
            &world_zip,
            &[
                ("Frontier/", None),
                (
                    "Frontier/world.json",
                    Some(r#"{"name": "Frontier", "maxPlayers": 8, "plugins": ["Concealment"]}"#),
                ),
                ("Frontier/Instance/Saves/World/Sandbox.sbc", Some("<Sandbox/>")),
                ("Frontier/Instance/Saves/World/Sandbox_config.sbc", Some("<Config/>")),
                ("Frontier/Instance/Saves/World/SANDBOX_0_0_0_.sbs", Some(SANDBOX_SBS)),
            ],
        );
        let bare_zip = worlds.join("Bare.zip");
        write_zip(
            &bare_zip,
            &[("Bare/Instance/Saves/World/Sandbox.sbc", Some("<Sandbox/>"))],
        );

        let markers = FatalMarkers::builtin().unwrap();
        let cache = BinaryArtifactCache::from_config(&config);
        Self {
            dir,
            config,
            markers,
            cache,
            world_zip,
            bare_zip,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn template_server(&self) -> PathBuf {
        self.root().join("ds00")
    }

    pub fn state(&self, host: Arc<dyn ProcessHost>) -> AppState {
        Arc::new(ApplicationState {
            config: self.config.clone(),
            host,
            provisioner: Arc::new(FsProvisioner::from_config(&self.config)),
            markers: self.markers.clone(),
            cache: BinaryArtifactCache::from_config(&self.config),
            host_ip: OnceLock::new(),
        })
    }

    pub fn controller(&self, host: Arc<FakeHost>) -> LifecycleController {
        LifecycleController::new(self.state(host))
    }
}
