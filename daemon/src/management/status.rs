use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use log::{debug, info, warn};

use dsfleet_protocol::management::instance::{Intent, LifecycleState};

use crate::config::HostConfig;
use crate::management::cache::BinaryArtifactCache;
use crate::management::host::{ProcessHost, ProcessInfo};
use crate::management::instance::Instance;
use crate::management::markers::FatalMarkers;
use crate::storage::files::read_tail;

/// Timing limits applied when classifying a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub canary_timeout: Duration,
    pub startup_timeout: Duration,
}

impl Thresholds {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            canary_timeout: config.canary_timeout(),
            startup_timeout: config.startup_timeout(),
        }
    }
}

/// Everything the classification depends on, gathered in one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub exists: bool,
    pub intent: Option<Intent>,
    pub ready_marker: bool,
    /// The ready line appears anywhere in the newest startup log.
    pub log_ready: bool,
    /// Tail of the newest startup log, scanned for fatal markers; `None`
    /// when there is none to read.
    pub log_tail: Option<String>,
    pub process: Option<ProcessInfo>,
    pub port_bound: bool,
    /// `None` when the heartbeat file is missing.
    pub canary_age: Option<Duration>,
    pub process_age: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub state: LifecycleState,
    /// The ready line was seen for the first time; the marker must be written.
    pub newly_ready: bool,
}

impl Verdict {
    fn settled(state: LifecycleState) -> Self {
        Self {
            state,
            newly_ready: false,
        }
    }
}

/// Classifies an observation. Pure: all IO happens in `observe` and `commit`.
pub fn evaluate(obs: &Observation, markers: &FatalMarkers, thresholds: &Thresholds) -> Verdict {
    if !obs.exists {
        return Verdict::settled(LifecycleState::Free);
    }
    if obs.intent != Some(Intent::Serving) {
        return Verdict::settled(LifecycleState::Stopped);
    }

    let log_ready = !obs.ready_marker && obs.log_ready;

    if obs.ready_marker || log_ready {
        let heartbeat_fresh = obs
            .canary_age
            .is_some_and(|age| age < thresholds.canary_timeout);
        let state = if obs.process.is_some() && obs.port_bound && heartbeat_fresh {
            LifecycleState::Serving
        } else {
            LifecycleState::Failed
        };
        return Verdict {
            state,
            newly_ready: log_ready,
        };
    }

    if obs.process.is_none() {
        return Verdict::settled(LifecycleState::Failed);
    }
    if obs
        .process_age
        .is_some_and(|age| age >= thresholds.startup_timeout)
    {
        return Verdict::settled(LifecycleState::Failed);
    }
    let fatal = obs
        .log_tail
        .as_deref()
        .and_then(|log| markers.find_fatal(log));
    if let Some(marker) = fatal {
        debug!("startup log contains fatal marker {:?}", marker);
        return Verdict::settled(LifecycleState::Failed);
    }
    Verdict::settled(LifecycleState::Starting)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

/// Derives an instance's lifecycle state from the filesystem and process table.
pub struct StatusOracle<'a> {
    config: &'a HostConfig,
    host: &'a dyn ProcessHost,
    markers: &'a FatalMarkers,
    cache: &'a BinaryArtifactCache,
}

impl<'a> StatusOracle<'a> {
    pub fn new(
        config: &'a HostConfig,
        host: &'a dyn ProcessHost,
        markers: &'a FatalMarkers,
        cache: &'a BinaryArtifactCache,
    ) -> Self {
        Self {
            config,
            host,
            markers,
            cache,
        }
    }

    /// The process running this instance, lowest pid first when several match.
    pub fn find_process(&self, instance: &Instance) -> Option<ProcessInfo> {
        let process = &self.config.process;
        let instance_dir = instance.instance_dir();
        self.host
            .processes()
            .into_iter()
            .filter(|p| p.runs_instance(&process.executable, &process.instance_path_flag, &instance_dir))
            .min_by_key(|p| p.pid)
    }

    /// Newest startup log by name.
    pub fn startup_log(&self, instance: &Instance) -> Option<PathBuf> {
        let process = &self.config.process;
        fs::read_dir(instance.logs_dir())
            .ok()?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(&process.log_prefix) && name.ends_with(&process.log_suffix))
                    .then_some(name)
            })
            .max()
            .map(|name| instance.logs_dir().join(name))
    }

    /// Whether the ready line was logged, scanning the whole file since it
    /// is written early and the log keeps growing.
    fn startup_log_ready(&self, path: &Path) -> bool {
        let scan = fs::File::open(path).and_then(|f| self.markers.scan_ready(BufReader::new(f)));
        match scan {
            Ok(ready) => ready,
            Err(e) => {
                debug!("cannot read {}: {}", path.display(), e);
                false
            }
        }
    }

    fn startup_log_tail(&self, path: &Path) -> Option<String> {
        match read_tail(path, self.config.timing.log_tail_bytes) {
            Ok(tail) => Some(tail),
            Err(e) => {
                debug!("cannot read {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn observe(&self, instance: &Instance) -> Observation {
        let mut obs = Observation {
            exists: instance.exists(),
            ..Observation::default()
        };
        if !obs.exists {
            return obs;
        }
        obs.intent = instance.intent();
        if obs.intent != Some(Intent::Serving) {
            return obs;
        }

        obs.ready_marker = instance.ready_path().exists();
        if !obs.ready_marker {
            if let Some(log) = self.startup_log(instance) {
                obs.log_ready = self.startup_log_ready(&log);
                if !obs.log_ready {
                    obs.log_tail = self.startup_log_tail(&log);
                }
            }
        }
        obs.process = self.find_process(instance);
        if let Some(process) = &obs.process {
            obs.port_bound = self.host.udp_port_bound(process.pid, instance.port());
            obs.process_age = Some(Duration::from_secs(process.age_secs(unix_now())));
        }
        obs.canary_age = file_age(&instance.canary_path());
        obs
    }

    /// Applies the side effects of a verdict: the one-time ready marker and
    /// caching of the compiled world.
    pub fn commit(&self, instance: &Instance, verdict: &Verdict) -> anyhow::Result<()> {
        if verdict.newly_ready {
            write_ready_marker(&instance.ready_path())?;
            info!("instance {} reported ready", instance.id());
        }
        if verdict.state == LifecycleState::Serving {
            if let Err(e) = self.cache.store_from(&instance.world_dir()) {
                warn!(
                    "failed to cache compiled world of instance {}: {:?}",
                    instance.id(),
                    e
                );
            }
        }
        Ok(())
    }

    pub fn status(&self, instance: &Instance) -> anyhow::Result<LifecycleState> {
        let obs = self.observe(instance);
        let verdict = evaluate(&obs, self.markers, &Thresholds::from_config(self.config));
        self.commit(instance, &verdict)?;
        Ok(verdict.state)
    }
}

fn write_ready_marker(path: &Path) -> anyhow::Result<()> {
    use std::io::Write;

    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create {}", path.display()))
        }
    };
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    file.write_all(stamp.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}
