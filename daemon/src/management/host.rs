use std::io;
use std::path::Path;

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::management::comm::{launch_detached, LaunchSpec, ProcessHelper};

/// A live OS process, as far as instance bookkeeping cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmd: Vec<String>,
    /// Unix seconds.
    pub start_time: u64,
}

impl ProcessInfo {
    /// argv[0] names the workload and the argument list holds both the
    /// instance flag and this instance's path.
    pub fn runs_instance(&self, executable: &str, flag: &str, instance_dir: &Path) -> bool {
        let instance_dir = instance_dir.to_string_lossy();
        self.cmd.first().is_some_and(|arg0| arg0.contains(executable))
            && self.cmd.iter().any(|arg| arg == flag)
            && self.cmd.iter().any(|arg| *arg == instance_dir)
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.start_time)
    }
}

/// Process table access and control. Swapped for an in-memory host in tests.
pub trait ProcessHost: Send + Sync {
    fn processes(&self) -> Vec<ProcessInfo>;

    fn udp_port_bound(&self, pid: u32, port: u16) -> bool;

    /// Graceful stop request. `NotFound` when the process is already gone.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forced stop. `NotFound` when the process is already gone.
    fn kill(&self, pid: u32) -> io::Result<()>;

    fn renice(&self, pid: u32, nice: i32) -> io::Result<()>;

    fn launch(&self, spec: &LaunchSpec) -> io::Result<u32>;

    fn find(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes().into_iter().find(|p| p.pid == pid)
    }
}

pub struct SystemHost;

impl ProcessHost for SystemHost {
    fn processes(&self) -> Vec<ProcessInfo> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        sys.processes()
            .values()
            .filter(|p| p.thread_kind().is_none())
            .map(|p| ProcessInfo {
                pid: p.pid().as_u32(),
                cmd: p
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy().to_string())
                    .collect(),
                start_time: p.start_time(),
            })
            .collect()
    }

    fn udp_port_bound(&self, pid: u32, port: u16) -> bool {
        ProcessHelper::udp_port_bound(pid, port)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        ProcessHelper::stop(pid)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        ProcessHelper::kill(pid)
    }

    fn renice(&self, pid: u32, nice: i32) -> io::Result<()> {
        ProcessHelper::renice(pid, nice)
    }

    fn launch(&self, spec: &LaunchSpec) -> io::Result<u32> {
        launch_detached(spec)
    }
}
