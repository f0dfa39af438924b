use std::fs::OpenOptions;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::{debug, warn};

/// Everything needed to start an instance's launch wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Receives both stdout and stderr, truncated on every launch.
    pub log_path: PathBuf,
}

impl LaunchSpec {
    /// Splits a rendered command line into program and arguments.
    pub fn from_command(
        mut command: Vec<String>,
        working_dir: PathBuf,
        log_path: PathBuf,
    ) -> io::Result<Self> {
        if command.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "launch command is empty",
            ));
        }
        let program = command.remove(0);
        Ok(Self {
            program,
            args: command,
            working_dir,
            log_path,
        })
    }
}

/// Starts the wrapper in its own process group so it outlives this invocation.
/// Returns the wrapper's pid.
pub fn launch_detached(spec: &LaunchSpec) -> io::Result<u32> {
    let log = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&spec.log_path)?;
    let log_err = log.try_clone()?;

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .process_group(0)
        .spawn()?;
    let pid = child.id();
    debug!("launched {} {:?} as {}", spec.program, spec.args, pid);

    // Reap the wrapper if it exits while we are still alive (keepalive runs for days).
    std::thread::spawn(move || {
        if let Err(e) = child.wait() {
            warn!("failed to wait for launched process {}: {}", pid, e);
        }
    });
    Ok(pid)
}
