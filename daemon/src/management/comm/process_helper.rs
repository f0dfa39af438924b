use std::collections::HashSet;
use std::fs;
use std::io;

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

const UDP_TABLES: [&str; 2] = ["/proc/net/udp", "/proc/net/udp6"];

pub struct ProcessHelper;

impl ProcessHelper {
    /// Sends SIGTERM to the process with the given ID.
    pub fn stop(pid: u32) -> io::Result<()> {
        Self::signal(pid, Signal::SIGTERM)
    }

    /// Forcefully kills the process with SIGKILL.
    pub fn kill(pid: u32) -> io::Result<()> {
        Self::signal(pid, Signal::SIGKILL)
    }

    /// A process that already exited reports `NotFound`.
    fn signal(pid: u32, signal: Signal) -> io::Result<()> {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("process {} not found", pid),
            )),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// Sets the scheduling priority (nice level) of a process.
    pub fn renice(pid: u32, nice: i32) -> io::Result<()> {
        // SAFETY: setpriority takes plain integers and touches no memory of ours.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Whether `pid` owns a UDP socket bound to local `port`, on IPv4 or IPv6.
    pub fn udp_port_bound(pid: u32, port: u16) -> bool {
        let owned = match Self::socket_inodes(pid) {
            Ok(inodes) => inodes,
            Err(e) => {
                debug!("cannot list sockets of {}: {}", pid, e);
                return false;
            }
        };
        if owned.is_empty() {
            return false;
        }
        UDP_TABLES.iter().any(|table| match fs::read_to_string(table) {
            Ok(content) => !udp_inodes_on_port(&content, port).is_disjoint(&owned),
            Err(_) => false,
        })
    }

    fn socket_inodes(pid: u32) -> io::Result<HashSet<u64>> {
        let mut result = HashSet::new();
        for entry in fs::read_dir(format!("/proc/{}/fd", pid))? {
            let Ok(target) = fs::read_link(entry?.path()) else {
                continue;
            };
            if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                result.insert(inode);
            }
        }
        Ok(result)
    }
}

/// `socket:[12345]` -> `12345`.
fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Inodes of the sockets in a `/proc/net/udp{,6}` table whose local port is `port`.
pub fn udp_inodes_on_port(table: &str, port: u16) -> HashSet<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let (_, hex_port) = local.rsplit_once(':')?;
            if u16::from_str_radix(hex_port, 16).ok()? != port {
                return None;
            }
            fields.get(9)?.parse().ok()
        })
        .collect()
}
