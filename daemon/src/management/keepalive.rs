use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::select;
use tokio::sync::Notify;

use dsfleet_protocol::management::instance::{InstanceId, Intent, LifecycleState};

use crate::app::AppState;
use crate::management::controller::LifecycleController;
use crate::management::lock::InstanceLock;
use crate::storage::files::{read_text, write_text};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Restart,
    Recreate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Operator does not want the instance serving.
    Idle,
    Healthy(LifecycleState),
    Recovered(RecoveryAction),
}

/// Long-running per-instance watchdog that restarts or recreates a failed instance.
pub struct KeepaliveSupervisor {
    state: AppState,
    controller: LifecycleController,
    id: InstanceId,
}

impl KeepaliveSupervisor {
    pub fn new(state: AppState, id: InstanceId) -> Self {
        Self {
            controller: LifecycleController::new(state.clone()),
            state,
            id,
        }
    }

    fn lock_dir(&self) -> PathBuf {
        let config = &self.state.config;
        config.resolve(&config.layout.lock_dir)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.lock_dir().join(format!("keepalive-{}.pid", self.id))
    }

    /// Whether `cmd` is a keepalive invocation for this instance: the number
    /// must directly follow the `keepalive` subcommand.
    fn is_own_supervisor(&self, cmd: &[String]) -> bool {
        cmd.windows(2).any(|pair| {
            pair[0] == "keepalive" && pair[1].parse::<InstanceId>().ok() == Some(self.id)
        })
    }

    fn signal(&self, pid: u32, name: &str, send: impl FnOnce(u32) -> std::io::Result<()>) {
        match send(pid) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!("failed to send {} to keepalive {}: {}", name, pid, e)
            }
            _ => {}
        }
    }

    /// Terminates the supervisor recorded in the pid file, if it is still ours.
    /// Returns whether one was stopped.
    pub fn stop_previous(&self) -> anyhow::Result<bool> {
        let path = self.pid_path();
        let Some(pid) = read_text(&path).and_then(|s| s.parse::<u32>().ok()) else {
            return Ok(false);
        };
        let host = self.state.host.as_ref();
        let running = host
            .find(pid)
            .filter(|p| pid != std::process::id() && self.is_own_supervisor(&p.cmd));
        let stopped = match running {
            Some(_) => {
                info!("stopping previous keepalive {} of instance {}", pid, self.id);
                self.signal(pid, "SIGTERM", |pid| host.terminate(pid));
                let deadline = Instant::now() + self.state.config.keepalive_stop_grace();
                while host.find(pid).is_some() && Instant::now() < deadline {
                    std::thread::sleep(POLL_INTERVAL);
                }
                if host.find(pid).is_some() {
                    warn!("previous keepalive {} ignored SIGTERM, killing it", pid);
                    self.signal(pid, "SIGKILL", |pid| host.kill(pid));
                }
                true
            }
            None => {
                debug!("stale keepalive pid file {}", path.display());
                false
            }
        };
        self.remove_pid();
        Ok(stopped)
    }

    pub fn write_pid(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.lock_dir())?;
        write_text(&self.pid_path(), &std::process::id().to_string())
            .context("failed to write keepalive pid file")
    }

    pub fn remove_pid(&self) {
        if let Err(e) = std::fs::remove_file(self.pid_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove keepalive pid file: {}", e);
            }
        }
    }

    /// One supervision step. The caller holds the instance lock.
    pub fn cycle(&self) -> anyhow::Result<CycleOutcome> {
        let inst = self.controller.instance(self.id);
        if inst.intent() != Some(Intent::Serving) {
            return Ok(CycleOutcome::Idle);
        }
        let status = self.controller.status(self.id)?;
        if !status.needs_recovery() {
            self.controller.apply_priority(self.id)?;
            return Ok(CycleOutcome::Healthy(status));
        }

        info!(
            "Initiating keepalive action for instance {}, server status: {}",
            self.id, status
        );
        let action = if inst.recreate_requested() {
            RecoveryAction::Recreate
        } else {
            RecoveryAction::Restart
        };
        match action {
            RecoveryAction::Recreate => self.controller.recreate(self.id, "keepalive"),
            RecoveryAction::Restart => self.controller.restart(self.id),
        }
        .context("Keepalive failed to recover server")?;
        Ok(CycleOutcome::Recovered(action))
    }

    pub fn run_once(&self) -> anyhow::Result<CycleOutcome> {
        let lock_dir = self.lock_dir();
        let _lock = match InstanceLock::try_acquire(&lock_dir, self.id)? {
            Some(lock) => lock,
            None => {
                debug!("instance {} is busy, waiting for its lock", self.id);
                InstanceLock::acquire(&lock_dir, self.id)?
            }
        };
        self.cycle()
    }

    /// Polls every `period` until `stop` is notified. Cycle errors are logged and
    /// the loop continues.
    pub async fn run(self: Arc<Self>, period: Duration, stop: Arc<Notify>) {
        info!("keepalive of instance {} started, period {:?}", self.id, period);
        loop {
            let supervisor = self.clone();
            let mut wait = period;
            match tokio::task::spawn_blocking(move || supervisor.run_once()).await {
                Ok(Ok(CycleOutcome::Recovered(action))) => {
                    let cooldown = self.state.config.recovery_cooldown();
                    info!(
                        "Keepalive recovered instance {} ({:?}), waiting {:?}",
                        self.id, action, cooldown
                    );
                    wait += cooldown;
                }
                Ok(Ok(outcome)) => debug!("instance {}: {:?}", self.id, outcome),
                Ok(Err(e)) => error!("keepalive of instance {} failed: {:?}", self.id, e),
                Err(e) => error!("keepalive cycle of instance {} panicked: {}", self.id, e),
            }

            select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.notified() => {
                    info!("Keepalive of instance {} terminated", self.id);
                    break;
                }
            }
        }
        self.remove_pid();
    }
}

/// Notifies `stop` on SIGTERM or Ctrl-C.
pub fn watch_termination(stop: Arc<Notify>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        stop.notify_one();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::management::testing::{FakeHost, Fixture};
    use pretty_assertions::assert_eq;
    use std::fs;

    fn id(n: i64) -> InstanceId {
        InstanceId::new(n).unwrap()
    }

    fn supervisor(fixture: &Fixture, host: Arc<FakeHost>, n: i64) -> KeepaliveSupervisor {
        KeepaliveSupervisor::new(fixture.state(host), id(n))
    }

    #[test]
    fn idle_unless_serving_intent() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let sup = supervisor(&fixture, host.clone(), 2);
        assert_eq!(sup.run_once().unwrap(), CycleOutcome::Idle);

        fixture.controller(host.clone()).create(id(2), &fixture.world_zip, "").unwrap();
        assert_eq!(sup.run_once().unwrap(), CycleOutcome::Idle);
        assert!(host.launches().is_empty());
    }

    #[test]
    fn failed_instance_is_restarted() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let controller = fixture.controller(host.clone());
        controller.create(id(3), &fixture.world_zip, "").unwrap();
        controller.start(id(3), false).unwrap();
        let pid = controller.pid(id(3)).unwrap();
        host.state().processes.clear();

        let sup = supervisor(&fixture, host.clone(), 3);
        assert_eq!(
            sup.run_once().unwrap(),
            CycleOutcome::Recovered(RecoveryAction::Restart)
        );
        assert_eq!(host.launches().len(), 2);
        assert_ne!(controller.pid(id(3)), Some(pid));
        assert_eq!(
            sup.run_once().unwrap(),
            CycleOutcome::Healthy(LifecycleState::Starting)
        );
    }

    #[test]
    fn recreate_marker_selects_recreate() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let controller = fixture.controller(host.clone());
        controller.create(id(4), &fixture.world_zip, "").unwrap();
        controller.start(id(4), false).unwrap();
        let inst = controller.instance(id(4));
        fs::write(inst.recreate_marker_path(), "").unwrap();
        fs::create_dir_all(inst.logs_dir()).unwrap();
        fs::write(inst.logs_dir().join("Keen-2026-01-01.log"), "Keen: Exiting\n").unwrap();
        assert_eq!(controller.status(id(4)).unwrap(), LifecycleState::Failed);

        let sup = supervisor(&fixture, host.clone(), 4);
        assert_eq!(
            sup.run_once().unwrap(),
            CycleOutcome::Recovered(RecoveryAction::Recreate)
        );
        assert!(!inst.recreate_requested());
        assert_eq!(fs::read_dir(inst.archive_dir()).unwrap().count(), 1);
        assert_eq!(controller.status(id(4)).unwrap(), LifecycleState::Starting);
    }

    #[test]
    fn healthy_instance_gets_priority_hint() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let controller = fixture.controller(host.clone());
        controller.create(id(5), &fixture.world_zip, "").unwrap();
        controller.start(id(5), false).unwrap();
        fs::write(controller.instance(id(5)).instance_dir().join("priority"), "low").unwrap();

        let sup = supervisor(&fixture, host.clone(), 5);
        assert_eq!(
            sup.run_once().unwrap(),
            CycleOutcome::Healthy(LifecycleState::Starting)
        );
        assert_eq!(host.renices(), vec![(controller.pid(id(5)).unwrap(), 10)]);
    }

    #[test]
    fn previous_supervisor_is_replaced() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let previous = host.add_process(
            vec!["dsfleet".into(), "keepalive".into(), "06".into()],
            100,
        );
        let sup = supervisor(&fixture, host.clone(), 6);
        fs::create_dir_all(sup.lock_dir()).unwrap();
        fs::write(sup.pid_path(), previous.to_string()).unwrap();

        assert!(sup.stop_previous().unwrap());
        assert_eq!(host.signals(), vec![(previous, "TERM")]);
        assert!(!sup.pid_path().exists());
    }

    #[test]
    fn stubborn_supervisor_is_killed() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        host.set_unkillable(true);
        let previous = host.add_process(vec!["dsfleet".into(), "keepalive".into(), "6".into()], 1);
        let sup = supervisor(&fixture, host.clone(), 6);
        fs::create_dir_all(sup.lock_dir()).unwrap();
        fs::write(sup.pid_path(), previous.to_string()).unwrap();

        assert!(sup.stop_previous().unwrap());
        assert_eq!(host.signals(), vec![(previous, "TERM"), (previous, "KILL")]);
    }

    #[test]
    fn period_value_is_not_mistaken_for_the_number() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let other = host.add_process(
            vec!["dsfleet".into(), "keepalive".into(), "3".into(), "-p".into(), "6".into()],
            1,
        );
        let sup = supervisor(&fixture, host.clone(), 6);
        fs::create_dir_all(sup.lock_dir()).unwrap();
        fs::write(sup.pid_path(), other.to_string()).unwrap();

        assert!(!sup.stop_previous().unwrap());
        assert!(host.signals().is_empty());
    }

    #[test]
    fn refused_signal_still_clears_pid_file() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        host.set_unkillable(true);
        host.set_signals_denied(true);
        let previous = host.add_process(vec!["dsfleet".into(), "keepalive".into(), "6".into()], 1);
        let sup = supervisor(&fixture, host.clone(), 6);
        fs::create_dir_all(sup.lock_dir()).unwrap();
        fs::write(sup.pid_path(), previous.to_string()).unwrap();

        assert!(sup.stop_previous().unwrap());
        assert!(host.signals().is_empty());
        assert!(!sup.pid_path().exists());
    }

    #[test]
    fn restart_does_not_need_host_address() {
        let mut fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        fixture.controller(host.clone()).create(id(3), &fixture.world_zip, "").unwrap();
        fixture.config.host_ip = None;
        let state = fixture.state(host.clone());
        LifecycleController::new(state.clone())
            .instance(id(3))
            .write_intent(Intent::Serving)
            .unwrap();

        let sup = KeepaliveSupervisor::new(state.clone(), id(3));
        assert_eq!(
            sup.run_once().unwrap(),
            CycleOutcome::Recovered(RecoveryAction::Restart)
        );
        assert!(state.host_ip.get().is_none());
    }

    #[test]
    fn denied_renice_keeps_cycle_healthy() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let controller = fixture.controller(host.clone());
        controller.create(id(5), &fixture.world_zip, "").unwrap();
        controller.start(id(5), false).unwrap();
        fs::write(controller.instance(id(5)).instance_dir().join("priority"), "high").unwrap();
        host.set_renice_denied(true);

        let sup = supervisor(&fixture, host.clone(), 5);
        assert_eq!(
            sup.run_once().unwrap(),
            CycleOutcome::Healthy(LifecycleState::Starting)
        );
    }

    #[test]
    fn foreign_pid_is_left_alone() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let other = host.add_process(vec!["dsfleet".into(), "keepalive".into(), "7".into()], 1);
        let sup = supervisor(&fixture, host.clone(), 6);
        fs::create_dir_all(sup.lock_dir()).unwrap();
        fs::write(sup.pid_path(), other.to_string()).unwrap();

        assert!(!sup.stop_previous().unwrap());
        assert!(host.signals().is_empty());
        assert!(!sup.pid_path().exists());
    }

    #[tokio::test]
    async fn loop_exits_on_stop_and_removes_pid() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let sup = Arc::new(supervisor(&fixture, host, 8));
        sup.write_pid().unwrap();
        let stop = Arc::new(Notify::new());
        stop.notify_one();

        tokio::time::timeout(
            Duration::from_secs(5),
            sup.clone().run(Duration::from_secs(3600), stop),
        )
        .await
        .unwrap();

        assert!(!sup.pid_path().exists());
    }

    #[tokio::test]
    async fn loop_keeps_polling_after_failed_cycles() {
        let fixture = Fixture::new();
        let host = Arc::new(FakeHost::new());
        let controller = fixture.controller(host.clone());
        controller.create(id(9), &fixture.world_zip, "").unwrap();
        controller.instance(id(9)).write_intent(Intent::Serving).unwrap();
        host.set_launch_fails(true);

        let sup = Arc::new(supervisor(&fixture, host.clone(), 9));
        assert!(sup.run_once().is_err());
        let attempts = host.launches().len();

        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(sup.clone().run(Duration::from_millis(10), stop.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while host.launches().len() < attempts + 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        stop.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
