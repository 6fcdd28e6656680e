use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::LaunchConfig;
use crate::error::LaunchError;
use crate::input::DeviceAllocator;
use crate::instance::*;
use crate::profile::Profile;
use crate::sandbox::{InstanceEnvironment, SandboxCommandBuilder};
use crate::supervisor::ProcessSupervisor;
use crate::util::*;

const CANCEL_CHECK: Duration = Duration::from_millis(100);

/// Stop request shared between the signal handler and the control thread.
/// The handler only flips the flag; every wait in a session observes it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns `false` when the
    /// sleep was cut short.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(CANCEL_CHECK.min(deadline - now));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    DependenciesValidated,
    InstancesCreated,
    Launching,
    Monitoring,
    Terminated,
}

#[derive(Clone, Debug)]
pub struct LaunchedInstance {
    pub index: usize,
    pub pid: u32,
    pub prefix_dir: PathBuf,
    pub log_path: PathBuf,
}

/// Outcome of a session that got past the fatal checks.
#[derive(Debug)]
pub struct RunReport {
    pub requested: usize,
    pub launched: Vec<LaunchedInstance>,
    pub failed: Vec<(usize, String)>,
    pub cancelled: bool,
    /// Orchestrator state when the run returned.
    pub state: RunState,
}

impl RunReport {
    fn new(requested: usize) -> Self {
        RunReport {
            requested,
            launched: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
            state: RunState::Idle,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.launched.len() == self.requested
    }
}

/// Drives one session: validate, create instances, launch them with a
/// stagger, then supervise until every instance has exited or a stop is
/// requested.
pub struct Orchestrator {
    cfg: LaunchConfig,
    resolver: RuntimeResolver,
    supervisor: ProcessSupervisor,
    cancel: CancelToken,
    state: RunState,
}

impl Orchestrator {
    pub fn new(cfg: LaunchConfig, resolver: RuntimeResolver, cancel: CancelToken) -> Self {
        let supervisor = ProcessSupervisor::new(cfg.grace_period());
        Orchestrator {
            cfg,
            resolver,
            supervisor,
            cancel,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn tracked_processes(&self) -> usize {
        self.supervisor.tracked_count()
    }

    pub fn validate_dependencies(&mut self) -> Result<(), LaunchError> {
        log::info!("Validating dependencies...");
        for cmd in self.cfg.required_commands() {
            match which::which(cmd) {
                Ok(path) => log::debug!("Found {cmd} at {}", path.display()),
                Err(_) => return Err(LaunchError::Dependency(cmd.to_string())),
            }
        }
        self.state = RunState::DependenciesValidated;
        Ok(())
    }

    /// Runs a full session. Fatal errors come back before any process is
    /// spawned; per-instance failures end up in the report.
    pub fn run(&mut self, profile: &Profile) -> Result<RunReport, LaunchError> {
        self.validate_dependencies()?;
        let executable = profile.require_executable()?.to_path_buf();

        let runtime = match profile.runtime_version() {
            Some(version) => Some(self.resolver.resolve(version)?),
            None => None,
        };
        if profile.is_native() {
            log::info!("'{}' runs natively", profile.game_name());
        }

        let _lock = SessionLock::acquire(&self.cfg.lock_dir, profile.game_name())?;

        self.supervisor.cleanup_stale(
            runtime.as_ref().map(|rt| rt.executable.as_path()),
            &executable,
        );

        let mut report = RunReport::new(profile.effective_player_count());
        let mut instances = self.create_instances(profile)?;

        if self.cancel.is_cancelled() {
            log::info!("Stop requested before launch, nothing to terminate");
            report.cancelled = true;
            self.state = RunState::Terminated;
            report.state = self.state;
            return Ok(report);
        }

        self.state = RunState::Launching;
        log::info!(
            "Launching {} instance(s) of '{}'...",
            instances.len(),
            profile.game_name()
        );
        let count = instances.len();
        for (i, instance) in instances.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.launch_instance(profile, instance, runtime.as_ref()) {
                Ok(pid) => {
                    instance.pid = Some(pid);
                    log::info!("Instance {} started with PID {pid}", instance.index);
                    report.launched.push(LaunchedInstance {
                        index: instance.index,
                        pid,
                        prefix_dir: instance.prefix_dir.clone(),
                        log_path: instance.log_path.clone(),
                    });
                }
                Err(e) => {
                    log::error!("Instance {} failed to launch: {e}", instance.index);
                    report.failed.push((instance.index, e.to_string()));
                }
            }
            if i + 1 < count && !self.cancel.sleep(self.cfg.stagger_delay()) {
                break;
            }
        }

        if self.cancel.is_cancelled() {
            log::info!("Stop requested during launch. Terminating instances...");
            self.terminate();
            report.cancelled = true;
            report.state = self.state;
            return Ok(report);
        }

        log::info!(
            "Launched {} of {} instance(s), PIDs: {:?}",
            report.launched.len(),
            report.requested,
            instances.iter().filter_map(|i| i.pid).collect::<Vec<_>>()
        );
        report.cancelled = self.monitor();
        report.state = self.state;
        Ok(report)
    }

    /// Allocates instances and assigns their prefix and log paths. Devices
    /// already claimed by an earlier instance are not handed out again.
    ///
    /// Only the shared base directories exist afterwards. Each prefix is
    /// created by `launch_instance` and removed again if that launch fails,
    /// so after launching there is one prefix per running instance.
    fn create_instances(&mut self, profile: &Profile) -> Result<Vec<Instance>, LaunchError> {
        create_dir(&self.cfg.log_dir)?;
        create_dir(&self.cfg.prefix_dir)?;

        let mut claimed: HashSet<PathBuf> = HashSet::new();
        let mut instances = Vec::new();
        for (slot, index) in profile.players_to_launch().into_iter().enumerate() {
            let mut instance = Instance::new(
                profile,
                index,
                slot + 1,
                &self.cfg.prefix_dir,
                &self.cfg.log_dir,
            );

            let mut devices = DeviceAllocator::devices_for(profile, index);
            for node in [&mut devices.joystick, &mut devices.mouse, &mut devices.keyboard] {
                let Some(path) = node.as_ref() else {
                    continue;
                };
                let key = path.canonicalize().unwrap_or_else(|_| path.clone());
                if !claimed.insert(key) {
                    log::warn!(
                        "Instance {index}: {} already belongs to another instance, running without it",
                        path.display()
                    );
                    *node = None;
                }
            }
            instance.devices = devices;
            instances.push(instance);
        }

        self.state = RunState::InstancesCreated;
        Ok(instances)
    }

    fn launch_instance(
        &mut self,
        profile: &Profile,
        instance: &Instance,
        runtime: Option<&ProtonInstall>,
    ) -> Result<u32, LaunchError> {
        log::info!("Preparing instance {}...", instance.index);
        let fresh_prefix = !instance.prefix_dir.exists();
        create_dir(&instance.prefix_dir)?;
        if runtime.is_some() {
            create_dir(&instance.prefix_dir.join("pfx"))?;
        }

        let env = InstanceEnvironment::prepare(profile, instance, runtime, &self.cfg);
        let argv = SandboxCommandBuilder::new(&self.cfg).build(
            profile,
            instance,
            runtime.map(|rt| rt.executable.as_path()),
        );
        log::info!(
            "Launching instance {} (Log: {})",
            instance.index,
            instance.log_path.display()
        );
        log::debug!("Instance {}: {}", instance.index, argv.join(" "));
        let result = self.supervisor.launch(&argv, &instance.log_path, &env.vars());
        if result.is_err() && fresh_prefix {
            // Only instances that actually run keep a prefix
            let _ = std::fs::remove_dir_all(&instance.prefix_dir);
        }
        result
    }

    /// Polls until every instance has exited or a stop is requested. Returns
    /// whether the session was cancelled.
    pub fn monitor(&mut self) -> bool {
        self.state = RunState::Monitoring;
        let mut cancelled = false;
        while self.supervisor.poll_alive() {
            if !self.cancel.sleep(self.cfg.poll_interval()) {
                log::info!("Received stop request. Terminating instances...");
                cancelled = true;
                break;
            }
        }
        self.terminate();
        if !cancelled {
            log::info!("All instances have terminated");
        }
        cancelled
    }

    pub fn terminate(&mut self) {
        self.supervisor.terminate_all();
        self.state = RunState::Terminated;
    }
}

fn create_dir(path: &std::path::Path) -> Result<(), LaunchError> {
    std::fs::create_dir_all(path).map_err(|e| LaunchError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::test_spec;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> LaunchConfig {
        LaunchConfig {
            compositor_command: "true".to_string(),
            sandbox_command: "true".to_string(),
            prefix_dir: tmp.path().join("prefixes"),
            log_dir: tmp.path().join("logs"),
            lock_dir: tmp.path().join("locks"),
            stagger_delay_ms: 10,
            poll_interval_ms: 20,
            grace_period_ms: 100,
            ..LaunchConfig::default()
        }
    }

    fn orchestrator(cfg: LaunchConfig) -> Orchestrator {
        Orchestrator::new(
            cfg,
            RuntimeResolver::with_roots(Vec::new()),
            CancelToken::new(),
        )
    }

    #[test]
    fn two_player_session_runs_to_termination() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let profile = Profile::new(test_spec(2)).unwrap();
        let mut orch = orchestrator(cfg.clone());
        assert_eq!(orch.state(), RunState::Idle);

        let report = orch.run(&profile).unwrap();
        assert_eq!(report.requested, 2);
        assert_eq!(report.launched.len(), 2);
        assert!(report.failed.is_empty());
        assert!(report.is_complete());
        assert!(!report.cancelled);
        assert_eq!(report.state, RunState::Terminated);
        assert_eq!(orch.state(), RunState::Terminated);
        assert_eq!(orch.tracked_processes(), 0);

        let prefixes: Vec<_> = report.launched.iter().map(|l| l.prefix_dir.clone()).collect();
        assert_eq!(
            prefixes,
            vec![
                cfg.prefix_dir.join("Test_Game_instance_1"),
                cfg.prefix_dir.join("Test_Game_instance_2"),
            ]
        );
        assert!(prefixes.iter().all(|p| p.is_dir()));
        // Native titles get no Wine prefix
        assert!(!prefixes[0].join("pfx").exists());
        // The session lock is gone once the run ends
        assert!(!cfg.lock_dir.join("Test_Game.lock").exists());
    }

    #[test]
    fn missing_dependency_aborts_before_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(&tmp);
        cfg.sandbox_command = "splitcoop-missing-sandbox-wrapper".to_string();
        let profile = Profile::new(test_spec(2)).unwrap();
        let mut orch = orchestrator(cfg.clone());

        let err = orch.run(&profile).unwrap_err();
        assert!(matches!(err, LaunchError::Dependency(cmd) if cmd == "splitcoop-missing-sandbox-wrapper"));
        assert_eq!(orch.state(), RunState::Idle);
        assert!(!cfg.prefix_dir.exists());
    }

    #[test]
    fn unknown_runtime_aborts_before_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let mut spec = test_spec(2);
        spec.runtime_version = Some("GE-Proton-does-not-exist".to_string());
        let profile = Profile::new(spec).unwrap();
        let mut orch = orchestrator(cfg.clone());

        let err = orch.run(&profile).unwrap_err();
        assert!(matches!(err, LaunchError::RuntimeNotFound(_)));
        assert!(!cfg.prefix_dir.exists());
        assert_eq!(orch.tracked_processes(), 0);
    }

    #[test]
    fn runtime_session_creates_wine_prefixes() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let steam = tmp.path().join("steam");
        let proton_dir = steam.join("compatibilitytools.d/GE-Proton9-20");
        std::fs::create_dir_all(&proton_dir).unwrap();
        std::fs::write(proton_dir.join("proton"), "").unwrap();

        let mut spec = test_spec(1);
        spec.runtime_version = Some("GE-Proton9-20".to_string());
        let profile = Profile::new(spec).unwrap();
        let mut orch = Orchestrator::new(
            cfg.clone(),
            RuntimeResolver::with_roots([steam]),
            CancelToken::new(),
        );

        let report = orch.run(&profile).unwrap();
        assert_eq!(report.launched.len(), 1);
        assert!(report.launched[0].prefix_dir.join("pfx").is_dir());
    }

    #[test]
    fn missing_executable_is_a_profile_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = test_spec(2);
        spec.executable_path = None;
        let profile = Profile::new(spec).unwrap();
        let mut orch = orchestrator(test_config(&tmp));
        assert!(matches!(
            orch.run(&profile),
            Err(LaunchError::ProfileInvalid(_))
        ));
    }

    #[test]
    fn one_failed_instance_does_not_stop_the_others() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        // A directory where the log file should go makes the launch fail
        std::fs::create_dir_all(cfg.log_dir.join("Test_Game_instance_2.log")).unwrap();
        let profile = Profile::new(test_spec(3)).unwrap();
        let mut orch = orchestrator(cfg.clone());

        let report = orch.run(&profile).unwrap();
        let launched: Vec<_> = report.launched.iter().map(|l| l.index).collect();
        assert_eq!(launched, vec![1, 3]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 2);
        assert!(!report.is_complete());
        assert!(cfg.prefix_dir.join("Test_Game_instance_1").is_dir());
        assert!(!cfg.prefix_dir.join("Test_Game_instance_2").exists());
        assert_eq!(orch.state(), RunState::Terminated);
    }

    #[test]
    fn selected_players_keep_their_numbers() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(&tmp);
        let mut spec = test_spec(4);
        spec.selected_players = vec![2, 4];
        let profile = Profile::new(spec).unwrap();
        let mut orch = orchestrator(cfg.clone());

        let report = orch.run(&profile).unwrap();
        assert_eq!(report.requested, 2);
        let launched: Vec<_> = report.launched.iter().map(|l| l.index).collect();
        assert_eq!(launched, vec![2, 4]);
        assert!(cfg.prefix_dir.join("Test_Game_instance_4").is_dir());
        assert!(!cfg.prefix_dir.join("Test_Game_instance_1").exists());
    }

    #[test]
    fn shared_device_goes_to_the_first_instance_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = test_spec(2);
        spec.per_player_device_ids = vec!["/dev/null".to_string(), "/dev/null".to_string()];
        let profile = Profile::new(spec).unwrap();
        let mut orch = orchestrator(test_config(&tmp));

        let instances = orch.create_instances(&profile).unwrap();
        assert_eq!(instances[0].devices.joystick, Some(PathBuf::from("/dev/null")));
        assert_eq!(instances[1].devices.joystick, None);
        assert_eq!(orch.state(), RunState::InstancesCreated);
    }

    #[test]
    fn stop_before_launch_spawns_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut orch = Orchestrator::new(
            test_config(&tmp),
            RuntimeResolver::with_roots(Vec::new()),
            cancel,
        );
        let report = orch.run(&Profile::new(test_spec(2)).unwrap()).unwrap();
        assert!(report.cancelled);
        assert!(report.launched.is_empty());
        assert_eq!(orch.state(), RunState::Terminated);
    }

    #[test]
    fn stop_during_monitoring_terminates_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let mut orch = Orchestrator::new(
            test_config(&tmp),
            RuntimeResolver::with_roots(Vec::new()),
            cancel.clone(),
        );
        orch.supervisor
            .launch(
                &["sleep".to_string(), "30".to_string()],
                &tmp.path().join("sleep.log"),
                &[],
            )
            .unwrap();

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let started = Instant::now();
        assert!(orch.monitor());
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(orch.tracked_processes(), 0);
        assert_eq!(orch.state(), RunState::Terminated);
    }

    #[test]
    fn stop_during_stagger_terminates_launched_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let wrapper = tmp.path().join("fake-sandbox");
        // Written from a child process so no open write handle leaks into
        // concurrent spawns
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!(
                "printf '#!/bin/sh\\nexec sleep 30\\n' > '{0}' && chmod 755 '{0}'",
                wrapper.display()
            ))
            .status()
            .unwrap();
        assert!(status.success());

        let mut cfg = test_config(&tmp);
        cfg.sandbox_command = wrapper.to_string_lossy().into_owned();
        cfg.stagger_delay_ms = 30_000;
        let cancel = CancelToken::new();
        let mut orch = Orchestrator::new(
            cfg,
            RuntimeResolver::with_roots(Vec::new()),
            cancel.clone(),
        );

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(500));
            cancel.cancel();
        });
        let started = Instant::now();
        let report = orch.run(&Profile::new(test_spec(2)).unwrap()).unwrap();
        stopper.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(report.cancelled);
        assert_eq!(report.launched.len(), 1);
        assert_eq!(report.launched[0].index, 1);
        assert_eq!(report.state, RunState::Terminated);
        assert_eq!(orch.tracked_processes(), 0);
        let pid = report.launched[0].pid;
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn cancel_token_cuts_sleep_short() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)));
        token.cancel();
        assert!(!token.sleep(Duration::from_secs(30)));
    }
}
