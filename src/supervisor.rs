use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid};
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::LaunchError;

/// Pause after terminating leftovers so they can release devices and ports
/// before new instances start.
const STALE_SETTLE: Duration = Duration::from_millis(500);

const REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Decides whether a running process belongs to an earlier session of the
/// same game.
#[derive(Clone, Debug)]
pub struct StaleMatcher {
    exe_name: String,
    exe_path: String,
    runtime_path: Option<String>,
}

impl StaleMatcher {
    pub fn new(runtime: Option<&Path>, executable: &Path) -> Self {
        let lower = |p: &Path| p.to_string_lossy().to_lowercase();
        StaleMatcher {
            exe_name: executable
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default(),
            exe_path: lower(executable),
            runtime_path: runtime.map(lower),
        }
    }

    /// `name` is the kernel's process name (`comm`), `cmdline` the space
    /// joined command line. The name check is cheap and runs first.
    pub fn matches(&self, name: &str, cmdline: &str) -> bool {
        if self.exe_name.is_empty() {
            return false;
        }
        let name = name.trim().to_lowercase();
        // comm is cut at 15 bytes, so long executable names only match by prefix
        if name.contains(&self.exe_name)
            || (name.len() == 15 && self.exe_name.starts_with(&name))
        {
            return true;
        }

        let cmdline = cmdline.to_lowercase();
        match &self.runtime_path {
            None => cmdline.contains(&self.exe_path),
            Some(runtime) => cmdline.contains(runtime) && cmdline.contains(&self.exe_path),
        }
    }
}

/// Owns every child process of a session.
///
/// All mutation happens on the control thread; the supervisor is not shared.
pub struct ProcessSupervisor {
    children: HashMap<u32, Child>,
    handled: HashSet<u32>,
    proc_root: PathBuf,
    grace_period: Duration,
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self::with_proc_root(grace_period, PathBuf::from("/proc"))
    }

    pub fn with_proc_root(grace_period: Duration, proc_root: PathBuf) -> Self {
        ProcessSupervisor {
            children: HashMap::new(),
            handled: HashSet::new(),
            proc_root,
            grace_period,
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.children.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn tracked_count(&self) -> usize {
        self.children.len()
    }

    /// Sends SIGTERM to processes left over from an earlier session of the
    /// same game. Walks the process table once; processes already handled by
    /// this supervisor are skipped. Returns how many were signalled.
    pub fn cleanup_stale(&mut self, runtime: Option<&Path>, executable: &Path) -> usize {
        let matcher = StaleMatcher::new(runtime, executable);
        log::info!(
            "Terminating previous instances of '{}'...",
            executable.display()
        );

        let Ok(entries) = std::fs::read_dir(&self.proc_root) else {
            log::warn!("Cannot read {}", self.proc_root.display());
            return 0;
        };
        let own_pid = std::process::id();

        let mut terminated = 0;
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if pid == own_pid || self.handled.contains(&pid) || self.children.contains_key(&pid)
            {
                continue;
            }

            let dir = entry.path();
            // Processes can vanish between listing and reading
            let name = std::fs::read_to_string(dir.join("comm")).unwrap_or_default();
            let cmdline = std::fs::read(dir.join("cmdline"))
                .map(|raw| {
                    String::from_utf8_lossy(&raw)
                        .split('\0')
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            if !matcher.matches(&name, &cmdline) {
                continue;
            }

            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    log::info!("Terminated stale process {pid} ({})", name.trim());
                    self.handled.insert(pid);
                    terminated += 1;
                }
                Err(e) => log::debug!("Could not terminate stale process {pid}: {e}"),
            }
        }

        if terminated > 0 {
            log::info!("Terminated {terminated} previous instance(s)");
            std::thread::sleep(STALE_SETTLE);
        }
        terminated
    }

    /// Spawns `argv` in its own process group with stdout and stderr appended
    /// to `log_path`. Returns as soon as the child exists.
    pub fn launch(
        &mut self,
        argv: &[String],
        log_path: &Path,
        env: &[(String, String)],
    ) -> Result<u32, LaunchError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(LaunchError::Spawn {
                argv0: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| LaunchError::io(log_path, e))?;
        let log_err = log.try_clone().map_err(|e| LaunchError::io(log_path, e))?;

        log::debug!("Launching process with command: {}", argv.join(" "));
        let child = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                argv0: program.clone(),
                source,
            })?;

        let pid = child.id();
        self.children.insert(pid, child);
        Ok(pid)
    }

    /// Whether any tracked process is still running. Exited processes are
    /// dropped from the tracked set.
    pub fn poll_alive(&mut self) -> bool {
        // A zombie still answers the null signal, so reap first
        self.reap_exited();
        self.children
            .retain(|pid, _| kill(Pid::from_raw(*pid as i32), None).is_ok());
        !self.children.is_empty()
    }

    /// SIGTERM to every tracked process group, then SIGKILL to whatever is
    /// left once the grace period ends. Errors are ignored; the tracked set is
    /// empty afterwards.
    pub fn terminate_all(&mut self) {
        if self.children.is_empty() {
            return;
        }
        log::info!("Terminating PIDs: {:?}", self.pids());

        let pids = self.pids();
        for pid in pids {
            match signal_group(pid, Signal::SIGTERM) {
                Ok(()) => {
                    self.handled.insert(pid);
                }
                Err(Errno::ESRCH) => {
                    self.reap(pid);
                }
                Err(e) => log::debug!("SIGTERM to group of {pid} failed: {e}"),
            }
        }

        let deadline = Instant::now() + self.grace_period;
        while !self.children.is_empty() && Instant::now() < deadline {
            self.reap_exited();
            std::thread::sleep(REAP_INTERVAL);
        }

        for pid in self.pids() {
            match signal_group(pid, Signal::SIGKILL) {
                Ok(()) => log::info!("Killed process group {pid}"),
                Err(e) => log::debug!("SIGKILL to group of {pid} failed: {e}"),
            }
            self.reap(pid);
        }
        self.children.clear();
    }

    fn reap_exited(&mut self) {
        self.children.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                log::info!("Process {pid} exited: {status}");
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::debug!("Failed to query process {pid}: {e}");
                true
            }
        });
    }

    /// Collects the exit status of a killed child, waiting briefly.
    fn reap(&mut self, pid: u32) {
        let Some(mut child) = self.children.remove(&pid) else {
            return;
        };
        for _ in 0..20 {
            if !matches!(child.try_wait(), Ok(None)) {
                return;
            }
            std::thread::sleep(REAP_INTERVAL);
        }
        log::warn!("Process {pid} did not exit after SIGKILL");
    }
}

fn signal_group(pid: u32, signal: Signal) -> Result<(), Errno> {
    let pgid = getpgid(Some(Pid::from_raw(pid as i32)))?;
    killpg(pgid, signal)
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }

    /// Alive and not a zombie.
    fn running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[test]
    fn matcher_checks_name_before_command_line() {
        let m = StaleMatcher::new(None, Path::new("/games/hk/Hollow Knight.x86_64"));
        assert!(m.matches("Hollow Knight.x", ""));
        assert!(m.matches("bash", "/games/hk/hollow knight.x86_64 --foo"));
        assert!(!m.matches("bash", "/games/other/game"));
    }

    #[test]
    fn matcher_with_runtime_needs_both_paths() {
        let m = StaleMatcher::new(
            Some(Path::new("/steam/Proton 9.0/proton")),
            Path::new("/games/drg/FSD.exe"),
        );
        assert!(m.matches("fsd.exe", ""));
        assert!(m.matches(
            "python3",
            "python3 /steam/Proton 9.0/proton run /games/drg/FSD.exe"
        ));
        assert!(!m.matches("python3", "python3 /steam/Proton 9.0/proton run /other.exe"));
        assert!(!m.matches("wine", "/games/drg/FSD.exe"));
    }

    #[test]
    fn matcher_without_executable_name_never_matches() {
        let m = StaleMatcher::new(None, Path::new("/"));
        assert!(!m.matches("anything", "/ anything"));
    }

    #[test]
    fn launch_then_terminate_converges_to_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_millis(200));
        let pid = sup
            .launch(&argv(&["sleep", "30"]), &tmp.path().join("a.log"), &[])
            .unwrap();
        assert_eq!(sup.pids(), vec![pid]);
        assert!(sup.poll_alive());

        sup.terminate_all();
        assert_eq!(sup.tracked_count(), 0);
        assert!(!sup.poll_alive());
        assert!(!running(pid));

        // Second call has nothing to do
        sup.terminate_all();
        assert_eq!(sup.tracked_count(), 0);
    }

    #[test]
    fn terminate_reaches_the_whole_process_group() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("group.log");
        let mut sup = ProcessSupervisor::new(Duration::from_millis(500));
        sup.launch(&argv(&["sh", "-c", "sleep 30 & echo $!; wait"]), &log, &[])
            .unwrap();

        let mut grandchild = None;
        assert!(wait_until(|| {
            grandchild = std::fs::read_to_string(&log)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            grandchild.is_some()
        }));
        let grandchild = grandchild.unwrap();
        assert!(running(grandchild));

        sup.terminate_all();
        assert!(wait_until(|| !running(grandchild)));
    }

    #[test]
    fn poll_alive_drops_exited_processes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_millis(200));
        sup.launch(&argv(&["true"]), &tmp.path().join("t.log"), &[])
            .unwrap();
        assert!(wait_until(|| !sup.poll_alive()));
        assert_eq!(sup.tracked_count(), 0);
    }

    #[test]
    fn output_and_environment_reach_the_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("out.log");
        std::fs::write(&log, "previous run\n").unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_millis(200));
        sup.launch(
            &argv(&["sh", "-c", "echo out=$PLAYER_TAG; echo err >&2"]),
            &log,
            &[("PLAYER_TAG".to_string(), "p2".to_string())],
        )
        .unwrap();
        assert!(wait_until(|| !sup.poll_alive()));

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.starts_with("previous run\n"));
        assert!(contents.contains("out=p2"));
        assert!(contents.contains("err"));
    }

    #[test]
    fn spawn_failure_is_reported_and_not_tracked() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sup = ProcessSupervisor::new(Duration::from_millis(200));
        let err = sup
            .launch(
                &argv(&["/nonexistent/splitcoop-missing-binary"]),
                &tmp.path().join("x.log"),
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(sup.launch(&[], &tmp.path().join("y.log"), &[]).is_err());
        assert_eq!(sup.tracked_count(), 0);
    }

    #[test]
    fn cleanup_stale_signals_each_match_once() {
        let fake_proc = tempfile::tempdir().unwrap();
        let mut stale = Command::new("sleep").arg("300").spawn().unwrap();
        let mut bystander = Command::new("sleep").arg("300").spawn().unwrap();

        let write_entry = |pid: u32, comm: &str, cmdline: &str| {
            let dir = fake_proc.path().join(pid.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
            std::fs::write(dir.join("cmdline"), cmdline.replace(' ', "\0")).unwrap();
        };
        write_entry(stale.id(), "wine64", "wine64 /games/coop/CoopGame.exe -windowed");
        write_entry(bystander.id(), "sleep", "sleep 300");
        std::fs::create_dir_all(fake_proc.path().join("self")).unwrap();

        let mut sup = ProcessSupervisor::with_proc_root(
            Duration::from_millis(200),
            fake_proc.path().to_path_buf(),
        );
        let exe = Path::new("/games/coop/CoopGame.exe");
        assert_eq!(sup.cleanup_stale(None, exe), 1);
        assert_eq!(sup.cleanup_stale(None, exe), 0);

        let status = stale.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        assert!(bystander.try_wait().unwrap().is_none());
        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }
}
