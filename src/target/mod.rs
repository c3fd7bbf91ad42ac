//! Monitored-target lifecycle: spawning an external command and answering
//! "is this target still alive" once per sampling period.

use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Non-blocking liveness oracle for the monitored target.
///
/// Called by the dispatcher once per sampling period; must not block and
/// must not have side effects visible to the target.
pub trait Liveness: Send + std::fmt::Debug {
    /// True while the target process or thread group still exists.
    fn is_alive(&self) -> bool;
}

/// Probes an operator-specified id with signal 0.
///
/// `EPERM` means the process exists but is owned by someone else, which
/// still counts as alive.
#[derive(Debug)]
pub struct PidProbe {
    pid: u32,
}

impl PidProbe {
    /// Probe the given process or thread-group id.
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

#[cfg(unix)]
impl Liveness for PidProbe {
    fn is_alive(&self) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        matches!(
            kill(Pid::from_raw(self.pid as i32), None),
            Ok(()) | Err(Errno::EPERM)
        )
    }
}

#[cfg(not(unix))]
impl Liveness for PidProbe {
    fn is_alive(&self) -> bool {
        false
    }
}

/// Probes a spawned child with `try_wait`.
///
/// Signal 0 keeps answering "alive" for a zombie we have not reaped, so a
/// child we own is probed through its handle instead; `try_wait` reaps on
/// exit and then reports death.
#[derive(Debug)]
pub struct ChildProbe {
    child: Mutex<Child>,
}

impl ChildProbe {
    /// Probe the given child process handle.
    pub fn new(child: Child) -> Self {
        Self {
            child: Mutex::new(child),
        }
    }
}

impl Liveness for ChildProbe {
    fn is_alive(&self) -> bool {
        match self.child.lock().try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(%status, "monitored command exited");
                false
            }
            Err(e) => {
                warn!(error = %e, "child status probe failed, treating as dead");
                false
            }
        }
    }
}

/// Spawn the monitored command, optionally redirecting its stdout and stderr
/// to `output`. The returned child's pid is the monitoring target.
pub fn spawn_command(argv: &[String], output: Option<&Path>) -> Result<Child> {
    let (program, args) = argv
        .split_first()
        .context("monitored command must not be empty")?;

    let mut cmd = Command::new(program);
    cmd.args(args);

    if let Some(path) = output {
        let stdout = File::create(path)
            .with_context(|| format!("opening command output file {}", path.display()))?;
        let stderr = stdout
            .try_clone()
            .context("duplicating command output handle")?;
        cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("spawning monitored command {program}"))?;

    debug!(pid = child.id(), command = %program, "spawned monitored command");
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_probe_self_is_alive() {
        assert!(PidProbe::new(std::process::id()).is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_pid_probe_bogus_pid_is_dead() {
        // Max pid is bounded well below this on Linux.
        assert!(!PidProbe::new(0x3fff_fff0).is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_child_probe_reports_exit() {
        let child = spawn_command(&["true".to_string()], None).expect("spawn true");
        let probe = ChildProbe::new(child);

        // The child exits almost immediately; poll until the probe agrees.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while probe.is_alive() {
            assert!(
                std::time::Instant::now() < deadline,
                "child never reported dead"
            );
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!probe.is_alive(), "death must be stable once reported");
    }

    #[cfg(unix)]
    #[test]
    fn test_child_probe_running_child_is_alive() {
        let child =
            spawn_command(&["sleep".to_string(), "5".to_string()], None).expect("spawn sleep");
        let probe = ChildProbe::new(child);
        assert!(probe.is_alive());

        // Clean up without waiting the full five seconds.
        let mut child = probe.child.into_inner();
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn test_spawn_empty_command_rejected() {
        assert!(spawn_command(&[], None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_redirects_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.log");

        let child = spawn_command(
            &["echo".to_string(), "hello".to_string()],
            Some(path.as_path()),
        )
        .expect("spawn echo");
        let mut child = child;
        child.wait().expect("echo exits");

        let contents = std::fs::read_to_string(&path).expect("output file");
        assert_eq!(contents.trim(), "hello");
    }
}
