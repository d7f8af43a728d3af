//! Process management - Spawning and controlling idle processes

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::app::{App, AppId};

/// File name of the per-game idle executable
pub const IDLE_EXE_NAME: &str = "cardboost-idle";

/// Errors raised by the process supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("idle executable not found: {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("failed to spawn idle process for app {appid}: {source}")]
    Spawn {
        appid: AppId,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to kill process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a successful kill request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    /// The process had already exited on its own
    AlreadyExited,
}

/// Launches and controls one process per idled game
pub trait Supervisor: Send + 'static {
    type Handle: Send;

    fn spawn(&mut self, app: &App) -> Result<Self::Handle, SupervisorError>;

    /// Kill a process. Killing an exited process is not an error.
    fn kill(&mut self, handle: &mut Self::Handle) -> Result<KillOutcome, SupervisorError>;

    fn is_alive(&mut self, handle: &mut Self::Handle) -> bool;
}

/// A running idle process
#[derive(Debug)]
pub struct IdleProcess {
    pub appid: AppId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    child: Child,
}

/// Spawns the idle executable for each game
pub struct ProcessSupervisor {
    executable: PathBuf,
    parent_pid: u32,
}

impl ProcessSupervisor {
    pub fn new(executable: PathBuf) -> Self {
        Self {
            executable,
            parent_pid: std::process::id(),
        }
    }

    /// The idle executable shipped next to the running binary
    pub fn default_executable() -> PathBuf {
        let file_name = format!("{}{}", IDLE_EXE_NAME, std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
            .unwrap_or_else(|| PathBuf::from(file_name))
    }
}

impl Supervisor for ProcessSupervisor {
    type Handle = IdleProcess;

    fn spawn(&mut self, app: &App) -> Result<IdleProcess, SupervisorError> {
        if !self.executable.exists() {
            return Err(SupervisorError::MissingExecutable(self.executable.clone()));
        }

        let mut cmd = Command::new(&self.executable);
        if let Some(parent) = self.executable.parent() {
            cmd.current_dir(parent);
        }

        // The child exits on its own once this process is gone
        cmd.arg(app.appid.to_string())
            .arg(self.parent_pid.to_string())
            .env("SteamAppId", app.appid.to_string());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                appid: app.appid,
                source,
            })?;

        let pid = child.id();
        info!("Spawned idle process for '{}' with PID {}", app.display_name(), pid);

        Ok(IdleProcess {
            appid: app.appid,
            pid,
            started_at: Utc::now(),
            child,
        })
    }

    fn kill(&mut self, handle: &mut IdleProcess) -> Result<KillOutcome, SupervisorError> {
        if !self.is_alive(handle) {
            warn!(
                "Idle process {} for app {} had already exited",
                handle.pid, handle.appid
            );
            return Ok(KillOutcome::AlreadyExited);
        }

        if let Err(source) = handle.child.kill() {
            // Lost a race with a natural exit
            if matches!(handle.child.try_wait(), Ok(Some(_))) {
                warn!("Idle process {} exited while being killed", handle.pid);
                return Ok(KillOutcome::AlreadyExited);
            }
            return Err(SupervisorError::Kill {
                pid: handle.pid,
                source,
            });
        }

        if let Err(e) = handle.child.wait() {
            warn!("Failed to reap idle process {}: {}", handle.pid, e);
        }
        let ran_for = Utc::now().signed_duration_since(handle.started_at);
        info!(
            "Killed idle process {} for app {} after {} minutes",
            handle.pid,
            handle.appid,
            ran_for.num_minutes()
        );
        Ok(KillOutcome::Killed)
    }

    fn is_alive(&mut self, handle: &mut IdleProcess) -> bool {
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    warn!("Idle process {} exited with status: {}", handle.pid, status);
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!("Error checking idle process {}: {}", handle.pid, e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Handle issued by [`FakeSupervisor`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FakeHandle {
        pub id: u32,
        pub appid: AppId,
    }

    /// In-memory supervisor. Tests flip liveness through `dead`.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSupervisor {
        pub spawned: Arc<Mutex<Vec<FakeHandle>>>,
        pub killed: Arc<Mutex<Vec<u32>>>,
        pub dead: Arc<Mutex<HashSet<u32>>>,
        pub fail_kill: Arc<Mutex<HashSet<AppId>>>,
        pub fail_spawn: Arc<Mutex<HashSet<AppId>>>,
    }

    impl FakeSupervisor {
        pub fn spawn_count(&self, appid: AppId) -> usize {
            self.spawned
                .lock()
                .unwrap()
                .iter()
                .filter(|h| h.appid == appid)
                .count()
        }

        pub fn mark_dead(&self, id: u32) {
            self.dead.lock().unwrap().insert(id);
        }
    }

    impl Supervisor for FakeSupervisor {
        type Handle = FakeHandle;

        fn spawn(&mut self, app: &App) -> Result<FakeHandle, SupervisorError> {
            if self.fail_spawn.lock().unwrap().contains(&app.appid) {
                return Err(SupervisorError::Spawn {
                    appid: app.appid,
                    source: std::io::Error::other("spawn refused"),
                });
            }
            let mut spawned = self.spawned.lock().unwrap();
            let handle = FakeHandle {
                id: spawned.len() as u32 + 1,
                appid: app.appid,
            };
            spawned.push(handle);
            Ok(handle)
        }

        fn kill(&mut self, handle: &mut FakeHandle) -> Result<KillOutcome, SupervisorError> {
            if self.fail_kill.lock().unwrap().contains(&handle.appid) {
                return Err(SupervisorError::Kill {
                    pid: handle.id,
                    source: std::io::Error::other("access denied"),
                });
            }
            self.killed.lock().unwrap().push(handle.id);
            if self.dead.lock().unwrap().insert(handle.id) {
                Ok(KillOutcome::Killed)
            } else {
                Ok(KillOutcome::AlreadyExited)
            }
        }

        fn is_alive(&mut self, handle: &mut FakeHandle) -> bool {
            !self.dead.lock().unwrap().contains(&handle.id)
        }
    }

    #[test]
    fn missing_executable_is_reported() {
        let mut supervisor = ProcessSupervisor::new(PathBuf::from("/nonexistent/cardboost-idle"));
        let err = supervisor.spawn(&App::new(AppId(730), "CS")).unwrap_err();
        assert!(matches!(err, SupervisorError::MissingExecutable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn kill_is_idempotent() {
        // `sleep 730 <pid>` sums its arguments, which keeps it alive long enough
        let sleep = PathBuf::from("/bin/sleep");
        if !sleep.exists() {
            return;
        }
        let mut supervisor = ProcessSupervisor::new(sleep);
        let mut process = supervisor.spawn(&App::new(AppId(730), "CS")).unwrap();

        assert!(supervisor.is_alive(&mut process));
        assert_eq!(supervisor.kill(&mut process).unwrap(), KillOutcome::Killed);
        assert!(!supervisor.is_alive(&mut process));
        assert_eq!(
            supervisor.kill(&mut process).unwrap(),
            KillOutcome::AlreadyExited
        );
    }
}
