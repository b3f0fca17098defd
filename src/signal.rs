//! Process lifecycle: SIGINT/SIGTERM handling and the single-writer project
//! lock (§5, §9's "single process, single project directory" non-goal).
//!
//! Signal handling sets a flag rather than unwinding anything directly —
//! the coordinator's main loop polls [`shutdown_requested`] between
//! suspension points and drains cooperatively, matching §5's cancellation
//! protocol.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use crate::errors::FatalStateError;

const SIGTERM_GRACE_PERIOD_SECS: u64 = 5;
const KILL_POLL_INTERVAL_MS: u64 = 100;

fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// True once SIGINT or SIGTERM has been delivered to this process.
pub fn shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install SIGINT/SIGTERM handlers that flip the shutdown flag.
///
/// Idempotent: safe to call more than once (re-registers the same flag).
/// Must be called exactly once at coordinator startup per §5.
pub fn install_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("failed to register SIGTERM handler: {e}"))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("failed to register SIGINT handler: {e}"))?;
    Ok(())
}

fn process_group_registry() -> &'static Arc<Mutex<std::collections::HashSet<i32>>> {
    static REGISTRY: OnceLock<Arc<Mutex<std::collections::HashSet<i32>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(Mutex::new(std::collections::HashSet::new())))
}

/// Register a tool-handler's child process group so it can be killed on
/// cancellation (§5: "kills the current tool handler's process group if
/// one is active").
pub fn register_process_group(pgid: i32) {
    if let Ok(mut registry) = process_group_registry().lock() {
        registry.insert(pgid);
    }
}

/// Unregister a process group once its handler has returned normally.
pub fn unregister_process_group(pgid: i32) {
    if let Ok(mut registry) = process_group_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Terminate a single process group: SIGTERM, wait out the grace period,
/// then SIGKILL if it's still alive. Used by a tool handler whose own
/// deadline (not the whole process's shutdown) has expired, as distinct
/// from `kill_all_process_groups`'s shutdown-wide sweep.
pub async fn kill_process_group(pgid: i32) {
    let target = Pid::from_raw(pgid);
    if killpg(target, Signal::SIGTERM).is_err() {
        return;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECS);
    while std::time::Instant::now() < deadline {
        if killpg(target, None).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(KILL_POLL_INTERVAL_MS)).await;
    }

    let _ = killpg(target, Signal::SIGKILL);
}

/// Terminate every registered process group: SIGTERM, wait out the grace
/// period, then SIGKILL any survivors. Called from the coordinator's
/// cancellation path and from an at-exit hook so a crash can't orphan a
/// runtime-test subprocess.
pub async fn kill_all_process_groups() {
    let pgids: Vec<i32> = process_group_registry()
        .lock()
        .map(|r| r.iter().copied().collect())
        .unwrap_or_default();

    if pgids.is_empty() {
        return;
    }

    for pgid in &pgids {
        let _ = killpg(Pid::from_raw(*pgid), Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECS);
    let mut remaining: Vec<i32> = pgids;
    while std::time::Instant::now() < deadline && !remaining.is_empty() {
        tokio::time::sleep(Duration::from_millis(KILL_POLL_INTERVAL_MS)).await;
        remaining.retain(|pgid| killpg(Pid::from_raw(*pgid), None).is_ok());
    }

    for pgid in remaining {
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_group_registry().lock() {
        registry.clear();
    }
}

/// Checks whether a PID is alive by sending signal 0 (no-op delivery).
fn is_pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Exclusive lock over one project's state directory.
///
/// Held for the lifetime of a `Coordinator::run`; released on `Drop` so
/// every exit path — normal completion, an early `?`, or a panic unwound
/// through `main` — frees it.
#[must_use = "the lock is released when ProjectLock is dropped"]
pub struct ProjectLock {
    _file: std::fs::File,
    pid_path: PathBuf,
}

impl std::fmt::Debug for ProjectLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectLock")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

/// Acquire the project lock under `state_dir`, creating the directory if
/// needed. On contention, reads the PID file to give an actionable error
/// naming the holding process if it's still alive.
pub fn try_acquire(state_dir: &Path) -> Result<ProjectLock, FatalStateError> {
    std::fs::create_dir_all(state_dir).map_err(|source| FatalStateError::WriteFailed {
        path: state_dir.to_path_buf(),
        source,
    })?;

    let lock_path = state_dir.join("pipeline.lock");
    let pid_path = state_dir.join("pipeline.pid");

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(|source| FatalStateError::WriteFailed {
            path: lock_path.clone(),
            source,
        })?;

    use fs2::FileExt;
    if file.try_lock_exclusive().is_err() {
        let holder = std::fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        let reason = match holder {
            Some(pid) if is_pid_alive(pid) => format!("held by PID {pid}"),
            Some(pid) => format!(
                "lock file held but recorded PID {pid} is not alive; remove {} to recover",
                lock_path.display()
            ),
            None => format!(
                "lock held by an unknown process; remove {} if stale",
                lock_path.display()
            ),
        };
        return Err(FatalStateError::LockUnavailable {
            path: lock_path,
            reason,
        });
    }

    std::fs::write(&pid_path, std::process::id().to_string()).map_err(|source| {
        FatalStateError::WriteFailed {
            path: pid_path.clone(),
            source,
        }
    })?;

    Ok(ProjectLock {
        _file: file,
        pid_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn is_pid_alive_current_process() {
        assert!(is_pid_alive(std::process::id() as i32));
    }

    #[test]
    fn is_pid_alive_nonexistent() {
        assert!(!is_pid_alive(99_999_999));
    }

    #[test]
    fn try_acquire_succeeds_on_fresh_directory() {
        let dir = tempdir().unwrap();
        let lock = try_acquire(dir.path()).unwrap();
        assert!(dir.path().join("pipeline.pid").exists());
        drop(lock);
        assert!(!dir.path().join("pipeline.pid").exists());
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let dir = tempdir().unwrap();
        let _first = try_acquire(dir.path()).unwrap();
        let second = try_acquire(dir.path());
        assert!(second.is_err());
    }

    #[test]
    fn try_acquire_succeeds_again_after_release() {
        let dir = tempdir().unwrap();
        {
            let _lock = try_acquire(dir.path()).unwrap();
        }
        let relocked = try_acquire(dir.path());
        assert!(relocked.is_ok());
    }

    #[test]
    fn register_and_unregister_process_group_round_trips() {
        register_process_group(424242);
        {
            let registry = process_group_registry().lock().unwrap();
            assert!(registry.contains(&424242));
        }
        unregister_process_group(424242);
        let registry = process_group_registry().lock().unwrap();
        assert!(!registry.contains(&424242));
    }
}
