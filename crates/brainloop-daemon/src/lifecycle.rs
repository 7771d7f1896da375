//! Worker lifecycle: single-instance lock, working-directory validation,
//! heartbeat, and the three-phase graceful shutdown of §4.13.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use brainloop_core::{Timestamp, WorkerId};
use brainloop_storage::Databases;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::sync::Notify;

use crate::error::{DaemonError, DaemonResult};
use crate::reader_cache::ReaderCache;

/// Heartbeat rows older than this many seconds (relative to another
/// worker's tick) are reaped as zombies.
const STALE_AFTER_SECS: i64 = 120;

/// Required on-disk files a workspace must already contain, per §6's
/// on-disk layout (schema files accompany each database).
const REQUIRED_FILES: &[&str] = &[
    "lifecycle.db",
    "output.db",
    "metadata.db",
    "command_security.db",
    "input.db",
];

/// Validate that `workspace_root` looks like a previously-initialized
/// brainloop workspace and (optionally) that its directory name contains
/// `project_identifier`.
///
/// # Errors
///
/// Returns [`DaemonError::MissingSchemaFile`] if a required database file
/// is absent, or [`DaemonError::ProjectNameMismatch`] if the project-name
/// check is enabled and fails.
pub fn validate_working_directory(
    workspace_root: &Path,
    data_dir: &Path,
    require_project_name: bool,
    project_identifier: &str,
) -> DaemonResult<()> {
    for file in REQUIRED_FILES {
        if !data_dir.join(file).exists() {
            return Err(DaemonError::MissingSchemaFile(file.to_string()));
        }
    }

    if require_project_name {
        let dir_name = workspace_root.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !dir_name.contains(project_identifier) {
            return Err(DaemonError::ProjectNameMismatch(project_identifier.to_string()));
        }
    }

    Ok(())
}

/// Holds the exclusive `brainloop.lock` file for the process lifetime.
/// The lock is removed explicitly during shutdown phase 3, not on
/// `Drop` — a crashed process intentionally leaves the lock behind so the
/// next start can distinguish "stale" from "never ran".
pub struct LockHandle {
    path: PathBuf,
}

/// Acquire the single-instance lock at `lock_path`, writing the current
/// PID into it. If the file already exists, test the recorded PID's
/// liveness via signal 0: a live PID aborts startup, a dead one is
/// reclaimed (the stale file is removed and lock acquisition retried
/// once).
///
/// # Errors
///
/// Returns [`DaemonError::AlreadyRunning`] if a live process holds the
/// lock, or [`DaemonError::Lock`] for any other I/O failure.
pub fn acquire_lock(lock_path: &Path) -> DaemonResult<LockHandle> {
    match create_lock_file(lock_path) {
        Ok(()) => Ok(LockHandle { path: lock_path.to_path_buf() }),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let held_pid = read_lock_pid(lock_path)?;
            if process_is_alive(held_pid) {
                Err(DaemonError::AlreadyRunning(held_pid))
            } else {
                std::fs::remove_file(lock_path).map_err(|e| DaemonError::Lock(e.to_string()))?;
                create_lock_file(lock_path).map_err(|e| DaemonError::Lock(e.to_string()))?;
                Ok(LockHandle { path: lock_path.to_path_buf() })
            }
        }
        Err(e) => Err(DaemonError::Lock(e.to_string())),
    }
}

fn create_lock_file(lock_path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(lock_path)?;
    write!(file, "{}", std::process::id())?;
    Ok(())
}

fn read_lock_pid(lock_path: &Path) -> DaemonResult<i32> {
    let mut contents = String::new();
    std::fs::File::open(lock_path)
        .map_err(|e| DaemonError::Lock(e.to_string()))?
        .read_to_string(&mut contents)
        .map_err(|e| DaemonError::Lock(e.to_string()))?;
    contents
        .trim()
        .parse()
        .map_err(|_| DaemonError::Lock(format!("lock file contains no valid pid: {contents:?}")))
}

fn process_is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

impl LockHandle {
    /// Remove the lock file. Called only from shutdown phase 3.
    pub fn release(self) -> DaemonResult<()> {
        std::fs::remove_file(&self.path).map_err(|e| DaemonError::Lock(e.to_string()))?;
        Ok(())
    }
}

/// Coordinates the heartbeat tick and the three-phase graceful shutdown
/// for one running worker.
pub struct WorkerLifecycle {
    worker_id: WorkerId,
    pid: i64,
    started_at: i64,
    databases: Arc<Databases>,
    reader_cache: Arc<ReaderCache>,
    heartbeat_interval: Duration,
    /// Fires when Phase 1 cancels the root context; every long-lived wait
    /// (rate limiter, retry sleep, heartbeat ticker) selects on this.
    shutdown: Arc<Notify>,
}

impl WorkerLifecycle {
    /// Build a lifecycle coordinator. `worker_id` identifies this process
    /// in the heartbeat table and in worker events.
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        databases: Arc<Databases>,
        reader_cache: Arc<ReaderCache>,
        heartbeat_interval: Duration,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            worker_id,
            pid: i64::from(std::process::id()),
            started_at: Timestamp::now().epoch_seconds(),
            databases,
            reader_cache,
            heartbeat_interval,
            shutdown,
        }
    }

    /// Run the heartbeat loop until `shutdown` fires. Each tick records
    /// this worker's row, reaps zombie heartbeats from other workers, and
    /// logs a `tracing::info!` span with the computed stats.
    pub async fn run_heartbeat(&self) {
        loop {
            tokio::select! {
                () = self.shutdown.notified() => return,
                () = tokio::time::sleep(self.heartbeat_interval) => {}
            }
            if let Err(e) = self.tick() {
                tracing::warn!(error = %e, "heartbeat tick failed");
            }
        }
    }

    fn tick(&self) -> DaemonResult<()> {
        let now = Timestamp::now().epoch_seconds();
        self.databases
            .lifecycle
            .record_heartbeat(&self.worker_id.to_string(), self.pid, self.started_at, now)?;

        let stale = self.databases.lifecycle.list_stale_heartbeats(now, STALE_AFTER_SECS)?;
        for (stale_worker_id, stale_pid) in stale {
            if stale_worker_id == self.worker_id.to_string() {
                continue;
            }
            self.databases.lifecycle.remove_heartbeat(&stale_worker_id)?;
            tracing::info!(stale_worker_id = %stale_worker_id, stale_pid, "reaped zombie heartbeat");
        }

        let sessions_active = self.databases.lifecycle.count_active_sessions()?;
        let sessions_completed = self.databases.lifecycle.count_completed_sessions()?;
        let cache_hit_rate = self.reader_cache.hit_rate()?;
        tracing::info!(
            worker_id = %self.worker_id,
            sessions_active,
            sessions_completed,
            cache_hit_rate,
            "heartbeat"
        );
        Ok(())
    }

    /// Signal Phase 1: write a final `shutting_down` heartbeat row and
    /// fire the shutdown notifier, unblocking every long-lived wait.
    pub fn begin_shutdown(&self) -> DaemonResult<()> {
        let now = Timestamp::now().epoch_seconds();
        self.databases.lifecycle.record_heartbeat_with_status(
            &self.worker_id.to_string(),
            self.pid,
            self.started_at,
            now,
            "shutting_down",
        )?;
        self.shutdown.notify_waiters();
        Ok(())
    }

    /// Phase 3: checkpoint every on-disk database, record the `shutdown`
    /// worker event, and release the lock. The caller is responsible for
    /// having already waited out Phase 2's in-flight-operation budget.
    pub fn finish_shutdown(&self, lock: LockHandle) -> DaemonResult<()> {
        self.databases.checkpoint_all()?;
        let now = Timestamp::now().epoch_seconds();
        let description = format!("worker {} shutting down cleanly", self.worker_id);
        self.databases.metadata.record_worker_event("shutdown", &description, now)?;
        self.databases.lifecycle.remove_heartbeat(&self.worker_id.to_string())?;
        lock.release()?;
        Ok(())
    }

    /// The shutdown notifier, shared with every subsystem that needs to
    /// abort its wait when Phase 1 fires.
    #[must_use]
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brainloop_storage::InputDb;

    #[test]
    fn validate_working_directory_rejects_missing_schema_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_working_directory(dir.path(), dir.path(), false, "brainloop").unwrap_err();
        assert!(matches!(err, DaemonError::MissingSchemaFile(_)));
    }

    #[test]
    fn validate_working_directory_rejects_missing_project_identifier() {
        let dir = tempfile::tempdir().unwrap();
        for f in REQUIRED_FILES {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        let err = validate_working_directory(dir.path(), dir.path(), true, "brainloop-project-xyz").unwrap_err();
        assert!(matches!(err, DaemonError::ProjectNameMismatch(_)));
    }

    #[test]
    fn validate_working_directory_passes_with_required_files_present() {
        let dir = tempfile::tempdir().unwrap();
        for f in REQUIRED_FILES {
            std::fs::write(dir.path().join(f), b"").unwrap();
        }
        validate_working_directory(dir.path(), dir.path(), false, "whatever").unwrap();
    }

    #[test]
    fn acquire_lock_fails_when_a_live_process_holds_it() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("brainloop.lock");
        std::fs::write(&lock_path, std::process::id().to_string()).unwrap();

        let err = acquire_lock(&lock_path).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));
    }

    #[test]
    fn acquire_lock_reclaims_a_stale_lock_from_a_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("brainloop.lock");
        // PID 1 is init and always alive on a real system, so instead pick
        // an implausibly large PID unlikely to be assigned to a live
        // process in this sandbox.
        std::fs::write(&lock_path, "999999").unwrap();

        let handle = acquire_lock(&lock_path).unwrap();
        assert!(lock_path.exists());
        handle.release().unwrap();
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn heartbeat_tick_records_this_worker_and_reaps_others() {
        let databases = Arc::new(Databases::open_in_memory().unwrap());
        let reader_cache = Arc::new(ReaderCache::new(Arc::new(InputDb::open_in_memory().unwrap())));
        let worker_id = WorkerId::new();
        let shutdown = Arc::new(Notify::new());
        let lifecycle =
            WorkerLifecycle::new(worker_id, Arc::clone(&databases), reader_cache, Duration::from_secs(15), shutdown);

        databases.lifecycle.record_heartbeat("zombie-worker", 1, 0, 0).unwrap();
        lifecycle.tick().unwrap();

        let stale = databases.lifecycle.list_stale_heartbeats(Timestamp::now().epoch_seconds() + 1000, 0).unwrap();
        assert!(stale.iter().all(|(id, _)| id != "zombie-worker"));
    }
}
