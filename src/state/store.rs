//! Crash-safe persistence of the run state.
//!
//! Every mutation takes an in-process mutex and an exclusive advisory lock
//! on `state.lock`, re-reads `state.json`, applies the change and replaces
//! the file through a temp-file rename. Readers therefore always see either
//! the previous or the next durable state, and any number of `StateStore`
//! handles (in this or other processes) serialise on the same lock.

use crate::core::TaskId;
use crate::error::{Error, Result};
use crate::state::event::{Event, EventKind};
use crate::state::record::{
    Attempt, Claim, LevelRecord, LevelState, RunState, StopRequest, TaskExecution, TaskState,
    TransitionMeta, WorkerId, WorkerRecord, WorkerStatus,
};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// Handle on a run's persisted state.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl StateStore {
    /// Open (and create if needed) the state directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            guard: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn exists(&self) -> bool {
        self.state_path().exists()
    }

    /// Read the durable state without taking the lock.
    ///
    /// Safe because writers only ever rename complete files into place.
    pub fn load(&self) -> Result<RunState> {
        let path = self.state_path();
        if !path.exists() {
            return Err(Error::NoRunState(self.dir.clone()));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist a brand-new run. Refuses to overwrite an unfinished run.
    pub fn create(&self, state: &RunState) -> Result<()> {
        self.with_lock(|| {
            if self.exists() {
                let existing = self.load()?;
                if !existing.status.is_finished() {
                    return Err(Error::RunExists(existing.run_id));
                }
            }
            self.write(state)?;
            info!(run = %state.run_id, tasks = state.tasks.len(), "run state created");
            Ok(())
        })
    }

    /// Apply `f` to the latest durable state and persist the result.
    ///
    /// If `f` fails nothing is written.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RunState) -> Result<T>,
    {
        self.with_lock(|| {
            let mut state = self.load()?;
            let out = f(&mut state)?;
            state.updated_at = Utc::now();
            self.write(&state)?;
            Ok(out)
        })
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| Error::StateLock("state mutex poisoned".to_string()))?;
        let lock = self.lock_file()?;
        lock.lock_exclusive()
            .map_err(|e| Error::StateLock(format!("failed to lock {}: {}", LOCK_FILE, e)))?;
        let out = f();
        // Dropping the handle releases the lock as well; unlock explicitly so
        // a failure is at least visible in the log.
        if let Err(e) = lock.unlock() {
            debug!(error = %e, "state lock release failed");
        }
        out
    }

    fn lock_file(&self) -> Result<File> {
        let path = self.dir.join(LOCK_FILE);
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    fn write(&self, state: &RunState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.state_path())
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    // ========== Tasks ==========

    pub fn get_task(&self, id: &TaskId) -> Result<TaskExecution> {
        Ok(self.load()?.task(id)?.clone())
    }

    /// Atomically claim `id` for `worker`. Exactly one of any number of
    /// concurrent callers gets [`Claim::Acquired`].
    pub fn claim_task(&self, id: &TaskId, worker: &WorkerId) -> Result<(Claim, Option<Event>)> {
        let outcome = self.update(|state| state.claim(id, worker))?;
        debug!(task = %id, worker = %worker, claim = ?outcome.0, "claim attempt");
        Ok(outcome)
    }

    pub fn transition_task(
        &self,
        id: &TaskId,
        to: TaskState,
        meta: TransitionMeta,
    ) -> Result<Event> {
        self.update(|state| state.transition_task(id, to, meta))
    }

    /// Record a failed attempt; see [`RunState::record_failure`].
    pub fn record_failure(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        attempt: Attempt,
        max_retries: u32,
    ) -> Result<(TaskState, Vec<Event>)> {
        self.update(|state| state.record_failure(id, worker, attempt, max_retries))
    }

    pub fn release_task(&self, id: &TaskId, reason: &str) -> Result<Option<Event>> {
        self.update(|state| state.release(id, reason))
    }

    // ========== Levels ==========

    pub fn get_level(&self, n: u32) -> Result<LevelRecord> {
        Ok(self.load()?.level(n)?.clone())
    }

    pub fn transition_level(&self, n: u32, to: LevelState) -> Result<Event> {
        self.update(|state| state.transition_level(n, to))
    }

    /// Mutate a level record outside of a state transition (gate results,
    /// merge commit, blocked reason).
    pub fn update_level<T>(&self, n: u32, f: impl FnOnce(&mut LevelRecord) -> T) -> Result<T> {
        self.update(|state| Ok(f(state.level_mut(n)?)))
    }

    // ========== Workers ==========

    /// Allocate the next worker id and register it as idle.
    pub fn register_worker(&self, coordinator: &str) -> Result<WorkerRecord> {
        self.update(|state| {
            let id = WorkerId::new(state.next_worker);
            state.next_worker += 1;
            let now = Utc::now();
            let record = WorkerRecord {
                id: id.clone(),
                coordinator: coordinator.to_string(),
                status: WorkerStatus::Idle,
                task: None,
                last_heartbeat: now,
                branch: None,
                workdir: None,
                spawned_at: now,
            };
            state.workers.insert(id, record.clone());
            Ok(record)
        })
    }

    pub fn update_worker<T>(
        &self,
        id: &WorkerId,
        f: impl FnOnce(&mut WorkerRecord) -> T,
    ) -> Result<T> {
        self.update(|state| Ok(f(state.worker_mut(id)?)))
    }

    /// Refresh a worker's heartbeat. Returns `false` when the worker has
    /// already been declared crashed, in which case its work is forfeit.
    pub fn heartbeat(&self, id: &WorkerId) -> Result<bool> {
        self.update(|state| {
            let record = state.worker_mut(id)?;
            if record.status == WorkerStatus::Crashed {
                return Ok(false);
            }
            record.last_heartbeat = Utc::now();
            Ok(true)
        })
    }

    // ========== Events and control ==========

    pub fn append_event(&self, event: Event) -> Result<Event> {
        self.update(|state| Ok(state.push_event(event)))
    }

    /// Record a stop request for the running coordinator to pick up.
    pub fn request_stop(&self, force: bool) -> Result<()> {
        self.update(|state| {
            state.stop_request = Some(StopRequest {
                force,
                requested_at: Utc::now(),
            });
            Ok(())
        })
    }

    pub fn stop_request(&self) -> Result<Option<StopRequest>> {
        Ok(self.load()?.stop_request)
    }

    /// Events with a sequence number greater than `after`.
    pub fn events_since(&self, after: u64) -> Result<Vec<Event>> {
        Ok(self
            .load()?
            .events
            .into_iter()
            .filter(|e| e.seq > after)
            .collect())
    }

    /// Convenience for events that carry no transition.
    pub fn emit(&self, kind: EventKind, f: impl FnOnce(Event) -> Event) -> Result<Event> {
        self.append_event(f(Event::new(kind)))
    }
}
