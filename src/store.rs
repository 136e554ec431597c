//! [`TaskStore`] — the authoritative, durable, concurrency-safe task collection (§4.4).

use crate::clock::Clock;
use crate::errors::SchedulerError;
use crate::task::{Task, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// The on-disk persistence format (§4.4): an ordered array of tasks tagged by
/// variant. `version` is carried for forward compatibility even though only
/// one layout has ever existed.
#[derive(Debug, Serialize, Deserialize)]
struct TaskDocument {
    version: u32,
    tasks: Vec<Task>,
}

impl Default for TaskDocument {
    fn default() -> Self {
        TaskDocument { version: 1, tasks: Vec::new() }
    }
}

/// Tells `update`'s mutator whether to commit or discard the in-progress edit.
pub enum MutationOutcome<T> {
    Commit(T),
    Abort,
}

/// The result of a mutator that doesn't need to return a value back to the caller.
pub type Mutation = MutationOutcome<()>;

/// `TaskStore` guards the whole task list behind one lock (§4.4): every public
/// method takes it for the duration of the call, including `update`, which
/// treats the held guard as the "reentrant" access to `get` the spec describes
/// — there is no second acquisition, `update`'s mutator simply reads out of the
/// map it already holds.
pub struct TaskStore {
    path: PathBuf,
    tasks: Mutex<HashMap<Uuid, Task>>,
}

impl TaskStore {
    /// Loads `path` if it exists, otherwise starts from an empty document.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SchedulerError> {
        let path = path.into();
        let tasks = load_document(&path).await?;
        Ok(TaskStore { path, tasks: Mutex::new(tasks) })
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Vec<Task> {
        self.tasks.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, uuid: Uuid) -> Option<Task> {
        self.tasks.lock().await.get(&uuid).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Task> {
        self.tasks.lock().await.values().find(|t| t.name() == name).cloned()
    }

    /// Assigns `created_at = updated_at = now`, rejects duplicate names/tokens,
    /// persists atomically.
    #[instrument(skip(self, task, clock))]
    pub async fn add(&self, mut task: Task, clock: &dyn Clock) -> Result<Task, SchedulerError> {
        task.header().validate()?;
        let mut guard = self.tasks.lock().await;
        check_duplicates(&guard, &task, None)?;
        let now = clock.now().await;
        let header = task.header_mut();
        header.created_at = now;
        header.updated_at = now;
        guard.insert(task.uuid(), task.clone());
        persist(&self.path, &guard).await?;
        info!(uuid = %task.uuid(), name = %task.name(), kind = task.kind(), "task created");
        Ok(task)
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, uuid: Uuid) -> Result<Task, SchedulerError> {
        let mut guard = self.tasks.lock().await;
        let task = guard.remove(&uuid).ok_or(SchedulerError::NotFound { uuid })?;
        persist(&self.path, &guard).await?;
        info!(%uuid, "task removed");
        Ok(task)
    }

    /// Reads the task under the lock, hands a clone to `mutator`, validates the
    /// state transition (if `state` changed) and re-validates header invariants,
    /// then replaces and persists. `mutator` returning `Err` or `Abort` leaves
    /// the store untouched.
    #[instrument(skip(self, mutator, clock))]
    pub async fn update<F>(&self, uuid: Uuid, clock: &dyn Clock, mutator: F) -> Result<Task, SchedulerError>
    where
        F: FnOnce(Task) -> Result<MutationOutcome<Task>, SchedulerError>,
    {
        let mut guard = self.tasks.lock().await;
        let current = guard.get(&uuid).cloned().ok_or(SchedulerError::NotFound { uuid })?;
        let before_state = current.state();
        let updated = match mutator(current)? {
            MutationOutcome::Abort => return guard.get(&uuid).cloned().ok_or(SchedulerError::NotFound { uuid }),
            MutationOutcome::Commit(t) => t,
        };
        updated.header().validate()?;
        check_duplicates(&guard, &updated, Some(uuid))?;
        if updated.state() != before_state && !before_state.can_transition_to(updated.state()) {
            return Err(SchedulerError::InvalidTransition {
                uuid,
                from: state_label(before_state),
                to: state_label(updated.state()),
            });
        }
        let mut updated = updated;
        updated.header_mut().updated_at = clock.now().await;
        guard.insert(uuid, updated.clone());
        persist(&self.path, &guard).await?;
        debug!(%uuid, "task updated");
        Ok(updated)
    }

    /// Re-reads the file from disk, merging by uuid — picks up out-of-band
    /// edits between ticks (§4.4).
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<(), SchedulerError> {
        let on_disk = load_document(&self.path).await?;
        let mut guard = self.tasks.lock().await;
        for (uuid, task) in on_disk {
            guard.insert(uuid, task);
        }
        Ok(())
    }

    /// Tasks with `state == idle` whose variant's `check_schedule(window)` is true.
    #[instrument(skip(self, clock))]
    pub async fn due_tasks(&self, clock: &dyn Clock, window: Duration) -> Vec<Task> {
        let snapshot: Vec<Task> = {
            let guard = self.tasks.lock().await;
            guard.values().filter(|t| t.state() == TaskState::Idle).cloned().collect()
        };
        let mut due = Vec::new();
        for task in snapshot {
            if task.check_schedule(clock, window).await {
                due.push(task);
            }
        }
        due
    }
}

fn state_label(state: TaskState) -> &'static str {
    state.as_str()
}

fn check_duplicates(existing: &HashMap<Uuid, Task>, candidate: &Task, excluding: Option<Uuid>) -> Result<(), SchedulerError> {
    for (uuid, other) in existing {
        if Some(*uuid) == excluding {
            continue;
        }
        if other.name() == candidate.name() {
            return Err(SchedulerError::DuplicateName { name: candidate.name().to_string() });
        }
        if let (Task::Adhoc(a), Task::Adhoc(b)) = (candidate, other) {
            if a.token == b.token {
                return Err(SchedulerError::DuplicateToken { token: a.token.clone() });
            }
        }
    }
    Ok(())
}

async fn load_document(path: &Path) -> Result<HashMap<Uuid, Task>, SchedulerError> {
    match fs::read(path).await {
        Ok(bytes) => {
            let doc: TaskDocument = serde_json::from_slice(&bytes).map_err(|e| SchedulerError::CorruptStore { message: e.to_string() })?;
            Ok(doc.tasks.into_iter().map(|t| (t.uuid(), t)).collect())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "task store file not found, starting empty");
            Ok(HashMap::new())
        }
        Err(e) => Err(SchedulerError::IoError { message: e.to_string() }),
    }
}

/// Write-to-temp-then-rename for atomicity (§4.4): readers never observe a
/// half-written document.
async fn persist(path: &Path, tasks: &HashMap<Uuid, Task>) -> Result<(), SchedulerError> {
    let doc = TaskDocument {
        version: 1,
        tasks: tasks.values().cloned().collect(),
    };
    let body = serde_json::to_vec_pretty(&doc).map_err(|e| SchedulerError::CorruptStore { message: e.to_string() })?;
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| SchedulerError::IoError { message: e.to_string() })?;
    }
    fs::write(&tmp_path, &body).await.map_err(|e| SchedulerError::IoError { message: e.to_string() })?;
    fs::rename(&tmp_path, path).await.map_err(|e| SchedulerError::IoError { message: e.to_string() })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::cron;
    use crate::task::{AdHocTask, ScheduledTask, TaskHeader, TaskSchedule};
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn adhoc(name: &str, token: &str, now: chrono::DateTime<chrono::Utc>) -> Task {
        Task::Adhoc(AdHocTask {
            header: TaskHeader::new(name.into(), "prompt".into(), now),
            token: token.into(),
        })
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let clock = VirtualClock::from_epoch();
        let store = TaskStore::open(dir.path().join("tasks.json")).await.unwrap();
        let now = clock.now().await;
        let task = store.add(adhoc("a", "tok-a", now), &clock).await.unwrap();
        let fetched = store.get(task.uuid()).await.unwrap();
        assert_eq!(fetched.name(), "a");
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let dir = tempdir().unwrap();
        let clock = VirtualClock::from_epoch();
        let store = TaskStore::open(dir.path().join("tasks.json")).await.unwrap();
        let now = clock.now().await;
        store.add(adhoc("dup", "tok-1", now).clone(), &clock).await.unwrap();
        let err = store.add(adhoc("dup", "tok-2", now), &clock).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateName { .. }));
    }

    #[tokio::test]
    async fn duplicate_token_is_rejected_across_adhoc_tasks() {
        let dir = tempdir().unwrap();
        let clock = VirtualClock::from_epoch();
        let store = TaskStore::open(dir.path().join("tasks.json")).await.unwrap();
        let now = clock.now().await;
        store.add(adhoc("one", "shared", now), &clock).await.unwrap();
        let err = store.add(adhoc("two", "shared", now), &clock).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateToken { .. }));
    }

    #[tokio::test]
    async fn update_rejects_invalid_transition() {
        let dir = tempdir().unwrap();
        let clock = VirtualClock::from_epoch();
        let store = TaskStore::open(dir.path().join("tasks.json")).await.unwrap();
        let now = clock.now().await;
        let task = store.add(adhoc("t", "tok", now), &clock).await.unwrap();
        let err = store
            .update(task.uuid(), &clock, |mut t| {
                t.header_mut().state = TaskState::Error;
                Ok(MutationOutcome::Commit(t))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let clock = VirtualClock::from_epoch();
        {
            let store = TaskStore::open(&path).await.unwrap();
            let now = clock.now().await;
            store.add(adhoc("persisted", "tok", now), &clock).await.unwrap();
        }
        let reopened = TaskStore::open(&path).await.unwrap();
        assert!(reopened.get_by_name("persisted").await.is_some());
    }

    #[tokio::test]
    async fn due_tasks_only_returns_idle_tasks_with_a_firing_schedule() {
        let dir = tempdir().unwrap();
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let clock = VirtualClock::new(now);
        let store = TaskStore::open(dir.path().join("tasks.json")).await.unwrap();
        let scheduled = Task::Scheduled(ScheduledTask {
            header: TaskHeader::new("cron".into(), "p".into(), now),
            schedule: TaskSchedule::new(cron::parse("*/5 * * * *").unwrap(), None),
        });
        let added = store.add(scheduled, &clock).await.unwrap();
        let due = store.due_tasks(&clock, Duration::from_secs(60)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uuid(), added.uuid());

        store
            .update(added.uuid(), &clock, |mut t| {
                t.header_mut().state = TaskState::Running;
                Ok(MutationOutcome::Commit(t))
            })
            .await
            .unwrap();
        assert!(store.due_tasks(&clock, Duration::from_secs(60)).await.is_empty());
    }
}
