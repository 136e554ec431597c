//! [`Scheduler`] — the orchestration layer tying [`crate::store::TaskStore`],
//! [`crate::clock::Clock`], [`crate::agent::AgentRunner`], and
//! [`crate::context::ContextStore`] together (§4.6).

use crate::agent::{AgentRunner, PromptBundle};
use crate::clock::Clock;
use crate::context::ContextStore;
use crate::errors::SchedulerError;
use crate::store::{MutationOutcome, TaskStore};
use crate::task::{ExecutionRecord, Outcome, Task, TaskState};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const DEFAULT_MAX_PARALLELISM: usize = 4;
const DEFAULT_QUEUE_DEPTH: usize = 256;
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Acknowledges that `run_by_uuid` committed the `idle → running` transition;
/// the agent call itself continues in the background (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct RunAck {
    pub uuid: Uuid,
}

struct RunHandle {
    run_seq: u64,
    cancel: CancellationToken,
}

/// The scheduler's lifecycle: `init → running → shutdown` (§4.6).
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    store: Arc<TaskStore>,
    agent: Arc<dyn AgentRunner>,
    context: Arc<dyn ContextStore>,
    semaphore: Arc<Semaphore>,
    dispatch_tx: mpsc::Sender<Uuid>,
    run_seq: Arc<AtomicU64>,
    in_flight: Arc<Mutex<HashMap<Uuid, RunHandle>>>,
    cancel_grace: Duration,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<TaskStore>,
        agent: Arc<dyn AgentRunner>,
        context: Arc<dyn ContextStore>,
        max_parallelism: Option<usize>,
    ) -> Arc<Self> {
        Self::with_options(clock, store, agent, context, max_parallelism, None, None)
    }

    /// Full constructor honoring every `[scheduler]` knob in [`crate::config::Config`].
    pub fn with_options(
        clock: Arc<dyn Clock>,
        store: Arc<TaskStore>,
        agent: Arc<dyn AgentRunner>,
        context: Arc<dyn ContextStore>,
        max_parallelism: Option<usize>,
        queue_capacity: Option<usize>,
        cancel_grace: Option<Duration>,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(max_parallelism.unwrap_or(DEFAULT_MAX_PARALLELISM)));
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<Uuid>(queue_capacity.unwrap_or(DEFAULT_QUEUE_DEPTH));
        let scheduler = Arc::new(Scheduler {
            clock,
            store,
            agent,
            context,
            semaphore,
            dispatch_tx,
            run_seq: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            cancel_grace: cancel_grace.unwrap_or(DEFAULT_CANCEL_GRACE),
        });

        let worker_scheduler = scheduler.clone();
        tokio::spawn(async move {
            while let Some(uuid) = dispatch_rx.recv().await {
                let scheduler = worker_scheduler.clone();
                let permit = match scheduler.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(%uuid, "worker pool saturated, dropping this tick's dispatch");
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    scheduler.execute_run(uuid).await;
                });
            }
        });

        scheduler
    }

    /// Reloads the store, asks for `due_tasks(window)`, and spawns a background
    /// run for each. Returns immediately; idempotent w.r.t. already-running
    /// tasks since `due_tasks` only returns `idle` ones.
    #[instrument(skip(self))]
    pub async fn tick(&self, window: Duration) -> Result<usize, SchedulerError> {
        self.store.reload().await?;
        let due = self.store.due_tasks(self.clock.as_ref(), window).await;
        let mut dispatched = 0;
        for task in due {
            if self.dispatch_tx.try_send(task.uuid()).is_ok() {
                dispatched += 1;
            } else {
                warn!(uuid = %task.uuid(), "dispatch queue full, skipping this tick — next tick will re-pick it up");
            }
        }
        info!(dispatched, "tick complete");
        Ok(dispatched)
    }

    /// Verifies the task exists and is `idle`, transitions it to `running`
    /// under the store lock, then dispatches the background run (§4.6).
    #[instrument(skip(self))]
    pub async fn run_by_uuid(&self, uuid: Uuid) -> Result<RunAck, SchedulerError> {
        let task = self.store.get(uuid).await.ok_or(SchedulerError::NotFound { uuid })?;
        match task.state() {
            TaskState::Running => return Err(SchedulerError::AlreadyRunning { uuid }),
            TaskState::Disabled => return Err(SchedulerError::Disabled { uuid }),
            TaskState::Idle => {}
            TaskState::Error => {}
        }
        self.transition_to_running(uuid).await?;
        self.dispatch_tx
            .send(uuid)
            .await
            .map_err(|_| SchedulerError::IoError { message: "dispatch queue closed".into() })?;
        Ok(RunAck { uuid })
    }

    /// Best-effort: fires the cancellation token for `uuid`'s in-flight run.
    /// If the agent does not respond within the configured grace period the
    /// run is force-finalized as cancelled regardless.
    #[instrument(skip(self))]
    pub async fn cancel(&self, uuid: Uuid) -> Result<(), SchedulerError> {
        let handle = {
            let guard = self.in_flight.lock().await;
            guard.get(&uuid).map(|h| h.cancel.clone())
        };
        match handle {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            }
            None => Err(SchedulerError::NotFound { uuid }),
        }
    }

    /// Removes a task and its associated context record together (§3, §4.4:
    /// "the associated context in ContextStore must be removed in the same
    /// critical section"). The context delete happens immediately after the
    /// store removal succeeds and before this call returns, so no caller can
    /// observe the task gone from the store while its context record lingers.
    #[instrument(skip(self))]
    pub async fn delete_task(&self, uuid: Uuid) -> Result<Task, SchedulerError> {
        let task = self.store.remove(uuid).await?;
        self.context.delete(&uuid.to_string()).await;
        Ok(task)
    }

    pub async fn shutdown(&self) {
        let guard = self.in_flight.lock().await;
        for handle in guard.values() {
            handle.cancel.cancel();
        }
    }

    async fn transition_to_running(&self, uuid: Uuid) -> Result<(), SchedulerError> {
        let now = self.clock.now().await;
        self.store
            .update(uuid, self.clock.as_ref(), move |mut task| {
                if task.state() != TaskState::Idle {
                    return Err(SchedulerError::AlreadyRunning { uuid });
                }
                task.on_run(now);
                task.header_mut().state = TaskState::Running;
                Ok(MutationOutcome::Commit(task))
            })
            .await?;
        Ok(())
    }

    /// The background run protocol (§4.6 steps 1-5). Step 1 (the `idle →
    /// running` transition) has already happened by the time this runs for
    /// `run_by_uuid`-originated executions; for `tick`-originated ones it
    /// happens here, first.
    async fn execute_run(&self, uuid: Uuid) {
        let started_at = self.clock.now().await;

        let already_running = matches!(self.store.get(uuid).await.map(|t| t.state()), Some(TaskState::Running));
        if !already_running {
            if let Err(e) = self.transition_to_running(uuid).await {
                warn!(%uuid, error = %e, "skipping dispatch: task no longer eligible");
                return;
            }
        }

        let run_seq = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        self.in_flight.lock().await.insert(uuid, RunHandle { run_seq, cancel: cancel.clone() });

        let context_ref = self.context.get_or_create(&uuid.to_string()).await;

        let task = match self.store.get(uuid).await {
            Some(task) => task,
            None => {
                self.in_flight.lock().await.remove(&uuid);
                return;
            }
        };
        let header = task.header().clone();
        let bundle = PromptBundle {
            system_prompt: header.system_prompt,
            prompt: header.prompt,
            attachments: header.attachments,
            ctx_planning: header.ctx_planning,
            ctx_reasoning: header.ctx_reasoning,
            ctx_deep_search: header.ctx_deep_search,
            context_ref,
        };

        let agent = self.agent.clone();
        let run_future = agent.run(bundle, cancel.clone());
        let grace = self.cancel_grace;
        let outcome = tokio::select! {
            result = run_future => match result {
                Ok(text) => (Outcome::Success, Some(text), None),
                Err(e) => (Outcome::Error, None, Some(e.message)),
            },
            _ = cancel.cancelled() => {
                tokio::time::sleep(grace).await;
                (Outcome::Cancelled, None, None)
            }
        };

        // Stale-run guard: if a newer run for this uuid has started since we
        // began (e.g. this run overstayed its cancellation grace period and a
        // fresh dispatch took over), drop our outcome entirely (§5).
        let current_seq = self.in_flight.lock().await.get(&uuid).map(|h| h.run_seq);
        if current_seq != Some(run_seq) {
            warn!(%uuid, run_seq, "discarding stale run outcome");
            return;
        }

        let finished_at = self.clock.now().await;
        let (outcome_kind, result, error) = outcome;
        let record = ExecutionRecord {
            task_uuid: uuid,
            started_at,
            finished_at,
            outcome: outcome_kind,
            result: result.clone(),
            error: error.clone(),
        };

        let finalize = self
            .store
            .update(uuid, self.clock.as_ref(), move |mut task| {
                match outcome_kind {
                    Outcome::Success => {
                        task.on_success();
                        task.header_mut().state = TaskState::Idle;
                        task.header_mut().last_result = result.clone();
                        task.header_mut().last_error = None;
                    }
                    Outcome::Error => {
                        task.on_error();
                        task.header_mut().state = TaskState::Error;
                        task.header_mut().last_error = error.clone();
                    }
                    Outcome::Cancelled => {
                        task.on_cancel();
                        task.header_mut().state = TaskState::Idle;
                    }
                }
                task.header_mut().last_run = Some(finished_at);
                task.on_finish(&record);
                Ok(MutationOutcome::Commit(task))
            })
            .await;

        if let Err(e) = finalize {
            error!(%uuid, error = %e, "failed to persist run outcome");
        }

        self.in_flight.lock().await.remove(&uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::ScriptedAgentRunner;
    use crate::clock::VirtualClock;
    use crate::context::InMemoryContextStore;
    use crate::task::{AdHocTask, TaskHeader};
    use tempfile::tempdir;

    async fn scheduler_with(outcomes: Vec<Result<String, crate::agent::AgentError>>) -> (Arc<Scheduler>, Arc<TaskStore>, Arc<VirtualClock>) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(VirtualClock::from_epoch());
        let store = Arc::new(TaskStore::open(dir.path().join("tasks.json")).await.unwrap());
        let agent: Arc<dyn AgentRunner> = Arc::new(ScriptedAgentRunner::new(outcomes));
        let context: Arc<dyn ContextStore> = Arc::new(InMemoryContextStore::new());
        let scheduler = Scheduler::new(clock.clone(), store.clone(), agent, context, Some(4));
        (scheduler, store, clock)
    }

    #[tokio::test]
    async fn run_by_uuid_transitions_idle_to_running_before_agent_completes() {
        let (scheduler, store, clock) = scheduler_with(vec![Ok("done".into())]).await;
        let now = clock.now().await;
        let task = store
            .add(
                Task::Adhoc(AdHocTask { header: TaskHeader::new("t".into(), "p".into(), now), token: "tok".into() }),
                clock.as_ref(),
            )
            .await
            .unwrap();

        let ack = scheduler.run_by_uuid(task.uuid()).await.unwrap();
        assert_eq!(ack.uuid, task.uuid());
        let mid = store.get(task.uuid()).await.unwrap();
        assert_eq!(mid.state(), TaskState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let done = store.get(task.uuid()).await.unwrap();
        assert_eq!(done.state(), TaskState::Idle);
        assert_eq!(done.header().last_result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn run_by_uuid_rejects_already_running() {
        let (scheduler, store, clock) = scheduler_with(vec![Ok("x".into())]).await;
        let now = clock.now().await;
        let task = store
            .add(
                Task::Adhoc(AdHocTask { header: TaskHeader::new("t".into(), "p".into(), now), token: "tok".into() }),
                clock.as_ref(),
            )
            .await
            .unwrap();
        scheduler.run_by_uuid(task.uuid()).await.unwrap();
        let err = scheduler.run_by_uuid(task.uuid()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn agent_error_moves_task_to_error_state() {
        let (scheduler, store, clock) = scheduler_with(vec![Err(crate::agent::AgentError { message: "boom".into() })]).await;
        let now = clock.now().await;
        let task = store
            .add(
                Task::Adhoc(AdHocTask { header: TaskHeader::new("t".into(), "p".into(), now), token: "tok".into() }),
                clock.as_ref(),
            )
            .await
            .unwrap();
        scheduler.run_by_uuid(task.uuid()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let done = store.get(task.uuid()).await.unwrap();
        assert_eq!(done.state(), TaskState::Error);
        assert_eq!(done.header().last_error.as_deref(), Some("boom"));
    }
}
