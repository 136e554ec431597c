//! The [`Task`] sum type and its three variants (§3).

pub mod plan;

pub use plan::TaskPlan;

use crate::clock::Clock;
use crate::cron::{self, CronSchedule};
use crate::errors::SchedulerError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// `idle → {running, disabled}`, `running → {idle, error}`, `disabled → {idle}`,
/// `error → {idle, disabled}`. No other edges (§3 invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    Disabled,
    Error,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::Disabled => "disabled",
            TaskState::Error => "error",
        }
    }

    /// Whether moving from `self` to `to` is one of the edges the state machine
    /// permits, independent of *who* is asking for it (run-protocol transition
    /// or a user `update`). Callers that need to distinguish "running → idle via
    /// on_success" from "running → idle via user update" (the latter is
    /// rejected per the table) enforce that distinction themselves.
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Idle, Running) | (Idle, Disabled) | (Running, Idle) | (Running, Error) | (Disabled, Idle) | (Error, Idle) | (Error, Disabled)
        )
    }
}

/// `ctx_planning` / `ctx_reasoning` ∈ {on, off, auto} (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtxMode {
    On,
    Off,
    Auto,
}

/// `ctx_deep_search` ∈ {on, off} (§3) — no `auto` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtxDeepSearch {
    On,
    Off,
}

/// Fields shared by every `Task` variant (§3 "Common header").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHeader {
    pub uuid: Uuid,
    pub name: String,
    pub state: TaskState,
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub attachments: Vec<PathBuf>,
    pub ctx_planning: CtxMode,
    pub ctx_reasoning: CtxMode,
    pub ctx_deep_search: CtxDeepSearch,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
}

impl TaskHeader {
    /// A fresh header for a task being created: random uuid, `idle`, both
    /// timestamps pinned to `now`, no run history yet.
    pub fn new(name: String, prompt: String, now: DateTime<Utc>) -> Self {
        TaskHeader {
            uuid: Uuid::new_v4(),
            name,
            state: TaskState::Idle,
            system_prompt: None,
            prompt,
            attachments: Vec::new(),
            ctx_planning: CtxMode::Auto,
            ctx_reasoning: CtxMode::Auto,
            ctx_deep_search: CtxDeepSearch::Off,
            created_at: now,
            updated_at: now,
            last_run: None,
            last_result: None,
            last_error: None,
        }
    }

    /// Every `attachments` entry must be absolute (§7 `PathNotAbsolute`).
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::MissingField { field: "name" });
        }
        if self.prompt.trim().is_empty() {
            return Err(SchedulerError::MissingField { field: "prompt" });
        }
        for path in &self.attachments {
            if !path.is_absolute() {
                return Err(SchedulerError::PathNotAbsolute {
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// `{schedule, timezone}` (§3 "TaskSchedule"): a parsed cron expression plus an
/// optional IANA zone override. `timezone: None` means "use the Clock's default".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskSchedule {
    pub cron: CronSchedule,
    #[serde(default, with = "tz_opt")]
    pub timezone: Option<Tz>,
}

impl TaskSchedule {
    pub fn new(cron: CronSchedule, timezone: Option<Tz>) -> Self {
        TaskSchedule { cron, timezone }
    }

    pub fn effective_timezone(&self, clock: &dyn Clock) -> Tz {
        self.timezone.unwrap_or_else(|| clock.default_timezone())
    }
}

mod tz_opt {
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tz: &Option<Tz>, ser: S) -> Result<S::Ok, S::Error> {
        match tz {
            Some(tz) => ser.serialize_str(tz.name()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Tz>, D::Error> {
        let raw: Option<String> = Option::deserialize(de)?;
        match raw {
            Some(s) => s.parse::<Tz>().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// The per-run bag passed to lifecycle hooks (§3 "ExecutionRecord", transient —
/// never persisted as part of a [`Task`]).
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub task_uuid: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(flatten)]
    pub header: TaskHeader,
    pub schedule: TaskSchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocTask {
    #[serde(flatten)]
    pub header: TaskHeader,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    #[serde(flatten)]
    pub header: TaskHeader,
    pub plan: TaskPlan,
}

/// A task is a sum type over its three variants, all sharing [`TaskHeader`]
/// (§3). Persisted with a `type` discriminator tag so the store's JSON
/// document round-trips without losing variant identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Scheduled(ScheduledTask),
    Adhoc(AdHocTask),
    Planned(PlannedTask),
}

impl Task {
    pub fn header(&self) -> &TaskHeader {
        match self {
            Task::Scheduled(t) => &t.header,
            Task::Adhoc(t) => &t.header,
            Task::Planned(t) => &t.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut TaskHeader {
        match self {
            Task::Scheduled(t) => &mut t.header,
            Task::Adhoc(t) => &mut t.header,
            Task::Planned(t) => &mut t.header,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.header().uuid
    }

    pub fn name(&self) -> &str {
        &self.header().name
    }

    pub fn state(&self) -> TaskState {
        self.header().state
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Scheduled(_) => "scheduled",
            Task::Adhoc(_) => "adhoc",
            Task::Planned(_) => "planned",
        }
    }

    /// §4.5: the predicate `TaskStore::due_tasks` filters on. Only meaningful
    /// for tasks already known to be `idle` — callers apply that filter
    /// separately (§4.4).
    ///
    /// `ScheduledTask` guards against re-dispatching a firing it has already
    /// run: `check_schedule` is otherwise memoryless (it re-derives the same
    /// answer from `now` alone), so without comparing against `last_run` a
    /// second `tick` landing in the same firing window, once the task has
    /// cycled back to `idle`, would run it again (§8 scenario 1, the
    /// idempotence invariant).
    pub async fn check_schedule(&self, clock: &dyn Clock, window: Duration) -> bool {
        match self {
            Task::Scheduled(t) => {
                let tz = t.schedule.effective_timezone(clock);
                let now = clock.now().await;
                let reference = now - chrono::Duration::from_std(window).unwrap_or_default();
                match cron::fire_within(&t.schedule.cron, tz, reference, window) {
                    Some(fire_at) => match t.header.last_run {
                        Some(last_run) if last_run >= fire_at => false,
                        _ => true,
                    },
                    None => false,
                }
            }
            Task::Adhoc(_) => false,
            Task::Planned(t) => {
                let now = clock.now().await;
                t.plan.should_launch(now).is_some()
            }
        }
    }

    /// Variant hook invoked at the start of a run, after the `idle → running`
    /// transition is decided but before it is persisted (§4.6 step 1). Only
    /// `PlannedTask` does anything: it commits the waypoint that triggered the
    /// run to `in_progress`.
    pub fn on_run(&mut self, at: DateTime<Utc>) {
        if let Task::Planned(t) = self {
            if t.plan.in_progress().is_none() {
                if let Some(head) = t.plan.should_launch(at) {
                    t.plan.set_in_progress(head);
                }
            }
        }
    }

    /// Variant hook on successful completion (§4.6 step 4, success branch).
    pub fn on_success(&mut self) {
        if let Task::Planned(t) = self {
            if let Some(instant) = t.plan.in_progress() {
                t.plan.set_done(instant);
            }
        }
    }

    /// Variant hook on failed completion. Per §7, a `PlannedTask` still moves
    /// its waypoint to `done` on error — it is not retried automatically.
    pub fn on_error(&mut self) {
        if let Task::Planned(t) = self {
            if let Some(instant) = t.plan.in_progress() {
                t.plan.set_done(instant);
            }
        }
    }

    /// Variant hook on cancellation: a `PlannedTask`'s waypoint returns to the
    /// head of `todo` so the next tick can retry it.
    pub fn on_cancel(&mut self) {
        if let Task::Planned(t) = self {
            t.plan.remove_in_progress();
        }
    }

    /// Variant hook that runs on every outcome, including cancellation (§4.6
    /// step 5). No variant currently has finish-only side effects; the hook
    /// exists so the Scheduler has a uniform call site regardless of variant.
    pub fn on_finish(&mut self, _record: &ExecutionRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use chrono::TimeZone;

    fn header(now: DateTime<Utc>) -> TaskHeader {
        TaskHeader::new("t".into(), "do the thing".into(), now)
    }

    #[test]
    fn header_validate_rejects_relative_attachment() {
        let mut h = header(Utc::now());
        h.attachments.push(PathBuf::from("relative/path"));
        assert!(matches!(h.validate(), Err(SchedulerError::PathNotAbsolute { .. })));
    }

    #[test]
    fn header_validate_rejects_empty_prompt() {
        let mut h = header(Utc::now());
        h.prompt.clear();
        assert!(matches!(h.validate(), Err(SchedulerError::MissingField { field: "prompt" })));
    }

    #[test]
    fn state_transition_table_matches_spec() {
        use TaskState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Idle.can_transition_to(Disabled));
        assert!(!Idle.can_transition_to(Error));
        assert!(Running.can_transition_to(Idle));
        assert!(Running.can_transition_to(Error));
        assert!(!Running.can_transition_to(Disabled));
        assert!(Disabled.can_transition_to(Idle));
        assert!(!Disabled.can_transition_to(Running));
        assert!(Error.can_transition_to(Idle));
        assert!(Error.can_transition_to(Disabled));
    }

    #[tokio::test]
    async fn adhoc_task_never_self_schedules() {
        let clock = VirtualClock::from_epoch();
        let task = Task::Adhoc(AdHocTask {
            header: header(clock.now().await),
            token: "tok".into(),
        });
        assert!(!task.check_schedule(&clock, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn scheduled_task_fires_at_its_cron_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let clock = VirtualClock::new(now);
        let schedule = TaskSchedule::new(cron::parse("*/5 * * * *").unwrap(), None);
        let task = Task::Scheduled(ScheduledTask {
            header: header(now),
            schedule,
        });
        assert!(task.check_schedule(&clock, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn scheduled_task_does_not_refire_a_firing_already_recorded_as_last_run() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let clock = VirtualClock::new(now);
        let schedule = TaskSchedule::new(cron::parse("*/5 * * * *").unwrap(), None);
        let mut task_header = header(now);
        task_header.last_run = Some(now);
        let task = Task::Scheduled(ScheduledTask { header: task_header, schedule });

        // A second tick at the same unmoved virtual time must not re-dispatch
        // the firing already recorded in `last_run` (§8 scenario 1).
        assert!(!task.check_schedule(&clock, Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn planned_task_fires_once_waypoint_is_due() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = VirtualClock::new(now);
        let mut plan = TaskPlan::default();
        plan.add(now);
        let mut task = Task::Planned(PlannedTask { header: header(now), plan });
        assert!(task.check_schedule(&clock, Duration::from_secs(60)).await);

        task.on_run(now);
        if let Task::Planned(t) = &task {
            assert_eq!(t.plan.in_progress(), Some(now));
        } else {
            unreachable!();
        }

        task.on_success();
        if let Task::Planned(t) = &task {
            assert_eq!(t.plan.in_progress(), None);
            assert_eq!(t.plan.done(), &[now]);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn task_schedule_round_trips_timezone_through_serde() {
        let schedule = TaskSchedule::new(cron::parse("0 9 * * *").unwrap(), Some(Tz::America__New_York));
        let json = serde_json::to_string(&schedule).unwrap();
        let back: TaskSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }
}
