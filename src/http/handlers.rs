//! The thin HTTP handlers of §4.7/§6.1: each validates input, calls exactly
//! one `Scheduler` or `TaskStore` method, and serializes the result.

use crate::cron::{self, CronSchedule};
use crate::errors::SchedulerError;
use crate::http::state::AppState;
use crate::store::MutationOutcome;
use crate::task::{AdHocTask, CtxDeepSearch, CtxMode, PlannedTask, ScheduledTask, Task, TaskHeader, TaskPlan, TaskSchedule, TaskState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

fn error_response(err: SchedulerError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({"kind": err.kind(), "message": err.to_string()});
    if let Some(field) = err.field() {
        body["field"] = json!(field);
    }
    (status, Json(json!({"error": body}))).into_response()
}

/// Renders a [`Task`] as the `TaskJSON` shape of §4.4/§6.1, adding the
/// read-only `schedule_display` field for `ScheduledTask`.
fn task_to_json(task: &Task) -> Value {
    let mut value = serde_json::to_value(task).expect("Task always serializes");
    if let Task::Scheduled(t) = task {
        value["schedule_display"] = json!(t.schedule.cron.display());
    }
    value
}

#[derive(Debug, Deserialize, Default)]
pub struct TickRequest {
    pub window_seconds: Option<u64>,
}

pub async fn scheduler_tick(State(state): State<AppState>, Json(req): Json<TickRequest>) -> Response {
    let window = req
        .window_seconds
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| state.config.tick_window());
    match state.scheduler.tick(window).await {
        Ok(dispatched) => Json(json!({"status": "ok", "dispatched": dispatched})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UuidRequest {
    pub uuid: Uuid,
}

pub async fn scheduler_task_run(State(state): State<AppState>, Json(req): Json<UuidRequest>) -> Response {
    match state.scheduler.run_by_uuid(req.uuid).await {
        Ok(_) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleInput {
    pub cron: String,
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub attachments: Option<Vec<std::path::PathBuf>>,
    pub ctx_planning: Option<CtxMode>,
    pub ctx_reasoning: Option<CtxMode>,
    pub ctx_deep_search: Option<CtxDeepSearch>,
    pub schedule: Option<ScheduleInput>,
    pub token: Option<String>,
    pub plan: Option<Vec<DateTime<Utc>>>,
}

fn build_header(req: &CreateTaskRequest, now: DateTime<Utc>) -> Result<TaskHeader, SchedulerError> {
    let mut header = TaskHeader::new(req.name.clone(), req.prompt.clone(), now);
    header.system_prompt = req.system_prompt.clone();
    if let Some(attachments) = &req.attachments {
        header.attachments = attachments.clone();
    }
    if let Some(mode) = req.ctx_planning {
        header.ctx_planning = mode;
    }
    if let Some(mode) = req.ctx_reasoning {
        header.ctx_reasoning = mode;
    }
    if let Some(mode) = req.ctx_deep_search {
        header.ctx_deep_search = mode;
    }
    header.validate()?;
    Ok(header)
}

fn build_schedule(input: &ScheduleInput) -> Result<TaskSchedule, SchedulerError> {
    let cron: CronSchedule = cron::parse(&input.cron)?;
    let timezone = match &input.timezone {
        Some(tz) => Some(cron::parse_timezone(tz).map_err(|_| SchedulerError::BadTimezone { tz: tz.clone() })?),
        None => None,
    };
    Ok(TaskSchedule::new(cron, timezone))
}

pub async fn scheduler_task_create(State(state): State<AppState>, Json(req): Json<CreateTaskRequest>) -> Response {
    let now = state.clock.now().await;
    let result = (|| -> Result<Task, SchedulerError> {
        let header = build_header(&req, now)?;
        let task = match req.kind.as_str() {
            "scheduled" => {
                let input = req.schedule.as_ref().ok_or(SchedulerError::MissingField { field: "schedule" })?;
                Task::Scheduled(ScheduledTask { header, schedule: build_schedule(input)? })
            }
            "adhoc" => {
                let token = req.token.clone().ok_or(SchedulerError::MissingField { field: "token" })?;
                Task::Adhoc(AdHocTask { header, token })
            }
            "planned" => {
                let waypoints = req.plan.clone().unwrap_or_default();
                Task::Planned(PlannedTask { header, plan: TaskPlan::new(waypoints) })
            }
            other => {
                return Err(SchedulerError::BadToken { reason: format!("unknown task type '{other}'") });
            }
        };
        Ok(task)
    })();

    let task = match result {
        Ok(task) => task,
        Err(e) => return error_response(e),
    };

    match state.store.add(task, state.clock.as_ref()).await {
        Ok(task) => (StatusCode::OK, Json(json!({"task": task_to_json(&task)}))).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub attachments: Option<Vec<std::path::PathBuf>>,
    pub ctx_planning: Option<CtxMode>,
    pub ctx_reasoning: Option<CtxMode>,
    pub ctx_deep_search: Option<CtxDeepSearch>,
    pub state: Option<String>,
}

pub async fn scheduler_task_update(State(state): State<AppState>, Json(req): Json<UpdateTaskRequest>) -> Response {
    let requested_raw = req.state.clone();

    let outcome = state
        .store
        .update(req.uuid, state.clock.as_ref(), move |mut task| {
            let current_state = task.state();

            // A user update may only ever request "idle" or "disabled", and
            // only from a state that isn't `running` — the `running` state may
            // only be left via the run-protocol lifecycle hooks
            // (on_success/on_error/on_cancel), never by a direct user request
            // (§4.6 state table; §8 boundary behavior).
            let requested_state = match requested_raw.as_deref() {
                Some("idle") => Some(TaskState::Idle),
                Some("disabled") => Some(TaskState::Disabled),
                Some(_) => {
                    return Err(SchedulerError::InvalidTransition {
                        uuid: req.uuid,
                        from: current_state.as_str(),
                        to: "invalid",
                    });
                }
                None => None,
            };

            if requested_state.is_some() && current_state == TaskState::Running {
                return Err(SchedulerError::InvalidTransition {
                    uuid: req.uuid,
                    from: "running",
                    to: "user-requested",
                });
            }

            let header = task.header_mut();
            if let Some(name) = &req.name {
                header.name = name.clone();
            }
            if let Some(prompt) = &req.prompt {
                header.prompt = prompt.clone();
            }
            if req.system_prompt.is_some() {
                header.system_prompt = req.system_prompt.clone();
            }
            if let Some(attachments) = &req.attachments {
                header.attachments = attachments.clone();
            }
            if let Some(mode) = req.ctx_planning {
                header.ctx_planning = mode;
            }
            if let Some(mode) = req.ctx_reasoning {
                header.ctx_reasoning = mode;
            }
            if let Some(mode) = req.ctx_deep_search {
                header.ctx_deep_search = mode;
            }
            if let Some(requested) = requested_state {
                header.state = requested;
            }
            Ok(MutationOutcome::Commit(task))
        })
        .await;

    match outcome {
        Ok(task) => Json(json!({"task": task_to_json(&task)})).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn scheduler_task_delete(State(state): State<AppState>, Json(req): Json<UuidRequest>) -> Response {
    match state.scheduler.delete_task(req.uuid).await {
        Ok(_) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksRequest {
    pub filter: Option<String>,
    pub sort: Option<String>,
}

pub async fn scheduler_tasks_list(State(state): State<AppState>, Json(req): Json<ListTasksRequest>) -> Response {
    let mut tasks = state.store.list().await;
    if let Some(filter) = &req.filter {
        tasks.retain(|t| t.kind() == filter || t.state().as_str() == filter);
    }
    match req.sort.as_deref() {
        Some("name") => tasks.sort_by(|a, b| a.name().cmp(b.name())),
        Some("created_at") => tasks.sort_by(|a, b| a.header().created_at.cmp(&b.header().created_at)),
        _ => {}
    }
    Json(json!({"tasks": tasks.iter().map(task_to_json).collect::<Vec<_>>()})).into_response()
}

pub async fn scheduler_task_get(State(state): State<AppState>, Json(req): Json<UuidRequest>) -> Response {
    match state.store.get(req.uuid).await {
        Some(task) => Json(json!({"task": task_to_json(&task)})).into_response(),
        None => error_response(SchedulerError::NotFound { uuid: req.uuid }),
    }
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    idle: usize,
    running: usize,
    disabled: usize,
    error: usize,
}

/// `/scheduler_metrics` (SPEC_FULL §E, loopback): per-state task counts. Not
/// part of the required §6.1 table — purely observational ambient stack.
pub async fn scheduler_metrics(State(state): State<AppState>) -> Response {
    let tasks = state.store.list().await;
    let mut metrics = MetricsResponse { idle: 0, running: 0, disabled: 0, error: 0 };
    for task in &tasks {
        match task.state() {
            TaskState::Idle => metrics.idle += 1,
            TaskState::Running => metrics.running += 1,
            TaskState::Disabled => metrics.disabled += 1,
            TaskState::Error => metrics.error += 1,
        }
    }
    Json(metrics).into_response()
}
