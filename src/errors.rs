//! Error taxonomy for the scheduler, grouped by kind per the HTTP/error design.

use thiserror::Error;
use uuid::Uuid;

/// [`SchedulerError`] is the single error type returned by every fallible
/// operation in this crate: [`crate::store::TaskStore`], [`crate::scheduler::Scheduler`],
/// and the cron grammar in [`crate::cron`]. Each variant carries the structured
/// fields the HTTP layer needs to render `{"error": {"kind", "message", "field"?}}`
/// without re-deriving them from a string.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("invalid cron expression in field `{field}`: {reason}")]
    BadCron { field: String, reason: String },

    #[error("invalid timezone `{tz}`")]
    BadTimezone { tz: String },

    #[error("invalid token: {reason}")]
    BadToken { reason: String },

    #[error("path `{path}` must be absolute")]
    PathNotAbsolute { path: String },

    #[error("prompt exceeds maximum length of {max} characters")]
    PromptTooLong { max: usize },

    #[error("a task named `{name}` already exists")]
    DuplicateName { name: String },

    #[error("an ad-hoc task with token `{token}` already exists")]
    DuplicateToken { token: String },

    #[error("task `{uuid}` is already running")]
    AlreadyRunning { uuid: Uuid },

    #[error("cannot transition task `{uuid}` from `{from}` to `{to}`")]
    InvalidTransition {
        uuid: Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error("task `{uuid}` is disabled")]
    Disabled { uuid: Uuid },

    #[error("no task with uuid `{uuid}`")]
    NotFound { uuid: Uuid },

    #[error("i/o error persisting the task store: {message}")]
    IoError { message: String },

    #[error("task store is corrupt: {message}")]
    CorruptStore { message: String },

    #[error("agent runner failed: {message}")]
    Agent { message: String },

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("request did not originate from a loopback address")]
    NotLoopback,
}

impl SchedulerError {
    /// Machine-readable kind tag, used by the HTTP layer and by clients to decide
    /// whether a failure is safe to retry.
    pub fn kind(&self) -> &'static str {
        use SchedulerError::*;
        match self {
            MissingField { .. } => "MissingField",
            BadCron { .. } => "BadCron",
            BadTimezone { .. } => "BadTimezone",
            BadToken { .. } => "BadToken",
            PathNotAbsolute { .. } => "PathNotAbsolute",
            PromptTooLong { .. } => "PromptTooLong",
            DuplicateName { .. } => "DuplicateName",
            DuplicateToken { .. } => "DuplicateToken",
            AlreadyRunning { .. } => "AlreadyRunning",
            InvalidTransition { .. } => "InvalidTransition",
            Disabled { .. } => "Disabled",
            NotFound { .. } => "NotFound",
            IoError { .. } => "IoError",
            CorruptStore { .. } => "CorruptStore",
            Agent { .. } => "Agent",
            Unauthorized => "Unauthorized",
            NotLoopback => "NotLoopback",
        }
    }

    /// The field name implicated by a validation error, when applicable.
    pub fn field(&self) -> Option<&str> {
        match self {
            SchedulerError::MissingField { field } => Some(field),
            SchedulerError::BadCron { field, .. } => Some(field.as_str()),
            _ => None,
        }
    }

    /// HTTP status code mapping per the error design.
    pub fn status_code(&self) -> u16 {
        use SchedulerError::*;
        match self {
            MissingField { .. }
            | BadCron { .. }
            | BadTimezone { .. }
            | BadToken { .. }
            | PathNotAbsolute { .. }
            | PromptTooLong { .. } => 400,
            DuplicateName { .. }
            | DuplicateToken { .. }
            | AlreadyRunning { .. }
            | InvalidTransition { .. }
            | Disabled { .. } => 409,
            NotFound { .. } => 404,
            IoError { .. } | CorruptStore { .. } => 500,
            Agent { .. } => 500,
            Unauthorized => 401,
            NotLoopback => 403,
        }
    }
}

/// A structured failure to parse a single cron field, per §4.2: `ParseError{field, reason}`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field `{field}`: {reason}")]
pub struct CronParseError {
    pub field: &'static str,
    pub reason: String,
}

impl From<CronParseError> for SchedulerError {
    fn from(e: CronParseError) -> Self {
        SchedulerError::BadCron {
            field: e.field.to_string(),
            reason: e.reason,
        }
    }
}
