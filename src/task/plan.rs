//! [`TaskPlan`] — the datetime waypoint progression driving a `PlannedTask` (§4.3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A progression of UTC instants partitioned into `todo` (ascending, not yet
/// launched), `in_progress` (at most one, currently executing), and `done`
/// (already executed). Every instant ever added lives in exactly one
/// partition at a time.
///
/// All mutators are meant to be called while holding the owning task's
/// [`crate::store::TaskStore`] lock — [`TaskPlan`] itself does no locking.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPlan {
    todo: Vec<DateTime<Utc>>,
    in_progress: Option<DateTime<Utc>>,
    done: Vec<DateTime<Utc>>,
}

impl TaskPlan {
    pub fn new(todo: Vec<DateTime<Utc>>) -> Self {
        let mut plan = TaskPlan {
            todo: Vec::new(),
            in_progress: None,
            done: Vec::new(),
        };
        for instant in todo {
            plan.add(instant);
        }
        plan
    }

    pub fn todo(&self) -> &[DateTime<Utc>] {
        &self.todo
    }

    pub fn in_progress(&self) -> Option<DateTime<Utc>> {
        self.in_progress
    }

    pub fn done(&self) -> &[DateTime<Utc>] {
        &self.done
    }

    /// Insert `instant` into `todo`, keeping ascending order. No-op if the
    /// instant is already present in any partition.
    pub fn add(&mut self, instant: DateTime<Utc>) {
        if self.todo.contains(&instant) || self.in_progress == Some(instant) || self.done.contains(&instant) {
            return;
        }
        let pos = self.todo.partition_point(|&t| t < instant);
        self.todo.insert(pos, instant);
    }

    /// `todo[0]` iff it is due (`<= now`).
    pub fn should_launch(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.todo.first().copied().filter(|&head| head <= now)
    }

    /// Move the head of `todo` into `in_progress`.
    ///
    /// # Panics
    /// Panics if `instant` is not `todo[0]` or `in_progress` is already set —
    /// both indicate a caller bug (the Scheduler must check `should_launch`
    /// and the `idle` state before calling this).
    pub fn set_in_progress(&mut self, instant: DateTime<Utc>) {
        assert!(self.in_progress.is_none(), "set_in_progress called while already in progress");
        assert_eq!(self.todo.first().copied(), Some(instant), "instant is not the head of todo");
        self.todo.remove(0);
        self.in_progress = Some(instant);
    }

    /// Move `in_progress` to `done`, clearing `in_progress`.
    ///
    /// # Panics
    /// Panics if `in_progress != Some(instant)`.
    pub fn set_done(&mut self, instant: DateTime<Utc>) {
        assert_eq!(self.in_progress, Some(instant), "instant is not the in-progress item");
        self.in_progress = None;
        let pos = self.done.partition_point(|&t| t < instant);
        self.done.insert(pos, instant);
    }

    /// Return the in-progress item to the head of `todo` (used on cancellation).
    pub fn remove_in_progress(&mut self) {
        if let Some(instant) = self.in_progress.take() {
            self.todo.insert(0, instant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(mins: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(0, 0).unwrap() + chrono::Duration::minutes(mins)
    }

    #[test]
    fn add_keeps_ascending_order_and_dedupes() {
        let mut plan = TaskPlan::default();
        plan.add(t(5));
        plan.add(t(1));
        plan.add(t(3));
        plan.add(t(1));
        assert_eq!(plan.todo(), &[t(1), t(3), t(5)]);
    }

    #[test]
    fn should_launch_only_when_head_is_due() {
        let plan = TaskPlan::new(vec![t(10)]);
        assert_eq!(plan.should_launch(t(5)), None);
        assert_eq!(plan.should_launch(t(10)), Some(t(10)));
        assert_eq!(plan.should_launch(t(20)), Some(t(10)));
    }

    #[test]
    fn empty_plan_is_never_due() {
        let plan = TaskPlan::default();
        assert_eq!(plan.should_launch(t(100)), None);
    }

    #[test]
    fn full_progression_success_path() {
        let mut plan = TaskPlan::new(vec![t(1), t(2)]);
        plan.set_in_progress(t(1));
        assert_eq!(plan.in_progress(), Some(t(1)));
        assert_eq!(plan.todo(), &[t(2)]);
        plan.set_done(t(1));
        assert_eq!(plan.in_progress(), None);
        assert_eq!(plan.done(), &[t(1)]);
    }

    #[test]
    fn cancellation_returns_item_to_head_of_todo() {
        let mut plan = TaskPlan::new(vec![t(1), t(2)]);
        plan.set_in_progress(t(1));
        plan.remove_in_progress();
        assert_eq!(plan.in_progress(), None);
        assert_eq!(plan.todo(), &[t(1), t(2)]);
    }

    #[test]
    #[should_panic]
    fn set_in_progress_panics_if_not_head() {
        let mut plan = TaskPlan::new(vec![t(1), t(2)]);
        plan.set_in_progress(t(2));
    }
}
