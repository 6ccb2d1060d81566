//! Units of work for the dispatcher and the scheduler.

use std::fmt;
use std::time::{Duration, Instant};

pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler task ids. Zero means "not scheduled yet".
pub type TaskId = u32;

/// A deferred call executed on the dispatcher thread
///
/// A task may carry an expiration instant; the dispatcher silently drops
/// tasks that are already expired when their turn comes.
pub struct Task {
    func: TaskFn,
    expiration: Option<Instant>,
}

impl Task {
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Box::new(func),
            expiration: None,
        }
    }

    /// Creates a task that is dropped if it has waited longer than `max_wait`
    pub fn with_expiration<F>(max_wait: Duration, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            func: Box::new(func),
            expiration: Some(Instant::now() + max_wait),
        }
    }

    pub fn expiration(&self) -> Option<Instant> {
        self.expiration
    }

    pub fn set_dont_expire(&mut self) {
        self.expiration = None;
    }

    pub fn has_expired(&self) -> bool {
        self.has_expired_at(Instant::now())
    }

    pub fn has_expired_at(&self, now: Instant) -> bool {
        self.expiration.map_or(false, |deadline| deadline < now)
    }

    /// Runs the task unless it expired. Returns whether it ran.
    pub fn execute(self) -> bool {
        if self.has_expired() {
            return false;
        }
        (self.func)();
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// A task that fires on the dispatcher after a delay
///
/// The fire time is fixed when the task is created, not when it is handed
/// to the scheduler.
#[derive(Debug)]
pub struct SchedulerTask {
    task: Task,
    id: TaskId,
    fire_at: Instant,
}

impl SchedulerTask {
    pub fn new<F>(delay: Duration, func: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            task: Task::new(func),
            id: 0,
            fire_at: Instant::now() + delay,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: TaskId) {
        self.id = id;
    }

    pub fn fire_at(&self) -> Instant {
        self.fire_at
    }

    /// Hands the inner task over to the dispatcher; a fired task never expires.
    pub(crate) fn into_task(self) -> Task {
        let mut task = self.task;
        task.set_dont_expire();
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_task_executes() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = Task::new(move || flag.store(true, Ordering::SeqCst));

        assert!(task.execute());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_expired_task_is_skipped() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let task = Task::with_expiration(Duration::ZERO, move || flag.store(true, Ordering::SeqCst));

        std::thread::sleep(Duration::from_millis(2));
        assert!(task.has_expired());
        assert!(!task.execute());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_scheduler_task_never_expires_once_fired() {
        let task = SchedulerTask::new(Duration::from_millis(5), || {});
        assert_eq!(task.id(), 0);
        let inner = task.into_task();
        assert!(inner.expiration().is_none());
    }
}
