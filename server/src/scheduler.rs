//! Delayed task scheduler
//!
//! Keeps pending [`SchedulerTask`]s in a min-heap ordered by fire time and
//! hands each one to the [`Dispatcher`] when it is due. Cancellation is lazy:
//! the id is forgotten and the heap entry is skipped when it surfaces. An
//! entry only fires while its id still maps to the entry's own sequence, so
//! a reused id never revives a cancelled task.

use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServerError};
use crate::tasks::{SchedulerTask, TaskId};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Started,
    Stopping,
}

struct Entry {
    fire_at: Instant,
    sequence: u64,
    task: SchedulerTask,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap yields the earliest task, ties in insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct Pending {
    heap: BinaryHeap<Entry>,
    /// Pending ids and the sequence of the heap entry that owns each
    ids: HashMap<TaskId, u64>,
    last_id: TaskId,
    sequence: u64,
    state: SchedulerState,
}

impl Pending {
    fn next_id(&mut self) -> TaskId {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.ids.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }

    /// Queues a task; returns its id and whether it is now the earliest
    fn push(&mut self, mut task: SchedulerTask) -> (TaskId, bool) {
        if task.id() == 0 {
            let id = self.next_id();
            task.set_id(id);
        }
        let id = task.id();

        self.sequence += 1;
        let sequence = self.sequence;
        self.ids.insert(id, sequence);

        let fire_at = task.fire_at();
        let is_next = self.heap.peek().map_or(true, |top| fire_at < top.fire_at);
        self.heap.push(Entry {
            fire_at,
            sequence,
            task,
        });
        (id, is_next)
    }
}

pub struct Scheduler {
    pending: Mutex<Pending>,
    signal: Condvar,
    dispatcher: Arc<Dispatcher>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Pending {
                heap: BinaryHeap::new(),
                ids: HashMap::new(),
                last_id: 0,
                sequence: 0,
                state: SchedulerState::Stopped,
            }),
            signal: Condvar::new(),
            dispatcher,
            worker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut pending = self.pending.lock();
            if pending.state != SchedulerState::Stopped {
                return Ok(());
            }
            pending.state = SchedulerState::Started;
        }

        let scheduler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || scheduler.run())
            .map_err(|source| {
                self.pending.lock().state = SchedulerState::Stopped;
                ServerError::Spawn {
                    name: "scheduler",
                    source,
                }
            })?;
        *self.worker.lock() = Some(handle);
        debug!("Scheduler started");
        Ok(())
    }

    pub fn state(&self) -> SchedulerState {
        self.pending.lock().state
    }

    /// Number of tasks still waiting to fire
    pub fn pending(&self) -> usize {
        self.pending.lock().ids.len()
    }

    /// Queues a task, returning its id, or 0 if the scheduler is not running
    pub fn add_task(&self, task: SchedulerTask) -> TaskId {
        let mut pending = self.pending.lock();
        if pending.state != SchedulerState::Started {
            trace!("Scheduler rejected task in state {:?}", pending.state);
            return 0;
        }

        let (id, is_next) = pending.push(task);
        drop(pending);

        if is_next {
            self.signal.notify_one();
        }
        id
    }

    /// Convenience wrapper for `add_task(SchedulerTask::new(delay, func))`
    pub fn schedule<F>(&self, delay: Duration, func: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(SchedulerTask::new(delay, func))
    }

    /// Cancels a pending task. Returns false for 0, unknown or already fired ids.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        if id == 0 {
            return false;
        }
        self.pending.lock().ids.remove(&id).is_some()
    }

    /// Stops the worker; tasks that have not fired are discarded
    pub fn stop(&self) {
        let mut pending = self.pending.lock();
        if pending.state == SchedulerState::Started {
            pending.state = SchedulerState::Stopping;
        }
        drop(pending);
        self.signal.notify_all();
    }

    pub fn wait_until_stopped(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Scheduler thread panicked");
            }
        }
    }

    fn run(&self) {
        let mut pending = self.pending.lock();
        loop {
            if pending.state != SchedulerState::Started {
                let discarded = pending.ids.len();
                pending.heap.clear();
                pending.ids.clear();
                pending.state = SchedulerState::Stopped;
                debug!("Scheduler stopped, discarded {} pending task(s)", discarded);
                return;
            }

            let next_fire = pending.heap.peek().map(|entry| entry.fire_at);
            match next_fire {
                None => {
                    self.signal.wait(&mut pending);
                    continue;
                }
                Some(fire_at) if fire_at > Instant::now() => {
                    self.signal.wait_until(&mut pending, fire_at);
                    continue;
                }
                Some(_) => {}
            }

            let due = Self::take_due(&mut pending, Instant::now());
            if !due.is_empty() {
                MutexGuard::unlocked(&mut pending, || {
                    for task in due {
                        self.dispatcher.add_task(task.into_task());
                    }
                });
            }
        }
    }

    fn take_due(pending: &mut Pending, now: Instant) -> Vec<SchedulerTask> {
        let mut due = Vec::new();
        while pending.heap.peek().map_or(false, |entry| entry.fire_at <= now) {
            if let Some(entry) = pending.heap.pop() {
                let id = entry.task.id();
                if pending.ids.get(&id) == Some(&entry.sequence) {
                    pending.ids.remove(&id);
                    due.push(entry.task);
                }
            }
        }
        due
    }
}
