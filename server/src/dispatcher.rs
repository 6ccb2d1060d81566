//! Single-threaded task dispatcher
//!
//! All game-state mutation happens on one dedicated thread. Other threads
//! hand work over as [`Task`]s; the dispatcher runs them in FIFO order and
//! lets registered [`FrameHook`]s observe the start and end of every task so
//! output produced during the task can be flushed in one batch.

use crate::error::{Result, ServerError};
use crate::tasks::Task;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Started,
    Stopping,
}

/// Observer notified around every executed task
pub trait FrameHook: Send + Sync {
    fn begin_frame(&self) {}
    fn end_frame(&self) {}
}

struct Queue {
    tasks: VecDeque<Task>,
    state: DispatcherState,
}

pub struct Dispatcher {
    queue: Mutex<Queue>,
    signal: Condvar,
    hooks: RwLock<Vec<Weak<dyn FrameHook>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                state: DispatcherState::Stopped,
            }),
            signal: Condvar::new(),
            hooks: RwLock::new(Vec::new()),
            worker: Mutex::new(None),
            worker_id: Mutex::new(None),
        })
    }

    /// Spawns the worker thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if queue.state != DispatcherState::Stopped {
                return Ok(());
            }
            queue.state = DispatcherState::Started;
        }

        let dispatcher = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || dispatcher.run())
            .map_err(|source| {
                self.queue.lock().state = DispatcherState::Stopped;
                ServerError::Spawn {
                    name: "dispatcher",
                    source,
                }
            })?;

        *self.worker.lock() = Some(handle);
        debug!("Dispatcher started");
        Ok(())
    }

    pub fn state(&self) -> DispatcherState {
        self.queue.lock().state
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    pub fn is_dispatcher_thread(&self) -> bool {
        *self.worker_id.lock() == Some(thread::current().id())
    }

    /// Registers an observer for task frames. Dropped hooks are pruned lazily.
    pub fn register_hook(&self, hook: Weak<dyn FrameHook>) {
        self.hooks.write().push(hook);
    }

    /// Queues a task at the back. Returns false if the dispatcher is not running.
    pub fn add_task(&self, task: Task) -> bool {
        self.try_add_task(task, false).is_ok()
    }

    /// Queues a task at the front so it runs next.
    pub fn add_urgent_task(&self, task: Task) -> bool {
        self.try_add_task(task, true).is_ok()
    }

    /// Queues a task, handing it back if the dispatcher is not accepting work
    ///
    /// Callers that must not lose the work (releases, closes) run the
    /// returned task inline.
    pub fn try_add_task(&self, task: Task, urgent: bool) -> std::result::Result<(), Task> {
        let mut queue = self.queue.lock();
        if queue.state != DispatcherState::Started {
            trace!("Dispatcher rejected task in state {:?}", queue.state);
            return Err(task);
        }

        let was_empty = queue.tasks.is_empty();
        if urgent {
            queue.tasks.push_front(task);
        } else {
            queue.tasks.push_back(task);
        }
        drop(queue);

        if was_empty {
            self.signal.notify_one();
        }
        Ok(())
    }

    /// Stops accepting tasks. The worker drains what is queued, then exits.
    pub fn stop(&self) {
        let mut queue = self.queue.lock();
        if queue.state == DispatcherState::Started {
            queue.state = DispatcherState::Stopping;
            debug!("Dispatcher stopping with {} queued task(s)", queue.tasks.len());
        }
        drop(queue);
        self.signal.notify_all();
    }

    /// Blocks until the worker has exited
    ///
    /// Called from the worker itself (a task that shuts the server down) the
    /// remaining queue is drained inline instead of joining.
    pub fn wait_until_stopped(&self) {
        if self.is_dispatcher_thread() {
            self.drain();
            return;
        }

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Dispatcher thread panicked");
            }
        }
    }

    fn run(&self) {
        *self.worker_id.lock() = Some(thread::current().id());
        loop {
            let task = {
                let mut queue = self.queue.lock();
                while queue.tasks.is_empty() && queue.state == DispatcherState::Started {
                    self.signal.wait(&mut queue);
                }
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.state = DispatcherState::Stopped;
                        break;
                    }
                }
            };
            self.run_task(task);
        }
        debug!("Dispatcher stopped");
    }

    fn drain(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.state = DispatcherState::Stopped;
                        return;
                    }
                }
            };
            self.run_task(task);
        }
    }

    fn run_task(&self, task: Task) {
        if task.has_expired() {
            trace!("Dropping expired task");
            return;
        }

        let hooks = self.live_hooks();
        for hook in &hooks {
            hook.begin_frame();
        }
        task.execute();
        for hook in &hooks {
            hook.end_frame();
        }
    }

    fn live_hooks(&self) -> Vec<Arc<dyn FrameHook>> {
        let hooks: Vec<_> = self.hooks.read().iter().filter_map(Weak::upgrade).collect();
        if hooks.len() != self.hooks.read().len() {
            self.hooks.write().retain(|hook| hook.strong_count() > 0);
        }
        hooks
    }
}
