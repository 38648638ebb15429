//! Deferred execution of promise handlers.
//!
//! A settled promise never calls its handlers directly. It collects them into
//! a [`Schedule`] and hands the whole batch to a [`Scheduler`], which runs it
//! once the code that settled the promise has returned.
//!
//! Every thread owns a [`TaskQueue`] that acts as its default scheduler.
//! Nothing in the queue runs until the thread drains it:
//!
//! ```
//! use promise_aplus::{scheduler, Promise, Resolution, State};
//!
//! let promise = Promise::<i32>::resolve(1).and_then(|v| Ok(Resolution::Value(v + 1)));
//! assert_eq!(promise.state(), State::Pending);
//! scheduler::run_until_idle();
//! assert_eq!(promise.peek(), Some(Ok(2)));
//! ```
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::util::lock;

/// A zero-argument unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// An ordered batch of tasks produced by one dispatch.
#[derive(Default)]
pub struct Schedule {
    tasks: Vec<Task>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every task in the order it was added.
    pub fn invoke(self) {
        for task in self.tasks {
            task();
        }
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule").field("tasks", &self.tasks.len()).finish()
    }
}

impl IntoIterator for Schedule {
    type Item = Task;
    type IntoIter = std::vec::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

/// Something that runs batches of tasks after the current call stack unwinds.
///
/// Implementations must never run a batch synchronously inside `schedule`, and
/// must run the tasks of one batch in order.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, batch: Schedule);
}

/// A FIFO task queue drained explicitly by its owner.
///
/// Clones share the same queue.
#[derive(Clone, Default)]
pub struct TaskQueue {
    tasks: Arc<Mutex<VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    /// Runs queued tasks until the queue is empty, including any tasks that
    /// the running tasks enqueue. Returns how many tasks ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // the guard must be gone before the task runs; tasks enqueue more work
            let next = lock(&self.tasks).pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        trace!(ran, "task queue idle");
        ran
    }
}

impl Scheduler for TaskQueue {
    fn schedule(&self, batch: Schedule) {
        lock(&self.tasks).extend(batch);
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

thread_local! {
    static LOCAL_QUEUE: TaskQueue = TaskQueue::new();
    static DEFAULT: RefCell<Option<Arc<dyn Scheduler>>> = RefCell::new(None);
}

/// This thread's own task queue.
pub fn local_queue() -> TaskQueue {
    LOCAL_QUEUE.with(TaskQueue::clone)
}

/// Drains this thread's task queue. See [`TaskQueue::run_until_idle`].
pub fn run_until_idle() -> usize {
    local_queue().run_until_idle()
}

/// The scheduler new promises use on this thread: the one installed with
/// [`set_default`], or else the thread's [`local_queue`].
pub fn current() -> Arc<dyn Scheduler> {
    DEFAULT
        .with(|default| default.borrow().clone())
        .unwrap_or_else(|| Arc::new(local_queue()))
}

/// Makes `scheduler` this thread's default until the returned guard drops.
#[must_use = "the default is restored when the guard is dropped"]
pub fn set_default(scheduler: Arc<dyn Scheduler>) -> DefaultGuard {
    let previous = DEFAULT.with(|default| default.borrow_mut().replace(scheduler));
    DefaultGuard { previous }
}

/// Restores the previous default scheduler when dropped.
pub struct DefaultGuard {
    previous: Option<Arc<dyn Scheduler>>,
}

impl Drop for DefaultGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        DEFAULT.with(|default| *default.borrow_mut() = previous);
    }
}

impl fmt::Debug for DefaultGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultGuard")
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}
