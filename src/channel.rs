//! A channel scheduler sends every batch over a multi-producer,
//! single-consumer channel to one worker thread, which runs them in arrival
//! order. Handles can be cloned freely; the worker stops once every handle
//! is gone or [`ChannelScheduler::shutdown`] is called.
//!
use std::fmt;
use std::io;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::scheduler::{self, Schedule, Scheduler};
use crate::util::{catch_panic, lock};

/// Settings for the worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub thread_name: String,
    /// Stack size in bytes, or the platform default.
    pub stack_size: Option<usize>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            thread_name: "promise-scheduler".to_owned(),
            stack_size: None,
        }
    }
}

#[derive(Clone)]
pub struct ChannelScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    sender: Mutex<Option<Sender<Schedule>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn send(&self, batch: Schedule) {
        let refused = {
            let sender = lock(&self.sender);
            match sender.as_ref() {
                Some(sender) => sender.send(batch).err().map(|err| err.0),
                None => Some(batch),
            }
        };
        if let Some(batch) = refused {
            warn!(tasks = batch.len(), "scheduler is shut down, dropping batch");
        }
    }
}

/// What the worker installs as its own default scheduler. It must not keep
/// the channel open by itself.
struct WorkerHandle(Weak<Inner>);

impl Scheduler for WorkerHandle {
    fn schedule(&self, batch: Schedule) {
        match self.0.upgrade() {
            Some(inner) => inner.send(batch),
            None => warn!(tasks = batch.len(), "scheduler is gone, dropping batch"),
        }
    }
}

impl ChannelScheduler {
    /// Starts the worker thread.
    pub fn spawn(config: ChannelConfig) -> io::Result<Self> {
        let (sender, receiver) = channel::<Schedule>();
        let inner = Arc::new(Inner {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(None),
        });
        let handle = WorkerHandle(Arc::downgrade(&inner));

        let mut builder = thread::Builder::new().name(config.thread_name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }
        let name = config.thread_name;
        let worker = builder.spawn(move || {
            let _default = scheduler::set_default(Arc::new(handle));
            debug!(thread = %name, "scheduler worker started");
            for batch in receiver {
                for task in batch {
                    if let Err(panicked) = catch_panic(task) {
                        warn!(error = %panicked, "scheduled task panicked");
                    }
                }
            }
            debug!(thread = %name, "scheduler worker stopped");
        })?;
        *lock(&inner.worker) = Some(worker);
        Ok(Self { inner })
    }

    /// Closes the channel and waits for the worker to finish the batches
    /// already sent. Batches scheduled afterwards are dropped.
    ///
    /// Called from a task on the worker itself, it only closes the channel.
    pub fn shutdown(&self) {
        drop(lock(&self.inner.sender).take());
        let worker = lock(&self.inner.worker).take();
        let Some(worker) = worker else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("scheduler worker panicked");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }
}

impl Scheduler for ChannelScheduler {
    fn schedule(&self, batch: Schedule) {
        self.inner.send(batch);
    }
}

impl fmt::Debug for ChannelScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelScheduler")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::promise::Promise;
    use crate::resolution::Resolution;

    fn spawn_named(name: &str) -> ChannelScheduler {
        ChannelScheduler::spawn(ChannelConfig {
            thread_name: name.to_owned(),
            stack_size: Some(256 * 1024),
        })
        .expect("worker thread should spawn")
    }

    #[test]
    fn test_handlers_run_on_worker_thread() {
        let worker = spawn_named("promise-worker-a");
        let deferral = Promise::<i32>::defer_in(Arc::new(worker.clone()));
        let name = deferral.promise().and_then(|_| {
            Ok(Resolution::Value(thread::current().name().map(str::to_owned)))
        });
        deferral.resolve(1);
        assert_eq!(
            block_on(name.settled()),
            Ok(Some("promise-worker-a".to_owned()))
        );
        worker.shutdown();
    }

    #[test]
    fn test_batch_runs_on_named_worker() {
        let worker = spawn_named("promise-worker-b");
        let (tx, rx) = mpsc::channel();
        let mut batch = Schedule::new();
        batch.add(Box::new(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        }));
        worker.schedule(batch);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some("promise-worker-b".to_owned())
        );
        worker.shutdown();
    }

    #[test]
    fn test_promise_scheduler_is_the_worker() {
        let worker = spawn_named("promise-worker-f");
        let promise = Promise::<i32>::defer_in(Arc::new(worker.clone())).promise();
        let chained = promise.and_then(|v| Ok(Resolution::Value(v)));
        let (tx, rx) = mpsc::channel();
        let mut batch = Schedule::new();
        batch.add(Box::new(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        }));
        chained.scheduler().schedule(batch);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some("promise-worker-f".to_owned())
        );
        worker.shutdown();
    }

    #[test]
    fn test_promises_created_in_handlers_stay_on_worker() {
        let worker = spawn_named("promise-worker-c");
        let deferral = Promise::<i32>::defer_in(Arc::new(worker.clone()));
        let nested = deferral.promise().and_then(|v| {
            let inner = Promise::<i32>::resolve(v).and_then(|v| Ok(Resolution::Value(v * 3)));
            Ok(Resolution::Promise(inner))
        });
        deferral.resolve(5);
        let outcome = thread::spawn(move || block_on(nested.settled()))
            .join()
            .expect("The task thread has panicked");
        assert_eq!(outcome, Ok(15));
        worker.shutdown();
    }

    #[test]
    fn test_shutdown_drains_then_drops_new_batches() {
        let worker = spawn_named("promise-worker-d");
        let (tx, rx) = mpsc::channel();
        let before = tx.clone();
        let mut batch = Schedule::new();
        batch.add(Box::new(move || before.send("before").unwrap()));
        worker.schedule(batch);
        worker.shutdown();
        assert!(worker.is_shut_down());
        assert_eq!(rx.try_recv(), Ok("before"));

        let mut late = Schedule::new();
        late.add(Box::new(move || tx.send("after").unwrap()));
        worker.schedule(late);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_panicking_task_keeps_worker_alive() {
        let worker = spawn_named("promise-worker-e");
        let (tx, rx) = mpsc::channel();
        let mut batch = Schedule::new();
        batch.add(Box::new(|| panic!("task blew up")));
        batch.add(Box::new(move || tx.send(1).unwrap()));
        worker.schedule(batch);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        worker.shutdown();
    }
}
