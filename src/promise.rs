//! The promise state machine.
//!
//! A promise is pending until its [`Deferral`] settles it, then stays
//! fulfilled or rejected forever. Each call to [`Promise::then`] records a
//! chain link; links are drained in one batch the moment the promise is
//! settled (or straight away when it already is) and handed to the promise's
//! scheduler.
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{trace, warn};

use crate::deferral::Deferral;
use crate::resolution::Resolution;
use crate::scheduler::{self, Schedule, Scheduler, Task};
use crate::util::{catch_panic, lock};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "pending",
            State::Fulfilled => "fulfilled",
            State::Rejected => "rejected",
        })
    }
}

/// What a handler hands back: a value (or promise, or thenable) to resolve
/// the next promise with, or a reason to reject it with.
pub type HandlerResult<U, E> = Result<Resolution<U, E>, E>;

type Handler<A, U, E> = Box<dyn FnOnce(A) -> HandlerResult<U, E> + Send>;

/// A registration waiting for its promise to settle.
pub(crate) trait Link<T, E>: Send {
    /// Picks the task to run for the settled outcome.
    fn select(self: Box<Self>, settled: &Result<T, E>) -> Task;
}

/// One call to `then`: the two handlers and the deferral of the promise it
/// returned.
struct ChainLink<T, U, E> {
    on_fulfilled: Handler<T, U, E>,
    on_rejected: Handler<E, U, E>,
    downstream: Deferral<U, E>,
}

impl<T, U, E> Link<T, E> for ChainLink<T, U, E>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    fn select(self: Box<Self>, settled: &Result<T, E>) -> Task {
        let ChainLink {
            on_fulfilled,
            on_rejected,
            downstream,
        } = *self;
        match settled {
            Ok(value) => executes(on_fulfilled, value.clone(), downstream),
            Err(reason) => executes(on_rejected, reason.clone(), downstream),
        }
    }
}

/// Wraps a handler into a task that feeds its outcome to `downstream`.
fn executes<A, U, E>(handler: Handler<A, U, E>, arg: A, downstream: Deferral<U, E>) -> Task
where
    A: Send + 'static,
    U: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    Box::new(move || match catch_panic(move || handler(arg)) {
        Ok(Ok(x)) => downstream.resolve(x),
        Ok(Err(reason)) => downstream.reject(reason),
        Err(panicked) => {
            warn!(error = %panicked, "promise handler panicked");
            downstream.reject(E::from(panicked));
        }
    })
}

struct Inner<T, E> {
    settled: Option<Result<T, E>>,
    chains: Vec<Box<dyn Link<T, E>>>,
}

/// An eventual, single-assignment result.
///
/// Cloning a promise clones the handle; both handles observe the same state.
pub struct Promise<T, E = Error> {
    inner: Arc<Mutex<Inner<T, E>>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T, E> Promise<T, E> {
    pub(crate) fn pending(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                settled: None,
                chains: Vec::new(),
            })),
            scheduler,
        }
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> State {
        match lock(&self.inner).settled {
            None => State::Pending,
            Some(Ok(_)) => State::Fulfilled,
            Some(Err(_)) => State::Rejected,
        }
    }

    /// The scheduler this promise's handlers run on.
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    /// Creates a promise on this thread's default scheduler and runs
    /// `executor` synchronously with its deferral.
    ///
    /// An `Err` (or panic) from the executor rejects the promise unless the
    /// executor already settled it.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{Promise, State};
    ///
    /// let promise = Promise::<&str>::new(|deferral| {
    ///     deferral.resolve("🍓");
    ///     Ok(())
    /// });
    /// assert_eq!(promise.state(), State::Fulfilled);
    /// ```
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Deferral<T, E>) -> Result<(), E>,
    {
        Self::new_in(scheduler::current(), executor)
    }

    /// Like [`Promise::new`], on the given scheduler.
    pub fn new_in<F>(scheduler: Arc<dyn Scheduler>, executor: F) -> Self
    where
        F: FnOnce(Deferral<T, E>) -> Result<(), E>,
    {
        let deferral = Deferral::with_scheduler(scheduler);
        let handle = deferral.clone();
        match catch_panic(move || executor(handle)) {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => deferral.reject(reason),
            Err(panicked) => {
                warn!(error = %panicked, "promise executor panicked");
                deferral.reject(E::from(panicked));
            }
        }
        deferral.promise()
    }

    /// A fresh pending promise together with its settlement controls.
    pub fn defer() -> Deferral<T, E> {
        Deferral::new()
    }

    pub fn defer_in(scheduler: Arc<dyn Scheduler>) -> Deferral<T, E> {
        Deferral::with_scheduler(scheduler)
    }

    /// A promise that adopts `value`, unwrapping promises and thenables.
    pub fn resolve(value: impl Into<Resolution<T, E>>) -> Self {
        let deferral = Deferral::new();
        deferral.resolve(value);
        deferral.promise()
    }

    /// A promise rejected with `reason` as is.
    pub fn reject(reason: E) -> Self {
        let deferral = Deferral::new();
        deferral.reject(reason);
        deferral.promise()
    }

    /// Registers handlers for the settled value or reason.
    ///
    /// The returned promise is new, and settles by whatever the selected
    /// handler returns, or rejects with whatever it errs with. Handlers never
    /// run before this call returns, even on a settled promise.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> HandlerResult<U, E> + Send + 'static,
        R: FnOnce(E) -> HandlerResult<U, E> + Send + 'static,
    {
        self.link(Box::new(on_fulfilled), Box::new(on_rejected))
    }

    /// `then` without a rejection handler: reasons pass through untouched.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> HandlerResult<U, E> + Send + 'static,
    {
        self.link(Box::new(on_fulfilled), Box::new(|reason| Err(reason)))
    }

    /// `then` without a fulfillment handler: values pass through untouched.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> HandlerResult<T, E> + Send + 'static,
    {
        self.link(Box::new(|value| Ok(Resolution::Value(value))), Box::new(on_rejected))
    }

    /// `then` with neither handler. The returned promise mirrors this one.
    pub fn chain(&self) -> Promise<T, E> {
        self.link(Box::new(|value| Ok(Resolution::Value(value))), Box::new(|reason| Err(reason)))
    }

    fn link<U>(&self, on_fulfilled: Handler<T, U, E>, on_rejected: Handler<E, U, E>) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
    {
        let downstream = Deferral::with_scheduler(self.scheduler.clone());
        let promise = downstream.promise();
        self.subscribe(Box::new(ChainLink {
            on_fulfilled,
            on_rejected,
            downstream,
        }));
        promise
    }

    /// A snapshot of the settled outcome, `None` while pending.
    pub fn peek(&self) -> Option<Result<T, E>> {
        lock(&self.inner).settled.clone()
    }

    pub(crate) fn subscribe(&self, link: Box<dyn Link<T, E>>) {
        lock(&self.inner).chains.push(link);
        self.dispatch();
    }

    /// Settles the promise. Later calls are ignored.
    pub(crate) fn settle(&self, outcome: Result<T, E>) {
        {
            let mut inner = lock(&self.inner);
            if inner.settled.is_some() {
                trace!("promise already settled, ignoring");
                return;
            }
            trace!(fulfilled = outcome.is_ok(), "promise settled");
            inner.settled = Some(outcome);
        }
        self.dispatch();
    }

    fn dispatch(&self) {
        let (settled, links) = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            let Some(settled) = &inner.settled else {
                return;
            };
            if inner.chains.is_empty() {
                return;
            }
            (settled.clone(), std::mem::take(&mut inner.chains))
        };
        let mut schedule = Schedule::new();
        for link in links {
            schedule.add(link.select(&settled));
        }
        self.scheduler.schedule(schedule);
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &lock(&self.inner).settled {
            None => write!(f, "Promise <pending>"),
            Some(Ok(value)) => write!(f, "Promise <fulfilled: {:?}>", value),
            Some(Err(reason)) => write!(f, "Promise <rejected: {:?}>", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::run_until_idle;

    #[derive(Debug, Clone, PartialEq)]
    enum Reason {
        Lib(Error),
        Msg(&'static str),
    }

    impl From<Error> for Reason {
        fn from(err: Error) -> Self {
            Reason::Lib(err)
        }
    }

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) {
        log.lock().unwrap().push(entry);
    }

    #[test]
    fn test_then_on_settled_promise_is_async() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let promise = Promise::<i32>::resolve(1);
        assert_eq!(promise.state(), State::Fulfilled);
        let next = promise.and_then(move |v| {
            *flag.lock().unwrap() = true;
            Ok(Resolution::Value(v))
        });
        assert!(!*called.lock().unwrap());
        assert_eq!(next.state(), State::Pending);
        run_until_idle();
        assert!(*called.lock().unwrap());
        assert_eq!(next.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_then_returns_a_new_promise() {
        let promise = Promise::<i32>::resolve(1);
        let next = promise.chain();
        assert!(!promise.ptr_eq(&next));
        assert!(promise.ptr_eq(&promise.clone()));
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deferral = Promise::<i32>::defer();
        let promise = deferral.promise();
        for entry in ["h1", "h2", "h3"] {
            let log = log.clone();
            promise.and_then(move |_| {
                record(&log, entry);
                Ok(Resolution::Value(()))
            });
        }
        run_until_idle();
        assert!(log.lock().unwrap().is_empty());
        deferral.resolve(1);
        run_until_idle();
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn test_only_first_settlement_counts() {
        let deferral = Promise::<i32, Reason>::defer();
        deferral.resolve(1);
        deferral.resolve(2);
        deferral.reject(Reason::Msg("late"));
        assert_eq!(deferral.promise().peek(), Some(Ok(1)));

        let deferral = Promise::<i32, Reason>::defer();
        deferral.reject(Reason::Msg("first"));
        deferral.resolve(2);
        assert_eq!(deferral.promise().peek(), Some(Err(Reason::Msg("first"))));
    }

    #[test]
    fn test_rejection_passes_through_missing_handlers() {
        let rejected = Promise::<i32, Reason>::reject(Reason::Msg("err"));
        let tail = rejected
            .chain()
            .and_then(|v| Ok(Resolution::Value(v + 1)))
            .chain();
        run_until_idle();
        assert_eq!(tail.peek(), Some(Err(Reason::Msg("err"))));

        let fulfilled = Promise::<i32, Reason>::resolve(3);
        let tail = fulfilled.catch(|_| Ok(Resolution::Value(0)));
        run_until_idle();
        assert_eq!(tail.peek(), Some(Ok(3)));
    }

    #[test]
    fn test_catch_recovers() {
        let recovered = Promise::<i32, Reason>::reject(Reason::Msg("err"))
            .and_then(|v| Ok(Resolution::Value(v * 10)))
            .catch(|reason| {
                assert_eq!(reason, Reason::Msg("err"));
                Ok(Resolution::Value(-1))
            });
        run_until_idle();
        assert_eq!(recovered.peek(), Some(Ok(-1)));
    }

    #[test]
    fn test_handler_error_rejects_downstream() {
        let failed = Promise::<i32, Reason>::resolve(1).then(
            |_| Err::<Resolution<i32, Reason>, _>(Reason::Msg("thrown")),
            |_| Ok(Resolution::Value(0)),
        );
        run_until_idle();
        assert_eq!(failed.peek(), Some(Err(Reason::Msg("thrown"))));
    }

    #[test]
    fn test_handler_panic_rejects_downstream() {
        let failed = Promise::<i32, Reason>::resolve(1).and_then(|_| -> HandlerResult<i32, Reason> {
            panic!("handler blew up")
        });
        run_until_idle();
        assert_eq!(
            failed.peek(),
            Some(Err(Reason::Lib(Error::Panicked("handler blew up".into()))))
        );
    }

    #[test]
    fn test_chain_added_while_dispatching_runs_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let promise = Promise::<i32>::resolve(1);
        let again = promise.clone();
        let outer_log = log.clone();
        promise.and_then(move |_| {
            record(&outer_log, "outer");
            let inner_log = outer_log.clone();
            again.and_then(move |_| {
                record(&inner_log, "inner");
                Ok(Resolution::Value(()))
            });
            Ok(Resolution::Value(()))
        });
        assert_eq!(run_until_idle(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_executor_runs_synchronously() {
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let promise = Promise::<i32>::new(move |deferral| {
            *flag.lock().unwrap() = true;
            deferral.resolve(5);
            Ok(())
        });
        assert!(*ran.lock().unwrap());
        assert_eq!(promise.peek(), Some(Ok(5)));
    }

    #[test]
    fn test_executor_error_rejects_unless_settled() {
        let rejected = Promise::<i32, Reason>::new(|_| Err(Reason::Msg("executor")));
        assert_eq!(rejected.peek(), Some(Err(Reason::Msg("executor"))));

        let kept = Promise::<i32, Reason>::new(|deferral| {
            deferral.resolve(1);
            Err(Reason::Msg("ignored"))
        });
        assert_eq!(kept.peek(), Some(Ok(1)));

        let panicked = Promise::<i32, Reason>::new(|_| panic!("executor blew up"));
        assert_eq!(panicked.state(), State::Rejected);
    }

    #[test]
    fn test_debug_rendering() {
        let deferral = Promise::<i32>::defer();
        assert_eq!(format!("{:?}", deferral.promise()), "Promise <pending>");
        deferral.resolve(5);
        assert_eq!(format!("{:?}", deferral.promise()), "Promise <fulfilled: 5>");
        let rejected = Promise::<i32>::reject(Error::ChainCycle);
        assert_eq!(format!("{:?}", rejected), "Promise <rejected: ChainCycle>");
        assert_eq!(State::Rejected.to_string(), "rejected");
    }
}
