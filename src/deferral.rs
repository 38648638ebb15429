//! The settlement side of a promise.
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::promise::Promise;
use crate::resolution::{self, Resolution};
use crate::scheduler::{self, Scheduler};
use crate::util::Latch;
use crate::Error;

/// Owns a promise together with the right to settle it.
///
/// Clones share the same promise, so a deferral can be handed to whichever
/// code produces the result. Only the first `resolve` or `reject` across all
/// clones has any effect, even when that first call resolved with a promise
/// that has not settled yet.
///
/// # Examples
///
/// ```
/// use promise_aplus::{scheduler, Deferral, Resolution};
/// use std::thread;
///
/// let deferral = Deferral::<String>::new();
/// let promise = deferral.promise();
/// let producer = deferral.clone();
/// thread::spawn(move || producer.resolve(String::from("🍓")))
///     .join()
///     .expect("The producer thread has panicked");
///
/// let len = promise.and_then(|s| Ok(Resolution::Value(s.chars().count())));
/// scheduler::run_until_idle();
/// assert_eq!(len.peek(), Some(Ok(1)));
/// ```
pub struct Deferral<T, E = Error> {
    promise: Promise<T, E>,
    claimed: Latch,
}

impl<T, E> Clone for Deferral<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            claimed: self.claimed.clone(),
        }
    }
}

impl<T, E> Deferral<T, E> {
    /// A pending deferral on this thread's default scheduler.
    pub fn new() -> Self {
        Self::with_scheduler(scheduler::current())
    }

    pub fn with_scheduler(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            promise: Promise::pending(scheduler),
            claimed: Latch::new(),
        }
    }

    /// The promise this deferral settles.
    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    pub(crate) fn owns(&self, candidate: &Promise<T, E>) -> bool {
        self.promise.ptr_eq(candidate)
    }
}

impl<T, E> Default for Deferral<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Deferral<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    /// Resolves the promise with `value`.
    ///
    /// Plain values fulfill it. Promises and thenables are adopted: the
    /// promise ends up however they end up, which may be rejected.
    pub fn resolve(&self, value: impl Into<Resolution<T, E>>) {
        if self.claim() {
            resolution::resolve(self, value.into());
        }
    }

    /// Rejects the promise with `reason`. The reason is never unwrapped.
    pub fn reject(&self, reason: E) {
        if self.claim() {
            self.fail(reason);
        }
    }

    fn claim(&self) -> bool {
        let first = self.claimed.trip();
        if !first {
            trace!("deferral already resolved, ignoring");
        }
        first
    }

    pub(crate) fn fulfill(&self, value: T) {
        self.promise.settle(Ok(value));
    }

    pub(crate) fn fail(&self, reason: E) {
        self.promise.settle(Err(reason));
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Deferral<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferral").field("promise", &self.promise).finish()
    }
}
