//! The promise resolution procedure.
//!
//! Every value that resolves a promise, whether passed to
//! [`Deferral::resolve`] or returned from a handler, goes through
//! [`resolve`]. In order:
//!
//! 1. the promise itself, even behind a [`Thenable`]: reject with
//!    [`Error::ChainCycle`];
//! 2. another promise of this crate: adopt its eventual state;
//! 3. a plain value: fulfill;
//! 4. a [`Thenable`]: look up its `then`; a failed lookup rejects, a missing
//!    `then` fulfills with the object as a plain value;
//! 5. otherwise call `then` with a [`ResolvePromise`] / [`RejectPromise`] pair
//!    and adopt whatever it reports first.
//!
//! Foreign thenables are untrusted. Of the three ways a `then` call can
//! report (resolving, rejecting, failing) only the first is honoured, no
//! matter how many times or in what order the others happen afterwards.
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::deferral::Deferral;
use crate::promise::{Link, Promise};
use crate::scheduler::Task;
use crate::util::{catch_panic, Latch};
use crate::Error;

/// Anything a promise can be resolved with.
pub enum Resolution<T, E = Error> {
    Value(T),
    Promise(Promise<T, E>),
    Thenable(Arc<dyn Thenable<T, E>>),
}

impl<T, E> From<T> for Resolution<T, E> {
    fn from(value: T) -> Self {
        Resolution::Value(value)
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// Calls `then` on a thenable, already bound to it. `Err` means the call
/// failed.
pub type ThenFn<T, E> = Box<dyn FnOnce(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E> + Send>;

/// The outcome of looking up a thenable's `then`.
pub enum Then<T, E> {
    Callable(ThenFn<T, E>),
    /// `then` is missing or not callable; the object is just this value.
    Plain(T),
}

/// An object that may carry a `then(on_fulfilled, on_rejected)` method,
/// from this crate or any other promise implementation.
pub trait Thenable<T, E>: Send + Sync {
    /// Reads `then`. An `Err` means reading it failed.
    fn lookup_then(&self) -> Result<Then<T, E>, E>;

    /// The promise of this crate behind the object, if there is one. Such
    /// thenables are adopted directly instead of through `then`.
    fn as_promise(&self) -> Option<Promise<T, E>> {
        None
    }
}

/// A thenable whose `then` is the closure `f`.
///
/// # Examples
///
/// ```
/// use promise_aplus::{scheduler, thenable, Error, Promise, Resolution};
///
/// let answer = thenable::<i32, Error, _>(|resolve, _reject| {
///     resolve.resolve(42);
///     Ok(())
/// });
/// let promise = Promise::<i32>::resolve(Resolution::Thenable(answer));
/// scheduler::run_until_idle();
/// assert_eq!(promise.peek(), Some(Ok(42)));
/// ```
pub fn thenable<T, E, F>(f: F) -> Arc<dyn Thenable<T, E>>
where
    T: 'static,
    E: 'static,
    F: Fn(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E> + Send + Sync + 'static,
{
    Arc::new(FnThenable(Arc::new(f)))
}

struct FnThenable<F>(Arc<F>);

impl<T, E, F> Thenable<T, E> for FnThenable<F>
where
    T: 'static,
    E: 'static,
    F: Fn(ResolvePromise<T, E>, RejectPromise<T, E>) -> Result<(), E> + Send + Sync + 'static,
{
    fn lookup_then(&self) -> Result<Then<T, E>, E> {
        let then = self.0.clone();
        Ok(Then::Callable(Box::new(move |resolve, reject| then(resolve, reject))))
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    fn lookup_then(&self) -> Result<Then<T, E>, E> {
        let promise = self.clone();
        Ok(Then::Callable(Box::new(move |resolve, reject| {
            promise.then(
                move |value| {
                    resolve.resolve(value);
                    Ok(Resolution::Value(()))
                },
                move |reason| {
                    reject.reject(reason);
                    Ok(Resolution::Value(()))
                },
            );
            Ok(())
        })))
    }

    fn as_promise(&self) -> Option<Promise<T, E>> {
        Some(self.clone())
    }
}

/// The `resolvePromise` callback handed to a thenable's `then`.
pub struct ResolvePromise<T, E> {
    target: Deferral<T, E>,
    latch: Latch,
}

/// The `rejectPromise` callback handed to a thenable's `then`.
pub struct RejectPromise<T, E> {
    target: Deferral<T, E>,
    latch: Latch,
}

impl<T, E> Clone for ResolvePromise<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<T, E> Clone for RejectPromise<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            latch: self.latch.clone(),
        }
    }
}

impl<T, E> ResolvePromise<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    /// Resolves the waiting promise with `value`, which may itself be a
    /// promise or thenable. Ignored unless it is the thenable's first signal.
    pub fn resolve(&self, value: impl Into<Resolution<T, E>>) {
        if self.latch.trip() {
            resolve(&self.target, value.into());
        } else {
            trace!("thenable resolved after it had already settled, ignoring");
        }
    }
}

impl<T, E> RejectPromise<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    /// Rejects the waiting promise with `reason`. Ignored unless it is the
    /// thenable's first signal.
    pub fn reject(&self, reason: E) {
        if self.latch.trip() {
            self.target.fail(reason);
        } else {
            trace!("thenable rejected after it had already settled, ignoring");
        }
    }
}

impl<T, E> fmt::Debug for ResolvePromise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvePromise").field("latch", &self.latch).finish()
    }
}

impl<T, E> fmt::Debug for RejectPromise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectPromise").field("latch", &self.latch).finish()
    }
}

/// Folds `x` into the settlement of `target`.
pub(crate) fn resolve<T, E>(target: &Deferral<T, E>, x: Resolution<T, E>)
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    match x {
        Resolution::Promise(promise) if target.owns(&promise) => {
            debug!("promise resolved with itself, rejecting");
            target.fail(E::from(Error::ChainCycle));
        }
        Resolution::Promise(promise) => promise.subscribe(Box::new(Adopt {
            target: target.clone(),
        })),
        Resolution::Value(value) => target.fulfill(value),
        Resolution::Thenable(object) => match object.as_promise() {
            Some(promise) => resolve(target, Resolution::Promise(promise)),
            None => assimilate(target, object),
        },
    }
}

/// Settles a deferral the way the promise it waits on settled.
struct Adopt<T, E> {
    target: Deferral<T, E>,
}

impl<T, E> Link<T, E> for Adopt<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    fn select(self: Box<Self>, settled: &Result<T, E>) -> Task {
        let target = self.target;
        match settled.clone() {
            Ok(value) => Box::new(move || resolve(&target, Resolution::Value(value))),
            Err(reason) => Box::new(move || target.fail(reason)),
        }
    }
}

fn assimilate<T, E>(target: &Deferral<T, E>, object: Arc<dyn Thenable<T, E>>)
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    let then = match catch_panic(|| object.lookup_then()) {
        Ok(Ok(Then::Callable(then))) => then,
        Ok(Ok(Then::Plain(value))) => return target.fulfill(value),
        Ok(Err(reason)) => {
            debug!("reading then failed, rejecting");
            return target.fail(reason);
        }
        Err(panicked) => {
            warn!(error = %panicked, "reading then panicked");
            return target.fail(E::from(panicked));
        }
    };

    let latch = Latch::new();
    let resolve_promise = ResolvePromise {
        target: target.clone(),
        latch: latch.clone(),
    };
    let reject_promise = RejectPromise {
        target: target.clone(),
        latch: latch.clone(),
    };
    let failure = match catch_panic(move || then(resolve_promise, reject_promise)) {
        Ok(Ok(())) => return,
        Ok(Err(reason)) => reason,
        Err(panicked) => {
            warn!(error = %panicked, "calling then panicked");
            E::from(panicked)
        }
    };
    if latch.trip() {
        target.fail(failure);
    } else {
        trace!("then failed after it had already settled, ignoring");
    }
}
