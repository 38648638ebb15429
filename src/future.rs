//! Awaiting a promise from async Rust.
//!
//! [`Settled`] registers a chain link on the promise and wakes the task that
//! polls it once that link runs, so the promise's scheduler has to be driven
//! for the future to complete. A [`ChannelScheduler`](crate::ChannelScheduler)
//! drives itself.
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::promise::{Link, Promise};
use crate::scheduler::Task;
use crate::util::lock;
use crate::Error;

/// A future for the settled outcome of a promise.
///
/// # Examples
///
/// ```
/// use promise_aplus::{ChannelConfig, ChannelScheduler, Promise};
/// use futures::executor::block_on;
/// use std::sync::Arc;
/// use std::thread;
///
/// let worker = ChannelScheduler::spawn(ChannelConfig::default()).unwrap();
/// let deferral = Promise::<String>::defer_in(Arc::new(worker.clone()));
/// let settled = deferral.promise().settled();
///
/// let task = thread::spawn(move || block_on(settled));
/// deferral.resolve(String::from("🍓"));
/// assert_eq!(task.join().expect("The task thread has panicked"), Ok("🍓".into()));
/// worker.shutdown();
/// ```
pub struct Settled<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
}

struct Slot<T, E> {
    value: Option<Result<T, E>>,
    waker: Option<Waker>,
}

/// Fills a [`Slot`] when the promise settles.
struct Notify<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
}

impl<T, E> Link<T, E> for Notify<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn select(self: Box<Self>, settled: &Result<T, E>) -> Task {
        let settled = settled.clone();
        let slot = self.slot;
        Box::new(move || {
            let waker = {
                let mut slot = lock(&slot);
                slot.value = Some(settled);
                slot.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake()
            }
        })
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    /// A future resolving to this promise's value or reason.
    pub fn settled(&self) -> Settled<T, E> {
        let slot = Arc::new(Mutex::new(Slot {
            value: None,
            waker: None,
        }));
        self.subscribe(Box::new(Notify { slot: slot.clone() }));
        Settled { slot }
    }
}

impl<T, E> Future for Settled<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = lock(&self.slot);
        match slot.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T, E> IntoFuture for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled()
    }
}

impl<T, E> fmt::Debug for Settled<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settled")
            .field("ready", &lock(&self.slot).value.is_some())
            .finish()
    }
}
