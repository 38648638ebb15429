//! Small helpers shared by the promise machinery.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::Error;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// User code never runs while one of our locks is held, so a poisoned lock
/// cannot hide a half-applied state change.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A one-shot flag shared between several callbacks. Only the first caller of
/// [`Latch::trip`] wins.
#[derive(Debug, Clone, Default)]
pub(crate) struct Latch(Arc<AtomicBool>);

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once, for the first caller.
    pub(crate) fn trip(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    #[cfg(test)]
    pub(crate) fn is_tripped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Runs `f`, turning a panic into [`Error::Panicked`].
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| Error::Panicked(panic_message(&*payload)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
