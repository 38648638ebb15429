//! Promises/A+ deferred values.
//!
//! A [`Promise`] is a single-assignment result that starts pending and settles
//! exactly once, fulfilled with a value or rejected with a reason. Handlers
//! attached with [`Promise::then`] always run later, on the promise's
//! [`Scheduler`], never on the stack that settled it. Whatever a handler
//! returns is folded into the next promise of the chain by the resolution
//! procedure, which unwraps this crate's own promises as well as foreign
//! [`Thenable`]s.
//!
//! Only the holder of a [`Deferral`] can settle its promise; holders of the
//! [`Promise`] can observe and chain.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{scheduler, Promise, Resolution};
//!
//! let deferral = Promise::<i32>::defer();
//! let doubled = deferral.promise().and_then(|v| Ok(Resolution::Value(v * 2)));
//! deferral.resolve(21);
//! deferral.resolve(0); // ignored, already settled
//!
//! scheduler::run_until_idle();
//! assert_eq!(doubled.peek(), Some(Ok(42)));
//! ```
pub mod channel;
pub mod combinators;
pub mod deferral;
pub mod future;
pub mod promise;
pub mod resolution;
pub mod scheduler;
mod util;

use thiserror::Error;

pub use channel::{ChannelConfig, ChannelScheduler};
pub use deferral::Deferral;
pub use future::Settled;
pub use promise::{HandlerResult, Promise, State};
pub use resolution::{thenable, RejectPromise, ResolvePromise, Resolution, Then, ThenFn, Thenable};
pub use scheduler::{Schedule, Scheduler, Task, TaskQueue};

/// Errors the library itself raises. They reach users as rejection reasons,
/// through `E: From<Error>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A handler or `resolve` tried to settle a promise with itself.
    #[error("handlers must not return current chain")]
    ChainCycle,
    /// A handler, executor or thenable panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}
