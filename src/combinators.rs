//! Conveniences layered on top of `then`.
//!
//! Nothing here touches promise internals: these only attach handlers, call
//! the static factories and settle deferrals, like any other caller could.
use std::sync::{Arc, Mutex};

use crate::deferral::Deferral;
use crate::promise::{HandlerResult, Promise};
use crate::resolution::Resolution;
use crate::util::lock;
use crate::Error;

struct Gather<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: From<Error> + Clone + Send + 'static,
{
    /// A promise for every input's value, in input order.
    ///
    /// Inputs may be values, promises or thenables, and may settle in any
    /// order. The first rejection rejects the result.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_aplus::{scheduler, Promise, Resolution};
    ///
    /// let late = Promise::<i32>::defer();
    /// let all = Promise::all(vec![
    ///     Resolution::Promise(late.promise()),
    ///     Resolution::Value(2),
    /// ]);
    /// late.resolve(1);
    /// scheduler::run_until_idle();
    /// assert_eq!(all.peek(), Some(Ok(vec![1, 2])));
    /// ```
    pub fn all<I>(values: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let deferral = Deferral::<Vec<T>, E>::new();
        let inputs: Vec<Promise<T, E>> = values.into_iter().map(|value| Promise::<T, E>::resolve(value)).collect();
        if inputs.is_empty() {
            deferral.resolve(Vec::new());
            return deferral.promise();
        }

        let gather = Arc::new(Mutex::new(Gather {
            values: vec![None; inputs.len()],
            remaining: inputs.len(),
        }));
        for (index, input) in inputs.into_iter().enumerate() {
            let gather = gather.clone();
            let done = deferral.clone();
            let failed = deferral.clone();
            input.then(
                move |value| {
                    let finished = {
                        let mut gather = lock(&gather);
                        gather.values[index] = Some(value);
                        gather.remaining -= 1;
                        if gather.remaining == 0 {
                            Some(gather.values.drain(..).flatten().collect::<Vec<T>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = finished {
                        done.resolve(values);
                    }
                    Ok(Resolution::Value(()))
                },
                move |reason| {
                    failed.reject(reason);
                    Ok(Resolution::Value(()))
                },
            );
        }
        deferral.promise()
    }

    /// A promise settled like whichever input settles first. With no inputs
    /// it stays pending.
    pub fn race<I>(values: I) -> Promise<T, E>
    where
        I: IntoIterator<Item = Resolution<T, E>>,
    {
        let deferral = Deferral::new();
        for value in values {
            let won = deferral.clone();
            let lost = deferral.clone();
            Promise::<T, E>::resolve(value).then(
                move |value| {
                    won.resolve(value);
                    Ok(Resolution::Value(()))
                },
                move |reason| {
                    lost.reject(reason);
                    Ok(Resolution::Value(()))
                },
            );
        }
        deferral.promise()
    }

    /// Runs `on_settled` once this promise settles either way, waits for what
    /// it returns, then passes the original value or reason along.
    ///
    /// If `on_settled` fails, or what it returns rejects, that reason wins.
    pub fn finally<F>(&self, on_settled: F) -> Promise<T, E>
    where
        F: FnOnce() -> HandlerResult<(), E> + Send + 'static,
    {
        let on_fulfilled = Arc::new(Mutex::new(Some(on_settled)));
        let on_rejected = on_fulfilled.clone();
        self.then(
            move |value| {
                let after = run_once(&on_fulfilled);
                Ok(Resolution::Promise(after.and_then(move |()| Ok(Resolution::Value(value)))))
            },
            move |reason| {
                let after = run_once(&on_rejected);
                Ok(Resolution::Promise(after.and_then(move |()| Err(reason))))
            },
        )
    }
}

fn run_once<E, F>(slot: &Mutex<Option<F>>) -> Promise<(), E>
where
    E: From<Error> + Clone + Send + 'static,
    F: FnOnce() -> HandlerResult<(), E>,
{
    let on_settled = lock(slot).take();
    match on_settled.map(|f| f()) {
        Some(Ok(x)) => Promise::resolve(x),
        Some(Err(reason)) => Promise::reject(reason),
        None => Promise::resolve(()),
    }
}
