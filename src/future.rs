// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! A one-shot future cell.
//!
//! Every handler invocation produces one of these. The cell holds either a
//! pending continuation or a delivered value; the transition is one-shot
//! and the observer fires at most once, no matter how many
//! [`Completer`] clones race to deliver. This is deliberately not a
//! general-purpose promise library: one cell, one value, one observer.

use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The consuming side of a one-shot cell.
pub struct FutureValue<T> {
    shared: Arc<Shared<T>>,
}

/// The producing side. Cloneable so independent outcomes (a handler and a
/// deadline, say) can race; the first `complete` wins and the rest are
/// no-ops.
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Completer<T> {
        Completer { shared: self.shared.clone() }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

enum State<T> {
    Pending { observer: Option<Box<dyn FnOnce(T) + Send>> },
    // Value delivered, nobody consumed it yet.
    Done(Option<T>),
    // Value delivered and consumed.
    Spent,
}

/// Creates a pending cell and its completer.
pub fn pending<T>() -> (Completer<T>, FutureValue<T>)
    where T: Send + 'static
{
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending { observer: None }),
        condvar: Condvar::new(),
    });
    (Completer { shared: shared.clone() }, FutureValue { shared })
}

impl<T> FutureValue<T>
    where T: Send + 'static
{
    /// A cell already holding `value`.
    pub fn ready(value: T) -> FutureValue<T> {
        let (completer, future) = pending();
        completer.complete(value);
        future
    }

    /// True once a value has been delivered.
    pub fn is_complete(&self) -> bool {
        match *self.shared.state.lock().unwrap() {
            State::Pending { .. } => false,
            _ => true,
        }
    }

    /// Registers the single observer. Runs immediately on the calling
    /// thread if the value is already there, otherwise later on whichever
    /// thread delivers it.
    pub fn on_complete<F>(self, observer: F)
        where F: FnOnce(T) + Send + 'static
    {
        let mut state = self.shared.state.lock().unwrap();
        match mem::replace(&mut *state, State::Spent) {
            State::Pending { observer: None } => {
                *state = State::Pending { observer: Some(Box::new(observer)) };
            }
            State::Pending { observer: Some(_) } => {
                // Unreachable: registration consumes the future.
                unreachable!("observer registered twice on a one-shot cell");
            }
            State::Done(Some(value)) => {
                drop(state);
                observer(value);
            }
            State::Done(None) | State::Spent => {}
        }
    }

    /// Blocks until the value arrives. The threaded engine's defining
    /// move: the worker thread parks here.
    pub fn wait(self) -> T {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match mem::replace(&mut *state, State::Spent) {
                State::Done(Some(value)) => return value,
                pending @ State::Pending { .. } => {
                    *state = pending;
                    state = self.shared.condvar.wait(state).unwrap();
                }
                State::Done(None) | State::Spent => {
                    panic!("one-shot cell consumed twice");
                }
            }
        }
    }

    /// Like [`wait`](FutureValue::wait) but gives the future back on
    /// timeout so the caller can keep draining it later.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, FutureValue<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match mem::replace(&mut *state, State::Spent) {
                State::Done(Some(value)) => return Ok(value),
                pending @ State::Pending { .. } => {
                    *state = pending;
                    let now = Instant::now();
                    if now >= deadline {
                        drop(state);
                        return Err(self);
                    }
                    let (guard, _) = self.shared.condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
                State::Done(None) | State::Spent => {
                    panic!("one-shot cell consumed twice");
                }
            }
        }
    }

    /// Derives a new cell holding `f` of this cell's value.
    pub fn map<U, F>(self, f: F) -> FutureValue<U>
        where U: Send + 'static, F: FnOnce(T) -> U + Send + 'static
    {
        let (completer, mapped) = pending();
        self.on_complete(move |value| {
            completer.complete(f(value));
        });
        mapped
    }
}

impl<T> Completer<T>
    where T: Send + 'static
{
    /// Delivers the value. Returns false if some other completer got
    /// there first; the value is dropped in that case.
    pub fn complete(&self, value: T) -> bool {
        let observer = {
            let mut state = self.shared.state.lock().unwrap();
            match mem::replace(&mut *state, State::Spent) {
                State::Pending { observer: Some(observer) } => Some((observer, value)),
                State::Pending { observer: None } => {
                    *state = State::Done(Some(value));
                    self.shared.condvar.notify_all();
                    None
                }
                done @ State::Done(_) => {
                    *state = done;
                    return false;
                }
                State::Spent => {
                    *state = State::Spent;
                    return false;
                }
            }
        };
        // The observer runs outside the lock, on the completing thread.
        if let Some((observer, value)) = observer {
            observer(value);
        }
        true
    }

    /// True if a value has already been delivered.
    pub fn is_complete(&self) -> bool {
        match *self.shared.state.lock().unwrap() {
            State::Pending { .. } => false,
            _ => true,
        }
    }
}
