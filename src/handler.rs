// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The handler contract shared by the three engines, and the ambient
//! primitives (`offload`, `delay_response`) that let one handler body run
//! correctly on all of them.
//!
//! Both primitives consult a thread-local capability the engine installs
//! on the threads it owns. The event-loop reactor installs both: work is
//! posted to its offload pool and delays become timer events, so the
//! reactor thread never blocks. On the threaded and hybrid engines the
//! thread at hand is allowed to block, so the defaults — run inline,
//! sleep inline — are exactly the semantics those models promise.

use std::cell::RefCell;
use std::error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::future::{pending, FutureValue};
use crate::request::Request;
use crate::response::Response;

/// What a handler invocation ultimately produces.
pub type ResponseFuture = FutureValue<Result<Response, HandlerError>>;

/// A unit of work posted to an engine pool.
pub type Job = Box<dyn FnOnce() + Send>;

/// Failures surfaced by a handler invocation, after the engine caught
/// them at its boundary. These never escape into the accept loops.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// The handler panicked.
    Panicked,
    /// The handler completed its future with a failure.
    Failed(String),
    /// The per-request deadline fired before the handler finished.
    TimedOut,
    /// The engine shut down or the connection was closed while the
    /// request was still in flight.
    Cancelled,
    /// A pool or connection limit refused the work.
    Overloaded,
}

impl HandlerError {
    /// The status code the engine answers with, when the response has
    /// not begun writing.
    pub fn status_code(&self) -> u16 {
        match *self {
            HandlerError::Panicked | HandlerError::Failed(_) => 500,
            HandlerError::TimedOut
            | HandlerError::Cancelled
            | HandlerError::Overloaded => 503,
        }
    }

    /// The error rendered as a minimal response.
    pub fn to_response(&self) -> Response {
        Response::from_status(self.status_code())
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(self.to_string().into_bytes())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HandlerError::Panicked => write!(fmt, "handler panicked"),
            HandlerError::Failed(ref msg) => write!(fmt, "handler failed: {}", msg),
            HandlerError::TimedOut => write!(fmt, "handler deadline exceeded"),
            HandlerError::Cancelled => write!(fmt, "request cancelled"),
            HandlerError::Overloaded => write!(fmt, "server overloaded"),
        }
    }
}

impl error::Error for HandlerError {}

/// A request handler: `Request` in, future of `Response` out.
///
/// The same handler value is served by all three engines; what differs is
/// the thread its body runs on. Handlers running on the event-loop
/// reactor must not block except through [`offload`] or
/// [`delay_response`]; on the threaded engine blocking is the normal
/// mode; on the hybrid engine blocking holds a pool thread.
pub trait Handler: Send + Sync {
    fn handle(&self, request: Request) -> ResponseFuture;
}

impl<F> Handler for F
    where F: Fn(Request) -> ResponseFuture + Send + Sync
{
    fn handle(&self, request: Request) -> ResponseFuture {
        self(request)
    }
}

/// Lifts a synchronous function into the handler contract by completing
/// the future immediately.
///
/// # Example
///
/// ```
/// use triptych::{sync_handler, Response};
/// let handler = sync_handler(|request| {
///     Response::text(format!("you asked for {}", request.path()))
/// });
/// ```
pub fn sync_handler<F>(f: F) -> SyncHandler<F>
    where F: Fn(Request) -> Response + Send + Sync
{
    SyncHandler { f }
}

/// See [`sync_handler`].
pub struct SyncHandler<F> {
    f: F,
}

impl<F> Handler for SyncHandler<F>
    where F: Fn(Request) -> Response + Send + Sync
{
    fn handle(&self, request: Request) -> ResponseFuture {
        FutureValue::ready(Ok((self.f)(request)))
    }
}

thread_local! {
    static OFFLOAD_TARGET: RefCell<Option<OffloadTarget>> = RefCell::new(None);
    static DELAY_TARGET: RefCell<Option<DelayTarget>> = RefCell::new(None);
}

/// A sink for offloaded work, installed per thread by an engine. The
/// executor either accepts the job or hands it back when its queue is
/// saturated.
#[derive(Clone)]
pub struct OffloadTarget {
    executor: Arc<dyn Fn(Job) -> Result<(), Job> + Send + Sync>,
}

impl OffloadTarget {
    pub fn new<E>(executor: E) -> OffloadTarget
        where E: Fn(Job) -> Result<(), Job> + Send + Sync + 'static
    {
        OffloadTarget { executor: Arc::new(executor) }
    }

    fn execute(&self, job: Job) -> Result<(), Job> {
        (self.executor)(job)
    }
}

/// A timer capability: runs a callback after a delay without holding any
/// thread in the meantime. Installed by the event-loop reactor.
#[derive(Clone)]
pub struct DelayTarget {
    scheduler: Arc<dyn Fn(Duration, Job) + Send + Sync>,
}

impl DelayTarget {
    pub fn new<S>(scheduler: S) -> DelayTarget
        where S: Fn(Duration, Job) + Send + Sync + 'static
    {
        DelayTarget { scheduler: Arc::new(scheduler) }
    }

    fn schedule(&self, delay: Duration, job: Job) {
        (self.scheduler)(delay, job)
    }
}

/// Installs (or clears) the current thread's offload target.
pub(crate) fn set_offload_target(target: Option<OffloadTarget>) {
    OFFLOAD_TARGET.with(|cell| *cell.borrow_mut() = target);
}

/// Installs (or clears) the current thread's delay target.
pub(crate) fn set_delay_target(target: Option<DelayTarget>) {
    DELAY_TARGET.with(|cell| *cell.borrow_mut() = target);
}

fn current_offload_target() -> Option<OffloadTarget> {
    OFFLOAD_TARGET.with(|cell| cell.borrow().clone())
}

fn current_delay_target() -> Option<DelayTarget> {
    DELAY_TARGET.with(|cell| cell.borrow().clone())
}

/// Runs `work` away from the calling thread if the calling thread must
/// not block, inline otherwise.
///
/// The returned future completes on whichever thread ran the work. A
/// panic in `work` abandons the future, and a saturated offload pool
/// falls back to running inline; handler bodies should prefer
/// [`offload_response`], which turns both into error completions.
pub fn offload<T, F>(work: F) -> FutureValue<T>
    where T: Send + 'static, F: FnOnce() -> T + Send + 'static
{
    let (completer, future) = pending();
    let job: Job = Box::new(move || {
        completer.complete(work());
    });
    match current_offload_target() {
        Some(target) => {
            if let Err(job) = target.execute(job) {
                job();
            }
        }
        None => job(),
    }
    future
}

/// [`offload`] specialised for handler bodies producing a `Response`.
///
/// A panic in `work` completes the future with
/// [`HandlerError::Panicked`]; a saturated offload pool completes it
/// with [`HandlerError::Overloaded`] so the engine can answer 503.
pub fn offload_response<F>(work: F) -> ResponseFuture
    where F: FnOnce() -> Response + Send + 'static
{
    let (completer, future) = pending();
    let rejected = completer.clone();
    let job: Job = Box::new(move || {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(response) => completer.complete(Ok(response)),
            Err(_) => completer.complete(Err(HandlerError::Panicked)),
        };
    });
    match current_offload_target() {
        Some(target) => {
            if target.execute(job).is_err() {
                rejected.complete(Err(HandlerError::Overloaded));
            }
        }
        None => job(),
    }
    future
}

/// Completes a response after `delay`, holding no thread on engines with
/// a timer (the event-loop reactor schedules a wakeup); on the blocking
/// engines the calling thread sleeps, which is those models' honest
/// cost for a waiting downstream.
pub fn delay_response<F>(delay: Duration, work: F) -> ResponseFuture
    where F: FnOnce() -> Response + Send + 'static
{
    match current_delay_target() {
        Some(target) => {
            let (completer, future) = pending();
            target.schedule(delay, Box::new(move || {
                match panic::catch_unwind(AssertUnwindSafe(work)) {
                    Ok(response) => completer.complete(Ok(response)),
                    Err(_) => completer.complete(Err(HandlerError::Panicked)),
                };
            }));
            future
        }
        None => {
            thread::sleep(delay);
            match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(response) => FutureValue::ready(Ok(response)),
                Err(_) => FutureValue::ready(Err(HandlerError::Panicked)),
            }
        }
    }
}
