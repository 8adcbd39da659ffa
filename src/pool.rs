// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Bounded worker pools and the connection-count semaphore.
//!
//! One pool type serves every engine: the threaded engine's request pool,
//! the hybrid engine's I/O and CPU pools and the event loop's offload
//! pool differ only in sizing and rejection policy. The queue is always
//! bounded; overload either runs the job on the submitting thread
//! (caller-runs back-pressure) or hands the job back, never buffers
//! without limit.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{error, warn};

use crate::handler::Job;

/// Sizing and policy for a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolConfig {
    /// Used in thread names and log lines.
    pub name: String,
    /// Threads kept alive even when idle.
    pub core_threads: usize,
    /// Hard ceiling on threads.
    pub max_threads: usize,
    /// Depth of the submission queue.
    pub queue_depth: usize,
    /// How long a beyond-core thread lingers without work.
    pub idle_timeout: Duration,
    /// What happens when the queue is full and the pool is maxed out.
    pub on_saturation: SaturationPolicy,
    /// Runs once on every worker thread before it takes jobs. Engines
    /// use it to install thread-local capabilities.
    pub thread_init: Option<Arc<dyn Fn() + Send + Sync>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SaturationPolicy {
    /// Run the job on the submitting thread. The accept loop slowing
    /// down is the back-pressure.
    CallerRuns,
    /// Hand the job back to the submitter, who answers 503.
    Reject,
}

/// What happened to a submitted job.
pub enum Submission {
    /// Queued (or picked up directly) by a pool thread.
    Queued,
    /// The queue was full; the job ran on the calling thread.
    CallerRan,
    /// The queue was full or the pool is shut down; the job comes back.
    Rejected(Job),
}

enum Message {
    Run(Job),
    Retire,
}

/// A fixed-ceiling thread pool over a bounded crossbeam channel.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

struct PoolShared {
    config: PoolConfig,
    queue_tx: Sender<Message>,
    queue_rx: Receiver<Message>,
    live: AtomicUsize,
    idle: AtomicUsize,
    busy: AtomicUsize,
    rejections: AtomicU64,
    shutdown: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> WorkerPool {
        assert!(config.core_threads <= config.max_threads);
        assert!(config.max_threads >= 1);
        let (queue_tx, queue_rx) = bounded(config.queue_depth.max(1));
        let pool = WorkerPool {
            shared: Arc::new(PoolShared {
                config,
                queue_tx,
                queue_rx,
                live: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                rejections: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
        };
        for _ in 0..pool.shared.config.core_threads {
            pool.spawn_worker();
        }
        pool
    }

    /// Submits a job, applying the saturation policy when the queue is
    /// full and no more threads may be spawned.
    pub fn submit(&self, job: Job) -> Submission {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            self.shared.rejections.fetch_add(1, Ordering::Relaxed);
            return Submission::Rejected(job);
        }

        match self.shared.queue_tx.try_send(Message::Run(job)) {
            Ok(()) => {
                if self.shared.idle.load(Ordering::SeqCst) == 0 {
                    self.try_grow();
                }
                Submission::Queued
            }
            Err(TrySendError::Full(message)) => {
                let job = match message {
                    Message::Run(job) => job,
                    Message::Retire => unreachable!(),
                };
                if self.try_grow() {
                    // A fresh worker is draining; try once more before
                    // falling back.
                    match self.shared.queue_tx.try_send(Message::Run(job)) {
                        Ok(()) => return Submission::Queued,
                        Err(TrySendError::Full(Message::Run(job))) => {
                            return self.saturated(job);
                        }
                        Err(_) => unreachable!(),
                    }
                }
                self.saturated(job)
            }
            Err(TrySendError::Disconnected(_)) => unreachable!("receiver lives in the pool"),
        }
    }

    fn saturated(&self, job: Job) -> Submission {
        self.shared.rejections.fetch_add(1, Ordering::Relaxed);
        match self.shared.config.on_saturation {
            SaturationPolicy::CallerRuns => {
                run_job(&self.shared.config.name, job);
                Submission::CallerRan
            }
            SaturationPolicy::Reject => Submission::Rejected(job),
        }
    }

    fn try_grow(&self) -> bool {
        loop {
            let live = self.shared.live.load(Ordering::SeqCst);
            if live >= self.shared.config.max_threads {
                return false;
            }
            if self.shared.live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.spawn_worker_pregrown();
                return true;
            }
        }
    }

    fn spawn_worker(&self) {
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        self.spawn_worker_pregrown();
    }

    // `live` has already been incremented for this worker.
    fn spawn_worker_pregrown(&self) {
        let shared = self.shared.clone();
        let name = format!("{}-worker", shared.config.name);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(shared))
            .expect("failed to spawn pool thread");
        self.handles.lock().unwrap().push(handle);
    }

    /// Stops intake, lets workers drain the queue, and waits up to
    /// `timeout` for them to finish. Returns false if the budget ran out
    /// and threads were abandoned.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return self.shared.live.load(Ordering::SeqCst) == 0;
        }

        // Queued work drains first; the retire messages queue up behind
        // it, one per live thread. A full queue is left to the wait loop
        // below, which keeps topping retires up as space frees.
        let live = self.shared.live.load(Ordering::SeqCst);
        for _ in 0..live {
            if self.shared.queue_tx.try_send(Message::Retire).is_err() {
                break;
            }
        }

        let deadline = Instant::now() + timeout;
        while self.shared.live.load(Ordering::SeqCst) > 0 {
            // Cover workers spawned concurrently with the flag flip.
            let _ = self.shared.queue_tx.try_send(Message::Retire);
            if Instant::now() >= deadline {
                warn!("pool {}: {} thread(s) still running at shutdown deadline",
                      self.shared.config.name, self.shared.live.load(Ordering::SeqCst));
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }

        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        true
    }

    /// Threads currently alive.
    pub fn live_threads(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Threads currently running a job.
    pub fn busy_threads(&self) -> usize {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// How many submissions hit the saturation policy.
    pub fn rejections(&self) -> u64 {
        self.shared.rejections.load(Ordering::Relaxed)
    }

    /// Jobs sitting in the queue right now.
    pub fn queued(&self) -> usize {
        self.shared.queue_rx.len()
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    if let Some(ref init) = shared.config.thread_init {
        init();
    }
    loop {
        if shared.shutdown.load(Ordering::SeqCst) && shared.queue_rx.is_empty() {
            break;
        }
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let received = shared.queue_rx.recv_timeout(shared.config.idle_timeout);
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(Message::Run(job)) => {
                shared.busy.fetch_add(1, Ordering::SeqCst);
                run_job(&shared.config.name, job);
                shared.busy.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(Message::Retire) => break,
            Err(RecvTimeoutError::Timeout) => {
                // Only beyond-core threads retire on idleness.
                let live = shared.live.load(Ordering::SeqCst);
                if live > shared.config.core_threads
                    && shared.live
                        .compare_exchange(live, live - 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::SeqCst);
}

fn run_job(pool_name: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("pool {}: job panicked", pool_name);
    }
}

/// A counting semaphore with a timed acquire, used to cap live
/// connections ahead of the accept call.
pub struct Semaphore {
    shared: Arc<SemaphoreShared>,
}

struct SemaphoreShared {
    available: Mutex<usize>,
    condvar: Condvar,
}

/// RAII permit; dropping it releases the slot.
pub struct Permit {
    shared: Arc<SemaphoreShared>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore {
            shared: Arc::new(SemaphoreShared {
                available: Mutex::new(permits),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Tries to take a permit, waiting at most `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<Permit> {
        let deadline = Instant::now() + timeout;
        let mut available = self.shared.available.lock().unwrap();
        while *available == 0 {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self.shared.condvar
                .wait_timeout(available, deadline - now)
                .unwrap();
            available = guard;
            if result.timed_out() && *available == 0 {
                return None;
            }
        }
        *available -= 1;
        Some(Permit { shared: self.shared.clone() })
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        *self.shared.available.lock().unwrap()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut available = self.shared.available.lock().unwrap();
        *available += 1;
        self.shared.condvar.notify_one();
    }
}
