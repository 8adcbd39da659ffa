// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Hybrid engine: an async pipeline over two pools.
//!
//! Each connection becomes a future chain — parse synchronously on the
//! I/O pool, flat-map into the router, map the outcome into
//! write-and-close, also on the I/O pool. A per-request deadline races
//! every handler through the one-shot cell: if the deadline wins the
//! client gets a 503 and the handler's eventual result is dropped by
//! one-shot semantics. The handler runs exactly once either way, so side
//! effects cannot double-fire.
//!
//! The I/O pool grows on demand under a hard cap with a bounded
//! submission queue and caller-runs saturation; the CPU pool is fixed at
//! the processor count and is where [`offload`](crate::offload)ed
//! handler work lands on this engine.

use std::cmp;
use std::collections::BinaryHeap;
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::future::{pending, Completer};
use crate::handler::{set_offload_target, HandlerError, OffloadTarget};
use crate::metrics::ServerMetrics;
use crate::pool::{Permit, PoolConfig, SaturationPolicy, Semaphore, Submission, WorkerPool};
use crate::response::Response;
use crate::router::Router;
use crate::wire::{self, RequestParser};

use super::{is_peer_disconnect, write_error_response, Engine};

const PERMIT_WAIT: Duration = Duration::from_millis(100);

type RequestOutcome = Result<Response, HandlerError>;

pub struct HybridServer {
    shared: Arc<Shared>,
    accept_thread: Option<thread::JoinHandle<()>>,
    stopped: bool,
}

struct Shared {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    router: Arc<Router>,
    config: Config,
    metrics: Arc<ServerMetrics>,
    io_pool: Arc<WorkerPool>,
    cpu_pool: Arc<WorkerPool>,
    deadlines: Arc<DeadlineTimer>,
    connections: Semaphore,
    stop: AtomicBool,
}

impl HybridServer {
    /// Binds and starts serving immediately. The management endpoints
    /// are mounted behind the caller's routes when monitoring is on.
    pub fn start(config: Config, mut router: Router) -> std::io::Result<HybridServer> {
        let listener = super::bind_listener(config.port, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let metrics = Arc::new(ServerMetrics::new());
        if config.monitoring_enabled {
            crate::mgmt::mount_management(&mut router, "hybrid", metrics.clone(),
                                          &config, None);
        }

        let cpu_workers = num_cpus::get().max(1);
        let cpu_pool = Arc::new(WorkerPool::new(PoolConfig {
            name: "hybrid-cpu".to_owned(),
            core_threads: cpu_workers,
            max_threads: cpu_workers,
            queue_depth: cpu_workers * 2,
            idle_timeout: Duration::from_secs(60),
            on_saturation: SaturationPolicy::Reject,
            thread_init: None,
        }));

        // Handlers that ask to migrate CPU work get this pool; the
        // target is installed on every I/O worker thread.
        let offload_pool = cpu_pool.clone();
        let io_max = config.thread_pool_size.max(cpu_workers);
        let io_pool = Arc::new(WorkerPool::new(PoolConfig {
            name: "hybrid-io".to_owned(),
            core_threads: cmp::min(cpu_workers.max(2), io_max),
            max_threads: io_max,
            queue_depth: io_max * 2,
            idle_timeout: Duration::from_secs(60),
            on_saturation: SaturationPolicy::CallerRuns,
            thread_init: Some(Arc::new(move || {
                let pool = offload_pool.clone();
                set_offload_target(Some(OffloadTarget::new(move |job| {
                    match pool.submit(job) {
                        Submission::Rejected(job) => Err(job),
                        _ => Ok(()),
                    }
                })));
            })),
        }));

        let deadlines = DeadlineTimer::start();

        let shared = Arc::new(Shared {
            listener,
            local_addr,
            router: Arc::new(router),
            connections: Semaphore::new(config.max_connections),
            config,
            metrics,
            io_pool,
            cpu_pool,
            deadlines,
            stop: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        let accept_thread = thread::Builder::new()
            .name("hybrid-accept".to_owned())
            .spawn(move || accept_loop(accept_shared))?;

        info!("hybrid engine listening on {}", local_addr);
        Ok(HybridServer {
            shared,
            accept_thread: Some(accept_thread),
            stopped: false,
        })
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.stop.store(true, Ordering::SeqCst);

        let _ = TcpStream::connect(super::loopback_addr(self.shared.local_addr));
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        // Best-effort drain of in-flight futures; whatever is still
        // pending afterwards resolves to a cancellation 503.
        let drain = self.shared.config.shutdown_drain;
        let deadline = Instant::now() + drain;
        while self.shared.metrics.active_connections() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        self.shared.deadlines.cancel_all();

        // Give the cancellation writes a moment to reach the I/O pool
        // before it stops taking work.
        let settle = Instant::now() + Duration::from_millis(200);
        while self.shared.metrics.active_connections() > 0 && Instant::now() < settle {
            thread::sleep(Duration::from_millis(10));
        }

        if !self.shared.io_pool.shutdown(drain) {
            error!("hybrid engine: i/o pool missed its termination budget");
        }
        if !self.shared.cpu_pool.shutdown(drain) {
            error!("hybrid engine: cpu pool missed its termination budget");
        }
        self.shared.deadlines.shutdown();
        info!("hybrid engine stopped");
    }
}

impl Engine for HybridServer {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    fn shutdown(&mut self) {
        self.stop();
    }
}

impl Drop for HybridServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        let permit = match shared.connections.try_acquire_for(PERMIT_WAIT) {
            Some(permit) => permit,
            None => continue,
        };
        let (stream, peer) = match shared.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if !shared.stop.load(Ordering::SeqCst) {
                    warn!("accept failed: {}", err);
                }
                continue;
            }
        };
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        shared.metrics.connection_opened();
        let job_shared = shared.clone();
        match shared.io_pool.submit(Box::new(move || {
            serve_connection(job_shared, stream, peer, permit);
        })) {
            Submission::Queued => {}
            Submission::CallerRan => {
                shared.metrics.record_rejected_submission();
            }
            Submission::Rejected(job) => {
                shared.metrics.record_rejected_submission();
                job();
            }
        }
    }
    debug!("hybrid accept loop exited");
}

// Stage one of the chain, on an I/O worker: synchronous parse, then the
// router flat-map, with the deadline completer racing the handler.
fn serve_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr, permit: Permit) {
    let started = Instant::now();

    if let Err(err) = super::tune_stream(&stream, Some(shared.config.read_timeout)) {
        debug!("failed to tune socket for {}: {}", peer, err);
    }

    let request = match parse_blocking(&shared, &stream, peer) {
        Some(request) => request,
        None => {
            drop(stream);
            drop(permit);
            shared.metrics.connection_closed();
            return;
        }
    };

    // The one-shot cell both outcomes race into.
    let (winner, raced) = pending::<RequestOutcome>();

    // Stage three is always scheduled on the I/O pool, whichever thread
    // completes the race.
    let write_shared = shared.clone();
    raced.on_complete(move |outcome| {
        let finish_shared = write_shared.clone();
        let job = Box::new(move || {
            write_and_close(&finish_shared, stream, peer, permit, started, outcome);
        });
        match write_shared.io_pool.submit(job) {
            Submission::Rejected(job) => job(),
            _ => {}
        }
    });

    shared.deadlines.arm(Instant::now() + shared.config.request_deadline, winner.clone());

    // Stage two: the handler. This call may block the current worker for
    // as long as the handler pleases; the deadline above keeps the
    // client from waiting along with it.
    let handler_future = shared.router.route(request);
    handler_future.on_complete(move |outcome| {
        // Dropped on the floor if the deadline already won.
        winner.complete(outcome);
    });
}

// Blocking read driven through the incremental parser. Returns None
// after handling any parse failure itself.
fn parse_blocking(shared: &Arc<Shared>, stream: &TcpStream, peer: SocketAddr)
                  -> Option<crate::request::Request>
{
    let mut parser = RequestParser::new(Some(peer));
    let mut buffer = [0u8; 8_192];
    let mut input = stream;
    loop {
        let read = match input.read(&mut buffer) {
            Ok(0) => {
                match parser.eof() {
                    None => {
                        debug!("peer {} closed without sending a request", peer);
                    }
                    Some(err) => {
                        shared.metrics.record_parse_failure();
                        debug!("truncated request from {}: {}", peer, err);
                    }
                }
                return None;
            }
            Ok(read) => read,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                shared.metrics.record_parse_failure();
                if is_peer_disconnect(&err) {
                    shared.metrics.record_peer_disconnect();
                    warn!("peer {} disconnected mid-request", peer);
                } else {
                    debug!("read error from {}: {}", peer, err);
                }
                return None;
            }
        };
        match parser.push(&buffer[..read]) {
            Ok(Some(request)) => return Some(request),
            Ok(None) => {}
            Err(err) => {
                shared.metrics.record_parse_failure();
                debug!("bad request from {}: {}", peer, err);
                if err.deserves_response() {
                    write_error_response(&mut (&*stream), 400);
                }
                return None;
            }
        }
    }
}

// Stage three: serialise, flush, close, count.
fn write_and_close(shared: &Shared, stream: TcpStream, peer: SocketAddr, permit: Permit,
                   started: Instant, outcome: RequestOutcome)
{
    let mut response = match outcome {
        Ok(response) => response,
        Err(err) => {
            match err {
                HandlerError::TimedOut => shared.metrics.record_deadline_timeout(),
                HandlerError::Overloaded => shared.metrics.record_overload(),
                _ => shared.metrics.record_handler_failure(),
            }
            debug!("request from {} resolved to an error: {}", peer, err);
            err.to_response()
        }
    };

    let status = response.status_code();
    match wire::write_response(&mut (&stream), &mut response) {
        Ok(()) => shared.metrics.record_response(status, started.elapsed()),
        Err(ref err) if is_peer_disconnect(err) => {
            shared.metrics.record_peer_disconnect();
            warn!("peer {} disconnected mid-response", peer);
        }
        Err(err) => debug!("write to {} failed: {}", peer, err),
    }

    drop(stream);
    drop(permit);
    shared.metrics.connection_closed();
}

/// One thread sweeping a heap of armed request deadlines. Arming is a
/// lock-push-notify; firing completes the raced cell with
/// [`HandlerError::TimedOut`], which is a no-op for requests whose
/// handler already won.
pub(crate) struct DeadlineTimer {
    state: Mutex<TimerState>,
    condvar: Condvar,
    sequence: AtomicU64,
}

struct TimerState {
    entries: BinaryHeap<DeadlineEntry>,
    shutdown: bool,
    thread: Option<thread::JoinHandle<()>>,
}

struct DeadlineEntry {
    at: Instant,
    sequence: u64,
    completer: Completer<RequestOutcome>,
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &DeadlineEntry) -> bool {
        self.at == other.at && self.sequence == other.sequence
    }
}

impl Eq for DeadlineEntry {}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &DeadlineEntry) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineEntry {
    // Inverted so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &DeadlineEntry) -> cmp::Ordering {
        other.at.cmp(&self.at).then(other.sequence.cmp(&self.sequence))
    }
}

impl DeadlineTimer {
    fn start() -> Arc<DeadlineTimer> {
        let timer = Arc::new(DeadlineTimer {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                shutdown: false,
                thread: None,
            }),
            condvar: Condvar::new(),
            sequence: AtomicU64::new(0),
        });
        let sweeper = timer.clone();
        let handle = thread::Builder::new()
            .name("hybrid-deadline".to_owned())
            .spawn(move || sweeper.sweep())
            .expect("failed to spawn deadline timer");
        timer.state.lock().unwrap().thread = Some(handle);
        timer
    }

    fn arm(&self, at: Instant, completer: Completer<RequestOutcome>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.entries.push(DeadlineEntry { at, sequence, completer });
        self.condvar.notify_one();
    }

    /// Completes every armed deadline with a cancellation, now. Used at
    /// engine shutdown.
    fn cancel_all(&self) {
        let drained = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.entries)
        };
        for entry in drained {
            entry.completer.complete(Err(HandlerError::Cancelled));
        }
    }

    fn shutdown(&self) {
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
            self.condvar.notify_one();
            state.thread.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn sweep(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                break;
            }
            let now = Instant::now();
            // Fire everything due, outside the lock.
            let mut due = Vec::new();
            while state.entries.peek().map_or(false, |entry| entry.at <= now) {
                due.push(state.entries.pop().unwrap());
            }
            if !due.is_empty() {
                drop(state);
                for entry in due {
                    entry.completer.complete(Err(HandlerError::TimedOut));
                }
                state = self.state.lock().unwrap();
                continue;
            }
            state = match state.entries.peek().map(|entry| entry.at) {
                Some(next) => {
                    let wait = next.saturating_duration_since(now);
                    self.condvar.wait_timeout(state, wait).unwrap().0
                }
                None => self.condvar.wait(state).unwrap(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::handler::{offload_response, sync_handler};
    use crate::request::Method;
    use crate::response::Response;

    fn test_config() -> Config {
        Config {
            port: 0,
            thread_pool_size: 8,
            request_deadline: Duration::from_millis(400),
            ..Config::default()
        }
    }

    fn test_router() -> Router {
        let mut router = Router::new();
        router.add(Method::Get, "/ping", sync_handler(|_| Response::text("pong")));
        router.add(Method::Get, "/slow", sync_handler(|_| {
            std::thread::sleep(Duration::from_millis(900));
            Response::text("finally")
        }));
        router.add(Method::Get, "/cpu", |_request: crate::request::Request| {
            offload_response(|| Response::text("crunched"))
        });
        router
    }

    fn raw_roundtrip(addr: std::net::SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(super::super::loopback_addr(addr)).unwrap();
        stream.write_all(request).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn serves_and_offloads() {
        let mut server = HybridServer::start(test_config(), test_router()).unwrap();
        let addr = server.local_addr();
        let ping = raw_roundtrip(addr, b"GET /ping HTTP/1.1\r\nHost: t\r\n\r\n");
        assert!(ping.starts_with("HTTP/1.1 200"));
        assert!(ping.ends_with("pong"));
        let cpu = raw_roundtrip(addr, b"GET /cpu HTTP/1.1\r\nHost: t\r\n\r\n");
        assert!(cpu.ends_with("crunched"));
        server.stop();
    }

    #[test]
    fn deadline_beats_a_slow_handler() {
        let mut server = HybridServer::start(test_config(), test_router()).unwrap();
        let started = Instant::now();
        let response = raw_roundtrip(server.local_addr(), b"GET /slow HTTP/1.1\r\nHost: t\r\n\r\n");
        let elapsed = started.elapsed();
        assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
        assert!(elapsed < Duration::from_millis(850), "took {:?}", elapsed);
        server.stop();
    }
}
