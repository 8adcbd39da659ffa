// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Event-loop engine: one reactor thread over a readiness selector.
//!
//! All accepts, reads, writes and state-machine transitions happen on
//! the reactor; connection records are touched by no other thread.
//! Handler bodies run on the reactor too, which is why blocking work
//! must go through [`offload`](crate::offload): the work runs on the
//! offload pool and its completion comes back as just another reactor
//! event, over a channel the waker flags. Delayed completions
//! ([`delay_response`](crate::delay_response)) become timer entries on
//! the reactor's heap and hold no thread at all.
//!
//! Same-thread continuations (a handler finishing synchronously) are
//! fully drained between selector polls, so they never queue behind
//! socket readiness.

use std::cmp;
use std::collections::BinaryHeap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::config::Config;
use crate::handler::{set_delay_target, set_offload_target, DelayTarget, HandlerError, Job,
                     OffloadTarget};
use crate::metrics::ServerMetrics;
use crate::pool::{PoolConfig, SaturationPolicy, Submission, WorkerPool};
use crate::response::Response;
use crate::router::Router;
use crate::wire::{self, RequestParser};

use super::{is_peer_disconnect, Engine};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const TOKEN_BASE: usize = 2;

const READ_CHUNK: usize = 8_192;

// Housekeeping tick when no timer is armed.
const IDLE_POLL: Duration = Duration::from_millis(500);

pub struct EventLoopServer {
    shared: Arc<Shared>,
    reactor_thread: Option<thread::JoinHandle<()>>,
    stopped: bool,
}

struct Shared {
    std_listener: std::net::TcpListener,
    local_addr: SocketAddr,
    router: Arc<Router>,
    config: Config,
    metrics: Arc<ServerMetrics>,
    offload_pool: Arc<WorkerPool>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    delays_tx: Sender<(Duration, Job)>,
    delays_rx: Receiver<(Duration, Job)>,
    // Belongs to the live reactor instance; replaced on restart.
    waker: Mutex<Option<Arc<Waker>>>,
    stop: AtomicBool,
}

// A handler outcome travelling back to the reactor. The generation
// guards against slab-slot reuse: a completion for a connection that
// died in the meantime is dropped.
struct Completion {
    key: usize,
    generation: u64,
    outcome: Result<Response, HandlerError>,
}

impl EventLoopServer {
    /// Binds and starts the reactor. The management endpoints are
    /// mounted behind the caller's routes when monitoring is on.
    pub fn start(config: Config, mut router: Router) -> io::Result<EventLoopServer> {
        let listener = super::bind_listener(config.port, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let metrics = Arc::new(ServerMetrics::new());
        if config.monitoring_enabled {
            crate::mgmt::mount_management(&mut router, "event-loop", metrics.clone(),
                                          &config, None);
        }

        let workers = config.offload_workers.max(1);
        let offload_pool = Arc::new(WorkerPool::new(PoolConfig {
            name: "offload".to_owned(),
            core_threads: workers,
            max_threads: workers,
            queue_depth: workers * 4,
            idle_timeout: Duration::from_secs(60),
            on_saturation: SaturationPolicy::Reject,
            thread_init: None,
        }));

        let (completions_tx, completions_rx) = unbounded();
        let (delays_tx, delays_rx) = unbounded();

        let shared = Arc::new(Shared {
            std_listener: listener,
            local_addr,
            router: Arc::new(router),
            config,
            metrics,
            offload_pool,
            completions_tx,
            completions_rx,
            delays_tx,
            delays_rx,
            waker: Mutex::new(None),
            stop: AtomicBool::new(false),
        });

        let reactor_shared = shared.clone();
        let reactor_thread = thread::Builder::new()
            .name("reactor".to_owned())
            .spawn(move || reactor_main(reactor_shared))?;

        info!("event-loop engine listening on {}", local_addr);
        Ok(EventLoopServer {
            shared,
            reactor_thread: Some(reactor_thread),
            stopped: false,
        })
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(waker) = self.shared.waker.lock().unwrap().clone() {
            let _ = waker.wake();
        }
        if let Some(handle) = self.reactor_thread.take() {
            let _ = handle.join();
        }
        if !self.shared.offload_pool.shutdown(self.shared.config.shutdown_drain) {
            error!("event-loop engine: offload pool missed its termination budget");
        }
        info!("event-loop engine stopped");
    }
}

impl Engine for EventLoopServer {
    fn name(&self) -> &'static str {
        "event-loop"
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

impl Drop for EventLoopServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// Restart-once policy: a panic that reaches the top of the loop gets one
// fresh reactor (connections are lost, the listener survives); a second
// panic ends the serve thread.
fn reactor_main(shared: Arc<Shared>) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let result = panic::catch_unwind(AssertUnwindSafe(|| run_reactor(&shared)));
        match result {
            Ok(Ok(())) => break,
            Ok(Err(err)) => {
                error!("reactor i/o failure: {}", err);
                break;
            }
            Err(_) => {
                if attempts > 1 {
                    error!("reactor panicked twice; giving up");
                    break;
                }
                error!("reactor panicked; restarting once");
            }
        }
    }
    set_offload_target(None);
    set_delay_target(None);
    *shared.waker.lock().unwrap() = None;
}

enum ConnState {
    Reading,
    Dispatched,
    Writing,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    generation: u64,
    parser: RequestParser,
    state: ConnState,
    write_buf: Vec<u8>,
    written: usize,
    // Status of the response currently being flushed.
    pending_status: u16,
    close_after_write: bool,
    started: Instant,
    last_activity: Instant,
}

enum TimerKind {
    Delay(Job),
    ReadDeadline { key: usize, generation: u64 },
}

struct TimerEntry {
    at: Instant,
    sequence: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.at == other.at && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Inverted: the heap pops the earliest entry.
    fn cmp(&self, other: &TimerEntry) -> cmp::Ordering {
        other.at.cmp(&self.at).then(other.sequence.cmp(&self.sequence))
    }
}

struct Reactor<'a> {
    shared: &'a Arc<Shared>,
    poll: Poll,
    listener: TcpListener,
    listener_active: bool,
    waker: Arc<Waker>,
    connections: Slab<Connection>,
    timers: BinaryHeap<TimerEntry>,
    timer_sequence: u64,
    generation: u64,
    accept_paused: bool,
    drain_deadline: Option<Instant>,
}

fn run_reactor(shared: &Arc<Shared>) -> io::Result<()> {
    let poll = Poll::new()?;

    let std_listener = shared.std_listener.try_clone()?;
    std_listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(std_listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    *shared.waker.lock().unwrap() = Some(waker.clone());

    // Ambient capabilities for handlers running on this thread.
    let offload_pool = shared.offload_pool.clone();
    set_offload_target(Some(OffloadTarget::new(move |job| {
        match offload_pool.submit(job) {
            Submission::Rejected(job) => Err(job),
            _ => Ok(()),
        }
    })));
    let delays_tx = shared.delays_tx.clone();
    set_delay_target(Some(DelayTarget::new(move |delay, job| {
        let _ = delays_tx.send((delay, job));
    })));

    let mut reactor = Reactor {
        shared,
        poll,
        listener,
        listener_active: true,
        waker,
        connections: Slab::new(),
        timers: BinaryHeap::new(),
        timer_sequence: 0,
        generation: 0,
        accept_paused: false,
        drain_deadline: None,
    };
    reactor.run()
}

impl<'a> Reactor<'a> {
    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1_024);
        loop {
            // Same-thread continuations and cross-thread completions are
            // drained completely before the selector gets to wait again.
            self.drain_delays();
            self.drain_completions();
            self.fire_due_timers();

            if self.shared.stop.load(Ordering::SeqCst) {
                if self.begin_drain() {
                    return Ok(());
                }
            }

            let timeout = self.poll_timeout();
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.drain_accept(),
                    WAKER_TOKEN => {}
                    token => {
                        let key = token.0 - TOKEN_BASE;
                        if event.is_readable() || event.is_read_closed() {
                            self.handle_readable(key);
                        }
                        if event.is_writable() {
                            self.handle_writable(key);
                        }
                    }
                }
            }
        }
    }

    // First call unregisters the accept channel and closes idle readers;
    // returns true once every remaining write has flushed or the drain
    // deadline has passed.
    fn begin_drain(&mut self) -> bool {
        if self.listener_active {
            let _ = self.poll.registry().deregister(&mut self.listener);
            self.listener_active = false;
            self.drain_deadline =
                Some(Instant::now() + self.shared.config.shutdown_drain);

            let idle: Vec<usize> = self.connections
                .iter()
                .filter(|&(_, ref conn)| matches!(conn.state, ConnState::Reading))
                .map(|(key, _)| key)
                .collect();
            for key in idle {
                self.close_connection(key);
            }
        }

        if self.connections.is_empty() {
            return true;
        }
        if let Some(deadline) = self.drain_deadline {
            if Instant::now() >= deadline {
                warn!("event-loop engine: force-closing {} connection(s) at drain deadline",
                      self.connections.len());
                let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
                for key in keys {
                    self.close_connection(key);
                }
                return true;
            }
        }
        false
    }

    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = IDLE_POLL;
        if let Some(entry) = self.timers.peek() {
            timeout = cmp::min(timeout, entry.at.saturating_duration_since(now));
        }
        if self.drain_deadline.is_some() {
            timeout = cmp::min(timeout, Duration::from_millis(50));
        }
        timeout
    }

    fn push_timer(&mut self, at: Instant, kind: TimerKind) {
        self.timer_sequence += 1;
        self.timers.push(TimerEntry { at, sequence: self.timer_sequence, kind });
    }

    fn drain_delays(&mut self) {
        let now = Instant::now();
        while let Ok((delay, job)) = self.shared.delays_rx.try_recv() {
            self.push_timer(now + delay, TimerKind::Delay(job));
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while self.timers.peek().map_or(false, |entry| entry.at <= now) {
            let entry = self.timers.pop().unwrap();
            match entry.kind {
                TimerKind::Delay(job) => {
                    // The job completes some handler future; the
                    // resulting completion is picked up in this same
                    // drain cycle.
                    job();
                    self.drain_completions();
                }
                TimerKind::ReadDeadline { key, generation } => {
                    self.check_read_deadline(key, generation);
                }
            }
        }
    }

    fn check_read_deadline(&mut self, key: usize, generation: u64) {
        let (expired, rearm_at) = match self.connections.get(key) {
            Some(conn) if conn.generation == generation => {
                let cutoff = conn.last_activity + self.shared.config.read_timeout;
                if matches!(conn.state, ConnState::Dispatched) {
                    // The handler owns the clock now; check again later.
                    (false, Some(cutoff.max(Instant::now() + IDLE_POLL)))
                } else if cutoff <= Instant::now() {
                    (true, None)
                } else {
                    (false, Some(cutoff))
                }
            }
            _ => return,
        };
        if expired {
            debug!("closing connection on read timeout");
            self.close_connection(key);
        } else if let Some(at) = rearm_at {
            self.push_timer(at, TimerKind::ReadDeadline { key, generation });
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.shared.completions_rx.try_recv() {
            self.handle_completion(completion);
        }
    }

    fn drain_accept(&mut self) {
        if !self.listener_active {
            return;
        }
        loop {
            if self.connections.len() >= self.shared.config.max_connections {
                // Accept stays suspended until a connection closes.
                self.accept_paused = true;
                return;
            }
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_connection(stream, peer),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    return;
                }
            }
        }
    }

    fn register_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer, err);
        }
        self.generation += 1;
        let generation = self.generation;
        let now = Instant::now();

        let entry = self.connections.vacant_entry();
        let key = entry.key();
        if let Err(err) = self.poll.registry().register(
            &mut stream,
            Token(key + TOKEN_BASE),
            Interest::READABLE,
        ) {
            warn!("failed to register connection from {}: {}", peer, err);
            return;
        }
        entry.insert(Connection {
            stream,
            peer,
            generation,
            parser: RequestParser::new(Some(peer)),
            state: ConnState::Reading,
            write_buf: Vec::new(),
            written: 0,
            pending_status: 0,
            close_after_write: true,
            started: now,
            last_activity: now,
        });
        self.shared.metrics.connection_opened();
        self.push_timer(
            now + self.shared.config.read_timeout,
            TimerKind::ReadDeadline { key, generation },
        );
    }

    fn handle_readable(&mut self, key: usize) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let conn = match self.connections.get_mut(key) {
                Some(conn) => conn,
                None => return,
            };
            if !matches!(conn.state, ConnState::Reading) {
                // Back-pressure: no reads while a request is in flight
                // or a response is flushing. The kernel buffer does the
                // queueing for us.
                return;
            }
            let read = match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    match conn.parser.eof() {
                        None => {}
                        Some(err) => {
                            self.shared.metrics.record_parse_failure();
                            self.shared.metrics.record_peer_disconnect();
                            warn!("peer {} disconnected mid-request: {}", conn.peer, err);
                        }
                    }
                    self.close_connection(key);
                    return;
                }
                Ok(read) => read,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if is_peer_disconnect(&err) {
                        self.shared.metrics.record_peer_disconnect();
                        warn!("peer {} disconnected: {}", conn.peer, err);
                    } else {
                        debug!("read error from {}: {}", conn.peer, err);
                    }
                    self.close_connection(key);
                    return;
                }
            };

            conn.last_activity = Instant::now();
            match conn.parser.push(&chunk[..read]) {
                Ok(Some(request)) => {
                    self.dispatch(key, request);
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    self.shared.metrics.record_parse_failure();
                    debug!("bad request from {}: {}", conn.peer, err);
                    if err.deserves_response() {
                        self.stage_response(key, Response::empty_400());
                    } else {
                        self.close_connection(key);
                    }
                    return;
                }
            }
        }
    }

    // Invokes the handler on the reactor thread. The completion comes
    // back through the channel — immediately for synchronous handlers,
    // later via the waker for offloaded or delayed ones.
    fn dispatch(&mut self, key: usize, request: crate::request::Request) {
        let (generation, _peer) = match self.connections.get_mut(key) {
            Some(conn) => {
                conn.state = ConnState::Dispatched;
                conn.started = Instant::now();
                conn.last_activity = conn.started;
                (conn.generation, conn.peer)
            }
            None => return,
        };

        let tx = self.shared.completions_tx.clone();
        let waker = self.waker.clone();
        self.shared.router.route(request).on_complete(move |outcome| {
            let _ = tx.send(Completion { key, generation, outcome });
            let _ = waker.wake();
        });
        // A synchronous handler has already sent its completion; pick it
        // up now so it cannot queue behind socket work.
        self.drain_completions();
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion { key, generation, outcome } = completion;
        match self.connections.get(key) {
            Some(conn) if conn.generation == generation => {}
            _ => return,
        }

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                match err {
                    HandlerError::Overloaded => self.shared.metrics.record_overload(),
                    HandlerError::TimedOut => self.shared.metrics.record_deadline_timeout(),
                    _ => self.shared.metrics.record_handler_failure(),
                }
                err.to_response()
            }
        };
        self.stage_response(key, response);
    }

    // Serialises into the connection's write buffer and starts flushing.
    fn stage_response(&mut self, key: usize, mut response: Response) {
        let keep_alive = response
            .headers()
            .get("Connection")
            .map_or(false, |v| v.eq_ignore_ascii_case("keep-alive"));
        let bytes = wire::serialize_response(&mut response);
        {
            let conn = match self.connections.get_mut(key) {
                Some(conn) => conn,
                None => return,
            };
            conn.write_buf = bytes;
            conn.written = 0;
            conn.pending_status = response.status_code();
            conn.close_after_write = !keep_alive;
            conn.state = ConnState::Writing;
            conn.last_activity = Instant::now();
            let token = Token(key + TOKEN_BASE);
            let _ = self.poll.registry().reregister(
                &mut conn.stream,
                token,
                Interest::WRITABLE,
            );
        }
        // Greedy first flush; edge-triggered wakeups only cover bytes we
        // could not write here.
        self.handle_writable(key);
    }

    fn handle_writable(&mut self, key: usize) {
        loop {
            let conn = match self.connections.get_mut(key) {
                Some(conn) => conn,
                None => return,
            };
            if !matches!(conn.state, ConnState::Writing) {
                return;
            }
            if conn.written >= conn.write_buf.len() {
                break;
            }
            match conn.stream.write(&conn.write_buf[conn.written..]) {
                Ok(0) => {
                    self.shared.metrics.record_peer_disconnect();
                    self.close_connection(key);
                    return;
                }
                Ok(written) => {
                    conn.written += written;
                    conn.last_activity = Instant::now();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if is_peer_disconnect(&err) {
                        self.shared.metrics.record_peer_disconnect();
                        warn!("peer {} disconnected mid-response: {}", conn.peer, err);
                    } else {
                        debug!("write error to {}: {}", conn.peer, err);
                    }
                    self.close_connection(key);
                    return;
                }
            }
        }
        self.finish_response(key);
    }

    fn finish_response(&mut self, key: usize) {
        let (close, latency, status, generation) = match self.connections.get_mut(key) {
            Some(conn) => (
                conn.close_after_write,
                conn.started.elapsed(),
                conn.pending_status,
                conn.generation,
            ),
            None => return,
        };
        self.shared.metrics.record_response(status, latency);

        if close {
            self.close_connection(key);
            return;
        }

        // Keep-alive: back to reading, fresh deadline. Any pipelined
        // bytes already sitting in the parser are handled right away.
        let pipelined = {
            let conn = self.connections.get_mut(key).unwrap();
            conn.state = ConnState::Reading;
            conn.write_buf = Vec::new();
            conn.written = 0;
            conn.last_activity = Instant::now();
            let token = Token(key + TOKEN_BASE);
            let _ = self.poll.registry().reregister(
                &mut conn.stream,
                token,
                Interest::READABLE,
            );
            match conn.parser.push(&[]) {
                Ok(Some(request)) => Some(request),
                _ => None,
            }
        };
        self.push_timer(
            Instant::now() + self.shared.config.read_timeout,
            TimerKind::ReadDeadline { key, generation },
        );
        match pipelined {
            Some(request) => self.dispatch(key, request),
            None => self.handle_readable(key),
        }
    }

    fn close_connection(&mut self, key: usize) {
        if !self.connections.contains(key) {
            return;
        }
        let mut conn = self.connections.remove(key);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        drop(conn);
        self.shared.metrics.connection_closed();

        if self.accept_paused
            && self.connections.len() < self.shared.config.max_connections
        {
            self.accept_paused = false;
            self.drain_accept();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::handler::{delay_response, offload_response, sync_handler};
    use crate::request::Method;
    use crate::response::Response;

    fn test_config() -> Config {
        Config {
            port: 0,
            offload_workers: 2,
            ..Config::default()
        }
    }

    fn test_router() -> Router {
        let mut router = Router::new();
        router.add(Method::Get, "/ping", sync_handler(|_| Response::text("pong")));
        router.add(Method::Get, "/block", |_request: crate::request::Request| {
            offload_response(|| {
                std::thread::sleep(Duration::from_millis(50));
                Response::text("offloaded")
            })
        });
        router.add(Method::Get, "/wait", |_request: crate::request::Request| {
            delay_response(Duration::from_millis(80), || Response::text("waited"))
        });
        router.add(Method::Post, "/echo", sync_handler(|request| {
            Response::text(String::from_utf8_lossy(request.body()).into_owned())
        }));
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
    fn serves_sync_offloaded_and_delayed_handlers() {
        let mut server = EventLoopServer::start(test_config(), test_router()).unwrap();
        let addr = server.local_addr();

        let ping = raw_roundtrip(addr, b"GET /ping HTTP/1.1\r\nHost: t\r\n\r\n");
        assert!(ping.starts_with("HTTP/1.1 200"));
        assert!(ping.ends_with("pong"));

        let blocked = raw_roundtrip(addr, b"GET /block HTTP/1.1\r\nHost: t\r\n\r\n");
        assert!(blocked.ends_with("offloaded"));

        let started = Instant::now();
        let waited = raw_roundtrip(addr, b"GET /wait HTTP/1.1\r\nHost: t\r\n\r\n");
        assert!(waited.ends_with("waited"));
        assert!(started.elapsed() >= Duration::from_millis(80));

        server.stop();
    }

    #[test]
    fn echoes_bodies_and_rejects_garbage() {
        let mut server = EventLoopServer::start(test_config(), test_router()).unwrap();
        let addr = server.local_addr();

        let echoed = raw_roundtrip(
            addr,
            b"POST /echo HTTP/1.1\r\nHost: t\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert!(echoed.ends_with("hello"));

        let bad = raw_roundtrip(addr, b"GARBAGE-LINE\r\n\r\n");
        assert!(bad.starts_with("HTTP/1.1 400"), "got: {}", bad);

        server.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut server = EventLoopServer::start(test_config(), test_router()).unwrap();
        server.stop();
        server.stop();
    }
}
