// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Thread-per-connection engine.
//!
//! One accept loop feeds a bounded worker pool; every accepted socket is
//! a pool job that parses, routes, *waits on the handler's future*, and
//! writes — the whole request lives on one worker thread with blocking
//! I/O. Saturation makes the accept thread run the job itself, which is
//! the back-pressure: accepting slows down instead of the queue growing.

use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::pool::{Permit, PoolConfig, SaturationPolicy, Semaphore, Submission, WorkerPool};
use crate::router::Router;
use crate::wire;

use super::{is_peer_disconnect, write_error_response, Engine};

// How long the accept loop waits for a connection permit before spinning
// another iteration.
const PERMIT_WAIT: Duration = Duration::from_millis(100);

pub struct ThreadedServer {
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
    pool: WorkerPool,
    connections: Semaphore,
    stop: AtomicBool,
}

impl ThreadedServer {
    /// Binds and starts serving immediately. The management endpoints
    /// are mounted behind the caller's routes when monitoring is on.
    pub fn start(config: Config, mut router: Router) -> std::io::Result<ThreadedServer> {
        let listener = super::bind_listener(config.port, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let metrics = Arc::new(ServerMetrics::new());
        if config.monitoring_enabled {
            crate::mgmt::mount_management(&mut router, "threaded", metrics.clone(),
                                          &config, None);
        }

        let max_threads = config.thread_pool_size.max(1);
        let pool = WorkerPool::new(PoolConfig {
            name: "threaded".to_owned(),
            core_threads: 10usize.max(max_threads / 4).min(max_threads),
            max_threads,
            queue_depth: max_threads * 2,
            idle_timeout: Duration::from_secs(60),
            on_saturation: SaturationPolicy::CallerRuns,
            thread_init: None,
        });

        let shared = Arc::new(Shared {
            listener,
            local_addr,
            router: Arc::new(router),
            connections: Semaphore::new(config.max_connections),
            config,
            metrics,
            pool,
            stop: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        let accept_thread = thread::Builder::new()
            .name("threaded-accept".to_owned())
            .spawn(move || accept_loop(accept_shared))?;

        info!("threaded engine listening on {}", local_addr);
        Ok(ThreadedServer {
            shared,
            accept_thread: Some(accept_thread),
            stopped: false,
        })
    }

    /// Stops accepting, waits for live connections (drain budget), then
    /// tears the pool down (a second budget of the same length).
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.stop.store(true, Ordering::SeqCst);

        // The accept call is blocking; a throwaway local connection
        // unblocks it so it can observe the stop flag.
        let _ = TcpStream::connect(super::loopback_addr(self.shared.local_addr));
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }

        let drain = self.shared.config.shutdown_drain;
        let deadline = Instant::now() + drain;
        while self.shared.metrics.active_connections() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let leftover = self.shared.metrics.active_connections();
        if leftover > 0 {
            warn!("threaded engine: {} connection(s) still open at drain deadline", leftover);
        }

        if !self.shared.pool.shutdown(drain) {
            error!("threaded engine: worker pool missed its termination budget");
        }
        info!("threaded engine stopped");
    }

    /// Workers currently executing a connection. Exposed for tests.
    pub fn busy_workers(&self) -> usize {
        self.shared.pool.busy_threads()
    }

    /// Threads the pool has alive. Never exceeds the configured cap.
    pub fn live_workers(&self) -> usize {
        self.shared.pool.live_threads()
    }
}

impl Engine for ThreadedServer {
    fn name(&self) -> &'static str {
        "threaded"
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

impl Drop for ThreadedServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(shared: Arc<Shared>) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        // The connection cap is taken before accept; failing to get a
        // permit within the wait just spins the loop.
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
            // The wakeup connection itself, or a raced client; either
            // way the engine is closing.
            break;
        }

        shared.metrics.connection_opened();
        let job_shared = shared.clone();
        let submission = shared.pool.submit(Box::new(move || {
            serve_connection(&job_shared, stream, peer, permit);
        }));
        match submission {
            Submission::Queued => {}
            Submission::CallerRan => {
                shared.metrics.record_rejected_submission();
            }
            Submission::Rejected(job) => {
                // Only happens once shutdown flipped the pool; serve it
                // here rather than dropping the socket on the floor.
                shared.metrics.record_rejected_submission();
                job();
            }
        }
    }
    debug!("threaded accept loop exited");
}

// The whole lifecycle of one connection, on one thread:
// Accepted -> Parsing -> Routing -> Writing -> Closed.
fn serve_connection(shared: &Shared, stream: TcpStream, peer: SocketAddr, permit: Permit) {
    let started = Instant::now();

    let outcome = (|| {
        super::tune_stream(&stream, Some(shared.config.read_timeout))?;

        let mut reader = BufReader::new(&stream);
        let request = match wire::read_request(&mut reader, Some(peer)) {
            Ok(request) => request,
            Err(err) => {
                shared.metrics.record_parse_failure();
                match err {
                    wire::ParseError::Io(ref io_err) if is_peer_disconnect(io_err) => {
                        shared.metrics.record_peer_disconnect();
                        warn!("peer {} disconnected mid-request", peer);
                    }
                    wire::ParseError::EmptyRequest => {
                        debug!("peer {} closed without sending a request", peer);
                    }
                    ref err if err.deserves_response() => {
                        debug!("bad request from {}: {}", peer, err);
                        write_error_response(&mut (&stream), 400);
                    }
                    ref err => {
                        debug!("rejected request from {}: {}", peer, err);
                    }
                }
                return Ok(());
            }
        };

        // The defining move of this engine: the worker blocks until the
        // handler's future resolves.
        let result = shared.router.route(request).wait();

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                shared.metrics.record_handler_failure();
                debug!("handler failure for {}: {}", peer, err);
                err.to_response()
            }
        };

        let status = response.status_code();
        match wire::write_response(&mut (&stream), &mut response) {
            Ok(()) => {
                shared.metrics.record_response(status, started.elapsed());
            }
            Err(ref err) if is_peer_disconnect(err) => {
                shared.metrics.record_peer_disconnect();
                warn!("peer {} disconnected mid-response", peer);
            }
            Err(err) => return Err(err),
        }
        Ok(())
    })();

    if let Err(err) = outcome {
        debug!("connection to {} failed: {}", peer, err);
        write_error_response(&mut (&stream), 500);
    }

    drop(stream);
    drop(permit);
    shared.metrics.connection_closed();
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;

    use super::*;
    use crate::handler::sync_handler;
    use crate::request::Method;
    use crate::response::Response;

    fn test_config() -> Config {
        Config {
            port: 0,
            thread_pool_size: 8,
            ..Config::default()
        }
    }

    fn tiny_router() -> Router {
        let mut router = Router::new();
        router.add(Method::Get, "/ping", sync_handler(|_| Response::text("pong")));
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
    fn serves_a_request_end_to_end() {
        let mut server = ThreadedServer::start(test_config(), tiny_router()).unwrap();
        let response = raw_roundtrip(
            server.local_addr(),
            b"GET /ping HTTP/1.1\r\nHost: t\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("pong"));
        server.stop();
    }

    #[test]
    fn answers_400_on_garbage() {
        let mut server = ThreadedServer::start(test_config(), tiny_router()).unwrap();
        let response = raw_roundtrip(server.local_addr(), b"NOT-HTTP\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400"));
        server.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let mut server = ThreadedServer::start(test_config(), tiny_router()).unwrap();
        server.stop();
        server.stop();
    }
}
