// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! End-to-end tests driving the three engines over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use triptych::engine::{Engine, EventLoopServer, HybridServer, ThreadedServer};
use triptych::{sync_handler, Config, Method, Response, Router};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn demo_router() -> Router {
    let mut router = Router::new();
    router.add(Method::Get, "/hello", sync_handler(|request| {
        let name = request.query_value("name").unwrap_or_else(|| "stranger".to_owned());
        Response::text(format!("hello {}", name))
    }));
    router.add(Method::Post, "/submit", sync_handler(|request| {
        Response::text(format!("got:{}", String::from_utf8_lossy(request.body())))
    }));
    router
}

fn test_config() -> Config {
    Config {
        port: 0,
        thread_pool_size: 16,
        offload_workers: 2,
        ..Config::default()
    }
}

fn client_addr(engine: &dyn Engine) -> SocketAddr {
    ([127, 0, 0, 1], engine.local_addr().port()).into()
}

fn raw_request(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(15))).unwrap();
    stream.write_all(request).unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    response
}

fn each_engine<F>(mut check: F)
    where F: FnMut(&str, &mut dyn Engine)
{
    init_logging();

    let mut threaded = ThreadedServer::start(test_config(), demo_router()).unwrap();
    check("threaded", &mut threaded);
    threaded.stop();

    let mut hybrid = HybridServer::start(test_config(), demo_router()).unwrap();
    check("hybrid", &mut hybrid);
    hybrid.stop();

    let mut event_loop = EventLoopServer::start(test_config(), demo_router()).unwrap();
    check("event-loop", &mut event_loop);
    event_loop.stop();
}

#[test]
fn query_parameters_reach_handlers_on_every_engine() {
    each_engine(|name, engine| {
        let response = raw_request(
            client_addr(engine),
            b"GET /hello?name=Alice HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200"), "{}: {}", name, response);
        assert!(response.contains("Alice"), "{}: {}", name, response);
    });
}

#[test]
fn posted_bodies_arrive_byte_exact_on_every_engine() {
    each_engine(|name, engine| {
        let response = raw_request(
            client_addr(engine),
            b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert!(response.starts_with("HTTP/1.1 200"), "{}: {}", name, response);
        assert!(response.ends_with("got:hello"), "{}: {}", name, response);
    });
}

#[test]
fn an_oversize_request_line_cannot_crash_an_engine() {
    each_engine(|name, engine| {
        let addr = client_addr(engine);

        let mut huge = Vec::new();
        huge.extend_from_slice(b"GET /");
        huge.extend(std::iter::repeat(b'a').take(9_000));
        huge.extend_from_slice(b" HTTP/1.1\r\nHost: x\r\n\r\n");
        let response = raw_request(addr, &huge);
        // Either no response at all or a 400; never a success.
        assert!(
            response.is_empty() || response.starts_with("HTTP/1.1 400"),
            "{}: unexpected response: {}", name, response,
        );

        // The engine keeps serving afterwards.
        let after = raw_request(addr, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(after.starts_with("HTTP/1.1 200"), "{}: {}", name, after);
    });
}

#[test]
fn management_endpoints_are_mounted_by_default() {
    each_engine(|name, engine| {
        let addr = client_addr(engine);
        for path in &["/health", "/metrics", "/info"] {
            let request = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", path);
            let response = raw_request(addr, request.as_bytes());
            assert!(response.starts_with("HTTP/1.1 200"), "{} {}: {}", name, path, response);
        }
        let health = raw_request(addr, b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(health.contains("activeConnections"), "{}: {}", name, health);
    });
}

#[test]
fn unknown_routes_get_404_on_every_engine() {
    each_engine(|name, engine| {
        let response = raw_request(
            client_addr(engine),
            b"GET /no/such/route HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 404"), "{}: {}", name, response);
    });
}

#[test]
fn threaded_engine_honours_its_worker_cap_under_load() {
    init_logging();
    let config = Config {
        port: 0,
        thread_pool_size: 100,
        max_connections: 1_000,
        ..Config::default()
    };
    let mut server = ThreadedServer::start(config, demo_router()).unwrap();
    let addr = client_addr(&server);

    let successes = Arc::new(AtomicUsize::new(0));
    let peak_workers = Arc::new(AtomicUsize::new(0));
    let total_requests = 1_000;
    let client_threads = 100;

    let mut clients = Vec::new();
    for _ in 0..client_threads {
        let successes = successes.clone();
        clients.push(thread::spawn(move || {
            for _ in 0..(total_requests / client_threads) {
                let response = raw_request(addr, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
                if response.starts_with("HTTP/1.1 200") {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    // Sample the worker gauge while the load runs; the scope keeps the
    // sampler's borrow of the server from outliving the test body.
    let done = AtomicUsize::new(0);
    thread::scope(|scope| {
        let handle = scope.spawn(|| {
            while done.load(Ordering::SeqCst) == 0 {
                peak_workers.fetch_max(server.live_workers(), Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
            }
        });
        for client in clients {
            client.join().unwrap();
        }
        done.store(1, Ordering::SeqCst);
        handle.join().unwrap();
    });

    assert_eq!(successes.load(Ordering::SeqCst), total_requests);
    assert!(
        peak_workers.load(Ordering::SeqCst) <= 100,
        "observed {} live workers", peak_workers.load(Ordering::SeqCst),
    );
    server.stop();
}

#[test]
fn a_handler_sleeping_past_the_hybrid_deadline_still_answers() {
    init_logging();
    // Scaled-down rendition of the 10 s deadline / 12 s sleep case.
    let config = Config {
        port: 0,
        thread_pool_size: 8,
        request_deadline: Duration::from_secs(1),
        ..Config::default()
    };
    let mut router = Router::new();
    router.add(Method::Get, "/sleepy", sync_handler(|_| {
        thread::sleep(Duration::from_millis(2_500));
        Response::text("slept it off")
    }));

    let mut server = HybridServer::start(config, router).unwrap();
    let started = Instant::now();
    let response = raw_request(
        client_addr(&server),
        b"GET /sleepy HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    let elapsed = started.elapsed();

    // Within deadline + 50% slack, and either the handler's body or a 503.
    assert!(elapsed < Duration::from_millis(1_500), "took {:?}", elapsed);
    assert!(
        response.starts_with("HTTP/1.1 503") || response.contains("slept it off"),
        "unexpected: {}", response,
    );
    server.stop();
}

#[test]
fn repeated_start_stop_cycles_leak_no_threads() {
    init_logging();
    // Warm-up cycle so lazily-created runtime state settles.
    for _ in 0..2 {
        let mut server = ThreadedServer::start(test_config(), demo_router()).unwrap();
        let _ = raw_request(client_addr(&server), b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        server.stop();
    }

    let before = thread_count();
    for _ in 0..10 {
        let mut threaded = ThreadedServer::start(test_config(), demo_router()).unwrap();
        let _ = raw_request(client_addr(&threaded), b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        threaded.stop();

        let mut hybrid = HybridServer::start(test_config(), demo_router()).unwrap();
        let _ = raw_request(client_addr(&hybrid), b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        hybrid.stop();

        let mut event_loop = EventLoopServer::start(test_config(), demo_router()).unwrap();
        let _ = raw_request(client_addr(&event_loop), b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        event_loop.stop();
    }
    let after = thread_count();

    if let (Some(before), Some(after)) = (before, after) {
        assert!(
            after <= before + 2,
            "thread count grew from {} to {} across 10 cycles", before, after,
        );
    }
}

// Linux reports the live thread count in /proc; elsewhere the leak check
// degrades to the start/stop cycles simply succeeding.
fn thread_count() -> Option<usize> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Threads:") {
            return rest.trim().parse().ok();
        }
    }
    None
}
