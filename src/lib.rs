// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Triptych — one HTTP/1.1 framework, three concurrency models.
//!
//! The same wire codec, router and handler contract sit behind three
//! interchangeable engines:
//!
//! - [`ThreadedServer`]: thread-per-connection over a bounded worker
//!   pool, blocking I/O, the handler's future awaited on the worker.
//! - [`HybridServer`]: an async pipeline (parse → route → write) across
//!   an I/O pool and a CPU pool, with a per-request deadline racing
//!   every handler.
//! - [`EventLoopServer`]: a single reactor thread over a readiness
//!   selector, with blocking work pushed to an offload pool and
//!   delivered back as reactor events.
//!
//! A handler is written once and served by all three:
//!
//! ```no_run
//! use triptych::{sync_handler, Config, Engine, Method, Response, Router, ThreadedServer};
//!
//! let mut router = Router::new();
//! router.add(Method::Get, "/hello/{name}", sync_handler(|request| {
//!     Response::text(format!("hello {}", request.param("name").unwrap()))
//! }));
//!
//! let server = ThreadedServer::start(Config::default(), router).unwrap();
//! println!("listening on {}", server.local_addr());
//! ```
//!
//! The [`bench`] module drives any running engine through five canonical
//! workloads and scores the runs against each other; see
//! [`bench::run`] and [`bench::compare`].
//!
//! Handlers that would block the event-loop reactor use [`offload`] (run
//! on a worker pool, completion re-enters the reactor as an event) or
//! [`delay_response`] (a timer wakeup, holding no thread). On the other
//! engines the same calls degrade to plain blocking, which is those
//! models' native behaviour.

pub mod bench;
pub mod config;
pub mod engine;
pub mod future;
pub mod handler;
pub mod metrics;
pub mod mgmt;
pub mod pool;
pub mod request;
pub mod response;
pub mod router;
pub mod wire;

pub use crate::config::{Config, ConfigError};
pub use crate::engine::{Engine, EventLoopServer, HybridServer, ThreadedServer};
pub use crate::future::{pending, Completer, FutureValue};
pub use crate::handler::{delay_response, offload, offload_response, sync_handler, Handler,
                         HandlerError, ResponseFuture};
pub use crate::metrics::ServerMetrics;
pub use crate::request::{Headers, Method, Request};
pub use crate::response::Response;
pub use crate::router::Router;
pub use crate::wire::ParseError;
