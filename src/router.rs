// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Pattern-matching request dispatcher.
//!
//! Patterns are slash-separated segments; a `{name}` segment captures one
//! non-empty, slash-free run. Compilation happens once at registration;
//! matching walks the compiled segments and allocates nothing beyond the
//! captured-parameter map. Routes are tried in registration order and the
//! first match wins.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::future::FutureValue;
use crate::handler::{Handler, HandlerError, ResponseFuture};
use crate::request::{Method, Request};
use crate::response::Response;

/// One registered route.
pub struct Route {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    capture_names: Vec<String>,
    handler: Arc<dyn Handler>,
}

enum Segment {
    Literal(String),
    // Index into `capture_names`.
    Capture(usize),
}

impl Route {
    fn compile(method: Method, pattern: &str, handler: Arc<dyn Handler>) -> Route {
        let mut segments = Vec::new();
        let mut capture_names = Vec::new();
        for raw in pattern.trim_start_matches('/').split('/') {
            if raw.len() >= 2 && raw.starts_with('{') && raw.ends_with('}') {
                capture_names.push(raw[1..raw.len() - 1].to_owned());
                segments.push(Segment::Capture(capture_names.len() - 1));
            } else {
                segments.push(Segment::Literal(raw.to_owned()));
            }
        }
        // "/" compiles to a single empty literal, which matches only the
        // bare root path.
        Route {
            method,
            pattern: pattern.to_owned(),
            segments,
            capture_names,
            handler,
        }
    }

    /// The raw pattern this route was registered with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn method(&self) -> Method {
        self.method
    }

    // Anchored end-to-end: segment counts must agree exactly.
    fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut actual = path.trim_start_matches('/').split('/');
        let mut expected = self.segments.iter();
        loop {
            match (expected.next(), actual.next()) {
                (Some(&Segment::Literal(ref literal)), Some(segment)) => {
                    if literal != segment {
                        return None;
                    }
                }
                (Some(&Segment::Capture(index)), Some(segment)) => {
                    if segment.is_empty() {
                        return None;
                    }
                    params.insert(self.capture_names[index].clone(), segment.to_owned());
                }
                (None, None) => return Some(params),
                _ => return None,
            }
        }
    }
}

/// The dispatcher. Built once, then shared read-only between every
/// connection of every engine.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Router {
        Router { routes: Vec::new() }
    }

    /// Registers a route. Registration order is the tie-break order when
    /// several patterns match.
    ///
    /// # Example
    ///
    /// ```
    /// use triptych::{sync_handler, Method, Response, Router};
    /// let mut router = Router::new();
    /// router.add(Method::Get, "/users/{id}", sync_handler(|request| {
    ///     Response::text(format!("user {}", request.param("id").unwrap()))
    /// }));
    /// ```
    pub fn add<H>(&mut self, method: Method, pattern: &str, handler: H)
        where H: Handler + 'static
    {
        self.add_shared(method, pattern, Arc::new(handler));
    }

    /// Same as [`add`](Router::add) for an already-shared handler.
    pub fn add_shared(&mut self, method: Method, pattern: &str, handler: Arc<dyn Handler>) {
        self.routes.push(Route::compile(method, pattern, handler));
    }

    /// Matches the request, fills in its path parameters and invokes the
    /// handler. A request nothing matches gets an already-completed 404.
    /// A panic inside the handler invocation becomes a
    /// [`HandlerError::Panicked`] completion rather than unwinding into
    /// the engine.
    pub fn route(&self, mut request: Request) -> ResponseFuture {
        for route in &self.routes {
            if route.method != request.method() {
                continue;
            }
            if let Some(params) = route.match_path(request.path()) {
                request.set_path_params(params);
                let handler = route.handler.clone();
                let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
                    handler.handle(request)
                }));
                return match outcome {
                    Ok(future) => future,
                    Err(_) => FutureValue::ready(Err(HandlerError::Panicked)),
                };
            }
        }
        FutureValue::ready(Ok(Response::empty_404()))
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// The registered routes, in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}
