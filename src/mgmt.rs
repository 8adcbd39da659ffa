// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Built-in route mountings: the management endpoints every engine
//! exposes by default, and the endpoints the benchmark scenarios drive.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::config::Config;
use crate::handler::{delay_response, offload_response, sync_handler, Handler};
use crate::metrics::ServerMetrics;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::router::Router;

/// Mounts `/health`, `/metrics`, `/info` and the `/static/{name}`
/// delegate. Called by every engine when monitoring is enabled.
///
/// The static route is a delegation point: deep file-tree serving is an
/// outer concern, so without a delegate it answers 404.
pub fn mount_management(router: &mut Router, engine_name: &'static str,
                        metrics: Arc<ServerMetrics>, config: &Config,
                        static_delegate: Option<Arc<dyn Handler>>)
{
    let health_metrics = metrics.clone();
    router.add(Method::Get, "/health", sync_handler(move |_| {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Response::json(&json!({
            "status": "UP",
            "timestamp": timestamp,
            "activeConnections": health_metrics.active_connections(),
            "totalRequests": health_metrics.total_requests(),
        }))
    }));

    router.add(Method::Get, "/metrics", sync_handler(move |_| {
        Response::json(&metrics.snapshot())
    }));

    let info = config.snapshot();
    router.add(Method::Get, "/info", sync_handler(move |_| {
        Response::json(&json!({
            "engine": engine_name,
            "config": info,
        }))
    }));

    match static_delegate {
        Some(delegate) => router.add_shared(Method::Get, "/static/{name}", delegate),
        None => {
            router.add(Method::Get, "/static/{name}", sync_handler(|_| {
                Response::empty_404()
            }));
        }
    }
}

// Fixed work per CPU-intensive request. Big enough to dominate request
// overhead, small enough to keep benchmark runs short.
const CPU_BURN_ITERATIONS: u64 = 2_000_000;

// Simulated downstream wait for the I/O-intensive endpoint.
const IO_WAIT: Duration = Duration::from_millis(100);

// Body size for the memory-pressure endpoint, allocated per request.
const MEMORY_BODY_BYTES: usize = 512 * 1024;

/// Mounts the endpoints the five canonical scenarios are keyed to.
pub fn mount_benchmark_endpoints(router: &mut Router) {
    router.add(Method::Get, "/bench/basic", sync_handler(|_| {
        Response::text("ok")
    }));

    router.add(Method::Get, "/bench/cpu", |_request: Request| {
        offload_response(|| {
            let digest = cpu_burn(CPU_BURN_ITERATIONS);
            Response::text(format!("{:016x}", digest))
        })
    });

    router.add(Method::Get, "/bench/io", |_request: Request| {
        delay_response(IO_WAIT, || Response::text("downstream done"))
    });

    router.add(Method::Get, "/bench/memory", sync_handler(|_| {
        let mut body = Vec::with_capacity(MEMORY_BODY_BYTES);
        // A repeating, non-constant pattern so the buffer cannot be
        // optimised into a memset.
        for i in 0..MEMORY_BODY_BYTES {
            body.push((i % 251) as u8);
        }
        Response::from_status(200)
            .with_header("Content-Type", "application/octet-stream")
            .with_body(body)
    }));
}

// Deterministic mixing loop; the result is returned in the body so the
// work cannot be elided.
fn cpu_burn(iterations: u64) -> u64 {
    let mut acc: u64 = 0x9e37_79b9_7f4a_7c15;
    for i in 0..iterations {
        acc = acc.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(i);
        acc ^= acc >> 29;
    }
    acc
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::request::Request;

    fn mounted_router() -> Router {
        let mut router = Router::new();
        mount_management(
            &mut router,
            "test-engine",
            Arc::new(ServerMetrics::new()),
            &Config::default(),
            None,
        );
        mount_benchmark_endpoints(&mut router);
        router
    }

    fn get(router: &Router, url: &str) -> Response {
        router.route(Request::fake(Method::Get, url)).wait().unwrap()
    }

    #[test]
    fn health_reports_the_required_fields() {
        let router = mounted_router();
        let response = get(&router, "/health");
        assert_eq!(response.status_code(), 200);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["status"], "UP");
        assert!(body["timestamp"].as_u64().unwrap() > 0);
        assert!(body.get("activeConnections").is_some());
        assert!(body.get("totalRequests").is_some());
    }

    #[test]
    fn metrics_and_info_serialise() {
        let router = mounted_router();
        let metrics = get(&router, "/metrics");
        let parsed: serde_json::Value = serde_json::from_slice(metrics.body()).unwrap();
        assert!(parsed.get("total_requests").is_some());

        let info = get(&router, "/info");
        let parsed: serde_json::Value = serde_json::from_slice(info.body()).unwrap();
        assert_eq!(parsed["engine"], "test-engine");
        assert_eq!(parsed["config"]["port"], 8080);
    }

    #[test]
    fn static_without_a_delegate_is_404() {
        let router = mounted_router();
        assert_eq!(get(&router, "/static/logo.png").status_code(), 404);
    }

    #[test]
    fn benchmark_endpoints_answer() {
        let router = mounted_router();
        assert_eq!(get(&router, "/bench/basic").body(), b"ok");
        assert_eq!(get(&router, "/bench/cpu").body().len(), 16);
        let memory = get(&router, "/bench/memory");
        assert_eq!(memory.body().len(), 512 * 1024);
    }

    #[test]
    fn cpu_burn_is_deterministic() {
        assert_eq!(cpu_burn(1_000), cpu_burn(1_000));
        assert_ne!(cpu_burn(1_000), cpu_burn(1_001));
    }
}
