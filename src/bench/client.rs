// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The raw benchmark client.
//!
//! One fresh connection per request — the engines answer with
//! `Connection: close`, and reusing sockets would hide the accept-path
//! cost the scenarios are meant to measure. Latency is wall-clock from
//! the first byte written to the response fully read.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use crate::request::{Headers, Method};
use crate::wire;

/// One request's outcome as the client saw it.
#[derive(Debug, Clone)]
pub struct Sample {
    pub latency: Duration,
    pub result: Result<u16, ErrorBucket>,
}

impl Sample {
    /// A 2xx/3xx answer.
    pub fn is_success(&self) -> bool {
        matches!(self.result, Ok(status) if status < 400)
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.result, Err(ErrorBucket::Timeout))
    }

    /// The bucket this sample lands in for error accounting, `None` for
    /// successes.
    pub fn error_label(&self) -> Option<String> {
        match self.result {
            Ok(status) if status < 400 => None,
            Ok(status) => Some(format!("http_{}", status)),
            Err(ref bucket) => Some(bucket.label().to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorBucket {
    /// Could not connect at all.
    Connect,
    /// The per-request budget elapsed while connecting, writing or
    /// reading.
    Timeout,
    /// Transport failed mid-request.
    Io,
    /// The peer answered something that is not parseable HTTP, or closed
    /// before the declared body arrived.
    BadResponse,
}

impl ErrorBucket {
    pub fn label(&self) -> &'static str {
        match *self {
            ErrorBucket::Connect => "connect",
            ErrorBucket::Timeout => "timeout",
            ErrorBucket::Io => "io",
            ErrorBucket::BadResponse => "bad_response",
        }
    }
}

/// Sends one GET and reads the response to the end.
pub fn fetch(addr: SocketAddr, path: &str, timeout: Duration) -> Sample {
    let started = Instant::now();
    let result = fetch_inner(addr, path, timeout);
    Sample { latency: started.elapsed(), result }
}

fn fetch_inner(addr: SocketAddr, path: &str, timeout: Duration) -> Result<u16, ErrorBucket> {
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|err| {
        if err.kind() == std::io::ErrorKind::TimedOut {
            ErrorBucket::Timeout
        } else {
            ErrorBucket::Connect
        }
    })?;
    stream.set_read_timeout(Some(timeout)).map_err(|_| ErrorBucket::Io)?;
    stream.set_write_timeout(Some(timeout)).map_err(|_| ErrorBucket::Io)?;
    let _ = stream.set_nodelay(true);

    let mut headers = Headers::new();
    headers.append("Host", addr.to_string());
    headers.append("Connection", "close");
    let request = wire::serialize_request(Method::Get, path, &headers, &[]);

    let mut stream = stream;
    stream.write_all(&request).map_err(classify_io)?;

    // `Connection: close` semantics: the response ends when the server
    // closes, so one read-to-end captures it all.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).map_err(classify_io)?;

    parse_response(&raw)
}

fn classify_io(err: std::io::Error) -> ErrorBucket {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorBucket::Timeout,
        _ => ErrorBucket::Io,
    }
}

// Minimal response scan: status code off the first line, then a
// completeness check of the body against Content-Length.
fn parse_response(raw: &[u8]) -> Result<u16, ErrorBucket> {
    let header_end = raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(ErrorBucket::BadResponse)?;
    let head = std::str::from_utf8(&raw[..header_end]).map_err(|_| ErrorBucket::BadResponse)?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().ok_or(ErrorBucket::BadResponse)?;
    let mut tokens = status_line.splitn(3, ' ');
    let version = tokens.next().ok_or(ErrorBucket::BadResponse)?;
    if !version.starts_with("HTTP/") {
        return Err(ErrorBucket::BadResponse);
    }
    let status: u16 = tokens
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or(ErrorBucket::BadResponse)?;

    let mut content_length: Option<usize> = None;
    for line in lines {
        if let Some(pos) = line.find(':') {
            if line[..pos].trim().eq_ignore_ascii_case("content-length") {
                content_length = line[pos + 1..].trim().parse().ok();
            }
        }
    }
    if let Some(expected) = content_length {
        let body_len = raw.len() - header_end - 4;
        if body_len < expected {
            return Err(ErrorBucket::BadResponse);
        }
    }
    Ok(status)
}
