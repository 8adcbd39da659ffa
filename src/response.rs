// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

use crate::request::Headers;

/// A response being built by a handler.
///
/// The response stays mutable until the engine hands it to the wire codec
/// for serialisation. The `Content-Length` header always equals the body
/// length: every body mutation goes through [`set_body`](Response::set_body),
/// which re-establishes it.
pub struct Response {
    status_code: u16,
    reason: Cow<'static, str>,
    headers: Headers,
    body: Vec<u8>,
    created_at: SystemTime,
}

impl Response {
    /// An empty response with the given status code and its canonical
    /// reason phrase.
    pub fn from_status(status_code: u16) -> Response {
        let mut response = Response {
            status_code,
            reason: Cow::Borrowed(default_reason_phrase(status_code)),
            headers: Headers::new(),
            body: Vec::new(),
            created_at: SystemTime::now(),
        };
        response.headers.set("Content-Length", "0");
        response
    }

    /// A 200 response with a UTF-8 text body.
    ///
    /// # Example
    ///
    /// ```
    /// use triptych::Response;
    /// let response = Response::text("hello world");
    /// assert_eq!(response.status_code(), 200);
    /// ```
    pub fn text<S>(text: S) -> Response
        where S: Into<String>
    {
        Response::from_status(200)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(text.into().into_bytes())
    }

    /// A 200 response with an HTML body.
    pub fn html<S>(content: S) -> Response
        where S: Into<String>
    {
        Response::from_status(200)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(content.into().into_bytes())
    }

    /// A 200 response whose body is `content` serialised as JSON.
    ///
    /// Serialisation failures are not propagated to the client as a broken
    /// body; they produce a 500 instead.
    pub fn json<T>(content: &T) -> Response
        where T: Serialize
    {
        match serde_json::to_vec(content) {
            Ok(body) => {
                Response::from_status(200)
                    .with_header("Content-Type", "application/json")
                    .with_body(body)
            }
            Err(_) => Response::from_status(500),
        }
    }

    pub fn empty_400() -> Response {
        Response::from_status(400)
    }

    pub fn empty_404() -> Response {
        Response::from_status(404)
    }

    /// Changes the status code, resetting the reason phrase to the
    /// canonical one.
    pub fn with_status_code(mut self, status_code: u16) -> Response {
        self.status_code = status_code;
        self.reason = Cow::Borrowed(default_reason_phrase(status_code));
        self
    }

    /// Overrides the reason phrase without touching the code.
    pub fn with_reason<S>(mut self, reason: S) -> Response
        where S: Into<Cow<'static, str>>
    {
        self.reason = reason.into();
        self
    }

    /// Appends a header.
    pub fn with_header<N, V>(mut self, name: N, value: V) -> Response
        where N: Into<String>, V: Into<String>
    {
        self.headers.append(name, value);
        self
    }

    /// Replaces the body, keeping `Content-Length` in step.
    pub fn with_body(mut self, body: Vec<u8>) -> Response {
        self.set_body(body);
        self
    }

    /// Replaces the body. `Content-Length` is updated to the new length.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
        let mut buffer = itoa::Buffer::new();
        let len = buffer.format(self.body.len()).to_owned();
        self.headers.set("Content-Length", len);
    }

    #[inline]
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    #[inline]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// When this response object was created. Diagnostics only.
    #[inline]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// True for status codes in `[200, 400)`.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status_code >= 200 && self.status_code < 400
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Response")
            .field("status_code", &self.status_code)
            .field("reason", &self.reason)
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// The canonical reason phrase for a status code.
pub fn default_reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Time-out",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Large",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version not supported",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::Response;

    #[test]
    fn content_length_follows_every_mutation() {
        let mut response = Response::text("hello");
        assert_eq!(response.headers().get("Content-Length"), Some("5"));

        response.set_body(b"a longer body".to_vec());
        assert_eq!(response.headers().get("Content-Length"), Some("13"));

        response.set_body(Vec::new());
        assert_eq!(response.headers().get("Content-Length"), Some("0"));
    }

    #[test]
    fn status_helpers() {
        assert_eq!(Response::empty_404().status_code(), 404);
        assert_eq!(Response::empty_404().reason(), "Not Found");
        assert_eq!(Response::empty_400().status_code(), 400);
        assert!(Response::text("ok").is_success());
        assert!(!Response::from_status(500).is_success());
    }

    #[test]
    fn with_status_code_resets_reason() {
        let response = Response::text("gone").with_status_code(410);
        assert_eq!(response.reason(), "Gone");
        let custom = Response::from_status(200).with_reason("Fine");
        assert_eq!(custom.reason(), "Fine");
    }

    #[test]
    fn json_body_is_serialised() {
        #[derive(serde::Serialize)]
        struct Payload { value: u32 }
        let response = Response::json(&Payload { value: 9 });
        assert_eq!(response.headers().get("Content-Type"), Some("application/json"));
        assert_eq!(response.body(), br#"{"value":9}"#);
    }
}
