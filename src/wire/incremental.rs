// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::io::{self, ErrorKind};
use std::mem;
use std::net::SocketAddr;

use crate::request::{Headers, Method, Request};

use super::{declared_body_length, parse_header_block, parse_request_line, ParseError,
            MAX_HEADER_BYTES, MAX_REQUEST_LINE_BYTES};

/// Incremental request parser, fed one chunk of bytes at a time.
///
/// The non-blocking engines own one of these per connection and push
/// whatever a readiness event produced. Limits and error behaviour are
/// identical to the blocking [`read_request`](super::read_request); only
/// the delivery of bytes differs.
pub struct RequestParser {
    buffer: Vec<u8>,
    state: State,
    remote_addr: Option<SocketAddr>,
}

enum State {
    // `scanned` is how far the terminator search already looked, so a
    // trickle of one-byte reads stays linear.
    RequestLine { scanned: usize },
    Headers { method: Method, path: String, raw_query: String, scanned: usize },
    Body { method: Method, path: String, raw_query: String, headers: Headers, needed: usize },
    // A previous push returned an error; everything after is undefined.
    Failed,
}

impl RequestParser {
    pub fn new(remote_addr: Option<SocketAddr>) -> RequestParser {
        RequestParser {
            buffer: Vec::with_capacity(1_024),
            state: State::RequestLine { scanned: 0 },
            remote_addr,
        }
    }

    /// True when no byte of a request has been received yet. Engines use
    /// this to tell an idle connection from one stuck mid-request.
    pub fn is_idle(&self) -> bool {
        match self.state {
            State::RequestLine { .. } => self.buffer.is_empty(),
            _ => false,
        }
    }

    /// Feeds bytes and tries to complete a request.
    ///
    /// `Ok(None)` means more bytes are needed. `Ok(Some(request))` hands
    /// out a finished request and resets the parser; bytes beyond the
    /// request stay buffered. Errors are terminal for the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<Request>, ParseError> {
        self.buffer.extend_from_slice(data);
        match self.advance() {
            Ok(done) => Ok(done),
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    /// Tells the parser the peer closed its write side. `None` when the
    /// connection was idle (a silent disconnect); otherwise the error the
    /// truncated request maps to.
    pub fn eof(&self) -> Option<ParseError> {
        match self.state {
            State::RequestLine { .. } if self.buffer.is_empty() => None,
            State::RequestLine { .. } | State::Headers { .. } => {
                Some(ParseError::Io(io::Error::from(ErrorKind::UnexpectedEof)))
            }
            State::Body { .. } => Some(ParseError::ShortBody),
            State::Failed => None,
        }
    }

    fn advance(&mut self) -> Result<Option<Request>, ParseError> {
        loop {
            match mem::replace(&mut self.state, State::Failed) {
                State::RequestLine { scanned } => {
                    let from = scanned.saturating_sub(1);
                    match find_crlf(&self.buffer[from..]) {
                        Some(pos) => {
                            let line_end = from + pos;
                            if line_end > MAX_REQUEST_LINE_BYTES {
                                return Err(ParseError::OversizeRequestLine);
                            }
                            let (method, path, raw_query) =
                                parse_request_line(&self.buffer[..line_end])?;
                            self.buffer.drain(..line_end + 2);
                            self.state = State::Headers { method, path, raw_query, scanned: 0 };
                        }
                        None => {
                            if self.buffer.len() > MAX_REQUEST_LINE_BYTES + 2 {
                                return Err(ParseError::OversizeRequestLine);
                            }
                            self.state = State::RequestLine { scanned: self.buffer.len() };
                            return Ok(None);
                        }
                    }
                }

                State::Headers { method, path, raw_query, scanned } => {
                    // A block of zero headers is just the blank line.
                    let block_end = if self.buffer.starts_with(b"\r\n") {
                        Some(2)
                    } else {
                        let from = scanned.saturating_sub(3);
                        find_double_crlf(&self.buffer[from..]).map(|pos| from + pos + 4)
                    };

                    match block_end {
                        Some(end) => {
                            if end > MAX_HEADER_BYTES + 2 {
                                return Err(ParseError::OversizeHeaders);
                            }
                            let headers = parse_header_block(&self.buffer[..end])?;
                            self.buffer.drain(..end);
                            let needed = declared_body_length(&headers)?;
                            self.state = State::Body { method, path, raw_query, headers, needed };
                        }
                        None => {
                            if self.buffer.len() > MAX_HEADER_BYTES + 2 {
                                return Err(ParseError::OversizeHeaders);
                            }
                            let scanned = self.buffer.len();
                            self.state = State::Headers { method, path, raw_query, scanned };
                            return Ok(None);
                        }
                    }
                }

                State::Body { method, path, raw_query, headers, needed } => {
                    if self.buffer.len() < needed {
                        self.state = State::Body { method, path, raw_query, headers, needed };
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..needed).collect();
                    self.state = State::RequestLine { scanned: 0 };
                    let request = Request::new(method, path, raw_query, headers, body,
                                               self.remote_addr);
                    return Ok(Some(request));
                }

                State::Failed => {
                    return Err(ParseError::Io(io::Error::from(ErrorKind::InvalidData)));
                }
            }
        }
    }
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(2).position(|w| w == b"\r\n")
}

fn find_double_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(4).position(|w| w == b"\r\n\r\n")
}
