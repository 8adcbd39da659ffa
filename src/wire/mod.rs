// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! HTTP/1.1 wire codec.
//!
//! [`read_request`] parses a request off a blocking stream; the
//! [`incremental::RequestParser`] does the same one readiness event at a
//! time for the non-blocking engines. Both enforce the same limits and
//! produce the same [`Request`] values, so the engines differ only in
//! *where* parsing runs, never in what gets parsed.

use std::error;
use std::fmt;
use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::str;
use std::time::SystemTime;

use percent_encoding::percent_decode_str;

use crate::request::{Headers, Method, Request};
use crate::response::Response;

pub mod incremental;

pub use self::incremental::RequestParser;

/// Longest accepted request line, in bytes.
pub const MAX_REQUEST_LINE_BYTES: usize = 8_192;

/// Cap on the cumulative size of all header lines. The number of headers
/// is unbounded as long as their total size stays under this.
pub const MAX_HEADER_BYTES: usize = 65_536;

/// Largest accepted `Content-Length`.
pub const MAX_BODY_BYTES: usize = 10_485_760;

/// The `Server` header value the framework emits.
pub const SERVER_NAME: &str = "triptych";

/// Reasons a byte stream fails to parse into a request.
#[derive(Debug)]
pub enum ParseError {
    /// The first line was blank, or the peer closed before sending one.
    EmptyRequest,
    /// The request line did not split into exactly three tokens, or its
    /// version token did not start with `HTTP/`.
    MalformedRequestLine,
    /// The request line exceeded [`MAX_REQUEST_LINE_BYTES`].
    OversizeRequestLine,
    /// The method token is not one of the nine recognised verbs.
    UnknownMethod,
    /// The header section exceeded [`MAX_HEADER_BYTES`].
    OversizeHeaders,
    /// A header line without `:`, with an empty name, or otherwise
    /// unparseable.
    MalformedHeader,
    /// `Content-Length` is not a non-negative integer.
    MalformedContentLength,
    /// `Content-Length` exceeded [`MAX_BODY_BYTES`].
    OversizeBody,
    /// The stream ended before `Content-Length` bytes of body arrived.
    ShortBody,
    /// The underlying transport failed.
    Io(io::Error),
}

impl fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParseError::EmptyRequest => write!(fmt, "blank request line"),
            ParseError::MalformedRequestLine => write!(fmt, "malformed request line"),
            ParseError::OversizeRequestLine => {
                write!(fmt, "request line longer than {} bytes", MAX_REQUEST_LINE_BYTES)
            }
            ParseError::UnknownMethod => write!(fmt, "unrecognised request method"),
            ParseError::OversizeHeaders => {
                write!(fmt, "headers larger than {} bytes", MAX_HEADER_BYTES)
            }
            ParseError::MalformedHeader => write!(fmt, "malformed header line"),
            ParseError::MalformedContentLength => {
                write!(fmt, "Content-Length is not a non-negative integer")
            }
            ParseError::OversizeBody => {
                write!(fmt, "Content-Length larger than {} bytes", MAX_BODY_BYTES)
            }
            ParseError::ShortBody => write!(fmt, "stream ended in the middle of the body"),
            ParseError::Io(ref err) => write!(fmt, "i/o error while parsing: {}", err),
        }
    }
}

impl error::Error for ParseError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            ParseError::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ParseError {
    fn from(err: io::Error) -> ParseError {
        ParseError::Io(err)
    }
}

impl ParseError {
    /// Whether the engine should bother answering with a 400, or just
    /// close. Oversize and transport failures get no response at all.
    pub fn deserves_response(&self) -> bool {
        match *self {
            ParseError::OversizeRequestLine
            | ParseError::OversizeHeaders
            | ParseError::OversizeBody
            | ParseError::EmptyRequest
            | ParseError::Io(_) => false,
            _ => true,
        }
    }
}

/// Parses one request off a blocking buffered stream.
///
/// Reads the request line, the headers up to the blank line, and exactly
/// `Content-Length` bytes of body (zero when the header is absent).
pub fn read_request<R>(reader: &mut R, remote_addr: Option<SocketAddr>)
                       -> Result<Request, ParseError>
    where R: BufRead
{
    let line = match read_line(reader, MAX_REQUEST_LINE_BYTES)? {
        LineOutcome::Line(line) => line,
        LineOutcome::Eof => return Err(ParseError::EmptyRequest),
        LineOutcome::TooLong => return Err(ParseError::OversizeRequestLine),
    };

    let (method, path, raw_query) = parse_request_line(&line)?;

    // Accumulate the raw header block, blank line included, so it can go
    // through the same httparse-backed path as the incremental parser.
    let mut block = Vec::new();
    loop {
        let remaining = MAX_HEADER_BYTES.saturating_sub(block.len());
        let line = match read_line(reader, remaining)? {
            LineOutcome::Line(line) => line,
            LineOutcome::Eof => {
                return Err(ParseError::Io(ErrorKind::UnexpectedEof.into()));
            }
            LineOutcome::TooLong => return Err(ParseError::OversizeHeaders),
        };
        let end = line.is_empty();
        block.extend_from_slice(&line);
        block.extend_from_slice(b"\r\n");
        if block.len() > MAX_HEADER_BYTES + 2 {
            return Err(ParseError::OversizeHeaders);
        }
        if end {
            break;
        }
    }

    let headers = parse_header_block(&block)?;

    let body_len = declared_body_length(&headers)?;
    let mut body = vec![0; body_len];
    if body_len > 0 {
        reader.read_exact(&mut body).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                ParseError::ShortBody
            } else {
                ParseError::Io(err)
            }
        })?;
    }

    Ok(Request::new(method, path, raw_query, headers, body, remote_addr))
}

/// Splits and validates a request line (without its CRLF).
///
/// Returns the method, the percent-decoded path and the raw query string.
pub fn parse_request_line(line: &[u8]) -> Result<(Method, String, String), ParseError> {
    if line.is_empty() {
        return Err(ParseError::EmptyRequest);
    }

    let line = str::from_utf8(line).map_err(|_| ParseError::MalformedRequestLine)?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 3 {
        return Err(ParseError::MalformedRequestLine);
    }

    // Any HTTP/x.y is accepted here; responses always go out as 1.1.
    if !tokens[2].starts_with("HTTP/") {
        return Err(ParseError::MalformedRequestLine);
    }

    let method = Method::from_bytes(tokens[0].as_bytes()).ok_or(ParseError::UnknownMethod)?;

    let target = tokens[1];
    let (raw_path, raw_query) = match target.find('?') {
        Some(pos) => (&target[..pos], &target[pos + 1..]),
        None => (target, ""),
    };

    let path = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();
    if !path.starts_with('/') {
        return Err(ParseError::MalformedRequestLine);
    }

    Ok((method, path, raw_query.to_owned()))
}

/// Parses a complete header block, terminating blank line included.
///
/// The httparse scratch array grows on demand, so any number of headers
/// fits as long as the caller enforced the cumulative byte limit.
pub fn parse_header_block(block: &[u8]) -> Result<Headers, ParseError> {
    let mut capacity = 32;
    loop {
        let mut scratch = vec![httparse::EMPTY_HEADER; capacity];
        match httparse::parse_headers(block, &mut scratch) {
            Ok(httparse::Status::Complete((_, parsed))) => {
                let mut headers = Headers::new();
                for header in parsed {
                    headers.append(
                        header.name.to_owned(),
                        String::from_utf8_lossy(header.value).into_owned(),
                    );
                }
                return Ok(headers);
            }
            Ok(httparse::Status::Partial) => return Err(ParseError::MalformedHeader),
            Err(httparse::Error::TooManyHeaders) => capacity *= 2,
            Err(_) => return Err(ParseError::MalformedHeader),
        }
    }
}

/// The body length a header block declares. Zero when `Content-Length` is
/// absent; errors on garbage or on values over the body cap.
pub fn declared_body_length(headers: &Headers) -> Result<usize, ParseError> {
    let value = match headers.get("Content-Length") {
        Some(value) => value.trim(),
        None => return Ok(0),
    };
    let length: usize = value.parse().map_err(|_| ParseError::MalformedContentLength)?;
    if length > MAX_BODY_BYTES {
        return Err(ParseError::OversizeBody);
    }
    Ok(length)
}

/// Serialises a response into a fresh byte buffer.
///
/// Forces the framing headers first: `Content-Length` equal to the body,
/// `Connection: close` unless set, an RFC 1123 `Date`, and the `Server`
/// identifier.
pub fn serialize_response(response: &mut Response) -> Vec<u8> {
    let body_len = response.body().len();
    let mut itoa_buf = itoa::Buffer::new();
    response.headers_mut().set("Content-Length", itoa_buf.format(body_len).to_owned());
    if !response.headers().contains("Connection") {
        response.headers_mut().set("Connection", "close");
    }
    if !response.headers().contains("Date") {
        response.headers_mut().set("Date", httpdate::fmt_http_date(SystemTime::now()));
    }
    if !response.headers().contains("Server") {
        response.headers_mut().set("Server", SERVER_NAME);
    }

    let mut out = Vec::with_capacity(128 + body_len);
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(itoa_buf.format(response.status_code()).as_bytes());
    out.push(b' ');
    out.extend_from_slice(response.reason().as_bytes());
    out.extend_from_slice(b"\r\n");

    for &(ref name, ref value) in response.headers() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(response.body());
    out
}

/// Serialises and writes a response to a blocking stream.
pub fn write_response<W>(out: &mut W, response: &mut Response) -> io::Result<()>
    where W: Write
{
    let bytes = serialize_response(response);
    out.write_all(&bytes)?;
    out.flush()
}

/// Serialises a request into bytes, the exact inverse of [`read_request`]
/// for canonical inputs. The benchmark client sends these.
pub fn serialize_request(method: Method, target: &str, headers: &Headers, body: &[u8])
                         -> Vec<u8>
{
    let mut out = Vec::with_capacity(64 + body.len());
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for &(ref name, ref value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

enum LineOutcome {
    Line(Vec<u8>),
    Eof,
    TooLong,
}

// Reads one `\n`-terminated line, stripping the terminator and an optional
// trailing `\r`. Stops early once `limit` bytes accumulated without a
// terminator.
fn read_line<R>(reader: &mut R, limit: usize) -> Result<LineOutcome, ParseError>
    where R: BufRead
{
    let mut line = Vec::new();
    loop {
        let (used, done) = {
            let available = match reader.fill_buf() {
                Ok(available) => available,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(ParseError::Io(err)),
            };
            if available.is_empty() {
                if line.is_empty() {
                    return Ok(LineOutcome::Eof);
                }
                return Err(ParseError::Io(ErrorKind::UnexpectedEof.into()));
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&available[..pos]);
                    (pos + 1, true)
                }
                None => {
                    line.extend_from_slice(available);
                    (available.len(), false)
                }
            }
        };
        reader.consume(used);
        if done {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.len() > limit {
                return Ok(LineOutcome::TooLong);
            }
            return Ok(LineOutcome::Line(line));
        }
        if line.len() > limit {
            return Ok(LineOutcome::TooLong);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::request::{Headers, Method};
    use crate::response::Response;

    fn parse_bytes(bytes: &[u8]) -> Result<Request, ParseError> {
        read_request(&mut Cursor::new(bytes.to_vec()), None)
    }

    #[test]
    fn parses_a_get_request() {
        let request = parse_bytes(
            b"GET /hello?name=Alice HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n",
        ).unwrap();
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/hello");
        assert_eq!(request.raw_query(), "name=Alice");
        assert_eq!(request.header("host"), Some("x"));
        assert!(request.body().is_empty());
    }

    #[test]
    fn parses_a_body_of_exactly_content_length() {
        let request = parse_bytes(
            b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloEXTRA",
        ).unwrap();
        assert_eq!(request.body(), b"hello");
    }

    #[test]
    fn percent_decodes_the_path_only() {
        let request = parse_bytes(
            b"GET /a%20b?x=%20 HTTP/1.1\r\n\r\n",
        ).unwrap();
        assert_eq!(request.path(), "/a b");
        // The query string stays verbatim until someone asks for pairs.
        assert_eq!(request.raw_query(), "x=%20");
    }

    #[test]
    fn tolerates_http_10_and_other_versions() {
        assert!(parse_bytes(b"GET / HTTP/1.0\r\n\r\n").is_ok());
        assert!(parse_bytes(b"GET / HTTP/3.0\r\n\r\n").is_ok());
        match parse_bytes(b"GET / FTP/1.1\r\n\r\n") {
            Err(ParseError::MalformedRequestLine) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_blank_and_malformed_request_lines() {
        match parse_bytes(b"\r\n") {
            Err(ParseError::EmptyRequest) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        match parse_bytes(b"") {
            Err(ParseError::EmptyRequest) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        match parse_bytes(b"GET /\r\n\r\n") {
            Err(ParseError::MalformedRequestLine) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        match parse_bytes(b"GET / HTTP/1.1 extra\r\n\r\n") {
            Err(ParseError::MalformedRequestLine) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_unknown_methods() {
        match parse_bytes(b"BREW /pot HTTP/1.1\r\n\r\n") {
            Err(ParseError::UnknownMethod) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_oversize_request_lines() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"GET /");
        raw.extend(std::iter::repeat(b'a').take(9_000));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        match parse_bytes(&raw) {
            Err(ParseError::OversizeRequestLine) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_oversize_headers_but_not_many_small_ones() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"GET / HTTP/1.1\r\n");
        for i in 0..100 {
            raw.extend_from_slice(format!("X-H{}: v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        assert_eq!(parse_bytes(&raw).unwrap().headers().len(), 100);

        let mut raw = Vec::new();
        raw.extend_from_slice(b"GET / HTTP/1.1\r\n");
        let big = "v".repeat(8_000);
        for i in 0..10 {
            raw.extend_from_slice(format!("X-Big{}: {}\r\n", i, big).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        match parse_bytes(&raw) {
            Err(ParseError::OversizeHeaders) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_bad_content_length() {
        match parse_bytes(b"POST / HTTP/1.1\r\nContent-Length: five\r\n\r\n") {
            Err(ParseError::MalformedContentLength) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        match parse_bytes(b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n") {
            Err(ParseError::MalformedContentLength) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        match parse_bytes(b"POST / HTTP/1.1\r\nContent-Length: 99999999999\r\n\r\n") {
            Err(ParseError::OversizeBody) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_short_bodies() {
        match parse_bytes(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhi") {
            Err(ParseError::ShortBody) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn request_round_trips_through_the_codec() {
        let mut headers = Headers::new();
        headers.append("Host", "example.com");
        headers.append("X-Tag", "one");
        headers.append("X-Tag", "two");
        headers.append("Content-Length", "4");
        let bytes = serialize_request(Method::Post, "/items?id=7&id=8", &headers, b"data");

        let parsed = parse_bytes(&bytes).unwrap();
        assert_eq!(parsed.method(), Method::Post);
        assert_eq!(parsed.path(), "/items");
        assert_eq!(parsed.raw_query(), "id=7&id=8");
        assert_eq!(parsed.header("host"), Some("example.com"));
        let tags: Vec<&str> = parsed.headers().get_all("x-tag").collect();
        assert_eq!(tags, ["one", "two"]);
        assert_eq!(parsed.body(), b"data");
    }

    #[test]
    fn serialised_responses_carry_the_framing_headers() {
        let mut response = Response::text("hi");
        let bytes = serialize_response(&mut response);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Server: triptych\r\n"));
        assert!(text.contains("Date: "));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn serialised_content_length_tracks_the_final_body() {
        let mut response = Response::text("first");
        response.set_body(b"resized".to_vec());
        let bytes = serialize_response(&mut response);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
    }
}
