// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::slice;

use percent_encoding::percent_decode_str;

/// An HTTP request method.
///
/// Anything outside this set is rejected at the wire level before a
/// `Request` is ever built.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
}

impl Method {
    /// Parses a method token as it appears on the request line. Returns
    /// `None` for anything that isn't one of the nine recognised verbs.
    pub fn from_bytes(token: &[u8]) -> Option<Method> {
        match token {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"PATCH" => Some(Method::Patch),
            b"HEAD" => Some(Method::Head),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    /// The canonical upper-case token.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// An ordered, case-insensitive multimap of header names to values.
///
/// Insertion order is preserved, and repeated names are kept as separate
/// entries. Lookups compare names ASCII-case-insensitively; the original
/// casing of stored names is not guaranteed to survive serialisation.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers { entries: Vec::new() }
    }

    /// Adds a header at the end, keeping any existing entries with the
    /// same name.
    pub fn append<N, V>(&mut self, name: N, value: V)
        where N: Into<String>, V: Into<String>
    {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every entry named `name` with a single entry holding
    /// `value`. Appends if the name wasn't present.
    pub fn set<N, V>(&mut self, name: N, value: V)
        where N: Into<String>, V: Into<String>
    {
        let name = name.into();
        self.entries.retain(|&(ref n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// First value stored under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| &v[..])
    }

    /// Every value stored under `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| &v[..])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes every entry named `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|&(ref n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in insertion order.
    pub fn iter(&self) -> slice::Iter<(String, String)> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a (String, String);
    type IntoIter = slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// A parsed HTTP request.
///
/// Immutable once built by the wire codec, except for the two maps the
/// framework itself manages: path parameters are filled in by the router
/// while it resolves the route, and attributes are free scratch space for
/// handlers. Neither is ever serialised.
pub struct Request {
    method: Method,
    path: String,
    raw_query: String,
    headers: Headers,
    body: Vec<u8>,
    path_params: HashMap<String, String>,
    attributes: HashMap<String, Box<dyn Any + Send>>,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Assembles a request from parts already validated by the codec.
    pub fn new(method: Method, path: String, raw_query: String, headers: Headers,
               body: Vec<u8>, remote_addr: Option<SocketAddr>) -> Request
    {
        Request {
            method,
            path,
            raw_query,
            headers,
            body,
            path_params: HashMap::new(),
            attributes: HashMap::new(),
            remote_addr,
        }
    }

    /// Builds a fake request for tests and examples, bypassing the codec.
    ///
    /// The `url` is split on the first `?` the same way the codec splits a
    /// request-target, but no percent-decoding is applied.
    ///
    /// # Example
    ///
    /// ```
    /// use triptych::{Method, Request};
    /// let request = Request::fake(Method::Get, "/hello?name=Alice");
    /// assert_eq!(request.path(), "/hello");
    /// assert_eq!(request.query_value("name").unwrap(), "Alice");
    /// ```
    pub fn fake(method: Method, url: &str) -> Request {
        Request::fake_with_body(method, url, Vec::new())
    }

    /// Same as [`fake`](Request::fake) but with a body. A matching
    /// `Content-Length` header is set.
    pub fn fake_with_body(method: Method, url: &str, body: Vec<u8>) -> Request {
        let (path, query) = match url.find('?') {
            Some(pos) => (&url[..pos], &url[pos + 1..]),
            None => (url, ""),
        };
        let mut headers = Headers::new();
        if !body.is_empty() {
            headers.append("Content-Length", body.len().to_string());
        }
        Request::new(method, path.to_owned(), query.to_owned(), headers, body, None)
    }

    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    /// The percent-decoded path component, always starting with `/`.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, without the leading `?`. Empty if the
    /// request-target had none.
    #[inline]
    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    /// First value of the query parameter named `name`, percent-decoded.
    pub fn query_value(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|&(ref n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// All query pairs in the order they appear, repeated names preserved.
    /// Parsing happens on demand; the raw string is kept verbatim.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.raw_query
            .split('&')
            .filter(|s| !s.is_empty())
            .map(|pair| {
                let (name, value) = match pair.find('=') {
                    Some(pos) => (&pair[..pos], &pair[pos + 1..]),
                    None => (pair, ""),
                };
                (decode_query_component(name), decode_query_component(value))
            })
            .collect()
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of the header named `name`.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The value captured for the route parameter `name`, if the matched
    /// route's pattern had a `{name}` segment.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|v| &v[..])
    }

    /// All captured route parameters.
    pub fn params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    // Called by the router once, after a pattern matched. The map is
    // frozen from the handler's point of view.
    pub(crate) fn set_path_params(&mut self, params: HashMap<String, String>) {
        self.path_params = params;
    }

    /// Stores an arbitrary value under `name`, for the duration of this
    /// request. Attributes never reach the wire.
    pub fn set_attribute<V>(&mut self, name: &str, value: V)
        where V: Any + Send
    {
        self.attributes.insert(name.to_owned(), Box::new(value));
    }

    /// Retrieves an attribute previously stored with
    /// [`set_attribute`](Request::set_attribute), if the type matches.
    pub fn attribute<V>(&self, name: &str) -> Option<&V>
        where V: Any + Send
    {
        self.attributes.get(name).and_then(|v| v.downcast_ref())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("raw_query", &self.raw_query)
            .field("headers", &self.headers.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

fn decode_query_component(raw: &str) -> String {
    // '+' means space in query strings, unlike in paths.
    let replaced = raw.replace('+', " ");
    percent_decode_str(&replaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::{Headers, Method, Request};

    #[test]
    fn method_tokens_round_trip() {
        for token in &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD",
                       "OPTIONS", "TRACE", "CONNECT"]
        {
            let method = Method::from_bytes(token.as_bytes()).unwrap();
            assert_eq!(method.as_str(), *token);
        }
        assert!(Method::from_bytes(b"BREW").is_none());
        assert!(Method::from_bytes(b"get").is_none());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn headers_keep_repeats_in_order() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html");
        headers.append("Host", "example.com");
        headers.append("Accept", "application/json");
        let all: Vec<&str> = headers.get_all("accept").collect();
        assert_eq!(all, ["text/html", "application/json"]);
        assert_eq!(headers.get("accept"), Some("text/html"));
    }

    #[test]
    fn headers_set_replaces_all() {
        let mut headers = Headers::new();
        headers.append("X-Tag", "a");
        headers.append("x-tag", "b");
        headers.set("X-Tag", "c");
        let all: Vec<&str> = headers.get_all("x-tag").collect();
        assert_eq!(all, ["c"]);
    }

    #[test]
    fn query_pairs_preserve_repeats() {
        let request = Request::fake(Method::Get, "/search?q=one&q=two&page=3");
        assert_eq!(request.query_value("q"), Some("one".to_owned()));
        let pairs = request.query_pairs();
        assert_eq!(pairs, vec![
            ("q".to_owned(), "one".to_owned()),
            ("q".to_owned(), "two".to_owned()),
            ("page".to_owned(), "3".to_owned()),
        ]);
    }

    #[test]
    fn query_decoding() {
        let request = Request::fake(Method::Get, "/q?name=Alice+B%C3%A9&x=%2F");
        assert_eq!(request.query_value("name"), Some("Alice Bé".to_owned()));
        assert_eq!(request.query_value("x"), Some("/".to_owned()));
    }

    #[test]
    fn attributes_are_typed() {
        let mut request = Request::fake(Method::Get, "/");
        request.set_attribute("user-id", 7u64);
        assert_eq!(request.attribute::<u64>("user-id"), Some(&7));
        assert!(request.attribute::<String>("user-id").is_none());
        assert!(request.attribute::<u64>("missing").is_none());
    }
}
