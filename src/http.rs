//! Minimal HTTP/1.1 framing shared by the server and client sides.
//!
//! Only the subset the service protocol needs: request line, CRLF separated
//! headers, `Content-Length` delimited bodies. `Transfer-Encoding` is
//! ignored on purpose.

use std::fmt;
use std::str;

use indexmap::IndexMap;

use crate::error::{Error, Result};

pub const CRLF: &[u8] = b"\r\n";
pub const HEADER_END: &[u8] = b"\r\n\r\n";
pub const VERSION: &str = "HTTP/1.1";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn parse(s: &str) -> Result<Method> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            _ => Err(Error::ProtocolMalformed),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Method::Get => fmt.write_str("GET"),
            Method::Post => fmt.write_str("POST"),
        }
    }
}

pub fn reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        507 => "Insufficient Storage",
        _ => "Unknown",
    }
}

/// Byte-wise substring search, used to spot CRLF boundaries in stream
/// buffers.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug)]
pub struct RequestLine {
    pub method: Method,
    pub path: String,
    pub query: String,
}

/// Parses `METHOD SP URI SP HTTP/1.1` without the trailing CRLF.
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine> {
    let line = str::from_utf8(line).map_err(|_| Error::ProtocolMalformed)?;

    let mut parts = line.split(' ');
    let method = parts.next().ok_or(Error::ProtocolMalformed)?;
    let uri = parts.next().ok_or(Error::ProtocolMalformed)?;
    let version = parts.next().ok_or(Error::ProtocolMalformed)?;

    if parts.next().is_some() || !version.starts_with("HTTP/1.") {
        return Err(Error::ProtocolMalformed);
    }

    let method = Method::parse(method)?;
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, query),
        None => (uri, ""),
    };

    Ok(RequestLine {
        method,
        path: path.to_string(),
        query: query.to_string(),
    })
}

/// Parses one `Name: value` header line. Names are folded to lowercase so
/// lookups are case-insensitive.
pub fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let line = str::from_utf8(line).map_err(|_| Error::ProtocolMalformed)?;
    let (name, value) = line.split_once(':').ok_or(Error::ProtocolMalformed)?;

    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(Error::ProtocolMalformed);
    }

    Ok((name, value.trim().to_string()))
}

fn decode_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let decoded = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match decoded {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Parses a query string into a list-valued argument map.
pub fn parse_query(query: &str) -> IndexMap<String, Vec<String>> {
    let mut args: IndexMap<String, Vec<String>> = IndexMap::new();

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        };
        args.entry(key).or_default().push(value);
    }

    args
}

/// Everything one HTTP exchange accumulates on its way through the
/// connection state machine.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub uri: String,
    pub args: IndexMap<String, Vec<String>>,
    pub headers: IndexMap<String, String>,
    pub content_length: usize,
    pub received: usize,
    pub response_status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_content: Vec<u8>,
}

impl RequestContext {
    pub fn new() -> RequestContext {
        RequestContext {
            method: Method::Get,
            uri: String::new(),
            args: IndexMap::new(),
            headers: IndexMap::new(),
            content_length: 0,
            received: 0,
            response_status: 200,
            response_headers: Vec::new(),
            response_content: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(|v| v.first()).map(|s| s.as_str())
    }

    pub fn set_response_header<V: fmt::Display>(&mut self, name: &str, value: V) {
        self.response_headers.push((name.to_string(), value.to_string()));
    }

    pub fn has_response_header(&self, name: &str) -> bool {
        self.response_headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Whether either side asked for the connection to go away.
    pub fn wants_close(&self) -> bool {
        let request_close = self
            .header("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        let response_close = self.response_headers.iter().any(|(n, v)| {
            n.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close")
        });

        request_close || response_close
    }
}

impl Default for RequestContext {
    fn default() -> RequestContext {
        RequestContext::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line() {
        let line = parse_request_line(b"GET /get_block?block=3 HTTP/1.1").unwrap();
        assert_eq!(line.method, Method::Get);
        assert_eq!(line.path, "/get_block");
        assert_eq!(line.query, "block=3");
    }

    #[test]
    fn request_line_rejects_noise() {
        assert!(parse_request_line(b"GET /x").is_err());
        assert!(parse_request_line(b"BREW /x HTTP/1.1").is_err());
        assert!(parse_request_line(b"GET /x SMTP/1.0").is_err());
        assert!(parse_request_line(b"GET /x HTTP/1.1 extra").is_err());
    }

    #[test]
    fn header_names_fold_case() {
        let (name, value) = parse_header_line(b"Content-Length: 42").unwrap();
        assert_eq!(name, "content-length");
        assert_eq!(value, "42");

        let mut req = RequestContext::new();
        req.headers.insert(name, value);
        assert_eq!(req.header("CONTENT-length"), Some("42"));
    }

    #[test]
    fn query_supports_lists_and_escapes() {
        let args = parse_query("a=1&a=2&name=hello%20world&flag");
        assert_eq!(args["a"], vec!["1", "2"]);
        assert_eq!(args["name"], vec!["hello world"]);
        assert_eq!(args["flag"], vec![""]);
    }

    #[test]
    fn connection_close_detection() {
        let mut req = RequestContext::new();
        assert!(!req.wants_close());
        req.headers.insert("connection".into(), "close".into());
        assert!(req.wants_close());

        let mut resp = RequestContext::new();
        resp.set_response_header("Connection", "close");
        assert!(resp.wants_close());
    }

    #[test]
    fn finds_boundaries() {
        assert_eq!(find(b"abc\r\ndef", CRLF), Some(3));
        assert_eq!(find(b"abcdef", CRLF), None);
        assert_eq!(find(b"a\r\n\r\nb", HEADER_END), Some(1));
    }
}
