//! Incremental HTTP/1.1 request parsing via `httparse`. No pack precedent for
//! a non-blocking HTTP parser (the corpus is all async/tokio-based); this is
//! the natural ecosystem crate for a reactor-driven, poll-based server that
//! needs to parse a request across multiple reads without blocking.

use std::collections::HashMap;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl Request {
    pub fn query_get(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Tries to parse one complete request out of `buf`. Returns `None` if more
/// bytes are needed. `buf` should accumulate across reads until this returns
/// `Some` or errors.
pub fn try_parse(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed.parse(buf).map_err(|_| Error::Protocol("malformed HTTP request"))?;

    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let method = parsed.method.ok_or(Error::Protocol("missing HTTP method"))?.to_string();
    let raw_path = parsed.path.ok_or(Error::Protocol("missing HTTP path"))?;
    let (path, query) = split_path_and_query(raw_path);

    let mut header_map = HashMap::new();
    for h in parsed.headers.iter() {
        if h.name.is_empty() {
            continue;
        }
        let value = String::from_utf8_lossy(h.value).into_owned();
        header_map.insert(h.name.to_ascii_lowercase(), value);
    }

    Ok(Some((Request { method, path, query, headers: header_map }, consumed)))
}

fn split_path_and_query(raw: &str) -> (String, HashMap<String, String>) {
    let mut query = HashMap::new();
    let (path, query_str) = match raw.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (raw, None),
    };
    if let Some(q) = query_str {
        for pair in q.split('&') {
            if pair.is_empty() {
                continue;
            }
            match pair.split_once('=') {
                Some((k, v)) => {
                    query.insert(url_decode(k), url_decode(v));
                }
                None => {
                    query.insert(url_decode(pair), String::new());
                }
            }
        }
    }
    (url_decode(path), query)
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(v) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(v);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `true` if `path` (already URL-decoded) attempts to escape its base
/// directory via `..` components.
pub fn is_path_traversal(path: &str) -> bool {
    std::path::Path::new(path).components().any(|c| matches!(c, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let raw = b"GET /_0?streaming=1&type=jpeg HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, consumed) = try_parse(raw).unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/_0");
        assert_eq!(req.query_get("streaming"), Some("1"));
        assert_eq!(req.query_get("type"), Some("jpeg"));
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn partial_request_returns_none() {
        let raw = b"GET /_0 HTTP/1.1\r\nHost: loc";
        assert!(try_parse(raw).unwrap().is_none());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(is_path_traversal("../secret"));
        assert!(is_path_traversal("a/../../b"));
        assert!(!is_path_traversal("a/b/c"));
    }

    #[test]
    fn decodes_percent_and_plus_in_query() {
        let raw = b"GET /send?msg=hello%20world+again HTTP/1.1\r\n\r\n";
        let (req, _) = try_parse(raw).unwrap().unwrap();
        assert_eq!(req.query_get("msg"), Some("hello world again"));
    }
}
