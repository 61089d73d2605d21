use std::{collections::BTreeMap, net::IpAddr};

use http::{Method, StatusCode, Version};
use n0_error::anyerr;

use crate::error::ProxyError;

/// Largest body preallocation honored from a Content-Length header.
const MAX_BODY_PREALLOC: u64 = 1 << 20;

/// Scheme-stripped request target used as the page cache key.
///
/// Equality and hashing cover `(host, port, path)` with a case-insensitive
/// host, so two spellings of the same origin share a cache slot.
#[derive(Debug, Clone, derive_more::Display)]
#[display("{host}:{port}{path}")]
pub struct ProxyUri {
    /// Scheme of the original request target, when one was present.
    pub scheme: Option<String>,
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
    /// Origin-form path, always starting with `/`.
    pub path: String,
    /// Peer address of the last successful connect for this target.
    pub resolved_ip: Option<IpAddr>,
}

impl Default for ProxyUri {
    fn default() -> Self {
        Self {
            scheme: None,
            host: String::new(),
            port: 80,
            path: "/".to_string(),
            resolved_ip: None,
        }
    }
}

impl PartialEq for ProxyUri {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.path == other.path
            && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for ProxyUri {}

impl std::hash::Hash for ProxyUri {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
        self.path.hash(state);
    }
}

impl ProxyUri {
    /// Returns `host:port`, the address cache key and `Host` header value.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns `host:port` followed by the path.
    pub fn absolute(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.path)
    }

    /// True when the target names the same upstream socket as `other`.
    pub fn same_origin(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

/// Parses an absolute or relative request target into a [`ProxyUri`].
///
/// Relative targets are resolved against `base`: the base path is truncated
/// at its last `/` and the link appended, and host, port and resolved IP are
/// inherited. Fragments are stripped. An absolute target without a port
/// defaults to 80, and an empty path becomes `/`.
pub fn parse_uri(target: &str, base: Option<&ProxyUri>) -> ProxyUri {
    let mut uri = ProxyUri::default();

    // Strip the fragment before splitting anything else.
    let target = match target.split_once('#') {
        Some((before, _)) => before,
        None => target,
    };
    if target.is_empty() {
        if let Some(base) = base {
            uri.host = base.host.clone();
            uri.port = base.port;
            uri.resolved_ip = base.resolved_ip;
        }
        return uri;
    }

    if let Some((scheme, rest)) = target.split_once("://") {
        if !scheme.is_empty() {
            uri.scheme = Some(scheme.to_ascii_lowercase());
        }
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        uri.path = path.to_string();
        match authority.rsplit_once(':') {
            Some((host, port)) => {
                uri.host = host.to_string();
                uri.port = port.parse().unwrap_or(80);
            }
            None => {
                uri.host = authority.to_string();
                uri.port = 80;
            }
        }
    } else {
        // Origin-form or document-relative target.
        if target.starts_with('/') {
            uri.path = target.to_string();
        } else {
            let dir = base
                .and_then(|base| base.path.rfind('/').map(|idx| &base.path[..idx + 1]))
                .unwrap_or("/");
            uri.path = format!("{dir}{target}");
        }
        if let Some(base) = base {
            uri.host = base.host.clone();
            uri.port = base.port;
            uri.resolved_ip = base.resolved_ip;
        }
    }
    uri
}

/// Normalizes a header field name to Title-Case.
///
/// The first character of every `-`-separated segment is uppercased and the
/// rest lowercased, so `content-TYPE` becomes `Content-Type`. Idempotent.
pub fn normalize_field_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.extend(c.to_lowercase());
        }
        if c == '-' {
            upper_next = true;
        }
    }
    out
}

/// Header map keyed by normalized Title-Case field names.
///
/// Names are normalized on insert and on query, and serialization walks the
/// map in key order, so a message round-trips deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a field, replacing any previous value for the same name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
        self.0.insert(normalize_field_name(name), value.into())
    }

    /// Inserts a field only when no value is present yet.
    pub fn insert_default(&mut self, name: &str, value: impl Into<String>) {
        self.0.entry(normalize_field_name(name)).or_insert(value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&normalize_field_name(name)).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&normalize_field_name(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&normalize_field_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn from_httparse(headers: &[httparse::Header<'_>]) -> Self {
        let mut map = Self::new();
        for header in headers {
            let value = String::from_utf8_lossy(header.value);
            map.insert(header.name, value.trim().to_string());
        }
        map
    }
}

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn version_from_httparse(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

/// A parsed client request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method from the request line. Anything but GET and CONNECT is
    /// answered with `400 Bad Request` by the worker.
    pub method: Method,
    pub version: Version,
    /// Parsed request target, the cache and upstream-connect key.
    pub uri: ProxyUri,
    pub headers: Headers,
}

impl HttpRequest {
    /// Parses a complete request header section.
    ///
    /// Injects the default `Connection` and `Proxy-Connection` headers,
    /// drops `Upgrade-Insecure-Requests`, and reconciles the URI host with
    /// the `Host` header. A request with no host in either place is
    /// rejected.
    pub fn parse(buf: &[u8]) -> Result<Self, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::parse(anyerr!("truncated request header section")));
            }
            Err(err) => return Err(ProxyError::parse(anyerr!("invalid request: {err}"))),
        }

        let method_str = req.method.unwrap_or("");
        let method = Method::from_bytes(method_str.as_bytes())
            .map_err(|err| ProxyError::parse(anyerr!("invalid method: {err}")))?;
        let version = version_from_httparse(req.version);
        let mut headers = Headers::from_httparse(req.headers);

        headers.insert_default(
            "Connection",
            if version == Version::HTTP_11 { "Keep-Alive" } else { "Close" },
        );
        headers.insert_default("Proxy-Connection", "Keep-Alive");
        headers.remove("Upgrade-Insecure-Requests");

        // CONNECT targets are authority-form; give them a scheme so the
        // common URI parser applies.
        let target = req.path.unwrap_or("/");
        let target = if method == Method::CONNECT {
            format!("http://{target}")
        } else {
            target.to_string()
        };
        let mut uri = parse_uri(&target, None);

        if uri.host.is_empty() {
            let Some(host_header) = headers.get("Host").filter(|h| !h.is_empty()) else {
                return Err(ProxyError::parse(anyerr!(
                    "request has no host in target or Host header"
                )));
            };
            match host_header.rsplit_once(':') {
                Some((host, port)) => {
                    uri.port = port.parse().unwrap_or(80);
                    uri.host = host.to_string();
                }
                None => uri.host = host_header.to_string(),
            }
        } else {
            let authority = uri.authority();
            headers.insert("Host", authority);
        }

        Ok(Self {
            method,
            version,
            uri,
            headers,
        })
    }

    /// Serializes the request in origin-form for the upstream hop.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            self.method,
            self.uri.path,
            version_str(self.version)
        );
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Connection policy requested by the client, mirrored into
    /// proxy-generated responses.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("Connection") {
            Some(value) => value.eq_ignore_ascii_case("keep-alive"),
            None => self.version == Version::HTTP_11,
        }
    }
}

/// A parsed origin response, de-chunked on re-serialization.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as received, or the canonical phrase when absent.
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Declared or accumulated body length. Never emitted alongside a
    /// `Transfer-Encoding: chunked` header.
    pub content_length: u64,
    /// True while the body still uses chunked framing on the wire.
    pub chunked: bool,
    has_length: bool,
    /// `Content-Type` with any `;parameter` suffix removed.
    pub content_type: String,
    /// Request target this response answers.
    pub uri: ProxyUri,
}

impl HttpResponse {
    /// Parses a complete response header section.
    ///
    /// `Content-Length` is moved out of the header map into the
    /// `content_length` field; `Transfer-Encoding: chunked` sets the
    /// `chunked` flag. Default `Connection`/`Proxy-Connection` headers are
    /// injected and `Host` is overwritten to the origin authority.
    pub fn parse(buf: &[u8], uri: ProxyUri) -> Result<Self, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::parse(anyerr!("truncated response header section")));
            }
            Err(err) => return Err(ProxyError::parse(anyerr!("invalid response: {err}"))),
        }

        let code = res.code.unwrap_or(0);
        let status = StatusCode::from_u16(code)
            .map_err(|err| ProxyError::parse(anyerr!("invalid status code {code}: {err}")))?;
        let version = version_from_httparse(res.version);
        let reason = match res.reason {
            Some(reason) if !reason.is_empty() => reason.to_string(),
            _ => status.canonical_reason().unwrap_or("").to_string(),
        };
        let mut headers = Headers::from_httparse(res.headers);

        headers.insert_default("Proxy-Connection", "keep-alive");
        headers.insert_default(
            "Connection",
            if version == Version::HTTP_10 { "close" } else { "keep-alive" },
        );
        headers.insert("Host", uri.authority());

        let mut content_length = 0u64;
        let mut has_length = false;
        let mut chunked = false;
        if let Some(value) = headers.remove("Content-Length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|err| ProxyError::parse(anyerr!("invalid Content-Length: {err}")))?;
            has_length = true;
        } else if let Some(value) = headers.get("Transfer-Encoding")
            && value.eq_ignore_ascii_case("chunked")
        {
            chunked = true;
        } else {
            tracing::debug!(%uri, "response has no content length or chunked encoding");
        }

        let content_type = headers
            .get("Content-Type")
            .map(|value| match value.split_once(';') {
                Some((media_type, _)) => media_type.trim().to_string(),
                None => value.to_string(),
            })
            .unwrap_or_default();

        Ok(Self {
            version,
            status,
            reason,
            headers,
            body: Vec::with_capacity(content_length.min(MAX_BODY_PREALLOC) as usize),
            content_length,
            chunked,
            has_length,
            content_type,
            uri,
        })
    }

    /// Builds one of the proxy-generated responses (400, 403, 404, 500,
    /// 504, 200) with a minimal text body. The `Connection` header mirrors
    /// the client's keep-alive policy.
    pub fn synthesize(status: StatusCode, request: &HttpRequest) -> Self {
        Self::synthesize_with(
            status,
            request.version,
            request.wants_keep_alive(),
            request.uri.clone(),
        )
    }

    /// Like [`synthesize`](Self::synthesize), for replies to requests that
    /// never parsed. Closes the connection.
    pub fn synthesize_bare(status: StatusCode) -> Self {
        Self::synthesize_with(status, Version::HTTP_11, false, ProxyUri::default())
    }

    fn synthesize_with(status: StatusCode, version: Version, keep_alive: bool, uri: ProxyUri) -> Self {
        let reason = status.canonical_reason().unwrap_or("").to_string();
        let body = format!("{} {}\n", status.as_u16(), reason).into_bytes();
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("Connection", if keep_alive { "keep-alive" } else { "close" });
        headers.insert("Proxy-Connection", "keep-alive");
        Self {
            version,
            status,
            reason,
            headers,
            content_length: body.len() as u64,
            body,
            chunked: false,
            has_length: true,
            content_type: "text/plain".to_string(),
            uri,
        }
    }

    /// Appends decoded body bytes.
    ///
    /// Chunked bodies grow `content_length` as they accumulate; sized bodies
    /// never exceed the declared length.
    pub(crate) fn append_body(&mut self, data: &[u8]) {
        if self.chunked {
            self.body.extend_from_slice(data);
            self.content_length += data.len() as u64;
            self.has_length = true;
        } else {
            let remaining = (self.content_length as usize).saturating_sub(self.body.len());
            let take = remaining.min(data.len());
            self.body.extend_from_slice(&data[..take]);
        }
    }

    /// Serializes the response with a single `Content-Length` and without
    /// any `Transfer-Encoding: chunked` header, i.e. de-chunked.
    pub fn dump(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            version_str(self.version),
            self.status.as_u16(),
            self.reason
        );
        for (name, value) in self.headers.iter() {
            if name == "Transfer-Encoding" && value.eq_ignore_ascii_case("chunked") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if self.has_length {
            out.push_str(&format!("Content-Length: {}\r\n", self.content_length));
        }
        out.push_str("\r\n");
        let mut out = out.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        assert_eq!(normalize_field_name("content-TYPE"), "Content-Type");
        assert_eq!(normalize_field_name("Content-Type"), "Content-Type");
        assert_eq!(
            normalize_field_name(&normalize_field_name("x-FORWARDED-for")),
            "X-Forwarded-For"
        );
        assert_eq!(normalize_field_name("host"), "Host");
    }

    #[test]
    fn headers_normalize_on_query() {
        let mut headers = Headers::new();
        headers.insert("conTENT-length", "12");
        assert_eq!(headers.get("Content-Length"), Some("12"));
        assert!(headers.contains("content-length"));
        assert_eq!(headers.remove("CONTENT-LENGTH"), Some("12".to_string()));
        assert!(headers.is_empty());
    }

    #[test]
    fn parse_absolute_uri() {
        let uri = parse_uri("http://example.test:8080/a/b", None);
        assert_eq!(uri.scheme.as_deref(), Some("http"));
        assert_eq!(uri.host, "example.test");
        assert_eq!(uri.port, 8080);
        assert_eq!(uri.path, "/a/b");
    }

    #[test]
    fn parse_uri_defaults() {
        let uri = parse_uri("http://example.test/a", None);
        assert_eq!(uri.port, 80);
        assert_eq!(uri.path, "/a");

        let uri = parse_uri("http://example.test", None);
        assert_eq!(uri.path, "/");
    }

    #[test]
    fn parse_relative_uri_against_base() {
        let base = parse_uri("http://h:80/a/index.html", None);
        let uri = parse_uri("b", Some(&base));
        assert_eq!(uri.host, "h");
        assert_eq!(uri.port, 80);
        assert_eq!(uri.path, "/a/b");

        let uri = parse_uri("/c", Some(&base));
        assert_eq!(uri.path, "/c");
        assert_eq!(uri.host, "h");
    }

    #[test]
    fn parse_uri_strips_fragment() {
        let uri = parse_uri("http://h/a#section", None);
        assert_eq!(uri.path, "/a");
    }

    #[test]
    fn uri_equality_ignores_host_case() {
        let a = parse_uri("http://Example.Test/x", None);
        let b = parse_uri("http://example.test/x", None);
        assert_eq!(a, b);
        let c = parse_uri("http://example.test:81/x", None);
        assert_ne!(a, c);
    }

    #[test]
    fn request_parse_injects_defaults() {
        let req =
            HttpRequest::parse(b"GET http://x.test/ HTTP/1.1\r\nHost: ignored\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::GET);
        assert_eq!(req.uri.host, "x.test");
        assert_eq!(req.headers.get("Host"), Some("x.test:80"));
        assert_eq!(req.headers.get("Connection"), Some("Keep-Alive"));
        assert_eq!(req.headers.get("Proxy-Connection"), Some("Keep-Alive"));
    }

    #[test]
    fn request_parse_host_header_fallback() {
        let req = HttpRequest::parse(b"GET /p HTTP/1.1\r\nHost: h.test:8080\r\n\r\n").unwrap();
        assert_eq!(req.uri.host, "h.test");
        assert_eq!(req.uri.port, 8080);
        assert_eq!(req.uri.path, "/p");
    }

    #[test]
    fn request_parse_rejects_hostless() {
        let err = HttpRequest::parse(b"GET /p HTTP/1.0\r\n\r\n").unwrap_err();
        assert_eq!(err.response_status(), Some(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn request_parse_connect_target() {
        let req = HttpRequest::parse(b"CONNECT x.test:443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.method, Method::CONNECT);
        assert_eq!(req.uri.host, "x.test");
        assert_eq!(req.uri.port, 443);
    }

    #[test]
    fn request_parse_drops_upgrade_insecure() {
        let req = HttpRequest::parse(
            b"GET http://x.test/ HTTP/1.1\r\nUpgrade-Insecure-Requests: 1\r\n\r\n",
        )
        .unwrap();
        assert!(!req.headers.contains("Upgrade-Insecure-Requests"));
    }

    #[test]
    fn request_dump_is_origin_form() {
        let req = HttpRequest::parse(b"GET http://x.test/a/b HTTP/1.1\r\n\r\n").unwrap();
        let dump = String::from_utf8(req.dump()).unwrap();
        assert!(dump.starts_with("GET /a/b HTTP/1.1\r\n"));
        assert!(dump.contains("Host: x.test:80\r\n"));
        assert!(dump.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_parse_extracts_content_length() {
        let uri = parse_uri("http://x.test/", None);
        let res =
            HttpResponse::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n", uri).unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.content_length, 5);
        assert!(!res.headers.contains("Content-Length"));
        assert_eq!(res.headers.get("Host"), Some("x.test:80"));
    }

    #[test]
    fn response_parse_detects_chunked() {
        let uri = parse_uri("http://x.test/", None);
        let res = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            uri,
        )
        .unwrap();
        assert!(res.chunked);
        assert_eq!(res.content_length, 0);
    }

    #[test]
    fn response_parse_strips_content_type_params() {
        let uri = parse_uri("http://x.test/", None);
        let res = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: 0\r\n\r\n",
            uri,
        )
        .unwrap();
        assert_eq!(res.content_type, "text/html");
    }

    #[test]
    fn dump_emits_exactly_one_content_length_and_no_chunked() {
        let uri = parse_uri("http://x.test/", None);
        let mut res = HttpResponse::parse(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            uri,
        )
        .unwrap();
        res.append_body(b"hello world");
        let dump = String::from_utf8(res.dump()).unwrap();
        assert_eq!(dump.matches("Content-Length:").count(), 1);
        assert!(dump.contains("Content-Length: 11\r\n"));
        assert!(!dump.contains("Transfer-Encoding"));
        assert!(dump.ends_with("hello world"));
    }

    #[test]
    fn sized_body_never_exceeds_declared_length() {
        let uri = parse_uri("http://x.test/", None);
        let mut res =
            HttpResponse::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n", uri).unwrap();
        res.append_body(b"abcdef");
        assert_eq!(res.body, b"abcd");
        assert_eq!(res.content_length, 4);
    }

    #[test]
    fn synthesized_response_mirrors_connection_policy() {
        let req = HttpRequest::parse(b"GET http://x.test/ HTTP/1.0\r\n\r\n").unwrap();
        let res = HttpResponse::synthesize(StatusCode::FORBIDDEN, &req);
        assert_eq!(res.headers.get("Connection"), Some("close"));
        let dump = String::from_utf8(res.dump()).unwrap();
        assert!(dump.starts_with("HTTP/1.0 403 Forbidden\r\n"));
        assert!(dump.contains("Content-Length: 14\r\n"));
        assert!(dump.ends_with("403 Forbidden\n"));
    }
}
