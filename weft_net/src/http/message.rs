//! HTTP request/response value types, grounded in
//! `original_source/ljrServer/http/http.{h,cpp}`.
//!
//! The original's method/status tables are X-macro-generated C++
//! enums; Rust's `enum` + `match` covers the same ground without the
//! macro indirection. Headers use a case-insensitive map, matching
//! `CaseInsensitiveLess`.

use std::collections::BTreeMap;
use std::fmt;

/// Case-insensitive (by comparison key) header/param/cookie map,
/// grounded in `CaseInsensitiveLess`. Keys are stored lower-cased so a
/// `BTreeMap` gives both ordering and case-insensitive lookup for free.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    inner: BTreeMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).map(str::to_string).unwrap_or_else(|| default.to_string())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.inner.remove(&key.to_ascii_lowercase());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(&key.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

macro_rules! http_method_enum {
    ($($variant:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum HttpMethod {
            $($variant,)+
            Invalid,
        }

        impl HttpMethod {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(HttpMethod::$variant => stringify!($variant),)+
                    HttpMethod::Invalid => "INVALID",
                }
            }

            pub fn from_str(s: &str) -> HttpMethod {
                match s {
                    $(stringify!($variant) => HttpMethod::$variant,)+
                    _ => HttpMethod::Invalid,
                }
            }
        }
    };
}

http_method_enum!(
    DELETE, GET, HEAD, POST, PUT, CONNECT, OPTIONS, TRACE, COPY, LOCK, MKCOL, MOVE, PROPFIND,
    PROPPATCH, SEARCH, UNLOCK, PATCH,
);

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (deliberately small) subset of `HTTP_STATUS_MAP`: the codes this
/// framework itself ever sets. A servlet that wants a less common code
/// can use [`HttpStatus::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpStatus {
    Ok,
    Created,
    NoContent,
    MovedPermanently,
    Found,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    RequestTimeout,
    PayloadTooLarge,
    UriTooLong,
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    Other(u16),
}

impl HttpStatus {
    pub fn code(&self) -> u16 {
        match self {
            HttpStatus::Ok => 200,
            HttpStatus::Created => 201,
            HttpStatus::NoContent => 204,
            HttpStatus::MovedPermanently => 301,
            HttpStatus::Found => 302,
            HttpStatus::NotModified => 304,
            HttpStatus::BadRequest => 400,
            HttpStatus::Unauthorized => 401,
            HttpStatus::Forbidden => 403,
            HttpStatus::NotFound => 404,
            HttpStatus::MethodNotAllowed => 405,
            HttpStatus::RequestTimeout => 408,
            HttpStatus::PayloadTooLarge => 413,
            HttpStatus::UriTooLong => 414,
            HttpStatus::InternalServerError => 500,
            HttpStatus::NotImplemented => 501,
            HttpStatus::BadGateway => 502,
            HttpStatus::ServiceUnavailable => 503,
            HttpStatus::Other(c) => *c,
        }
    }

    /// Maps a wire status code back to a named variant, falling back to
    /// [`HttpStatus::Other`] for anything this framework never sets
    /// itself but a peer response may still carry.
    pub fn from_code(code: u16) -> HttpStatus {
        match code {
            200 => HttpStatus::Ok,
            201 => HttpStatus::Created,
            204 => HttpStatus::NoContent,
            301 => HttpStatus::MovedPermanently,
            302 => HttpStatus::Found,
            304 => HttpStatus::NotModified,
            400 => HttpStatus::BadRequest,
            401 => HttpStatus::Unauthorized,
            403 => HttpStatus::Forbidden,
            404 => HttpStatus::NotFound,
            405 => HttpStatus::MethodNotAllowed,
            408 => HttpStatus::RequestTimeout,
            413 => HttpStatus::PayloadTooLarge,
            414 => HttpStatus::UriTooLong,
            500 => HttpStatus::InternalServerError,
            501 => HttpStatus::NotImplemented,
            502 => HttpStatus::BadGateway,
            503 => HttpStatus::ServiceUnavailable,
            other => HttpStatus::Other(other),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            HttpStatus::Ok => "OK",
            HttpStatus::Created => "Created",
            HttpStatus::NoContent => "No Content",
            HttpStatus::MovedPermanently => "Moved Permanently",
            HttpStatus::Found => "Found",
            HttpStatus::NotModified => "Not Modified",
            HttpStatus::BadRequest => "Bad Request",
            HttpStatus::Unauthorized => "Unauthorized",
            HttpStatus::Forbidden => "Forbidden",
            HttpStatus::NotFound => "Not Found",
            HttpStatus::MethodNotAllowed => "Method Not Allowed",
            HttpStatus::RequestTimeout => "Request Timeout",
            HttpStatus::PayloadTooLarge => "Payload Too Large",
            HttpStatus::UriTooLong => "URI Too Long",
            HttpStatus::InternalServerError => "Internal Server Error",
            HttpStatus::NotImplemented => "Not Implemented",
            HttpStatus::BadGateway => "Bad Gateway",
            HttpStatus::ServiceUnavailable => "Service Unavailable",
            HttpStatus::Other(_) => "",
        }
    }
}

/// An inbound HTTP request, assembled by [`super::parser`] from bytes
/// read off the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// 0x10 for HTTP/1.0, 0x11 for HTTP/1.1, matching the original's
    /// packed-nibble version byte.
    pub version: u8,
    pub close: bool,
    pub path: String,
    pub query: String,
    pub fragment: String,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
    pub params: HeaderMap,
    pub cookies: HeaderMap,
}

impl Default for HttpRequest {
    fn default() -> Self {
        HttpRequest {
            method: HttpMethod::GET,
            version: 0x11,
            close: true,
            path: "/".to_string(),
            query: String::new(),
            fragment: String::new(),
            body: Vec::new(),
            headers: HeaderMap::new(),
            params: HeaderMap::new(),
            cookies: HeaderMap::new(),
        }
    }
}

impl HttpRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, key: &str, default: &str) -> String {
        self.headers.get_or(key, default)
    }

    pub fn param(&self, key: &str, default: &str) -> String {
        self.params.get_or(key, default)
    }

    pub fn cookie(&self, key: &str, default: &str) -> String {
        self.cookies.get_or(key, default)
    }

    pub fn is_close(&self) -> bool {
        self.close
    }
}

/// An outbound HTTP response, built by a [`crate::http::Servlet`] and
/// serialized by [`super::session::HttpSession`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: HttpStatus,
    pub version: u8,
    pub close: bool,
    pub body: Vec<u8>,
    pub reason: String,
    pub headers: HeaderMap,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse {
            status: HttpStatus::Ok,
            version: 0x11,
            close: true,
            body: Vec::new(),
            reason: String::new(),
            headers: HeaderMap::new(),
        }
    }
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: HttpStatus) -> Self {
        HttpResponse {
            status,
            ..Self::default()
        }
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    /// Serializes headline + headers + body into the wire format
    /// `HttpSession` writes out, grounded in `HttpResponse::toString`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let major = self.version >> 4;
        let minor = self.version & 0x0F;
        let reason = if self.reason.is_empty() {
            self.status.reason().to_string()
        } else {
            self.reason.clone()
        };
        out.extend_from_slice(
            format!("HTTP/{major}.{minor} {} {reason}\r\n", self.status.code()).as_bytes(),
        );
        for (k, v) in self.headers.iter() {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        if !self.headers.contains("content-length") {
            out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        }
        if !self.headers.contains("connection") {
            let conn = if self.close { "close" } else { "keep-alive" };
            out.extend_from_slice(format!("connection: {conn}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_lookup_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.set("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn method_round_trips_through_str() {
        assert_eq!(HttpMethod::from_str("GET"), HttpMethod::GET);
        assert_eq!(HttpMethod::from_str("bogus"), HttpMethod::Invalid);
        assert_eq!(HttpMethod::GET.as_str(), "GET");
    }

    #[test]
    fn response_serializes_with_default_headers() {
        let mut resp = HttpResponse::with_status(HttpStatus::NotFound);
        resp.set_body(b"not here".to_vec());
        resp.close = false;
        let bytes = resp.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("content-length: 8\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("not here"));
    }
}
