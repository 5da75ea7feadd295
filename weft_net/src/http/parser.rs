//! Incremental HTTP/1.1 request and response parsers, grounded in
//! `original_source/ljrServer/http/http_parser.{h,cpp}`'s
//! `HttpRequestParser`/`HttpResponseParser`.
//!
//! The original drives a generated Ragel state machine (`http11_parser`
//! for requests, `httpclient_parser` for responses) byte by byte.
//! `weft_net` has no code generator in its toolchain, so this parses
//! the same grammar by hand over complete buffered chunks: find the
//! blank-line header terminator, split the request/status line and
//! headers, then wait for `Content-Length` bytes of body. The
//! observable contract — feed bytes incrementally, ask whether a full
//! message is ready — is unchanged.

use crate::http::message::{HeaderMap, HttpMethod, HttpRequest, HttpResponse, HttpStatus};
use std::sync::Arc;
use weft_config::ConfigVar;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line: {0}")]
    BadRequestLine(String),
    #[error("malformed header line: {0}")]
    BadHeaderLine(String),
    #[error("header block exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },
    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

fn buffer_size_var() -> Arc<ConfigVar<u32>> {
    static VAR: std::sync::OnceLock<Arc<ConfigVar<u32>>> = std::sync::OnceLock::new();
    VAR.get_or_init(|| {
        weft_config::Config::lookup(
            "http.request.buffer_size",
            4096u32,
            "maximum size in bytes of the request line + headers block",
        )
    })
    .clone()
}

fn max_body_size_var() -> Arc<ConfigVar<u32>> {
    static VAR: std::sync::OnceLock<Arc<ConfigVar<u32>>> = std::sync::OnceLock::new();
    VAR.get_or_init(|| {
        weft_config::Config::lookup(
            "http.request.max_body_size",
            64 * 1024 * 1024u32,
            "maximum accepted request body size in bytes",
        )
    })
    .clone()
}

fn response_buffer_size_var() -> Arc<ConfigVar<u32>> {
    static VAR: std::sync::OnceLock<Arc<ConfigVar<u32>>> = std::sync::OnceLock::new();
    VAR.get_or_init(|| {
        weft_config::Config::lookup(
            "http.response.buffer_size",
            4096u32,
            "maximum size in bytes of the status line + headers block",
        )
    })
    .clone()
}

fn response_max_body_size_var() -> Arc<ConfigVar<u32>> {
    static VAR: std::sync::OnceLock<Arc<ConfigVar<u32>>> = std::sync::OnceLock::new();
    VAR.get_or_init(|| {
        weft_config::Config::lookup(
            "http.response.max_body_size",
            64 * 1024 * 1024u32,
            "maximum accepted response body size in bytes",
        )
    })
    .clone()
}

/// What the parser needs from its caller before it can make progress.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Not enough bytes buffered yet; caller should read more and call
    /// `execute` again with the grown buffer.
    Incomplete,
    /// A full request was parsed; it consumed `consumed` bytes of the
    /// input buffer.
    Complete { consumed: usize },
}

/// Parses one HTTP/1.1 request out of a growing byte buffer.
///
/// Grounded in `HttpRequestParser::execute`/`isFinished`/`hasError`.
#[derive(Debug, Default)]
pub struct HttpRequestParser {
    request: HttpRequest,
    content_length: Option<u64>,
    error: bool,
}

impl HttpRequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn into_request(self) -> HttpRequest {
        self.request
    }

    /// Attempts to parse a complete request out of `buf`. Returns how
    /// many leading bytes of `buf` were consumed once complete, or
    /// [`ParseOutcome::Incomplete`] if more data is needed.
    pub fn execute(&mut self, buf: &[u8]) -> Result<ParseOutcome, ParseError> {
        let buffer_limit = buffer_size_var().get() as usize;
        let header_end = match find_header_terminator(buf) {
            Some(pos) => pos,
            None => {
                if buf.len() > buffer_limit {
                    self.error = true;
                    return Err(ParseError::HeadersTooLarge { limit: buffer_limit });
                }
                return Ok(ParseOutcome::Incomplete);
            }
        };
        if header_end > buffer_limit {
            self.error = true;
            return Err(ParseError::HeadersTooLarge { limit: buffer_limit });
        }

        let head = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| ParseError::BadRequestLine("non-utf8 header block".to_string()))?;
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        self.parse_request_line(request_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::BadHeaderLine(line.to_string()))?;
            headers.set(key.trim(), value.trim().to_string());
        }
        self.request.close = headers
            .get("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(self.request.version < 0x11);
        self.request.headers = headers;

        let body_start = header_end + 4;
        let content_length = self
            .request
            .headers
            .get("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        self.content_length = Some(content_length);

        let max_body = max_body_size_var().get() as u64;
        if content_length > max_body {
            self.error = true;
            return Err(ParseError::BodyTooLarge {
                limit: max_body as usize,
            });
        }

        let available_body = buf.len().saturating_sub(body_start) as u64;
        if available_body < content_length {
            return Ok(ParseOutcome::Incomplete);
        }

        let body_end = body_start + content_length as usize;
        self.request.body = buf[body_start..body_end].to_vec();
        Ok(ParseOutcome::Complete { consumed: body_end })
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.split_ascii_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| ParseError::BadRequestLine(line.to_string()))?;
        let uri = parts
            .next()
            .ok_or_else(|| ParseError::BadRequestLine(line.to_string()))?;
        let version = parts
            .next()
            .ok_or_else(|| ParseError::BadRequestLine(line.to_string()))?;

        self.request.method = HttpMethod::from_str(method);
        if self.request.method == HttpMethod::Invalid {
            self.error = true;
            return Err(ParseError::BadRequestLine(format!("unknown method {method}")));
        }
        self.request.version = parse_http_version(version)?;
        self.parse_uri(uri);
        Ok(())
    }

    fn parse_uri(&mut self, uri: &str) {
        let (path_and_query, fragment) = match uri.split_once('#') {
            Some((a, b)) => (a, b.to_string()),
            None => (uri, String::new()),
        };
        let (path, query) = match path_and_query.split_once('?') {
            Some((a, b)) => (a.to_string(), b.to_string()),
            None => (path_and_query.to_string(), String::new()),
        };
        self.request.path = if path.is_empty() { "/".to_string() } else { path };
        self.request.fragment = fragment;

        let mut params = HeaderMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            params.set(k, v.to_string());
        }
        self.request.query = query;
        self.request.params = params;
    }
}

/// Parses one HTTP/1.1 response out of a growing byte buffer, the
/// client-side counterpart of [`HttpRequestParser`].
///
/// Grounded in `HttpResponseParser::execute`/`isFinished`/`hasError`.
#[derive(Debug, Default)]
pub struct HttpResponseParser {
    response: HttpResponse,
    content_length: Option<u64>,
    error: bool,
}

impl HttpResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn into_response(self) -> HttpResponse {
        self.response
    }

    /// Attempts to parse a complete response out of `buf`. Returns how
    /// many leading bytes of `buf` were consumed once complete, or
    /// [`ParseOutcome::Incomplete`] if more data is needed.
    pub fn execute(&mut self, buf: &[u8]) -> Result<ParseOutcome, ParseError> {
        let buffer_limit = response_buffer_size_var().get() as usize;
        let header_end = match find_header_terminator(buf) {
            Some(pos) => pos,
            None => {
                if buf.len() > buffer_limit {
                    self.error = true;
                    return Err(ParseError::HeadersTooLarge { limit: buffer_limit });
                }
                return Ok(ParseOutcome::Incomplete);
            }
        };
        if header_end > buffer_limit {
            self.error = true;
            return Err(ParseError::HeadersTooLarge { limit: buffer_limit });
        }

        let head = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| ParseError::BadRequestLine("non-utf8 header block".to_string()))?;
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or("");
        self.parse_status_line(status_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| ParseError::BadHeaderLine(line.to_string()))?;
            headers.set(key.trim(), value.trim().to_string());
        }
        self.response.close = headers
            .get("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(self.response.version < 0x11);
        self.response.headers = headers;

        let body_start = header_end + 4;
        let content_length = self
            .response
            .headers
            .get("content-length")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        self.content_length = Some(content_length);

        let max_body = response_max_body_size_var().get() as u64;
        if content_length > max_body {
            self.error = true;
            return Err(ParseError::BodyTooLarge {
                limit: max_body as usize,
            });
        }

        let available_body = buf.len().saturating_sub(body_start) as u64;
        if available_body < content_length {
            return Ok(ParseOutcome::Incomplete);
        }

        let body_end = body_start + content_length as usize;
        self.response.body = buf[body_start..body_end].to_vec();
        Ok(ParseOutcome::Complete { consumed: body_end })
    }

    fn parse_status_line(&mut self, line: &str) -> Result<(), ParseError> {
        let mut parts = line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| ParseError::BadRequestLine(line.to_string()))?;
        let code = parts
            .next()
            .ok_or_else(|| ParseError::BadRequestLine(line.to_string()))?;
        let reason = parts.next().unwrap_or("").to_string();

        self.response.version = parse_http_version(version)?;
        let code: u16 = code
            .parse()
            .map_err(|_| ParseError::BadRequestLine(format!("non-numeric status {code}")))?;
        self.response.status = HttpStatus::from_code(code);
        self.response.reason = reason;
        Ok(())
    }
}

fn parse_http_version(v: &str) -> Result<u8, ParseError> {
    let rest = v
        .strip_prefix("HTTP/")
        .ok_or_else(|| ParseError::BadRequestLine(v.to_string()))?;
    let (major, minor) = rest
        .split_once('.')
        .ok_or_else(|| ParseError::BadRequestLine(v.to_string()))?;
    let major: u8 = major
        .parse()
        .map_err(|_| ParseError::BadRequestLine(v.to_string()))?;
    let minor: u8 = minor
        .parse()
        .map_err(|_| ParseError::BadRequestLine(v.to_string()))?;
    Ok((major << 4) | minor)
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_request() {
        let mut parser = HttpRequestParser::new();
        let raw = b"GET /hello?name=weft HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let outcome = parser.execute(raw).unwrap();
        assert_eq!(outcome, ParseOutcome::Complete { consumed: raw.len() });
        let req = parser.request();
        assert_eq!(req.method, HttpMethod::GET);
        assert_eq!(req.path, "/hello");
        assert_eq!(req.param("name", ""), "weft");
        assert_eq!(req.header("host", ""), "example.com");
        assert_eq!(req.version, 0x11);
    }

    #[test]
    fn waits_for_full_body_before_completing() {
        let mut parser = HttpRequestParser::new();
        let head = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(parser.execute(head).unwrap(), ParseOutcome::Incomplete);

        let mut full = head.to_vec();
        full.extend_from_slice(b"hello");
        let outcome = parser.execute(&full).unwrap();
        assert_eq!(outcome, ParseOutcome::Complete { consumed: full.len() });
        assert_eq!(parser.request().body, b"hello");
    }

    #[test]
    fn incomplete_header_block_requests_more_bytes() {
        let mut parser = HttpRequestParser::new();
        let partial = b"GET / HTTP/1.1\r\nHost: exa";
        assert_eq!(parser.execute(partial).unwrap(), ParseOutcome::Incomplete);
    }

    #[test]
    fn rejects_unknown_method() {
        let mut parser = HttpRequestParser::new();
        let raw = b"FROBNICATE / HTTP/1.1\r\n\r\n";
        assert!(parser.execute(raw).is_err());
        assert!(parser.is_error());
    }

    #[test]
    fn connection_close_is_honored_and_default_for_http_1_0() {
        let mut parser = HttpRequestParser::new();
        let raw = b"GET / HTTP/1.0\r\n\r\n";
        parser.execute(raw).unwrap();
        assert!(parser.request().is_close());
    }

    #[test]
    fn parses_simple_response() {
        let mut parser = HttpResponseParser::new();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let outcome = parser.execute(raw).unwrap();
        assert_eq!(outcome, ParseOutcome::Complete { consumed: raw.len() });
        let resp = parser.response();
        assert_eq!(resp.status.code(), 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.version, 0x11);
        assert_eq!(resp.body, b"hi");
    }

    #[test]
    fn response_waits_for_full_body_before_completing() {
        let mut parser = HttpResponseParser::new();
        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(parser.execute(head).unwrap(), ParseOutcome::Incomplete);

        let mut full = head.to_vec();
        full.extend_from_slice(b"world");
        let outcome = parser.execute(&full).unwrap();
        assert_eq!(outcome, ParseOutcome::Complete { consumed: full.len() });
        assert_eq!(parser.into_response().body, b"world");
    }

    #[test]
    fn response_with_unrecognized_status_keeps_the_wire_code() {
        let mut parser = HttpResponseParser::new();
        let raw = b"HTTP/1.1 418 I'm a teapot\r\n\r\n";
        parser.execute(raw).unwrap();
        assert_eq!(parser.response().status.code(), 418);
        assert_eq!(parser.response().reason, "I'm a teapot");
    }

    #[test]
    fn response_rejects_body_over_the_configured_limit() {
        response_max_body_size_var().set(4);
        let mut parser = HttpResponseParser::new();
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        assert!(matches!(
            parser.execute(raw),
            Err(ParseError::BodyTooLarge { limit: 4 })
        ));
        assert!(parser.is_error());
        response_max_body_size_var().set(64 * 1024 * 1024);
    }
}
