//! Server-side HTTP connection handling, grounded in
//! `original_source/ljrServer/http/http_session.{h,cpp}` and
//! `http_server.{h,cpp}`.

use crate::http::message::HttpRequest;
use crate::http::parser::{HttpRequestParser, ParseOutcome};
use crate::http::servlet::ServletDispatch;
use crate::stream::{SocketStream, Stream};
use log::{debug, warn};
use std::sync::Arc;

/// A single accepted HTTP connection, grounded in `HttpSession`
/// (a `SocketStream` subclass in the original; composition here).
pub struct HttpSession {
    stream: SocketStream,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("fd", &self.stream.socket().fd())
            .finish()
    }
}

impl HttpSession {
    pub fn new(stream: SocketStream) -> Self {
        HttpSession { stream }
    }

    pub fn stream(&self) -> &SocketStream {
        &self.stream
    }

    /// Reads and parses one request, growing an internal buffer until
    /// the parser reports it has a complete request or errors out,
    /// grounded in `HttpSession::recvRequest`.
    pub fn recv_request(&mut self) -> std::io::Result<Option<HttpRequest>> {
        let mut buf = Vec::with_capacity(4096);
        let mut parser = HttpRequestParser::new();
        let mut chunk = [0u8; 4096];

        loop {
            match parser.execute(&buf) {
                Ok(ParseOutcome::Complete { consumed }) => {
                    let _ = buf.drain(..consumed);
                    return Ok(Some(parser.into_request()));
                }
                Ok(ParseOutcome::Incomplete) => {}
                Err(e) => {
                    warn!("http request parse error: {e}");
                    return Ok(None);
                }
            }

            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Serializes and writes a response, grounded in
    /// `HttpSession::sendResponse`.
    pub fn send_response(&mut self, response: &crate::http::message::HttpResponse) -> std::io::Result<usize> {
        self.stream.write_all(&response.to_bytes())
    }
}

/// Drives one [`HttpSession`] to completion: parse request, dispatch
/// through a [`ServletDispatch`], write response, repeat until the
/// connection closes or a non-keep-alive response is sent. Grounded in
/// `HttpServer::handleClient`.
pub fn serve_session(mut session: HttpSession, dispatch: Arc<ServletDispatch>) {
    loop {
        let request = match session.recv_request() {
            Ok(Some(req)) => req,
            Ok(None) => {
                debug!("http session closed by peer");
                break;
            }
            Err(e) => {
                debug!("http session read error: {e}");
                break;
            }
        };

        let mut response = crate::http::message::HttpResponse::new();
        response.version = request.version;
        response.close = request.is_close();
        dispatch.dispatch(&request, &mut response, &session);

        if let Err(e) = session.send_response(&response) {
            debug!("http session write error: {e}");
            break;
        }

        if response.close {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::HttpStatus;
    use crate::http::servlet::FunctionServlet;
    use crate::socket::{Family, Socket, Type};

    fn connected_pair() -> (Socket, Socket) {
        let listener = Socket::new(Family::Inet, Type::Tcp).unwrap();
        listener.bind(&crate::address::Address::V4("127.0.0.1:0".parse().unwrap())).unwrap();
        listener.listen(1).unwrap();
        let local = listener.local_address().unwrap();

        let mut client = Socket::new(Family::Inet, Type::Tcp).unwrap();
        // Non-shim-suspended connect: no scheduler is attached in this
        // test, so `shim_enabled()` is false and this call is a plain
        // blocking `connect(2)`.
        client.connect(&local).unwrap();
        let server_side = listener.accept().unwrap();
        (server_side, client)
    }

    #[test]
    fn recv_request_parses_a_full_get_over_a_real_socket() {
        let (server_side, client) = connected_pair();
        client
            .send(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let mut session = HttpSession::new(SocketStream::new(server_side));
        let req = session.recv_request().unwrap().unwrap();
        assert_eq!(req.path, "/ping");
    }

    #[test]
    fn serve_session_dispatches_and_writes_response() {
        let (server_side, client) = connected_pair();
        client
            .send(b"GET /ping HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        let dispatch = Arc::new(ServletDispatch::new());
        dispatch.add_servlet(
            "/ping",
            Arc::new(FunctionServlet::new("ping", |_, resp, _| {
                resp.status = HttpStatus::Ok;
                resp.set_body(b"pong".to_vec());
                0
            })),
        );

        let session = HttpSession::new(SocketStream::new(server_side));
        serve_session(session, dispatch);

        let mut buf = [0u8; 256];
        let n = client.recv(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("pong"));
    }
}
