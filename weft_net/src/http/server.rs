//! HTTP server, grounded in
//! `original_source/ljrServer/http/http_server.{h,cpp}`.
//!
//! The original subclasses `TcpServer` and overrides `handleClient`.
//! `HttpServer` instead owns a `TcpServer` and installs a handler
//! closure that wraps each accepted [`Socket`](crate::socket::Socket)
//! in an [`HttpSession`] and runs [`serve_session`].

use crate::http::servlet::ServletDispatch;
use crate::http::session::{serve_session, HttpSession};
use crate::socket::Socket;
use crate::stream::SocketStream;
use crate::tcp_server::TcpServer;
use std::sync::Arc;
use weft_core::Scheduler;

#[derive(Debug)]
pub struct HttpServer {
    tcp: Arc<TcpServer>,
    dispatch: Arc<ServletDispatch>,
}

impl HttpServer {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let tcp = Arc::new(TcpServer::new(scheduler));
        let dispatch = Arc::new(ServletDispatch::new());
        let dispatch_for_handler = dispatch.clone();
        tcp.set_handler(Arc::new(move |socket: Socket| {
            let session = HttpSession::new(SocketStream::new(socket));
            serve_session(session, dispatch_for_handler.clone());
        }));
        HttpServer { tcp, dispatch }
    }

    pub fn dispatch(&self) -> &Arc<ServletDispatch> {
        &self.dispatch
    }

    pub fn tcp_server(&self) -> &Arc<TcpServer> {
        &self.tcp
    }

    pub fn bind(&self, addrs: &[crate::address::Address]) -> (bool, Vec<crate::address::Address>) {
        self.tcp.bind(addrs)
    }

    pub fn start(self: &Arc<Self>) {
        self.tcp.start();
    }

    pub fn stop(&self) {
        self.tcp.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::http::message::HttpStatus;
    use crate::http::servlet::FunctionServlet;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn http_server_binds_and_registers_routes() {
        let stopping = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(Scheduler::new(
            1,
            false,
            || {},
            move |_| Box::new(weft_core::NoopIdle::new(stopping.clone())),
        ));
        let server = Arc::new(HttpServer::new(scheduler));
        server.dispatch().add_servlet(
            "/health",
            Arc::new(FunctionServlet::new("health", |_, resp, _| {
                resp.status = HttpStatus::Ok;
                0
            })),
        );
        let (ok, _) = server.bind(&[Address::V4("127.0.0.1:0".parse().unwrap())]);
        assert!(ok);
    }
}
