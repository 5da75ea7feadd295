//! HTTP/1.1 server layer built on [`crate::tcp_server::TcpServer`],
//! grounded in `original_source/ljrServer/http/*`.

pub mod message;
pub mod parser;
pub mod server;
pub mod servlet;
pub mod session;

pub use message::{HeaderMap, HttpMethod, HttpRequest, HttpResponse, HttpStatus};
pub use parser::{HttpRequestParser, HttpResponseParser, ParseError, ParseOutcome};
pub use server::HttpServer;
pub use servlet::{FunctionServlet, NotFoundServlet, Servlet, ServletDispatch};
pub use session::HttpSession;
