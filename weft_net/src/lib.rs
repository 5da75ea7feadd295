//! Sockets, a byte-array codec, and an HTTP server built on top of
//! `weft_core`'s scheduler/reactor/syscall shim.
//!
//! Grounded throughout in `original_source/ljrServer`'s `address`,
//! `bytearray`, `socket`, `stream`/`socket_stream`, `tcp_server` and
//! `http/*` modules; module-by-module provenance is recorded in
//! `DESIGN.md` at the workspace root.

#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod address;
pub mod bytearray;
pub mod http;
pub mod socket;
pub mod stream;
pub mod tcp_server;

pub use address::Address;
pub use bytearray::{ByteArray, ByteArrayError};
pub use socket::{Family, Socket, Type};
pub use stream::{SocketStream, Stream};
pub use tcp_server::{ClientHandler, TcpServer};
