//! Minimal byte-stream abstraction, grounded in
//! `original_source/ljrServer/stream.{h,cpp}` and
//! `socket_stream.{h,cpp}`.

use crate::socket::Socket;
use std::io;

/// A readable/writable byte stream. `SocketStream` is the only
/// implementation today; the trait exists so `http::Session` can be
/// tested against an in-memory stand-in without a real socket.
pub trait Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn close(&mut self) -> io::Result<()>;

    /// Reads until `buf` is completely filled or the peer closes early.
    fn read_fixed(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Writes all of `buf`, retrying on short writes.
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let total = buf.len();
        while !buf.is_empty() {
            let n = self.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            buf = &buf[n..];
        }
        Ok(total)
    }
}

/// A [`Stream`] backed by a connected [`Socket`].
#[derive(Debug)]
pub struct SocketStream {
    socket: Socket,
}

impl SocketStream {
    pub fn new(socket: Socket) -> Self {
        SocketStream { socket }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl Stream for SocketStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryStream {
        input: std::collections::VecDeque<u8>,
        output: Vec<u8>,
    }

    impl Stream for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.input.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.input.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn read_fixed_stops_early_on_short_source() {
        let mut stream = MemoryStream {
            input: b"abc".iter().copied().collect(),
            output: Vec::new(),
        };
        let mut buf = [0u8; 10];
        let n = stream.read_fixed(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn write_all_accumulates_full_buffer() {
        let mut stream = MemoryStream {
            input: std::collections::VecDeque::new(),
            output: Vec::new(),
        };
        stream.write_all(b"hello").unwrap();
        assert_eq!(stream.output, b"hello");
    }
}
