//! Byte channels the transfer protocol runs over.
//!
//! The protocol only needs a reliable, ordered, possibly-blocking byte
//! stream per direction, so both sides are written against plain
//! `Read`/`Write` halves. `std::net::TcpStream` provides halves via
//! `try_clone`; [`memory_duplex`] provides an in-process pair for tests and
//! for wiring the transfer into a surrounding server without sockets.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};

const CHANNEL_DEPTH: usize = 256;

/// Read half of an in-memory duplex pipe. Returns EOF once the peer's
/// writer is shut down or dropped.
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

/// Write half of an in-memory duplex pipe. Writes fail fast with
/// `BrokenPipe` after the peer hangs up or [`PipeWriter::shutdown`] ran.
pub struct PipeWriter {
    tx: Option<SyncSender<Vec<u8>>>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(next) => {
                    self.buf = next;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe shut down"))?;
        tx.send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PipeWriter {
    /// Cooperative cancellation: pending reads on the peer return EOF and
    /// further writes here fail fast.
    pub fn shutdown(&mut self) {
        self.tx = None;
    }
}

/// Create a connected pair of duplex endpoints.
pub fn memory_duplex() -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (a_tx, b_rx) = sync_channel(CHANNEL_DEPTH);
    let (b_tx, a_rx) = sync_channel(CHANNEL_DEPTH);
    (
        (
            PipeReader {
                rx: a_rx,
                buf: Vec::new(),
                pos: 0,
            },
            PipeWriter { tx: Some(a_tx) },
        ),
        (
            PipeReader {
                rx: b_rx,
                buf: Vec::new(),
                pos: 0,
            },
            PipeWriter { tx: Some(b_tx) },
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_cross_the_duplex() {
        let ((mut a_rx, mut a_tx), (mut b_rx, mut b_tx)) = memory_duplex();

        a_tx.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b_rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        b_tx.write_all(b"pong").unwrap();
        a_rx.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn shutdown_gives_reader_eof_and_writer_broken_pipe() {
        let ((mut a_rx, mut a_tx), (_b_rx, mut b_tx)) = memory_duplex();

        b_tx.write_all(b"x").unwrap();
        b_tx.shutdown();

        let mut buf = [0u8; 8];
        assert_eq!(a_rx.read(&mut buf).unwrap(), 1);
        assert_eq!(a_rx.read(&mut buf).unwrap(), 0);

        assert!(b_tx.write_all(b"y").is_err());
        // the other direction still works until its own writer goes away
        a_tx.write_all(b"z").unwrap();
    }

    #[test]
    fn partial_reads_drain_buffered_message() {
        let ((mut a_rx, _a_tx), (_b_rx, mut b_tx)) = memory_duplex();
        b_tx.write_all(b"abcdef").unwrap();

        let mut one = [0u8; 2];
        a_rx.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"ab");
        let mut rest = [0u8; 4];
        a_rx.read_exact(&mut rest).unwrap();
        assert_eq!(&rest, b"cdef");
    }
}
