//! Non-blocking byte transports under a [`PeerIo`](super::PeerIo).
use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::{
    io::Interest,
    net::TcpStream,
    select,
    sync::{mpsc, watch},
};
use tracing::trace;

use crate::{engine::EngineMsg, types::ConnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    /// The datagram based micro transport protocol.
    Utp,
}

/// Readiness directions a connection wants to hear about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoInterest {
    pub read: bool,
    pub write: bool,
}

/// A socket that never blocks. `WouldBlock` means "try again on the next
/// readiness event".
pub trait Transport: Send {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Arm the readiness notifications. Calling it again with the same
    /// value re-arms them after an event was delivered.
    fn set_interest(&mut self, interest: IoInterest);
    fn kind(&self) -> TransportKind;
}

/// A tokio TCP stream whose readiness is reported to the engine loop by a
/// small watcher task.
pub struct TcpTransport {
    stream: Arc<TcpStream>,
    interest: watch::Sender<IoInterest>,
}

impl TcpTransport {
    pub fn new(
        stream: TcpStream,
        conn: ConnId,
        tx: mpsc::Sender<EngineMsg>,
    ) -> Self {
        let stream = Arc::new(stream);
        let (interest, rx) = watch::channel(IoInterest::default());
        tokio::spawn(watch_readiness(stream.clone(), conn, rx, tx));
        Self { stream, interest }
    }
}

impl Transport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }

    fn set_interest(&mut self, interest: IoInterest) {
        self.interest.send_replace(interest);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

/// Wait for the socket to be ready in the armed directions, tell the
/// engine, and sleep until it re-arms. Exits when the transport is dropped
/// or the engine is gone.
async fn watch_readiness(
    stream: Arc<TcpStream>,
    conn: ConnId,
    mut interest: watch::Receiver<IoInterest>,
    tx: mpsc::Sender<EngineMsg>,
) {
    loop {
        let want = *interest.borrow_and_update();

        let wanted = match (want.read, want.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let Some(wanted) = wanted else {
            if interest.changed().await.is_err() {
                return;
            }
            continue;
        };

        select! {
            ready = stream.ready(wanted) => {
                let (readable, writable) = match ready {
                    Ok(r) => (r.is_readable() || r.is_read_closed(), r.is_writable()),
                    // let the loop hit the error on its next syscall
                    Err(_) => (want.read, want.write),
                };
                trace!("{conn} ready r:{readable} w:{writable}");

                let msg = EngineMsg::Ready { conn, readable, writable };
                if tx.send(msg).await.is_err() {
                    return;
                }
                if interest.changed().await.is_err() {
                    return;
                }
            }
            changed = interest.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Pipe {
    buf: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex byte stream.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: Arc<Mutex<Pipe>>,
    outgoing: Arc<Mutex<Pipe>>,
    kind: TransportKind,
}

fn lock(pipe: &Mutex<Pipe>) -> MutexGuard<'_, Pipe> {
    pipe.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryTransport {
    /// Two connected ends.
    pub fn pair(kind: TransportKind) -> (Self, Self) {
        let a = Arc::new(Mutex::new(Pipe::default()));
        let b = Arc::new(Mutex::new(Pipe::default()));
        (
            Self { incoming: a.clone(), outgoing: b.clone(), kind },
            Self { incoming: b, outgoing: a, kind },
        )
    }

    /// Bytes written by the other end and not read yet.
    pub fn pending(&self) -> usize {
        lock(&self.incoming).buf.len()
    }

    /// Close both directions. Reads on the other end return EOF once
    /// drained.
    pub fn close(&self) {
        lock(&self.incoming).closed = true;
        lock(&self.outgoing).closed = true;
    }
}

impl Transport for MemoryTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = lock(&self.incoming);
        if pipe.buf.is_empty() {
            if pipe.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(pipe.buf.len());
        for (dst, src) in buf.iter_mut().zip(pipe.buf.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = lock(&self.outgoing);
        if pipe.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        pipe.buf.extend(buf);
        Ok(buf.len())
    }

    fn set_interest(&mut self, _interest: IoInterest) {}

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pipe() {
        let (mut a, mut b) = MemoryTransport::pair(TransportKind::Tcp);
        let mut buf = [0u8; 4];

        assert_eq!(
            b.try_read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );

        a.try_write(b"hello").unwrap();
        assert_eq!(b.pending(), 5);
        assert_eq!(b.try_read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"hell");

        a.close();
        assert_eq!(b.try_read(&mut buf).unwrap(), 1);
        assert_eq!(b.try_read(&mut buf).unwrap(), 0);
        assert!(b.try_write(b"x").is_err());
    }
}
