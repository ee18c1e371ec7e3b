//! Per-connection session state.
//!
//! A session exclusively owns its transport and both sides of its buffering:
//! a line decoder for inbound bytes and a bounded pending-output queue for
//! outbound bytes. At most one reactor iteration touches a given session at a
//! time, so no internal locking is needed.

use crate::codec::LineDecoder;
use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Slab key for a session; doubles as its mio token.
pub type SessionId = usize;

/// Pending output may exceed one buffer while a peer drains slowly,
/// but not without bound.
const PENDING_LIMIT_FACTOR: usize = 8;

/// Lifecycle of a connection.
///
/// `Connecting -> Established -> Closing -> Closed`, with one shortcut:
/// a session that fails before establishment goes straight to `Closed`
/// without ever becoming visible to broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted but not yet registered with the poller.
    Connecting,
    /// Fully wired up; eligible for broadcast delivery.
    Established,
    /// Teardown in progress; still broadcast-visible until removal completes.
    Closing,
    /// Transport released. Terminal; never reused.
    Closed,
}

/// Outcome of draining a readable session.
#[derive(Debug)]
pub struct Drain {
    /// Complete messages decoded from this drain.
    pub lines: Vec<String>,
    /// Peer closed its end; the session should be torn down after
    /// the lines above are handled.
    pub eof: bool,
}

/// One client connection.
///
/// Generic over the transport so the broadcast path can be exercised with
/// in-memory fakes; the reactor instantiates it with `mio::net::TcpStream`.
#[derive(Debug)]
pub struct Session<T> {
    transport: T,
    peer_addr: SocketAddr,
    name: String,
    state: SessionState,
    decoder: LineDecoder,
    pending: BytesMut,
    pending_limit: usize,
    buffer_size: usize,
}

impl<T: Read + Write> Session<T> {
    /// Create a session in the `Connecting` state.
    ///
    /// The display name is derived from the peer's ephemeral port, which is
    /// unique among concurrently open connections.
    pub fn new(transport: T, peer_addr: SocketAddr, buffer_size: usize) -> Self {
        Self {
            transport,
            peer_addr,
            name: format!("client-{}", peer_addr.port()),
            state: SessionState::Connecting,
            decoder: LineDecoder::new(buffer_size),
            pending: BytesMut::new(),
            pending_limit: buffer_size * PENDING_LIMIT_FACTOR,
            buffer_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// `Connecting -> Established`.
    pub fn establish(&mut self) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.state = SessionState::Established;
    }

    /// `Established -> Closing`. Idempotent once closing.
    pub fn begin_close(&mut self) {
        if self.state == SessionState::Established {
            self.state = SessionState::Closing;
        }
    }

    /// Terminal transition; the transport is released when the session drops.
    pub fn finish_close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Drain all currently readable bytes without blocking.
    ///
    /// Reads until the transport would block or signals end-of-stream,
    /// decoding complete lines along the way. An I/O error propagates to the
    /// caller, which contains it at the session boundary.
    pub fn drain(&mut self) -> io::Result<Drain> {
        let mut scratch = vec![0u8; self.buffer_size];
        let mut lines = Vec::new();
        let mut eof = false;

        loop {
            match self.transport.read(&mut scratch) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => lines.extend(self.decoder.feed(&scratch[..n])),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(Drain { lines, eof })
    }

    /// Queue outbound bytes, rejecting a peer that has fallen too far behind.
    pub fn queue(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.pending.len() + payload.len() > self.pending_limit {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "pending output limit exceeded",
            ));
        }
        self.pending.extend_from_slice(payload);
        Ok(())
    }

    /// Write queued output until drained or the transport would block.
    ///
    /// Returns `true` when nothing remains pending.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.pending.is_empty() {
            match self.transport.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    let _ = self.pending.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Whether queued output is waiting on the peer.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{addr, FakeSocket};
    use super::*;

    fn session(sock: FakeSocket) -> Session<FakeSocket> {
        let mut s = Session::new(sock, addr(40001), 1024);
        s.establish();
        s
    }

    #[test]
    fn test_name_from_peer_port() {
        let s = Session::new(FakeSocket::default(), addr(55321), 1024);
        assert_eq!(s.name(), "client-55321");
    }

    #[test]
    fn test_state_machine() {
        let mut s = Session::new(FakeSocket::default(), addr(1), 1024);
        assert_eq!(s.state(), SessionState::Connecting);
        s.establish();
        assert_eq!(s.state(), SessionState::Established);
        s.begin_close();
        assert_eq!(s.state(), SessionState::Closing);
        // begin_close after closing is a no-op
        s.begin_close();
        assert_eq!(s.state(), SessionState::Closing);
        s.finish_close();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_connecting_failure_skips_closing() {
        let mut s = Session::new(FakeSocket::default(), addr(1), 1024);
        s.finish_close();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_drain_yields_lines() {
        let mut s = session(FakeSocket::with_input(b"hello\nworld\n"));
        let drain = s.drain().unwrap();
        assert_eq!(drain.lines, vec!["hello", "world"]);
        assert!(!drain.eof);
    }

    #[test]
    fn test_drain_buffers_partial_line() {
        let mut s = session(FakeSocket::with_input(b"hel"));
        let drain = s.drain().unwrap();
        assert!(drain.lines.is_empty());
        assert!(!drain.eof);

        s.transport_mut().input.extend_from_slice(b"lo\n");
        let drain = s.drain().unwrap();
        assert_eq!(drain.lines, vec!["hello"]);
    }

    #[test]
    fn test_drain_reports_eof() {
        let mut sock = FakeSocket::with_input(b"bye\n");
        sock.eof_after_input = true;
        let drain = session(sock).drain().unwrap();
        assert_eq!(drain.lines, vec!["bye"]);
        assert!(drain.eof);
    }

    #[test]
    fn test_queue_and_flush() {
        let mut s = session(FakeSocket::default());
        s.queue(b"abc").unwrap();
        assert!(s.has_pending());
        assert!(s.flush().unwrap());
        assert!(!s.has_pending());
        assert_eq!(s.transport_mut().written, b"abc");
    }

    #[test]
    fn test_flush_partial_write() {
        let mut sock = FakeSocket::default();
        sock.write_limit = Some(2);
        let mut s = session(sock);
        s.queue(b"abcdef").unwrap();
        // Each call writes 2 bytes; flush loops until drained
        assert!(s.flush().unwrap());
        assert_eq!(s.transport_mut().written, b"abcdef");
    }

    #[test]
    fn test_queue_overflow_rejected() {
        let mut sock = FakeSocket::default();
        sock.write_limit = Some(0); // every write would block
        let mut s = Session::new(sock, addr(1), 4);
        s.establish();
        s.queue(&[0u8; 32]).unwrap();
        assert!(s.queue(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_flush_propagates_write_error() {
        let mut s = session(FakeSocket::failing());
        s.queue(b"x").unwrap();
        assert!(s.flush().is_err());
    }
}
