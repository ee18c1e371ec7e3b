//! Readiness-multiplexed event loop.
//!
//! One dispatcher thread drives every socket: poll tells us which are ready,
//! then we perform non-blocking accept/read/write syscalls. No step blocks
//! past the next non-blocking call, so a slow peer can only ever back up its
//! own session.

use crate::config::Config;
use crate::reactor::session::{Session, SessionId};
use crate::relay::Relay;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENT_CAPACITY: usize = 256;

/// What a readiness event is for, resolved once per event.
#[derive(Debug, Clone, Copy)]
enum Ready {
    /// The listener has pending connections.
    Accept,
    /// The shutdown waker fired.
    Wake,
    /// A session socket is readable and/or writable.
    Session(SessionId),
}

fn classify(token: Token) -> Ready {
    match token {
        LISTENER_TOKEN => Ready::Accept,
        WAKER_TOKEN => Ready::Wake,
        Token(id) => Ready::Session(id),
    }
}

/// Cooperative shutdown signal for a running event loop.
///
/// Setting the flag and waking the poller unblocks the wait call; the loop
/// treats that as its normal exit path, not a fault.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// The reactor: listener, poller, session table, and broadcast policy.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: Slab<Session<TcpStream>>,
    relay: Relay,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    max_connections: usize,
    buffer_size: usize,
}

impl EventLoop {
    /// Bind the listening endpoint and wire up the poller.
    ///
    /// A failure here aborts startup; no partial state is left running.
    pub fn new(config: &Config, relay: Relay) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(bind_listener(addr)?);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            local_addr,
            sessions: Slab::with_capacity(config.max_connections),
            relay,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            max_connections: config.max_connections,
            buffer_size: config.buffer_size,
        })
    }

    /// The bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run until the shutdown handle fires, then release every session.
    pub fn run(&mut self) -> io::Result<()> {
        info!(addr = %self.local_addr, "Relay listening");

        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
                return Err(e);
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let ready: Vec<(Ready, bool, bool)> = self
                .events
                .iter()
                .map(|event| {
                    (
                        classify(event.token()),
                        event.is_readable(),
                        event.is_writable(),
                    )
                })
                .collect();

            for (kind, readable, writable) in ready {
                match kind {
                    Ready::Accept => self.accept_ready(),
                    Ready::Wake => {}
                    Ready::Session(id) => self.session_ready(id, readable, writable),
                }
            }
        }

        let ids: Vec<SessionId> = self.sessions.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.close_session(id);
        }
        info!("Relay shut down");
        Ok(())
    }

    /// Drain the accept queue.
    ///
    /// A failed accept attempt is logged and accepting continues; only the
    /// listener's own closure stops new connections.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if self.sessions.len() >= self.max_connections {
                        warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                        continue;
                    }

                    let session = Session::new(stream, peer_addr, self.buffer_size);
                    let id = self.sessions.insert(session);

                    match self.poll.registry().register(
                        self.sessions[id].transport_mut(),
                        Token(id),
                        Interest::READABLE,
                    ) {
                        Ok(()) => {
                            let session = &mut self.sessions[id];
                            session.establish();
                            self.relay.registry().add(id, session.name());
                            info!(conn_id = id, peer = %peer_addr, "Peer connected");
                        }
                        Err(e) => {
                            // Never became broadcast-visible; straight to Closed
                            error!(peer = %peer_addr, error = %e, "Failed to register connection");
                            let mut session = self.sessions.remove(id);
                            session.finish_close();
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn session_ready(&mut self, id: SessionId, readable: bool, writable: bool) {
        if !self.sessions.contains(id) {
            return;
        }

        if readable {
            if let Err(e) = self.handle_readable(id) {
                debug!(conn_id = id, error = %e, "Connection error");
                self.close_session(id);
            }
        }

        // May have been torn down while handling the read
        if !self.sessions.contains(id) {
            return;
        }

        if writable {
            if let Err(e) = self.handle_writable(id) {
                debug!(conn_id = id, error = %e, "Connection error");
                self.close_session(id);
            }
        }
    }

    /// Drain a readable session and relay every decoded line.
    fn handle_readable(&mut self, id: SessionId) -> io::Result<()> {
        let drain = self.sessions[id].drain()?;
        let sender_name = self.sessions[id].name().to_string();

        for line in &drain.lines {
            debug!(conn_id = id, from = %sender_name, message = %line, "Relaying");

            let dispatch = self.relay.dispatch(id, &sender_name, line);
            let delivery = self.relay.deliver(&dispatch, &mut self.sessions);

            for peer in delivery.pending {
                self.arm_write(peer);
            }
            for peer in delivery.failed {
                self.close_session(peer);
            }

            if dispatch.hangup {
                // Peers got the final line above; now the sender goes away
                info!(conn_id = id, peer = %sender_name, "Peer quit");
                self.close_session(id);
                return Ok(());
            }
        }

        if drain.eof {
            info!(conn_id = id, peer = %sender_name, "Peer disconnected");
            self.close_session(id);
        }

        Ok(())
    }

    /// Flush a session's pending output, dropping write interest once drained.
    fn handle_writable(&mut self, id: SessionId) -> io::Result<()> {
        if self.sessions[id].flush()? {
            let session = &mut self.sessions[id];
            self.poll
                .registry()
                .reregister(session.transport_mut(), Token(id), Interest::READABLE)?;
        }
        Ok(())
    }

    /// Ask to be told when a backed-up peer can take more bytes.
    fn arm_write(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if let Err(e) = self.poll.registry().reregister(
            session.transport_mut(),
            Token(id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!(conn_id = id, error = %e, "Failed to arm write interest");
            self.close_session(id);
        }
    }

    /// Tear down a session: unregister, deregister, release. Idempotent.
    fn close_session(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.try_remove(id) else {
            return;
        };

        self.relay.registry().remove(id);
        session.begin_close();
        let _ = self.poll.registry().deregister(session.transport_mut());
        session.finish_close();
        debug!(conn_id = id, peer = %session.peer_addr(), "Connection closed");
    }
}

/// Build the non-blocking listening socket.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::registry::SessionRegistry;
    use std::io::{BufRead, BufReader, ErrorKind, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Duration;

    struct TestRelay {
        addr: SocketAddr,
        shutdown: ShutdownHandle,
        handle: thread::JoinHandle<io::Result<()>>,
    }

    impl TestRelay {
        fn start() -> Self {
            let config = Config {
                listen: "127.0.0.1:0".to_string(),
                max_connections: 16,
                buffer_size: 1024,
                log_level: "info".to_string(),
            };
            let relay = Relay::new(Arc::new(SessionRegistry::new()));
            let mut event_loop = EventLoop::new(&config, relay).unwrap();
            let addr = event_loop.local_addr();
            let shutdown = event_loop.shutdown_handle();
            let handle = thread::spawn(move || event_loop.run());

            Self {
                addr,
                shutdown,
                handle,
            }
        }

        fn stop(self) {
            self.shutdown.shutdown();
            self.handle.join().unwrap().unwrap();
        }
    }

    struct Client {
        stream: StdTcpStream,
        reader: BufReader<StdTcpStream>,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = StdTcpStream::connect(addr).unwrap();
            stream.set_nodelay(true).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let reader = BufReader::new(stream.try_clone().unwrap());
            Self { stream, reader }
        }

        fn name(&self) -> String {
            format!("client-{}", self.stream.local_addr().unwrap().port())
        }

        fn send(&mut self, message: &str) {
            self.stream.write_all(message.as_bytes()).unwrap();
            self.stream.write_all(b"\n").unwrap();
        }

        fn recv(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line.trim_end().to_string()
        }

        /// Assert no line arrives within a short window.
        fn expect_silence(&mut self) {
            self.stream
                .set_read_timeout(Some(Duration::from_millis(200)))
                .unwrap();
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => panic!("unexpected EOF"),
                Ok(_) => panic!("unexpected line: {line:?}"),
                Err(e) => assert!(
                    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                    "unexpected error: {e}"
                ),
            }
            self.stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
        }

        fn expect_eof(&mut self) {
            let mut line = String::new();
            assert_eq!(self.reader.read_line(&mut line).unwrap(), 0);
        }
    }

    fn settle() {
        // Let the reactor register freshly accepted connections
        thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn test_three_client_scenario() {
        let relay = TestRelay::start();
        let mut a = Client::connect(relay.addr);
        let mut b = Client::connect(relay.addr);
        let mut c = Client::connect(relay.addr);
        settle();

        let a_name = a.name();
        let b_name = b.name();

        a.send("hello");
        assert_eq!(b.recv(), format!("{a_name}: hello"));
        assert_eq!(c.recv(), format!("{a_name}: hello"));
        a.expect_silence();

        b.send("quit");
        assert_eq!(a.recv(), format!("{b_name}: quit"));
        assert_eq!(c.recv(), format!("{b_name}: quit"));
        // The relay closes the quitting peer after its final broadcast
        b.expect_eof();
        settle();

        a.send("ping");
        assert_eq!(c.recv(), format!("{a_name}: ping"));
        a.expect_silence();

        relay.stop();
    }

    #[test]
    fn test_partial_and_merged_frames() {
        let relay = TestRelay::start();
        let mut a = Client::connect(relay.addr);
        let mut b = Client::connect(relay.addr);
        settle();

        let a_name = a.name();

        // A line split across two sends arrives as one message
        a.stream.write_all(b"par").unwrap();
        thread::sleep(Duration::from_millis(100));
        a.stream.write_all(b"tial\n").unwrap();
        assert_eq!(b.recv(), format!("{a_name}: partial"));

        // Two lines in one send arrive as two messages
        a.stream.write_all(b"one\ntwo\n").unwrap();
        assert_eq!(b.recv(), format!("{a_name}: one"));
        assert_eq!(b.recv(), format!("{a_name}: two"));

        relay.stop();
    }

    #[test]
    fn test_abrupt_disconnect_leaves_others_working() {
        let relay = TestRelay::start();
        let mut a = Client::connect(relay.addr);
        let b = Client::connect(relay.addr);
        let mut c = Client::connect(relay.addr);
        settle();

        let a_name = a.name();
        drop(b);
        settle();

        a.send("still here");
        assert_eq!(c.recv(), format!("{a_name}: still here"));

        relay.stop();
    }

    #[test]
    fn test_shutdown_closes_sessions() {
        let relay = TestRelay::start();
        let mut a = Client::connect(relay.addr);
        settle();

        relay.stop();
        a.expect_eof();
    }
}
