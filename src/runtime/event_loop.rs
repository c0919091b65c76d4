//! Readiness-polling event loop.
//!
//! One thread, one `mio::Poll`: the listening socket and every client
//! socket are registered for readability, and each round dispatches
//! whatever the poll reports: accepts on the listener token, echo cycles
//! on connection tokens. The registry is only ever touched from this
//! thread, so no synchronization is needed around it.
//!
//! Readiness here is edge-triggered (epoll/kqueue via mio), so each event
//! is drained: accepts loop until `WouldBlock`, and a readable client is
//! read chunk by chunk until `WouldBlock`. Every chunk still gets exactly
//! one marker-prefixed reply.
//!
//! Shutdown is an explicit flag paired with a `Waker`; the loop observes
//! it between rounds, then closes client connections in arrival order
//! before closing the listener.

use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::echo::{self, EchoOutcome};
use crate::runtime::listener::BoundListener;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Ready-event batch size per poll round.
const EVENTS_CAPACITY: usize = 128;

/// The connection-multiplexing core of the server.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    /// Reusable read buffer; its length bounds the chunk size.
    chunk: Vec<u8>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

/// Requests a clean stop of a running [`EventLoop`] from another thread
/// or a signal handler. Setting the flag and waking the poll are both
/// async-signal-safe.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl EventLoop {
    /// Register the listening socket and prepare the poll.
    pub fn new(bound: BoundListener, chunk_size: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = bound.listener;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            local_addr: bound.local_addr,
            registry: ConnectionRegistry::new(),
            chunk: vec![0; chunk_size],
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run until a shutdown request is observed.
    ///
    /// Per-connection failures are absorbed: the offending connection is
    /// removed and closed, the loop keeps going. Only poll failures on
    /// the loop itself escalate.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(addr = %self.local_addr, "Server listening");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        // Shutdown flag is checked at the top of the loop.
                    }
                    LISTENER_TOKEN => {
                        if !self.shutdown.load(Ordering::SeqCst) {
                            self.accept_ready();
                        }
                    }
                    Token(key) => {
                        // A stale token can arrive for a connection removed
                        // earlier in this round.
                        if self.registry.contains(key) {
                            self.serve_client(key);
                        }
                    }
                }
            }
        }

        self.shutdown_all()
    }

    /// Drain the accept queue for one listener readiness event.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let key = self.registry.insert(stream, peer);
                    let registered = match self.registry.get_mut(key) {
                        Some(conn) => {
                            match self.poll.registry().register(
                                &mut conn.stream,
                                Token(key),
                                Interest::READABLE,
                            ) {
                                Ok(()) => {
                                    info!(conn = conn.serial, peer = %conn.peer, "New connection");
                                    true
                                }
                                Err(e) => {
                                    warn!(error = %e, "Failed to register accepted connection");
                                    false
                                }
                            }
                        }
                        None => false,
                    };
                    if !registered {
                        self.registry.remove(key);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient accept failure; no connection was registered.
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    /// Drain one client readiness event, echoing chunk by chunk.
    fn serve_client(&mut self, key: usize) {
        loop {
            let Some(conn) = self.registry.get_mut(key) else {
                return;
            };
            let serial = conn.serial;

            match echo::serve_ready(&mut conn.stream, &mut self.chunk) {
                Ok(EchoOutcome::Echoed(n)) => {
                    debug!(conn = serial, bytes = n, "Echoed chunk");
                }
                Ok(EchoOutcome::Idle) => return,
                Ok(EchoOutcome::Closed) => {
                    info!(conn = serial, "Lost connection");
                    self.close_connection(key);
                    return;
                }
                Err(e) => {
                    debug!(conn = serial, error = %e, "Connection error");
                    info!(conn = serial, "Lost connection");
                    self.close_connection(key);
                    return;
                }
            }
        }
    }

    fn close_connection(&mut self, key: usize) {
        if let Some(mut conn) = self.registry.remove(key) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            // Dropping the stream closes the socket.
        }
    }

    /// Close every client connection in arrival order, then the listener.
    fn shutdown_all(mut self) -> io::Result<()> {
        info!(open_connections = self.registry.len(), "Shutdown initiated");

        for mut conn in self.registry.drain() {
            info!(conn = conn.serial, "Closing connection");
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }

        let _ = self.poll.registry().deregister(&mut self.listener);
        info!(addr = %self.local_addr(), "Server socket closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::echo::REPLY_MARKER;
    use crate::runtime::listener;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn start_server(chunk_size: usize) -> (SocketAddr, ShutdownHandle, JoinHandle<io::Result<()>>) {
        let bound = listener::acquire("127.0.0.1", 0, 5).unwrap();
        let event_loop = EventLoop::new(bound, chunk_size).unwrap();
        let addr = event_loop.local_addr();
        let handle = event_loop.shutdown_handle();
        let join = thread::spawn(move || event_loop.run());
        (addr, handle, join)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn test_hello_round_trip() {
        let (addr, handle, join) = start_server(4096);

        let mut client = connect(addr);
        client.write_all(b"hello").unwrap();

        let mut reply = [0u8; 15];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"you sent: hello");

        handle.request();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_two_clients_receive_their_own_echo() {
        let (addr, handle, join) = start_server(4096);

        let mut a = connect(addr);
        let mut b = connect(addr);

        a.write_all(b"alpha").unwrap();
        b.write_all(b"bravo").unwrap();

        let mut reply_a = [0u8; 15];
        a.read_exact(&mut reply_a).unwrap();
        assert_eq!(&reply_a, b"you sent: alpha");

        let mut reply_b = [0u8; 15];
        b.read_exact(&mut reply_b).unwrap();
        assert_eq!(&reply_b, b"you sent: bravo");

        handle.request();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_burst_larger_than_chunk_partitions_into_replies() {
        let (addr, handle, join) = start_server(8);

        let mut client = connect(addr);
        client.write_all(&[b'z'; 20]).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        // Server echoes every chunk, sees EOF, closes; read the lot.
        let mut replies = Vec::new();
        client.read_to_end(&mut replies).unwrap();

        // Every reply starts with the marker; reassembling the chunks must
        // give back the original bytes with nothing lost or duplicated.
        let mut payload = Vec::new();
        let mut markers = 0;
        let mut rest = &replies[..];
        while !rest.is_empty() {
            assert!(rest.starts_with(REPLY_MARKER), "reply missing marker");
            markers += 1;
            rest = &rest[REPLY_MARKER.len()..];
            let next = rest
                .windows(REPLY_MARKER.len())
                .position(|w| w == REPLY_MARKER)
                .unwrap_or(rest.len());
            payload.extend_from_slice(&rest[..next]);
            rest = &rest[next..];
        }
        assert_eq!(payload, vec![b'z'; 20]);
        // Each read is capped at 8 bytes, so 20 bytes takes at least 3.
        assert!(markers >= 3, "expected at least 3 chunked replies");

        handle.request();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_client_fin_does_not_disturb_the_loop() {
        let (addr, handle, join) = start_server(4096);

        let mut first = connect(addr);
        first.write_all(b"ping").unwrap();
        let mut reply = [0u8; 14];
        first.read_exact(&mut reply).unwrap();
        drop(first);

        // The loop keeps serving after the disconnect.
        let mut second = connect(addr);
        second.write_all(b"pong").unwrap();
        second.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"you sent: pong");

        handle.request();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        let (addr, handle, join) = start_server(4096);

        let mut client = connect(addr);
        client.write_all(b"hi").unwrap();
        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).unwrap();

        handle.request();
        join.join().unwrap().unwrap();

        // Server closed our connection on its way out.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        // And the listener is gone.
        assert!(TcpStream::connect(addr).is_err());
    }
}
