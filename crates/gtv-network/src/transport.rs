use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};

use gtv_utils::RingBuffer;
use mio::{Interest, Registry, Token, event::Event, net::TcpStream as MioTcpStream};
use thiserror::Error;
use tracing::debug;

/// Non-blocking single-connection transport.
///
/// Mirrors the state machine a caller drives a socket through: `Connecting`
/// until the non-blocking connect resolves, `Connected` while bytes flow
/// through `recv`/`send`, `Closed` once the peer hangs up or a fatal I/O
/// error occurs. The caller owns the `mio::Poll`/`Token` registration and
/// hands each readiness `Event` to [`Transport::run_stream`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, #[source] source: io::Error },
    #[error("send ring buffer overflow")]
    SendOverflow,
}

const READ_CHUNK: usize = 4096;

/// Result of one [`Transport::pump`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOutcome {
    pub state: ConnState,
    /// Bytes newly appended to `recv` this call (0 if none arrived).
    pub bytes_received: usize,
}

pub struct Transport {
    stream: MioTcpStream,
    peer_addr: SocketAddr,
    token: Token,
    state: ConnState,
    recv: RingBuffer,
    send: RingBuffer,
    writable_armed: bool,
}

impl Transport {
    /// Begins a non-blocking connect. The returned transport is in
    /// `Connecting` state; register it with a `Poll` and call
    /// [`Transport::run_connect`] once a writable event arrives for `token`.
    pub fn connect(
        addr: SocketAddr,
        token: Token,
        recv_capacity: usize,
        send_capacity: usize,
    ) -> Result<Self, TransportError> {
        let stream = MioTcpStream::connect(addr)
            .map_err(|source| TransportError::Connect { addr, source })?;
        Ok(Self {
            stream,
            peer_addr: addr,
            token,
            state: ConnState::Connecting,
            recv: RingBuffer::new(recv_capacity),
            send: RingBuffer::new(send_capacity),
            writable_armed: true,
        })
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Resolves a pending non-blocking connect once its writable event
    /// fires. Returns the new state; `Closed` means the connect failed and
    /// the transport should be discarded.
    pub fn run_connect(&mut self, registry: &Registry) -> io::Result<ConnState> {
        if let Some(err) = self.stream.take_error()? {
            self.state = ConnState::Closed;
            return Err(err);
        }
        self.state = ConnState::Connected;
        registry.reregister(&mut self.stream, self.token, Interest::READABLE)?;
        self.writable_armed = false;
        Ok(self.state)
    }

    /// Non-blocking connect check for a caller that ticks every transport
    /// once per frame instead of waiting on `mio` readiness events (a
    /// frame-tick host has no event to hand in). A no-op once the
    /// transport has left `Connecting`.
    pub fn poll_connect(&mut self, registry: &Registry) -> io::Result<ConnState> {
        if self.state != ConnState::Connecting {
            return Ok(self.state);
        }
        if let Some(err) = self.stream.take_error()? {
            self.state = ConnState::Closed;
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.state = ConnState::Connected;
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)?;
                self.writable_armed = false;
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(err) => {
                self.state = ConnState::Closed;
                return Err(err);
            }
        }
        Ok(self.state)
    }

    /// Attempts a non-blocking fill of `recv` and drain of `send` without
    /// requiring a caller-supplied `mio::Event`. A frame-tick host simply
    /// calls this once per `Upstream` per tick, with no suspension points
    /// visible to the caller, rather than polling `mio` for readiness and
    /// dispatching by token.
    pub fn pump(&mut self, registry: &Registry) -> PumpOutcome {
        let before = self.recv.len();
        if self.fill_recv() == ConnState::Closed {
            return PumpOutcome { state: ConnState::Closed, bytes_received: 0 };
        }
        let bytes_received = self.recv.len().saturating_sub(before);
        let state = self.drain_send(registry);
        PumpOutcome { state, bytes_received }
    }

    /// Pumps one readiness event: fills `recv` from the socket and drains
    /// `send` to it. Returns `Closed` if the peer disconnected or a fatal
    /// I/O error occurred; the caller must not use the transport again.
    pub fn run_stream(&mut self, registry: &Registry, event: &Event) -> ConnState {
        if event.is_readable() && self.fill_recv() == ConnState::Closed {
            return ConnState::Closed;
        }
        if (event.is_writable() || !self.send.is_empty())
            && self.drain_send(registry) == ConnState::Closed
        {
            return ConnState::Closed;
        }
        self.state
    }

    fn fill_recv(&mut self) -> ConnState {
        loop {
            let avail = self.recv.available();
            if avail == 0 {
                break;
            }
            let mut chunk = [0u8; READ_CHUNK];
            let want = avail.min(chunk.len());
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.state = ConnState::Closed;
                    return self.state;
                }
                Ok(n) => {
                    let wrote = self.recv.write(&chunk[..n]);
                    debug_assert!(wrote, "recv capacity checked via available() above");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, peer = %self.peer_addr, "transport: read failed");
                    self.state = ConnState::Closed;
                    return self.state;
                }
            }
        }
        self.state
    }

    fn drain_send(&mut self, registry: &Registry) -> ConnState {
        while !self.send.is_empty() {
            let chunk = self.send.peek_all();
            match self.stream.write(chunk) {
                Ok(0) => {
                    self.state = ConnState::Closed;
                    return self.state;
                }
                Ok(n) => self.send.commit(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, peer = %self.peer_addr, "transport: write failed");
                    self.state = ConnState::Closed;
                    return self.state;
                }
            }
        }

        let want_writable = !self.send.is_empty();
        if want_writable != self.writable_armed {
            let interest =
                if want_writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
            if let Err(err) = registry.reregister(&mut self.stream, self.token, interest) {
                debug!(?err, peer = %self.peer_addr, "transport: reregister failed");
                self.state = ConnState::Closed;
                return self.state;
            }
            self.writable_armed = want_writable;
        }
        self.state
    }

    /// Queues `data` for transmission, attempting an immediate drain. Fails
    /// as a unit if the send ring buffer has no room.
    pub fn enqueue(&mut self, registry: &Registry, data: &[u8]) -> Result<(), TransportError> {
        if !self.send.write(data) {
            return Err(TransportError::SendOverflow);
        }
        self.drain_send(registry);
        Ok(())
    }

    /// Read-only access to the receive ring buffer, for a Framer/
    /// InflateAdapter to peek/commit against.
    pub fn recv(&mut self) -> &mut RingBuffer {
        &mut self.recv
    }

    /// Whether the outbound ring buffer currently has no queued bytes, used
    /// to gate opportunistic sends like spectator STRINGCMD forwarding.
    pub fn send_buffer_is_empty(&self) -> bool {
        self.send.is_empty()
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = ConnState::Closed;
    }
}

/// Sets kernel `SO_SNDBUF`/`SO_RCVBUF` on a mio TCP stream.
pub fn set_socket_buf_size(stream: &MioTcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
