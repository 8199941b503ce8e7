//! Per-connection state machine driving connect -> hello -> idle <->
//! streaming, plus the alternative file-backed `DemoSource` driver behind
//! the same `Upstream` shell.

use std::{fmt, net::SocketAddr};

use gtv_network::{ConnState, Transport};
use gtv_timing::{Duration, Instant};
use gtv_utils::ArrayStr;
use mio::Token;
use tracing::{debug, trace, warn};

use crate::{
    channel::{Channel, DepositOutcome},
    config::Config,
    demo_source::{DemoError, DemoFrameOutcome, DemoSource},
    error::{DestroyReason, DropReason},
    framer::{Framer, FramerError, MessageOutcome},
    inflate::InflateAdapter,
    parser::GamestateParser,
    spectator::SpectatorSink,
    wire::{
        ClientHello, ClientOp, GTV_BACKOFF_STEP_MS, GTV_DEFAULT_BACKOFF_MS, GTV_MAXIMUM_BACKOFF_MS,
        GTV_PING_INTERVAL_MS, GtvFlags, MAX_STRINGCMD_LEN, MVD_MAGIC, PROTOCOL_VERSION, ServerHello,
        ServerOp, StreamStart, frame_command,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Preparing,
    Connected,
    Resuming,
    Waiting,
    Reading,
    Suspending,
}

/// Ranks states by "below/at-or-above Connected" (the dividing line for
/// reconnect backoff growth), not a meaningful total order otherwise.
fn below_connected_rank(s: UpstreamState) -> u8 {
    match s {
        UpstreamState::Disconnected => 0,
        UpstreamState::Connecting => 1,
        UpstreamState::Preparing => 2,
        UpstreamState::Connected => 3,
        UpstreamState::Resuming => 3,
        UpstreamState::Waiting => 3,
        UpstreamState::Reading => 3,
        UpstreamState::Suspending => 3,
    }
}

impl fmt::Display for UpstreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Preparing => "preparing",
            Self::Connected => "connected",
            Self::Resuming => "resuming",
            Self::Waiting => "waiting",
            Self::Reading => "reading",
            Self::Suspending => "suspending",
        };
        f.write_str(s)
    }
}

/// Structured outcome replacing the original's non-local escape out of
/// nested parse/dispatch code: `Registry::tick` applies this and moves on
/// to the next Upstream either way.
#[derive(Debug)]
pub enum TickOutcome {
    Ok,
    Drop(DropReason),
    Destroy(DestroyReason),
}

struct NetworkBackend {
    transport: Transport,
    framer: Framer,
    inflate: Option<InflateAdapter>,
    inflate_out: gtv_utils::RingBuffer,
}

enum Backend {
    Network(Box<NetworkBackend>),
    Demo(DemoSource),
}

pub struct Upstream {
    pub id: u32,
    pub name: ArrayStr<32>,
    pub address: ArrayStr<64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub state: UpstreamState,
    flags: GtvFlags,
    backend: Backend,
    last_rcvd: Instant,
    last_sent: Instant,
    last_drop: Instant,
    backoff: Duration,
    consecutive_sub_connected_drops: u32,
    /// Mirrors this Upstream's id once its Channel has been created; always
    /// `Some` in this implementation since the Channel is allocated eagerly
    /// alongside the Upstream (see DESIGN.md).
    channel_id: Option<u32>,
    shownet: bool,
}

fn clamp_backoff(d: Duration) -> Duration {
    let max = Duration::from_millis(GTV_MAXIMUM_BACKOFF_MS);
    if d > max { max } else { d }
}

impl Upstream {
    /// Begins a non-blocking connect to a network upstream. The Upstream
    /// starts in `Connecting`; call `run` every tick to drive it forward.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_network(
        mio_registry: &mio::Registry,
        id: u32,
        name: ArrayStr<32>,
        addr: SocketAddr,
        username: Option<String>,
        password: Option<String>,
        recv_capacity: usize,
        send_capacity: usize,
        shownet: bool,
    ) -> Result<Self, gtv_network::TransportError> {
        let mut transport = Transport::connect(addr, Token(id as usize), recv_capacity, send_capacity)?;
        if let Err(source) = transport.register(mio_registry) {
            return Err(gtv_network::TransportError::Connect { addr, source });
        }
        Ok(Self {
            id,
            name,
            address: ArrayStr::from_str_truncate(&addr.to_string()),
            username,
            password,
            state: UpstreamState::Connecting,
            flags: GtvFlags::empty(),
            backend: Backend::Network(Box::new(NetworkBackend {
                transport,
                framer: Framer::new(),
                inflate: None,
                inflate_out: gtv_utils::RingBuffer::new(recv_capacity),
            })),
            last_rcvd: Instant::now(),
            last_sent: Instant::now(),
            last_drop: Instant::ZERO,
            backoff: Duration::from_millis(GTV_DEFAULT_BACKOFF_MS),
            consecutive_sub_connected_drops: 0,
            channel_id: Some(id),
            shownet,
        })
    }

    /// Creates a file-playlist-driven Upstream; a DemoSource-backed Upstream
    /// has no transport.
    pub fn from_demo_source(id: u32, name: ArrayStr<32>, source: DemoSource) -> Self {
        Self {
            id,
            name,
            address: ArrayStr::from_str_truncate("<playlist>"),
            username: None,
            password: None,
            state: UpstreamState::Preparing,
            flags: GtvFlags::empty(),
            backend: Backend::Demo(source),
            last_rcvd: Instant::now(),
            last_sent: Instant::now(),
            last_drop: Instant::ZERO,
            backoff: Duration::from_millis(GTV_DEFAULT_BACKOFF_MS),
            consecutive_sub_connected_drops: 0,
            channel_id: Some(id),
            shownet: false,
        }
    }

    pub fn is_demo(&self) -> bool {
        matches!(self.backend, Backend::Demo(_))
    }

    pub fn channel_id(&self) -> Option<u32> {
        self.channel_id
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn reconnect_due(&self, now: Instant) -> bool {
        now.saturating_sub(self.last_drop) >= self.backoff
    }

    /// Reopens a transport after the reconnect backoff has elapsed. Only
    /// valid from `Disconnected` on a network Upstream.
    pub fn reopen(
        &mut self,
        mio_registry: &mio::Registry,
        addr: SocketAddr,
        recv_capacity: usize,
        send_capacity: usize,
    ) -> Result<(), gtv_network::TransportError> {
        let mut transport = Transport::connect(addr, Token(self.id as usize), recv_capacity, send_capacity)?;
        if let Err(source) = transport.register(mio_registry) {
            return Err(gtv_network::TransportError::Connect { addr, source });
        }
        if let Backend::Network(net) = &mut self.backend {
            net.transport = transport;
            net.framer = Framer::new();
            net.inflate = None;
        }
        self.state = UpstreamState::Connecting;
        Ok(())
    }

    /// Sends a bare PING to flush any pending server batch, used by the
    /// Channel's underflow recovery path (entering Waiting from Reading).
    /// A no-op on a demo-backed Upstream.
    pub fn ping(&mut self, mio_registry: &mio::Registry, now: Instant) {
        self.send_command(mio_registry, ClientOp::Ping, &[], now);
    }

    /// One frame tick. Drives the connection/playlist state machine forward
    /// and deposits at most the STREAM_DATA bodies that arrived this tick
    /// into `channel`. Never panics; every error path returns a
    /// [`TickOutcome`] for `Registry::tick` to apply.
    pub fn run(
        &mut self,
        mio_registry: &mio::Registry,
        channel: &mut Channel,
        parser: &mut impl GamestateParser,
        spectators: &mut impl SpectatorSink,
        active: bool,
        now: Instant,
        config: &Config,
    ) -> TickOutcome {
        if self.is_demo() {
            self.run_demo(channel, parser)
        } else {
            self.run_network(mio_registry, channel, parser, spectators, active, now, config)
        }
    }

    fn run_demo(&mut self, channel: &mut Channel, parser: &mut impl GamestateParser) -> TickOutcome {
        let Backend::Demo(source) = &mut self.backend else { unreachable!() };
        match source.read_frame(channel, parser) {
            Ok(DemoFrameOutcome::GamestateLoaded | DemoFrameOutcome::AdvancedFile) => {
                self.state = UpstreamState::Reading;
                TickOutcome::Ok
            }
            Ok(DemoFrameOutcome::Parsed(_)) => TickOutcome::Ok,
            Ok(DemoFrameOutcome::PlaylistExhausted) => {
                TickOutcome::Destroy(DestroyReason::FileIo("playlist exhausted".into()))
            }
            Err(err) => TickOutcome::Destroy(demo_error_to_destroy(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_network(
        &mut self,
        mio_registry: &mio::Registry,
        channel: &mut Channel,
        parser: &mut impl GamestateParser,
        spectators: &mut impl SpectatorSink,
        active: bool,
        now: Instant,
        config: &Config,
    ) -> TickOutcome {
        if self.state == UpstreamState::Connecting {
            let connect_result = {
                let Backend::Network(net) = &mut self.backend else { unreachable!() };
                net.transport.poll_connect(mio_registry)
            };
            match connect_result {
                Ok(ConnState::Connected) => {
                    if let Err(reason) = self.enter_preparing(mio_registry, now) {
                        return TickOutcome::Destroy(reason);
                    }
                }
                Ok(_) => return TickOutcome::Ok,
                Err(err) => return TickOutcome::Drop(DropReason::Transport(err.to_string())),
            }
        }

        let pump = {
            let Backend::Network(net) = &mut self.backend else { unreachable!() };
            net.transport.pump(mio_registry)
        };
        if pump.state == ConnState::Closed {
            return TickOutcome::Drop(DropReason::Transport("peer closed connection".into()));
        }
        if pump.bytes_received > 0 {
            self.last_rcvd = now;
            if self.shownet {
                trace!(upstream = %self.name, bytes = pump.bytes_received, "shownet: received");
            }
        }

        if let Err(outcome) =
            self.drain_messages(mio_registry, channel, parser, spectators, now, config)
        {
            return outcome;
        }

        if now.saturating_sub(self.last_rcvd) >= Duration::from_secs(config.timeout_secs) {
            return TickOutcome::Drop(DropReason::Timeout { seconds: config.timeout_secs });
        }

        if below_connected_rank(self.state) >= below_connected_rank(UpstreamState::Connected)
            && now.saturating_sub(self.last_sent) >= Duration::from_millis(GTV_PING_INTERVAL_MS)
        {
            self.send_command(mio_registry, ClientOp::Ping, &[], now);
        }

        if self.state == UpstreamState::Connected && active {
            self.enter_resuming(mio_registry, channel, now);
        } else if matches!(self.state, UpstreamState::Reading | UpstreamState::Waiting) && !active {
            self.send_command(mio_registry, ClientOp::StreamStop, &[], now);
            self.state = UpstreamState::Suspending;
        }

        TickOutcome::Ok
    }

    fn enter_preparing(&mut self, mio_registry: &mio::Registry, now: Instant) -> Result<(), DestroyReason> {
        let Backend::Network(net) = &mut self.backend else { unreachable!() };
        if net.transport.enqueue(mio_registry, &MVD_MAGIC).is_err() {
            return Err(DestroyReason::SendOverflow);
        }
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            flags: GtvFlags::STRINGCMDS | GtvFlags::DEFLATE,
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            version_string: env!("CARGO_PKG_VERSION").to_string(),
        };
        let framed = frame_command(ClientOp::Hello, &hello.encode());
        if net.transport.enqueue(mio_registry, &framed).is_err() {
            return Err(DestroyReason::SendOverflow);
        }
        self.state = UpstreamState::Preparing;
        self.last_sent = now;
        debug!(upstream = %self.name, "preparing: magic + hello sent");
        Ok(())
    }

    fn enter_resuming(&mut self, mio_registry: &mio::Registry, channel: &mut Channel, now: Instant) {
        let Backend::Network(net) = &mut self.backend else { unreachable!() };
        let maxbuf = 10u16.max((channel.min_packets() / 2) as u16);
        let payload = StreamStart { maxbuf }.encode();
        let framed = frame_command(ClientOp::StreamStart, &payload);
        let _ = net.transport.enqueue(mio_registry, &framed);
        self.state = UpstreamState::Resuming;
        self.last_sent = now;
        debug!(upstream = %self.name, maxbuf, "resuming: stream-start sent");
    }

    /// Drains every complete message currently buffered (through the
    /// optional inflate adapter) and dispatches it. Returns `Err` with the
    /// outcome the caller should return immediately on a fatal/drop path.
    fn drain_messages(
        &mut self,
        mio_registry: &mio::Registry,
        channel: &mut Channel,
        parser: &mut impl GamestateParser,
        spectators: &mut impl SpectatorSink,
        now: Instant,
        config: &Config,
    ) -> Result<(), TickOutcome> {
        loop {
            let mut scratch = Vec::new();
            let read_result = {
                let Backend::Network(net) = &mut self.backend else { unreachable!() };

                if net.inflate.is_some() {
                    let NetworkBackend { transport, framer, inflate, inflate_out } = net.as_mut();
                    if let Err(err) = inflate.as_mut().unwrap().pump(transport.recv(), inflate_out) {
                        return Err(TickOutcome::Destroy(DestroyReason::Inflate(err.to_string())));
                    }
                    framer.try_read_message(inflate_out, &mut scratch)
                } else {
                    let NetworkBackend { transport, framer, .. } = net.as_mut();
                    let recv = transport.recv();
                    if !framer.magic_validated() {
                        match framer.validate_magic(recv) {
                            Ok(true) => {}
                            Ok(false) => return Ok(()),
                            Err(_) => return Err(TickOutcome::Destroy(DestroyReason::BadMagic)),
                        }
                    }
                    framer.try_read_message(recv, &mut scratch)
                }
            };

            let outcome = match read_result {
                Ok(Some(outcome)) => outcome,
                Ok(None) => return Ok(()),
                Err(FramerError::BadMagic) => {
                    return Err(TickOutcome::Destroy(DestroyReason::BadMagic));
                }
                Err(FramerError::Oversize(n)) => {
                    return Err(TickOutcome::Destroy(DestroyReason::Oversize(n)));
                }
            };

            if outcome == MessageOutcome::EndOfStream {
                return Err(TickOutcome::Drop(DropReason::OrderlyClose));
            }

            self.dispatch(mio_registry, &scratch, channel, parser, spectators, now, config)?;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &mut self,
        mio_registry: &mio::Registry,
        payload: &[u8],
        channel: &mut Channel,
        parser: &mut impl GamestateParser,
        spectators: &mut impl SpectatorSink,
        now: Instant,
        config: &Config,
    ) -> Result<(), TickOutcome> {
        let _ = (spectators, config);
        let Some(&opcode_byte) = payload.first() else {
            return Err(TickOutcome::Destroy(DestroyReason::ReadPastEnd));
        };
        let Some(opcode) = ServerOp::from_byte(opcode_byte) else {
            return Err(TickOutcome::Destroy(DestroyReason::UnknownOpcode(opcode_byte)));
        };
        let body = &payload[1..];

        if self.shownet {
            trace!(upstream = %self.name, %opcode, len = body.len(), "shownet: message");
        }

        match opcode {
            ServerOp::Hello => self.on_hello(body),
            ServerOp::Pong => Ok(()),
            ServerOp::StreamStart => self.on_stream_start_ack(channel),
            ServerOp::StreamStop => self.on_stream_stop_ack(),
            ServerOp::StreamData => self.on_stream_data(mio_registry, body, channel, now),
            ServerOp::Error => {
                Err(TickOutcome::Destroy(DestroyReason::ServerError("server ERROR".into())))
            }
            ServerOp::BadRequest => Err(TickOutcome::Destroy(DestroyReason::BadRequest)),
            ServerOp::NoAccess => Err(TickOutcome::Destroy(DestroyReason::NoAccess)),
            ServerOp::Disconnect => Err(TickOutcome::Destroy(DestroyReason::ServerDisconnect)),
            ServerOp::Reconnect => Err(TickOutcome::Drop(DropReason::ServerReconnect)),
        }
    }

    fn on_hello(&mut self, body: &[u8]) -> Result<(), TickOutcome> {
        if self.state != UpstreamState::Preparing {
            return Err(TickOutcome::Destroy(DestroyReason::DuplicateHello));
        }
        let Some(hello) = ServerHello::decode(body) else {
            return Err(TickOutcome::Destroy(DestroyReason::UnexpectedTransition(
                "malformed server hello".into(),
            )));
        };
        self.flags = hello.flags;
        if hello.flags.contains(GtvFlags::DEFLATE) {
            let Backend::Network(net) = &mut self.backend else { unreachable!() };
            net.inflate = Some(InflateAdapter::new());
        }
        self.state = UpstreamState::Connected;
        debug!(upstream = %self.name, flags = ?self.flags, "connected: server hello received");
        Ok(())
    }

    fn on_stream_start_ack(&mut self, channel: &mut Channel) -> Result<(), TickOutcome> {
        if self.state != UpstreamState::Resuming {
            return Err(TickOutcome::Destroy(DestroyReason::UnexpectedTransition(format!(
                "stream-start ack while {}",
                self.state
            ))));
        }
        channel.enter_waiting_from_resuming();
        self.state = UpstreamState::Reading;
        debug!(upstream = %self.name, "reading: stream-start acked");
        Ok(())
    }

    fn on_stream_stop_ack(&mut self) -> Result<(), TickOutcome> {
        if self.state != UpstreamState::Suspending {
            return Err(TickOutcome::Destroy(DestroyReason::UnexpectedTransition(format!(
                "stream-stop ack while {}",
                self.state
            ))));
        }
        self.state = UpstreamState::Connected;
        debug!(upstream = %self.name, "connected: stream-stop acked");
        Ok(())
    }

    fn on_stream_data(
        &mut self,
        mio_registry: &mio::Registry,
        body: &[u8],
        channel: &mut Channel,
        now: Instant,
    ) -> Result<(), TickOutcome> {
        if !matches!(self.state, UpstreamState::Reading | UpstreamState::Waiting) {
            return Err(TickOutcome::Destroy(DestroyReason::UnexpectedTransition(format!(
                "stream-data while {}",
                self.state
            ))));
        }

        channel.record_incoming(body).ok();

        if body.is_empty() {
            if self.state == UpstreamState::Reading {
                self.state = UpstreamState::Waiting;
            }
            return Ok(());
        }

        if self.state == UpstreamState::Waiting {
            self.state = UpstreamState::Reading;
        }

        match channel.deposit_packet(body) {
            DepositOutcome::Written => Ok(()),
            DepositOutcome::Overflow => {
                warn!(upstream = %self.name, "overflow: cleared delay buffer, suspending");
                self.send_command(mio_registry, ClientOp::StreamStop, &[], now);
                self.state = UpstreamState::Suspending;
                Ok(())
            }
            DepositOutcome::FatalOverflow => {
                Err(TickOutcome::Destroy(DestroyReason::OverflowWhileWaiting))
            }
        }
    }

    fn send_command(&mut self, mio_registry: &mio::Registry, opcode: ClientOp, payload: &[u8], now: Instant) {
        let Backend::Network(net) = &mut self.backend else { return };
        let framed = frame_command(opcode, payload);
        let _ = net.transport.enqueue(mio_registry, &framed);
        self.last_sent = now;
    }

    /// Forwards a spectator's text command as STRINGCMD, gated on the
    /// negotiated STRINGCMDS flag, the 150-byte limit, and an empty send
    /// buffer.
    pub fn forward_stringcmd(&mut self, mio_registry: &mio::Registry, text: &str, now: Instant) -> bool {
        if !self.flags.contains(GtvFlags::STRINGCMDS) || text.len() > MAX_STRINGCMD_LEN {
            return false;
        }
        let Backend::Network(net) = &mut self.backend else { return false };
        if !net.transport.send_buffer_is_empty() {
            return false;
        }
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        let framed = frame_command(ClientOp::StringCmd, &payload);
        let sent = net.transport.enqueue(mio_registry, &framed).is_ok();
        if sent {
            self.last_sent = now;
        }
        sent
    }

    /// Closes the transport and records a recoverable drop: enters
    /// `Disconnected`, grows the reconnect backoff, and stamps `last_drop`
    /// so `reconnect_due` can be checked next tick.
    pub fn handle_drop(&mut self, mio_registry: &mio::Registry, reason: &DropReason, now: Instant) {
        warn!("{}", crate::error::format_drop(self.name.as_str(), reason));
        if let Backend::Network(net) = &mut self.backend {
            net.transport.close(mio_registry);
        }
        let below_connected = below_connected_rank(self.state) < below_connected_rank(UpstreamState::Connected);
        if below_connected {
            self.consecutive_sub_connected_drops += 1;
            let step = if self.consecutive_sub_connected_drops >= 2 {
                GTV_BACKOFF_STEP_MS * 2
            } else {
                GTV_BACKOFF_STEP_MS
            };
            self.backoff = clamp_backoff(self.backoff.saturating_add(Duration::from_millis(step)));
        } else {
            self.consecutive_sub_connected_drops = 0;
            self.backoff = Duration::from_millis(GTV_DEFAULT_BACKOFF_MS);
        }
        self.last_drop = now;
        self.state = UpstreamState::Disconnected;
    }
}

fn demo_error_to_destroy(err: &DemoError) -> DestroyReason {
    DestroyReason::FileIo(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_on_repeated_sub_connected_drops() {
        // Pure state-transition math, exercised without a real transport.
        let mut backoff = Duration::from_millis(GTV_DEFAULT_BACKOFF_MS);
        let mut consecutive = 0u32;
        for _ in 0..5 {
            consecutive += 1;
            let step = if consecutive >= 2 { GTV_BACKOFF_STEP_MS * 2 } else { GTV_BACKOFF_STEP_MS };
            backoff = clamp_backoff(backoff.saturating_add(Duration::from_millis(step)));
        }
        assert!(backoff <= Duration::from_millis(GTV_MAXIMUM_BACKOFF_MS));
    }

    #[test]
    fn below_connected_rank_splits_table_at_connected() {
        assert!(below_connected_rank(UpstreamState::Preparing) < below_connected_rank(UpstreamState::Connected));
        assert_eq!(below_connected_rank(UpstreamState::Reading), below_connected_rank(UpstreamState::Connected));
        assert!(below_connected_rank(UpstreamState::Disconnected) < below_connected_rank(UpstreamState::Connecting));
    }
}
