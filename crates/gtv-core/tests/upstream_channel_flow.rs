//! End-to-end scenarios against a real loopback socket playing the server
//! side of the wire protocol by hand, in the style of `flux-network`'s
//! `tests/tcp_broadcast_burst.rs`: a thread-spawned peer, deadline-based
//! polling loops, and plain `assert!`/`assert_eq!`.

use std::{
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    path::Path,
    thread,
    time::{Duration as StdDuration, Instant as StdInstant},
};

use gtv_core::{Config, Registry, parser::AcceptingParser, spectator::NullSpectatorSink, wire::MVD_MAGIC};
use gtv_timing::Instant;

const HELLO: u8 = 0;
const STREAM_START: u8 = 2;
const STREAM_DATA: u8 = 4;

fn write_record(stream: &mut TcpStream, opcode: u8, body: &[u8]) {
    let len = (body.len() + 1) as u16;
    stream.write_all(&len.to_le_bytes()).unwrap();
    stream.write_all(&[opcode]).unwrap();
    stream.write_all(body).unwrap();
}

fn read_record(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).unwrap();
    let len = u16::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (body[0], body[1..].to_vec())
}

fn accept_hello(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().unwrap();
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).unwrap();
    assert_eq!(&magic, &MVD_MAGIC, "client did not send the magic preamble first");
    let (opcode, _hello_body) = read_record(&mut stream);
    assert_eq!(opcode, HELLO, "expected a client hello as the first framed record");
    stream.write_all(&MVD_MAGIC).unwrap();
    write_record(&mut stream, HELLO, &0u32.to_le_bytes()); // no DEFLATE negotiated
    stream
}

fn accept_stream_start(stream: &mut TcpStream) {
    let (opcode, _) = read_record(stream);
    assert_eq!(opcode, STREAM_START, "expected a stream-start request once active");
    write_record(stream, STREAM_START, &[]); // ack, same opcode, empty body
}

fn tick_until(
    registry: &mut Registry,
    mio_registry: &mio::Registry,
    predicate: impl Fn(&Registry) -> bool,
    timeout: StdDuration,
) {
    let mut parser = AcceptingParser::default();
    let mut spectators = NullSpectatorSink::default();
    let deadline = StdInstant::now() + timeout;
    loop {
        registry.tick(mio_registry, &mut parser, &mut spectators, Instant::now());
        if predicate(registry) {
            return;
        }
        assert!(StdInstant::now() < deadline, "timed out waiting for condition");
        thread::sleep(StdDuration::from_millis(5));
    }
}

fn channel_state_str(registry: &Registry) -> Option<String> {
    registry.channels().next().map(|(_, c)| c.state.to_string())
}

fn upstream_state_str(registry: &Registry) -> Option<String> {
    registry.servers().next().map(|(_, u)| u.state.to_string())
}

#[test]
fn cold_connect_reads_five_frames_then_idles_in_reading() {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = listener.local_addr().unwrap();

    let _server = thread::spawn(move || {
        let mut stream = accept_hello(&listener);
        accept_stream_start(&mut stream);
        for i in 0..5u8 {
            write_record(&mut stream, STREAM_DATA, &[i; 8]);
        }
        // Hold the connection open past the burst so pump() never observes
        // Closed in the same read as the final frame (see gtv-network's
        // fill_recv/pump contract).
        let _ = stream.read(&mut [0u8; 1]);
    });

    let config = Config { wait_delay_tenths: 0, ..Config::default() };
    let poll = mio::Poll::new().unwrap();
    let mio_registry = poll.registry();
    let mut registry = Registry::new(config);
    registry.connect(mio_registry, addr, "test", None, None, 64 * 1024, 16 * 1024).unwrap();
    registry.note_attached_clients(1, Instant::now());

    tick_until(
        &mut registry,
        mio_registry,
        |r| r.channels().next().is_some_and(|(_, c)| c.num_packets() == 0 && c.overflows() == 0) &&
            channel_state_str(r).as_deref() == Some("READ"),
        StdDuration::from_secs(5),
    );

    assert_eq!(upstream_state_str(&registry).as_deref(), Some("reading"));
    let (_, channel) = registry.channels().next().unwrap();
    assert_eq!(channel.num_packets(), 0, "all five frames should have drained");
}

#[test]
fn idle_without_attached_clients_never_leaves_connected() {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = listener.local_addr().unwrap();

    let _server = thread::spawn(move || {
        let mut stream = accept_hello(&listener);
        let _ = stream.read(&mut [0u8; 1]);
    });

    // suspend_time_mins=0 makes `active` false the instant no client has
    // attached, so the Upstream should never send a stream-start.
    let config = Config { suspend_time_mins: 0, ..Config::default() };
    let poll = mio::Poll::new().unwrap();
    let mio_registry = poll.registry();
    let mut registry = Registry::new(config);
    registry.connect(mio_registry, addr, "idle", None, None, 64 * 1024, 16 * 1024).unwrap();

    tick_until(
        &mut registry,
        mio_registry,
        |r| upstream_state_str(r).as_deref() == Some("connected"),
        StdDuration::from_secs(5),
    );

    // A few more ticks shouldn't move it past Connected.
    for _ in 0..20 {
        registry.tick(
            mio_registry,
            &mut AcceptingParser::default(),
            &mut NullSpectatorSink::default(),
            Instant::now(),
        );
        thread::sleep(StdDuration::from_millis(5));
    }
    assert_eq!(upstream_state_str(&registry).as_deref(), Some("connected"));
}

#[test]
fn overflow_while_reading_suspends_and_sends_stream_stop() {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = listener.local_addr().unwrap();

    let _server = thread::spawn(move || {
        let mut stream = accept_hello(&listener);
        accept_stream_start(&mut stream);
        // Three near-capacity frames against a 2-unit (32768-byte) delay
        // buffer: the third cannot fit and forces an overflow.
        let payload = vec![0xAAu8; 16_000];
        for _ in 0..3 {
            write_record(&mut stream, STREAM_DATA, &payload);
        }
        // Read back the STREAM_STOP the client owes us once it suspends.
        let (opcode, _) = read_record(&mut stream);
        assert_eq!(opcode, 3, "expected a stream-stop after overflow");
    });

    let config = Config { wait_delay_tenths: 0, buffer_size_units: 2, ..Config::default() };
    let poll = mio::Poll::new().unwrap();
    let mio_registry = poll.registry();
    let mut registry = Registry::new(config);
    registry.connect(mio_registry, addr, "overflow", None, None, 64 * 1024, 16 * 1024).unwrap();
    registry.note_attached_clients(1, Instant::now());

    tick_until(
        &mut registry,
        mio_registry,
        |r| upstream_state_str(r).as_deref() == Some("suspending"),
        StdDuration::from_secs(5),
    );

    let (_, channel) = registry.channels().next().unwrap();
    assert_eq!(channel.overflows(), 1);
    assert_eq!(channel.num_packets(), 0);
    assert_eq!(channel.state.to_string(), "WAIT");
}

fn write_demo_file(path: &Path, records: &[&[u8]]) {
    use gtv_core::fileio::DemoWriter;
    let mut w = DemoWriter::create(path, false).unwrap();
    w.write_all(&MVD_MAGIC).unwrap();
    for r in records {
        w.write_all(&(r.len() as u16).to_le_bytes()).unwrap();
        w.write_all(r).unwrap();
    }
    w.write_all(&0u16.to_le_bytes()).unwrap();
}

#[test]
fn demo_playlist_loops_twice_then_destroys_upstream() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.mvd2");
    let b = dir.path().join("b.mvd2");
    write_demo_file(&a, &[b"gamestate-a", b"frame-a1"]);
    write_demo_file(&b, &[b"gamestate-b", b"frame-b1"]);

    let poll = mio::Poll::new().unwrap();
    let mio_registry = poll.registry();
    let mut registry = Registry::new(Config::default());
    let id = registry.play(vec![a, b], "playlist", 2).unwrap();

    tick_until(
        &mut registry,
        mio_registry,
        |r| r.servers().next().is_none(),
        StdDuration::from_secs(5),
    );

    assert!(registry.channels().next().is_none(), "an unpromoted demo Channel should die with its Upstream");
    assert!(!registry.servers().any(|(&sid, _)| sid == id));
}

#[test]
fn silent_upstream_times_out_to_disconnected_with_grown_backoff() {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = listener.local_addr().unwrap();

    // timeout_secs=0: the very first post-connect tick already exceeds it.
    let config = Config { timeout_secs: 0, ..Config::default() };
    let poll = mio::Poll::new().unwrap();
    let mio_registry = poll.registry();
    let mut registry = Registry::new(config);
    registry.connect(mio_registry, addr, "silent", None, None, 64 * 1024, 16 * 1024).unwrap();

    let default_backoff = gtv_timing::Duration::from_millis(5_000);
    tick_until(
        &mut registry,
        mio_registry,
        |r| upstream_state_str(r).as_deref() == Some("disconnected"),
        StdDuration::from_secs(5),
    );

    let (_, upstream) = registry.servers().next().unwrap();
    assert!(upstream.backoff() > default_backoff, "a sub-Connected drop should grow the backoff past the default");
}
