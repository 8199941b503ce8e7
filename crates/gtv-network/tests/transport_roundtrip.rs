use std::{
    io::Read,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    time::Duration,
};

use gtv_network::{ConnState, Transport};
use mio::{Events, Interest, Poll, Token};

const CLIENT: Token = Token(0);

fn wait_writable(poll: &mut Poll, events: &mut Events, token: Token) {
    for _ in 0..200 {
        poll.poll(events, Some(Duration::from_millis(50))).unwrap();
        if events.iter().any(|e| e.token() == token && e.is_writable()) {
            return;
        }
    }
    panic!("timed out waiting for writable event");
}

#[test]
fn connect_then_send_reaches_peer() {
    let listener = TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();

    let mut poll = Poll::new().unwrap();
    let mut events = Events::with_capacity(16);

    let mut transport = Transport::connect(addr, CLIENT, 4096, 4096).expect("connect");
    transport.register(poll.registry()).unwrap();
    assert_eq!(transport.state(), ConnState::Connecting);

    wait_writable(&mut poll, &mut events, CLIENT);
    transport.run_connect(poll.registry()).expect("run_connect");
    assert_eq!(transport.state(), ConnState::Connected);

    let (mut accepted, _) = listener.accept().expect("accept");

    transport.enqueue(poll.registry(), b"hello upstream").expect("enqueue");

    let mut received = [0u8; 14];
    accepted.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    accepted.read_exact(&mut received).expect("peer read");
    assert_eq!(&received, b"hello upstream");
}

#[test]
fn recv_ring_buffer_fills_on_readable_event() {
    let listener = TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();

    let mut poll = Poll::new().unwrap();
    let mut events = Events::with_capacity(16);

    let mut transport = Transport::connect(addr, CLIENT, 4096, 4096).expect("connect");
    transport.register(poll.registry()).unwrap();
    wait_writable(&mut poll, &mut events, CLIENT);
    transport.run_connect(poll.registry()).expect("run_connect");

    let (mut accepted, _) = listener.accept().expect("accept");
    std::io::Write::write_all(&mut accepted, b"payload-bytes").unwrap();

    let mut saw_data = false;
    for _ in 0..200 {
        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        for event in events.iter() {
            if event.token() == CLIENT {
                transport.run_stream(poll.registry(), event);
            }
        }
        if transport.recv().len() == b"payload-bytes".len() {
            saw_data = true;
            break;
        }
    }
    assert!(saw_data, "never observed the peer's bytes in recv ring buffer");
    assert_eq!(transport.recv().peek_all(), b"payload-bytes");
}

#[test]
fn send_overflow_fails_as_a_unit() {
    let listener = TcpListener::bind(SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)))
        .expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();

    let mut poll = Poll::new().unwrap();
    let mut events = Events::with_capacity(16);

    let mut transport = Transport::connect(addr, CLIENT, 4096, 8).expect("connect");
    transport.register(poll.registry()).unwrap();
    wait_writable(&mut poll, &mut events, CLIENT);
    transport.run_connect(poll.registry()).expect("run_connect");

    assert!(transport.enqueue(poll.registry(), b"way too many bytes for this buffer").is_err());
}
