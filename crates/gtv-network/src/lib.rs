mod transport;

pub use transport::{ConnState, PumpOutcome, Transport, TransportError, set_socket_buf_size};
