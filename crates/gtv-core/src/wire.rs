//! Wire framing shared by the network protocol and the on-disk demo format.
//!
//! Both forms are: a 4-byte magic preamble, then `(u16 length LE, payload)`
//! records, terminated by a zero-length record. The network form's payload
//! begins with an opcode byte (see [`ServerOp`]/[`ClientOp`]); the file
//! form's payload is a complete parser message with no opcode.

use std::fmt;

/// Fixed 32-bit preamble written big-endian at the start of every fresh
/// connection and every demo file. Chosen as the ASCII bytes `"MVD2"`; the
/// original C source this was ported from left the exact constant
/// unspecified (see DESIGN.md).
pub const MVD_MAGIC: [u8; 4] = *b"MVD2";

/// Largest permitted record payload. A length greater than this is a fatal
/// protocol violation; chosen as the value DESIGN.md records since the
/// original source did not retrieve a definition.
pub const MAX_MSGLEN: usize = 16_384;

/// Default reconnect backoff, milliseconds.
pub const GTV_DEFAULT_BACKOFF_MS: u64 = 5_000;
/// Backoff ceiling, milliseconds (5 hours).
pub const GTV_MAXIMUM_BACKOFF_MS: u64 = 5 * 3_600 * 1_000;
/// Keep-alive PING cadence, milliseconds.
pub const GTV_PING_INTERVAL_MS: u64 = 60_000;
/// Backoff growth applied on a drop below `Connected`.
pub const GTV_BACKOFF_STEP_MS: u64 = 15_000;

/// Client hello protocol version. The original source did not retrieve a
/// concrete value; chosen arbitrarily and recorded in DESIGN.md.
pub const PROTOCOL_VERSION: u16 = 4;

/// Server-to-client opcodes. Any byte not matching one of these is a fatal
/// protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOp {
    Hello = 0,
    Pong = 1,
    StreamStart = 2,
    StreamStop = 3,
    StreamData = 4,
    Error = 5,
    BadRequest = 6,
    NoAccess = 7,
    Disconnect = 8,
    Reconnect = 9,
}

impl ServerOp {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Hello,
            1 => Self::Pong,
            2 => Self::StreamStart,
            3 => Self::StreamStop,
            4 => Self::StreamData,
            5 => Self::Error,
            6 => Self::BadRequest,
            7 => Self::NoAccess,
            8 => Self::Disconnect,
            9 => Self::Reconnect,
            _ => return None,
        })
    }
}

impl fmt::Display for ServerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hello => "hello",
            Self::Pong => "pong",
            Self::StreamStart => "stream_start",
            Self::StreamStop => "stream_stop",
            Self::StreamData => "stream_data",
            Self::Error => "error",
            Self::BadRequest => "badrequest",
            Self::NoAccess => "noaccess",
            Self::Disconnect => "disconnect",
            Self::Reconnect => "reconnect",
        };
        f.write_str(s)
    }
}

/// Client-to-server opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOp {
    Hello = 0,
    Ping = 1,
    StreamStart = 2,
    StreamStop = 3,
    StringCmd = 4,
}

bitflags::bitflags! {
    /// Negotiated connection options, set in the client hello and echoed
    /// (DEFLATE only) in the server hello response.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct GtvFlags: u32 {
        /// Client may forward spectator text as STRINGCMD.
        const STRINGCMDS = 1 << 0;
        /// Stream is deflate-compressed past the hello exchange.
        const DEFLATE = 1 << 1;
    }
}

/// Client hello payload: `u16 protocol_version, u32 flags, u32 reserved,
/// cstr username, cstr password, cstr version_string`.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub protocol_version: u16,
    pub flags: GtvFlags,
    pub username: String,
    pub password: String,
    pub version_string: String,
}

impl ClientHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.username.len() + self.password.len());
        out.extend_from_slice(&self.protocol_version.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        push_cstr(&mut out, &self.username);
        push_cstr(&mut out, &self.password);
        push_cstr(&mut out, &self.version_string);
        out
    }
}

/// Server hello response body: `u32 flags`.
#[derive(Debug, Clone, Copy)]
pub struct ServerHello {
    pub flags: GtvFlags,
}

impl ServerHello {
    pub fn decode(body: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = body.get(..4)?.try_into().ok()?;
        Some(Self { flags: GtvFlags::from_bits_truncate(u32::from_le_bytes(bytes)) })
    }
}

/// Stream-start payload: `u16 maxbuf`.
#[derive(Debug, Clone, Copy)]
pub struct StreamStart {
    pub maxbuf: u16,
}

impl StreamStart {
    pub fn encode(&self) -> Vec<u8> {
        self.maxbuf.to_le_bytes().to_vec()
    }
}

/// Maximum text length a spectator's forwarded command may carry: a text
/// argument of at most 150 bytes.
pub const MAX_STRINGCMD_LEN: usize = 150;

fn push_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

/// Prepends the 3-byte outbound command header `(u16 length LE, u8 opcode)`
/// to `payload` and returns the full framed command, where `length` includes
/// the opcode byte.
pub fn frame_command(opcode: ClientOp, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() + 1) as u16;
    let mut out = Vec::with_capacity(3 + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.push(opcode as u8);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_roundtrips_field_order() {
        let hello = ClientHello {
            protocol_version: 2009,
            flags: GtvFlags::STRINGCMDS,
            username: "spec".into(),
            password: "tate".into(),
            version_string: "gtv-core/0.1".into(),
        };
        let bytes = hello.encode();
        assert_eq!(&bytes[0..2], &2009u16.to_le_bytes());
        assert_eq!(&bytes[2..6], &GtvFlags::STRINGCMDS.bits().to_le_bytes());
        assert_eq!(&bytes[6..10], &0u32.to_le_bytes());
        assert!(bytes[10..].starts_with(b"spec\0"));
    }

    #[test]
    fn server_hello_decodes_deflate_flag() {
        let body = GtvFlags::DEFLATE.bits().to_le_bytes();
        let hello = ServerHello::decode(&body).unwrap();
        assert!(hello.flags.contains(GtvFlags::DEFLATE));
    }

    #[test]
    fn frame_command_length_includes_opcode_byte() {
        let framed = frame_command(ClientOp::StringCmd, b"say hi");
        assert_eq!(u16::from_le_bytes([framed[0], framed[1]]), 7);
        assert_eq!(framed[2], ClientOp::StringCmd as u8);
    }
}
