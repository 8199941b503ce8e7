//! Error taxonomy and the `[name] =!= msg` / `[name] =X= msg` log line
//! format used for every drop and destroy.

use thiserror::Error;

/// Non-fatal: the Upstream closes its transport, enters `Disconnected`, and
/// schedules a reconnect with growing backoff.
#[derive(Debug, Error)]
pub enum DropReason {
    #[error("timed out after {seconds}s of silence")]
    Timeout { seconds: u64 },
    #[error("orderly close (zero-length record)")]
    OrderlyClose,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server requested reconnect")]
    ServerReconnect,
}

/// Fatal: the Upstream (and any Channel it owns but has not yet promoted)
/// is destroyed.
#[derive(Debug, Error)]
pub enum DestroyReason {
    #[error("bad magic preamble")]
    BadMagic,
    #[error("oversize message length {0}")]
    Oversize(usize),
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("unexpected transition: {0}")]
    UnexpectedTransition(String),
    #[error("duplicate hello")]
    DuplicateHello,
    #[error("read past end of message")]
    ReadPastEnd,
    #[error("delay buffer overflow while waiting")]
    OverflowWhileWaiting,
    #[error("server error: {0}")]
    ServerError(String),
    #[error("bad request")]
    BadRequest,
    #[error("no access")]
    NoAccess,
    #[error("server disconnect")]
    ServerDisconnect,
    #[error("send buffer overflow")]
    SendOverflow,
    #[error("deflate stream error: {0}")]
    Inflate(String),
    #[error("file I/O error: {0}")]
    FileIo(String),
}

/// Formats a drop line: `[name] =!= message`.
pub fn format_drop(name: &str, reason: &DropReason) -> String {
    format!("[{name}] =!= {reason}")
}

/// Formats a destroy line: `[name] =X= message`.
pub fn format_destroy(name: &str, reason: &DestroyReason) -> String {
    format!("[{name}] =X= {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_line_uses_drop_marker() {
        let line = format_drop("gtv1", &DropReason::OrderlyClose);
        assert_eq!(line, "[gtv1] =!= orderly close (zero-length record)");
    }

    #[test]
    fn destroy_line_uses_destroy_marker() {
        let line = format_destroy("gtv1", &DestroyReason::BadMagic);
        assert_eq!(line, "[gtv1] =X= bad magic preamble");
    }
}
