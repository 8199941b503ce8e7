//! A single replay stream's delay buffer.

use std::fmt;

use gtv_utils::{ArrayStr, RingBuffer};

use crate::{
    fileio::DemoWriter,
    parser::{GamestateParser, ParseOutcome},
    spectator::SpectatorId,
    wire::MAX_MSGLEN,
};

/// Mirrors the original `mvd_states` string table (`DEAD`, `WAIT`, `READ`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Dead,
    Waiting,
    Reading,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dead => "DEAD",
            Self::Waiting => "WAIT",
            Self::Reading => "READ",
        };
        f.write_str(s)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DepositOutcome {
    Written,
    /// Cleared, transitioned to Waiting, STREAM_STOP owed to the server.
    Overflow,
    /// Overflow while already Waiting: configuration error, fatal.
    FatalOverflow,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadFrameOutcome {
    Dead,
    /// Still Waiting; neither threshold met yet.
    StillWaiting,
    /// Waiting -> Reading just happened; no packet popped this call.
    Promoted,
    /// Reading but the buffer ran dry; entered Waiting (underflow).
    Underflow,
    /// One packet popped and handed to the parser.
    Parsed(ParseOutcome),
}

pub struct Channel {
    pub id: u32,
    pub name: ArrayStr<32>,
    pub state: ChannelState,
    delay: RingBuffer,
    num_packets: u32,
    min_packets: u32,
    underflows: u32,
    overflows: u32,
    wait_delay_tenths: u32,
    wait_percent: u32,
    scratch: Vec<u8>,
    /// Nullable weak back-reference to the owning Upstream, by id: a lookup
    /// key, not a strong reference, to avoid a cycle.
    upstream_id: Option<u32>,
    recording: Option<DemoWriter>,
    spectators: Vec<SpectatorId>,
    /// Set by the downstream host after the first successful gamestate
    /// parse. Governs whether destroying the owning Upstream also frees
    /// this Channel.
    promoted: bool,
}

impl Channel {
    pub fn new(
        id: u32,
        name: ArrayStr<32>,
        upstream_id: u32,
        buffer_size_units: u32,
        wait_delay_tenths: u32,
        wait_percent: u32,
    ) -> Self {
        let capacity = buffer_size_units.clamp(2, 10) as usize * MAX_MSGLEN;
        Self {
            id,
            name,
            state: ChannelState::Waiting,
            delay: RingBuffer::new(capacity),
            num_packets: 0,
            min_packets: wait_delay_tenths * 10,
            underflows: 0,
            overflows: 0,
            wait_delay_tenths,
            wait_percent,
            scratch: Vec::with_capacity(MAX_MSGLEN),
            upstream_id: Some(upstream_id),
            recording: None,
            spectators: Vec::new(),
            promoted: false,
        }
    }

    pub fn num_packets(&self) -> u32 {
        self.num_packets
    }

    pub fn min_packets(&self) -> u32 {
        self.min_packets
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted
    }

    /// Adds this Channel to the Registry's promoted set; from this point
    /// destroying its owning Upstream no longer frees it.
    pub fn promote(&mut self) {
        self.promoted = true;
    }

    /// Stages a decoded record directly into the parser's scratch buffer,
    /// bypassing the delay ring buffer entirely. Used by [`crate::demo_source::DemoSource`],
    /// which reads records straight off disk one at a time rather than
    /// through a producer/consumer delay buffer.
    pub fn load_scratch(&mut self, payload: &[u8]) {
        self.scratch.clear();
        self.scratch.extend_from_slice(payload);
    }

    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    pub fn underflows(&self) -> u32 {
        self.underflows
    }

    pub fn upstream_id(&self) -> Option<u32> {
        self.upstream_id
    }

    /// Called when the owning Upstream is destroyed before promotion, or
    /// after promotion to null the back-edge.
    pub fn unlink_upstream(&mut self) {
        self.upstream_id = None;
    }

    pub fn scratch(&self) -> &[u8] {
        &self.scratch
    }

    /// Called by the downstream parser on successful gamestate parse.
    pub fn mark_reading(&mut self) {
        self.state = ChannelState::Reading;
    }

    fn fill_percent(&self) -> u32 {
        if self.delay.capacity() == 0 {
            return 0;
        }
        ((self.delay.len() as u64 * 100) / self.delay.capacity() as u64) as u32
    }

    fn wait_stop_ready(&self) -> bool {
        self.num_packets >= self.min_packets || self.fill_percent() >= self.wait_percent
    }

    /// Appends one `(u16 len, payload)` record from a non-empty STREAM_DATA
    /// body. All-or-nothing with respect to `num_packets`.
    #[must_use]
    pub fn deposit_packet(&mut self, payload: &[u8]) -> DepositOutcome {
        let mut record = Vec::with_capacity(2 + payload.len());
        record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        record.extend_from_slice(payload);

        if self.delay.write(&record) {
            self.num_packets += 1;
            return DepositOutcome::Written;
        }

        if self.state == ChannelState::Waiting {
            return DepositOutcome::FatalOverflow;
        }

        self.delay.clear();
        self.num_packets = 0;
        self.state = ChannelState::Waiting;
        self.overflows += 1;
        DepositOutcome::Overflow
    }

    /// Advances by at most one packet. Mirrors the original `gtv_wait_stop`/
    /// `gtv_wait_start` pair.
    pub fn read_frame(&mut self, parser: &mut impl GamestateParser) -> ReadFrameOutcome {
        match self.state {
            ChannelState::Dead => ReadFrameOutcome::Dead,

            ChannelState::Waiting => {
                if self.wait_stop_ready() {
                    self.state = ChannelState::Reading;
                    ReadFrameOutcome::Promoted
                } else {
                    ReadFrameOutcome::StillWaiting
                }
            }

            ChannelState::Reading => {
                if self.num_packets == 0 {
                    self.enter_waiting_from_reading();
                    ReadFrameOutcome::Underflow
                } else {
                    self.pop_into_scratch();
                    self.num_packets -= 1;
                    let outcome = parser.parse_message(self);
                    ReadFrameOutcome::Parsed(outcome)
                }
            }
        }
    }

    /// Underflow recovery: grows `min_packets`, bumps `underflows`.
    fn enter_waiting_from_reading(&mut self) {
        self.min_packets = (50 + 5 * self.underflows).min(self.wait_delay_tenths * 10);
        self.underflows += 1;
        self.state = ChannelState::Waiting;
    }

    /// Normal entry to Waiting when the owning Upstream resumes streaming:
    /// resets `min_packets` and the underflow counter.
    pub fn enter_waiting_from_resuming(&mut self) {
        self.min_packets = self.wait_delay_tenths * 10;
        self.underflows = 0;
        self.state = ChannelState::Waiting;
    }

    fn pop_into_scratch(&mut self) {
        let header = self.delay.peek(2).expect("Reading state guarantees a record header");
        let len = u16::from_le_bytes([header[0], header[1]]) as usize;
        let record = self.delay.peek(2 + len).expect("num_packets invariant guarantees full record");
        self.scratch.clear();
        self.scratch.extend_from_slice(&record[2..2 + len]);
        self.delay.commit(2 + len);
    }

    /// Manual pause/resume for a demo channel: toggles Waiting/Reading
    /// without touching the buffer.
    pub fn toggle_pause(&mut self) {
        self.state = match self.state {
            ChannelState::Reading => ChannelState::Waiting,
            ChannelState::Waiting => ChannelState::Reading,
            ChannelState::Dead => ChannelState::Dead,
        };
    }

    pub fn start_recording(&mut self, mut writer: DemoWriter, gamestate: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        writer.write_all(&crate::wire::MVD_MAGIC)?;
        writer.write_all(&(gamestate.len() as u16).to_le_bytes())?;
        writer.write_all(gamestate)?;
        self.recording = Some(writer);
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Passes an incoming body through to the recording file, if any.
    pub fn record_incoming(&mut self, body: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        if let Some(writer) = &mut self.recording {
            writer.write_all(&(body.len() as u16).to_le_bytes())?;
            writer.write_all(body)?;
        }
        Ok(())
    }

    pub fn stop_recording(&mut self) -> std::io::Result<()> {
        use std::io::Write;
        if let Some(mut writer) = self.recording.take() {
            writer.write_all(&0u16.to_le_bytes())?;
            writer.flush()?;
        }
        Ok(())
    }

    pub fn attach_spectator(&mut self, spectator: SpectatorId) {
        self.spectators.push(spectator);
    }

    pub fn detach_spectator(&mut self, spectator: SpectatorId) {
        self.spectators.retain(|&s| s != spectator);
    }

    pub fn spectators(&self) -> &[SpectatorId] {
        &self.spectators
    }

    pub fn kill(&mut self) {
        self.state = ChannelState::Dead;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::AcceptingParser;

    fn channel() -> Channel {
        Channel::new(1, ArrayStr::from_str_truncate("test"), 1, 3, 20, 35)
    }

    #[test]
    fn deposit_then_read_round_trips_payload() {
        let mut ch = channel();
        ch.state = ChannelState::Reading;
        assert_eq!(ch.deposit_packet(b"hello"), DepositOutcome::Written);
        assert_eq!(ch.num_packets(), 1);

        let mut parser = AcceptingParser::default();
        let outcome = ch.read_frame(&mut parser);
        assert!(matches!(outcome, ReadFrameOutcome::Parsed(_)));
        assert_eq!(ch.scratch(), b"hello");
        assert_eq!(ch.num_packets(), 0);
    }

    #[test]
    fn reading_with_no_packets_enters_waiting() {
        let mut ch = channel();
        ch.state = ChannelState::Reading;
        let mut parser = AcceptingParser::default();
        assert_eq!(ch.read_frame(&mut parser), ReadFrameOutcome::Underflow);
        assert_eq!(ch.state, ChannelState::Waiting);
        assert_eq!(ch.underflows(), 1);
    }

    #[test]
    fn waiting_promotes_once_min_packets_reached() {
        let mut ch = channel();
        ch.min_packets = 2;
        ch.state = ChannelState::Waiting;
        assert_eq!(ch.deposit_packet(b"a"), DepositOutcome::Written);

        let mut parser = AcceptingParser::default();
        assert_eq!(ch.read_frame(&mut parser), ReadFrameOutcome::StillWaiting);

        assert_eq!(ch.deposit_packet(b"b"), DepositOutcome::Written);
        assert_eq!(ch.read_frame(&mut parser), ReadFrameOutcome::Promoted);
        assert_eq!(ch.state, ChannelState::Reading);
    }

    #[test]
    fn overflow_while_reading_clears_and_waits() {
        let mut ch = Channel::new(1, ArrayStr::from_str_truncate("tiny"), 1, 2, 20, 35);
        ch.state = ChannelState::Reading;
        let big = vec![0u8; MAX_MSGLEN];
        // Fill close to capacity, then overflow.
        loop {
            if ch.deposit_packet(&big) == DepositOutcome::Overflow {
                break;
            }
        }
        assert_eq!(ch.state, ChannelState::Waiting);
        assert_eq!(ch.num_packets(), 0);
        assert_eq!(ch.overflows(), 1);
    }

    #[test]
    fn overflow_while_waiting_is_fatal() {
        let mut ch = Channel::new(1, ArrayStr::from_str_truncate("tiny"), 1, 2, 20, 35);
        ch.state = ChannelState::Waiting;
        let big = vec![0u8; MAX_MSGLEN];
        loop {
            match ch.deposit_packet(&big) {
                DepositOutcome::Written => continue,
                DepositOutcome::FatalOverflow => break,
                DepositOutcome::Overflow => panic!("should escalate to fatal once already Waiting"),
            }
        }
    }

    #[test]
    fn toggle_pause_does_not_touch_buffer() {
        let mut ch = channel();
        ch.state = ChannelState::Reading;
        ch.deposit_packet(b"x");
        ch.toggle_pause();
        assert_eq!(ch.state, ChannelState::Waiting);
        assert_eq!(ch.num_packets(), 1);
        ch.toggle_pause();
        assert_eq!(ch.state, ChannelState::Reading);
    }
}
