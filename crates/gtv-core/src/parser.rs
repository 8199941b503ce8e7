//! Stand-in for the external downstream game-state parser: out of scope
//! for this core, named here only as the interface it exposes.

use crate::channel::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Gamestate parsed successfully; the caller should set
    /// `channel.state = Reading`.
    GamestateReady,
    /// An ordinary non-gamestate message; no state transition.
    Continue,
}

/// A `ParseMessage(channel)` collaborator. The core calls this exactly once
/// per successfully framed message, handing it a pre-positioned scratch
/// buffer via `channel.scratch()`.
pub trait GamestateParser {
    fn parse_message(&mut self, channel: &mut Channel) -> ParseOutcome;
}

/// A parser that accepts every message as a valid gamestate on first call.
/// Useful for tests and as a minimal default when no real entity/config-
/// string simulation is wired in.
#[derive(Debug, Default)]
pub struct AcceptingParser {
    seen_gamestate: bool,
}

impl GamestateParser for AcceptingParser {
    fn parse_message(&mut self, channel: &mut Channel) -> ParseOutcome {
        if self.seen_gamestate {
            return ParseOutcome::Continue;
        }
        self.seen_gamestate = true;
        channel.mark_reading();
        ParseOutcome::GamestateReady
    }
}
