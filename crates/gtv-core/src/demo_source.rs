//! Alternative Channel driver reading the wire stream from a file playlist
//! instead of a network connection.
//!
//! Each playlist entry is a complete `MVD_MAGIC` + `(u16 len, payload)`
//! file, optionally gzip-wrapped. The first record of each file is always
//! fed to the downstream parser as the gamestate; subsequent records are
//! staged into the driving Channel's scratch buffer one at a time, mirroring
//! `Channel::read_frame`'s "exactly one packet per call" contract.

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    channel::Channel,
    fileio::DemoReader,
    parser::{GamestateParser, ParseOutcome},
    wire::MVD_MAGIC,
};

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("playlist is empty")]
    EmptyPlaylist,
    #[error("couldn't open {path}: {source}")]
    Open { path: PathBuf, #[source] source: std::io::Error },
    #[error("bad magic preamble in {path}")]
    BadMagic { path: PathBuf },
    #[error("truncated record in {path}: {source}")]
    Truncated { path: PathBuf, #[source] source: std::io::Error },
    #[error("gamestate rejected by parser in {path}")]
    GamestateRejected { path: PathBuf },
}

#[derive(Debug, PartialEq, Eq)]
pub enum DemoFrameOutcome {
    /// First record of a file was parsed as the gamestate.
    GamestateLoaded,
    /// One record was popped and handed to the parser.
    Parsed(ParseOutcome),
    /// End of the current file (or an explicit zero-length terminator);
    /// advanced to the next playlist entry. No record was parsed this call.
    AdvancedFile,
    /// Playlist exhausted and the loop counter reached zero: this
    /// `DemoSource` is finished and its owning Upstream should be destroyed.
    PlaylistExhausted,
}

pub struct DemoSource {
    paths: Vec<PathBuf>,
    index: usize,
    /// 0 = infinite; decrements on each wrap back to the playlist head.
    loop_remaining: u32,
    reader: Option<DemoReader>,
    gamestate_loaded: bool,
}

impl DemoSource {
    pub fn new(paths: Vec<PathBuf>, loop_count: u32) -> Result<Self, DemoError> {
        if paths.is_empty() {
            return Err(DemoError::EmptyPlaylist);
        }
        Ok(Self { paths, index: 0, loop_remaining: loop_count, reader: None, gamestate_loaded: false })
    }

    pub fn current_path(&self) -> &Path {
        &self.paths[self.index]
    }

    pub fn loop_remaining(&self) -> u32 {
        self.loop_remaining
    }

    fn open_current(&mut self) -> Result<(), DemoError> {
        let path = self.paths[self.index].clone();
        let mut reader = DemoReader::open_with_gzip_sniff(&path)
            .map_err(|source| DemoError::Open { path: path.clone(), source })?;
        let mut preamble = [0u8; 4];
        reader
            .read_exact(&mut preamble)
            .map_err(|source| DemoError::Truncated { path: path.clone(), source })?;
        if preamble != MVD_MAGIC {
            return Err(DemoError::BadMagic { path });
        }
        self.reader = Some(reader);
        self.gamestate_loaded = false;
        Ok(())
    }

    /// Advances the playlist by one entry, applying the loop-count rule:
    /// wrapping past the last entry decrements a positive loop counter, or
    /// restarts freely if it's 0 (infinite).
    /// Returns `false` once a positive counter reaches zero.
    fn advance_playlist(&mut self) -> bool {
        self.index += 1;
        self.reader = None;
        self.gamestate_loaded = false;
        if self.index < self.paths.len() {
            return true;
        }
        self.index = 0;
        if self.loop_remaining == 0 {
            return true;
        }
        self.loop_remaining -= 1;
        self.loop_remaining > 0
    }

    /// Reads one record and advances `channel`/`parser` by at most one step,
    /// mirroring `Channel::read_frame`'s single-packet-per-call contract.
    pub fn read_frame(
        &mut self,
        channel: &mut Channel,
        parser: &mut impl GamestateParser,
    ) -> Result<DemoFrameOutcome, DemoError> {
        if self.reader.is_none() {
            self.open_current()?;
        }

        if !self.gamestate_loaded {
            let path = self.current_path().to_path_buf();
            let record = read_record(self.reader.as_mut().expect("just opened"))
                .map_err(|source| DemoError::Truncated { path: path.clone(), source })?;
            let Some(payload) = record else {
                return Err(DemoError::Truncated {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "file ended before a gamestate record",
                    ),
                });
            };
            channel.load_scratch(&payload);
            if parser.parse_message(channel) != ParseOutcome::GamestateReady {
                return Err(DemoError::GamestateRejected { path });
            }
            self.gamestate_loaded = true;
            return Ok(DemoFrameOutcome::GamestateLoaded);
        }

        let path = self.current_path().to_path_buf();
        let record = read_record(self.reader.as_mut().expect("opened above"))
            .map_err(|source| DemoError::Truncated { path, source })?;

        let is_boundary = match &record {
            None => true,
            Some(payload) => payload.is_empty(),
        };

        if is_boundary {
            return if self.advance_playlist() {
                Ok(DemoFrameOutcome::AdvancedFile)
            } else {
                Ok(DemoFrameOutcome::PlaylistExhausted)
            };
        }

        let payload = record.expect("boundary case handled above");
        channel.load_scratch(&payload);
        let outcome = parser.parse_message(channel);
        Ok(DemoFrameOutcome::Parsed(outcome))
    }
}

/// Reads one `(u16 length LE, payload)` record. `Ok(None)` means a clean
/// end-of-file exactly at a record boundary (no terminator was written);
/// treated the same as an explicit zero-length terminator by the caller.
fn read_record(reader: &mut impl Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    let mut filled = 0;
    while filled < 2 {
        match reader.read(&mut len_buf[filled..])? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated record length header",
                ));
            }
            n => filled += n,
        }
    }
    let len = u16::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(Some(Vec::new()));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use gtv_utils::ArrayStr;
    use tempfile::tempdir;

    use super::*;
    use crate::{fileio::DemoWriter, parser::AcceptingParser};

    fn write_demo_file(path: &Path, records: &[&[u8]]) {
        let mut w = DemoWriter::create(path, false).unwrap();
        w.write_all(&MVD_MAGIC).unwrap();
        for r in records {
            w.write_all(&(r.len() as u16).to_le_bytes()).unwrap();
            w.write_all(r).unwrap();
        }
        w.write_all(&0u16.to_le_bytes()).unwrap();
    }

    fn channel() -> Channel {
        Channel::new(1, ArrayStr::from_str_truncate("demo"), 1, 3, 20, 35)
    }

    #[test]
    fn plays_gamestate_then_frames_then_terminates_without_loop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.mvd2");
        write_demo_file(&path, &[b"gamestate", b"frame-one", b"frame-two"]);

        let mut source = DemoSource::new(vec![path], 1).unwrap();
        let mut channel = channel();
        let mut parser = AcceptingParser::default();

        assert_eq!(
            source.read_frame(&mut channel, &mut parser).unwrap(),
            DemoFrameOutcome::GamestateLoaded
        );
        assert!(matches!(
            source.read_frame(&mut channel, &mut parser).unwrap(),
            DemoFrameOutcome::Parsed(_)
        ));
        assert!(matches!(
            source.read_frame(&mut channel, &mut parser).unwrap(),
            DemoFrameOutcome::Parsed(_)
        ));
        // Terminator record: advances past the single playlist entry with
        // loop_count=1, which decrements to 0 and ends playback.
        assert_eq!(
            source.read_frame(&mut channel, &mut parser).unwrap(),
            DemoFrameOutcome::PlaylistExhausted
        );
    }

    #[test]
    fn bad_magic_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.mvd2");
        std::fs::write(&path, b"NOPE-not-a-demo-file").unwrap();

        let mut source = DemoSource::new(vec![path], 1).unwrap();
        let mut channel = channel();
        let mut parser = AcceptingParser::default();
        assert!(matches!(
            source.read_frame(&mut channel, &mut parser),
            Err(DemoError::BadMagic { .. })
        ));
    }

    #[test]
    fn infinite_loop_replays_from_head() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loop.mvd2");
        write_demo_file(&path, &[b"gamestate"]);

        let mut source = DemoSource::new(vec![path], 0).unwrap();
        let mut channel = channel();
        let mut parser = AcceptingParser::default();

        assert_eq!(
            source.read_frame(&mut channel, &mut parser).unwrap(),
            DemoFrameOutcome::GamestateLoaded
        );
        // Terminator -> wraps back to index 0 since loop_count is infinite.
        assert_eq!(
            source.read_frame(&mut channel, &mut parser).unwrap(),
            DemoFrameOutcome::AdvancedFile
        );
        assert_eq!(source.loop_remaining(), 0);
        assert_eq!(
            source.read_frame(&mut channel, &mut parser).unwrap(),
            DemoFrameOutcome::GamestateLoaded
        );
    }
}
