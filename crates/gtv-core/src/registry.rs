//! Process-wide owner of the Upstream and Channel collections, and the
//! frame-tick dispatcher.
//!
//! Channels are allocated eagerly, at the same id as their creating
//! Upstream, rather than lazily once a gamestate parses: the only thing
//! "promotion" changes here is whether destroying the Upstream also frees
//! the Channel (see DESIGN.md). This sidesteps an owned-pointer-until-
//! promoted cycle without unsafe code or reference counting.

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf};

use gtv_timing::{Duration, Instant};
use gtv_utils::ArrayStr;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    channel::{Channel, ReadFrameOutcome},
    config::Config,
    demo_source::{DemoError, DemoSource},
    error::{self, DropReason},
    fileio::DemoWriter,
    parser::{GamestateParser, ParseOutcome},
    spectator::SpectatorSink,
    upstream::{TickOutcome, Upstream, UpstreamState},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no such upstream or channel: {0}")]
    NotFound(String),
    #[error(transparent)]
    Transport(#[from] gtv_network::TransportError),
    #[error(transparent)]
    Demo(#[from] DemoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The address and ring capacities a network Upstream was created with,
/// kept around so a `Disconnected` Upstream can be reopened once its
/// backoff elapses without the caller having to remember them.
struct ReconnectInfo {
    addr: SocketAddr,
    recv_capacity: usize,
    send_capacity: usize,
}

pub struct Registry {
    upstreams: BTreeMap<u32, Upstream>,
    channels: BTreeMap<u32, Channel>,
    reconnect_info: BTreeMap<u32, ReconnectInfo>,
    next_id: u32,
    config: Config,
    attached_clients: u32,
    last_demand_at: Instant,
    recording_channel: Option<u32>,
    local_viewer_channel: Option<u32>,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self {
            upstreams: BTreeMap::new(),
            channels: BTreeMap::new(),
            reconnect_info: BTreeMap::new(),
            next_id: 1,
            config,
            attached_clients: 0,
            last_demand_at: Instant::now(),
            recording_channel: None,
            local_viewer_channel: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn new_channel(&self, id: u32, name: &str) -> Channel {
        Channel::new(
            id,
            ArrayStr::from_str_truncate(name),
            id,
            self.config.buffer_size_clamped(),
            self.config.wait_delay_tenths,
            self.config.wait_percent,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &mut self,
        mio_registry: &mio::Registry,
        addr: SocketAddr,
        name: &str,
        username: Option<String>,
        password: Option<String>,
        recv_capacity: usize,
        send_capacity: usize,
    ) -> Result<u32, RegistryError> {
        let id = self.alloc_id();
        let username = username.or_else(|| self.config.username.clone());
        let password = password.or_else(|| self.config.password.clone());
        let upstream = Upstream::connect_network(
            mio_registry,
            id,
            ArrayStr::from_str_truncate(name),
            addr,
            username,
            password,
            recv_capacity,
            send_capacity,
            self.config.shownet_enabled(),
        )?;
        let channel = self.new_channel(id, name);
        self.upstreams.insert(id, upstream);
        self.channels.insert(id, channel);
        self.reconnect_info.insert(id, ReconnectInfo { addr, recv_capacity, send_capacity });
        self.local_viewer_channel = Some(id);
        info!(id, name, %addr, "connect: upstream created");
        Ok(id)
    }

    pub fn play(&mut self, paths: Vec<PathBuf>, name: &str, loop_count: u32) -> Result<u32, RegistryError> {
        let id = self.alloc_id();
        let source = DemoSource::new(paths, loop_count)?;
        let upstream = Upstream::from_demo_source(id, ArrayStr::from_str_truncate(name), source);
        let channel = self.new_channel(id, name);
        self.upstreams.insert(id, upstream);
        self.channels.insert(id, channel);
        self.local_viewer_channel = Some(id);
        info!(id, name, loop_count, "play: demo upstream created");
        Ok(id)
    }

    /// Resolves a CLI token to an id: the literal `@@` local-viewer token, a
    /// numeric id, or a unique-by-convention name.
    fn resolve(&self, token: &str) -> Option<u32> {
        if token == "@@" {
            return self.local_viewer_channel;
        }
        if let Ok(id) = token.parse::<u32>() {
            if self.channels.contains_key(&id) || self.upstreams.contains_key(&id) {
                return Some(id);
            }
        }
        self.upstreams
            .iter()
            .find(|(_, u)| u.name.as_str() == token)
            .map(|(&id, _)| id)
            .or_else(|| self.channels.iter().find(|(_, c)| c.name.as_str() == token).map(|(&id, _)| id))
    }

    /// Immediately destroys the named Upstream; destruction is synchronous.
    /// A Channel it owns but hasn't promoted is freed with it.
    pub fn disconnect(&mut self, mio_registry: &mio::Registry, token: &str) -> Result<(), RegistryError> {
        let id = self.resolve(token).ok_or_else(|| RegistryError::NotFound(token.into()))?;
        self.destroy_upstream(mio_registry, id);
        Ok(())
    }

    fn destroy_upstream(&mut self, mio_registry: &mio::Registry, id: u32) {
        if let Some(mut upstream) = self.upstreams.remove(&id) {
            upstream.handle_drop(mio_registry, &DropReason::OrderlyClose, Instant::now());
        }
        self.reconnect_info.remove(&id);
        let freed = self.channels.get(&id).is_some_and(|c| !c.is_promoted());
        if freed {
            self.channels.remove(&id);
            if self.recording_channel == Some(id) {
                self.recording_channel = None;
            }
            if self.local_viewer_channel == Some(id) {
                self.local_viewer_channel = None;
            }
        } else if let Some(channel) = self.channels.get_mut(&id) {
            channel.unlink_upstream();
        }
    }

    pub fn kill(&mut self, token: &str) -> Result<(), RegistryError> {
        let id = self.resolve(token).ok_or_else(|| RegistryError::NotFound(token.into()))?;
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.kill();
        }
        Ok(())
    }

    /// Demo channels only: toggles Waiting/Reading without touching the
    /// buffer.
    pub fn pause(&mut self, token: &str) -> Result<(), RegistryError> {
        let id = self.resolve(token).ok_or_else(|| RegistryError::NotFound(token.into()))?;
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.toggle_pause();
        }
        Ok(())
    }

    /// Renames the Upstream/Channel pair. `--loop` is a documented no-op:
    /// the original wires it up but leaves it commented out at application
    /// time.
    pub fn control(&mut self, token: &str, new_name: Option<&str>, _loop_count: Option<u32>) -> Result<(), RegistryError> {
        let id = self.resolve(token).ok_or_else(|| RegistryError::NotFound(token.into()))?;
        if let Some(name) = new_name {
            let bounded = ArrayStr::from_str_truncate(name);
            if let Some(channel) = self.channels.get_mut(&id) {
                channel.name = bounded;
            }
            if let Some(upstream) = self.upstreams.get_mut(&id) {
                upstream.name = bounded;
            }
        }
        Ok(())
    }

    pub fn record(
        &mut self,
        token: &str,
        path: &std::path::Path,
        gzip: bool,
        gamestate: &[u8],
    ) -> Result<(), RegistryError> {
        let id = self.resolve(token).ok_or_else(|| RegistryError::NotFound(token.into()))?;
        let writer = DemoWriter::create(path, gzip)?;
        let channel = self.channels.get_mut(&id).ok_or_else(|| RegistryError::NotFound(token.into()))?;
        channel.start_recording(writer, gamestate)?;
        self.recording_channel = Some(id);
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<(), RegistryError> {
        if let Some(id) = self.recording_channel.take() {
            if let Some(channel) = self.channels.get_mut(&id) {
                channel.stop_recording()?;
            }
        }
        Ok(())
    }

    pub fn channels(&self) -> impl Iterator<Item = (&u32, &Channel)> {
        self.channels.iter()
    }

    pub fn servers(&self) -> impl Iterator<Item = (&u32, &Upstream)> {
        self.upstreams.iter()
    }

    /// Records fresh attached-client demand; feeds `active`'s idle timer.
    pub fn note_attached_clients(&mut self, count: u32, now: Instant) {
        self.attached_clients = count;
        if count > 0 {
            self.last_demand_at = now;
        }
    }

    /// The process-wide `mvd_active` flag: true while clients are attached,
    /// or until `mvd_suspend_time` minutes have passed since the last time
    /// any were.
    pub fn active(&self, now: Instant) -> bool {
        if self.attached_clients > 0 {
            return true;
        }
        now.saturating_sub(self.last_demand_at) < Duration::from_mins(self.config.suspend_time_mins)
    }

    /// One frame tick: advances every Upstream, applies its [`TickOutcome`],
    /// then advances every non-demo Channel by at most one packet.
    /// Demo-backed channels are advanced by their Upstream's own
    /// `run_demo`, not here, since they have no delay buffer to drain.
    pub fn tick(
        &mut self,
        mio_registry: &mio::Registry,
        parser: &mut impl GamestateParser,
        spectators: &mut impl SpectatorSink,
        now: Instant,
    ) {
        let active = self.active(now);
        let ids: Vec<u32> = self.upstreams.keys().copied().collect();
        for id in ids {
            self.tick_upstream(mio_registry, id, parser, spectators, active, now);
        }

        let channel_ids: Vec<u32> = self.channels.keys().copied().collect();
        for id in channel_ids {
            let is_demo_backed = self.upstreams.get(&id).is_some_and(Upstream::is_demo);
            if !is_demo_backed {
                self.tick_channel(mio_registry, id, parser, now);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn tick_upstream(
        &mut self,
        mio_registry: &mio::Registry,
        id: u32,
        parser: &mut impl GamestateParser,
        spectators: &mut impl SpectatorSink,
        active: bool,
        now: Instant,
    ) {
        let Some(u) = self.upstreams.get(&id) else { return };
        let disconnected = !u.is_demo() && u.state == UpstreamState::Disconnected;
        if disconnected && !u.reconnect_due(now) {
            return;
        }

        if disconnected && !self.reopen_upstream(mio_registry, id) {
            return;
        }

        let config = self.config.clone();
        let outcome = {
            let Some(upstream) = self.upstreams.get_mut(&id) else { return };
            let Some(channel) = self.channels.get_mut(&id) else { return };
            upstream.run(mio_registry, channel, parser, spectators, active, now, &config)
        };

        match outcome {
            TickOutcome::Ok => {}
            TickOutcome::Drop(reason) => {
                if let Some(upstream) = self.upstreams.get_mut(&id) {
                    upstream.handle_drop(mio_registry, &reason, now);
                }
            }
            TickOutcome::Destroy(reason) => {
                let name = self.upstreams.get(&id).map_or_else(String::new, |u| u.name.as_str().to_string());
                warn!("{}", error::format_destroy(&name, &reason));
                self.destroy_upstream(mio_registry, id);
            }
        }
    }

    /// Reopens a `Disconnected` network Upstream's transport once its
    /// backoff has elapsed, using the addr/capacities recorded at
    /// `connect` time. Returns whether the Upstream is now `Connecting`;
    /// on failure it is left `Disconnected` with its backoff grown again,
    /// and the caller should skip running it for this tick.
    fn reopen_upstream(&mut self, mio_registry: &mio::Registry, id: u32) -> bool {
        let Some(info) = self.reconnect_info.get(&id) else { return false };
        let (addr, recv_capacity, send_capacity) = (info.addr, info.recv_capacity, info.send_capacity);
        let Some(upstream) = self.upstreams.get_mut(&id) else { return false };
        match upstream.reopen(mio_registry, addr, recv_capacity, send_capacity) {
            Ok(()) => true,
            Err(err) => {
                upstream.handle_drop(mio_registry, &DropReason::Transport(err.to_string()), Instant::now());
                false
            }
        }
    }

    fn tick_channel(
        &mut self,
        mio_registry: &mio::Registry,
        id: u32,
        parser: &mut impl GamestateParser,
        now: Instant,
    ) {
        let Some(channel) = self.channels.get_mut(&id) else { return };
        match channel.read_frame(parser) {
            ReadFrameOutcome::Parsed(ParseOutcome::GamestateReady) => channel.promote(),
            ReadFrameOutcome::Underflow => {
                if let Some(upstream_id) = channel.upstream_id() {
                    if let Some(upstream) = self.upstreams.get_mut(&upstream_id) {
                        upstream.ping(mio_registry, now);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn format_servers(&self) -> Vec<String> {
        self.upstreams
            .iter()
            .map(|(id, u)| format!("{id:>4} {:<16} {:<12} {}", u.name.as_str(), u.state.to_string(), u.address.as_str()))
            .collect()
    }

    pub fn format_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|(id, c)| {
                format!(
                    "{id:>4} {:<16} {:<4} pkts={} underflows={} overflows={}",
                    c.name.as_str(),
                    c.state.to_string(),
                    c.num_packets(),
                    c.underflows(),
                    c.overflows()
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_stays_true_within_suspend_window_after_last_demand() {
        let mut registry = Registry::new(Config { suspend_time_mins: 1, ..Config::default() });
        let t0 = Instant::now();
        registry.note_attached_clients(1, t0);
        registry.note_attached_clients(0, t0);
        assert!(registry.active(t0));
        assert!(registry.active(t0 + Duration::from_secs(30)));
        assert!(!registry.active(t0 + Duration::from_mins(2)));
    }

    #[test]
    fn resolve_prefers_id_then_name_then_at_at_token() {
        let registry = Registry::new(Config::default());
        assert_eq!(registry.resolve("@@"), None);
        assert_eq!(registry.resolve("not-a-number-or-name"), None);
    }

    #[test]
    fn kill_and_disconnect_report_not_found_for_unknown_token() {
        let mut registry = Registry::new(Config::default());
        assert!(registry.kill("nope").is_err());
    }
}
