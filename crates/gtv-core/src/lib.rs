//! Client core for a single multi-view demo/game-television session: the
//! Upstream/Channel/Registry state machines and their supporting wire,
//! framing, and file-I/O layers.

pub mod channel;
pub mod config;
pub mod demo_source;
pub mod error;
pub mod fileio;
pub mod framer;
pub mod inflate;
pub mod parser;
pub mod registry;
pub mod spectator;
pub mod upstream;
pub mod wire;

pub use channel::Channel;
pub use config::Config;
pub use registry::Registry;
pub use upstream::Upstream;
